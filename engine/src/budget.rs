//! Step and retry budget for running sub-tasks.
//!
//! The driver of a sub-task feeds the budget every step count it observes
//! and every retry it is about to issue. Once the budget is exhausted the
//! error is handed to [`StreamingResult::fail`](crate::StreamingResult::fail),
//! which completes the parent lifecycle.

use toolcall_config::SubtaskLimits;
use toolcall_types::Task;

use crate::state::StreamingResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum BudgetExceeded {
    #[error("The sub-task failed to complete, max step count reached.")]
    MaxSteps,
    #[error("The sub-task failed to complete, max retry count reached.")]
    MaxRetries,
}

#[derive(Debug, Clone)]
pub struct SubtaskBudget {
    limits: SubtaskLimits,
    steps: usize,
    retries: u32,
}

impl SubtaskBudget {
    #[must_use]
    pub fn new(limits: SubtaskLimits) -> Self {
        Self {
            limits,
            steps: 0,
            retries: 0,
        }
    }

    #[must_use]
    pub fn steps(&self) -> usize {
        self.steps
    }

    #[must_use]
    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// Record the sub-task's current step count.
    ///
    /// A new step resets the retry counter.
    pub fn observe_steps(&mut self, step_count: usize) -> Result<(), BudgetExceeded> {
        if step_count > self.steps {
            self.steps = step_count;
            self.retries = 0;
        }
        if self.steps > self.limits.max_steps as usize {
            return Err(BudgetExceeded::MaxSteps);
        }
        Ok(())
    }

    pub fn observe_task(&mut self, task: &Task) -> Result<(), BudgetExceeded> {
        self.observe_steps(task.step_count())
    }

    /// Count a retry of the current step. The limit is checked before the
    /// retry is counted, so `max_retries + 1` retries still go through.
    pub fn record_retry(&mut self) -> Result<(), BudgetExceeded> {
        let exhausted = self.retries > self.limits.max_retries;
        self.retries += 1;
        if exhausted {
            return Err(BudgetExceeded::MaxRetries);
        }
        Ok(())
    }

    /// Fail the running sub-task when `outcome` is an exhausted budget.
    ///
    /// Returns `false` if the sub-task was failed.
    pub fn enforce(outcome: Result<(), BudgetExceeded>, streaming: &StreamingResult) -> bool {
        match outcome {
            Ok(()) => true,
            Err(exceeded) => {
                tracing::debug!("{exceeded}");
                streaming.fail(exceeded.to_string());
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn budget(max_steps: u32, max_retries: u32) -> SubtaskBudget {
        SubtaskBudget::new(SubtaskLimits {
            max_steps,
            max_retries,
        })
    }

    #[test]
    fn steps_up_to_the_limit_are_allowed() {
        let mut budget = budget(3, 2);
        assert_eq!(budget.observe_steps(3), Ok(()));
        assert_eq!(budget.observe_steps(4), Err(BudgetExceeded::MaxSteps));
    }

    #[test]
    fn step_count_never_goes_backwards() {
        let mut budget = budget(3, 2);
        budget.observe_steps(2).unwrap();
        budget.observe_steps(1).unwrap();
        assert_eq!(budget.steps(), 2);
    }

    #[test]
    fn retries_fail_once_past_the_limit() {
        let mut budget = budget(24, 2);
        assert_eq!(budget.record_retry(), Ok(()));
        assert_eq!(budget.record_retry(), Ok(()));
        assert_eq!(budget.record_retry(), Ok(()));
        assert_eq!(budget.record_retry(), Err(BudgetExceeded::MaxRetries));
    }

    #[test]
    fn new_step_resets_retries() {
        let mut budget = budget(24, 0);
        budget.record_retry().unwrap();
        assert_eq!(budget.retries(), 1);

        budget.observe_steps(1).unwrap();

        assert_eq!(budget.retries(), 0);
        assert_eq!(budget.record_retry(), Ok(()));
    }

    #[test]
    fn messages_match_reported_failures() {
        assert_eq!(
            BudgetExceeded::MaxSteps.to_string(),
            "The sub-task failed to complete, max step count reached."
        );
        assert_eq!(
            BudgetExceeded::MaxRetries.to_string(),
            "The sub-task failed to complete, max retry count reached."
        );
    }
}
