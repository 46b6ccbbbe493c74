//! Stream adapters for executions that outlive the execute call.
//!
//! The command tool hands back live output; the sub-task tool hands back the
//! id of a task that keeps running in the task store. Each adapter moves the
//! lifecycle from `execute` to `execute:streaming` and owns the final
//! transition to `complete`.

use serde_json::json;
use tokio::sync::mpsc;

use toolcall_types::{
    CommandOutput, CompleteReason, Completion, LifecycleStatus, Task, TaskStatus, error_result,
};

use crate::backend::{LiveOutputHandle, TaskStore};
use crate::cancel::CancelToken;
use crate::lifecycle::{ToolCallLifecycle, USER_ABORT_MESSAGE};
use crate::state::{DetachHandle, FailHandle, LifecycleState, StreamingResult};

/// Error folded into the result when live output stops before completing.
pub const OUTPUT_CLOSED_MESSAGE: &str = "The command output stream closed before completion.";
/// Error used when a completed sub-task left no final answer.
pub const NO_FINAL_ANSWER_MESSAGE: &str = "The sub-task completed without a final answer.";
/// Error used when a failed sub-task carries no error of its own.
pub const SUBTASK_FAILED_MESSAGE: &str = "The sub-task failed.";
/// Error used when the task store stops tracking a running sub-task.
pub const SUBTASK_LOST_MESSAGE: &str = "The sub-task is no longer tracked.";

// ============================================================================
// Command output
// ============================================================================

pub(crate) fn run_command(
    lifecycle: ToolCallLifecycle,
    handle: LiveOutputHandle,
    cancel: CancelToken,
) {
    let LiveOutputHandle { mut output, detach } = handle;
    let detach = DetachHandle::new(detach, cancel.clone());
    let initial = output.borrow_and_update().clone();

    let entered = lifecycle.settle(
        "onExecuteCommand",
        LifecycleStatus::Execute,
        streaming_command(initial.clone(), &detach, &cancel),
    );
    if !entered {
        return;
    }
    if initial.is_completed() {
        finish_command(&lifecycle, &initial, &detach, &cancel);
        return;
    }

    let runtime = lifecycle.context().runtime.clone();
    drop(runtime.spawn(async move {
        loop {
            if output.changed().await.is_err() {
                let last = output.borrow().clone();
                tracing::warn!(
                    "{} command output closed while {:?}",
                    lifecycle.identity(),
                    last.status
                );
                let last = CommandOutput {
                    error: Some(last.error.unwrap_or_else(|| OUTPUT_CLOSED_MESSAGE.to_string())),
                    ..last
                };
                finish_command(&lifecycle, &last, &detach, &cancel);
                return;
            }

            let latest = output.borrow_and_update().clone();
            if latest.is_completed() {
                finish_command(&lifecycle, &latest, &detach, &cancel);
                return;
            }
            let updated = lifecycle.settle(
                "onCommandOutput",
                LifecycleStatus::ExecuteStreaming,
                streaming_command(latest, &detach, &cancel),
            );
            if !updated {
                return;
            }
        }
    }));
}

fn streaming_command(
    live_output: CommandOutput,
    detach: &DetachHandle,
    cancel: &CancelToken,
) -> LifecycleState {
    LifecycleState::ExecuteStreaming {
        streaming: StreamingResult::CommandOutput {
            live_output,
            detach: detach.clone(),
        },
        cancel: cancel.clone(),
    }
}

fn finish_command(
    lifecycle: &ToolCallLifecycle,
    output: &CommandOutput,
    detach: &DetachHandle,
    cancel: &CancelToken,
) {
    let reason = if detach.is_detached() {
        CompleteReason::UserDetach
    } else if cancel.is_cancelled() {
        CompleteReason::UserAbort
    } else {
        CompleteReason::ExecuteFinish
    };
    lifecycle.settle(
        "onCommandCompleted",
        LifecycleStatus::ExecuteStreaming,
        LifecycleState::Complete(Completion::new(output.to_result(), reason)),
    );
}

// ============================================================================
// Sub-task
// ============================================================================

pub(crate) fn run_subtask(lifecycle: ToolCallLifecycle, task_id: String, cancel: CancelToken) {
    let (fail_tx, mut fail_rx) = mpsc::unbounded_channel();
    let mut status = lifecycle.context().task_store.subscribe(&task_id);

    let entered = lifecycle.settle(
        "onExecuteSubtask",
        LifecycleStatus::Execute,
        LifecycleState::ExecuteStreaming {
            streaming: StreamingResult::Subtask {
                task_id: task_id.clone(),
                cancel: cancel.clone(),
                fail: FailHandle::new(fail_tx),
            },
            cancel: cancel.clone(),
        },
    );
    if !entered {
        return;
    }

    let runtime = lifecycle.context().runtime.clone();
    drop(runtime.spawn(async move {
        let completion = loop {
            let current = *status.borrow_and_update();
            let store = &*lifecycle.context().task_store;
            if let Some(completion) = settled_subtask(store, &task_id, current) {
                break completion;
            }

            tokio::select! {
                biased;
                Some(reason) = fail_rx.recv() => {
                    break Completion::new(error_result(reason), CompleteReason::ExecuteFinish);
                }
                () = cancel.cancelled() => {
                    break Completion::new(
                        error_result(USER_ABORT_MESSAGE),
                        CompleteReason::UserAbort,
                    );
                }
                changed = status.changed() => {
                    if changed.is_err() {
                        tracing::warn!(
                            "{} lost track of sub-task {}",
                            lifecycle.identity(),
                            task_id
                        );
                        break Completion::new(
                            error_result(SUBTASK_LOST_MESSAGE),
                            CompleteReason::ExecuteFinish,
                        );
                    }
                }
            }
        };

        // Dropping the receiver unsubscribes from the store.
        drop(status);
        lifecycle.settle(
            "onSubtaskDone",
            LifecycleStatus::ExecuteStreaming,
            LifecycleState::Complete(completion),
        );
    }));
}

/// Completion for a sub-task in a terminal status.
fn settled_subtask(
    store: &dyn TaskStore,
    task_id: &str,
    status: Option<TaskStatus>,
) -> Option<Completion> {
    let result = match status? {
        TaskStatus::Completed => {
            let task = store.query(task_id);
            match task.as_ref().and_then(Task::final_answer) {
                Some(answer) => json!({ "result": answer }),
                None => error_result(NO_FINAL_ANSWER_MESSAGE),
            }
        }
        TaskStatus::Failed => {
            let message = store
                .query(task_id)
                .and_then(|task| task.error)
                .map(|error| error.message);
            error_result(message.unwrap_or_else(|| SUBTASK_FAILED_MESSAGE.to_string()))
        }
        TaskStatus::PendingInput | TaskStatus::PendingTool | TaskStatus::PendingModel => {
            return None;
        }
    };
    Some(Completion::new(result, CompleteReason::ExecuteFinish))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use tokio::sync::watch;
    use toolcall_types::{MessagePart, MessageRole, TaskError, TaskMessage};

    use super::*;

    #[derive(Default)]
    struct Tasks(Mutex<HashMap<String, Task>>);

    impl TaskStore for Tasks {
        fn subscribe(&self, _task_id: &str) -> watch::Receiver<Option<TaskStatus>> {
            watch::channel(None).1
        }

        fn query(&self, task_id: &str) -> Option<Task> {
            self.0.lock().unwrap().get(task_id).cloned()
        }
    }

    fn store_with(task: Task) -> Tasks {
        let store = Tasks::default();
        store.0.lock().unwrap().insert(task.id.clone(), task);
        store
    }

    fn task(status: TaskStatus, parts: Vec<MessagePart>) -> Task {
        Task {
            id: "sub-1".to_string(),
            status,
            error: None,
            messages: vec![TaskMessage {
                id: "m1".to_string(),
                role: MessageRole::Assistant,
                parts,
            }],
        }
    }

    #[test]
    fn pending_statuses_do_not_settle() {
        let store = Tasks::default();
        assert_eq!(settled_subtask(&store, "sub-1", None), None);
        assert_eq!(
            settled_subtask(&store, "sub-1", Some(TaskStatus::PendingModel)),
            None
        );
    }

    #[test]
    fn completed_task_wraps_final_answer() {
        let store = store_with(task(
            TaskStatus::Completed,
            vec![
                MessagePart::StepStart,
                MessagePart::ToolCall {
                    tool_name: "attemptCompletion".to_string(),
                    tool_call_id: "c1".to_string(),
                    input: json!({"result": "done"}),
                },
            ],
        ));

        let completion = settled_subtask(&store, "sub-1", Some(TaskStatus::Completed)).unwrap();
        assert_eq!(completion.result, json!({"result": {"result": "done"}}));
        assert_eq!(completion.reason, CompleteReason::ExecuteFinish);
    }

    #[test]
    fn completed_task_without_answer_is_an_error() {
        let store = store_with(task(TaskStatus::Completed, vec![MessagePart::StepStart]));

        let completion = settled_subtask(&store, "sub-1", Some(TaskStatus::Completed)).unwrap();
        assert_eq!(completion.error(), Some(NO_FINAL_ANSWER_MESSAGE));
    }

    #[test]
    fn failed_task_reports_its_error() {
        let mut failed = task(TaskStatus::Failed, Vec::new());
        failed.error = Some(TaskError {
            kind: "APICallError".to_string(),
            message: "rate limited".to_string(),
        });
        let store = store_with(failed);

        let completion = settled_subtask(&store, "sub-1", Some(TaskStatus::Failed)).unwrap();
        assert_eq!(completion.error(), Some("rate limited"));
        assert_eq!(completion.reason, CompleteReason::ExecuteFinish);

        let unknown = settled_subtask(&Tasks::default(), "sub-1", Some(TaskStatus::Failed));
        assert_eq!(unknown.unwrap().error(), Some(SUBTASK_FAILED_MESSAGE));
    }
}
