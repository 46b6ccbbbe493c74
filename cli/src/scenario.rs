//! Scenario files: one JSON step per line, replayed in order.
//!
//! ```text
//! {"op":"preview","tool":"writeToFile","id":"c1","args":{"path":"a.rs"},"streaming":true}
//! {"op":"preview","tool":"writeToFile","id":"c1","args":{"path":"a.rs"}}
//! {"op":"wait","id":"c1","status":"ready"}
//! {"op":"execute","id":"c1","args":{"path":"a.rs"}}
//! {"op":"wait","id":"c1","status":"complete"}
//! ```
//!
//! Blank lines and lines starting with `#` are skipped.

use std::collections::HashMap;
use std::fmt;
use std::ops::ControlFlow;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use serde_json::Value;

use toolcall_engine::{
    ATTEMPT_COMPLETION, ArgsState, CancelToken, LifecycleConfig, LifecycleError,
    LifecycleRegistry, LifecycleStatus, MessagePart, MessageRole, SubtaskBudget, SubtaskLimits,
    Task, TaskError, TaskMessage, TaskStatus, ToolCallIdentity, ToolCallLifecycle, ToolKinds,
};

use crate::simulated::{SimulatedBackend, SimulatedTasks, task_id_for};

/// How long a `wait` step may block before the replay fails.
const WAIT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_STOP_REASON: &str = "user stopped the turn";

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "op", rename_all = "kebab-case", deny_unknown_fields)]
pub enum Step {
    Preview {
        tool: String,
        id: String,
        #[serde(default)]
        args: Value,
        #[serde(default)]
        streaming: bool,
    },
    Execute {
        id: String,
        #[serde(default)]
        args: Value,
    },
    Abort {
        id: String,
    },
    Reject {
        id: String,
    },
    Dispose {
        id: String,
    },
    Detach {
        id: String,
    },
    /// Append command output for a running command tool call.
    Output {
        id: String,
        #[serde(default)]
        content: String,
        #[serde(default)]
        completed: bool,
    },
    /// Update the sub-task spawned by a sub-task tool call.
    Task {
        id: String,
        status: TaskStatus,
        #[serde(default)]
        steps: usize,
        #[serde(default)]
        answer: Option<Value>,
        #[serde(default)]
        error: Option<String>,
    },
    Wait {
        id: String,
        status: LifecycleStatus,
    },
    Stop {
        #[serde(default)]
        reason: Option<String>,
    },
}

pub fn parse(input: &str) -> Result<Vec<Step>> {
    input
        .lines()
        .enumerate()
        .filter(|(_, line)| {
            let line = line.trim();
            !line.is_empty() && !line.starts_with('#')
        })
        .map(|(index, line)| {
            serde_json::from_str(line).with_context(|| format!("line {}: invalid step", index + 1))
        })
        .collect()
}

/// Outcome of one tool call at the end of a replay.
#[derive(Debug, Clone)]
pub struct CallSummary {
    pub identity: ToolCallIdentity,
    pub status: LifecycleStatus,
    pub outcome: Option<String>,
}

#[derive(Debug, Default)]
pub struct Report {
    pub transitions: Vec<String>,
    pub calls: Vec<CallSummary>,
    pub executing: usize,
    pub previewing: usize,
    pub complete: usize,
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "transitions:")?;
        for line in &self.transitions {
            writeln!(f, "  {line}")?;
        }
        writeln!(f, "calls:")?;
        for call in &self.calls {
            match &call.outcome {
                Some(outcome) => writeln!(f, "  {} {} {}", call.identity, call.status, outcome)?,
                None => writeln!(f, "  {} {}", call.identity, call.status)?,
            }
        }
        writeln!(
            f,
            "views: executing={} previewing={} complete={}",
            self.executing, self.previewing, self.complete
        )
    }
}

pub struct Runner {
    registry: LifecycleRegistry,
    backend: Arc<SimulatedBackend>,
    tasks: Arc<SimulatedTasks>,
    limits: SubtaskLimits,
    budgets: HashMap<String, SubtaskBudget>,
    transitions: Arc<Mutex<Vec<String>>>,
}

impl Runner {
    pub fn new(config: &LifecycleConfig) -> Self {
        let tools = ToolKinds::from_config(config);
        let backend = Arc::new(SimulatedBackend::new(tools.clone()));
        let tasks = Arc::new(SimulatedTasks::default());
        let registry = LifecycleRegistry::with_options(
            backend.clone(),
            tasks.clone(),
            tools,
            CancelToken::new(),
        );
        Self {
            registry,
            backend,
            tasks,
            limits: config.subtask_limits(),
            budgets: HashMap::new(),
            transitions: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub async fn run(&mut self, steps: Vec<Step>) -> Result<Report> {
        for (index, step) in steps.into_iter().enumerate() {
            tracing::debug!("step {}: {:?}", index + 1, step);
            self.apply(step)
                .await
                .with_context(|| format!("step {} failed", index + 1))?;
        }
        Ok(self.report())
    }

    async fn apply(&mut self, step: Step) -> Result<()> {
        match step {
            Step::Preview {
                tool,
                id,
                args,
                streaming,
            } => {
                let lifecycle = self.get_or_create(ToolCallIdentity::new(tool, id));
                let args_state = if streaming {
                    ArgsState::Streaming
                } else {
                    ArgsState::Final
                };
                self.note(lifecycle.preview(args, args_state));
            }
            Step::Execute { id, args } => {
                let lifecycle = self.lifecycle(&id)?;
                self.note(lifecycle.execute(args));
            }
            Step::Abort { id } => {
                let lifecycle = self.lifecycle(&id)?;
                self.note(lifecycle.abort());
            }
            Step::Reject { id } => {
                let lifecycle = self.lifecycle(&id)?;
                self.note(lifecycle.reject());
            }
            Step::Dispose { id } => {
                let lifecycle = self.lifecycle(&id)?;
                self.note(lifecycle.dispose());
            }
            Step::Detach { id } => {
                let lifecycle = self.lifecycle(&id)?;
                let streaming = lifecycle
                    .streaming_result()
                    .ok_or_else(|| anyhow!("{} is not streaming", lifecycle.identity()))?;
                streaming.detach();
            }
            Step::Output {
                id,
                content,
                completed,
            } => {
                self.backend.push_output(&id, &content, completed)?;
            }
            Step::Task {
                id,
                status,
                steps,
                answer,
                error,
            } => {
                self.update_task(&id, status, steps, answer, error)?;
            }
            Step::Wait { id, status } => {
                let lifecycle = self.lifecycle(&id)?;
                tokio::time::timeout(WAIT_TIMEOUT, lifecycle.wait_until(|current| current == status))
                    .await
                    .with_context(|| {
                        format!(
                            "{} did not reach {status}, still in {}",
                            lifecycle.identity(),
                            lifecycle.status()
                        )
                    })?;
            }
            Step::Stop { reason } => {
                self.registry.abort_previewing();
                self.registry.abort_executing();
                self.registry
                    .abort_all(reason.unwrap_or_else(|| DEFAULT_STOP_REASON.to_string()));
            }
        }
        Ok(())
    }

    fn update_task(
        &mut self,
        id: &str,
        status: TaskStatus,
        steps: usize,
        answer: Option<Value>,
        error: Option<String>,
    ) -> Result<()> {
        let mut parts = vec![MessagePart::StepStart; steps];
        if let Some(answer) = answer {
            parts.push(MessagePart::ToolCall {
                tool_name: ATTEMPT_COMPLETION.to_string(),
                tool_call_id: format!("{id}-completion"),
                input: answer,
            });
        }
        let task = Task {
            id: task_id_for(id),
            status,
            error: error.map(|message| TaskError {
                kind: "TaskError".to_string(),
                message,
            }),
            messages: vec![TaskMessage {
                id: format!("{id}-message"),
                role: MessageRole::Assistant,
                parts,
            }],
        };

        let lifecycle = self.lifecycle(id)?;
        if let Some(streaming) = lifecycle.streaming_result() {
            let limits = self.limits;
            let budget = self
                .budgets
                .entry(id.to_string())
                .or_insert_with(|| SubtaskBudget::new(limits));
            if !SubtaskBudget::enforce(budget.observe_task(&task), &streaming) {
                return Ok(());
            }
        }
        self.tasks.update(task);
        Ok(())
    }

    fn get_or_create(&self, identity: ToolCallIdentity) -> ToolCallLifecycle {
        if let Some(existing) = self.registry.get(&identity.tool_call_id) {
            return existing;
        }
        let lifecycle = self.registry.get_or_create(identity);
        let transitions = Arc::clone(&self.transitions);
        lifecycle.subscribe(move |event| {
            transitions
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(format!("{} -> {}", event.identity, event.status));
            ControlFlow::Continue(())
        });
        lifecycle
    }

    fn lifecycle(&self, id: &str) -> Result<ToolCallLifecycle> {
        self.registry
            .get(id)
            .ok_or_else(|| anyhow!("unknown tool call {id}"))
    }

    /// Contract violations are part of the replay, not fatal.
    fn note(&self, outcome: Result<(), LifecycleError>) {
        if let Err(err) = outcome {
            tracing::info!("{err}");
            self.transitions
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(format!("! {err}"));
        }
    }

    pub fn report(&self) -> Report {
        let calls = self
            .registry
            .lifecycles()
            .into_iter()
            .map(|lifecycle| CallSummary {
                identity: lifecycle.identity().clone(),
                status: lifecycle.status(),
                outcome: lifecycle
                    .complete()
                    .ok()
                    .map(|completion| format!("{} {}", completion.reason, completion.result)),
            })
            .collect();
        let views = self.registry.watch_views().borrow().clone();
        Report {
            transitions: self
                .transitions
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
            calls,
            executing: views.executing.len(),
            previewing: views.previewing.len(),
            complete: views.complete.len(),
        }
    }
}
