//! In-process stand-ins for the host editor: a backend that previews and
//! runs tool calls from their arguments, and a task store fed by the
//! scenario.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::{Value, json};
use tokio::sync::watch;

use toolcall_engine::{
    ArgsState, BackendError, BackendFut, CommandOutput, CommandStatus, ExecuteCtx, ExecuteOutput,
    ExecutionBackend, LiveOutputHandle, PreviewCtx, Task, TaskStatus, TaskStore, ToolKinds,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Task id the simulated backend assigns to a sub-task tool call.
pub fn task_id_for(tool_call_id: &str) -> String {
    format!("task-{tool_call_id}")
}

/// Backend driven by well-known argument keys:
///
/// - `reject`: final previews fail with this message
/// - `delay_ms`: previews and executions sleep first
/// - `fail`: execution fails with this message
/// - `until_cancelled`: execution waits for its token
pub struct SimulatedBackend {
    tools: ToolKinds,
    outputs: Mutex<HashMap<String, Arc<watch::Sender<CommandOutput>>>>,
}

impl SimulatedBackend {
    pub fn new(tools: ToolKinds) -> Self {
        Self {
            tools,
            outputs: Mutex::new(HashMap::new()),
        }
    }

    /// Push command output for a running command tool call.
    pub fn push_output(
        &self,
        tool_call_id: &str,
        content: &str,
        completed: bool,
    ) -> Result<(), BackendError> {
        let outputs = lock(&self.outputs);
        let sender = outputs
            .get(tool_call_id)
            .ok_or_else(|| BackendError::new(format!("no command running for {tool_call_id}")))?;
        sender.send_modify(|output| {
            output.content.push_str(content);
            if completed {
                output.status = CommandStatus::Completed;
            }
        });
        Ok(())
    }

    fn start_command(&self, tool_call_id: &str) -> LiveOutputHandle {
        let (sender, receiver) = watch::channel(CommandOutput::running(""));
        let sender = Arc::new(sender);
        lock(&self.outputs).insert(tool_call_id.to_string(), Arc::clone(&sender));

        LiveOutputHandle::new(receiver, move || {
            sender.send_modify(|output| {
                output.status = CommandStatus::Completed;
                output.error = Some("Detached from the running command.".to_string());
            });
        })
    }
}

async fn delay(args: &Value) {
    if let Some(ms) = args.get("delay_ms").and_then(Value::as_u64) {
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }
}

impl ExecutionBackend for SimulatedBackend {
    fn preview<'a>(
        &'a self,
        tool_name: &'a str,
        args: Value,
        ctx: PreviewCtx,
    ) -> BackendFut<'a, ()> {
        Box::pin(async move {
            delay(&args).await;
            tracing::debug!(
                "preview {}:{} ({})",
                tool_name,
                ctx.tool_call_id,
                ctx.args_state.as_str()
            );
            if ctx.args_state == ArgsState::Final
                && let Some(message) = args.get("reject").and_then(Value::as_str)
            {
                return Err(BackendError::new(message));
            }
            Ok(())
        })
    }

    fn execute<'a>(
        &'a self,
        tool_name: &'a str,
        args: Value,
        ctx: ExecuteCtx,
    ) -> BackendFut<'a, ExecuteOutput> {
        Box::pin(async move {
            delay(&args).await;
            if tool_name == self.tools.command_tool {
                return Ok(ExecuteOutput::LiveOutput(
                    self.start_command(&ctx.tool_call_id),
                ));
            }
            if tool_name == self.tools.subtask_tool {
                return Ok(ExecuteOutput::Subtask {
                    task_id: task_id_for(&ctx.tool_call_id),
                });
            }
            if let Some(message) = args.get("fail").and_then(Value::as_str) {
                return Err(BackendError::new(message));
            }
            if args.get("until_cancelled").is_some() {
                ctx.cancel.cancelled().await;
                return Ok(json!({ "cancelled": ctx.cancel.reason() }).into());
            }
            Ok(json!({ "success": true, "args": args }).into())
        })
    }
}

/// Task store whose tasks change only when the scenario says so.
#[derive(Default)]
pub struct SimulatedTasks {
    tasks: Mutex<HashMap<String, (watch::Sender<Option<TaskStatus>>, Option<Task>)>>,
}

impl SimulatedTasks {
    pub fn update(&self, task: Task) {
        let mut tasks = lock(&self.tasks);
        let (sender, stored) = tasks
            .entry(task.id.clone())
            .or_insert_with(|| (watch::channel(None).0, None));
        let status = task.status;
        *stored = Some(task);
        sender.send_replace(Some(status));
    }
}

impl TaskStore for SimulatedTasks {
    fn subscribe(&self, task_id: &str) -> watch::Receiver<Option<TaskStatus>> {
        let mut tasks = lock(&self.tasks);
        let (sender, _) = tasks
            .entry(task_id.to_string())
            .or_insert_with(|| (watch::channel(None).0, None));
        sender.subscribe()
    }

    fn query(&self, task_id: &str) -> Option<Task> {
        lock(&self.tasks)
            .get(task_id)
            .and_then(|(_, task)| task.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn push_output_requires_a_running_command() {
        let backend = SimulatedBackend::new(ToolKinds::default());
        assert!(backend.push_output("cmd-1", "x", false).is_err());

        let handle = backend.start_command("cmd-1");
        backend.push_output("cmd-1", "hello ", false).unwrap();
        backend.push_output("cmd-1", "world", true).unwrap();
        drop(handle);

        let outputs = lock(&backend.outputs);
        let output = outputs["cmd-1"].borrow().clone();
        assert_eq!(output.content, "hello world");
        assert!(output.is_completed());
    }

    #[test]
    fn tasks_publish_status_on_update() {
        let tasks = SimulatedTasks::default();
        let receiver = tasks.subscribe("task-1");
        assert_eq!(*receiver.borrow(), None);

        tasks.update(Task {
            id: "task-1".to_string(),
            status: TaskStatus::Failed,
            error: None,
            messages: Vec::new(),
        });

        assert_eq!(*receiver.borrow(), Some(TaskStatus::Failed));
        assert!(tasks.query("task-1").is_some());
    }
}
