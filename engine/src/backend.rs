//! Collaborators the engine consumes: the execution backend and the task store.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Mutex, PoisonError};

use serde_json::Value;
use tokio::sync::watch;

use toolcall_types::{ArgsState, CommandOutput, Task, TaskStatus};

use crate::cancel::CancelToken;

/// Backend call future type alias.
pub type BackendFut<'a, T> = Pin<Box<dyn Future<Output = Result<T, BackendError>> + Send + 'a>>;

/// Failure reported by the execution backend.
///
/// For `preview` this is a rejection of the tool call; for `execute` it is an
/// execution failure. Both are folded into the lifecycle's result.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct BackendError {
    message: String,
}

impl BackendError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Context passed with every preview call.
#[derive(Debug, Clone)]
pub struct PreviewCtx {
    pub tool_call_id: String,
    pub args_state: ArgsState,
    pub cancel: CancelToken,
}

/// Context passed with the execute call.
#[derive(Debug, Clone)]
pub struct ExecuteCtx {
    pub tool_call_id: String,
    pub cancel: CancelToken,
}

/// Live output of a long-running command, as handed out by the backend.
pub struct LiveOutputHandle {
    pub(crate) output: watch::Receiver<CommandOutput>,
    pub(crate) detach: Box<dyn FnOnce() + Send>,
}

impl LiveOutputHandle {
    pub fn new(
        output: watch::Receiver<CommandOutput>,
        detach: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            output,
            detach: Box::new(detach),
        }
    }
}

impl fmt::Debug for LiveOutputHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LiveOutputHandle")
            .field("output", &*self.output.borrow())
            .finish_non_exhaustive()
    }
}

/// What an execute call settled into.
#[derive(Debug)]
pub enum ExecuteOutput {
    /// A plain tool result.
    Value(Value),
    /// Output of the long-running command tool.
    LiveOutput(LiveOutputHandle),
    /// Identifier of the task spawned by the sub-task tool.
    Subtask { task_id: String },
}

impl From<Value> for ExecuteOutput {
    fn from(value: Value) -> Self {
        Self::Value(value)
    }
}

/// Previews and runs tool calls.
pub trait ExecutionBackend: Send + Sync {
    /// Render or validate a tool call's effect. `Err` rejects the call.
    fn preview<'a>(
        &'a self,
        tool_name: &'a str,
        args: Value,
        ctx: PreviewCtx,
    ) -> BackendFut<'a, ()>;

    fn execute<'a>(
        &'a self,
        tool_name: &'a str,
        args: Value,
        ctx: ExecuteCtx,
    ) -> BackendFut<'a, ExecuteOutput>;
}

/// Reactive store tracking spawned sub-tasks.
pub trait TaskStore: Send + Sync {
    /// Watch a task's status. Dropping the receiver unsubscribes.
    ///
    /// The current value is `None` until the task is known to the store.
    fn subscribe(&self, task_id: &str) -> watch::Receiver<Option<TaskStatus>>;

    fn query(&self, task_id: &str) -> Option<Task>;
}

/// Task store for sessions that never spawn sub-tasks.
#[derive(Debug, Default)]
pub struct NoTaskStore {
    // Keeps every handed-out receiver open for the store's lifetime.
    sender: Mutex<Option<watch::Sender<Option<TaskStatus>>>>,
}

impl TaskStore for NoTaskStore {
    fn subscribe(&self, _task_id: &str) -> watch::Receiver<Option<TaskStatus>> {
        let mut sender = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        sender
            .get_or_insert_with(|| watch::channel(None).0)
            .subscribe()
    }

    fn query(&self, _task_id: &str) -> Option<Task> {
        None
    }
}
