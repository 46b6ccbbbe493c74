//! Tool call lifecycle engine.
//!
//! Each tool call the model issues gets a [`ToolCallLifecycle`]: a state
//! machine that previews the call while its arguments stream in, waits for
//! approval, executes it against an [`ExecutionBackend`] and reports the
//! result. A [`LifecycleRegistry`] owns the lifecycles of one chat turn,
//! shares a single outer [`CancelToken`] between them and keeps live views of
//! what is executing, previewing and complete.

mod backend;
mod budget;
mod cancel;
mod events;
mod lifecycle;
mod registry;
mod state;
mod streaming;

pub use backend::{
    BackendError, BackendFut, ExecuteCtx, ExecuteOutput, ExecutionBackend, LiveOutputHandle,
    NoTaskStore, PreviewCtx, TaskStore,
};
pub use budget::{BudgetExceeded, SubtaskBudget};
pub use cancel::{CancelToken, EXECUTE_STARTED, USER_ABORT, USER_DETACH, USER_REJECT};
pub use events::{EVENT_STREAM_CAPACITY, EventChannel, LifecycleEvent, ListenerId};
pub use lifecycle::{
    ExpectedStatus, LifecycleError, ToolCallLifecycle, ToolKinds, USER_ABORT_MESSAGE,
    USER_REJECT_MESSAGE,
};
pub use registry::{LifecycleRegistry, RegistryViews};
pub use state::{DetachHandle, FailHandle, StreamingResult};
pub use streaming::{
    NO_FINAL_ANSWER_MESSAGE, OUTPUT_CLOSED_MESSAGE, SUBTASK_FAILED_MESSAGE, SUBTASK_LOST_MESSAGE,
};

pub use toolcall_config::{LifecycleConfig, SubtaskLimits};
pub use toolcall_types::{
    ASK_FOLLOWUP_QUESTION, ATTEMPT_COMPLETION, ArgsState, CommandOutput, CommandStatus, CompleteReason, Completion, LifecycleStatus,
    MessagePart, MessageRole, Task, TaskError, TaskMessage, TaskStatus, ToolCallIdentity,
};
