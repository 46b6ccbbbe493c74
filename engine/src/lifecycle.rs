//! Per-tool-call lifecycle.
//!
//! A [`ToolCallLifecycle`] owns exactly one [`LifecycleState`] behind a lock.
//! Public operations validate the current variant, perform the transition
//! synchronously and hand backend work to spawned tasks, which settle into
//! later transitions. Every transition queues a [`LifecycleEvent`] under the
//! state lock; the queue is flushed once the lock is released.

use std::fmt;
use std::future::Future;
use std::ops::ControlFlow;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::FutureExt;
use futures_util::future;
use serde_json::Value;
use tokio::runtime::Handle;
use tokio::sync::broadcast::error::RecvError;

use toolcall_config::{DEFAULT_COMMAND_TOOL, DEFAULT_SUBTASK_TOOL, LifecycleConfig};
use toolcall_types::{
    ArgsState, CompleteReason, Completion, LifecycleStatus, ToolCallIdentity, error_result,
};

use crate::backend::{
    BackendError, ExecuteCtx, ExecuteOutput, ExecutionBackend, PreviewCtx, TaskStore,
};
use crate::cancel::{CancelToken, EXECUTE_STARTED, USER_ABORT, USER_REJECT};
use crate::events::{EventChannel, LifecycleEvent, ListenerId};
use crate::state::{LifecycleState, PreviewJob, StreamingResult};
use crate::streaming;

/// Result text handed back when the user rejects a previewed call.
pub const USER_REJECT_MESSAGE: &str =
    "User rejected the tool call, please use askFollowupQuestion to clarify next step with user.";
/// Result text handed back when the user aborts before execution.
pub const USER_ABORT_MESSAGE: &str = "User aborted the tool call";

/// Names of the tools whose execution resolves into a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolKinds {
    pub command_tool: String,
    pub subtask_tool: String,
}

impl Default for ToolKinds {
    fn default() -> Self {
        Self {
            command_tool: DEFAULT_COMMAND_TOOL.to_string(),
            subtask_tool: DEFAULT_SUBTASK_TOOL.to_string(),
        }
    }
}

impl ToolKinds {
    #[must_use]
    pub fn from_config(config: &LifecycleConfig) -> Self {
        Self {
            command_tool: config.command_tool().to_string(),
            subtask_tool: config.subtask_tool().to_string(),
        }
    }
}

/// Collaborators shared by every lifecycle of one registry.
pub(crate) struct EngineContext {
    pub(crate) backend: Arc<dyn ExecutionBackend>,
    pub(crate) task_store: Arc<dyn TaskStore>,
    pub(crate) tools: ToolKinds,
    /// Parent of every preview and execute token; one per chat turn.
    pub(crate) outer: CancelToken,
    /// Runtime backend jobs and stream adapters are spawned on.
    pub(crate) runtime: Handle,
}

impl EngineContext {
    pub(crate) fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        // Detached; every job settles the lifecycle itself.
        drop(self.runtime.spawn(future));
    }
}

impl fmt::Debug for EngineContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineContext")
            .field("tools", &self.tools)
            .field("outer", &self.outer)
            .finish_non_exhaustive()
    }
}

/// Variants an operation accepts, rendered as `a | b`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpectedStatus(pub &'static [LifecycleStatus]);

impl fmt::Display for ExpectedStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, status) in self.0.iter().enumerate() {
            if index > 0 {
                f.write_str(" | ")?;
            }
            f.write_str(status.as_str())?;
        }
        Ok(())
    }
}

/// Contract violation by the caller of a lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LifecycleError {
    #[error("[{identity}] {operation} is not allowed in {actual}, expects {expected}")]
    InvalidTransition {
        identity: ToolCallIdentity,
        operation: &'static str,
        actual: LifecycleStatus,
        expected: ExpectedStatus,
    },
    #[error("[{identity}] {field} is only available in {expected}, but in {actual}")]
    InvalidAccess {
        identity: ToolCallIdentity,
        field: &'static str,
        actual: LifecycleStatus,
        expected: LifecycleStatus,
    },
}

const PREVIEW_FROM: ExpectedStatus =
    ExpectedStatus(&[LifecycleStatus::Init, LifecycleStatus::Ready]);
const EXECUTE_FROM: ExpectedStatus = ExpectedStatus(&[LifecycleStatus::Ready]);
const ABORT_FROM: ExpectedStatus = ExpectedStatus(&[
    LifecycleStatus::Init,
    LifecycleStatus::Pending,
    LifecycleStatus::Execute,
    LifecycleStatus::ExecuteStreaming,
]);
const REJECT_FROM: ExpectedStatus = ExpectedStatus(&[LifecycleStatus::Ready]);
const DISPOSE_FROM: ExpectedStatus =
    ExpectedStatus(&[LifecycleStatus::Complete, LifecycleStatus::Dispose]);

struct LifecycleInner {
    identity: ToolCallIdentity,
    context: Arc<EngineContext>,
    state: Mutex<LifecycleState>,
    events: EventChannel<LifecycleEvent>,
}

/// State machine for one tool call. Cloning shares the same lifecycle.
#[derive(Clone)]
pub struct ToolCallLifecycle {
    inner: Arc<LifecycleInner>,
}

impl fmt::Debug for ToolCallLifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolCallLifecycle")
            .field("identity", &self.inner.identity)
            .field("state", &*self.lock_state())
            .finish_non_exhaustive()
    }
}

fn idle_preview_job() -> PreviewJob {
    future::ready(Ok(())).boxed().shared()
}

impl ToolCallLifecycle {
    pub(crate) fn new(identity: ToolCallIdentity, context: Arc<EngineContext>) -> Self {
        let cancel = context.outer.child();
        Self {
            inner: Arc::new(LifecycleInner {
                identity,
                context,
                state: Mutex::new(LifecycleState::Init {
                    preview_job: idle_preview_job(),
                    cancel,
                }),
                events: EventChannel::new(),
            }),
        }
    }

    #[must_use]
    pub fn identity(&self) -> &ToolCallIdentity {
        &self.inner.identity
    }

    #[must_use]
    pub fn tool_name(&self) -> &str {
        &self.inner.identity.tool_name
    }

    #[must_use]
    pub fn tool_call_id(&self) -> &str {
        &self.inner.identity.tool_call_id
    }

    #[must_use]
    pub fn status(&self) -> LifecycleStatus {
        self.lock_state().status()
    }

    /// Streaming result, defined only in `execute:streaming`.
    #[must_use]
    pub fn streaming_result(&self) -> Option<StreamingResult> {
        match &*self.lock_state() {
            LifecycleState::ExecuteStreaming { streaming, .. } => Some(streaming.clone()),
            _ => None,
        }
    }

    /// Result and reason of a completed lifecycle.
    pub fn complete(&self) -> Result<Completion, LifecycleError> {
        match &*self.lock_state() {
            LifecycleState::Complete(completion) => Ok(completion.clone()),
            other => Err(LifecycleError::InvalidAccess {
                identity: self.inner.identity.clone(),
                field: "complete",
                actual: other.status(),
                expected: LifecycleStatus::Complete,
            }),
        }
    }

    /// Transition notifications for this lifecycle.
    #[must_use]
    pub fn events(&self) -> &EventChannel<LifecycleEvent> {
        &self.inner.events
    }

    /// Register a listener for every transition of this lifecycle.
    ///
    /// Listeners run synchronously after the transition and may call back
    /// into the lifecycle. Returning `ControlFlow::Break(())` unsubscribes.
    pub fn subscribe<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&LifecycleEvent) -> ControlFlow<()> + Send + Sync + 'static,
    {
        self.inner.events.subscribe(listener)
    }

    /// Whether both handles refer to the same lifecycle.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Wait until the current status satisfies `predicate`.
    pub async fn wait_until(
        &self,
        predicate: impl Fn(LifecycleStatus) -> bool,
    ) -> LifecycleStatus {
        // Subscribe before checking so no transition slips in between.
        let mut events = self.inner.events.subscribe_stream();
        loop {
            let status = self.status();
            if predicate(status) {
                return status;
            }
            match events.recv().await {
                Ok(event) if predicate(event.status) => return event.status,
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                // The channel lives as long as `self`.
                Err(RecvError::Closed) => return self.status(),
            }
        }
    }

    /// Wait for the lifecycle to reach `complete` and return its result.
    ///
    /// Fails with [`LifecycleError::InvalidAccess`] if it was disposed first.
    pub async fn wait_complete(&self) -> Result<Completion, LifecycleError> {
        self.wait_until(LifecycleStatus::is_terminal).await;
        self.complete()
    }

    // ------------------------------------------------------------------------
    // Operations
    // ------------------------------------------------------------------------

    /// Preview the call with the arguments seen so far.
    ///
    /// While streaming, previews are chained and the lifecycle stays in
    /// `init`. Final arguments move it to `pending` until the backend's
    /// verdict arrives. In `ready` the call is previewed again in place.
    pub fn preview(&self, args: Value, args_state: ArgsState) -> Result<(), LifecycleError> {
        let mut state = self.lock_state();
        match (&mut *state, args_state) {
            (LifecycleState::Ready { preview_job, cancel }, _) => {
                let job =
                    self.chain_preview(preview_job.clone(), args, args_state, cancel.clone());
                *preview_job = job.clone();
                drop(state);
                self.spawn_preview(job);
                Ok(())
            }
            (LifecycleState::Init { preview_job, cancel }, ArgsState::Streaming) => {
                let cancel = cancel.clone();
                let job =
                    self.chain_preview(preview_job.clone(), args, args_state, cancel.clone());
                self.transit(
                    &mut state,
                    LifecycleState::Init {
                        preview_job: job.clone(),
                        cancel,
                    },
                );
                drop(state);
                self.inner.events.flush();
                self.spawn_preview(job);
                Ok(())
            }
            (LifecycleState::Init { preview_job, cancel }, ArgsState::Final) => {
                let cancel = cancel.clone();
                let job =
                    self.chain_preview(preview_job.clone(), args, args_state, cancel.clone());
                self.transit(
                    &mut state,
                    LifecycleState::Pending {
                        preview_job: job.clone(),
                        cancel,
                    },
                );
                drop(state);
                self.inner.events.flush();

                let this = self.clone();
                self.inner.context.spawn(async move {
                    let verdict = job.await;
                    this.on_preview_settled(verdict);
                });
                Ok(())
            }
            (other, _) => Err(self.invalid_transition("preview", other.status(), PREVIEW_FROM)),
        }
    }

    /// Dispatch the call to the backend. Valid only once, from `ready`.
    ///
    /// Preview refreshes still running on the ready token are cancelled.
    pub fn execute(&self, args: Value) -> Result<(), LifecycleError> {
        let mut state = self.lock_state();
        let LifecycleState::Ready {
            cancel: ready_cancel,
            ..
        } = &*state
        else {
            return Err(self.invalid_transition("execute", state.status(), EXECUTE_FROM));
        };
        ready_cancel.cancel(EXECUTE_STARTED);

        let cancel = self.inner.context.outer.child();
        self.transit(
            &mut state,
            LifecycleState::Execute {
                cancel: cancel.clone(),
            },
        );
        drop(state);
        self.inner.events.flush();

        let this = self.clone();
        self.inner.context.spawn(async move {
            let ctx = ExecuteCtx {
                tool_call_id: this.tool_call_id().to_string(),
                cancel: cancel.clone(),
            };
            let output = this
                .inner
                .context
                .backend
                .execute(this.tool_name(), args, ctx)
                .await;
            this.on_execute_done(output, cancel);
        });
        Ok(())
    }

    /// Stop the call.
    ///
    /// Before execution the lifecycle completes immediately with
    /// `user-abort`. During execution only the token is cancelled; the
    /// running job or stream adapter produces the completion.
    pub fn abort(&self) -> Result<(), LifecycleError> {
        let mut state = self.lock_state();
        let status = state.status();
        if !ABORT_FROM.0.contains(&status) {
            return Err(self.invalid_transition("abort", status, ABORT_FROM));
        }

        if let Some(cancel) = state.cancel_token() {
            cancel.cancel(USER_ABORT);
        }
        if status.is_previewing() {
            self.transit(
                &mut state,
                LifecycleState::Complete(Completion::new(
                    error_result(USER_ABORT_MESSAGE),
                    CompleteReason::UserAbort,
                )),
            );
        }
        drop(state);
        self.inner.events.flush();
        Ok(())
    }

    /// Decline a previewed call without executing it.
    pub fn reject(&self) -> Result<(), LifecycleError> {
        let mut state = self.lock_state();
        let LifecycleState::Ready { cancel, .. } = &*state else {
            return Err(self.invalid_transition("reject", state.status(), REJECT_FROM));
        };
        cancel.cancel(USER_REJECT);
        self.transit(
            &mut state,
            LifecycleState::Complete(Completion::new(
                error_result(USER_REJECT_MESSAGE),
                CompleteReason::UserReject,
            )),
        );
        drop(state);
        self.inner.events.flush();
        Ok(())
    }

    /// Release the lifecycle. No-op when already disposed.
    pub fn dispose(&self) -> Result<(), LifecycleError> {
        let mut state = self.lock_state();
        match &*state {
            LifecycleState::Dispose => Ok(()),
            LifecycleState::Complete(_) => {
                self.transit(&mut state, LifecycleState::Dispose);
                drop(state);
                self.inner.events.flush();
                Ok(())
            }
            other => Err(self.invalid_transition("dispose", other.status(), DISPOSE_FROM)),
        }
    }

    // ------------------------------------------------------------------------
    // Settlement
    // ------------------------------------------------------------------------

    fn on_preview_settled(&self, verdict: Result<(), BackendError>) {
        let next = |state: &LifecycleState| {
            let LifecycleState::Pending {
                preview_job,
                cancel,
            } = state
            else {
                return None;
            };
            Some(match &verdict {
                Ok(()) => LifecycleState::Ready {
                    preview_job: preview_job.clone(),
                    cancel: cancel.clone(),
                },
                Err(err) => {
                    tracing::debug!("{} preview rejected: {}", self.identity(), err);
                    LifecycleState::Complete(Completion::new(
                        error_result(err.message()),
                        CompleteReason::PreviewReject,
                    ))
                }
            })
        };
        if !self.settle_with(next) {
            tracing::debug!(
                "{} ignoring preview verdict in {}",
                self.identity(),
                self.status()
            );
        }
    }

    fn on_execute_done(&self, output: Result<ExecuteOutput, BackendError>, cancel: CancelToken) {
        let tools = &self.inner.context.tools;
        let result = match output {
            Ok(ExecuteOutput::LiveOutput(handle)) if self.tool_name() == tools.command_tool => {
                streaming::run_command(self.clone(), handle, cancel);
                return;
            }
            Ok(ExecuteOutput::Subtask { task_id }) if self.tool_name() == tools.subtask_tool => {
                streaming::run_subtask(self.clone(), task_id, cancel);
                return;
            }
            Ok(ExecuteOutput::Value(value)) => value,
            Ok(ExecuteOutput::LiveOutput(_)) => {
                tracing::warn!(
                    "{} returned live output but is not the command tool",
                    self.identity()
                );
                error_result("Failed to execute tool: unexpected live output")
            }
            Ok(ExecuteOutput::Subtask { task_id }) => {
                tracing::warn!(
                    "{} spawned sub-task {} but is not the sub-task tool",
                    self.identity(),
                    task_id
                );
                error_result("Failed to execute tool: unexpected sub-task")
            }
            Err(err) => {
                tracing::warn!("{} failed to execute: {}", self.identity(), err);
                error_result(format!("Failed to execute tool: {err}"))
            }
        };

        let reason = if cancel.is_cancelled() {
            CompleteReason::UserAbort
        } else {
            CompleteReason::ExecuteFinish
        };
        self.settle(
            "onExecuteDone",
            LifecycleStatus::Execute,
            LifecycleState::Complete(Completion::new(result, reason)),
        );
    }

    // ------------------------------------------------------------------------
    // Internals shared with the stream adapters
    // ------------------------------------------------------------------------

    pub(crate) fn context(&self) -> &EngineContext {
        &self.inner.context
    }

    /// Replace the state if it is still `expected`, then flush events.
    ///
    /// Returns `false` when another path already moved the lifecycle on.
    pub(crate) fn settle(
        &self,
        operation: &'static str,
        expected: LifecycleStatus,
        next: LifecycleState,
    ) -> bool {
        let settled = self.settle_with(|state| (state.status() == expected).then_some(next));
        if !settled {
            tracing::debug!(
                "{} {} skipped, expects {} but in {}",
                self.identity(),
                operation,
                expected,
                self.status()
            );
        }
        settled
    }

    fn settle_with(&self, next: impl FnOnce(&LifecycleState) -> Option<LifecycleState>) -> bool {
        let mut state = self.lock_state();
        let Some(next) = next(&state) else {
            return false;
        };
        self.transit(&mut state, next);
        drop(state);
        self.inner.events.flush();
        true
    }

    /// Swap in `next` and queue its event. The caller flushes after
    /// releasing the lock.
    fn transit(&self, state: &mut MutexGuard<'_, LifecycleState>, next: LifecycleState) {
        let status = next.status();
        **state = next;
        tracing::debug!("{} transitioned to {}", self.identity(), status);
        self.inner.events.enqueue(LifecycleEvent {
            identity: self.inner.identity.clone(),
            status,
        });
    }

    fn spawn_preview(&self, job: PreviewJob) {
        self.inner.context.spawn(async move {
            let _ = job.await;
        });
    }

    fn chain_preview(
        &self,
        previous: PreviewJob,
        args: Value,
        args_state: ArgsState,
        cancel: CancelToken,
    ) -> PreviewJob {
        let backend = Arc::clone(&self.inner.context.backend);
        let tool_name = self.tool_name().to_string();
        let ctx = PreviewCtx {
            tool_call_id: self.tool_call_id().to_string(),
            args_state,
            cancel,
        };
        async move {
            // Earlier verdicts only order the calls; they don't gate them.
            let _ = previous.await;
            backend.preview(&tool_name, args, ctx).await
        }
        .boxed()
        .shared()
    }

    fn invalid_transition(
        &self,
        operation: &'static str,
        actual: LifecycleStatus,
        expected: ExpectedStatus,
    ) -> LifecycleError {
        LifecycleError::InvalidTransition {
            identity: self.inner.identity.clone(),
            operation,
            actual,
            expected,
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, LifecycleState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}
