//! Lifecycle state machine types.
//!
//! # State Machine
//! ```text
//!   preview(streaming)
//!      ┌──┐
//!      v  │
//!    init ──preview(final)──> pending ──verdict ok──> ready ──execute──> execute ──live──> execute:streaming
//!      │                        │                       │                   │                   │
//!      │ abort                  │ abort / rejected      │ reject            │ settled           │ settled
//!      └────────────────────────┴───────────────────────┴─────────┬─────────┴───────────────────┘
//!                                                                 v
//!                                                             complete ──dispose──> dispose
//! ```

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use futures_util::future::{BoxFuture, Shared};
use tokio::sync::mpsc;

use toolcall_types::{CommandOutput, Completion, LifecycleStatus};

use crate::backend::BackendError;
use crate::cancel::{CancelToken, USER_DETACH};

/// Tail of the serialized preview chain. Resolves with the verdict of the
/// most recently issued preview call.
pub(crate) type PreviewJob = Shared<BoxFuture<'static, Result<(), BackendError>>>;

pub(crate) enum LifecycleState {
    /// Arguments still streaming; only provisional previews issued.
    ///
    /// `cancel` is created with the lifecycle and carried through `pending`
    /// and `ready`, so every preview call shares it.
    Init {
        preview_job: PreviewJob,
        cancel: CancelToken,
    },
    /// Final arguments submitted; awaiting the preview verdict.
    Pending {
        preview_job: PreviewJob,
        cancel: CancelToken,
    },
    /// Preview accepted; awaiting execute or reject. Preview refreshes keep
    /// chaining onto `preview_job`.
    Ready {
        preview_job: PreviewJob,
        cancel: CancelToken,
    },
    /// Execution dispatched; the job finalizes the lifecycle.
    Execute { cancel: CancelToken },
    /// Execution resolved into an observable stream; the adapter finalizes.
    ExecuteStreaming {
        streaming: StreamingResult,
        cancel: CancelToken,
    },
    Complete(Completion),
    Dispose,
}

impl LifecycleState {
    pub(crate) fn status(&self) -> LifecycleStatus {
        match self {
            Self::Init { .. } => LifecycleStatus::Init,
            Self::Pending { .. } => LifecycleStatus::Pending,
            Self::Ready { .. } => LifecycleStatus::Ready,
            Self::Execute { .. } => LifecycleStatus::Execute,
            Self::ExecuteStreaming { .. } => LifecycleStatus::ExecuteStreaming,
            Self::Complete(_) => LifecycleStatus::Complete,
            Self::Dispose => LifecycleStatus::Dispose,
        }
    }

    /// Cancellation token of the current variant, if it carries one.
    pub(crate) fn cancel_token(&self) -> Option<&CancelToken> {
        match self {
            Self::Init { cancel, .. }
            | Self::Pending { cancel, .. }
            | Self::Ready { cancel, .. }
            | Self::Execute { cancel }
            | Self::ExecuteStreaming { cancel, .. } => Some(cancel),
            Self::Complete(_) | Self::Dispose => None,
        }
    }
}

impl fmt::Debug for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ExecuteStreaming { streaming, .. } => f
                .debug_struct("ExecuteStreaming")
                .field("streaming", streaming)
                .finish_non_exhaustive(),
            Self::Complete(completion) => f.debug_tuple("Complete").field(completion).finish(),
            other => f.write_str(other.status().as_str()),
        }
    }
}

/// In-progress execution outcome, defined only in `execute:streaming`.
#[derive(Debug, Clone)]
pub enum StreamingResult {
    CommandOutput {
        /// Latest observed output.
        live_output: CommandOutput,
        detach: DetachHandle,
    },
    Subtask {
        task_id: String,
        cancel: CancelToken,
        fail: FailHandle,
    },
}

impl StreamingResult {
    #[must_use]
    pub fn live_output(&self) -> Option<&CommandOutput> {
        match self {
            Self::CommandOutput { live_output, .. } => Some(live_output),
            Self::Subtask { .. } => None,
        }
    }

    /// Detach from a running command. No-op for sub-tasks.
    pub fn detach(&self) {
        if let Self::CommandOutput { detach, .. } = self {
            detach.detach();
        }
    }

    /// Force a sub-task to finish with an error. No-op for commands.
    pub fn fail(&self, reason: impl Into<String>) {
        if let Self::Subtask { fail, .. } = self {
            fail.fail(reason);
        }
    }
}

/// Lets the user stop watching a command without killing the tool call's
/// result: the lifecycle completes with `user-detach`.
#[derive(Clone)]
pub struct DetachHandle {
    detached: Arc<AtomicBool>,
    backend_detach: Arc<Mutex<Option<Box<dyn FnOnce() + Send>>>>,
    cancel: CancelToken,
}

impl DetachHandle {
    pub(crate) fn new(backend_detach: Box<dyn FnOnce() + Send>, cancel: CancelToken) -> Self {
        Self {
            detached: Arc::new(AtomicBool::new(false)),
            backend_detach: Arc::new(Mutex::new(Some(backend_detach))),
            cancel,
        }
    }

    /// Idempotent; the backend's detach runs at most once.
    pub fn detach(&self) {
        self.detached.store(true, Ordering::SeqCst);
        let backend_detach = self
            .backend_detach
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(backend_detach) = backend_detach {
            backend_detach();
        }
        self.cancel.cancel(USER_DETACH);
    }

    #[must_use]
    pub fn is_detached(&self) -> bool {
        self.detached.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for DetachHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DetachHandle")
            .field("detached", &self.is_detached())
            .finish_non_exhaustive()
    }
}

/// Forces a running sub-task to complete with an error, e.g. when its
/// step or retry budget runs out.
#[derive(Debug, Clone)]
pub struct FailHandle {
    tx: mpsc::UnboundedSender<String>,
}

impl FailHandle {
    pub(crate) fn new(tx: mpsc::UnboundedSender<String>) -> Self {
        Self { tx }
    }

    /// Only the first reason is used; later calls are ignored.
    pub fn fail(&self, reason: impl Into<String>) {
        // Closed once the sub-task has completed.
        let _ = self.tx.send(reason.into());
    }
}
