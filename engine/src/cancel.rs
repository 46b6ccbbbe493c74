//! Cooperative cancellation with a reason.
//!
//! Wraps `tokio_util`'s `CancellationToken` so every cancellation carries a
//! reason string. Child tokens are cancelled with their parent and report the
//! parent's reason when they were not cancelled directly.

use std::sync::{Arc, OnceLock};

use tokio_util::sync::CancellationToken;

/// Reason used when the user stops a tool call.
pub const USER_ABORT: &str = "user-abort";
/// Reason used when the user rejects a previewed tool call.
pub const USER_REJECT: &str = "user-reject";
/// Reason used when the user detaches from a running command.
pub const USER_DETACH: &str = "user-detach";
/// Reason given to ready-state previews still running when execution starts.
pub const EXECUTE_STARTED: &str = "execute-started";

#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    token: CancellationToken,
    reason: Arc<OnceLock<String>>,
    parent: Option<Arc<CancelToken>>,
}

impl CancelToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Derive a token that is cancelled whenever `self` is.
    ///
    /// Cancelling the child never affects the parent.
    #[must_use]
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            reason: Arc::new(OnceLock::new()),
            parent: Some(Arc::new(self.clone())),
        }
    }

    /// Cancel with `reason`. Idempotent: the first reason wins.
    pub fn cancel(&self, reason: impl Into<String>) {
        if self.token.is_cancelled() {
            return;
        }
        let _ = self.reason.set(reason.into());
        self.token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Why this token was cancelled, or `None` while it is still live.
    #[must_use]
    pub fn reason(&self) -> Option<String> {
        if !self.is_cancelled() {
            return None;
        }
        self.reason
            .get()
            .cloned()
            .or_else(|| self.parent.as_ref().and_then(|parent| parent.reason()))
    }

    /// Resolves once the token (or any ancestor) is cancelled.
    pub async fn cancelled(&self) {
        self.token.cancelled().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_is_idempotent_and_keeps_first_reason() {
        let token = CancelToken::new();
        assert_eq!(token.reason(), None);

        token.cancel(USER_ABORT);
        token.cancel(USER_DETACH);

        assert!(token.is_cancelled());
        assert_eq!(token.reason().as_deref(), Some(USER_ABORT));
    }

    #[test]
    fn child_reflects_parent_reason() {
        let parent = CancelToken::new();
        let child = parent.child();

        parent.cancel("turn stopped");

        assert!(child.is_cancelled());
        assert_eq!(child.reason().as_deref(), Some("turn stopped"));
    }

    #[test]
    fn cancelling_child_leaves_parent_live() {
        let parent = CancelToken::new();
        let child = parent.child();

        child.cancel(USER_ABORT);

        assert!(child.is_cancelled());
        assert!(!parent.is_cancelled());
    }

    #[test]
    fn child_cancelled_after_parent_keeps_parent_reason() {
        let parent = CancelToken::new();
        let child = parent.child();

        parent.cancel("retry");
        child.cancel(USER_ABORT);

        assert_eq!(child.reason().as_deref(), Some("retry"));
    }

    #[tokio::test]
    async fn cancelled_resolves_for_grandchild() {
        let root = CancelToken::new();
        let grandchild = root.child().child();

        let waiter = tokio::spawn({
            let grandchild = grandchild.clone();
            async move { grandchild.cancelled().await }
        });
        root.cancel(USER_ABORT);

        waiter.await.unwrap();
        assert_eq!(grandchild.reason().as_deref(), Some(USER_ABORT));
    }
}
