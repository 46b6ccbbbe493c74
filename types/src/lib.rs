//! Core domain types for tool call lifecycles.
//!
//! This crate contains pure domain types with no IO, no async, and minimal dependencies.
//! Everything here can be used from any layer of the application.

// Pedantic lint configuration - these are intentional design choices
#![allow(clippy::missing_errors_doc)] // Result-returning functions are self-explanatory

mod command;
mod task;

pub use command::{CommandOutput, CommandStatus};
pub use task::{
    ASK_FOLLOWUP_QUESTION, ATTEMPT_COMPLETION, MessagePart, MessageRole, Task, TaskError,
    TaskMessage, TaskStatus,
};

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

// ============================================================================
// Tool Call Identity
// ============================================================================

/// Identity of a single tool invocation.
///
/// Immutable once a lifecycle is created; `tool_call_id` uniquely keys the registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallIdentity {
    pub tool_name: String,
    pub tool_call_id: String,
}

impl ToolCallIdentity {
    pub fn new(tool_name: impl Into<String>, tool_call_id: impl Into<String>) -> Self {
        Self {
            tool_name: tool_name.into(),
            tool_call_id: tool_call_id.into(),
        }
    }
}

impl fmt::Display for ToolCallIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.tool_name, self.tool_call_id)
    }
}

// ============================================================================
// Lifecycle Status
// ============================================================================

/// Name of the active lifecycle variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LifecycleStatus {
    #[serde(rename = "init")]
    Init,
    #[serde(rename = "pending")]
    Pending,
    #[serde(rename = "ready")]
    Ready,
    #[serde(rename = "execute")]
    Execute,
    #[serde(rename = "execute:streaming")]
    ExecuteStreaming,
    #[serde(rename = "complete")]
    Complete,
    #[serde(rename = "dispose")]
    Dispose,
}

impl LifecycleStatus {
    pub const ALL: [LifecycleStatus; 7] = [
        Self::Init,
        Self::Pending,
        Self::Ready,
        Self::Execute,
        Self::ExecuteStreaming,
        Self::Complete,
        Self::Dispose,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Pending => "pending",
            Self::Ready => "ready",
            Self::Execute => "execute",
            Self::ExecuteStreaming => "execute:streaming",
            Self::Complete => "complete",
            Self::Dispose => "dispose",
        }
    }

    /// `execute` and `execute:streaming`.
    #[must_use]
    pub fn is_executing(self) -> bool {
        self.as_str().starts_with("execute")
    }

    /// `init` and `pending`.
    #[must_use]
    pub const fn is_previewing(self) -> bool {
        matches!(self, Self::Init | Self::Pending)
    }

    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Dispose)
    }
}

impl fmt::Display for LifecycleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Completion
// ============================================================================

/// Why a lifecycle reached `complete`.
///
/// Lets consumers tell "the tool ran and failed" apart from "the tool never ran".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CompleteReason {
    ExecuteFinish,
    UserReject,
    PreviewReject,
    UserDetach,
    UserAbort,
}

impl CompleteReason {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ExecuteFinish => "execute-finish",
            Self::UserReject => "user-reject",
            Self::PreviewReject => "preview-reject",
            Self::UserDetach => "user-detach",
            Self::UserAbort => "user-abort",
        }
    }
}

impl fmt::Display for CompleteReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Final result of a lifecycle, as handed back to the conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Completion {
    pub result: Value,
    pub reason: CompleteReason,
}

impl Completion {
    #[must_use]
    pub fn new(result: Value, reason: CompleteReason) -> Self {
        Self { result, reason }
    }

    /// Error message carried by the result, if any.
    #[must_use]
    pub fn error(&self) -> Option<&str> {
        self.result.get("error").and_then(Value::as_str)
    }
}

/// Build a tool result that carries only an error message.
#[must_use]
pub fn error_result(message: impl Into<String>) -> Value {
    json!({ "error": message.into() })
}

// ============================================================================
// Arguments
// ============================================================================

/// Whether tool arguments are still streaming in or final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ArgsState {
    Streaming,
    Final,
}

impl ArgsState {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Streaming => "streaming",
            Self::Final => "final",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_names_match_wire_names() {
        for status in LifecycleStatus::ALL {
            let wire = serde_json::to_value(status).unwrap();
            assert_eq!(wire, Value::String(status.as_str().to_string()));
        }
    }

    #[test]
    fn execute_variants_are_executing() {
        let executing: Vec<_> = LifecycleStatus::ALL
            .into_iter()
            .filter(|s| s.is_executing())
            .collect();
        assert_eq!(
            executing,
            vec![LifecycleStatus::Execute, LifecycleStatus::ExecuteStreaming]
        );
    }

    #[test]
    fn no_status_is_both_previewing_and_executing() {
        for status in LifecycleStatus::ALL {
            assert!(!(status.is_previewing() && status.is_executing()));
        }
    }

    #[test]
    fn complete_reason_serializes_kebab_case() {
        let value = serde_json::to_value(CompleteReason::PreviewReject).unwrap();
        assert_eq!(value, json!("preview-reject"));
        assert_eq!(CompleteReason::UserDetach.to_string(), "user-detach");
    }

    #[test]
    fn completion_exposes_error() {
        let completion = Completion::new(error_result("boom"), CompleteReason::ExecuteFinish);
        assert_eq!(completion.error(), Some("boom"));

        let ok = Completion::new(json!({"output": "x"}), CompleteReason::ExecuteFinish);
        assert_eq!(ok.error(), None);
    }

    #[test]
    fn identity_displays_name_and_id() {
        let identity = ToolCallIdentity::new("writeToFile", "t1");
        assert_eq!(identity.to_string(), "writeToFile:t1");
    }
}
