//! Live output of a long-running command.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandStatus {
    #[default]
    Idle,
    Running,
    Completed,
}

/// Snapshot of a command's output as observed by the engine.
///
/// `content` is cumulative: every update carries the full output so far.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandOutput {
    pub content: String,
    pub status: CommandStatus,
    #[serde(default)]
    pub is_truncated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CommandOutput {
    #[must_use]
    pub fn running(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            status: CommandStatus::Running,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn completed(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            status: CommandStatus::Completed,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.status == CommandStatus::Completed
    }

    /// Tool result for a finished command: `{output, isTruncated, error?}`.
    ///
    /// The `error` key is omitted entirely when there is no error.
    #[must_use]
    pub fn to_result(&self) -> Value {
        let mut result = Map::new();
        result.insert("output".to_string(), Value::String(self.content.clone()));
        result.insert("isTruncated".to_string(), Value::Bool(self.is_truncated));
        if let Some(error) = &self.error {
            result.insert("error".to_string(), Value::String(error.clone()));
        }
        Value::Object(result)
    }
}
