//! Sub-task records as seen through the reactive task store.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Tool a sub-task calls to deliver its final answer.
pub const ATTEMPT_COMPLETION: &str = "attemptCompletion";
/// Tool a sub-task calls to hand a question back to its parent.
pub const ASK_FOLLOWUP_QUESTION: &str = "askFollowupQuestion";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskStatus {
    Completed,
    PendingInput,
    Failed,
    PendingTool,
    PendingModel,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskError {
    pub kind: String,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum MessagePart {
    /// Boundary between two model steps.
    StepStart,
    Text {
        text: String,
    },
    #[serde(rename_all = "camelCase")]
    ToolCall {
        tool_name: String,
        tool_call_id: String,
        #[serde(default)]
        input: Value,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskMessage {
    pub id: String,
    pub role: MessageRole,
    #[serde(default)]
    pub parts: Vec<MessagePart>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskError>,
    #[serde(default)]
    pub messages: Vec<TaskMessage>,
}

impl Task {
    /// Final answer of a finished sub-task.
    ///
    /// Looks at the last message only, past its most recent `step-start`
    /// boundary, and returns the input of the last `attemptCompletion` or
    /// `askFollowupQuestion` call found there.
    #[must_use]
    pub fn final_answer(&self) -> Option<&Value> {
        let message = self.messages.last()?;
        let step_start = message
            .parts
            .iter()
            .rposition(|part| matches!(part, MessagePart::StepStart))
            .map_or(0, |index| index + 1);

        message.parts[step_start..]
            .iter()
            .rev()
            .find_map(|part| match part {
                MessagePart::ToolCall {
                    tool_name, input, ..
                } if tool_name == ATTEMPT_COMPLETION || tool_name == ASK_FOLLOWUP_QUESTION => {
                    Some(input)
                }
                _ => None,
            })
    }

    /// Number of `step-start` boundaries across the whole history.
    #[must_use]
    pub fn step_count(&self) -> usize {
        self.messages
            .iter()
            .flat_map(|message| &message.parts)
            .filter(|part| matches!(part, MessagePart::StepStart))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn tool(name: &str, input: Value) -> MessagePart {
        MessagePart::ToolCall {
            tool_name: name.to_string(),
            tool_call_id: format!("call-{name}"),
            input,
        }
    }

    fn task_with(parts: Vec<MessagePart>) -> Task {
        Task {
            id: "sub".to_string(),
            status: TaskStatus::Completed,
            error: None,
            messages: vec![TaskMessage {
                id: "m1".to_string(),
                role: MessageRole::Assistant,
                parts,
            }],
        }
    }

    #[test]
    fn final_answer_uses_last_completion_after_step_boundary() {
        let task = task_with(vec![
            MessagePart::StepStart,
            tool(ATTEMPT_COMPLETION, json!({"result": "stale"})),
            MessagePart::StepStart,
            MessagePart::Text {
                text: "wrapping up".to_string(),
            },
            tool(ATTEMPT_COMPLETION, json!({"result": "done"})),
        ]);
        assert_eq!(task.final_answer(), Some(&json!({"result": "done"})));
    }

    #[test]
    fn final_answer_ignores_calls_before_boundary() {
        let task = task_with(vec![
            tool(ASK_FOLLOWUP_QUESTION, json!({"question": "old"})),
            MessagePart::StepStart,
            tool("readFile", json!({"path": "a"})),
        ]);
        assert_eq!(task.final_answer(), None);
    }

    #[test]
    fn final_answer_accepts_followup_question() {
        let task = task_with(vec![tool(ASK_FOLLOWUP_QUESTION, json!({"question": "which?"}))]);
        assert_eq!(task.final_answer(), Some(&json!({"question": "which?"})));
    }

    #[test]
    fn message_parts_use_kebab_case_tags() {
        let part: MessagePart = serde_json::from_value(json!({
            "type": "tool-call",
            "toolName": "attemptCompletion",
            "toolCallId": "c1",
            "input": {"result": "ok"}
        }))
        .unwrap();
        assert_eq!(
            part,
            MessagePart::ToolCall {
                tool_name: ATTEMPT_COMPLETION.to_string(),
                tool_call_id: "c1".to_string(),
                input: json!({"result": "ok"}),
            }
        );

        let step: MessagePart = serde_json::from_value(json!({"type": "step-start"})).unwrap();
        assert_eq!(step, MessagePart::StepStart);
    }

    #[test]
    fn step_count_spans_messages() {
        let mut task = task_with(vec![MessagePart::StepStart]);
        task.messages.push(TaskMessage {
            id: "m2".to_string(),
            role: MessageRole::Assistant,
            parts: vec![MessagePart::StepStart, MessagePart::StepStart],
        });
        assert_eq!(task.step_count(), 3);
    }
}
