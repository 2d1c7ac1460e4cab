//! Unified events emitted by the bridge for every run.
//!
//! Both backends are normalized into this taxonomy. The worker wraps each event
//! in a [`RunEvent`] (adding `runId`) and sends it as an `agent.event`
//! notification.

use serde::{Deserialize, Serialize};

use super::types::{PermissionRequestId, RunId};

/// Lifecycle status of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Done,
    Error,
    Aborted,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

/// Backend-agnostic event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum AgentEvent {
    #[serde(rename = "status")]
    Status {
        status: RunStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    #[serde(rename = "assistant.delta", rename_all = "camelCase")]
    AssistantDelta { message_id: String, text: String },
    #[serde(rename = "assistant.done", rename_all = "camelCase")]
    AssistantDone { message_id: String, text: String },
    #[serde(rename = "tool.start", rename_all = "camelCase")]
    ToolStart {
        tool_call_id: String,
        name: String,
        input: serde_json::Value,
    },
    #[serde(rename = "tool.progress", rename_all = "camelCase")]
    ToolProgress { tool_call_id: String, output: String },
    #[serde(rename = "tool.done", rename_all = "camelCase")]
    ToolDone {
        tool_call_id: String,
        output: serde_json::Value,
    },
    /// Terminal event of a failed, denied or declined tool call
    #[serde(rename = "tool.error", rename_all = "camelCase")]
    ToolError {
        tool_call_id: String,
        status: ToolErrorStatus,
        message: String,
    },
    #[serde(rename = "permission.request", rename_all = "camelCase")]
    PermissionRequest {
        request_id: PermissionRequestId,
        tool_name: String,
        input_preview: serde_json::Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tool_call_id: Option<String>,
        deadline_ms: u64,
    },
    #[serde(rename = "resume.id", rename_all = "camelCase")]
    ResumeId { resume_handle: String },
}

/// Status carried by `tool.error`; always `"error"` on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolErrorStatus {
    #[default]
    Error,
}

impl AgentEvent {
    pub fn status(status: RunStatus) -> Self {
        AgentEvent::Status {
            status,
            message: None,
        }
    }

    pub fn status_with_message(status: RunStatus, message: impl Into<String>) -> Self {
        AgentEvent::Status {
            status,
            message: Some(message.into()),
        }
    }

    pub fn tool_error(tool_call_id: impl Into<String>, message: impl Into<String>) -> Self {
        AgentEvent::ToolError {
            tool_call_id: tool_call_id.into(),
            status: ToolErrorStatus::Error,
            message: message.into(),
        }
    }

    /// Wire name of the event type.
    pub fn kind(&self) -> &'static str {
        match self {
            AgentEvent::Status { .. } => "status",
            AgentEvent::AssistantDelta { .. } => "assistant.delta",
            AgentEvent::AssistantDone { .. } => "assistant.done",
            AgentEvent::ToolStart { .. } => "tool.start",
            AgentEvent::ToolProgress { .. } => "tool.progress",
            AgentEvent::ToolDone { .. } => "tool.done",
            AgentEvent::ToolError { .. } => "tool.error",
            AgentEvent::PermissionRequest { .. } => "permission.request",
            AgentEvent::ResumeId { .. } => "resume.id",
        }
    }
}

/// Notification payload: `{runId, type, ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunEvent {
    pub run_id: RunId,
    #[serde(flatten)]
    pub event: AgentEvent,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_run_event_wire_shape() {
        let event = RunEvent {
            run_id: "run-1".to_string(),
            event: AgentEvent::AssistantDelta {
                message_id: "msg_1".to_string(),
                text: "Hel".to_string(),
            },
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(
            value,
            json!({"runId": "run-1", "type": "assistant.delta", "messageId": "msg_1", "text": "Hel"})
        );

        let parsed: RunEvent = serde_json::from_value(value).unwrap();
        assert_eq!(parsed, event);
    }

    #[test]
    fn test_tool_error_reports_error_status() {
        let value = serde_json::to_value(AgentEvent::tool_error("t1", "denied")).unwrap();
        assert_eq!(value["type"], "tool.error");
        assert_eq!(value["status"], "error");
        assert_eq!(value["toolCallId"], "t1");
    }

    #[test]
    fn test_status_event_omits_empty_message() {
        let value = serde_json::to_value(AgentEvent::status(RunStatus::Aborted)).unwrap();
        assert_eq!(value, json!({"type": "status", "status": "aborted"}));
    }
}
