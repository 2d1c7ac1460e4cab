//! Claude control protocol over stdio.
//!
//! Used when the caller supplies an explicit credential. The CLI runs with
//! `--input-format stream-json --permission-prompt-tool stdio` and asks for
//! tool approval with `control_request{subtype:"can_use_tool"}`; every answer
//! goes back as a `control_response` keyed by the same `request_id`.

use serde_json::{json, Value};
use uuid::Uuid;

use crate::api::types::PermissionDecision;

/// A tool-approval request issued by the CLI.
#[derive(Debug, Clone, PartialEq)]
pub struct CanUseTool {
    pub request_id: String,
    pub tool_name: String,
    pub input: Value,
    pub tool_use_id: Option<String>,
}

/// Control frames the CLI sends to us.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlMessage {
    CanUseTool(CanUseTool),
    /// A control request we do not implement; must still be answered
    Unsupported { request_id: String, subtype: String },
    /// Answer to one of our own control requests
    Response { request_id: String, error: Option<String> },
}

/// Recognize a control frame. Regular stream messages yield `None`.
pub fn parse_control(message: &Value) -> Option<ControlMessage> {
    match message.get("type").and_then(Value::as_str)? {
        "control_request" => {
            let request_id = message.get("request_id")?.as_str()?.to_string();
            let request = message.get("request")?;
            let subtype = request.get("subtype").and_then(Value::as_str).unwrap_or("");
            if subtype == "can_use_tool" {
                Some(ControlMessage::CanUseTool(CanUseTool {
                    request_id,
                    tool_name: request
                        .get("tool_name")
                        .and_then(Value::as_str)
                        .unwrap_or("unknown")
                        .to_string(),
                    input: request.get("input").cloned().unwrap_or_else(|| json!({})),
                    tool_use_id: request
                        .get("tool_use_id")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                }))
            } else {
                Some(ControlMessage::Unsupported {
                    request_id,
                    subtype: subtype.to_string(),
                })
            }
        }
        "control_response" => {
            let response = message.get("response")?;
            let request_id = response.get("request_id")?.as_str()?.to_string();
            let error = match response.get("subtype").and_then(Value::as_str) {
                Some("error") => Some(
                    response
                        .get("error")
                        .and_then(Value::as_str)
                        .unwrap_or("unknown error")
                        .to_string(),
                ),
                _ => None,
            };
            Some(ControlMessage::Response { request_id, error })
        }
        _ => None,
    }
}

fn control_request(subtype: &str) -> Value {
    let request_id = format!("req_{}", Uuid::new_v4().simple());
    json!({
        "type": "control_request",
        "request_id": request_id,
        "request": {"subtype": subtype}
    })
}

pub fn initialize_request() -> Value {
    let mut frame = control_request("initialize");
    frame["request"]["hooks"] = Value::Null;
    frame
}

pub fn interrupt_request() -> Value {
    control_request("interrupt")
}

pub fn user_message(prompt: &str) -> Value {
    json!({
        "type": "user",
        "message": {"role": "user", "content": prompt},
        "parent_tool_use_id": null,
        "session_id": ""
    })
}

/// Answer to `can_use_tool`, in the CLI's permission-result shape.
pub fn permission_response(request: &CanUseTool, decision: &PermissionDecision) -> Value {
    let result = if decision.is_allow() {
        json!({
            "behavior": "allow",
            "updatedInput": decision.updated_input.clone().unwrap_or_else(|| request.input.clone())
        })
    } else {
        json!({
            "behavior": "deny",
            "message": decision.message.clone().unwrap_or_else(|| "Permission denied".to_string()),
            "interrupt": decision.interrupt
        })
    };
    success_response(&request.request_id, result)
}

pub fn success_response(request_id: &str, response: Value) -> Value {
    json!({
        "type": "control_response",
        "response": {"subtype": "success", "request_id": request_id, "response": response}
    })
}

pub fn error_response(request_id: &str, error: &str) -> Value {
    json!({
        "type": "control_response",
        "response": {"subtype": "error", "request_id": request_id, "error": error}
    })
}
