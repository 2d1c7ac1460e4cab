//! Normalization of Codex app-server notifications into unified events.

use std::collections::{HashMap, HashSet};

use serde_json::{json, Value};

use crate::api::events::AgentEvent;
use crate::api::types::Usage;

/// How the turn ended.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnCompletion {
    Completed,
    Interrupted,
    Failed(String),
}

/// Per-turn normalizer state.
#[derive(Debug, Default)]
pub struct CodexTurnState {
    /// Agent-message text already emitted as deltas, per item id
    emitted_text: HashMap<String, String>,
    /// Tool inputs seen on `item/started`, per item id
    tool_inputs: HashMap<String, Value>,
    finished_tools: HashSet<String>,
    finished_messages: HashSet<String>,
    turn_id: Option<String>,
    usage: Option<Usage>,
    completion: Option<TurnCompletion>,
}

impl CodexTurnState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn turn_id(&self) -> Option<&str> {
        self.turn_id.as_deref()
    }

    pub fn set_turn_id(&mut self, turn_id: impl Into<String>) {
        self.turn_id = Some(turn_id.into());
    }

    pub fn usage(&self) -> Option<&Usage> {
        self.usage.as_ref()
    }

    pub fn completion(&self) -> Option<&TurnCompletion> {
        self.completion.as_ref()
    }

    pub fn tool_input(&self, item_id: &str) -> Option<&Value> {
        self.tool_inputs.get(item_id)
    }

    /// Translate one notification. Unknown methods yield nothing.
    pub fn on_notification(&mut self, method: &str, params: &Value) -> Vec<AgentEvent> {
        let mut events = Vec::new();
        match method {
            "turn/started" => {
                if let Some(id) = params.pointer("/turn/id").and_then(Value::as_str) {
                    self.turn_id = Some(id.to_string());
                }
            }
            "item/agentMessage/delta" => {
                let (Some(item_id), Some(delta)) = (str_field(params, "itemId"), str_field(params, "delta")) else {
                    return events;
                };
                if delta.is_empty() {
                    return events;
                }
                self.emitted_text
                    .entry(item_id.to_string())
                    .or_default()
                    .push_str(delta);
                events.push(AgentEvent::AssistantDelta {
                    message_id: item_id.to_string(),
                    text: delta.to_string(),
                });
            }
            "item/started" => {
                if let Some(item) = params.get("item") {
                    self.start_tool(item, &mut events);
                }
            }
            "item/commandExecution/outputDelta" => {
                if let (Some(item_id), Some(delta)) = (str_field(params, "itemId"), str_field(params, "delta")) {
                    events.push(AgentEvent::ToolProgress {
                        tool_call_id: item_id.to_string(),
                        output: delta.to_string(),
                    });
                }
            }
            "item/completed" => {
                if let Some(item) = params.get("item") {
                    self.complete_item(item, &mut events);
                }
            }
            "thread/tokenUsage/updated" => {
                let total = params
                    .pointer("/tokenUsage/total")
                    .or_else(|| params.pointer("/token_usage/total"));
                if let Some(total) = total {
                    self.usage = Some(parse_usage(total));
                }
            }
            "turn/completed" => {
                let turn = params.get("turn").unwrap_or(params);
                self.completion = Some(match str_field(turn, "status") {
                    Some("interrupted") => TurnCompletion::Interrupted,
                    Some("failed") => TurnCompletion::Failed(
                        turn.pointer("/error/message")
                            .and_then(Value::as_str)
                            .unwrap_or("Codex turn failed")
                            .to_string(),
                    ),
                    _ => TurnCompletion::Completed,
                });
            }
            "error" => {
                let will_retry = params
                    .get("willRetry")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                let message = params
                    .pointer("/error/message")
                    .and_then(Value::as_str)
                    .unwrap_or("Codex reported an error");
                if will_retry {
                    log::info!("[codex] transient error, backend will retry: {message}");
                } else if self.completion.is_none() {
                    self.completion = Some(TurnCompletion::Failed(message.to_string()));
                }
            }
            _ => log::trace!("[codex] ignoring notification method={method}"),
        }
        events
    }

    fn start_tool(&mut self, item: &Value, events: &mut Vec<AgentEvent>) {
        let Some((id, name, input)) = tool_descriptor(item) else {
            return;
        };
        if self.tool_inputs.contains_key(&id) {
            return;
        }
        self.tool_inputs.insert(id.clone(), input.clone());
        events.push(AgentEvent::ToolStart {
            tool_call_id: id,
            name,
            input,
        });
    }

    fn complete_item(&mut self, item: &Value, events: &mut Vec<AgentEvent>) {
        let Some(item_id) = str_field(item, "id").map(str::to_string) else {
            return;
        };
        match str_field(item, "type") {
            Some("agentMessage") => self.complete_message(&item_id, item, events),
            Some("commandExecution") | Some("fileChange") | Some("mcpToolCall") => {
                if !self.finished_tools.insert(item_id.clone()) {
                    return;
                }
                // A tool seen only on completion still gets its start first
                self.start_tool(item, events);
                events.push(tool_outcome(&item_id, item));
            }
            _ => {}
        }
    }

    /// Emit only the suffix not yet streamed, then `assistant.done`.
    ///
    /// `assistant.done` always carries the final text. When it does not extend
    /// what was streamed no correcting delta is sent, and consumers replace the
    /// streamed text with the `assistant.done` text.
    fn complete_message(&mut self, item_id: &str, item: &Value, events: &mut Vec<AgentEvent>) {
        if !self.finished_messages.insert(item_id.to_string()) {
            return;
        }
        let final_text = str_field(item, "text").unwrap_or("").to_string();
        let emitted = self.emitted_text.get(item_id).cloned().unwrap_or_default();

        match final_text.strip_prefix(emitted.as_str()) {
            Some(suffix) if !suffix.is_empty() => {
                events.push(AgentEvent::AssistantDelta {
                    message_id: item_id.to_string(),
                    text: suffix.to_string(),
                });
            }
            Some(_) => {}
            None => log::debug!(
                "[codex] final text replaces streamed deltas: item={item_id}, streamed={}, final={}",
                emitted.len(),
                final_text.len()
            ),
        }

        let text = if final_text.is_empty() { emitted } else { final_text };
        if !text.is_empty() {
            events.push(AgentEvent::AssistantDone {
                message_id: item_id.to_string(),
                text,
            });
        }
    }
}

/// `(id, tool name, input)` for tool-like items.
fn tool_descriptor(item: &Value) -> Option<(String, String, Value)> {
    let id = str_field(item, "id")?.to_string();
    match str_field(item, "type")? {
        "commandExecution" => Some((
            id,
            "shell".to_string(),
            json!({
                "command": command_text(item.get("command")),
                "cwd": item.get("cwd").cloned(),
            }),
        )),
        "fileChange" => Some((
            id,
            "apply_patch".to_string(),
            json!({ "changes": item.get("changes").cloned().unwrap_or_else(|| json!([])) }),
        )),
        "mcpToolCall" => {
            let server = str_field(item, "server").unwrap_or("unknown");
            let tool = str_field(item, "tool").unwrap_or("unknown");
            Some((
                id,
                format!("mcp__{server}__{tool}"),
                item.get("arguments").cloned().unwrap_or(Value::Null),
            ))
        }
        _ => None,
    }
}

/// `tool.done` or `tool.error` for a completed tool item.
fn tool_outcome(item_id: &str, item: &Value) -> AgentEvent {
    let status = str_field(item, "status").unwrap_or("completed");
    match str_field(item, "type") {
        Some("commandExecution") => {
            let output = str_field(item, "aggregatedOutput").unwrap_or("");
            let exit_code = item.get("exitCode").and_then(Value::as_i64);
            match (status, exit_code) {
                ("declined", _) => AgentEvent::tool_error(item_id, "Command was declined"),
                ("failed", _) | (_, Some(1..)) | (_, Some(..=-1)) => {
                    let message = if output.trim().is_empty() {
                        format!("Command failed (exit code {})", exit_code.map_or("unknown".to_string(), |c| c.to_string()))
                    } else {
                        output.to_string()
                    };
                    AgentEvent::tool_error(item_id, message)
                }
                _ => AgentEvent::ToolDone {
                    tool_call_id: item_id.to_string(),
                    output: json!({ "output": output, "exitCode": exit_code }),
                },
            }
        }
        Some("fileChange") => match status {
            "declined" => AgentEvent::tool_error(item_id, "Patch was declined"),
            "failed" => AgentEvent::tool_error(item_id, "Patch failed to apply"),
            _ => AgentEvent::ToolDone {
                tool_call_id: item_id.to_string(),
                output: json!({ "changes": item.get("changes").cloned().unwrap_or_else(|| json!([])) }),
            },
        },
        _ => {
            let error = item
                .pointer("/error/message")
                .and_then(Value::as_str)
                .or_else(|| str_field(item, "error"));
            match (status, error) {
                (_, Some(message)) => AgentEvent::tool_error(item_id, message),
                ("failed", None) | ("declined", None) => {
                    AgentEvent::tool_error(item_id, format!("Tool call {status}"))
                }
                _ => AgentEvent::ToolDone {
                    tool_call_id: item_id.to_string(),
                    output: item.get("result").cloned().unwrap_or(Value::Null),
                },
            }
        }
    }
}

fn command_text(command: Option<&Value>) -> Value {
    match command {
        Some(Value::Array(parts)) => Value::String(
            parts
                .iter()
                .filter_map(Value::as_str)
                .collect::<Vec<_>>()
                .join(" "),
        ),
        Some(other) => other.clone(),
        None => Value::Null,
    }
}

fn str_field<'a>(value: &'a Value, key: &str) -> Option<&'a str> {
    value.get(key).and_then(Value::as_str)
}

fn parse_usage(total: &Value) -> Usage {
    let field = |camel: &str, snake: &str| {
        total
            .get(camel)
            .or_else(|| total.get(snake))
            .and_then(Value::as_u64)
            .unwrap_or(0)
    };
    Usage {
        input_tokens: field("inputTokens", "input_tokens"),
        output_tokens: field("outputTokens", "output_tokens"),
        cache_read_input_tokens: field("cachedInputTokens", "cached_input_tokens"),
        cache_creation_input_tokens: 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_completion_emits_only_unstreamed_suffix() {
        let mut state = CodexTurnState::new();
        let mut events = state.on_notification("item/agentMessage/delta", &json!({"itemId": "m1", "delta": "Hel"}));
        events.extend(state.on_notification(
            "item/completed",
            &json!({"item": {"type": "agentMessage", "id": "m1", "text": "Hello"}}),
        ));

        assert_eq!(
            events,
            vec![
                AgentEvent::AssistantDelta { message_id: "m1".to_string(), text: "Hel".to_string() },
                AgentEvent::AssistantDelta { message_id: "m1".to_string(), text: "lo".to_string() },
                AgentEvent::AssistantDone { message_id: "m1".to_string(), text: "Hello".to_string() },
            ]
        );
    }

    #[test]
    fn test_fully_streamed_message_gets_no_extra_delta() {
        let mut state = CodexTurnState::new();
        state.on_notification("item/agentMessage/delta", &json!({"itemId": "m2", "delta": "Done."}));
        let events = state.on_notification(
            "item/completed",
            &json!({"item": {"type": "agentMessage", "id": "m2", "text": "Done."}}),
        );

        assert_eq!(
            events,
            vec![AgentEvent::AssistantDone { message_id: "m2".to_string(), text: "Done.".to_string() }]
        );
    }

    #[test]
    fn test_rewritten_message_is_carried_by_done_alone() {
        let mut state = CodexTurnState::new();
        state.on_notification("item/agentMessage/delta", &json!({"itemId": "m3", "delta": "Draft"}));
        let events = state.on_notification(
            "item/completed",
            &json!({"item": {"type": "agentMessage", "id": "m3", "text": "Final answer"}}),
        );

        assert_eq!(
            events,
            vec![AgentEvent::AssistantDone { message_id: "m3".to_string(), text: "Final answer".to_string() }]
        );
    }

    #[test]
    fn test_command_lifecycle() {
        let mut state = CodexTurnState::new();
        let started = json!({"item": {"type": "commandExecution", "id": "c1", "command": "ls -la", "cwd": "/repo", "status": "inProgress"}});

        let mut events = state.on_notification("item/started", &started);
        events.extend(state.on_notification("item/started", &started));
        events.extend(state.on_notification("item/commandExecution/outputDelta", &json!({"itemId": "c1", "delta": "total 0\n"})));
        events.extend(state.on_notification(
            "item/completed",
            &json!({"item": {"type": "commandExecution", "id": "c1", "status": "completed", "exitCode": 0, "aggregatedOutput": "total 0\n"}}),
        ));

        assert_eq!(events.len(), 3);
        assert_eq!(
            events[0],
            AgentEvent::ToolStart {
                tool_call_id: "c1".to_string(),
                name: "shell".to_string(),
                input: json!({"command": "ls -la", "cwd": "/repo"}),
            }
        );
        assert_eq!(events[1].kind(), "tool.progress");
        assert_eq!(events[2].kind(), "tool.done");
        assert_eq!(state.tool_input("c1").unwrap()["command"], "ls -la");
    }

    #[test]
    fn test_declined_and_failed_tools_are_errors() {
        let mut state = CodexTurnState::new();
        let declined = state.on_notification(
            "item/completed",
            &json!({"item": {"type": "fileChange", "id": "f1", "status": "declined", "changes": []}}),
        );
        let failed = state.on_notification(
            "item/completed",
            &json!({"item": {"type": "commandExecution", "id": "c2", "command": "false", "status": "completed", "exitCode": 1, "aggregatedOutput": ""}}),
        );

        assert_eq!(declined[0].kind(), "tool.start");
        assert_eq!(declined[1], AgentEvent::tool_error("f1", "Patch was declined"));
        assert_eq!(failed[1], AgentEvent::tool_error("c2", "Command failed (exit code 1)"));
    }

    #[test]
    fn test_mcp_tool_name_and_result() {
        let mut state = CodexTurnState::new();
        let events = state.on_notification(
            "item/completed",
            &json!({"item": {"type": "mcpToolCall", "id": "t1", "server": "github", "tool": "search_issues",
                             "status": "completed", "arguments": {"q": "bug"}, "result": {"content": []}}}),
        );

        assert_eq!(
            events,
            vec![
                AgentEvent::ToolStart {
                    tool_call_id: "t1".to_string(),
                    name: "mcp__github__search_issues".to_string(),
                    input: json!({"q": "bug"}),
                },
                AgentEvent::ToolDone { tool_call_id: "t1".to_string(), output: json!({"content": []}) },
            ]
        );
    }

    #[test]
    fn test_usage_and_completion() {
        let mut state = CodexTurnState::new();
        state.on_notification(
            "thread/tokenUsage/updated",
            &json!({"threadId": "t", "tokenUsage": {"total": {"inputTokens": 100, "cachedInputTokens": 40, "outputTokens": 7}}}),
        );
        state.on_notification("error", &json!({"error": {"message": "stream disconnected"}, "willRetry": true}));
        assert_eq!(state.completion(), None);

        state.on_notification("turn/completed", &json!({"turn": {"id": "u1", "status": "failed", "error": {"message": "quota"}}}));

        assert_eq!(state.completion(), Some(&TurnCompletion::Failed("quota".to_string())));
        assert_eq!(
            state.usage(),
            Some(&Usage {
                input_tokens: 100,
                output_tokens: 7,
                cache_read_input_tokens: 40,
                cache_creation_input_tokens: 0,
            })
        );
    }
}
