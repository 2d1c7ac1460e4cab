//! Normalization of Claude `stream-json` output into unified events.

use std::collections::{HashMap, HashSet};

use serde_json::Value;

use crate::api::events::{AgentEvent, RunStatus};
use crate::api::types::Usage;

/// How the turn ended, taken from the terminal `result` message.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnOutcome {
    Success,
    Failed(String),
}

/// Per-run normalizer state.
#[derive(Debug, Default)]
pub struct ClaudeStreamState {
    current_message_id: Option<String>,
    /// Message ids in first-seen order
    message_order: Vec<String>,
    delta_text: HashMap<String, String>,
    final_text: HashMap<String, String>,
    completed: HashSet<String>,
    started_tools: HashSet<String>,
    anonymous_messages: usize,
    session_id: Option<String>,
    usage: Option<Usage>,
    cost: Option<f64>,
    outcome: Option<TurnOutcome>,
}

impl ClaudeStreamState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn usage(&self) -> Option<&Usage> {
        self.usage.as_ref()
    }

    pub fn cost(&self) -> Option<f64> {
        self.cost
    }

    pub fn outcome(&self) -> Option<&TurnOutcome> {
        self.outcome.as_ref()
    }

    pub fn is_finished(&self) -> bool {
        self.outcome.is_some()
    }

    /// Translate one decoded stdout message. Unknown shapes yield nothing.
    pub fn process(&mut self, message: &Value) -> Vec<AgentEvent> {
        let mut events = Vec::new();
        match message.get("type").and_then(Value::as_str) {
            Some("system") => self.on_system(message, &mut events),
            Some("stream_event") => {
                if let Some(event) = message.get("event") {
                    self.on_stream_event(event, &mut events);
                }
            }
            Some("assistant") => self.on_assistant(message, &mut events),
            Some("user") => on_user(message, &mut events),
            Some("result") => self.on_result(message, &mut events),
            Some(other) => log::trace!("[claude] ignoring message type={other}"),
            None => log::debug!("[claude] message without type"),
        }
        events
    }

    fn on_system(&mut self, message: &Value, events: &mut Vec<AgentEvent>) {
        if message.get("subtype").and_then(Value::as_str) != Some("init") {
            return;
        }
        if let Some(session_id) = str_field(message, "session_id") {
            self.record_session(session_id, events);
        }
    }

    fn record_session(&mut self, session_id: &str, events: &mut Vec<AgentEvent>) {
        if self.session_id.is_some() || session_id.is_empty() {
            return;
        }
        self.session_id = Some(session_id.to_string());
        events.push(AgentEvent::ResumeId {
            resume_handle: session_id.to_string(),
        });
    }

    fn on_stream_event(&mut self, event: &Value, events: &mut Vec<AgentEvent>) {
        match event.get("type").and_then(Value::as_str) {
            Some("message_start") => {
                let id = event
                    .get("message")
                    .and_then(|m| str_field(m, "id"))
                    .map(str::to_string)
                    .unwrap_or_else(|| self.anonymous_id());
                self.track(&id);
                self.current_message_id = Some(id);
            }
            Some("content_block_delta") => {
                let Some(delta) = event.get("delta") else {
                    return;
                };
                if delta.get("type").and_then(Value::as_str) != Some("text_delta") {
                    return;
                }
                let Some(text) = str_field(delta, "text").filter(|t| !t.is_empty()) else {
                    return;
                };
                let id = match &self.current_message_id {
                    Some(id) => id.clone(),
                    None => {
                        let id = self.anonymous_id();
                        self.track(&id);
                        self.current_message_id = Some(id.clone());
                        id
                    }
                };
                self.delta_text.entry(id.clone()).or_default().push_str(text);
                events.push(AgentEvent::AssistantDelta {
                    message_id: id,
                    text: text.to_string(),
                });
            }
            Some("message_stop") => {
                if let Some(id) = self.current_message_id.take() {
                    self.finish_message(&id, events);
                }
            }
            _ => {}
        }
    }

    fn on_assistant(&mut self, message: &Value, events: &mut Vec<AgentEvent>) {
        let Some(inner) = message.get("message") else {
            return;
        };
        let id = str_field(inner, "id")
            .map(str::to_string)
            .or_else(|| self.current_message_id.clone())
            .unwrap_or_else(|| self.anonymous_id());
        self.track(&id);

        for block in content_blocks(inner) {
            match block.get("type").and_then(Value::as_str) {
                Some("text") => {
                    if let Some(text) = str_field(block, "text") {
                        self.final_text.entry(id.clone()).or_default().push_str(text);
                    }
                }
                Some("tool_use") => {
                    let Some(tool_id) = str_field(block, "id") else {
                        continue;
                    };
                    if !self.started_tools.insert(tool_id.to_string()) {
                        continue;
                    }
                    events.push(AgentEvent::ToolStart {
                        tool_call_id: tool_id.to_string(),
                        name: str_field(block, "name").unwrap_or("unknown").to_string(),
                        input: block.get("input").cloned().unwrap_or(Value::Null),
                    });
                }
                _ => {}
            }
        }

        // Without partial-message streaming there is no message_stop to wait for
        if self.current_message_id.as_deref() != Some(id.as_str()) {
            self.finish_message(&id, events);
        }
    }

    fn on_result(&mut self, message: &Value, events: &mut Vec<AgentEvent>) {
        if let Some(session_id) = str_field(message, "session_id") {
            self.record_session(session_id, events);
        }

        let pending: Vec<String> = self.message_order.clone();
        for id in pending {
            self.finish_message(&id, events);
        }
        self.current_message_id = None;

        let subtype = str_field(message, "subtype").unwrap_or("unknown");
        let is_error = message
            .get("is_error")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        if subtype == "success" && !is_error {
            self.usage = message.get("usage").map(parse_usage);
            self.cost = message.get("total_cost_usd").and_then(Value::as_f64);
            self.outcome = Some(TurnOutcome::Success);
            return;
        }

        let reason = result_error_message(message, subtype);
        log::info!("[claude] turn ended with error result: subtype={subtype}");
        events.push(AgentEvent::status_with_message(RunStatus::Error, reason.clone()));
        self.outcome = Some(TurnOutcome::Failed(reason));
    }

    /// Emit `assistant.done` once for a message that produced text.
    fn finish_message(&mut self, id: &str, events: &mut Vec<AgentEvent>) {
        if self.completed.contains(id) {
            return;
        }
        let streamed = self.delta_text.get(id).filter(|t| !t.is_empty()).cloned();
        let text = match streamed {
            Some(text) => text,
            None => match self.final_text.get(id).filter(|t| !t.is_empty()) {
                Some(text) => {
                    events.push(AgentEvent::AssistantDelta {
                        message_id: id.to_string(),
                        text: text.clone(),
                    });
                    text.clone()
                }
                // Nothing yet; the final content may still arrive
                None => return,
            },
        };
        self.completed.insert(id.to_string());
        events.push(AgentEvent::AssistantDone {
            message_id: id.to_string(),
            text,
        });
    }

    fn track(&mut self, id: &str) {
        if !self.message_order.iter().any(|known| known == id) {
            self.message_order.push(id.to_string());
        }
    }

    fn anonymous_id(&mut self) -> String {
        self.anonymous_messages += 1;
        format!("claude-msg-{}", self.anonymous_messages)
    }
}

fn on_user(message: &Value, events: &mut Vec<AgentEvent>) {
    let Some(inner) = message.get("message") else {
        return;
    };
    for block in content_blocks(inner) {
        if block.get("type").and_then(Value::as_str) != Some("tool_result") {
            continue;
        }
        let Some(tool_call_id) = str_field(block, "tool_use_id") else {
            continue;
        };
        let output = block.get("content").cloned().unwrap_or(Value::Null);
        if block.get("is_error").and_then(Value::as_bool).unwrap_or(false) {
            events.push(AgentEvent::tool_error(tool_call_id, content_text(&output)));
        } else {
            events.push(AgentEvent::ToolDone {
                tool_call_id: tool_call_id.to_string(),
                output,
            });
        }
    }
}

fn content_blocks(message: &Value) -> impl Iterator<Item = &Value> {
    message
        .get("content")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
}

fn str_field<'a>(value: &'a Value, key: &str) -> Option<&'a str> {
    value.get(key).and_then(Value::as_str)
}

/// Flatten a tool-result `content` (string or text blocks) to plain text.
fn content_text(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        Value::Array(blocks) => blocks
            .iter()
            .filter_map(|b| str_field(b, "text"))
            .collect::<Vec<_>>()
            .join("\n"),
        Value::Null => "Tool call failed".to_string(),
        other => other.to_string(),
    }
}

fn parse_usage(usage: &Value) -> Usage {
    let field = |key: &str| usage.get(key).and_then(Value::as_u64).unwrap_or(0);
    Usage {
        input_tokens: field("input_tokens"),
        output_tokens: field("output_tokens"),
        cache_read_input_tokens: field("cache_read_input_tokens"),
        cache_creation_input_tokens: field("cache_creation_input_tokens"),
    }
}

fn result_error_message(message: &Value, subtype: &str) -> String {
    if let Some(text) = str_field(message, "result").filter(|t| !t.trim().is_empty()) {
        return text.to_string();
    }
    let errors: Vec<&str> = message
        .get("errors")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(Value::as_str)
        .collect();
    if !errors.is_empty() {
        return errors.join("; ");
    }
    format!("Claude turn failed ({subtype})")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn run(state: &mut ClaudeStreamState, messages: &[Value]) -> Vec<AgentEvent> {
        messages.iter().flat_map(|m| state.process(m)).collect()
    }

    fn stream(event: Value) -> Value {
        json!({"type": "stream_event", "event": event})
    }

    fn text_delta(text: &str) -> Value {
        stream(json!({"type": "content_block_delta", "index": 0, "delta": {"type": "text_delta", "text": text}}))
    }

    #[test]
    fn test_streamed_message_deltas_then_done() {
        let mut state = ClaudeStreamState::new();
        let events = run(
            &mut state,
            &[
                json!({"type": "system", "subtype": "init", "session_id": "sess-1"}),
                stream(json!({"type": "message_start", "message": {"id": "msg_1"}})),
                text_delta("Hel"),
                text_delta("lo"),
                json!({"type": "assistant", "message": {"id": "msg_1", "content": [{"type": "text", "text": "Hello"}]}}),
                stream(json!({"type": "message_stop"})),
            ],
        );

        assert_eq!(
            events,
            vec![
                AgentEvent::ResumeId { resume_handle: "sess-1".to_string() },
                AgentEvent::AssistantDelta { message_id: "msg_1".to_string(), text: "Hel".to_string() },
                AgentEvent::AssistantDelta { message_id: "msg_1".to_string(), text: "lo".to_string() },
                AgentEvent::AssistantDone { message_id: "msg_1".to_string(), text: "Hello".to_string() },
            ]
        );
        assert_eq!(state.session_id(), Some("sess-1"));
    }

    #[test]
    fn test_fallback_delta_when_nothing_streamed() {
        let mut state = ClaudeStreamState::new();
        let events = run(
            &mut state,
            &[json!({"type": "assistant", "message": {"id": "msg_9", "content": [{"type": "text", "text": "Full answer"}]}})],
        );

        assert_eq!(
            events,
            vec![
                AgentEvent::AssistantDelta { message_id: "msg_9".to_string(), text: "Full answer".to_string() },
                AgentEvent::AssistantDone { message_id: "msg_9".to_string(), text: "Full answer".to_string() },
            ]
        );

        // Replaying the same message does not repeat anything
        let again = state.process(&json!({"type": "assistant", "message": {"id": "msg_9", "content": [{"type": "text", "text": "Full answer"}]}}));
        assert!(again.is_empty());
    }

    #[test]
    fn test_tool_use_and_results() {
        let mut state = ClaudeStreamState::new();
        let tool_use = json!({"type": "assistant", "message": {"id": "msg_2", "content": [
            {"type": "tool_use", "id": "toolu_1", "name": "Bash", "input": {"command": "ls"}}
        ]}});
        let events = run(
            &mut state,
            &[
                tool_use.clone(),
                tool_use,
                json!({"type": "user", "message": {"content": [
                    {"type": "tool_result", "tool_use_id": "toolu_1", "content": "a.txt"}
                ]}}),
                json!({"type": "user", "message": {"content": [
                    {"type": "tool_result", "tool_use_id": "toolu_2", "is_error": true,
                     "content": [{"type": "text", "text": "permission denied"}]}
                ]}}),
            ],
        );

        assert_eq!(
            events,
            vec![
                AgentEvent::ToolStart {
                    tool_call_id: "toolu_1".to_string(),
                    name: "Bash".to_string(),
                    input: json!({"command": "ls"}),
                },
                AgentEvent::ToolDone { tool_call_id: "toolu_1".to_string(), output: json!("a.txt") },
                AgentEvent::tool_error("toolu_2", "permission denied"),
            ]
        );
    }

    #[test]
    fn test_success_result_captures_usage() {
        let mut state = ClaudeStreamState::new();
        let events = state.process(&json!({
            "type": "result", "subtype": "success", "is_error": false, "session_id": "sess-7",
            "total_cost_usd": 0.0125,
            "usage": {"input_tokens": 10, "output_tokens": 5, "cache_read_input_tokens": 3}
        }));

        assert_eq!(events, vec![AgentEvent::ResumeId { resume_handle: "sess-7".to_string() }]);
        assert_eq!(state.outcome(), Some(&TurnOutcome::Success));
        assert_eq!(state.cost(), Some(0.0125));
        assert_eq!(
            state.usage(),
            Some(&Usage {
                input_tokens: 10,
                output_tokens: 5,
                cache_read_input_tokens: 3,
                cache_creation_input_tokens: 0,
            })
        );
    }

    #[test]
    fn test_error_result_emits_status_without_usage() {
        let mut state = ClaudeStreamState::new();
        let events = state.process(&json!({
            "type": "result", "subtype": "error_max_turns", "is_error": true,
            "usage": {"input_tokens": 99}, "total_cost_usd": 1.0
        }));

        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0],
            AgentEvent::Status { status: RunStatus::Error, message: Some(m) } if m.contains("error_max_turns")
        ));
        assert!(matches!(state.outcome(), Some(TurnOutcome::Failed(_))));
        assert_eq!(state.usage(), None);
        assert_eq!(state.cost(), None);
    }
}
