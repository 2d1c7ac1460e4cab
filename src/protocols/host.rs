//! RunHost trait: protocol → runtime callback boundary.
//!
//! Adapters call back into the runtime through this trait to publish unified
//! events and to ask for tool-use approval.
//!
//! Key design principle: the protocol layer does NOT hold the run registry or
//! the outbound channel. The runtime's RunHost implementation captures the run
//! id and attaches it when emitting to the host.

use async_trait::async_trait;

use crate::api::events::AgentEvent;
use crate::api::types::PermissionDecision;

/// Approval request from a protocol adapter.
#[derive(Debug, Clone)]
pub struct PermissionAsk {
    /// Tool the backend wants to use (e.g. `Bash`, `shell`, `apply_patch`)
    pub tool_name: String,
    /// Preview of the tool input shown to the user
    pub input_preview: serde_json::Value,
    /// Backend tool-call id, when the backend supplies one
    pub tool_call_id: Option<String>,
}

/// Callback interface for protocol implementations to interact with the runtime.
#[async_trait]
pub trait RunHost: Send + Sync {
    /// The run this host is scoped to.
    fn run_id(&self) -> &str;

    /// Publish one unified event.
    ///
    /// Events are forwarded in call order. The host may drop events that would
    /// break run invariants (a second `resume.id`, status changes after abort).
    fn emit(&self, event: AgentEvent);

    /// Ask the user for approval and await the decision.
    ///
    /// Always resolves: timeouts and teardown resolve as deny + interrupt.
    async fn request_permission(&self, ask: PermissionAsk) -> PermissionDecision;
}
