//! Bridge types for the outer JSON-RPC protocol.
//!
//! These types provide a stable API surface shared by the worker process and
//! the host-side client, hiding backend-specific wire formats.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Caller-chosen identifier of a run (opaque string)
pub type RunId = String;

/// Identifier of a pending permission request (UUID v4 string)
pub type PermissionRequestId = String;

/// Version of the outer protocol spoken between host and worker
pub const PROTOCOL_VERSION: u32 = 1;

/// JSON-RPC method names of the outer protocol
pub const METHOD_INITIALIZE: &str = "initialize";
pub const METHOD_AGENT_RUN: &str = "agent.run";
pub const METHOD_AGENT_ABORT: &str = "agent.abort";
pub const METHOD_PERMISSION_RESPOND: &str = "permission.respond";
/// Notification method carrying unified events from worker to host
pub const METHOD_AGENT_EVENT: &str = "agent.event";

/// Backend selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Print-stream CLI / SDK engine (Claude Code)
    Claude,
    /// Nested JSON-RPC app-server engine (Codex)
    Codex,
}

impl BackendKind {
    pub const ALL: [BackendKind; 2] = [BackendKind::Claude, BackendKind::Codex];

    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Claude => "claude",
            BackendKind::Codex => "codex",
        }
    }

    /// Executable name looked up on PATH.
    pub fn program_name(&self) -> &'static str {
        self.as_str()
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A secret supplied by the caller. Never printed in plaintext.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Credential(String);

impl Credential {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Credential({})", preview_secret(Some(&self.0)))
    }
}

/// Length-preserving preview of a secret for diagnostics.
pub fn preview_secret(value: Option<&str>) -> String {
    match value {
        Some(v) if !v.is_empty() => format!("set(len={})", v.len()),
        _ => "unset".to_string(),
    }
}

// ============================================================================
// initialize
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeParams {
    pub protocol_version: u32,
    #[serde(default)]
    pub backends_supported: Vec<BackendKind>,
    /// Directory holding bridge-managed backend installs (overrides discovery)
    #[serde(default)]
    pub external_deps_dir: Option<String>,
}

/// Where a backend binary was found
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderSource {
    /// `externalDepsDir/<backend>/install.json`
    External,
    /// Program override environment variable
    Override,
    /// First match on PATH
    Path,
}

/// Availability report for one backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderStatus {
    pub available: bool,
    pub version: Option<String>,
    pub source: Option<ProviderSource>,
}

impl ProviderStatus {
    pub fn unavailable() -> Self {
        Self {
            available: false,
            version: None,
            source: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Providers {
    pub claude: ProviderStatus,
    pub codex: ProviderStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResult {
    pub bridge_version: String,
    pub protocol_version: u32,
    pub providers: Providers,
}

// ============================================================================
// agent.run
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunParams {
    pub run_id: RunId,
    pub backend: BackendKind,
    pub prompt: String,
    pub cwd: String,
    #[serde(default)]
    pub credential: Option<Credential>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub permission_mode: Option<String>,
    /// Secondary confirmation required for `bypassPermissions`
    #[serde(default)]
    pub dangerously_skip_permissions: bool,
    #[serde(default)]
    pub sandbox_mode: Option<String>,
    #[serde(default)]
    pub approval_policy: Option<String>,
    #[serde(default)]
    pub resume_handle: Option<String>,
}

/// Token usage reported by a backend for one run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_input_tokens: u64,
    pub cache_creation_input_tokens: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_handle: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost: Option<f64>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub aborted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// ============================================================================
// agent.abort / permission.respond
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AbortParams {
    pub run_id: RunId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionBehavior {
    Allow,
    Deny,
}

/// Outcome of a permission negotiation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionDecision {
    pub behavior: PermissionBehavior,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_input: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub interrupt: bool,
}

impl PermissionDecision {
    pub fn allow() -> Self {
        Self {
            behavior: PermissionBehavior::Allow,
            updated_input: None,
            message: None,
            interrupt: false,
        }
    }

    pub fn deny(message: impl Into<String>) -> Self {
        Self {
            behavior: PermissionBehavior::Deny,
            updated_input: None,
            message: Some(message.into()),
            interrupt: false,
        }
    }

    /// Deny and ask the backend to stop the turn.
    pub fn deny_and_interrupt(message: impl Into<String>) -> Self {
        Self {
            interrupt: true,
            ..Self::deny(message)
        }
    }

    pub fn is_allow(&self) -> bool {
        self.behavior == PermissionBehavior::Allow
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionRespondParams {
    pub request_id: PermissionRequestId,
    #[serde(flatten)]
    pub decision: PermissionDecision,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PermissionRespondResult {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl PermissionRespondResult {
    pub fn ok() -> Self {
        Self {
            ok: true,
            reason: None,
        }
    }

    pub fn not_found() -> Self {
        Self {
            ok: false,
            reason: Some("not_found".to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ack {
    pub ok: bool,
}

// ============================================================================
// Errors
// ============================================================================

/// API errors shared by worker, adapters and host client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "type")]
pub enum ApiError {
    /// Invalid input parameter
    #[error("Invalid input: {message}")]
    InvalidInput { message: String },
    /// Malformed frame or unexpected protocol state
    #[error("Protocol error: {message}")]
    ProtocolError { message: String },
    /// Caller speaks a different outer protocol version
    #[error("Protocol version mismatch: expected {expected}, received {received}")]
    VersionMismatch { expected: u32, received: u32 },
    /// Unknown JSON-RPC method
    #[error("Method not found: {method}")]
    MethodNotFound { method: String },
    /// A run is already active on this worker
    #[error("A run is already in progress: {active_run_id}")]
    RunInProgress { active_run_id: RunId },
    /// Required external program is absent
    #[error("Backend not found: {backend} ({message})")]
    BackendNotFound {
        backend: BackendKind,
        message: String,
    },
    /// Backend process failed outside an active cancellation
    #[error("Backend process error: {message}")]
    BackendProcess { message: String },
    /// Explicit cancellation
    #[error("Run aborted")]
    Aborted,
    /// Request or permission timeout
    #[error("Timed out: {message}")]
    Timeout { message: String },
    /// IO error while talking to a process
    #[error("IO error: {message}")]
    IoError { message: String },
    /// The worker process exited while requests were outstanding
    #[error("Worker exited (code={code:?}, signal={signal:?})")]
    WorkerExited {
        code: Option<i32>,
        signal: Option<i32>,
    },
    /// No pending operation with this identifier
    #[error("Operation not found: {operation_id}")]
    OperationNotFound { operation_id: String },
}

impl ApiError {
    /// JSON-RPC error code for this error.
    pub fn code(&self) -> i64 {
        match self {
            ApiError::InvalidInput { .. } => -32602,
            ApiError::ProtocolError { .. } => -32600,
            ApiError::MethodNotFound { .. } => -32601,
            ApiError::VersionMismatch { .. } => -32001,
            ApiError::RunInProgress { .. } => -32002,
            ApiError::BackendNotFound { .. } => -32003,
            ApiError::BackendProcess { .. } => -32004,
            ApiError::Aborted => -32005,
            ApiError::Timeout { .. } => -32006,
            ApiError::IoError { .. } => -32007,
            ApiError::WorkerExited { .. } => -32008,
            ApiError::OperationNotFound { .. } => -32009,
        }
    }

    pub fn io(context: &str, e: impl fmt::Display) -> Self {
        ApiError::IoError {
            message: format!("{context}: {e}"),
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        ApiError::ProtocolError {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credential_debug_is_redacted() {
        let credential = Credential::new("sk-secret-value");
        let rendered = format!("{credential:?}");
        assert!(!rendered.contains("sk-secret"));
        assert!(rendered.contains("len=15"));
        assert_eq!(preview_secret(None), "unset");
    }

    #[test]
    fn test_run_params_defaults() {
        let params: RunParams = serde_json::from_value(serde_json::json!({
            "runId": "r1",
            "backend": "codex",
            "prompt": "hi",
            "cwd": "/tmp"
        }))
        .unwrap();
        assert_eq!(params.backend, BackendKind::Codex);
        assert!(params.credential.is_none());
        assert!(!params.dangerously_skip_permissions);
    }

    #[test]
    fn test_unknown_backend_rejected() {
        let result = serde_json::from_value::<RunParams>(serde_json::json!({
            "runId": "r1",
            "backend": "gemini",
            "prompt": "hi",
            "cwd": "/tmp"
        }));
        assert!(result.is_err());
    }

    #[test]
    fn test_permission_respond_params_flatten() {
        let params: PermissionRespondParams = serde_json::from_value(serde_json::json!({
            "requestId": "p1",
            "behavior": "deny",
            "message": "no",
            "interrupt": true
        }))
        .unwrap();
        assert_eq!(params.request_id, "p1");
        assert_eq!(params.decision, PermissionDecision::deny_and_interrupt("no"));
    }

    #[test]
    fn test_run_result_omits_empty_fields() {
        let value = serde_json::to_value(RunResult {
            success: true,
            ..Default::default()
        })
        .unwrap();
        assert_eq!(value, serde_json::json!({"success": true}));
    }

    #[test]
    fn test_api_error_roundtrips_with_tag() {
        let error = ApiError::RunInProgress {
            active_run_id: "r1".to_string(),
        };
        let value = serde_json::to_value(&error).unwrap();
        assert_eq!(value["type"], "RunInProgress");
        let back: ApiError = serde_json::from_value(value).unwrap();
        assert_eq!(back, error);
        assert_eq!(error.code(), -32002);
    }
}
