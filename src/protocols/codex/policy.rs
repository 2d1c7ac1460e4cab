//! Sandbox / approval policy validation and the approval request vocabulary.

use serde_json::{json, Value};

use crate::api::types::PermissionDecision;
use crate::protocols::host::PermissionAsk;

pub const SANDBOX_MODES: [&str; 3] = ["read-only", "workspace-write", "danger-full-access"];
pub const DEFAULT_SANDBOX_MODE: &str = "workspace-write";

pub const APPROVAL_POLICIES: [&str; 4] = ["untrusted", "on-failure", "on-request", "never"];
pub const DEFAULT_APPROVAL_POLICY: &str = "on-request";

fn pick(requested: Option<&str>, allowed: &[&'static str], default: &'static str, what: &str) -> &'static str {
    let Some(requested) = requested.map(str::trim).filter(|v| !v.is_empty()) else {
        return default;
    };
    match allowed.iter().find(|v| **v == requested) {
        Some(value) => *value,
        None => {
            log::warn!("Unknown {what} '{requested}'; using {default}");
            default
        }
    }
}

/// Validated sandbox mode; invalid values fall back to `workspace-write`.
pub fn resolve_sandbox_mode(requested: Option<&str>) -> &'static str {
    pick(requested, &SANDBOX_MODES, DEFAULT_SANDBOX_MODE, "sandbox mode")
}

/// Validated approval policy; invalid values fall back to `on-request`.
pub fn resolve_approval_policy(requested: Option<&str>) -> &'static str {
    pick(requested, &APPROVAL_POLICIES, DEFAULT_APPROVAL_POLICY, "approval policy")
}

/// Server requests that ask the user for approval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalKind {
    /// `item/commandExecution/requestApproval`
    Command,
    /// `item/fileChange/requestApproval`
    FileChange,
    /// `execCommandApproval`
    LegacyExec,
    /// `applyPatchApproval`
    LegacyPatch,
}

impl ApprovalKind {
    pub fn from_method(method: &str) -> Option<Self> {
        match method {
            "item/commandExecution/requestApproval" => Some(ApprovalKind::Command),
            "item/fileChange/requestApproval" => Some(ApprovalKind::FileChange),
            "execCommandApproval" => Some(ApprovalKind::LegacyExec),
            "applyPatchApproval" => Some(ApprovalKind::LegacyPatch),
            _ => None,
        }
    }

    pub fn tool_name(&self) -> &'static str {
        match self {
            ApprovalKind::Command | ApprovalKind::LegacyExec => "shell",
            ApprovalKind::FileChange | ApprovalKind::LegacyPatch => "apply_patch",
        }
    }

    /// Item / call id the request refers to.
    pub fn tool_call_id(&self, params: &Value) -> Option<String> {
        let key = match self {
            ApprovalKind::Command | ApprovalKind::FileChange => "itemId",
            ApprovalKind::LegacyExec | ApprovalKind::LegacyPatch => "callId",
        };
        params.get(key).and_then(Value::as_str).map(str::to_string)
    }

    /// Build the ask shown to the user. `known_input` is the tool input seen
    /// on `item/started`, used when the request omits it.
    pub fn ask(&self, params: &Value, known_input: Option<&Value>) -> PermissionAsk {
        let mut preview = match self {
            ApprovalKind::Command | ApprovalKind::LegacyExec => json!({
                "command": params.get("command").cloned().or_else(|| known_input.and_then(|i| i.get("command")).cloned()),
                "cwd": params.get("cwd").cloned(),
            }),
            ApprovalKind::FileChange | ApprovalKind::LegacyPatch => json!({
                "changes": params
                    .get("fileChanges")
                    .or_else(|| params.get("changes"))
                    .cloned()
                    .or_else(|| known_input.and_then(|i| i.get("changes")).cloned()),
            }),
        };
        if let Some(reason) = params.get("reason").filter(|r| !r.is_null()) {
            preview["reason"] = reason.clone();
        }
        PermissionAsk {
            tool_name: self.tool_name().to_string(),
            input_preview: preview,
            tool_call_id: self.tool_call_id(params),
        }
    }

    /// Translate the decision into this request's reply vocabulary.
    pub fn reply(&self, decision: &PermissionDecision) -> Value {
        let word = match (self, decision.is_allow()) {
            (ApprovalKind::Command | ApprovalKind::FileChange, true) => "accept",
            (ApprovalKind::Command | ApprovalKind::FileChange, false) => "decline",
            (ApprovalKind::LegacyExec | ApprovalKind::LegacyPatch, true) => "approved",
            (ApprovalKind::LegacyExec | ApprovalKind::LegacyPatch, false) => "denied",
        };
        json!({ "decision": word })
    }
}
