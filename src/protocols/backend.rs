//! AgentBackend trait: runtime → protocol abstraction boundary.
//!
//! This trait defines how the worker drives one run on a backend without
//! knowing that backend's wire protocol.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;

use crate::api::types::{ApiError, BackendKind, Credential, RunId, RunParams, Usage};
use crate::protocols::host::RunHost;
use crate::runtime::cancellation::RunCancellation;

/// Everything an adapter needs to drive one run.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub run_id: RunId,
    pub prompt: String,
    pub cwd: PathBuf,
    pub credential: Option<Credential>,
    pub base_url: Option<String>,
    pub model: Option<String>,
    pub permission_mode: Option<String>,
    pub dangerously_skip_permissions: bool,
    pub sandbox_mode: Option<String>,
    pub approval_policy: Option<String>,
    pub resume_handle: Option<String>,
}

impl RunRequest {
    /// An explicit, non-empty credential was supplied by the caller.
    pub fn explicit_credential(&self) -> Option<&Credential> {
        self.credential.as_ref().filter(|c| !c.is_empty())
    }
}

impl From<RunParams> for RunRequest {
    fn from(params: RunParams) -> Self {
        Self {
            run_id: params.run_id,
            prompt: params.prompt,
            cwd: PathBuf::from(params.cwd),
            credential: params.credential,
            base_url: params.base_url.filter(|url| !url.trim().is_empty()),
            model: params.model.filter(|model| !model.trim().is_empty()),
            permission_mode: params.permission_mode,
            dangerously_skip_permissions: params.dangerously_skip_permissions,
            sandbox_mode: params.sandbox_mode,
            approval_policy: params.approval_policy,
            resume_handle: params.resume_handle.filter(|h| !h.trim().is_empty()),
        }
    }
}

/// What a successfully finished run reports back.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunSummary {
    pub resume_handle: Option<String>,
    pub usage: Option<Usage>,
    pub cost: Option<f64>,
}

/// Abstract interface for one coding-agent backend.
///
/// Implemented by the Claude and Codex adapters. Events flow out through the
/// [`RunHost`], approvals flow through [`RunHost::request_permission`], and
/// abort flows in through the [`RunCancellation`] token.
#[async_trait]
pub trait AgentBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Drive one run to completion.
    ///
    /// # Returns
    /// * `Ok(RunSummary)` - The turn completed successfully
    /// * `Err(ApiError::Aborted)` - The cancellation token fired
    /// * `Err(ApiError)` - Backend or process failure
    async fn run(
        &self,
        request: RunRequest,
        host: Arc<dyn RunHost>,
        cancel: RunCancellation,
    ) -> Result<RunSummary, ApiError>;
}
