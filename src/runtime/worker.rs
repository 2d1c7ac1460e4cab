//! Bridge Worker - the one-run-at-a-time state machine.
//!
//! `Idle → Running → {Done | Error | Aborted} → Idle`. A second `agent.run`
//! while a run is active is rejected synchronously and never touches the run
//! in flight. Every run leaves through one teardown path that clears its
//! permission entries and the active slot, whatever the outcome.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::api::events::RunStatus;
use crate::api::types::{ApiError, BackendKind, RunId, RunParams, RunResult};
use crate::config::BridgeConfig;
use crate::protocols::backend::{AgentBackend, RunRequest, RunSummary};
use crate::protocols::claude::ClaudeBackend;
use crate::protocols::codex::CodexBackend;
use crate::protocols::host::RunHost;
use crate::runtime::agent_host::{FrameSink, RuntimeRunHost};
use crate::runtime::cancellation::RunCancellation;
use crate::runtime::permissions::PermissionHub;
use crate::runtime::providers::ProviderRegistry;

/// Builds the adapter for a backend selector.
#[async_trait]
pub trait BackendFactory: Send + Sync {
    async fn create(&self, kind: BackendKind) -> Result<Arc<dyn AgentBackend>, ApiError>;
}

/// Resolves the executable through the provider registry on every run, so an
/// upgraded backend is picked up after the next `initialize`.
pub struct DefaultBackendFactory {
    registry: Arc<ProviderRegistry>,
    config: BridgeConfig,
}

impl DefaultBackendFactory {
    pub fn new(registry: Arc<ProviderRegistry>, config: BridgeConfig) -> Self {
        Self { registry, config }
    }
}

#[async_trait]
impl BackendFactory for DefaultBackendFactory {
    async fn create(&self, kind: BackendKind) -> Result<Arc<dyn AgentBackend>, ApiError> {
        let provider = self.registry.resolve(kind).await?;
        log::debug!(
            "Resolved backend: backend={kind}, program={}, source={:?}",
            provider.program.display(),
            provider.source
        );
        let backend: Arc<dyn AgentBackend> = match kind {
            BackendKind::Claude => Arc::new(ClaudeBackend::new(
                provider.program,
                self.config.credential_paths.clone(),
            )),
            BackendKind::Codex => Arc::new(CodexBackend::new(
                provider.program,
                self.config.credential_paths.clone(),
                self.config.backend_request_timeout,
            )),
        };
        Ok(backend)
    }
}

struct ActiveRun {
    run_id: RunId,
    cancel: RunCancellation,
}

/// Worker state shared by every outer request handler.
pub struct BridgeWorker {
    sink: FrameSink,
    permission_hub: Arc<PermissionHub>,
    registry: Arc<ProviderRegistry>,
    factory: Arc<dyn BackendFactory>,
    active: Mutex<Option<ActiveRun>>,
}

impl BridgeWorker {
    /// Worker wired to the real adapters.
    pub fn new(config: &BridgeConfig, sink: FrameSink) -> Arc<Self> {
        let registry = Arc::new(ProviderRegistry::new(
            config.program_overrides.clone(),
            config.search_path.clone(),
        ));
        let permission_hub = Arc::new(PermissionHub::new(config.permission_timeout));
        let factory = Arc::new(DefaultBackendFactory::new(registry.clone(), config.clone()));
        Self::with_parts(sink, permission_hub, registry, factory)
    }

    pub fn with_parts(
        sink: FrameSink,
        permission_hub: Arc<PermissionHub>,
        registry: Arc<ProviderRegistry>,
        factory: Arc<dyn BackendFactory>,
    ) -> Arc<Self> {
        Arc::new(Self {
            sink,
            permission_hub,
            registry,
            factory,
            active: Mutex::new(None),
        })
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    pub fn permission_hub(&self) -> &PermissionHub {
        &self.permission_hub
    }

    fn active(&self) -> std::sync::MutexGuard<'_, Option<ActiveRun>> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn active_run_id(&self) -> Option<RunId> {
        self.active().as_ref().map(|run| run.run_id.clone())
    }

    /// Drive one run to its terminal status.
    ///
    /// # Errors
    ///
    /// Only synchronous rejections: `InvalidInput` for a malformed request and
    /// `RunInProgress` while another run is active. Every failure after the
    /// run started is reported as `RunResult { success: false, .. }`.
    pub async fn run(&self, params: RunParams) -> Result<RunResult, ApiError> {
        validate(&params)?;
        let run_id = params.run_id.clone();
        let backend_kind = params.backend;
        let cancel = RunCancellation::new();

        {
            let mut active = self.active();
            if let Some(current) = active.as_ref() {
                log::warn!(
                    "Rejecting run while another is active: run={run_id}, active={}",
                    current.run_id
                );
                return Err(ApiError::RunInProgress {
                    active_run_id: current.run_id.clone(),
                });
            }
            *active = Some(ActiveRun {
                run_id: run_id.clone(),
                cancel: cancel.clone(),
            });
        }
        let _teardown = RunTeardown {
            worker: self,
            run_id: run_id.clone(),
        };

        log::info!("Run started: run={run_id}, backend={backend_kind}");
        let host = RuntimeRunHost::new(
            run_id.clone(),
            self.sink.clone(),
            self.permission_hub.clone(),
            cancel.clone(),
        );
        host.emit_lifecycle(RunStatus::Running, None);

        let outcome = match self.factory.create(backend_kind).await {
            Ok(backend) => {
                backend
                    .run(RunRequest::from(params), host.clone(), cancel.clone())
                    .await
            }
            Err(e) => Err(e),
        };

        Ok(settle(&host, &cancel, outcome))
    }

    /// Abort the active run if `run_id` names it. Returns whether it did.
    pub fn abort(&self, run_id: &str) -> bool {
        let cancel = match self.active().as_ref() {
            Some(active) if active.run_id == run_id => active.cancel.clone(),
            Some(active) => {
                log::info!("Ignoring abort for inactive run: run={run_id}, active={}", active.run_id);
                return false;
            }
            None => {
                log::info!("Ignoring abort with no active run: run={run_id}");
                return false;
            }
        };
        log::info!("Aborting run: run={run_id}");
        cancel.abort();
        self.permission_hub.clear_run(run_id, "Run aborted");
        true
    }

    /// Abort whatever is running and resolve every pending permission.
    pub fn shutdown(&self) {
        if let Some(run_id) = self.active_run_id() {
            self.abort(&run_id);
        }
        self.permission_hub.clear_all("Worker shutting down");
    }
}

fn validate(params: &RunParams) -> Result<(), ApiError> {
    if params.run_id.trim().is_empty() {
        return Err(ApiError::InvalidInput {
            message: "runId must not be empty".to_string(),
        });
    }
    if params.cwd.trim().is_empty() {
        return Err(ApiError::InvalidInput {
            message: "cwd must not be empty".to_string(),
        });
    }
    Ok(())
}

/// Map the adapter outcome to the terminal status and the `agent.run` result.
/// An aborted run always settles as aborted.
fn settle(
    host: &RuntimeRunHost,
    cancel: &RunCancellation,
    outcome: Result<RunSummary, ApiError>,
) -> RunResult {
    let resume_handle = host.resume_handle();
    match outcome {
        _ if cancel.is_aborted() => aborted(host, resume_handle),
        Err(ApiError::Aborted) => aborted(host, resume_handle),
        Ok(summary) => {
            log::info!("Run done: run={}", host.run_id());
            host.emit_lifecycle(RunStatus::Done, None);
            RunResult {
                success: true,
                resume_handle: summary.resume_handle.or(resume_handle),
                usage: summary.usage,
                cost: summary.cost,
                ..RunResult::default()
            }
        }
        Err(e) => {
            log::warn!("Run failed: run={}, error={e}", host.run_id());
            let message = e.to_string();
            host.emit_lifecycle(RunStatus::Error, Some(message.clone()));
            RunResult {
                success: false,
                resume_handle,
                error: Some(message),
                ..RunResult::default()
            }
        }
    }
}

fn aborted(host: &RuntimeRunHost, resume_handle: Option<String>) -> RunResult {
    log::info!("Run aborted: run={}", host.run_id());
    host.emit_lifecycle(RunStatus::Aborted, None);
    RunResult {
        success: false,
        aborted: true,
        resume_handle,
        error: Some(ApiError::Aborted.to_string()),
        ..RunResult::default()
    }
}

/// Clears the run's slot and permissions on every exit path, including a
/// dropped `run` future.
struct RunTeardown<'a> {
    worker: &'a BridgeWorker,
    run_id: RunId,
}

impl Drop for RunTeardown<'_> {
    fn drop(&mut self) {
        self.worker
            .permission_hub
            .clear_run(&self.run_id, "Run finished");
        let mut active = self.worker.active();
        if active.as_ref().is_some_and(|run| run.run_id == self.run_id) {
            *active = None;
        }
        log::debug!("Run torn down: run={}", self.run_id);
    }
}
