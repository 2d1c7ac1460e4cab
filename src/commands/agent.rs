//! `agent.run` and `agent.abort`.

use crate::api::types::{AbortParams, Ack, ApiError, RunParams, RunResult};
use crate::runtime::worker::BridgeWorker;

/// Start a run and wait for it to settle.
///
/// # Returns
///
/// `RunResult` for every outcome once the run has started; inspect `success`.
///
/// # Errors
///
/// - `InvalidInput` for a malformed request
/// - `RunInProgress` if another run is active
pub async fn agent_run(worker: &BridgeWorker, params: RunParams) -> Result<RunResult, ApiError> {
    log::info!(
        "agent.run: run={}, backend={}, cwd={}, resume={}",
        params.run_id,
        params.backend,
        params.cwd,
        params.resume_handle.is_some()
    );
    worker.run(params).await
}

/// Abort the active run if the id matches; otherwise a no-op.
pub fn agent_abort(worker: &BridgeWorker, params: AbortParams) -> Ack {
    log::info!("agent.abort: run={}", params.run_id);
    worker.abort(&params.run_id);
    Ack { ok: true }
}
