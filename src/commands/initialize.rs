//! `initialize`: protocol handshake and backend capability report.

use std::path::PathBuf;

use crate::api::types::{ApiError, InitializeParams, InitializeResult, PROTOCOL_VERSION};
use crate::runtime::worker::BridgeWorker;

/// Check the protocol version and report backend availability.
///
/// Every call records `externalDepsDir` and drops cached backend
/// resolutions, so a backend upgraded in between is picked up by the next run.
///
/// # Returns
///
/// The capability report. An absent backend is reported as unavailable; it is
/// never an error.
///
/// # Errors
///
/// - `VersionMismatch` if the caller speaks another protocol version
pub async fn initialize(
    worker: &BridgeWorker,
    params: InitializeParams,
) -> Result<InitializeResult, ApiError> {
    log::info!(
        "initialize: protocol_version={}, backends={:?}, external_deps_dir={:?}",
        params.protocol_version,
        params.backends_supported,
        params.external_deps_dir
    );
    if params.protocol_version != PROTOCOL_VERSION {
        return Err(ApiError::VersionMismatch {
            expected: PROTOCOL_VERSION,
            received: params.protocol_version,
        });
    }

    let deps_dir = params
        .external_deps_dir
        .filter(|dir| !dir.trim().is_empty())
        .map(PathBuf::from);
    worker.registry().set_external_deps_dir(deps_dir);
    let providers = worker.registry().report().await;

    log::info!(
        "Providers: claude={}, codex={}",
        providers.claude.available,
        providers.codex.available
    );
    Ok(InitializeResult {
        bridge_version: env!("CARGO_PKG_VERSION").to_string(),
        protocol_version: PROTOCOL_VERSION,
        providers,
    })
}
