//! `permission.respond`: the host's answer to a `permission.request` event.

use crate::api::types::{PermissionRespondParams, PermissionRespondResult};
use crate::runtime::worker::BridgeWorker;

/// Respond to a pending permission request.
///
/// # Arguments
///
/// * `params` - The request id from the `permission.request` event and the
///   user's decision
///
/// # Returns
///
/// `{ok: true}`, or `{ok: false, reason: "not_found"}` when the request already
/// resolved (answered, timed out or torn down) or never existed.
pub fn permission_respond(worker: &BridgeWorker, params: PermissionRespondParams) -> PermissionRespondResult {
    log::info!(
        "permission.respond: request_id={}, behavior={:?}",
        params.request_id,
        params.decision.behavior
    );
    match worker
        .permission_hub()
        .respond(&params.request_id, params.decision)
    {
        Ok(()) => PermissionRespondResult::ok(),
        Err(_) => PermissionRespondResult::not_found(),
    }
}
