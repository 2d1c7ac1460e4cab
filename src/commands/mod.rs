//! Outer JSON-RPC method handlers organized by domain.
//!
//! Each submodule holds the handlers of one method family. [`dispatch`] routes
//! a decoded request to its handler and renders the result as JSON.

pub mod agent;
pub mod initialize;
pub mod permissions;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::api::types::{
    ApiError, METHOD_AGENT_ABORT, METHOD_AGENT_RUN, METHOD_INITIALIZE, METHOD_PERMISSION_RESPOND,
};
use crate::runtime::worker::BridgeWorker;

/// Handle one outer request.
///
/// # Errors
///
/// - `MethodNotFound` for an unknown method
/// - `InvalidInput` when params do not match the method
/// - whatever the handler rejects synchronously
pub async fn dispatch(worker: &BridgeWorker, method: &str, params: Value) -> Result<Value, ApiError> {
    match method {
        METHOD_INITIALIZE => render(initialize::initialize(worker, parse(method, params)?).await?),
        METHOD_AGENT_RUN => render(agent::agent_run(worker, parse(method, params)?).await?),
        METHOD_AGENT_ABORT => render(agent::agent_abort(worker, parse(method, params)?)),
        METHOD_PERMISSION_RESPOND => {
            render(permissions::permission_respond(worker, parse(method, params)?))
        }
        _ => Err(ApiError::MethodNotFound {
            method: method.to_string(),
        }),
    }
}

/// Handle one outer notification. Only `agent.abort` is meaningful.
pub fn notify(worker: &BridgeWorker, method: &str, params: Value) {
    match method {
        METHOD_AGENT_ABORT => match parse(method, params) {
            Ok(params) => {
                agent::agent_abort(worker, params);
            }
            Err(e) => log::warn!("Ignoring malformed agent.abort notification: {e}"),
        },
        _ => log::debug!("Ignoring notification: method={method}"),
    }
}

fn parse<T: DeserializeOwned>(method: &str, params: Value) -> Result<T, ApiError> {
    serde_json::from_value(params).map_err(|e| ApiError::InvalidInput {
        message: format!("Invalid params for {method}: {e}"),
    })
}

fn render<T: Serialize>(result: T) -> Result<Value, ApiError> {
    serde_json::to_value(result).map_err(|e| ApiError::protocol(format!("Failed to serialize result: {e}")))
}
