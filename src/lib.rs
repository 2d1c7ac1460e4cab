//! Agent bridge: runs external coding agents behind one JSON-RPC surface.
//!
//! The worker binary serves the outer protocol on stdio (see
//! [`runtime::server`]); hosts drive it through [`client::BridgeClient`].

pub mod api;
pub mod client;
pub mod commands;
pub mod config;
pub mod protocols;
pub mod runtime;
