//! API types for the host-worker bridge.
//!
//! This module defines stable types for the outer JSON-RPC methods and the
//! unified event stream, isolating backend complexity from the host.

pub mod events;
pub mod types;
