//! Runtime modules for the bridge worker.
//!
//! The runtime domain handles worker-level concepts like the run slot,
//! cancellation, permission negotiation and backend discovery. Backend wire
//! details stay in `protocols`.

pub mod agent_host;
pub mod cancellation;
pub mod env;
pub mod permissions;
pub mod process;
pub mod providers;
pub mod server;
pub mod worker;
