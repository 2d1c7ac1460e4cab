//! Protocol layer - abstractions and implementations for backend communication.
//!
//! This module provides:
//! - `AgentBackend` trait: runtime → protocol abstraction boundary
//! - `RunHost` trait: protocol → runtime callback boundary
//! - `jsonrpc`: line-delimited JSON-RPC framing and correlation
//! - `claude`: Claude Code print-stream / control-protocol adapter
//! - `codex`: Codex app-server adapter (nested JSON-RPC)
//!
//! Key design principle: The protocol layer does NOT hold run bookkeeping.
//! That is captured by the RunHost implementation provided by the runtime.

pub mod backend;
pub mod claude;
pub mod codex;
pub mod host;
pub mod jsonrpc;

pub use backend::AgentBackend;
pub use host::RunHost;
