//! JSON-RPC framing and MCP method dispatch for a single session exchange

pub mod rpc;
pub mod server;
