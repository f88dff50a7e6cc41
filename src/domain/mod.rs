//! Procedure registry and the built-in tools exposed over the MCP protocol

pub mod registry;
pub mod tools;
