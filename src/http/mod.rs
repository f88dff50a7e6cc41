//! HTTP Transport layer for the Model Context Protocol
//!
//! Provides the external API routing: `POST`, `GET` and `DELETE` on `/mcp`, plus metadata
//! endpoints.

pub mod handlers;
pub mod session_header;
