//! MCP session lifecycle
//!
//! A session starts with a successful `initialize` exchange and is identified by the
//! `Mcp-Session-Id` header on every later exchange. The [`store::SessionStore`] owns the
//! live sessions, each session exclusively owns its [`transport::SessionTransport`], and
//! the [`router::SessionRouter`] decides how every inbound exchange maps onto them.

pub mod router;
pub mod store;
pub mod transport;

use std::{borrow::Borrow, fmt};

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::errors::AppError;
use transport::SessionTransport;

/// Opaque session token handed to the client after `initialize`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub(crate) fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for SessionId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Serving request/response exchanges.
    Active,
    /// A server-push stream is open.
    Streaming,
    /// The transport has been released.
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Active => write!(f, "active"),
            SessionState::Streaming => write!(f, "streaming"),
            SessionState::Closed => write!(f, "closed"),
        }
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session not found: {0}")]
    NotFound(String),
    #[error("session {0} already has an open stream")]
    StreamAlreadyOpen(SessionId),
}

impl From<SessionError> for AppError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::NotFound(session_id) => AppError::session_not_found(session_id),
            SessionError::StreamAlreadyOpen(_) => AppError::conflict(
                "stream_already_open",
                "session already has an open event stream",
            ),
        }
    }
}

/// Handshake details recorded when a session is created.
#[derive(Debug, Clone)]
pub struct SessionInit {
    pub protocol_version: String,
    pub client_name: Option<String>,
}

#[derive(Debug)]
pub struct Session {
    id: SessionId,
    protocol_version: String,
    client_name: Option<String>,
    created_at: DateTime<Utc>,
    transport: SessionTransport,
}

impl Session {
    pub(crate) fn new(id: SessionId, init: SessionInit, transport: SessionTransport) -> Self {
        Self {
            id,
            protocol_version: init.protocol_version,
            client_name: init.client_name,
            created_at: Utc::now(),
            transport,
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn protocol_version(&self) -> &str {
        &self.protocol_version
    }

    pub fn client_name(&self) -> Option<&str> {
        self.client_name.as_deref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn transport(&self) -> &SessionTransport {
        &self.transport
    }

    pub fn state(&self) -> SessionState {
        self.transport.state()
    }
}
