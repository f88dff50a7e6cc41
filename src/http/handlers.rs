//! Axum HTTP handlers for the web server
//!
//! Provides the session-aware Model Context Protocol endpoint and general metadata
//! endpoints. Each `/mcp` handler only translates HTTP into the session router's
//! vocabulary.

use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    Json,
};
use axum_extra::{typed_header::TypedHeaderRejection, TypedHeader};
use futures_util::{Stream, StreamExt};
use serde::Serialize;
use serde_json::Value;
use tracing::warn;

use crate::errors::AppError;
use crate::http::session_header::McpSessionId;
use crate::AppState;

pub const MCP_ENDPOINT: &str = "/mcp";

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

#[derive(Debug, Serialize)]
pub struct DiscoveryResponse {
    pub name: &'static str,
    pub version: &'static str,
    pub mcp_endpoint: &'static str,
    pub session_header: &'static str,
    pub tools: Vec<String>,
}

pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

pub async fn discovery(State(state): State<AppState>) -> Json<DiscoveryResponse> {
    Json(DiscoveryResponse {
        name: env!("CARGO_PKG_NAME"),
        version: env!("CARGO_PKG_VERSION"),
        mcp_endpoint: MCP_ENDPOINT,
        session_header: "Mcp-Session-Id",
        tools: state
            .router
            .registry()
            .definitions()
            .into_iter()
            .map(|tool| tool.name)
            .collect(),
    })
}

type SessionHeader = Result<TypedHeader<McpSessionId>, TypedHeaderRejection>;

/// Resolves the optional session header. A header that is present but malformed is a client
/// error, distinct from an absent one.
fn session_id(header: &SessionHeader) -> Result<Option<&str>, AppError> {
    match header {
        Ok(TypedHeader(id)) => Ok(Some(id.as_str())),
        Err(rejection) if rejection.is_missing() => Ok(None),
        Err(rejection) => {
            warn!(error = %rejection, "malformed session header");
            Err(AppError::bad_request(
                "invalid_session_id",
                "Mcp-Session-Id must be non-empty visible ASCII",
            ))
        }
    }
}

pub async fn mcp_submit(
    State(state): State<AppState>,
    session: SessionHeader,
    body: Bytes,
) -> Result<Response, AppError> {
    let payload: Value = serde_json::from_slice(&body)
        .map_err(|_| AppError::bad_request("parse_error", "request body must be valid JSON"))?;

    let exchange = state.router.submit(session_id(&session)?, payload).await?;

    let response = match (exchange.created_session, exchange.reply) {
        (Some(created), Some(reply)) => (
            StatusCode::OK,
            TypedHeader(McpSessionId(created.to_string())),
            Json(reply),
        )
            .into_response(),
        (_, Some(reply)) => (StatusCode::OK, Json(reply)).into_response(),
        (_, None) => StatusCode::ACCEPTED.into_response(),
    };
    Ok(response)
}

pub async fn mcp_stream(
    State(state): State<AppState>,
    session: SessionHeader,
) -> Result<Sse<impl Stream<Item = Result<Event, axum::Error>>>, AppError> {
    let events = state.router.open_stream(session_id(&session)?).await?;

    let frames = events.map(|event| Event::default().event(event.event).json_data(event.data));
    Ok(Sse::new(frames).keep_alive(KeepAlive::new().interval(state.stream_keep_alive)))
}

pub async fn mcp_terminate(
    State(state): State<AppState>,
    session: SessionHeader,
) -> StatusCode {
    // malformed ids are acknowledged like absent ones
    let id = session_id(&session).ok().flatten();
    state.router.terminate(id).await;
    StatusCode::NO_CONTENT
}
