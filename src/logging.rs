use std::time::Instant;

use axum::{extract::Request, http::StatusCode, middleware::Next, response::Response};
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use crate::http::session_header::MCP_SESSION_ID;

pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}

pub async fn request_logging_middleware(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let request_session = session_header(request.headers());
    let started_at = Instant::now();

    let response = next.run(request).await;
    let status = response.status();
    let elapsed_ms = started_at.elapsed().as_millis();
    let session_id = request_session.or_else(|| session_header(response.headers()));

    info!(
        method = %method,
        path = %path,
        status = status.as_u16(),
        duration_ms = elapsed_ms,
        session_id = session_id.as_deref().unwrap_or("-"),
        "request summary"
    );

    if matches!(status, StatusCode::BAD_REQUEST | StatusCode::NOT_FOUND)
        && path.starts_with(crate::http::handlers::MCP_ENDPOINT)
    {
        warn!(method = %method, path = %path, status = status.as_u16(), "session request rejected");
    }

    response
}

fn session_header(headers: &axum::http::HeaderMap) -> Option<String> {
    headers
        .get(&MCP_SESSION_ID)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}
