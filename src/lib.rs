use std::{sync::Arc, time::Duration};

use axum::{
    http::{header, Method},
    middleware,
    routing::{get, post},
    Router,
};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};

pub mod config;
pub mod domain;
pub mod errors;
pub mod http;
pub mod logging;
pub mod mcp;
pub mod session;

use config::AllowedOrigins;
use http::session_header::MCP_SESSION_ID;
use session::router::SessionRouter;

#[derive(Clone)]
pub struct AppState {
    pub router: Arc<SessionRouter>,
    pub allowed_origins: AllowedOrigins,
    pub stream_keep_alive: Duration,
}

impl AppState {
    pub fn new(
        router: Arc<SessionRouter>,
        allowed_origins: AllowedOrigins,
        stream_keep_alive: Duration,
    ) -> Self {
        Self {
            router,
            allowed_origins,
            stream_keep_alive,
        }
    }
}

pub fn build_app(state: AppState) -> Router {
    let cors = build_cors(&state.allowed_origins);

    Router::new()
        .route("/health", get(http::handlers::health))
        .route("/.well-known/mcp", get(http::handlers::discovery))
        .route(
            http::handlers::MCP_ENDPOINT,
            post(http::handlers::mcp_submit)
                .get(http::handlers::mcp_stream)
                .delete(http::handlers::mcp_terminate),
        )
        .layer(cors)
        .layer(middleware::from_fn(logging::request_logging_middleware))
        .with_state(state)
}

fn build_cors(origins: &AllowedOrigins) -> CorsLayer {
    let allow_origin = match origins {
        AllowedOrigins::Any => AllowOrigin::from(Any),
        AllowedOrigins::List(list) => AllowOrigin::list(list.iter().cloned()),
    };

    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers([
            header::CONTENT_TYPE,
            header::ACCEPT,
            MCP_SESSION_ID.clone(),
        ])
        .expose_headers([MCP_SESSION_ID.clone()])
}
