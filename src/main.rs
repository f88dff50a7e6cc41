use std::sync::Arc;

use mcp_session_server::{
    build_app, config::Config, domain::tools::build_registry, logging,
    session::router::SessionRouter, AppState,
};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    logging::init_logging();

    let config = Config::from_env()?;
    let registry = Arc::new(build_registry()?);

    let router = Arc::new(SessionRouter::new(registry));
    let bind_socket = config.bind_socket()?;
    let state = AppState::new(
        router.clone(),
        config.allowed_origins.clone(),
        config.stream_keep_alive,
    );
    let app = build_app(state);
    let listener = tokio::net::TcpListener::bind(bind_socket).await?;

    info!(
        bind_addr = %config.bind_addr,
        bind_port = config.bind_port,
        "server starting"
    );

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal(router))
        .await?;
    Ok(())
}

async fn shutdown_signal(router: Arc<SessionRouter>) {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to listen for shutdown signal");
    }
    info!("shutdown requested");
    router.shutdown().await;
}
