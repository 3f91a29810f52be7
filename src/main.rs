use std::net::SocketAddr;
use std::process::ExitCode;

use tokio::net::TcpListener;
use tracing::{error, info, warn};

use static_shield::config::LogFormat;
use static_shield::{AppState, Config, build_router, metrics, utils};

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::from(exitcode::OK as u8),
        Err(exit_code) => ExitCode::from(exit_code as u8),
    }
}

/// Run the application, returning an exit code on error.
async fn run() -> Result<(), exitcode::ExitCode> {
    // Load configuration (logging format depends on it)
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            utils::init_tracing("info", LogFormat::Text);
            error!("Configuration error: {e}");
            return Err(exitcode::CONFIG);
        }
    };
    utils::init_tracing(&config.log_level, config.log_format);

    info!(
        "Starting static_shield v{}",
        env!("CARGO_PKG_VERSION")
    );
    info!(
        host = %config.host,
        port = %config.port,
        environment = %config.environment,
        static_root = %config.static_root.display(),
        "Configuration loaded"
    );
    if config.secret_key.is_ephemeral() {
        warn!(
            environment = %config.environment,
            "SECRET_KEY not set, using an ephemeral key; CSRF tokens will not survive a restart"
        );
    }

    // Prometheus exporter (optional)
    if let Some(metrics_addr) = config.metrics_addr() {
        metrics::try_init_metrics(metrics_addr);
    }

    // Build application state and router
    let state = AppState::new(config.clone()).map_err(|e| {
        error!("Failed to initialize application state: {e}");
        exitcode::CONFIG
    })?;
    let app = build_router(state.clone());

    // Start server
    let addr: SocketAddr = config.server_addr().parse().map_err(|e| {
        error!("Invalid server address: {e}");
        exitcode::CONFIG
    })?;
    let listener = TcpListener::bind(addr).await.map_err(|e| {
        error!("Failed to bind to {addr}: {e}");
        exitcode::UNAVAILABLE
    })?;

    info!("Server listening on http://{addr}");
    info!("Endpoints:");
    info!("  GET  /          - Index document");
    info!("  GET  /health    - Health check");
    info!("  GET  /{{path}}    - Static assets");

    // Peer address is needed for client identity
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(utils::shutdown_signal())
    .await
    .map_err(|e| {
        error!("Server error: {e}");
        exitcode::SOFTWARE
    })?;

    // Gracefully shutdown background tasks
    info!("HTTP server stopped, shutting down background tasks...");
    state.shutdown().await;

    info!(uptime_secs = state.uptime_seconds(), "Server shutdown complete");
    Ok(())
}
