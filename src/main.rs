use std::net::SocketAddr;
use std::process::ExitCode;

use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use portal_guard::config::LogFormat;
use portal_guard::{AppState, Config, build_router, metrics, utils};

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::from(exitcode::OK as u8),
        Err(exit_code) => ExitCode::from(exit_code as u8),
    }
}

fn init_tracing(format: LogFormat, level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true);

    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Pretty => builder.init(),
    }
}

/// Run the application, returning an exit code on error.
async fn run() -> Result<(), exitcode::ExitCode> {
    // Configuration is loaded before logging so LOG_FORMAT can take effect;
    // a configuration error is reported on stderr.
    let config = Config::from_env().map_err(|e| {
        eprintln!("Configuration error: {e}");
        exitcode::CONFIG
    })?;

    init_tracing(config.log_format, &config.log_level);
    info!("Starting portal_guard v{}", env!("CARGO_PKG_VERSION"));
    info!(
        host = %config.host,
        port = %config.port,
        key_source = if config.jwks_url.is_some() { "jwks" } else { "static" },
        audit_log = ?config.audit_log_path,
        "Configuration loaded"
    );

    if let Some(addr) = config.metrics_addr() {
        metrics::try_init_metrics(addr);
    } else {
        info!("Metrics disabled (METRICS_PORT=0)");
    }

    let state = AppState::new(config.clone()).await.map_err(|e| {
        error!("Failed to initialize application state: {e}");
        match e {
            portal_guard::AppError::Audit(_) => exitcode::IOERR,
            _ => exitcode::CONFIG,
        }
    })?;
    let app = build_router(state.clone()).map_err(|e| {
        error!("Failed to build router: {e}");
        exitcode::CONFIG
    })?;

    let addr: SocketAddr = config.server_addr().parse().map_err(|e| {
        error!("Invalid server address: {e}");
        exitcode::CONFIG
    })?;
    let listener = TcpListener::bind(addr).await.map_err(|e| {
        error!("Failed to bind to {addr}: {e}");
        exitcode::UNAVAILABLE
    })?;

    info!("Server listening on http://{addr}");
    info!("API endpoints:");
    info!("  GET    /health                       - Health check");
    info!("  GET    /ready                        - Readiness check");
    info!("  GET    /auth/me                      - Current identity");
    info!("  POST   /auth/session                 - Admin login");
    info!("  DELETE /auth/session                 - Admin logout");
    info!("  GET    /admin/audit-log              - Audit trail");
    info!("  POST   /admin/session-secret/rotate  - Rotate session secret");

    // Client addresses are needed for rate-limit keys.
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

    info!("HTTP server stopped, shutting down background tasks...");
    state.shutdown().await;

    info!("Server shutdown complete");
    Ok(())
}
