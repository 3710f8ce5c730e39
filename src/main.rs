//! contact-server: a small TCP contact menu
//!
//! Clients connect with `nc`/`telnet`, get a banner and a numbered list of
//! contact links, and pick entries by number until they quit.
//!
//! Features:
//! - Per-address sliding window rate limiting
//! - Global cap on concurrent sessions
//! - Absolute and idle timeouts per session, bounded input lines
//! - Graceful shutdown on SIGINT/SIGTERM with a bounded drain
//! - Configuration via CLI arguments or TOML file

mod admission;
mod config;
mod protocol;
mod rate_limit;
mod server;
mod session;

use config::Config;
use server::Server;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        listen = %config.listen,
        workers = ?config.workers,
        max_connections = config.max_connections,
        max_input_size = config.max_input_size,
        conn_timeout = ?config.conn_timeout,
        read_timeout = ?config.read_timeout,
        rate_limit_max = config.rate_limit_max,
        rate_limit_window = ?config.rate_limit_window,
        contacts = config.contacts.len(),
        "Starting contact-server"
    );

    let mut builder = tokio::runtime::Builder::new_multi_thread();
    if let Some(workers) = config.workers {
        builder.worker_threads(workers);
    }
    let runtime = builder.enable_all().build()?;

    runtime.block_on(async move {
        let server = Server::bind(config).await?;
        server.run(shutdown_signal()).await
    })?;

    info!("Server shutdown complete");
    Ok(())
}

/// Wait for Ctrl+C, or SIGTERM on Unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
