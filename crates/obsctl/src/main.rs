//! obsctl: work against a multi-tenant Observatorium API as one of several
//! saved contexts.
//!
//! - Manages the API/tenant context registry
//! - Logs tenants in through OIDC client credentials
//! - Issues tenant-scoped requests directly
//! - Serves the current tenant's namespace through a local reverse proxy

use clap::Parser;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod commands;
mod config;
mod error;
mod proxy;

use config::{Config, LogFormat};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::parse();
    init_logging(&config);

    tracing::debug!("Starting obsctl v{}", env!("CARGO_PKG_VERSION"));
    commands::run(config).await
}

/// Install the global subscriber. `RUST_LOG` takes precedence over
/// `--log.level`.
fn init_logging(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.to_string()));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    match config.log_format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Logfmt => builder.init(),
        LogFormat::Clilog => builder.compact().without_time().with_target(false).init(),
    }
}

/// Resolves on Ctrl+C or SIGTERM.
pub(crate) async fn shutdown_signal() {
    let ctrl_c = async {
        match signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl+C, initiating shutdown"),
            Err(e) => {
                warn!("Failed to install Ctrl+C handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
                info!("Received SIGTERM, initiating shutdown");
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
