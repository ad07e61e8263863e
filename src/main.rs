use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use ratewarden::config::{EnvSettings, ServiceConfig};
use ratewarden::http::HttpServer;
use ratewarden::ratelimit::{Clock, LimiterRegistry, LimiterStatus, Provider, SystemClock};

/// Log output format.
#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

/// Request-rate admission control service.
#[derive(Parser, Debug)]
#[command(name = "ratewarden", version, about)]
struct Args {
    /// Path to a YAML configuration file
    #[arg(short, long, env = "RATEWARDEN_CONFIG")]
    config: Option<PathBuf>,

    /// Override the HTTP listen address
    #[arg(long)]
    http_addr: Option<std::net::SocketAddr>,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match args.log_format {
        LogFormat::Text => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
    }

    info!("Starting Ratewarden admission control service");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut config = ServiceConfig::load(args.config.as_deref())?;
    if let Some(addr) = args.http_addr {
        config.server.http_addr = addr;
    }
    info!(http_addr = %config.server.http_addr, limiters = config.limiters.len(), "Configuration loaded");

    let env = EnvSettings::from_env();
    let status = LimiterStatus::from_settings(&env);
    if status.provider == Provider::Misconfigured {
        warn!(
            provider = %status.provider,
            "Production is running without a distributed store; quotas are per instance"
        );
    }

    // Initialize the limiters
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let registry = Arc::new(LimiterRegistry::from_config(&config, &env, clock.clone())?);
    info!(provider = %registry.provider(), "Rate limiters initialized");

    let sweeper = registry.spawn_sweeper(config.server.sweep_interval());

    let server = HttpServer::new(config.server.http_addr, registry, clock);

    // Run the server with graceful shutdown on Ctrl+C
    server.serve_with_shutdown(shutdown_signal()).await?;

    sweeper.shutdown().await;
    info!("Ratewarden admission control service stopped");
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
