//! Tithe Binary Entry Point
//!
//! Loads the agent configuration, starts every enabled plugin, and runs until
//! an interrupt, terminate, or hangup signal arrives.

use std::time::Duration;

use clap::Parser;
use tithe::{AgentConfig, CollectorFactory, HttpSubmitClient, Manager, ManagerHandle};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// How long to wait for workers after the tick loop exits.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Tithe - Lightweight Telemetry Agent
#[derive(Parser, Debug)]
#[command(name = "tithe", version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(
        short,
        long,
        default_value = "/etc/tithe/tithe.yaml",
        env = "TITHE_CONFIG"
    )]
    config: String,

    /// Enable debug logging
    #[arg(short = 'D', long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize tracing
    let default_filter = if cli.debug {
        "debug,tithe=debug"
    } else {
        "info,tithe=info"
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Tithe - Lightweight Telemetry Agent");

    tracing::info!("Loading configuration from: {}", cli.config);
    let config = AgentConfig::load(&cli.config).inspect_err(|e| {
        tracing::error!(error = %e, "Invalid configuration");
    })?;

    tracing::info!(
        url = %config.main.submission_url,
        plugins = ?config.main.plugins_enabled,
        schedule = %config.main.schedule,
        "Configuration loaded"
    );

    let client = HttpSubmitClient::from_config(&config.main);
    let factory = CollectorFactory::with_builtins();

    // Installed before startup so a signal during construction retries still
    // takes the graceful path.
    let handle = ManagerHandle::default();
    tokio::spawn(shutdown_signal(handle.clone()));

    let mut manager = Manager::start(&config, &factory, Box::new(client), handle).await?;

    tracing::info!("Press Ctrl+C to shutdown");
    manager.run().await;

    if !manager.join(SHUTDOWN_GRACE).await {
        tracing::warn!(
            grace_s = SHUTDOWN_GRACE.as_secs(),
            "Some workers did not finish in time"
        );
    }

    tracing::info!("Shutdown complete");
    Ok(())
}

/// Route every termination signal to the manager's stop handle.
async fn shutdown_signal(handle: ManagerHandle) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(unix)]
    let hangup = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    #[cfg(not(unix))]
    let hangup = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            tracing::info!("Received terminate signal");
        }
        _ = hangup => {
            tracing::info!("Received hangup signal");
        }
    }

    handle.stop();
}
