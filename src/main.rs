//! Gatekeeper gateway.
//!
//! ```text
//!                    ┌──────────────────────────────────────────────────┐
//!                    │                    GATEKEEPER                    │
//!   Client Request   │  ┌───────────┐   ┌──────────────┐   ┌─────────┐  │
//!  ──────────────────┼─▶│ admission │──▶│ forward      │──▶│ breaker │──┼──▶ Upstream
//!                    │  │ rate limit│   │ handler      │   │ + retry │  │
//!  ◀─────────────────┼──│ 429 / 503 │◀──│              │◀──│         │◀─┼───
//!   Client Response  │  └───────────┘   └──────────────┘   └─────────┘  │
//!                    │                                                  │
//!                    │  GuardRegistry · Shutdown · metrics · admin API  │
//!                    └──────────────────────────────────────────────────┘
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::net::TcpListener;

use gatekeeper::clock::SystemClock;
use gatekeeper::config::{load_config, GatekeeperConfig};
use gatekeeper::guard::GuardRegistry;
use gatekeeper::http::GatewayServer;
use gatekeeper::lifecycle::{wait_for_signal, Shutdown};
use gatekeeper::observability::{logging::init_logging, metrics::init_metrics};

/// How often idle limiter and breaker keys are swept.
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Parser)]
#[command(name = "gatekeeper", version)]
#[command(about = "Rate limiting and circuit breaking gateway", long_about = None)]
struct Args {
    /// Path to a TOML config file; defaults are used when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let config = match &args.config {
        Some(path) => load_config(path)?,
        None => GatekeeperConfig::default(),
    };

    init_logging(&config.observability)?;
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "gatekeeper starting");
    tracing::info!(
        bind_address = %config.listener.bind_address,
        upstream = %config.upstream.base_url,
        request_timeout_secs = config.listener.request_timeout_secs,
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse::<SocketAddr>() {
            Ok(addr) => {
                if let Err(e) = init_metrics(addr) {
                    tracing::error!(error = %e, "Failed to start metrics exporter");
                }
            }
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let registry = GuardRegistry::builder(Arc::new(SystemClock::new()))
        .event_capacity(config.observability.event_capacity)
        .build();

    let shutdown = Shutdown::new();
    let maintenance = registry.spawn_maintenance(MAINTENANCE_INTERVAL, shutdown.subscribe());

    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = wait_for_signal().await {
            tracing::error!(error = %e, "Failed to listen for shutdown signals");
        }
        signal_shutdown.trigger();
    });

    let listener = TcpListener::bind(&config.listener.bind_address).await?;
    tracing::info!(address = %listener.local_addr()?, "Listening for connections");

    let server = GatewayServer::new(config, registry)?;
    server.run(listener, shutdown.subscribe()).await?;

    shutdown.trigger();
    let _ = maintenance.await;

    tracing::info!("Shutdown complete");
    Ok(())
}
