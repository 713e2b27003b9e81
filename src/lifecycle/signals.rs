//! OS signal handling.
//!
//! # Design Decisions
//! - Uses Tokio's signal handling (async-safe)
//! - SIGTERM and SIGINT both mean graceful shutdown

use std::io;

/// Resolve once SIGINT (Ctrl+C) or, on Unix, SIGTERM arrives.
pub async fn wait_for_signal() -> io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut terminate = signal(SignalKind::terminate())?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result?,
            _ = terminate.recv() => {}
        }
    }

    #[cfg(not(unix))]
    tokio::signal::ctrl_c().await?;

    tracing::info!("Shutdown signal received");
    Ok(())
}
