//! Analytics processor: relays `order-created` events into `PostgreSQL` and
//! the `stream-analytics` topic.
//!
//! The binary in `main.rs` wires the adapters together; this library holds
//! the pieces worth testing on their own.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;

pub use config::{Config, ConfigError};

/// Wait for Ctrl+C or SIGTERM.
///
/// If no signal handler can be installed this never returns, so the
/// processor keeps running rather than shutting down spuriously.
pub async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => tracing::info!("Received Ctrl+C"),
                    _ = sigterm.recv() => tracing::info!("Received SIGTERM"),
                }
                return;
            },
            Err(e) => tracing::warn!(error = %e, "Failed to register SIGTERM handler"),
        }
    }

    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("Received Ctrl+C"),
        Err(e) => {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        },
    }
}
