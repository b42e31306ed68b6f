//! Orchestrates the postbox application startup and component lifecycle.
//!
//! This library crate initializes configuration and concurrently runs the
//! primary services (SMTP, health check). If either essential service
//! terminates unexpectedly the application shuts down; on SIGINT the SMTP
//! acceptor stops and live sessions are drained before exit.

pub mod config;
pub mod health;
pub mod relay;
pub mod repository;
pub mod smtp;

use std::sync::Arc;

use anyhow::Result;
use log::{error, info};
use tokio::select;

use crate::relay::{LoggingRelay, RelayQueue};
use crate::repository::{MemoryRepository, Repository};
use crate::smtp::Address;

/// Runs the main postbox application logic.
///
/// Loads configuration, builds the repository and relay collaborators, then
/// launches the SMTP and health check servers as separate tasks and monitors
/// them with `tokio::select!`. Returns when a fatal startup error occurs,
/// when either server task stops unexpectedly, or after a clean
/// signal-triggered shutdown.
pub async fn run() -> Result<()> {
    info!(
        "Starting {} v{} inbound-SMTP server",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION")
    );

    // Load configuration; exit early if configuration is invalid or missing.
    let config = match config::Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return Err(e);
        }
    };

    rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .ok();

    let mailboxes = config
        .mailboxes
        .iter()
        .map(|raw| Address::parse(raw))
        .collect::<Result<Vec<_>>>()
        .map_err(|e| {
            error!("Invalid POSTBOX_MAILBOXES entry: {}", e);
            e
        })?;
    let repository: Arc<dyn Repository> = Arc::new(MemoryRepository::with_mailboxes(mailboxes));
    let relay: Arc<dyn RelayQueue> = Arc::new(LoggingRelay);

    let health_config = config.clone();
    let server = Arc::new(smtp::Server::new(config, repository, relay)?);

    // Spawn the health check server task.
    let sessions = server.sessions();
    let health_handle = tokio::spawn(async move {
        if let Err(e) = health::run_health_server(health_config, sessions).await {
            error!("Health check server encountered a fatal error: {}", e);
            Err(e)
        } else {
            // A server task exiting cleanly is unexpected for a long-running service.
            Ok(())
        }
    });

    // Spawn the main SMTP server task.
    let smtp_server = Arc::clone(&server);
    let smtp_handle = tokio::spawn(async move {
        if let Err(e) = smtp_server.run().await {
            error!("SMTP server encountered a fatal error: {}", e);
            Err(e)
        } else {
            Ok(())
        }
    });

    // Monitor both server tasks; the first to finish decides the outcome.
    // A shutdown signal instead triggers a graceful drain.
    select! {
        res = health_handle => {
            error!("Health check server task terminated.");
            match res {
                Ok(Ok(())) => Err(anyhow::anyhow!("Health check server exited cleanly, which is unexpected.")),
                Ok(Err(e)) => Err(e),
                Err(join_error) => Err(anyhow::anyhow!("Health check server task failed: {}", join_error)),
            }
        },
        res = smtp_handle => {
            error!("SMTP server task terminated.");
            match res {
                Ok(Ok(())) => Err(anyhow::anyhow!("SMTP server exited cleanly, which is unexpected.")),
                Ok(Err(e)) => Err(e),
                Err(join_error) => Err(anyhow::anyhow!("SMTP server task failed: {}", join_error)),
            }
        },
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received, draining sessions.");
            server.shutdown().await;
            Ok(())
        },
    }
}
