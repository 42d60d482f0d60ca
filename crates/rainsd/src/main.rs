//! rainsd — RAINS authoritative server.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use rains_core::config::RainsConfig;
use rains_core::crypto::Ed25519Verifier;

use rainsd::tls::TlsContext;
use rainsd::worker::TracingHandler;
use rainsd::Server;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load config
    if let Err(e) = RainsConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = RainsConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        RainsConfig::default()
    });
    tracing::info!(
        listen = %config.server.listen_addr,
        max_msg = config.limits.max_msg_byte_length,
        max_connections = config.caches.max_connections,
        "rainsd starting"
    );

    let tls = TlsContext::from_settings(&config.tls).context("failed to set up tls")?;

    // ── Shutdown channel ─────────────────────────────────────────────────────
    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);

    {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            let _ = shutdown.send(());
        });
    }

    // ── Start server ─────────────────────────────────────────────────────────
    let server = Server::start(
        &config,
        tls,
        Arc::new(Ed25519Verifier::new()),
        Arc::new(TracingHandler),
        shutdown_tx.clone(),
    )
    .await?;

    let mut shutdown_rx = shutdown_tx.subscribe();
    let mut interval = tokio::time::interval(Duration::from_secs(10));
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                tracing::info!("shutting down");
                break;
            }
            _ = interval.tick() => {
                let stats = server.stats();
                tracing::info!(
                    connections = stats.connections,
                    dials = stats.dials,
                    active_tokens = stats.active_tokens,
                    prio_queue = stats.queues.prio,
                    normal_queue = stats.queues.normal,
                    notification_queue = stats.queues.notification,
                    outbound_queue = stats.outbound,
                    "server stats"
                );
            }
        }
    }

    server.join().await;
    Ok(())
}
