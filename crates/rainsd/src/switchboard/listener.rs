//! Accept loop for inbound TLS connections.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::net::TcpListener;
use tokio::sync::broadcast;

use super::Switchboard;

/// Pause after a failed accept so a persistent error (e.g. EMFILE) does
/// not spin.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

pub struct Listener {
    listener: TcpListener,
    switchboard: Arc<Switchboard>,
    shutdown: broadcast::Receiver<()>,
}

impl Listener {
    pub fn new(
        listener: TcpListener,
        switchboard: Arc<Switchboard>,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            listener,
            switchboard,
            shutdown,
        }
    }

    pub async fn run(mut self) -> Result<()> {
        tracing::info!(local = %self.switchboard.local(), "listening for tls connections");

        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!("listener shutting down");
                    return Ok(());
                }

                result = self.listener.accept() => {
                    let (tcp, remote) = match result {
                        Ok(r) => r,
                        Err(e) => {
                            tracing::warn!(error = %e, "accept failed");
                            tokio::time::sleep(ACCEPT_BACKOFF).await;
                            continue;
                        }
                    };

                    // Handshake off the accept path.
                    let switchboard = self.switchboard.clone();
                    tokio::spawn(async move { switchboard.accept(tcp, remote).await });
                }
            }
        }
    }
}
