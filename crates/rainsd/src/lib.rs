//! rainsd — RAINS authoritative server dispatch pipeline.
//!
//! `Server::start` binds the listener and wires switchboard, inbox, outbox
//! and worker pools together; everything stops when the shutdown channel
//! fires.

pub mod conn_cache;
pub mod inbox;
pub mod switchboard;
pub mod tls;
pub mod worker;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use rains_core::config::RainsConfig;
use rains_core::crypto::SignatureVerifier;
use rains_core::framer::NewLineFramer;
use rains_core::ConnInfo;

use conn_cache::ConnectionCache;
use inbox::queues::QueueDepths;
use inbox::Inbox;
use switchboard::listener::Listener;
use switchboard::send_worker::{Outbox, SendWorker};
use switchboard::Switchboard;
use tls::TlsContext;
use worker::SectionHandler;

/// Point-in-time counters for the periodic stats line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerStats {
    pub connections: usize,
    pub dials: u64,
    pub active_tokens: usize,
    pub queues: QueueDepths,
    pub outbound: usize,
}

/// A running server.
pub struct Server {
    local_addr: SocketAddr,
    switchboard: Arc<Switchboard>,
    inbox: Arc<Inbox>,
    outbox: Outbox,
    tasks: Vec<JoinHandle<()>>,
}

impl Server {
    /// Bind `config.server.listen_addr` and spawn every task.
    ///
    /// Fails only if a cache has zero capacity or the listener cannot bind.
    pub async fn start(
        config: &RainsConfig,
        tls: TlsContext,
        verifier: Arc<dyn SignatureVerifier>,
        handler: Arc<dyn SectionHandler>,
        shutdown: broadcast::Sender<()>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(config.server.listen_addr)
            .await
            .with_context(|| format!("failed to bind {}", config.server.listen_addr))?;
        let local_addr = listener.local_addr()?;
        let local = ConnInfo::from(local_addr);

        let cache = Arc::new(
            ConnectionCache::new(config.caches.max_connections)
                .context("failed to create connection cache")?,
        );
        let (queues, receivers) = inbox::queues::channels(&config.limits);
        let (outbox, outbound_rx) = Outbox::channel(config.limits.outbound_buffer_size);

        let inbox = Arc::new(
            Inbox::new(config, verifier, queues, outbox.clone())
                .context("failed to create inbox caches")?,
        );

        let switchboard = Arc::new(Switchboard::new(
            local,
            cache,
            tls,
            Arc::new(NewLineFramer),
            inbox.clone(),
            config.limits.max_msg_byte_length,
            config.timeouts.clone(),
            shutdown.clone(),
        ));

        let mut tasks = worker::spawn_pools(&config.limits, &receivers, handler, &shutdown);

        let listener_task = Listener::new(listener, switchboard.clone(), shutdown.subscribe());
        tasks.push(tokio::spawn(async move {
            if let Err(e) = listener_task.run().await {
                tracing::error!(error = %e, "listener exited");
            }
        }));

        let send_worker = SendWorker::new(switchboard.clone(), outbound_rx, shutdown.subscribe());
        tasks.push(tokio::spawn(async move {
            if let Err(e) = send_worker.run().await {
                tracing::error!(error = %e, "send worker exited");
            }
        }));

        tracing::info!(addr = %local_addr, "rainsd started");

        Ok(Self {
            local_addr,
            switchboard,
            inbox,
            outbox,
            tasks,
        })
    }

    /// The bound listen address (useful when configured with port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn inbox(&self) -> &Arc<Inbox> {
        &self.inbox
    }

    pub fn switchboard(&self) -> &Arc<Switchboard> {
        &self.switchboard
    }

    pub fn stats(&self) -> ServerStats {
        ServerStats {
            connections: self.switchboard.connection_count(),
            dials: self.switchboard.dial_count(),
            active_tokens: self.inbox.active_token_count(),
            queues: self.inbox.queue_depths(),
            outbound: self.outbox.depth(),
        }
    }

    /// Wait for every task to stop, then close what is left in the cache.
    /// Call after firing the shutdown channel.
    pub async fn join(self) {
        for task in self.tasks {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "server task panicked");
            }
        }
        self.switchboard.close_all();
        tracing::info!("rainsd stopped");
    }
}
