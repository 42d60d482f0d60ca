//! Switchboard — owns every TLS connection the server has.
//!
//! Inbound connections arrive through the `Listener`; outbound ones are
//! dialed on demand by `send_to`. Either way the connection is cached under
//! (our identity, peer) and gets a read loop feeding the inbox, so replies
//! to a peer reuse whichever connection it already has with us.

pub mod connection;
pub mod listener;
pub mod send_worker;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use rustls::pki_types::ServerName;
use tokio::io::ReadHalf;
use tokio::net::TcpStream;
use tokio::sync::broadcast;

use rains_core::config::TimeoutConfig;
use rains_core::framer::Framer;
use rains_core::ConnInfo;

use crate::conn_cache::{AddressPair, ConnectionCache};
use crate::inbox::Inbox;
use crate::tls::TlsContext;

use connection::{BoxedStream, PeerConnection, ReadLoop};

pub struct Switchboard {
    local: ConnInfo,
    cache: Arc<ConnectionCache>,
    tls: TlsContext,
    framer: Arc<dyn Framer>,
    inbox: Arc<Inbox>,
    max_frame: usize,
    timeouts: TimeoutConfig,
    shutdown: broadcast::Sender<()>,
    dials: AtomicU64,
}

impl Switchboard {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        local: ConnInfo,
        cache: Arc<ConnectionCache>,
        tls: TlsContext,
        framer: Arc<dyn Framer>,
        inbox: Arc<Inbox>,
        max_frame: usize,
        timeouts: TimeoutConfig,
        shutdown: broadcast::Sender<()>,
    ) -> Self {
        Self {
            local,
            cache,
            tls,
            framer,
            inbox,
            max_frame,
            timeouts,
            shutdown,
            dials: AtomicU64::new(0),
        }
    }

    /// Our own identity in cache keys.
    pub fn local(&self) -> ConnInfo {
        self.local
    }

    pub fn connection_count(&self) -> usize {
        self.cache.len()
    }

    /// Outbound connections established so far.
    pub fn dial_count(&self) -> u64 {
        self.dials.load(Ordering::Relaxed)
    }

    /// Send one encoded message to `receiver`, reusing a cached connection
    /// or dialing a new one.
    ///
    /// Failures are logged, never returned, and never retried. A cached
    /// connection that fails a write is evicted.
    pub async fn send_to(&self, message: &[u8], receiver: ConnInfo) {
        let frame = match self.framer.frame(message) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(peer = %receiver, error = %e, "message cannot be framed, dropping");
                return;
            }
        };
        let key = AddressPair::new(self.local, receiver);

        if let Some(conn) = self.cache.get(&key).filter(|c| !c.is_closed()) {
            match conn.write_frame(&frame, self.timeouts.write_timeout()).await {
                Ok(()) => {
                    tracing::debug!(peer = %receiver, len = frame.len(), "sent on cached connection");
                    self.cache.add(key, conn);
                }
                Err(e) => {
                    tracing::warn!(peer = %receiver, error = %e, "write on cached connection failed");
                    self.cache.remove_if_same(&key, &conn);
                    conn.close();
                }
            }
            return;
        }

        let (conn, reader) = match self.dial(receiver).await {
            Ok(dialed) => dialed,
            Err(e) => {
                tracing::warn!(peer = %receiver, error = %format!("{e:#}"), "dial failed");
                return;
            }
        };

        if let Err(e) = conn.write_frame(&frame, self.timeouts.write_timeout()).await {
            tracing::warn!(peer = %receiver, error = %e, "write on new connection failed");
            conn.shutdown().await;
            return;
        }
        tracing::debug!(peer = %receiver, len = frame.len(), "sent on new connection");

        self.cache.add(key, conn.clone());
        self.spawn_read_loop(conn, key, reader);
    }

    async fn dial(
        &self,
        receiver: ConnInfo,
    ) -> anyhow::Result<(Arc<PeerConnection>, ReadHalf<BoxedStream>)> {
        let addr = receiver.addr();
        let limit = self.timeouts.dial_timeout();

        let tcp = tokio::time::timeout(limit, TcpStream::connect(addr))
            .await
            .context("tcp connect timed out")?
            .context("tcp connect failed")?;
        configure_socket(&tcp, self.timeouts.keep_alive());

        let tls = tokio::time::timeout(
            limit,
            self.tls.connector().connect(ServerName::from(addr.ip()), tcp),
        )
        .await
        .context("tls handshake timed out")?
        .context("tls handshake failed")?;

        self.dials.fetch_add(1, Ordering::Relaxed);
        tracing::info!(peer = %receiver, "connection dialed");
        Ok(PeerConnection::new(receiver, Box::new(tls)))
    }

    /// Finish an inbound connection: TLS handshake, cache, read loop.
    pub(crate) async fn accept(&self, tcp: TcpStream, remote: SocketAddr) {
        // The listener only speaks TCP, so every accepted peer is a TCP peer.
        let peer = ConnInfo::from(remote);
        configure_socket(&tcp, self.timeouts.keep_alive());

        let tls = match tokio::time::timeout(
            self.timeouts.dial_timeout(),
            self.tls.acceptor().accept(tcp),
        )
        .await
        {
            Ok(Ok(tls)) => tls,
            Ok(Err(e)) => {
                tracing::warn!(%peer, error = %e, "tls handshake failed");
                return;
            }
            Err(_) => {
                tracing::warn!(%peer, "tls handshake timed out");
                return;
            }
        };
        tracing::info!(%peer, "connection accepted");

        let (conn, reader) = PeerConnection::new(peer, Box::new(tls));
        let key = AddressPair::new(self.local, peer);
        self.cache.add(key, conn.clone());
        self.spawn_read_loop(conn, key, reader);
    }

    fn spawn_read_loop(
        &self,
        conn: Arc<PeerConnection>,
        key: AddressPair,
        reader: ReadHalf<BoxedStream>,
    ) {
        let read_loop = ReadLoop::new(
            conn,
            key,
            reader,
            self.framer.clone(),
            self.max_frame,
            self.inbox.clone(),
            self.cache.clone(),
            self.timeouts.tcp_timeout(),
            self.shutdown.subscribe(),
        );
        tokio::spawn(read_loop.run());
    }

    /// Close every cached connection.
    pub fn close_all(&self) {
        self.cache.close_all();
    }
}

fn configure_socket(stream: &TcpStream, keep_alive: Duration) {
    if let Err(e) = stream.set_nodelay(true) {
        tracing::debug!(error = %e, "failed to set TCP_NODELAY");
    }
    if keep_alive.is_zero() {
        return;
    }
    let keepalive = socket2::TcpKeepalive::new().with_time(keep_alive);
    if let Err(e) = socket2::SockRef::from(stream).set_tcp_keepalive(&keepalive) {
        tracing::debug!(error = %e, "failed to enable tcp keepalive");
    }
}
