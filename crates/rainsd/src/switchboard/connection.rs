//! A live peer connection and the read loop that drains it.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{broadcast, Mutex};
use tokio::time::error::Elapsed;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

use rains_core::framer::{Deframer, FrameError, Framer};
use rains_core::ConnInfo;

use crate::conn_cache::{AddressPair, ConnectionCache};
use crate::inbox::Inbox;

/// Any bidirectional byte stream a peer can be reached over.
pub trait PeerStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> PeerStream for T {}

pub type BoxedStream = Box<dyn PeerStream>;

/// Write side of an open connection, shared between the connection cache
/// and whoever is sending on it. Writes are serialised by the inner mutex.
pub struct PeerConnection {
    peer: ConnInfo,
    writer: Mutex<WriteHalf<BoxedStream>>,
    closed: CancellationToken,
}

impl PeerConnection {
    /// Split `stream`; the caller owns the read half.
    pub fn new(peer: ConnInfo, stream: BoxedStream) -> (Arc<Self>, ReadHalf<BoxedStream>) {
        let (reader, writer) = tokio::io::split(stream);
        let conn = Arc::new(Self {
            peer,
            writer: Mutex::new(writer),
            closed: CancellationToken::new(),
        });
        (conn, reader)
    }

    pub fn peer(&self) -> ConnInfo {
        self.peer
    }

    /// Write one complete frame.
    pub async fn write_frame(&self, frame: &[u8], limit: Duration) -> io::Result<()> {
        if self.closed.is_cancelled() {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "connection closed"));
        }
        let write = async {
            let mut writer = self.writer.lock().await;
            writer.write_all(frame).await?;
            writer.flush().await
        };
        match tokio::time::timeout(limit, write).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "write timed out")),
        }
    }

    /// Mark the connection closed. Its read loop observes this and exits.
    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    pub fn closed(&self) -> WaitForCancellationFuture<'_> {
        self.closed.cancelled()
    }

    /// Close and flush the TLS/TCP write side.
    pub async fn shutdown(&self) {
        self.close();
        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.shutdown().await {
            tracing::debug!(peer = %self.peer, error = %e, "connection shutdown failed");
        }
    }
}

impl std::fmt::Debug for PeerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerConnection")
            .field("peer", &self.peer)
            .field("closed", &self.is_closed())
            .finish()
    }
}

// ── Read loop ─────────────────────────────────────────────────────────────────

/// Deframes one connection and hands every frame to the inbox.
///
/// Exits on end of stream, a framing error, the idle deadline, the
/// connection being closed or global shutdown. On exit the connection is
/// shut down and its cache entry is dropped if it still points at us.
pub struct ReadLoop {
    conn: Arc<PeerConnection>,
    key: AddressPair,
    deframer: Deframer<ReadHalf<BoxedStream>>,
    inbox: Arc<Inbox>,
    cache: Arc<ConnectionCache>,
    idle_timeout: Option<Duration>,
    shutdown: broadcast::Receiver<()>,
}

impl ReadLoop {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        conn: Arc<PeerConnection>,
        key: AddressPair,
        reader: ReadHalf<BoxedStream>,
        framer: Arc<dyn Framer>,
        max_frame: usize,
        inbox: Arc<Inbox>,
        cache: Arc<ConnectionCache>,
        idle_timeout: Option<Duration>,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            conn,
            key,
            deframer: Deframer::new(reader, framer, max_frame),
            inbox,
            cache,
            idle_timeout,
            shutdown,
        }
    }

    pub async fn run(mut self) {
        let peer = self.conn.peer();
        tracing::debug!(%peer, "read loop started");

        loop {
            let frame = tokio::select! {
                _ = self.shutdown.recv() => break,
                _ = self.conn.closed() => {
                    tracing::debug!(%peer, "connection closed locally");
                    break;
                }
                r = next_frame_within(&mut self.deframer, self.idle_timeout) => r,
            };

            match frame {
                // Delivery may wait for queue space; closing still wins.
                Ok(Ok(Some(bytes))) => tokio::select! {
                    _ = self.shutdown.recv() => break,
                    _ = self.conn.closed() => {
                        tracing::debug!(%peer, "connection closed while delivering");
                        break;
                    }
                    _ = self.inbox.deliver(bytes, peer) => {}
                },
                Ok(Ok(None)) => {
                    tracing::debug!(%peer, "peer closed connection");
                    break;
                }
                Ok(Err(FrameError::Io(e))) => {
                    tracing::debug!(%peer, error = %e, "read failed");
                    break;
                }
                Ok(Err(e)) => {
                    tracing::warn!(%peer, error = %e, "deframing failed, dropping connection");
                    break;
                }
                Err(_) => {
                    tracing::info!(%peer, timeout = ?self.idle_timeout, "connection idle, closing");
                    break;
                }
            }
        }

        if self.cache.remove_if_same(&self.key, &self.conn) {
            tracing::debug!(%peer, "pruned connection from cache");
        }
        self.conn.shutdown().await;
    }
}

/// Next frame, giving up after `limit` of silence. No limit waits forever.
async fn next_frame_within<R: AsyncRead + Unpin>(
    deframer: &mut Deframer<R>,
    limit: Option<Duration>,
) -> Result<Result<Option<Bytes>, FrameError>, Elapsed> {
    match limit {
        Some(limit) => tokio::time::timeout(limit, deframer.next_frame()).await,
        None => Ok(deframer.next_frame().await),
    }
}
