//! rainsd integration test harness.
//!
//! Every test runs real servers on loopback TLS. Certificates come from a
//! throwaway CA generated per test; servers and raw test peers all trust it.
//!
//!   cargo test --test integration

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use rcgen::{BasicConstraints, CertificateParams, DnType, IsCa, KeyPair};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName};
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

use rains_core::codec;
use rains_core::config::RainsConfig;
use rains_core::crypto::Ed25519Verifier;
use rains_core::framer::{Deframer, Framer, NewLineFramer};
use rains_core::{ConnInfo, Message};
use rainsd::inbox::queues::MsgSectionSender;
use rainsd::tls::TlsContext;
use rainsd::worker::SectionHandler;
use rainsd::Server;

mod dispatch;
mod switchboard;

/// Upper bound for anything a test waits on.
pub const WAIT: Duration = Duration::from_secs(5);

// ── Certificates ──────────────────────────────────────────────────────────────

/// A CA and one leaf valid for localhost and 127.0.0.1.
pub struct Pki {
    pub ca_pem: String,
    pub ca_der: CertificateDer<'static>,
    pub leaf_pem: String,
    pub leaf_der: CertificateDer<'static>,
    pub leaf_key_pem: String,
    pub leaf_key_der: Vec<u8>,
}

impl Pki {
    pub fn generate() -> Result<Self> {
        let mut ca_params = CertificateParams::new(Vec::<String>::new())?;
        ca_params
            .distinguished_name
            .push(DnType::CommonName, "rains test ca");
        ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        let ca_key = KeyPair::generate()?;
        let ca_cert = ca_params.self_signed(&ca_key)?;

        let mut leaf_params =
            CertificateParams::new(vec!["localhost".to_string(), "127.0.0.1".to_string()])?;
        leaf_params
            .distinguished_name
            .push(DnType::CommonName, "rains test server");
        let leaf_key = KeyPair::generate()?;
        let leaf_cert = leaf_params.signed_by(&leaf_key, &ca_cert, &ca_key)?;

        Ok(Self {
            ca_pem: ca_cert.pem(),
            ca_der: ca_cert.der().clone(),
            leaf_pem: leaf_cert.pem(),
            leaf_der: leaf_cert.der().clone(),
            leaf_key_pem: leaf_key.serialize_pem(),
            leaf_key_der: leaf_key.serialize_der(),
        })
    }

    pub fn tls_context(&self) -> Result<TlsContext> {
        Ok(TlsContext::builder()
            .cert_pem(self.leaf_pem.clone())
            .key_pem(self.leaf_key_pem.clone())
            .root_pem(self.ca_pem.clone())
            .build()?)
    }

    pub fn client_config(&self) -> Result<Arc<rustls::ClientConfig>> {
        let mut roots = rustls::RootCertStore::empty();
        roots.add(self.ca_der.clone())?;
        let config = rustls::ClientConfig::builder_with_provider(provider())
            .with_safe_default_protocol_versions()?
            .with_root_certificates(roots)
            .with_no_client_auth();
        Ok(Arc::new(config))
    }

    pub fn server_config(&self) -> Result<Arc<rustls::ServerConfig>> {
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(self.leaf_key_der.clone()));
        let config = rustls::ServerConfig::builder_with_provider(provider())
            .with_safe_default_protocol_versions()?
            .with_no_client_auth()
            .with_single_cert(vec![self.leaf_der.clone()], key)?;
        Ok(Arc::new(config))
    }
}

fn provider() -> Arc<rustls::crypto::CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

// ── Servers ───────────────────────────────────────────────────────────────────

/// A section a worker handed to the handler, and through which callback.
#[derive(Debug)]
pub struct Handled {
    pub via: &'static str,
    pub item: MsgSectionSender,
}

struct Capture(mpsc::UnboundedSender<Handled>);

impl SectionHandler for Capture {
    fn handle(&self, item: MsgSectionSender) {
        let _ = self.0.send(Handled { via: "handle", item });
    }

    fn notify(&self, item: MsgSectionSender) {
        let _ = self.0.send(Handled { via: "notify", item });
    }
}

pub struct TestServer {
    pub server: Server,
    shutdown: broadcast::Sender<()>,
    handled: mpsc::UnboundedReceiver<Handled>,
}

impl TestServer {
    /// Start on 127.0.0.1:0 with one worker per pool, after `tweak`.
    pub async fn start(pki: &Pki, tweak: impl FnOnce(&mut RainsConfig)) -> Result<Self> {
        let mut config = RainsConfig::default();
        config.server.listen_addr = "127.0.0.1:0".parse()?;
        config.limits.prio_worker_count = 1;
        config.limits.normal_worker_count = 1;
        config.limits.notification_worker_count = 1;
        tweak(&mut config);

        let (shutdown, _) = broadcast::channel(1);
        let (tx, handled) = mpsc::unbounded_channel();
        let server = Server::start(
            &config,
            pki.tls_context()?,
            Arc::new(Ed25519Verifier::new()),
            Arc::new(Capture(tx)),
            shutdown.clone(),
        )
        .await?;

        Ok(Self {
            server,
            shutdown,
            handled,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.server.local_addr()
    }

    pub fn conn_info(&self) -> ConnInfo {
        ConnInfo::from(self.addr())
    }

    /// Next section the workers processed.
    pub async fn next_handled(&mut self) -> Result<Handled> {
        tokio::time::timeout(WAIT, self.handled.recv())
            .await
            .context("no section handled in time")?
            .context("handler channel closed")
    }

    /// True if nothing reaches the handler within `window`.
    pub async fn nothing_handled_for(&mut self, window: Duration) -> bool {
        tokio::time::timeout(window, self.handled.recv()).await.is_err()
    }

    pub async fn stop(self) {
        let _ = self.shutdown.send(());
        let _ = tokio::time::timeout(WAIT, self.server.join()).await;
    }
}

// ── Raw peers ─────────────────────────────────────────────────────────────────

/// A bare TLS client speaking newline-framed messages.
pub struct Client {
    pub local: SocketAddr,
    writer: WriteHalf<TlsStream<TcpStream>>,
    deframer: Deframer<ReadHalf<TlsStream<TcpStream>>>,
}

impl Client {
    pub async fn connect(pki: &Pki, addr: SocketAddr) -> Result<Self> {
        let tcp = TcpStream::connect(addr).await?;
        let local = tcp.local_addr()?;
        let connector = TlsConnector::from(pki.client_config()?);
        let tls = connector.connect(ServerName::from(addr.ip()), tcp).await?;
        let (reader, writer) = tokio::io::split(tls);
        Ok(Self {
            local,
            writer,
            deframer: Deframer::new(reader, Arc::new(NewLineFramer), 1 << 20),
        })
    }

    /// The identity the server sees us as.
    pub fn conn_info(&self) -> ConnInfo {
        ConnInfo::from(self.local)
    }

    /// Write raw bytes followed by the delimiter.
    pub async fn send_raw(&mut self, bytes: &[u8]) -> Result<()> {
        self.writer.write_all(bytes).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await?;
        Ok(())
    }

    pub async fn send(&mut self, message: &Message) -> Result<()> {
        let frame = NewLineFramer.frame(&codec::encode_message(message)?)?;
        self.writer.write_all(&frame).await?;
        self.writer.flush().await?;
        Ok(())
    }

    pub async fn recv(&mut self) -> Result<Message> {
        let frame = tokio::time::timeout(WAIT, self.deframer.next_frame())
            .await
            .context("no message received in time")??
            .context("server closed the connection")?;
        Ok(codec::parse_message(&frame)?)
    }

    /// True if the server sends nothing within `window`.
    pub async fn silent_for(&mut self, window: Duration) -> bool {
        tokio::time::timeout(window, self.deframer.next_frame())
            .await
            .is_err()
    }
}

/// Poll `cond` until it holds or `WAIT` runs out.
pub async fn eventually(mut cond: impl FnMut() -> bool) -> Result<()> {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !cond() {
        if tokio::time::Instant::now() > deadline {
            anyhow::bail!("condition not met in time");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    Ok(())
}
