//! TLS configuration for the listener and the outbound dialer.
//!
//! The server always comes up with a usable identity: if the configured
//! certificate or key cannot be loaded, an ephemeral self-signed pair is
//! generated and a warning is logged.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::crypto::CryptoProvider;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use zeroize::Zeroizing;

use rains_core::config::TlsSettings;

#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("failed to read {0}: {1}")]
    Read(PathBuf, std::io::Error),
    #[error("certificate error: {0}")]
    Certificate(String),
    #[error("private key error: {0}")]
    PrivateKey(String),
    #[error("tls config error: {0}")]
    Config(String),
    #[error("self-signed certificate generation failed: {0}")]
    SelfSigned(#[from] rcgen::Error),
}

/// Acceptor and connector sharing one crypto provider.
#[derive(Clone)]
pub struct TlsContext {
    acceptor: TlsAcceptor,
    connector: TlsConnector,
}

/// Builder for [`TlsContext`] from PEM material.
#[derive(Default)]
pub struct TlsContextBuilder {
    cert_pem: Option<Vec<u8>>,
    key_pem: Option<Zeroizing<Vec<u8>>>,
    roots_pem: Vec<Vec<u8>>,
}

impl TlsContextBuilder {
    /// Server certificate chain, PEM.
    pub fn cert_pem(mut self, pem: impl Into<Vec<u8>>) -> Self {
        self.cert_pem = Some(pem.into());
        self
    }

    /// Server private key, PEM.
    pub fn key_pem(mut self, pem: impl Into<Vec<u8>>) -> Self {
        self.key_pem = Some(Zeroizing::new(pem.into()));
        self
    }

    /// Trust root(s) for outbound dials, PEM. May be called repeatedly.
    pub fn root_pem(mut self, pem: impl Into<Vec<u8>>) -> Self {
        self.roots_pem.push(pem.into());
        self
    }

    pub fn build(self) -> Result<TlsContext, TlsError> {
        let cert_pem = self
            .cert_pem
            .ok_or_else(|| TlsError::Certificate("server certificate required".into()))?;
        let key_pem = self
            .key_pem
            .ok_or_else(|| TlsError::PrivateKey("server private key required".into()))?;

        let certs = parse_certificates(&cert_pem)?;
        if certs.is_empty() {
            return Err(TlsError::Certificate("no server certificates found".into()));
        }
        let key = parse_private_key(&key_pem)?;

        let mut roots = RootCertStore::empty();
        for pem in &self.roots_pem {
            for cert in parse_certificates(pem)? {
                roots
                    .add(cert)
                    .map_err(|e| TlsError::Certificate(format!("failed to add trust root: {e}")))?;
            }
        }

        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let server = server_config(provider.clone(), certs, key)?;
        let client = client_config(provider, roots)?;

        Ok(TlsContext {
            acceptor: TlsAcceptor::from(Arc::new(server)),
            connector: TlsConnector::from(Arc::new(client)),
        })
    }
}

impl TlsContext {
    pub fn builder() -> TlsContextBuilder {
        TlsContextBuilder::default()
    }

    /// Build from configured files, falling back to a self-signed identity.
    ///
    /// A missing or unreadable trust-root file leaves the dialer with no
    /// roots, so outbound dials fail until it is fixed. Only the fallback
    /// generation itself can fail here.
    pub fn from_settings(settings: &TlsSettings) -> Result<Self, TlsError> {
        let roots = match &settings.root_ca_file {
            Some(path) => match read_file(path) {
                Ok(pem) => vec![pem],
                Err(e) => {
                    tracing::warn!(error = %e, "trust roots unavailable, outbound dials will fail");
                    Vec::new()
                }
            },
            None => Vec::new(),
        };

        let configured = read_file(&settings.certificate_file).and_then(|cert| {
            let key = read_file(&settings.private_key_file)?;
            Ok((cert, key))
        });

        let attempt = configured.and_then(|(cert, key)| {
            with_roots(TlsContext::builder().cert_pem(cert).key_pem(key), &roots).build()
        });

        match attempt {
            Ok(ctx) => {
                tracing::info!(cert = %settings.certificate_file.display(), "tls identity loaded");
                Ok(ctx)
            }
            Err(e) => {
                tracing::warn!(error = %e, "configured tls identity unusable, using a self-signed certificate");
                let (cert, key) = self_signed_identity()?;
                with_roots(TlsContext::builder().cert_pem(cert).key_pem(key.to_vec()), &roots)
                    .build()
            }
        }
    }

    pub fn acceptor(&self) -> TlsAcceptor {
        self.acceptor.clone()
    }

    pub fn connector(&self) -> TlsConnector {
        self.connector.clone()
    }
}

fn with_roots(mut builder: TlsContextBuilder, roots: &[Vec<u8>]) -> TlsContextBuilder {
    for pem in roots {
        builder = builder.root_pem(pem.clone());
    }
    builder
}

fn server_config(
    provider: Arc<CryptoProvider>,
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<ServerConfig, TlsError> {
    ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| TlsError::Config(format!("server protocol versions: {e}")))?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| TlsError::Config(format!("server config error: {e}")))
}

fn client_config(
    provider: Arc<CryptoProvider>,
    roots: RootCertStore,
) -> Result<ClientConfig, TlsError> {
    Ok(ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| TlsError::Config(format!("client protocol versions: {e}")))?
        .with_root_certificates(roots)
        .with_no_client_auth())
}

fn read_file(path: &Path) -> Result<Vec<u8>, TlsError> {
    std::fs::read(path).map_err(|e| TlsError::Read(path.to_path_buf(), e))
}

/// Ephemeral self-signed identity valid for localhost and the loopback IPs.
pub fn self_signed_identity() -> Result<(Vec<u8>, Zeroizing<Vec<u8>>), TlsError> {
    let names = vec![
        "localhost".to_string(),
        "127.0.0.1".to_string(),
        "::1".to_string(),
    ];
    let certified = rcgen::generate_simple_self_signed(names)?;
    Ok((
        certified.cert.pem().into_bytes(),
        Zeroizing::new(certified.key_pair.serialize_pem().into_bytes()),
    ))
}

fn parse_certificates(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    CertificateDer::pem_slice_iter(pem)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TlsError::Certificate(format!("failed to parse certificates: {e}")))
}

fn parse_private_key(pem: &[u8]) -> Result<PrivateKeyDer<'static>, TlsError> {
    PrivateKeyDer::from_pem_slice(pem)
        .map_err(|e| TlsError::PrivateKey(format!("failed to parse private key: {e}")))
}
