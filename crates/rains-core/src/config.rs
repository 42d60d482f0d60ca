//! Configuration system for rainsd.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $RAINS_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/rains/config.toml
//!   3. ~/.config/rains/config.toml

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::wire::Capability;

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RainsConfig {
    pub server: ServerConfig,
    pub tls: TlsSettings,
    pub limits: LimitsConfig,
    pub caches: CacheConfig,
    pub timeouts: TimeoutConfig,
    /// Capability sets installed in the capability cache at startup.
    pub capabilities: Vec<CapabilitySeed>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the TLS listener binds to. Also the server's own identity
    /// in connection-cache keys.
    pub listen_addr: SocketAddr,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsSettings {
    pub certificate_file: PathBuf,
    pub private_key_file: PathBuf,
    /// PEM bundle of trust roots for outbound dials. None = no roots.
    pub root_ca_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Inbound messages longer than this are answered with MsgTooLarge.
    pub max_msg_byte_length: usize,
    pub prio_buffer_size: usize,
    pub normal_buffer_size: usize,
    pub notification_buffer_size: usize,
    pub outbound_buffer_size: usize,
    pub prio_worker_count: usize,
    /// Workers serving priority first, then normal.
    pub normal_worker_count: usize,
    pub notification_worker_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub max_connections: usize,
    pub capabilities_cache_size: usize,
    pub peer_to_cap_cache_size: usize,
    pub active_token_cache_size: usize,
    /// Outstanding self-issued query tokens expire after this. 0 = never.
    pub active_token_ttl_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Idle read deadline per connection, reset after every frame. 0 = none.
    pub tcp_timeout_secs: u64,
    /// TCP keepalive probe interval. 0 = keepalive off.
    pub keep_alive_secs: u64,
    pub dial_timeout_secs: u64,
    pub write_timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilitySeed {
    pub capabilities: Vec<Capability>,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for RainsConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            tls: TlsSettings::default(),
            limits: LimitsConfig::default(),
            caches: CacheConfig::default(),
            timeouts: TimeoutConfig::default(),
            capabilities: Vec::new(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 55553)),
        }
    }
}

impl Default for TlsSettings {
    fn default() -> Self {
        Self {
            certificate_file: config_dir().join("server.crt"),
            private_key_file: config_dir().join("server.key"),
            root_ca_file: None,
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_msg_byte_length: 65_536,
            prio_buffer_size: 50,
            normal_buffer_size: 100,
            notification_buffer_size: 20,
            outbound_buffer_size: 256,
            prio_worker_count: 2,
            normal_worker_count: 10,
            notification_worker_count: 2,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_connections: 1000,
            capabilities_cache_size: 50,
            peer_to_cap_cache_size: 1000,
            active_token_cache_size: 1000,
            active_token_ttl_secs: 60,
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            tcp_timeout_secs: 300,
            keep_alive_secs: 60,
            dial_timeout_secs: 10,
            write_timeout_secs: 10,
        }
    }
}

impl TimeoutConfig {
    /// None when connections may idle forever.
    pub fn tcp_timeout(&self) -> Option<Duration> {
        (self.tcp_timeout_secs > 0).then(|| Duration::from_secs(self.tcp_timeout_secs))
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.dial_timeout_secs)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }
}

impl CacheConfig {
    /// None when tokens never expire.
    pub fn active_token_ttl(&self) -> Option<Duration> {
        (self.active_token_ttl_secs > 0).then(|| Duration::from_secs(self.active_token_ttl_secs))
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("rains")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl RainsConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::file_path())
    }

    /// Load from an explicit path, falling back to defaults if it is absent.
    pub fn load_from(path: &std::path::Path) -> Result<Self, ConfigError> {
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(path)
                .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))?
        } else {
            RainsConfig::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("RAINS_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&RainsConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply RAINS_* env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("RAINS_SERVER__LISTEN_ADDR") {
            if let Ok(addr) = v.parse() {
                self.server.listen_addr = addr;
            }
        }
        if let Ok(v) = std::env::var("RAINS_TLS__CERTIFICATE_FILE") {
            self.tls.certificate_file = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("RAINS_TLS__PRIVATE_KEY_FILE") {
            self.tls.private_key_file = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("RAINS_TLS__ROOT_CA_FILE") {
            self.tls.root_ca_file = Some(PathBuf::from(v));
        }
        if let Ok(v) = std::env::var("RAINS_LIMITS__MAX_MSG_BYTE_LENGTH") {
            if let Ok(n) = v.parse() {
                self.limits.max_msg_byte_length = n;
            }
        }
    }
}
