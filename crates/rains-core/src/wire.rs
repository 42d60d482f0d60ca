//! RAINS wire types — the protocol envelope and its sections.
//!
//! A message is a token, an optional capability field, a list of
//! message-level signatures and an ordered list of sections. Sections are a
//! closed set: assertion, shard, zone, query and notification. Anything else
//! is rejected by the codec before it reaches the server.

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

use rand::RngCore;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

// ── Token ─────────────────────────────────────────────────────────────────────

/// Token length in bytes.
pub const TOKEN_LEN: usize = 16;

/// Correlates a query with its response or notification.
///
/// Encoded on the wire as 32 lowercase hex characters.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Token(pub [u8; TOKEN_LEN]);

impl Token {
    /// Fresh random token for a self-issued query.
    pub fn random() -> Self {
        let mut bytes = [0u8; TOKEN_LEN];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Token from a human-readable label, truncated or zero-padded to 16 bytes.
    pub fn from_label(label: &str) -> Self {
        let mut bytes = [0u8; TOKEN_LEN];
        let raw = label.as_bytes();
        let n = raw.len().min(TOKEN_LEN);
        bytes[..n].copy_from_slice(&raw[..n]);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; TOKEN_LEN] {
        &self.0
    }

    /// The all-zero token, used when nothing better could be recovered.
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; TOKEN_LEN]
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Token({})", hex::encode(self.0))
    }
}

impl FromStr for Token {
    type Err = WireError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|e| WireError::InvalidToken(e.to_string()))?;
        let bytes: [u8; TOKEN_LEN] = bytes
            .try_into()
            .map_err(|_| WireError::InvalidToken(format!("expected {TOKEN_LEN} bytes")))?;
        Ok(Self(bytes))
    }
}

impl Serialize for Token {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        hex_serde::serialize(&self.0, serializer)
    }
}

impl<'de> Deserialize<'de> for Token {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        hex_serde::deserialize(deserializer).map(Self)
    }
}

// ── Capabilities ──────────────────────────────────────────────────────────────

/// A transport or feature a peer declares support for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Capability {
    #[serde(rename = "urn:x-rains:tlssrv")]
    TlsOverTcp,
    #[serde(rename = "urn:x-rains:nocapability")]
    NoCapability,
}

impl Capability {
    pub const ALL: [Capability; 2] = [Capability::TlsOverTcp, Capability::NoCapability];

    /// The URN literal peers send in place of a capability-set hash.
    pub const fn literal(self) -> &'static str {
        match self {
            Capability::TlsOverTcp => "urn:x-rains:tlssrv",
            Capability::NoCapability => "urn:x-rains:nocapability",
        }
    }

    pub fn from_literal(literal: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.literal() == literal)
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.literal())
    }
}

/// Content address of a capability set.
///
///   hash = hex(BLAKE3(sorted, deduplicated literals joined by '\n'))
///
/// Order-independent, so two peers announcing the same set agree on the hash.
pub fn capability_set_hash(capabilities: &[Capability]) -> String {
    let mut literals: Vec<&str> = capabilities.iter().map(|c| c.literal()).collect();
    literals.sort_unstable();
    literals.dedup();
    hex::encode(blake3::hash(literals.join("\n").as_bytes()).as_bytes())
}

// ── Notifications ─────────────────────────────────────────────────────────────

/// Notification codes, modelled on HTTP status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u16", into = "u16")]
#[repr(u16)]
pub enum NotificationType {
    Heartbeat = 100,
    CapHashNotKnown = 399,
    BadMessage = 400,
    RcvInconsistentMsg = 403,
    NoAssertionsExist = 404,
    MsgTooLarge = 413,
    UnspecServerErr = 500,
    ServerNotCapable = 501,
    NoAssertionAvail = 504,
}

impl TryFrom<u16> for NotificationType {
    type Error = WireError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            100 => Ok(NotificationType::Heartbeat),
            399 => Ok(NotificationType::CapHashNotKnown),
            400 => Ok(NotificationType::BadMessage),
            403 => Ok(NotificationType::RcvInconsistentMsg),
            404 => Ok(NotificationType::NoAssertionsExist),
            413 => Ok(NotificationType::MsgTooLarge),
            500 => Ok(NotificationType::UnspecServerErr),
            501 => Ok(NotificationType::ServerNotCapable),
            504 => Ok(NotificationType::NoAssertionAvail),
            other => Err(WireError::UnknownNotificationType(other)),
        }
    }
}

impl From<NotificationType> for u16 {
    fn from(n: NotificationType) -> u16 {
        n as u16
    }
}

// ── Objects ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectType {
    Name,
    Ip6,
    Ip4,
    Redirection,
    Delegation,
    Nameset,
    CertInfo,
    ServiceInfo,
    Registrar,
    Registrant,
    InfraKey,
    ExternalKey,
    NextKey,
}

/// A typed value bound to a name by an assertion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Object {
    #[serde(rename = "type")]
    pub kind: ObjectType,
    pub value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryOption {
    MinE2ELatency,
    MinLastHopAnswerSize,
    MinInfoLeakage,
    CachedAnswersOnly,
    ExpiredAssertionsOk,
    TokenTracing,
    NoVerificationDelegation,
    NoProactiveCaching,
}

// ── Signatures ────────────────────────────────────────────────────────────────

/// An Ed25519 signature together with the key that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    #[serde(with = "hex_serde")]
    pub public_key: [u8; 32],
    #[serde(with = "hex_serde")]
    pub signature: [u8; 64],
}

// ── Sections ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssertionSection {
    pub subject_name: String,
    pub subject_zone: String,
    pub context: String,
    pub content: Vec<Object>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub signatures: Vec<Signature>,
}

/// A lexicographic range of assertions within one zone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardSection {
    pub subject_zone: String,
    pub context: String,
    pub range_from: String,
    pub range_to: String,
    pub content: Vec<AssertionSection>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub signatures: Vec<Signature>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum ZoneEntry {
    Assertion(AssertionSection),
    Shard(ShardSection),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZoneSection {
    pub subject_zone: String,
    pub context: String,
    pub content: Vec<ZoneEntry>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub signatures: Vec<Signature>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuerySection {
    /// Must equal the envelope token.
    pub token: Token,
    pub name: String,
    pub context: String,
    pub types: Vec<ObjectType>,
    /// Unix seconds after which the querier no longer cares about the answer.
    pub expires: i64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<QueryOption>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationSection {
    pub token: Token,
    #[serde(rename = "type")]
    pub kind: NotificationType,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub data: String,
}

/// One semantic unit inside a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum Section {
    Assertion(AssertionSection),
    Shard(ShardSection),
    Zone(ZoneSection),
    Query(QuerySection),
    Notification(NotificationSection),
}

impl Section {
    /// Wire tags of every section kind the codec accepts.
    pub const KINDS: [&'static str; 5] = ["assertion", "shard", "zone", "query", "notification"];

    pub fn kind(&self) -> &'static str {
        match self {
            Section::Assertion(_) => "assertion",
            Section::Shard(_) => "shard",
            Section::Zone(_) => "zone",
            Section::Query(_) => "query",
            Section::Notification(_) => "notification",
        }
    }
}

// ── Message ───────────────────────────────────────────────────────────────────

/// The parsed protocol envelope.
///
/// `token` is declared first so it leads the encoded form; best-effort token
/// extraction from oversized buffers relies on that.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub token: Token,
    /// Either a capability-set hash or a single capability literal.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub signatures: Vec<Signature>,
    pub content: Vec<Section>,
    /// Sections of a kind this build does not know, as received, each with
    /// its index in the original content list. Never encoded; kept so that
    /// signatures still cover them.
    #[serde(skip)]
    pub unknown_sections: Vec<(usize, serde_json::Value)>,
}

impl Message {
    pub fn new(token: Token, content: Vec<Section>) -> Self {
        Self {
            token,
            capabilities: None,
            signatures: Vec::new(),
            content,
            unknown_sections: Vec::new(),
        }
    }
}

// ── Connection info ───────────────────────────────────────────────────────────

/// A remote endpoint: transport plus address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "addr", rename_all = "lowercase")]
pub enum ConnInfo {
    /// TLS over TCP.
    Tcp(SocketAddr),
}

impl ConnInfo {
    /// Translate a (network, address) pair as reported by a socket.
    ///
    /// Returns `None` for transports the server does not speak and for
    /// malformed addresses; callers treat that as an unknown peer.
    pub fn parse_remote_addr(network: &str, addr: &str) -> Option<Self> {
        match network {
            "tcp" | "tcp4" | "tcp6" => addr.parse().ok().map(ConnInfo::Tcp),
            _ => None,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        match self {
            ConnInfo::Tcp(addr) => *addr,
        }
    }
}

impl From<SocketAddr> for ConnInfo {
    fn from(addr: SocketAddr) -> Self {
        ConnInfo::Tcp(addr)
    }
}

impl fmt::Display for ConnInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnInfo::Tcp(addr) => write!(f, "tcp://{addr}"),
        }
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("no token found in message prefix")]
    TokenNotFound,

    #[error("invalid token encoding: {0}")]
    InvalidToken(String),

    #[error("unknown notification type: {0}")]
    UnknownNotificationType(u16),
}

// ── Hex helpers ───────────────────────────────────────────────────────────────

pub(crate) mod hex_serde {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S, const N: usize>(bytes: &[u8; N], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D, const N: usize>(deserializer: D) -> Result<[u8; N], D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
        bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom(format!("expected {N} bytes")))
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
