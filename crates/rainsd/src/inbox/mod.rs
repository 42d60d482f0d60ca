//! Inbox — classifies every delivered message and routes its sections.
//!
//! Per message: size limit, parse, capability negotiation, signature gate.
//! Per section: assertions, shards and zones go to the priority queue when
//! the envelope token is one we issued and to the normal queue otherwise;
//! queries go to the normal queue once their token matches the envelope;
//! notifications are accepted only against a live token, which they consume.
//!
//! Protocol errors are answered through the outbox. Signature failures are
//! never answered.

pub mod capability;
pub mod queues;
pub mod tokens;

use std::sync::Arc;

use bytes::Bytes;

use rains_core::codec;
use rains_core::config::RainsConfig;
use rains_core::crypto::SignatureVerifier;
use rains_core::wire::{QuerySection, WireError};
use rains_core::{Capability, ConnInfo, Message, NotificationType, Section, Token};

use crate::conn_cache::CacheError;
use crate::switchboard::send_worker::Outbox;

use capability::{CapabilityCache, PeerCapabilities};
use queues::{MsgSectionSender, QueueDepths, Queues};
use tokens::ActiveTokens;

pub struct Inbox {
    max_msg_len: usize,
    verifier: Arc<dyn SignatureVerifier>,
    capabilities: CapabilityCache,
    peer_capabilities: PeerCapabilities,
    tokens: ActiveTokens,
    queues: Queues,
    outbox: Outbox,
}

impl Inbox {
    /// Build the inbox and seed the capability cache.
    ///
    /// The single-capability sets are always installed; `config.capabilities`
    /// adds more.
    pub fn new(
        config: &RainsConfig,
        verifier: Arc<dyn SignatureVerifier>,
        queues: Queues,
        outbox: Outbox,
    ) -> Result<Self, CacheError> {
        let capabilities = CapabilityCache::new(config.caches.capabilities_cache_size)?;
        for cap in Capability::ALL {
            capabilities.insert(&[cap]);
        }
        for seed in &config.capabilities {
            let hash = capabilities.insert(&seed.capabilities);
            tracing::debug!(hash = %hash, capabilities = ?seed.capabilities, "capability set installed");
        }

        Ok(Self {
            max_msg_len: config.limits.max_msg_byte_length,
            verifier,
            capabilities,
            peer_capabilities: PeerCapabilities::new(config.caches.peer_to_cap_cache_size)?,
            tokens: ActiveTokens::new(
                config.caches.active_token_cache_size,
                config.caches.active_token_ttl(),
            )?,
            queues,
            outbox,
        })
    }

    /// Classify one framed message from `sender`.
    ///
    /// Waits for queue space, so a saturated pool slows the read loop that
    /// feeds it.
    pub async fn deliver(&self, raw: Bytes, sender: ConnInfo) {
        if raw.len() > self.max_msg_len {
            let token = recover_token(&raw);
            tracing::warn!(peer = %sender, len = raw.len(), max = self.max_msg_len, %token, "message too large");
            self.notify(token, NotificationType::MsgTooLarge, sender);
            return;
        }

        let message = match codec::parse_message(&raw) {
            Ok(message) => message,
            Err(e) => {
                let token = recover_token(&raw);
                tracing::warn!(peer = %sender, error = %e, %token, "unparsable message");
                self.notify(token, NotificationType::BadMessage, sender);
                return;
            }
        };

        if let Some(value) = &message.capabilities {
            self.negotiate(value, sender);
        }

        if !self.verifier.verify(&message) {
            tracing::debug!(peer = %sender, token = %message.token, "message signature invalid, dropping");
            return;
        }

        let token = message.token;
        for section in message.content {
            self.route(section, token, sender).await;
        }
    }

    fn negotiate(&self, value: &str, sender: ConnInfo) {
        match self.capabilities.resolve(value) {
            Some(caps) => {
                tracing::debug!(peer = %sender, capabilities = ?caps, "peer capabilities recorded");
                self.peer_capabilities.set(sender, caps);
            }
            None => {
                tracing::warn!(peer = %sender, value, "unknown capability hash or literal");
            }
        }
    }

    async fn route(&self, section: Section, token: Token, sender: ConnInfo) {
        match section {
            Section::Assertion(_) | Section::Shard(_) | Section::Zone(_) => {
                let prio = self.tokens.is_active(&token);
                let queue = if prio { &self.queues.prio } else { &self.queues.normal };
                tracing::debug!(peer = %sender, %token, kind = section.kind(), prio, "section queued");
                enqueue(queue, MsgSectionSender { sender, section, token }).await;
            }
            Section::Query(query) => {
                if query.token != token {
                    tracing::warn!(peer = %sender, msg_token = %token, query_token = %query.token, "query token does not match message token");
                    self.notify(token, NotificationType::BadMessage, sender);
                    self.notify(query.token, NotificationType::BadMessage, sender);
                    return;
                }
                let section = Section::Query(query);
                enqueue(&self.queues.normal, MsgSectionSender { sender, section, token }).await;
            }
            Section::Notification(_) => {
                if !self.tokens.take(&token) {
                    tracing::warn!(peer = %sender, %token, "notification for unknown token, dropping");
                    return;
                }
                tracing::debug!(peer = %sender, %token, "notification matched active token");
                enqueue(&self.queues.notification, MsgSectionSender { sender, section, token }).await;
            }
        }
    }

    fn notify(&self, token: Token, kind: NotificationType, receiver: ConnInfo) {
        match codec::notification_message(token, kind, "") {
            Ok(bytes) => self.outbox.send(receiver, Bytes::from(bytes)),
            Err(e) => tracing::error!(error = %e, "failed to encode notification"),
        }
    }

    /// Send a query we originate and prioritise its answer.
    ///
    /// The query and envelope are stamped with a fresh token that is
    /// registered as active before the message leaves.
    pub fn issue_query(&self, mut query: QuerySection, receiver: ConnInfo) -> Result<Token, WireError> {
        let token = self.tokens.issue();
        query.token = token;
        let message = Message::new(token, vec![Section::Query(query)]);
        let bytes = codec::encode_message(&message)?;
        tracing::debug!(peer = %receiver, %token, "issuing query");
        self.outbox.send(receiver, Bytes::from(bytes));
        Ok(token)
    }

    /// Register a token as ours without sending anything.
    pub fn add_active_token(&self, token: Token) {
        self.tokens.insert(token);
    }

    pub fn is_active_token(&self, token: &Token) -> bool {
        self.tokens.is_active(token)
    }

    pub fn active_token_count(&self) -> usize {
        self.tokens.len()
    }

    /// Install a capability set; returns the hash peers may send for it.
    pub fn add_capabilities(&self, capabilities: &[Capability]) -> String {
        self.capabilities.insert(capabilities)
    }

    pub fn peer_capabilities(&self, peer: &ConnInfo) -> Option<Vec<Capability>> {
        self.peer_capabilities.get(peer)
    }

    pub fn queue_depths(&self) -> QueueDepths {
        self.queues.depths()
    }
}

fn recover_token(raw: &[u8]) -> Token {
    codec::extract_token(raw).unwrap_or_else(|e| {
        tracing::debug!(error = %e, "no token recoverable, replying with zero token");
        Token::default()
    })
}

async fn enqueue(queue: &tokio::sync::mpsc::Sender<MsgSectionSender>, item: MsgSectionSender) {
    if queue.send(item).await.is_err() {
        tracing::warn!("work queue closed, section dropped");
    }
}
