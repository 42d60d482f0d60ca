//! Message-level signature verification.
//!
//! The server gates every inbound message on its envelope signatures before
//! any section is queued. Section signatures are checked later by whoever
//! processes the section; this module only covers the envelope.
//!
//! Signing bytes are the compact JSON encoding of (token, capabilities,
//! content), where content includes sections this build cannot decode.
//! Signatures themselves are excluded, so a message may carry several
//! independent signatures.

use std::collections::HashSet;

use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};
use serde::Serialize;
use serde_json::Value;

use crate::wire::{Message, Section, Signature, Token, WireError};

/// Decides whether an inbound message may enter the server.
pub trait SignatureVerifier: Send + Sync {
    fn verify(&self, message: &Message) -> bool;
}

#[derive(Serialize)]
struct SigningView<'a> {
    token: &'a Token,
    capabilities: &'a Option<String>,
    content: Vec<Value>,
}

/// Canonical bytes covered by message-level signatures.
///
/// Content is taken in its received order, sections of unknown kinds
/// included, each as a JSON value (object keys sorted).
pub fn signing_bytes(message: &Message) -> Result<Vec<u8>, WireError> {
    let total = message.content.len() + message.unknown_sections.len();
    let mut known = message.content.iter();
    let mut unknown = message.unknown_sections.iter().peekable();
    let mut content = Vec::with_capacity(total);
    for index in 0..total {
        match unknown.next_if(|(at, _)| *at == index) {
            Some((_, value)) => content.push(value.clone()),
            None => {
                if let Some(section) = known.next() {
                    content.push(serde_json::to_value(section)?);
                }
            }
        }
    }

    let view = SigningView {
        token: &message.token,
        capabilities: &message.capabilities,
        content,
    };
    Ok(serde_json::to_vec(&view)?)
}

/// Append an Ed25519 signature over the message's signing bytes.
pub fn sign_message(message: &mut Message, key: &SigningKey) -> Result<(), WireError> {
    let bytes = signing_bytes(message)?;
    let signature = key.sign(&bytes);
    message.signatures.push(Signature {
        public_key: key.verifying_key().to_bytes(),
        signature: signature.to_bytes(),
    });
    Ok(())
}

/// Ed25519 envelope verifier.
///
/// A message without message-level signatures passes. Every signature that
/// is present must verify. When a trusted-key set is configured, every
/// signing key must also be in it.
#[derive(Debug, Default, Clone)]
pub struct Ed25519Verifier {
    trusted: HashSet<[u8; 32]>,
}

impl Ed25519Verifier {
    /// Accept any key whose signature verifies.
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept only signatures from the given public keys.
    pub fn with_trusted_keys(keys: impl IntoIterator<Item = [u8; 32]>) -> Self {
        Self {
            trusted: keys.into_iter().collect(),
        }
    }

    fn verify_one(&self, bytes: &[u8], sig: &Signature) -> bool {
        if !self.trusted.is_empty() && !self.trusted.contains(&sig.public_key) {
            return false;
        }
        let Ok(key) = VerifyingKey::from_bytes(&sig.public_key) else {
            return false;
        };
        key.verify(bytes, &ed25519_dalek::Signature::from_bytes(&sig.signature))
            .is_ok()
    }
}

impl SignatureVerifier for Ed25519Verifier {
    fn verify(&self, message: &Message) -> bool {
        if message.signatures.is_empty() {
            return true;
        }
        let Ok(bytes) = signing_bytes(message) else {
            return false;
        };
        message
            .signatures
            .iter()
            .all(|sig| self.verify_one(&bytes, sig))
    }
}
