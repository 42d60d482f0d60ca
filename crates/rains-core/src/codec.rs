//! Message codec — JSON envelope, one compact object per message.
//!
//! Compact JSON never contains a raw newline, which is what lets the
//! newline framer delimit messages on the stream.

use serde::Deserialize;
use serde_json::Value;

use crate::wire::{
    Message, NotificationSection, NotificationType, Section, Signature, Token, WireError, TOKEN_LEN,
};

/// How far into a buffer `extract_token` looks for the token field.
pub const TOKEN_SCAN_WINDOW: usize = 128;

const TOKEN_KEY: &[u8] = b"\"token\":\"";

#[derive(Deserialize)]
struct RawMessage {
    token: Token,
    #[serde(default)]
    capabilities: Option<String>,
    #[serde(default)]
    signatures: Vec<Signature>,
    #[serde(default)]
    content: Vec<Value>,
}

/// Parse one framed message.
///
/// Sections with an unrecognised `type` tag are skipped with a warning and
/// set aside in `unknown_sections`; a recognised section that fails to
/// decode fails the whole message.
pub fn parse_message(bytes: &[u8]) -> Result<Message, WireError> {
    let raw: RawMessage = serde_json::from_slice(bytes)?;

    let mut content = Vec::with_capacity(raw.content.len());
    let mut unknown_sections = Vec::new();
    for (index, value) in raw.content.into_iter().enumerate() {
        let kind = value.get("type").and_then(Value::as_str).unwrap_or_default();
        if !Section::KINDS.iter().any(|k| *k == kind) {
            tracing::warn!(kind, token = %raw.token, "unsupported message section type, skipping");
            unknown_sections.push((index, value));
            continue;
        }
        content.push(serde_json::from_value::<Section>(value)?);
    }

    Ok(Message {
        token: raw.token,
        capabilities: raw.capabilities,
        signatures: raw.signatures,
        content,
        unknown_sections,
    })
}

/// Best-effort token extraction from a buffer that may be oversized or
/// undecodable. Only the first `TOKEN_SCAN_WINDOW` bytes are searched for
/// the token key; the buffer is never parsed as a whole.
pub fn extract_token(bytes: &[u8]) -> Result<Token, WireError> {
    let window = &bytes[..bytes.len().min(TOKEN_SCAN_WINDOW)];
    let start = window
        .windows(TOKEN_KEY.len())
        .position(|w| w == TOKEN_KEY)
        .ok_or(WireError::TokenNotFound)?
        + TOKEN_KEY.len();

    let digits = bytes
        .get(start..start + TOKEN_LEN * 2)
        .ok_or(WireError::TokenNotFound)?;
    let digits = std::str::from_utf8(digits)
        .map_err(|_| WireError::InvalidToken("token is not ascii hex".into()))?;
    digits.parse()
}

pub fn encode_message(message: &Message) -> Result<Vec<u8>, WireError> {
    Ok(serde_json::to_vec(message)?)
}

/// Build a single-notification message answering `token`.
///
/// The envelope carries the same token so the receiver can match it
/// against its outstanding queries.
pub fn notification_message(
    token: Token,
    kind: NotificationType,
    data: &str,
) -> Result<Vec<u8>, WireError> {
    let message = Message::new(
        token,
        vec![Section::Notification(NotificationSection {
            token,
            kind,
            data: data.to_string(),
        })],
    );
    encode_message(&message)
}
