//! ## Signaling wire format
//!
//! The two endpoints of a mirroring session exchange session descriptions and
//! connectivity candidates over a plain TCP stream. Every message is a single
//! JSON object terminated by a newline:
//!
//! ```text
//! {"type":"offer","data":"<engine serialized payload>"}\n
//! ```
//!
//! There is no handshake, no version field and no length prefix, the newline
//! is the only delimiter. The `data` field is opaque to this crate, its
//! content is defined by the media engine that produced it.

pub mod line;
pub mod message;

pub use self::{
    line::LineDecoder,
    message::{MessageKind, SignalingMessage},
};

use std::str::Utf8Error;

#[derive(Debug)]
pub enum Error {
    EmptyLine,
    LineTooLong,
    UnknownKind(String),
    Json(serde_json::Error),
    Utf8(Utf8Error),
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownKind(kind) => write!(f, "unknown message type: {kind}"),
            Self::Json(e) => write!(f, "invalid json: {e}"),
            Self::Utf8(e) => write!(f, "invalid utf8: {e}"),
            _ => write!(f, "{:?}", self),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Self::Json(value)
    }
}

impl From<Utf8Error> for Error {
    fn from(value: Utf8Error) -> Self {
        Self::Utf8(value)
    }
}

/// Encode a message as one newline terminated line.
///
/// # Test
///
/// ```
/// use mirror_link_codec::{encode, MessageKind, SignalingMessage};
///
/// let bytes = encode(&SignalingMessage::new(MessageKind::Offer, "v=0"));
/// assert_eq!(bytes, b"{\"type\":\"offer\",\"data\":\"v=0\"}\n");
/// ```
pub fn encode(message: &SignalingMessage) -> Vec<u8> {
    let mut bytes = message.to_json().into_bytes();
    bytes.push(b'\n');
    bytes
}

/// Decode a single line, with or without its trailing newline.
///
/// # Test
///
/// ```
/// use mirror_link_codec::{decode, MessageKind};
///
/// let message = decode(b"{\"type\":\"ice_candidate\",\"data\":\"candidate:1\"}\r\n").unwrap();
/// assert_eq!(message.kind, MessageKind::IceCandidate);
/// assert_eq!(message.payload, "candidate:1");
///
/// assert!(decode(b"{\"type\":\"bye\",\"data\":\"\"}").is_err());
/// assert!(decode(b"   ").is_err());
/// ```
pub fn decode(line: &[u8]) -> Result<SignalingMessage, Error> {
    let text = std::str::from_utf8(line)?.trim();
    if text.is_empty() {
        return Err(Error::EmptyLine);
    }

    SignalingMessage::from_json(text)
}
