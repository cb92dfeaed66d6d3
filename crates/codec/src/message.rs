use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::Error;

/// The three kinds of negotiation messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Offer,
    Answer,
    IceCandidate,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Offer => "offer",
            Self::Answer => "answer",
            Self::IceCandidate => "ice_candidate",
        }
    }

    /// Offers and answers carry a session description, candidates don't.
    pub fn is_description(&self) -> bool {
        matches!(self, Self::Offer | Self::Answer)
    }
}

impl FromStr for MessageKind {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Ok(match value {
            "offer" => Self::Offer,
            "answer" => Self::Answer,
            "ice_candidate" => Self::IceCandidate,
            _ => return Err(Error::UnknownKind(value.to_string())),
        })
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A signaling message.
///
/// Immutable once built, one per exchange event. The payload is whatever
/// the media engine serialized, a session description for offers and answers
/// and a connectivity candidate for ice candidates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalingMessage {
    pub kind: MessageKind,
    pub payload: String,
}

#[derive(Serialize)]
struct WireRef<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
    data: &'a str,
}

#[derive(Deserialize)]
struct Wire {
    #[serde(rename = "type")]
    kind: String,
    data: String,
}

impl SignalingMessage {
    pub fn new(kind: MessageKind, payload: impl Into<String>) -> Self {
        Self {
            kind,
            payload: payload.into(),
        }
    }

    pub fn offer(payload: impl Into<String>) -> Self {
        Self::new(MessageKind::Offer, payload)
    }

    pub fn answer(payload: impl Into<String>) -> Self {
        Self::new(MessageKind::Answer, payload)
    }

    pub fn ice_candidate(payload: impl Into<String>) -> Self {
        Self::new(MessageKind::IceCandidate, payload)
    }

    pub fn to_json(&self) -> String {
        // Serializing two borrowed strings into a json object can't fail.
        serde_json::to_string(&WireRef {
            kind: self.kind.as_str(),
            data: &self.payload,
        })
        .unwrap_or_default()
    }

    pub fn from_json(text: &str) -> Result<Self, Error> {
        let wire = serde_json::from_str::<Wire>(text)?;
        Ok(Self {
            kind: wire.kind.parse()?,
            payload: wire.data,
        })
    }
}
