use super::{Command, Input};

use tokio::sync::mpsc::WeakUnboundedSender;

/// Capture settings handed to the media engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureConfig {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            fps: 30,
        }
    }
}

/// Configuration for `create_connection`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaConfig {
    /// STUN/TURN urls used for connectivity checks.
    pub ice_servers: Vec<String>,
    pub capture: CaptureConfig,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            capture: CaptureConfig::default(),
        }
    }
}

/// Which half of the description exchange a remote payload is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptionKind {
    Offer,
    Answer,
}

/// Connection state as reported by the media engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    /// The payload could not be decoded. The message is dropped, the session
    /// carries on.
    Malformed(String),
    /// The engine understood the payload but refused it.
    Rejected(String),
    /// A connection or a local source could not be created.
    Resource(String),
}

impl std::error::Error for MediaError {}

impl std::fmt::Display for MediaError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Malformed(reason) => write!(f, "malformed payload: {reason}"),
            Self::Rejected(reason) => write!(f, "rejected by media engine: {reason}"),
            Self::Resource(reason) => write!(f, "media resource unavailable: {reason}"),
        }
    }
}

/// Callbacks of the media engine, see [`MediaEvents`].
#[derive(Debug, Clone)]
pub enum MediaEvent<T> {
    ConnectionStateChanged(MediaConnectionState),
    RemoteTrack(T),
    LocalIceCandidate(String),
}

/// The media plane.
///
/// Codec selection, bitrate and NAT traversal all live behind this trait.
/// Payloads are opaque strings in the engine's own serialization, the
/// negotiator only moves them between the engine and the signaling link.
pub trait MediaEngine: Send + 'static {
    /// Platform capture source, e.g. a screen capturer.
    type Capture: Send + 'static;
    /// Handle to a local or remote media track.
    type Track: Clone + Send + Sync + 'static;

    fn create_connection(&mut self, config: &MediaConfig) -> Result<(), MediaError>;
    fn attach_local_source(&mut self, capture: Self::Capture) -> Result<Self::Track, MediaError>;
    fn create_offer(&mut self) -> Result<String, MediaError>;
    fn create_answer(&mut self) -> Result<String, MediaError>;
    fn set_remote_description(&mut self, kind: DescriptionKind, payload: &str) -> Result<(), MediaError>;
    fn add_remote_candidate(&mut self, payload: &str) -> Result<(), MediaError>;
    /// Release the connection and every track, must be safe to call twice.
    fn close(&mut self);
}

/// Creates one media engine per session.
pub trait MediaEngineFactory: Send + Sync + 'static {
    type Engine: MediaEngine;

    fn create(&self, events: MediaEvents<Self::Engine>) -> Self::Engine;
}

/// Sink for media engine callbacks.
///
/// Everything sent here is funneled into the negotiator task that owns the
/// engine. Once that task is gone the events are silently discarded.
pub struct MediaEvents<M: MediaEngine>(pub(super) WeakUnboundedSender<Command<M>>);

impl<M: MediaEngine> Clone for MediaEvents<M> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<M: MediaEngine> MediaEvents<M> {
    pub fn connection_state_changed(&self, state: MediaConnectionState) {
        self.send(MediaEvent::ConnectionStateChanged(state));
    }

    pub fn remote_track(&self, track: M::Track) {
        self.send(MediaEvent::RemoteTrack(track));
    }

    pub fn local_ice_candidate(&self, payload: impl Into<String>) {
        self.send(MediaEvent::LocalIceCandidate(payload.into()));
    }

    fn send(&self, event: MediaEvent<M::Track>) {
        if let Some(sender) = self.0.upgrade() {
            let _ = sender.send(Command {
                input: Input::Media(event),
                reply: None,
            });
        }
    }
}
