pub mod media;

pub use self::media::{
    CaptureConfig, DescriptionKind, MediaConfig, MediaConnectionState, MediaEngine, MediaEngineFactory, MediaError,
    MediaEvent, MediaEvents,
};

use codec::{MessageKind, SignalingMessage};
use tokio::sync::{
    mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel},
    oneshot, watch,
};

/// The externally visible state of a session.
///
/// `Idle -> Connecting -> {Connected, Failed}`. A transport loss while
/// connected goes back to `Idle`, a failed session stays failed until it is
/// closed explicitly.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum SessionState {
    #[default]
    Idle,
    Connecting,
    Connected,
    Failed,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Failed => "failed",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NegotiationError {
    Media(MediaError),
    /// The negotiator task is gone.
    Closed,
}

impl std::error::Error for NegotiationError {}

impl std::fmt::Display for NegotiationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Media(e) => write!(f, "{e}"),
            Self::Closed => write!(f, "negotiator closed"),
        }
    }
}

impl From<MediaError> for NegotiationError {
    fn from(value: MediaError) -> Self {
        Self::Media(value)
    }
}

/// Everything that can change the negotiator's state.
pub enum Input<M: MediaEngine> {
    CreatePeerConnection,
    AttachLocalSource(M::Capture),
    CreateOffer,
    /// Initiator path: connection, local source and offer in one go.
    Start(M::Capture),
    Remote(SignalingMessage),
    Media(MediaEvent<M::Track>),
    /// A signaling counterpart is connected.
    TransportReady,
    /// The signaling link went away.
    TransportLost,
    Close,
}

impl<M: MediaEngine> Input<M> {
    pub fn name(&self) -> &'static str {
        match self {
            Self::CreatePeerConnection => "create_peer_connection",
            Self::AttachLocalSource(_) => "attach_local_source",
            Self::CreateOffer => "create_offer",
            Self::Start(_) => "start",
            Self::Remote(_) => "remote",
            Self::Media(_) => "media",
            Self::TransportReady => "transport_ready",
            Self::TransportLost => "transport_lost",
            Self::Close => "close",
        }
    }
}

pub(crate) struct Command<M: MediaEngine> {
    pub(crate) input: Input<M>,
    pub(crate) reply: Option<oneshot::Sender<Result<(), NegotiationError>>>,
}

#[derive(Default)]
struct Connection {
    local_source: bool,
    remote_described: bool,
    // Our offer and the candidates gathered for it, kept until the answer
    // arrives in case the counterpart connects late and missed them.
    offer: Option<String>,
    local_candidates: Vec<String>,
}

/// Offer/answer state machine on top of a [`MediaEngine`].
///
/// All inputs go through [`Negotiator::handle`], the state is only ever
/// touched from there. Outbound signaling messages are pushed into the
/// outbound sender, the negotiator never sees the transport.
pub struct Negotiator<M: MediaEngine> {
    media: M,
    config: MediaConfig,
    outbound: UnboundedSender<SignalingMessage>,
    connection: Option<Connection>,
    // Candidates that arrived before the remote description was applied.
    pending_candidates: Vec<String>,
    state: watch::Sender<SessionState>,
    local_track: watch::Sender<Option<M::Track>>,
    remote_track: watch::Sender<Option<M::Track>>,
}

impl<M: MediaEngine> Negotiator<M> {
    pub fn new(media: M, config: MediaConfig, outbound: UnboundedSender<SignalingMessage>) -> Self {
        Self {
            state: watch::channel(SessionState::Idle).0,
            local_track: watch::channel(None).0,
            remote_track: watch::channel(None).0,
            pending_candidates: Vec::new(),
            connection: None,
            outbound,
            config,
            media,
        }
    }

    /// Run a negotiator in its own task.
    ///
    /// The media engine is built by `make_media` with a callback sink that
    /// feeds the same task. The task ends, closing the engine, when every
    /// [`EngineHandle`] is dropped.
    pub fn spawn<F>(make_media: F, config: MediaConfig, outbound: UnboundedSender<SignalingMessage>) -> EngineHandle<M>
    where
        F: FnOnce(MediaEvents<M>) -> M,
    {
        let (sender, receiver) = unbounded_channel();
        let media = make_media(MediaEvents(sender.downgrade()));
        let negotiator = Self::new(media, config, outbound);

        let handle = EngineHandle {
            state: negotiator.state.subscribe(),
            local_track: negotiator.local_track.subscribe(),
            remote_track: negotiator.remote_track.subscribe(),
            sender,
        };

        tokio::spawn(negotiator.run(receiver));
        handle
    }

    async fn run(mut self, mut receiver: UnboundedReceiver<Command<M>>) {
        while let Some(Command { input, reply }) = receiver.recv().await {
            let result = self.handle(input);
            if let Some(reply) = reply {
                let _ = reply.send(result);
            }
        }

        self.release();
        log::debug!("negotiator stopped");
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub fn local_track(&self) -> Option<M::Track> {
        self.local_track.borrow().clone()
    }

    pub fn remote_track(&self) -> Option<M::Track> {
        self.remote_track.borrow().clone()
    }

    pub fn has_connection(&self) -> bool {
        self.connection.is_some()
    }

    pub fn pending_candidates(&self) -> usize {
        self.pending_candidates.len()
    }

    /// The single entry point of the state machine.
    ///
    /// Only local intents return errors, and only when a media resource
    /// could not be acquired. Requests that the current state doesn't permit
    /// are ignored. Problems with remote messages or media callbacks are
    /// logged and reflected in the session state.
    pub fn handle(&mut self, input: Input<M>) -> Result<(), NegotiationError> {
        log::trace!("negotiator input: input={}, state={}", input.name(), self.state());

        match input {
            Input::CreatePeerConnection => self.create_peer_connection()?,
            Input::AttachLocalSource(capture) => self.attach_local_source(capture)?,
            Input::CreateOffer => self.create_offer()?,
            Input::Start(capture) => {
                self.attach_local_source(capture)?;
                self.create_offer()?;
            }
            Input::Remote(message) => self.on_remote(message),
            Input::Media(event) => self.on_media(event),
            Input::TransportReady => self.resend_offer(),
            Input::TransportLost => {
                if matches!(self.state(), SessionState::Connecting | SessionState::Connected) {
                    log::info!("signaling link lost, closing session");
                    self.release();
                }
            }
            Input::Close => self.release(),
        }

        Ok(())
    }

    fn create_peer_connection(&mut self) -> Result<(), NegotiationError> {
        if self.connection.is_some() || self.state() != SessionState::Idle {
            log::debug!("peer connection already exists: state={}", self.state());
            return Ok(());
        }

        self.media.create_connection(&self.config).map_err(|e| {
            log::error!("create peer connection failed: err={e}");
            e
        })?;

        self.connection = Some(Connection::default());
        log::info!("peer connection created: ice_servers={:?}", self.config.ice_servers);

        Ok(())
    }

    fn attach_local_source(&mut self, capture: M::Capture) -> Result<(), NegotiationError> {
        if self.state() != SessionState::Idle {
            log::debug!("local source ignored: state={}", self.state());
            return Ok(());
        }

        self.create_peer_connection()?;
        if self.connection.as_ref().is_some_and(|it| it.local_source) {
            log::debug!("local source already attached");
            return Ok(());
        }

        match self.media.attach_local_source(capture) {
            Ok(track) => {
                if let Some(connection) = self.connection.as_mut() {
                    connection.local_source = true;
                }

                self.local_track.send_replace(Some(track));
                log::info!(
                    "local source attached: resolution={}x{}@{}",
                    self.config.capture.width,
                    self.config.capture.height,
                    self.config.capture.fps,
                );

                Ok(())
            }
            Err(e) => {
                // Nothing of the attempt may stay behind.
                log::error!("attach local source failed: err={e}");
                self.release();
                Err(e.into())
            }
        }
    }

    fn create_offer(&mut self) -> Result<(), NegotiationError> {
        if self.state() != SessionState::Idle {
            log::debug!("offer ignored: state={}", self.state());
            return Ok(());
        }

        self.create_peer_connection()?;
        match self.media.create_offer() {
            Ok(payload) => {
                if let Some(connection) = self.connection.as_mut() {
                    connection.offer = Some(payload.clone());
                }

                self.set_state(SessionState::Connecting);
                self.emit(SignalingMessage::offer(payload));
                Ok(())
            }
            Err(MediaError::Resource(reason)) => {
                log::error!("create offer failed: reason={reason}");
                self.release();
                Err(MediaError::Resource(reason).into())
            }
            Err(e) => {
                self.fail("create offer", &e);
                Ok(())
            }
        }
    }

    // Nothing is queued by the transport, whatever was emitted while no
    // counterpart was connected is lost. An offer still waiting for its answer
    // goes out again, followed by its candidates.
    fn resend_offer(&mut self) {
        if self.state() != SessionState::Connecting {
            return;
        }

        let Some(connection) = self.connection.as_ref().filter(|it| !it.remote_described) else {
            return;
        };

        let Some(offer) = connection.offer.clone() else {
            return;
        };

        let candidates = connection.local_candidates.clone();
        log::info!("signaling link up, offer sent again: candidates={}", candidates.len());

        self.emit(SignalingMessage::offer(offer));
        for candidate in candidates {
            self.emit(SignalingMessage::ice_candidate(candidate));
        }
    }

    fn on_remote(&mut self, message: SignalingMessage) {
        log::debug!(
            "signaling message received: type={}, size={}",
            message.kind,
            message.payload.len()
        );

        if message.payload.is_empty() {
            log::warn!("signaling message dropped, empty payload: type={}", message.kind);
            return;
        }

        match message.kind {
            MessageKind::Offer => self.on_offer(message.payload),
            MessageKind::Answer => self.on_answer(message.payload),
            MessageKind::IceCandidate => self.on_candidate(message.payload),
        }
    }

    fn on_offer(&mut self, payload: String) {
        if self.state() != SessionState::Idle {
            log::debug!("offer ignored: state={}", self.state());
            return;
        }

        if let Err(e) = self.create_peer_connection() {
            log::error!("session failed, no peer connection for offer: err={e}");
            self.set_state(SessionState::Failed);
            return;
        }

        if !self.apply_remote_description(DescriptionKind::Offer, &payload) {
            return;
        }

        match self.media.create_answer() {
            Ok(answer) => {
                self.set_state(SessionState::Connecting);
                self.emit(SignalingMessage::answer(answer));
            }
            Err(e) => self.fail("create answer", &e),
        }
    }

    fn on_answer(&mut self, payload: String) {
        let described = self.connection.as_ref().is_some_and(|it| it.remote_described);
        if self.state() != SessionState::Connecting || described {
            log::debug!("answer ignored: state={}, described={described}", self.state());
            return;
        }

        self.apply_remote_description(DescriptionKind::Answer, &payload);
    }

    fn on_candidate(&mut self, payload: String) {
        if self.connection.as_ref().is_some_and(|it| it.remote_described) {
            self.add_candidate(&payload);
        } else {
            log::debug!("ice candidate buffered: pending={}", self.pending_candidates.len() + 1);
            self.pending_candidates.push(payload);
        }
    }

    // Returns whether the description was applied.
    fn apply_remote_description(&mut self, kind: DescriptionKind, payload: &str) -> bool {
        match self.media.set_remote_description(kind, payload) {
            Ok(()) => {
                if let Some(connection) = self.connection.as_mut() {
                    connection.remote_described = true;
                    connection.offer = None;
                    connection.local_candidates.clear();
                }

                log::info!("remote description applied: kind={kind:?}");
                for candidate in std::mem::take(&mut self.pending_candidates) {
                    if !self.add_candidate(&candidate) {
                        break;
                    }
                }

                self.state() != SessionState::Failed
            }
            Err(MediaError::Malformed(reason)) => {
                log::warn!("remote description dropped, malformed: kind={kind:?}, reason={reason}");
                false
            }
            Err(e) => {
                self.fail("set remote description", &e);
                false
            }
        }
    }

    // Returns false once the session failed.
    fn add_candidate(&mut self, payload: &str) -> bool {
        match self.media.add_remote_candidate(payload) {
            Ok(()) => true,
            Err(MediaError::Malformed(reason)) => {
                log::warn!("ice candidate dropped, malformed: reason={reason}");
                true
            }
            Err(e) => {
                self.fail("add ice candidate", &e);
                false
            }
        }
    }

    fn on_media(&mut self, event: MediaEvent<M::Track>) {
        // Late callbacks of a connection that was already released.
        if self.connection.is_none() {
            log::trace!("media event discarded, no connection");
            return;
        }

        match event {
            MediaEvent::ConnectionStateChanged(state) => {
                log::info!("media connection state changed: state={state:?}");

                match state {
                    MediaConnectionState::Connected => {
                        if self.state() == SessionState::Connecting {
                            self.set_state(SessionState::Connected);
                        }
                    }
                    MediaConnectionState::Failed | MediaConnectionState::Closed => {
                        if matches!(self.state(), SessionState::Connecting | SessionState::Connected) {
                            self.set_state(SessionState::Failed);
                        }
                    }
                    _ => (),
                }
            }
            MediaEvent::RemoteTrack(track) => {
                log::info!("remote track received");
                self.remote_track.send_replace(Some(track));
            }
            MediaEvent::LocalIceCandidate(payload) => {
                if let Some(connection) = self.connection.as_mut().filter(|it| it.offer.is_some()) {
                    connection.local_candidates.push(payload.clone());
                }

                self.emit(SignalingMessage::ice_candidate(payload));
            }
        }
    }

    fn fail(&mut self, operation: &str, error: &MediaError) {
        log::error!("session failed: operation={operation}, err={error}");
        self.set_state(SessionState::Failed);
    }

    /// Drop the connection and every media handle, back to idle.
    fn release(&mut self) {
        if self.connection.take().is_some() {
            self.media.close();
            log::info!("peer connection closed");
        }

        self.pending_candidates.clear();
        self.local_track.send_replace(None);
        self.remote_track.send_replace(None);
        self.set_state(SessionState::Idle);
    }

    fn set_state(&mut self, state: SessionState) {
        self.state.send_if_modified(|current| {
            if *current == state {
                return false;
            }

            log::info!("session state changed: from={current}, to={state}");
            *current = state;
            true
        });
    }

    fn emit(&self, message: SignalingMessage) {
        log::debug!("signaling message emitted: type={}", message.kind);

        if self.outbound.send(message).is_err() {
            log::debug!("signaling message discarded, outbound closed");
        }
    }
}

/// Cloneable handle to a negotiator running in its own task.
pub struct EngineHandle<M: MediaEngine> {
    sender: UnboundedSender<Command<M>>,
    state: watch::Receiver<SessionState>,
    local_track: watch::Receiver<Option<M::Track>>,
    remote_track: watch::Receiver<Option<M::Track>>,
}

impl<M: MediaEngine> Clone for EngineHandle<M> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            state: self.state.clone(),
            local_track: self.local_track.clone(),
            remote_track: self.remote_track.clone(),
        }
    }
}

impl<M: MediaEngine> EngineHandle<M> {
    /// Queue an input without waiting for it to be processed.
    pub fn post(&self, input: Input<M>) {
        if self.sender.send(Command { input, reply: None }).is_err() {
            log::debug!("negotiator input discarded, negotiator closed");
        }
    }

    /// Queue an input and wait for the outcome.
    pub async fn request(&self, input: Input<M>) -> Result<(), NegotiationError> {
        let (reply, receiver) = oneshot::channel();
        self.sender
            .send(Command {
                reply: Some(reply),
                input,
            })
            .map_err(|_| NegotiationError::Closed)?;

        receiver.await.map_err(|_| NegotiationError::Closed)?
    }

    pub fn remote(&self, message: SignalingMessage) {
        self.post(Input::Remote(message));
    }

    pub fn close(&self) {
        self.post(Input::Close);
    }

    pub fn state(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    pub fn local_track(&self) -> watch::Receiver<Option<M::Track>> {
        self.local_track.clone()
    }

    pub fn remote_track(&self) -> watch::Receiver<Option<M::Track>> {
        self.remote_track.clone()
    }
}
