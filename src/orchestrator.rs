use std::{net::SocketAddr, sync::Arc, time::Duration};

use parking_lot::Mutex;
use service::{
    negotiation::{EngineHandle, Input, MediaConfig, MediaEngine, MediaEngineFactory, NegotiationError, Negotiator, SessionState},
    topology::{Discovery, DiscoveryError, Peer, Role, Topology, TopologyManager},
};
use tokio::{
    sync::{broadcast, mpsc::unbounded_channel, watch},
    task::{AbortHandle, JoinSet},
};
use tokio_stream::{Stream, StreamExt, wrappers::WatchStream};

use crate::server::{ChannelEvent, SignalingChannel, SignalingOptions};

type Capture<F> = <<F as MediaEngineFactory>::Engine as MediaEngine>::Capture;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// No group is formed, there is nothing to start a session on.
    NoSession,
    Discovery(DiscoveryError),
    Negotiation(NegotiationError),
    /// The signaling listener could not be bound or the owner could not be
    /// reached.
    Signaling(String),
}

impl std::error::Error for SessionError {}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoSession => write!(f, "no group formed"),
            Self::Discovery(e) => write!(f, "discovery: {e}"),
            Self::Negotiation(e) => write!(f, "negotiation: {e}"),
            Self::Signaling(e) => write!(f, "signaling: {e}"),
        }
    }
}

impl From<DiscoveryError> for SessionError {
    fn from(value: DiscoveryError) -> Self {
        Self::Discovery(value)
    }
}

impl From<NegotiationError> for SessionError {
    fn from(value: NegotiationError) -> Self {
        Self::Negotiation(value)
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorOptions {
    pub signaling: SignalingOptions,
    pub media: MediaConfig,
    /// Discovery stops by itself after this long.
    pub discovery_timeout: Duration,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self {
            signaling: SignalingOptions::default(),
            media: MediaConfig::default(),
            discovery_timeout: Duration::from_secs(30),
        }
    }
}

// One signaling channel and one negotiator, built when a group forms and
// dropped as a whole when it goes away.
struct Session<M: MediaEngine> {
    channel: Arc<SignalingChannel>,
    engine: EngineHandle<M>,
    workers: JoinSet<()>,
}

impl<M: MediaEngine> Session<M> {
    fn close(mut self) {
        self.workers.abort_all();
        self.channel.stop();
        self.engine.close();
    }
}

/// Glue between group formation, signaling and negotiation.
///
/// Nothing happens until [`Orchestrator::run`] is driven. From then on every
/// formed group gets exactly one signaling channel in the resolved role and
/// one fresh negotiator, wired to each other. Both are torn down when the
/// group goes away.
pub struct Orchestrator<D, F: MediaEngineFactory> {
    topology: Arc<TopologyManager<D>>,
    factory: F,
    options: OrchestratorOptions,
    session: Mutex<Option<Session<F::Engine>>>,
    state: Arc<watch::Sender<SessionState>>,
    link: Arc<watch::Sender<bool>>,
    auto_stop: Mutex<Option<AbortHandle>>,
    errors: broadcast::Sender<SessionError>,
}

impl<D: Discovery, F: MediaEngineFactory> Orchestrator<D, F> {
    pub fn new(topology: Arc<TopologyManager<D>>, factory: F, options: OrchestratorOptions) -> Self {
        Self {
            state: Arc::new(watch::channel(SessionState::Idle).0),
            link: Arc::new(watch::channel(false).0),
            errors: broadcast::channel(64).0,
            auto_stop: Mutex::new(None),
            session: Mutex::new(None),
            topology,
            factory,
            options,
        }
    }

    pub fn topology_manager(&self) -> &Arc<TopologyManager<D>> {
        &self.topology
    }

    /// Follow topology updates until the task is dropped.
    ///
    /// Discovery errors are forwarded to [`Orchestrator::errors`] along the
    /// way.
    pub async fn run(self: Arc<Self>) {
        let mut updates = self.topology.topology();
        let mut discovery_errors = self.topology.errors();

        loop {
            tokio::select! {
                Some(topology) = updates.next() => {
                    let mut next = Some(topology);

                    // Dialing the owner can take as long as the connect
                    // timeout, a newer topology abandons it.
                    while let Some(role) = next.take().and_then(|it| self.on_topology(it)) {
                        tokio::select! {
                            _ = self.open(role) => (),
                            Some(topology) = updates.next() => {
                                log::info!("session opening abandoned, topology changed");
                                next = Some(topology);
                            }
                        }
                    }
                }
                ret = discovery_errors.recv() => {
                    match ret {
                        Ok(e) => self.report(SessionError::Discovery(e)),
                        Err(broadcast::error::RecvError::Lagged(count)) => {
                            log::warn!("discovery errors lagged: count={count}");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
                else => break,
            }
        }

        self.teardown();
    }

    // Returns the role to open a session in, if one is needed.
    fn on_topology(&self, topology: Topology) -> Option<Role> {
        if !topology.group_formed() {
            self.teardown();
            return None;
        }

        if self.session.lock().is_some() {
            log::debug!("session already running, topology update ignored");
            return None;
        }

        let role = topology.role();
        if role.is_none() {
            log::debug!("group formed, owner address not resolved yet");
        }

        role
    }

    async fn open(&self, role: Role) {
        log::info!("session opening: role={role:?}");

        let channel = Arc::new(SignalingChannel::new(role, self.options.signaling.clone()));
        let mut inbound = match channel.start().await {
            Ok(it) => it,
            Err(e) => {
                log::error!("signaling start failed: err={e}");
                self.report(SessionError::Signaling(e.to_string()));
                return;
            }
        };

        let (outbound_sender, mut outbound) = unbounded_channel();
        let engine = Negotiator::spawn(
            |events| self.factory.create(events),
            self.options.media.clone(),
            outbound_sender,
        );

        let mut workers = JoinSet::new();

        // Link changes travel in the same stream as the messages, a
        // counterpart that drops and reconnects is never missed and its
        // messages can't overtake the disconnect.
        {
            let engine = engine.clone();
            let link = self.link.clone();
            workers.spawn(async move {
                while let Some(event) = inbound.recv().await {
                    match event {
                        ChannelEvent::Connected(address) => {
                            log::info!("signaling counterpart connected: addr={address}");

                            engine.post(Input::TransportReady);
                            link.send_replace(true);
                        }
                        ChannelEvent::Message(message) => engine.remote(message),
                        ChannelEvent::Disconnected(address) => {
                            log::info!("signaling counterpart disconnected: addr={address}");

                            engine.post(Input::TransportLost);
                            link.send_replace(false);
                        }
                    }
                }
            });
        }

        {
            let channel = channel.clone();
            workers.spawn(async move {
                while let Some(message) = outbound.recv().await {
                    channel.send(&message);
                }
            });
        }

        {
            let state = self.state.clone();
            let mut receiver = engine.state();
            workers.spawn(async move {
                loop {
                    state.send_replace(*receiver.borrow_and_update());
                    if receiver.changed().await.is_err() {
                        break;
                    }
                }
            });
        }

        let session = Session {
            channel,
            engine,
            workers,
        };

        let mut current = self.session.lock();
        if current.is_some() {
            drop(current);
            session.close();
        } else {
            current.replace(session);
        }
    }

    fn teardown(&self) {
        let Some(session) = self.session.lock().take() else {
            return;
        };

        session.close();
        self.link.send_replace(false);
        self.state.send_replace(SessionState::Idle);

        log::info!("session closed");
    }

    fn report(&self, error: SessionError) {
        let _ = self.errors.send(error);
    }

    /// Start discovery and arm the auto stop timer.
    ///
    /// A running timer is re-armed.
    pub fn start_discovery(&self) -> Result<(), SessionError> {
        self.topology.start_discovery()?;

        let topology = self.topology.clone();
        let timeout = self.options.discovery_timeout;
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;

            log::info!("discovery timed out: timeout={timeout:?}");
            let _ = topology.stop_discovery();
        });

        if let Some(previous) = self.auto_stop.lock().replace(timer.abort_handle()) {
            previous.abort();
        }

        Ok(())
    }

    /// Stop discovery and cancel the auto stop timer.
    pub fn stop_discovery(&self) -> Result<(), SessionError> {
        if let Some(timer) = self.auto_stop.lock().take() {
            timer.abort();
        }

        Ok(self.topology.stop_discovery()?)
    }

    pub fn connect_to_peer(&self, address: &str) -> Result<(), SessionError> {
        Ok(self.topology.connect(address)?)
    }

    /// Remove the group, the session follows once the platform confirms.
    pub fn disconnect(&self) -> Result<(), SessionError> {
        Ok(self.topology.disconnect()?)
    }

    /// Initiate the session from this side: attach the capture source and
    /// send an offer.
    ///
    /// Does nothing if a session is already being negotiated.
    pub async fn start_session(&self, capture: Capture<F>) -> Result<(), SessionError> {
        let engine = self
            .session
            .lock()
            .as_ref()
            .map(|it| it.engine.clone())
            .ok_or(SessionError::NoSession)?;

        engine.request(Input::Start(capture)).await.map_err(|e| {
            log::error!("session start failed: err={e}");

            let e = SessionError::from(e);
            self.report(e.clone());
            e
        })
    }

    /// Close the media session, the signaling link stays up.
    pub fn stop_session(&self) {
        if let Some(session) = self.session.lock().as_ref() {
            session.engine.close();
        }
    }

    pub fn session_state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn subscribe_session_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Whether the signaling counterpart of the current session is connected.
    pub fn signaling_link(&self) -> watch::Receiver<bool> {
        self.link.subscribe()
    }

    /// Local address of the current signaling channel.
    pub fn signaling_addr(&self) -> Option<SocketAddr> {
        self.session.lock().as_ref().and_then(|it| it.channel.local_addr())
    }

    pub fn has_session(&self) -> bool {
        self.session.lock().is_some()
    }

    pub fn peers(&self) -> WatchStream<Vec<Peer>> {
        self.topology.peers()
    }

    pub fn current_peers(&self) -> Vec<Peer> {
        self.topology.current_peers()
    }

    pub fn is_topology_connected(&self) -> bool {
        self.topology.current_topology().group_formed()
    }

    /// Whether a group is formed, starting with the current value.
    ///
    /// Only changes are yielded, repeated topology updates with the same
    /// outcome are folded.
    pub fn topology_connected(&self) -> impl Stream<Item = bool> + Send + 'static {
        let mut last = None;
        self.topology.topology().filter_map(move |topology| {
            let is_connected = topology.group_formed();
            (last.replace(is_connected) != Some(is_connected)).then_some(is_connected)
        })
    }

    pub fn is_discovering(&self) -> bool {
        self.topology.is_discovering()
    }

    pub fn discovering(&self) -> WatchStream<bool> {
        self.topology.discovering()
    }

    pub fn local_track(&self) -> Option<<F::Engine as MediaEngine>::Track> {
        self.session
            .lock()
            .as_ref()
            .and_then(|it| it.engine.local_track().borrow().clone())
    }

    pub fn remote_track(&self) -> Option<<F::Engine as MediaEngine>::Track> {
        self.session
            .lock()
            .as_ref()
            .and_then(|it| it.engine.remote_track().borrow().clone())
    }

    pub fn errors(&self) -> broadcast::Receiver<SessionError> {
        self.errors.subscribe()
    }
}

impl<D, F: MediaEngineFactory> Drop for Orchestrator<D, F> {
    fn drop(&mut self) {
        if let Some(timer) = self.auto_stop.get_mut().take() {
            timer.abort();
        }

        if let Some(session) = self.session.get_mut().take() {
            session.close();
        }
    }
}
