use std::{future::Future, net::IpAddr, pin::pin, sync::Arc, time::Duration};

use anyhow::{Result, anyhow};
use mirror_link::prelude::*;
use parking_lot::Mutex;
use tokio::{sync::watch, task::JoinHandle, time::timeout};
use tokio_stream::StreamExt;

const WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
enum Request {
    Connect(String),
    Disconnect,
}

#[derive(Default, Clone)]
struct FakeDiscovery {
    requests: Arc<Mutex<Vec<Request>>>,
}

impl FakeDiscovery {
    fn requests(&self) -> Vec<Request> {
        self.requests.lock().clone()
    }
}

impl Discovery for FakeDiscovery {
    fn start_discovery(&self) -> Result<(), DiscoveryError> {
        Ok(())
    }

    fn stop_discovery(&self) -> Result<(), DiscoveryError> {
        Ok(())
    }

    fn connect(&self, address: &str) -> Result<(), DiscoveryError> {
        self.requests.lock().push(Request::Connect(address.to_string()));
        Ok(())
    }

    fn disconnect(&self) -> Result<(), DiscoveryError> {
        self.requests.lock().push(Request::Disconnect);
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Call {
    CreateConnection,
    AttachLocalSource,
    CreateOffer,
    CreateAnswer,
    SetRemote(DescriptionKind),
    AddCandidate,
    Close,
}

/// Connects as soon as both descriptions are in place and one remote
/// candidate arrived, like a real engine on a loopback network would.
struct FakeMedia {
    name: &'static str,
    calls: Arc<Mutex<Vec<Call>>>,
    events: MediaEvents<FakeMedia>,
    local: bool,
    remote: bool,
    candidate: bool,
    connected: bool,
}

impl FakeMedia {
    fn record(&self, call: Call) {
        self.calls.lock().push(call);
    }

    fn maybe_connected(&mut self) {
        if self.local && self.remote && self.candidate && !self.connected {
            self.connected = true;
            self.events.connection_state_changed(MediaConnectionState::Connected);
        }
    }
}

impl MediaEngine for FakeMedia {
    type Capture = &'static str;
    type Track = String;

    fn create_connection(&mut self, _: &MediaConfig) -> Result<(), MediaError> {
        self.record(Call::CreateConnection);
        Ok(())
    }

    fn attach_local_source(&mut self, capture: Self::Capture) -> Result<Self::Track, MediaError> {
        self.record(Call::AttachLocalSource);
        Ok(format!("{}:{capture}", self.name))
    }

    fn create_offer(&mut self) -> Result<String, MediaError> {
        self.record(Call::CreateOffer);
        self.local = true;
        self.events.local_ice_candidate(format!("candidate:{}", self.name));
        Ok(format!("offer:{}", self.name))
    }

    fn create_answer(&mut self) -> Result<String, MediaError> {
        self.record(Call::CreateAnswer);
        self.local = true;
        self.events.local_ice_candidate(format!("candidate:{}", self.name));
        self.maybe_connected();
        Ok(format!("answer:{}", self.name))
    }

    fn set_remote_description(&mut self, kind: DescriptionKind, payload: &str) -> Result<(), MediaError> {
        self.record(Call::SetRemote(kind));
        self.remote = true;

        if kind == DescriptionKind::Offer {
            self.events.remote_track(format!("remote:{payload}"));
        }

        self.maybe_connected();
        Ok(())
    }

    fn add_remote_candidate(&mut self, _: &str) -> Result<(), MediaError> {
        self.record(Call::AddCandidate);
        self.candidate = true;
        self.maybe_connected();
        Ok(())
    }

    fn close(&mut self) {
        self.record(Call::Close);
    }
}

#[derive(Clone)]
struct FakeFactory {
    name: &'static str,
    calls: Arc<Mutex<Vec<Call>>>,
}

impl FakeFactory {
    fn new(name: &'static str) -> Self {
        Self {
            calls: Default::default(),
            name,
        }
    }

    fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }
}

impl MediaEngineFactory for FakeFactory {
    type Engine = FakeMedia;

    fn create(&self, events: MediaEvents<Self::Engine>) -> Self::Engine {
        FakeMedia {
            name: self.name,
            calls: self.calls.clone(),
            events,
            local: false,
            remote: false,
            candidate: false,
            connected: false,
        }
    }
}

struct Node {
    discovery: FakeDiscovery,
    topology: Arc<TopologyManager<FakeDiscovery>>,
    orchestrator: Arc<Orchestrator<FakeDiscovery, FakeFactory>>,
    factory: FakeFactory,
    task: JoinHandle<()>,
}

impl Node {
    fn new(name: &'static str, options: OrchestratorOptions) -> Self {
        let discovery = FakeDiscovery::default();
        let topology = Arc::new(TopologyManager::new(discovery.clone()));
        let factory = FakeFactory::new(name);
        let orchestrator = Arc::new(Orchestrator::new(topology.clone(), factory.clone(), options));
        let task = tokio::spawn(orchestrator.clone().run());

        Self {
            orchestrator,
            discovery,
            topology,
            factory,
            task,
        }
    }

    fn set_topology(&self, topology: Topology) {
        self.topology.on_event(DiscoveryEvent::TopologyChanged(topology));
    }

    async fn wait_state(&self, state: SessionState) -> Result<()> {
        let mut receiver = self.orchestrator.subscribe_session_state();
        timeout(WAIT, receiver.wait_for(|it| *it == state)).await??;
        Ok(())
    }

    async fn wait_link(&self, value: bool) -> Result<()> {
        let mut receiver: watch::Receiver<bool> = self.orchestrator.signaling_link();
        timeout(WAIT, receiver.wait_for(|it| *it == value)).await??;
        Ok(())
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn options(port: u16) -> OrchestratorOptions {
    OrchestratorOptions {
        signaling: SignalingOptions {
            bind: IpAddr::from([127, 0, 0, 1]),
            port,
        },
        ..Default::default()
    }
}

async fn eventually<F, T>(mut poll: F) -> Result<T>
where
    F: FnMut() -> Option<T>,
{
    Ok(timeout(WAIT, async {
        loop {
            if let Some(value) = poll() {
                break value;
            }

            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await?)
}

async fn within<T>(future: impl Future<Output = T>) -> Result<T> {
    timeout(WAIT, future).await.map_err(|_| anyhow!("timed out"))
}

// Forms the group with `owner` as the listener, returns once both sides are
// linked.
async fn form_group() -> Result<(Node, Node)> {
    let owner = Node::new("owner", options(0));
    owner.set_topology(Topology::formed(true, "127.0.0.1"));

    let port = eventually(|| owner.orchestrator.signaling_addr().map(|it| it.port())).await?;

    let client = Node::new("client", options(port));
    client.set_topology(Topology::formed(false, "127.0.0.1"));

    owner.wait_link(true).await?;
    client.wait_link(true).await?;

    Ok((owner, client))
}

#[tokio::test]
async fn test_session_connects_end_to_end() -> Result<()> {
    let (owner, client) = form_group().await?;

    assert!(owner.orchestrator.is_topology_connected());
    assert_eq!(owner.orchestrator.session_state(), SessionState::Idle);
    assert_eq!(client.orchestrator.session_state(), SessionState::Idle);

    within(owner.orchestrator.start_session("screen")).await??;

    owner.wait_state(SessionState::Connected).await?;
    client.wait_state(SessionState::Connected).await?;

    assert_eq!(owner.orchestrator.local_track(), Some("owner:screen".to_string()));
    assert_eq!(
        client.orchestrator.remote_track(),
        Some("remote:offer:owner".to_string())
    );

    let owner_calls = owner.factory.calls();
    assert_eq!(
        &owner_calls[..4],
        &[
            Call::CreateConnection,
            Call::AttachLocalSource,
            Call::CreateOffer,
            Call::SetRemote(DescriptionKind::Answer),
        ]
    );
    assert!(owner_calls.contains(&Call::AddCandidate));

    let client_calls = client.factory.calls();
    assert!(client_calls.contains(&Call::SetRemote(DescriptionKind::Offer)));
    assert!(client_calls.contains(&Call::CreateAnswer));
    assert!(!client_calls.contains(&Call::CreateOffer));

    // Initiating again is harmless.
    within(owner.orchestrator.start_session("screen")).await??;
    assert_eq!(
        owner
            .factory
            .calls()
            .iter()
            .filter(|it| **it == Call::CreateOffer)
            .count(),
        1
    );

    Ok(())
}

#[tokio::test]
async fn test_offer_reaches_late_counterpart() -> Result<()> {
    let owner = Node::new("owner", options(0));
    owner.set_topology(Topology::formed(true, "127.0.0.1"));

    let port = eventually(|| owner.orchestrator.signaling_addr().map(|it| it.port())).await?;

    // Nobody dialed in yet, the offer has no one to go to.
    within(owner.orchestrator.start_session("screen")).await??;
    owner.wait_state(SessionState::Connecting).await?;

    let client = Node::new("client", options(port));
    client.set_topology(Topology::formed(false, "127.0.0.1"));

    owner.wait_state(SessionState::Connected).await?;
    client.wait_state(SessionState::Connected).await?;

    assert_eq!(
        client.orchestrator.remote_track(),
        Some("remote:offer:owner".to_string())
    );
    assert_eq!(
        owner
            .factory
            .calls()
            .iter()
            .filter(|it| **it == Call::CreateOffer)
            .count(),
        1
    );

    Ok(())
}

#[tokio::test]
async fn test_stop_session_keeps_signaling() -> Result<()> {
    let (owner, client) = form_group().await?;

    within(owner.orchestrator.start_session("screen")).await??;
    owner.wait_state(SessionState::Connected).await?;
    client.wait_state(SessionState::Connected).await?;

    owner.orchestrator.stop_session();
    owner.wait_state(SessionState::Idle).await?;

    eventually(|| owner.factory.calls().contains(&Call::Close).then_some(())).await?;
    assert!(owner.orchestrator.local_track().is_none());

    // Only the media session is gone, the group and its link stay.
    assert!(owner.orchestrator.has_session());
    assert!(owner.orchestrator.signaling_addr().is_some());
    assert!(*owner.orchestrator.signaling_link().borrow());
    assert!(*client.orchestrator.signaling_link().borrow());

    // Stopping twice is harmless.
    owner.orchestrator.stop_session();
    assert_eq!(
        owner
            .factory
            .calls()
            .iter()
            .filter(|it| **it == Call::Close)
            .count(),
        1
    );

    Ok(())
}

#[tokio::test]
async fn test_group_requests_reach_discovery() -> Result<()> {
    let node = Node::new("owner", options(0));

    node.orchestrator.connect_to_peer("aa:bb:cc:dd:ee:ff")?;
    assert_eq!(
        node.discovery.requests(),
        vec![Request::Connect("aa:bb:cc:dd:ee:ff".to_string())]
    );

    // Nothing happens until the platform reports the group.
    assert!(!node.orchestrator.has_session());

    node.set_topology(Topology::formed(true, "127.0.0.1"));
    eventually(|| node.orchestrator.signaling_addr()).await?;

    node.orchestrator.disconnect()?;
    assert_eq!(node.discovery.requests().last(), Some(&Request::Disconnect));

    // The session follows the platform, not the request.
    assert!(node.orchestrator.has_session());

    node.set_topology(Topology::disconnected());
    eventually(|| (!node.orchestrator.has_session()).then_some(())).await?;
    assert_eq!(node.orchestrator.session_state(), SessionState::Idle);
    assert!(!*node.orchestrator.signaling_link().borrow());

    Ok(())
}

#[tokio::test]
async fn test_topology_connected_is_observable() -> Result<()> {
    let node = Node::new("client", options(0));
    let mut connected = pin!(node.orchestrator.topology_connected());

    assert_eq!(within(connected.next()).await?, Some(false));

    // Owner address not known yet, nothing to dial but the group is there.
    node.set_topology(Topology::formed(false, ""));
    assert_eq!(within(connected.next()).await?, Some(true));
    assert!(node.orchestrator.is_topology_connected());
    assert!(!node.orchestrator.has_session());

    node.set_topology(Topology::disconnected());
    assert_eq!(within(connected.next()).await?, Some(false));

    Ok(())
}

#[tokio::test]
async fn test_pending_dial_is_abandoned() -> Result<()> {
    let node = Node::new("client", options(0));

    // Nothing answers on this address, the dial hangs or fails.
    node.set_topology(Topology::formed(false, "10.255.255.1"));
    tokio::time::sleep(Duration::from_millis(50)).await;

    // The group changes under the dial, the new role is taken right away.
    node.set_topology(Topology::formed(true, "127.0.0.1"));
    eventually(|| node.orchestrator.signaling_addr()).await?;
    assert!(node.orchestrator.has_session());

    Ok(())
}

#[tokio::test]
async fn test_group_loss_tears_down_both_sides() -> Result<()> {
    let (owner, client) = form_group().await?;

    within(owner.orchestrator.start_session("screen")).await??;
    owner.wait_state(SessionState::Connected).await?;
    client.wait_state(SessionState::Connected).await?;

    owner.set_topology(Topology::disconnected());
    client.set_topology(Topology::disconnected());

    owner.wait_state(SessionState::Idle).await?;
    client.wait_state(SessionState::Idle).await?;
    owner.wait_link(false).await?;
    client.wait_link(false).await?;

    eventually(|| (!owner.orchestrator.has_session()).then_some(())).await?;
    eventually(|| (!client.orchestrator.has_session()).then_some(())).await?;
    assert!(owner.orchestrator.signaling_addr().is_none());
    assert!(!owner.orchestrator.is_topology_connected());

    eventually(|| owner.factory.calls().contains(&Call::Close).then_some(())).await?;
    eventually(|| client.factory.calls().contains(&Call::Close).then_some(())).await?;

    Ok(())
}

#[tokio::test]
async fn test_counterpart_loss_returns_to_idle() -> Result<()> {
    let (owner, client) = form_group().await?;

    within(owner.orchestrator.start_session("screen")).await??;
    owner.wait_state(SessionState::Connected).await?;

    // Only the client side goes away, the owner sees its link drop.
    client.set_topology(Topology::disconnected());

    owner.wait_link(false).await?;
    owner.wait_state(SessionState::Idle).await?;

    // The owner keeps listening for the next counterpart.
    assert!(owner.orchestrator.has_session());
    assert!(owner.orchestrator.signaling_addr().is_some());

    Ok(())
}

#[tokio::test]
async fn test_start_session_without_group() -> Result<()> {
    let node = Node::new("alone", options(0));

    assert_eq!(
        within(node.orchestrator.start_session("screen")).await?,
        Err(SessionError::NoSession)
    );

    Ok(())
}

#[tokio::test]
async fn test_unreachable_owner_is_reported() -> Result<()> {
    // Find a port nobody listens on.
    let port = {
        let socket = std::net::TcpListener::bind("127.0.0.1:0")?;
        socket.local_addr()?.port()
    };

    let node = Node::new("client", options(port));
    let mut errors = node.orchestrator.errors();
    node.set_topology(Topology::formed(false, "127.0.0.1"));

    let error = within(errors.recv()).await??;
    assert!(matches!(error, SessionError::Signaling(_)));
    assert!(!node.orchestrator.has_session());

    Ok(())
}

#[tokio::test]
async fn test_discovery_auto_stop_is_cancellable() -> Result<()> {
    let node = Node::new(
        "scanner",
        OrchestratorOptions {
            discovery_timeout: Duration::from_millis(300),
            ..options(0)
        },
    );

    node.orchestrator.start_discovery()?;
    assert!(node.orchestrator.is_discovering());

    tokio::time::sleep(Duration::from_millis(150)).await;
    node.orchestrator.stop_discovery()?;
    assert!(!node.orchestrator.is_discovering());

    // Had the first timer survived the stop it would fire in the middle of
    // the second run.
    node.orchestrator.start_discovery()?;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(node.orchestrator.is_discovering());

    eventually(|| (!node.orchestrator.is_discovering()).then_some(())).await?;

    let mut discovering = node.orchestrator.discovering();
    assert_eq!(within(discovering.next()).await?, Some(false));

    Ok(())
}
