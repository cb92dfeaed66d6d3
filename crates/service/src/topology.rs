use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tokio_stream::wrappers::WatchStream;

/// Status of a discovered device as reported by the platform.
///
/// The platform reports it as a number, `0` to `4` in declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerStatus {
    Connected,
    Invited,
    Failed,
    Available,
    Unavailable,
}

impl From<i32> for PeerStatus {
    fn from(value: i32) -> Self {
        match value {
            0 => Self::Connected,
            1 => Self::Invited,
            2 => Self::Failed,
            3 => Self::Available,
            _ => Self::Unavailable,
        }
    }
}

/// A device found by discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    /// Human readable name, may be empty.
    pub name: String,
    /// Stable identifier used for connect requests, unique per peer.
    pub address: String,
    pub status: PeerStatus,
}

impl Peer {
    pub fn new(name: impl Into<String>, address: impl Into<String>, status: PeerStatus) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            status,
        }
    }

    pub fn display_name(&self) -> &str {
        if self.name.is_empty() { "Unknown" } else { &self.name }
    }
}

/// Which side of the signaling link this device runs.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Role {
    /// Rendezvous point, accepts the inbound signaling connection.
    Listener,
    /// Dials the group owner at the given address.
    Peer(String),
}

/// Outcome of group formation.
///
/// `is_owner` is never true while `group_formed` is false, the constructors
/// enforce it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Topology {
    group_formed: bool,
    is_owner: bool,
    owner_address: String,
}

impl Topology {
    pub fn new(group_formed: bool, is_owner: bool, owner_address: impl Into<String>) -> Self {
        Self {
            is_owner: group_formed && is_owner,
            owner_address: owner_address.into(),
            group_formed,
        }
    }

    pub fn formed(is_owner: bool, owner_address: impl Into<String>) -> Self {
        Self::new(true, is_owner, owner_address)
    }

    pub fn disconnected() -> Self {
        Self::default()
    }

    pub fn group_formed(&self) -> bool {
        self.group_formed
    }

    pub fn is_owner(&self) -> bool {
        self.is_owner
    }

    pub fn owner_address(&self) -> &str {
        &self.owner_address
    }

    /// Resolve the signaling role.
    ///
    /// The group owner listens, everybody else dials the owner. Returns
    /// `None` while no group is formed, or while the owner address is not
    /// resolved yet on the dialing side.
    ///
    /// ```
    /// use mirror_link_service::topology::{Role, Topology};
    ///
    /// assert_eq!(Topology::formed(true, "").role(), Some(Role::Listener));
    /// assert_eq!(
    ///     Topology::formed(false, "192.168.49.1").role(),
    ///     Some(Role::Peer("192.168.49.1".to_string()))
    /// );
    /// assert_eq!(Topology::formed(false, "").role(), None);
    /// assert_eq!(Topology::new(false, true, "192.168.49.1").role(), None);
    /// ```
    pub fn role(&self) -> Option<Role> {
        if !self.group_formed {
            return None;
        }

        if self.is_owner {
            Some(Role::Listener)
        } else if self.owner_address.is_empty() {
            None
        } else {
            Some(Role::Peer(self.owner_address.clone()))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryError {
    /// The platform refused the request, usually a missing permission.
    Permission(String),
    /// The radio is off or busy with something else.
    Radio(String),
    Busy,
    Unsupported,
}

impl std::error::Error for DiscoveryError {}

impl std::fmt::Display for DiscoveryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Permission(reason) => write!(f, "permission denied: {reason}"),
            Self::Radio(reason) => write!(f, "radio error: {reason}"),
            Self::Busy => write!(f, "discovery service busy"),
            Self::Unsupported => write!(f, "peer discovery not supported"),
        }
    }
}

/// Events pushed by the platform discovery service.
#[derive(Debug, Clone)]
pub enum DiscoveryEvent {
    PeersChanged(Vec<Peer>),
    TopologyChanged(Topology),
    Error(DiscoveryError),
}

/// The platform peer discovery and group formation service.
///
/// Every operation is a request. Its outcome is reported later through
/// [`TopologyManager::on_event`], an `Err` only means the request itself
/// could not be issued.
pub trait Discovery: Send + Sync + 'static {
    fn start_discovery(&self) -> Result<(), DiscoveryError>;
    fn stop_discovery(&self) -> Result<(), DiscoveryError>;
    fn connect(&self, address: &str) -> Result<(), DiscoveryError>;
    fn disconnect(&self) -> Result<(), DiscoveryError>;
}

/// Wraps the discovery service and publishes what it reports.
///
/// Peer sets and topology are published as watch values, a subscriber
/// always sees the latest snapshot but may miss intermediate ones.
pub struct TopologyManager<D> {
    discovery: D,
    // Serializes start and stop requests so that the discovering flag and the
    // platform state can't disagree.
    control: Mutex<()>,
    discovering: watch::Sender<bool>,
    peers: watch::Sender<Vec<Peer>>,
    topology: watch::Sender<Topology>,
    errors: broadcast::Sender<DiscoveryError>,
}

impl<D: Discovery> TopologyManager<D> {
    pub fn new(discovery: D) -> Self {
        Self {
            discovering: watch::channel(false).0,
            peers: watch::channel(Vec::new()).0,
            topology: watch::channel(Topology::disconnected()).0,
            errors: broadcast::channel(64).0,
            control: Mutex::new(()),
            discovery,
        }
    }

    /// Start discovering peers, a no-op while already discovering.
    ///
    /// Restarting discovery forgets the previously discovered peers.
    pub fn start_discovery(&self) -> Result<(), DiscoveryError> {
        let _guard = self.control.lock();
        if *self.discovering.borrow() {
            log::debug!("discovery already running");
            return Ok(());
        }

        self.peers.send_replace(Vec::new());
        if let Err(e) = self.discovery.start_discovery() {
            log::warn!("discovery start failed: err={e}");
            self.report(e.clone());
            return Err(e);
        }

        self.discovering.send_replace(true);
        log::info!("discovery started");

        Ok(())
    }

    /// Stop discovering, a no-op if not discovering.
    ///
    /// The discovering flag drops immediately, even if the platform fails to
    /// acknowledge the request.
    pub fn stop_discovery(&self) -> Result<(), DiscoveryError> {
        let _guard = self.control.lock();
        if !self.discovering.send_replace(false) {
            return Ok(());
        }

        log::info!("discovery stopped");
        if let Err(e) = self.discovery.stop_discovery() {
            log::warn!("discovery stop failed: err={e}");
            self.report(e.clone());
            return Err(e);
        }

        Ok(())
    }

    /// Ask the platform to form a group with the peer.
    ///
    /// Success only means the request was accepted, the result shows up as a
    /// topology update.
    pub fn connect(&self, address: &str) -> Result<(), DiscoveryError> {
        log::info!("group connect request: address={address}");

        self.discovery.connect(address).map_err(|e| {
            log::warn!("group connect request failed: address={address}, err={e}");
            self.report(e.clone());
            e
        })
    }

    /// Ask the platform to remove the current group.
    pub fn disconnect(&self) -> Result<(), DiscoveryError> {
        log::info!("group disconnect request");

        self.discovery.disconnect().map_err(|e| {
            log::warn!("group disconnect request failed: err={e}");
            self.report(e.clone());
            e
        })
    }

    /// Feed an event from the platform discovery service.
    pub fn on_event(&self, event: DiscoveryEvent) {
        match event {
            DiscoveryEvent::PeersChanged(peers) => {
                log::debug!("peers changed: count={}", peers.len());

                // The set is replaced as a whole, never merged with the
                // previous one.
                self.peers.send_replace(peers);
            }
            DiscoveryEvent::TopologyChanged(topology) => {
                log::info!(
                    "topology changed: group_formed={}, is_owner={}, owner={:?}",
                    topology.group_formed(),
                    topology.is_owner(),
                    topology.owner_address(),
                );

                self.topology.send_replace(topology);
            }
            DiscoveryEvent::Error(e) => {
                log::warn!("discovery error: err={e}");
                self.report(e);
            }
        }
    }

    pub fn current_peers(&self) -> Vec<Peer> {
        self.peers.borrow().clone()
    }

    pub fn current_topology(&self) -> Topology {
        self.topology.borrow().clone()
    }

    pub fn is_discovering(&self) -> bool {
        *self.discovering.borrow()
    }

    /// Stream of peer set snapshots, starting with the current one.
    pub fn peers(&self) -> WatchStream<Vec<Peer>> {
        WatchStream::new(self.peers.subscribe())
    }

    /// Stream of topology updates, starting with the current one.
    pub fn topology(&self) -> WatchStream<Topology> {
        WatchStream::new(self.topology.subscribe())
    }

    /// Stream of the discovering flag, starting with the current value.
    pub fn discovering(&self) -> WatchStream<bool> {
        WatchStream::new(self.discovering.subscribe())
    }

    /// Non fatal errors, delivered separately from topology updates.
    pub fn errors(&self) -> broadcast::Receiver<DiscoveryError> {
        self.errors.subscribe()
    }

    fn report(&self, error: DiscoveryError) {
        // Nobody listening is fine, the error was already logged.
        let _ = self.errors.send(error);
    }
}
