pub mod router;

use std::{
    net::{IpAddr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use anyhow::Result;
use bytes::Bytes;
use codec::{LineDecoder, SignalingMessage};
use parking_lot::Mutex;
use service::topology::Role;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    sync::{
        mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel},
        watch,
    },
    task::JoinSet,
};

use self::router::Router;
use crate::statistics::{Statistics, Stats};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalingOptions {
    /// Listen address, only used by the listener role.
    pub bind: IpAddr,
    /// Shared by both roles, the peer dials the owner on this port.
    pub port: u16,
}

impl Default for SignalingOptions {
    fn default() -> Self {
        Self {
            bind: IpAddr::from([0, 0, 0, 0]),
            port: 8888,
        }
    }
}

/// What the counterpart side of a channel did, in the order it happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// A counterpart is connected, the link is up.
    Connected(SocketAddr),
    Message(SignalingMessage),
    /// The counterpart went away, the link is down.
    Disconnected(SocketAddr),
}

// State of one `start`, everything in here goes away with `stop`.
struct Running {
    router: Router,
    link: Arc<watch::Sender<bool>>,
    local_addr: SocketAddr,
    // Dropping the set aborts the accept loop and every connection.
    #[allow(dead_code)]
    workers: JoinSet<()>,
}

/// Line based signaling link between the two members of a group.
///
/// The group owner runs the [`Role::Listener`] side, any other member dials
/// the owner with [`Role::Peer`]. Both sides exchange the same
/// newline delimited messages, see [`codec`].
///
/// A listener accepts every inbound connection, but only the first one is
/// the counterpart. Lines read from the others are counted and dropped, and
/// nothing is written to them. When the counterpart goes away the next
/// accepted connection takes its place.
pub struct SignalingChannel {
    role: Role,
    options: SignalingOptions,
    statistics: Statistics,
    running: Mutex<Option<Running>>,
}

impl SignalingChannel {
    pub fn new(role: Role, options: SignalingOptions) -> Self {
        Self {
            statistics: Statistics::default(),
            running: Mutex::new(None),
            options,
            role,
        }
    }

    pub fn role(&self) -> &Role {
        &self.role
    }

    /// Bind or dial, depending on the role.
    ///
    /// Returns a fresh stream of events for this start: the counterpart
    /// connecting, its messages and its disconnect. The stream ends when the
    /// channel is stopped. Starting a running channel stops it first.
    ///
    /// Failing to bind the listener or to reach the owner is returned to the
    /// caller, nothing is left running in that case.
    pub async fn start(&self) -> Result<UnboundedReceiver<ChannelEvent>> {
        self.stop();

        let (sender, receiver) = unbounded_channel();
        let router = Router::default();
        let link = Arc::new(watch::channel(false).0);
        let mut workers = JoinSet::new();

        let local_addr = match &self.role {
            Role::Listener => {
                let listener = TcpListener::bind((self.options.bind, self.options.port)).await?;
                let local_addr = listener.local_addr()?;

                workers.spawn(
                    Connection {
                        statistics: self.statistics.clone(),
                        router: router.clone(),
                        link: link.clone(),
                        inbound: sender,
                        local_addr,
                    }
                    .accept(listener),
                );

                log::info!("signaling listening: listen={local_addr}, role=listener");
                local_addr
            }
            Role::Peer(address) => {
                let socket = TcpStream::connect((address.as_str(), self.options.port)).await?;
                let local_addr = socket.local_addr()?;
                let peer_addr = socket.peer_addr()?;

                let (writer, _) = router.get_receiver(peer_addr);
                link.send_replace(true);
                let _ = sender.send(ChannelEvent::Connected(peer_addr));

                workers.spawn(
                    Connection {
                        statistics: self.statistics.clone(),
                        router: router.clone(),
                        link: link.clone(),
                        inbound: sender,
                        local_addr,
                    }
                    .serve(socket, peer_addr, writer),
                );

                log::info!("signaling connected: addr={peer_addr}, interface={local_addr}, role=peer");
                local_addr
            }
        };

        let previous = self.running.lock().replace(Running {
            router,
            link,
            local_addr,
            workers,
        });

        // A concurrent start won the race, the older one is discarded.
        drop(previous);

        Ok(receiver)
    }

    /// Close the listener and every connection.
    ///
    /// Takes effect immediately, lines still queued for writing are
    /// discarded. Safe to call any number of times.
    pub fn stop(&self) {
        let Some(running) = self.running.lock().take() else {
            return;
        };

        running.router.clear();
        running.link.send_replace(false);

        log::info!("signaling stopped: interface={}", running.local_addr);
    }

    /// Queue a message for the counterpart without waiting for the write.
    ///
    /// Returns false if the message was dropped because there is no
    /// counterpart right now.
    pub fn send(&self, message: &SignalingMessage) -> bool {
        let bytes = Bytes::from(codec::encode(message));

        let is_sent = self
            .running
            .lock()
            .as_ref()
            .is_some_and(|running| running.router.send(bytes));

        if !is_sent {
            log::debug!("signaling message dropped, no counterpart: type={}", message.kind);
        }

        is_sent
    }

    /// Whether a counterpart is connected.
    ///
    /// The receiver belongs to the current `start`, a stopped channel hands
    /// out a receiver that stays false.
    pub fn link(&self) -> watch::Receiver<bool> {
        match self.running.lock().as_ref() {
            Some(running) => running.link.subscribe(),
            None => watch::channel(false).1,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    /// The bound listen address, or the local end of the dialed connection.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().as_ref().map(|it| it.local_addr)
    }

    pub fn statistics(&self) -> Statistics {
        self.statistics.clone()
    }
}

impl Drop for SignalingChannel {
    fn drop(&mut self) {
        self.stop();
    }
}

#[derive(Clone)]
struct Connection {
    statistics: Statistics,
    router: Router,
    link: Arc<watch::Sender<bool>>,
    inbound: UnboundedSender<ChannelEvent>,
    local_addr: SocketAddr,
}

impl Connection {
    async fn accept(self, listener: TcpListener) {
        let local_addr = self.local_addr;
        let mut sockets = JoinSet::new();

        loop {
            tokio::select! {
                ret = listener.accept() => {
                    let (socket, address) = match ret {
                        Ok(it) => it,
                        Err(e) => {
                            // Usually out of file descriptors, keep listening
                            // but don't spin on it.
                            log::warn!("signaling accept failed: interface={local_addr:?}, err={e}");
                            tokio::time::sleep(Duration::from_millis(100)).await;
                            continue;
                        }
                    };

                    self.statistics.report(&[Stats::AcceptedConnections(1)]);
                    log::info!("signaling accept: addr={address:?}, interface={local_addr:?}");

                    let (writer, is_active) = self.router.get_receiver(address);
                    if is_active {
                        self.link.send_replace(true);
                        let _ = self.inbound.send(ChannelEvent::Connected(address));
                    } else {
                        log::warn!(
                            "signaling counterpart already connected, connection is not routed: addr={address:?}, interface={local_addr:?}"
                        );
                    }

                    sockets.spawn(self.clone().serve(socket, address, writer));
                }
                Some(_) = sockets.join_next(), if !sockets.is_empty() => {}
            }
        }
    }

    async fn serve(self, mut socket: TcpStream, address: SocketAddr, mut writer: UnboundedReceiver<Bytes>) {
        let local_addr = self.local_addr;
        let mut decoder = LineDecoder::default();

        // Signaling is latency sensitive and the lines are small.
        if let Err(e) = socket.set_nodelay(true) {
            log::error!("signaling socket set nodelay failed!: addr={address}, err={e}");
        }

        loop {
            tokio::select! {
                ret = socket.read_buf(decoder.buffer_mut()) => {
                    match ret {
                        // The remote closed its end.
                        Ok(0) => break,
                        Ok(_) => (),
                        Err(e) => {
                            log::warn!("signaling read failed: addr={address:?}, err={e}");
                            break;
                        }
                    }

                    while let Some(ret) = decoder.next_message() {
                        let message = match ret {
                            Ok(it) => it,
                            Err(e) => {
                                self.statistics.report(&[Stats::MalformedMessages(1)]);
                                log::warn!("signaling message dropped: addr={address:?}, err={e}");
                                continue;
                            }
                        };

                        if !self.router.is_active(&address) {
                            self.statistics.report(&[Stats::UnroutedMessages(1)]);
                            log::debug!("signaling message not routed: addr={address:?}, type={}", message.kind);
                            continue;
                        }

                        self.statistics.report(&[Stats::ReceivedMessages(1)]);
                        if self.inbound.send(ChannelEvent::Message(message)).is_err() {
                            log::debug!("signaling message discarded, inbound closed: addr={address:?}");
                        }
                    }
                }
                Some(bytes) = writer.recv() => {
                    if let Err(e) = socket.write_all(&bytes).await {
                        log::warn!("signaling write failed: addr={address:?}, err={e}");
                        break;
                    }

                    self.statistics.report(&[Stats::SentMessages(1)]);
                }
            }
        }

        if self.router.remove(&address) {
            self.link.send_replace(false);
            let _ = self.inbound.send(ChannelEvent::Disconnected(address));
        }

        log::info!("signaling disconnect: addr={address:?}, interface={local_addr:?}");
    }
}
