use std::{net::SocketAddr, sync::Arc};

use ahash::AHashMap;
use bytes::Bytes;
use parking_lot::RwLock;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};

#[derive(Default)]
struct Table {
    sockets: AHashMap<SocketAddr, UnboundedSender<Bytes>>,
    active: Option<SocketAddr>,
}

/// Routes outbound lines to the signaling counterpart.
///
/// Every open connection has a writer queue, but only one of them, the
/// active one, is the counterpart. The first connection registered while
/// there is no counterpart becomes it.
#[derive(Clone, Default)]
pub struct Router(Arc<RwLock<Table>>);

impl Router {
    /// Register a connection and get its writer queue.
    ///
    /// Returns whether the connection became the counterpart.
    pub fn get_receiver(&self, addr: SocketAddr) -> (UnboundedReceiver<Bytes>, bool) {
        let (sender, receiver) = unbounded_channel();

        let mut table = self.0.write();
        table.sockets.insert(addr, sender);

        let is_active = table.active.is_none();
        if is_active {
            table.active = Some(addr);
        }

        (receiver, is_active)
    }

    pub fn is_active(&self, addr: &SocketAddr) -> bool {
        self.0.read().active.as_ref() == Some(addr)
    }

    pub fn active(&self) -> Option<SocketAddr> {
        self.0.read().active
    }

    pub fn len(&self) -> usize {
        self.0.read().sockets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Queue a line for the counterpart.
    ///
    /// Returns false if there is no counterpart or its writer is gone, in
    /// which case the line is discarded. A gone writer is cleaned up by its
    /// own connection, not here.
    pub fn send(&self, bytes: Bytes) -> bool {
        let table = self.0.read();
        table
            .active
            .and_then(|addr| table.sockets.get(&addr))
            .is_some_and(|sender| sender.send(bytes).is_ok())
    }

    /// Delete a connection, returns whether it was the counterpart.
    pub fn remove(&self, addr: &SocketAddr) -> bool {
        let mut table = self.0.write();
        drop(table.sockets.remove(addr));

        if table.active.as_ref() == Some(addr) {
            table.active = None;
            true
        } else {
            false
        }
    }

    pub fn clear(&self) {
        let mut table = self.0.write();
        table.sockets.clear();
        table.active = None;
    }
}
