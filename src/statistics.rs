use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

/// The type of information passed to the statistics counters
#[derive(Debug, Clone, Copy)]
pub enum Stats {
    ReceivedMessages(usize),
    SentMessages(usize),
    MalformedMessages(usize),
    UnroutedMessages(usize),
    AcceptedConnections(usize),
}

pub trait Number {
    fn add(&self, value: usize);
    fn get(&self) -> usize;
}

#[derive(Default)]
pub struct Count(AtomicUsize);

impl Number for Count {
    fn add(&self, value: usize) {
        self.0.fetch_add(value, Ordering::Relaxed);
    }

    fn get(&self) -> usize {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Default)]
pub struct Counts<T> {
    pub received_messages: T,
    pub sent_messages: T,
    pub malformed_messages: T,
    pub unrouted_messages: T,
    pub accepted_connections: T,
}

impl<T: Number> Counts<T> {
    /// # Example
    ///
    /// ```
    /// use mirror_link::statistics::*;
    ///
    /// let counts = Counts::<Count>::default();
    ///
    /// counts.add(&Stats::ReceivedMessages(1));
    /// assert_eq!(counts.received_messages.get(), 1);
    ///
    /// counts.add(&Stats::MalformedMessages(2));
    /// assert_eq!(counts.malformed_messages.get(), 2);
    /// ```
    pub fn add(&self, payload: &Stats) {
        match payload {
            Stats::ReceivedMessages(v) => self.received_messages.add(*v),
            Stats::SentMessages(v) => self.sent_messages.add(*v),
            Stats::MalformedMessages(v) => self.malformed_messages.add(*v),
            Stats::UnroutedMessages(v) => self.unrouted_messages.add(*v),
            Stats::AcceptedConnections(v) => self.accepted_connections.add(*v),
        }
    }
}

/// Counters of one signaling channel, shared by all of its connections.
#[derive(Clone, Default)]
pub struct Statistics(Arc<Counts<Count>>);

impl Statistics {
    pub fn report(&self, payload: &[Stats]) {
        for item in payload {
            self.0.add(item);
        }
    }

    pub fn get(&self) -> Snapshot {
        Snapshot {
            received_messages: self.0.received_messages.get(),
            sent_messages: self.0.sent_messages.get(),
            malformed_messages: self.0.malformed_messages.get(),
            unrouted_messages: self.0.unrouted_messages.get(),
            accepted_connections: self.0.accepted_connections.get(),
        }
    }
}

/// Point in time copy of [`Statistics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Snapshot {
    pub received_messages: usize,
    pub sent_messages: usize,
    pub malformed_messages: usize,
    pub unrouted_messages: usize,
    pub accepted_connections: usize,
}
