//! Transport independent state machines of a mirroring session.
//!
//! * [`topology`] tracks what the platform discovery service reports, the
//!   visible peers and the group that was formed, and resolves which side of
//!   the group runs the signaling listener.
//! * [`negotiation`] turns exchanged signaling messages into a connected
//!   media session by driving an external media engine.
//!
//! Neither module touches a socket. Both talk to the platform through a
//! narrow capability trait ([`topology::Discovery`],
//! [`negotiation::MediaEngine`]) so that they can be driven by test doubles.

pub mod negotiation;
pub mod topology;

pub use self::{
    negotiation::{
        EngineHandle, Input, MediaConfig, MediaEngine, MediaEngineFactory, MediaEvent, MediaEvents,
        NegotiationError, Negotiator, SessionState,
    },
    topology::{Discovery, DiscoveryError, DiscoveryEvent, Peer, PeerStatus, Role, Topology, TopologyManager},
};
