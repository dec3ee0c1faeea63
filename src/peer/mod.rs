//! Peer connection registry: one record per remote participant, each with
//! its own negotiation state machine and transport health.

pub mod connection;
pub mod handle;
pub mod ice;
pub mod registry;
pub mod state;
pub mod types;

pub use connection::RtcConnector;
pub use handle::{PeerConnection, PeerConnector, PeerEvent, PeerEventKind, PeerEventSender};
pub use registry::{Departure, JoinOutcome, PeerRegistry, PeerUpdate};
pub use state::{PeerRecord, PeerSummary, RemoteMedia};
pub use types::{
    Health, IceCandidate, NegotiationPhase, RemoteTrack, Role, SdpKind, SessionDescription,
    Signal, TransportState,
};
