//! Multi-party mesh meeting rooms over WebRTC.
//!
//! Every participant holds one direct peer connection per other participant.
//! A relay server only forwards signaling; media never passes through it.
//! [`SessionHandle::start`] runs one room session on its own task.

pub mod auxiliary;
pub mod config;
pub mod controller;
pub mod error;
pub mod logger;
pub mod media;
pub mod membership;
pub mod peer;
pub mod session;
pub mod signaling;
pub mod utils;

pub use auxiliary::{AuxHandlers, AuxKind, AuxMessage};
pub use config::{Config, ReconnectPolicy, ServerConfig};
pub use controller::{SessionDeps, SessionHandle};
pub use error::{ConfigError, DeviceError, NegotiationError, SessionError, SignalingError};
pub use media::{
    DeviceInfo, DeviceRequest, MediaConstraints, MediaDevices, MediaKind, MediaSnapshot,
    SourceKind, VirtualDevices,
};
pub use membership::{MembershipService, NoMembership};
pub use peer::{Health, PeerSummary, RemoteTrack};
pub use session::{SessionEvent, SessionPhase, SessionSnapshot};
pub use signaling::{LocalRelay, UserInfo};
