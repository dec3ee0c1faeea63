pub mod envelope;
pub mod relay;
pub mod transport;
pub mod ws;

pub use envelope::{AuxBody, Envelope, UserInfo};
pub use relay::LocalRelay;
pub use transport::{
    spawn, LinkState, SignalingDialer, SignalingHandle, SignalingLink, TransportEvent,
};
pub use ws::WsDialer;
