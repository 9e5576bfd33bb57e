pub mod connection;
pub mod controller;
pub mod data_channel;
pub mod events;
pub mod handle;
pub mod ice;
pub mod media;
pub mod state;
pub mod transport;
pub mod types;

pub use connection::{WebRtcTransport, WebRtcTransportFactory};
pub use controller::{ControllerParams, PeerConnectionController};
pub use events::SessionEvent;
pub use handle::{spawn, ControllerHandle, Startup};
pub use media::{DeviceLease, LocalMedia, LocalTrack, MediaDevices};
pub use state::PeerState;
pub use transport::{LinkState, PeerTransport, TransportEvent, TransportFactory};
pub use types::{IceCandidate, MediaKind, Role, SdpPayload, ServerConfig, TrackInfo};
