mod clock;
mod devices;
mod network;

pub use clock::ManualClock;
pub use devices::SimMediaDevices;
pub use network::{SimNetwork, SimTransport, SimTransportFactory};
