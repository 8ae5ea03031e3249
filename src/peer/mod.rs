pub mod codec;
pub mod connection;
pub mod ice;
pub mod media;
pub mod monitor;
pub mod state;
pub mod types;

pub use codec::{decode, decode_candidates, encode};
pub use media::{CameraFacing, DeviceKind, MediaDevices, MediaHandle, StaticDevices};
pub use monitor::{ConnectionEvent, MonitorPhase};
pub use types::{ConnectionDescriptor, ConnectivityCandidate, DescriptorKind, Role, ServerConfig};
