//! Manual (copy/paste or QR) signaling for one-to-one WebRTC calls.
//!
//! [`SignalingMachine`] drives a call through its states; it sits on top of
//! [`MediaSessionManager`], which owns the peer connection and local media.
//! Descriptors and candidates travel as text produced by [`peer::codec`].

pub mod config;
pub mod error;
pub mod events;
pub mod logger;
pub mod peer;
pub mod session;
pub mod signaling;
pub mod utils;

pub use config::{Config, LoggingConfig};
pub use error::{CallError, Result};
pub use events::{CallEvent, LostReason};
pub use peer::{
    decode, decode_candidates, encode, ConnectionDescriptor, ConnectivityCandidate, MediaDevices,
    Role, StaticDevices,
};
pub use session::MediaSessionManager;
pub use signaling::{CallDirection, CallRecord, CallStatus, SignalingMachine, SignalingState};
