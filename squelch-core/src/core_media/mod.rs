//! Media-side ports driven by the signaling core
//!
//! The core never touches a real WebRTC stack. It creates peer connections,
//! exchanges descriptions and candidates, and listens for remote tracks
//! through the [`PeerConnection`] family of traits. [`loopback`] wires two
//! in-process connections together for tests and the CLI simulator.

pub mod errors;
pub mod loopback;
pub mod ports;
pub mod types;

pub use errors::{MediaError, MediaResult};
pub use loopback::{CaptureMode, LoopbackCapture, LoopbackNetwork};
pub use ports::{AudioCapture, PeerConnection, PeerConnectionFactory, SharedConnection};
pub use types::{AudioTrack, IceCandidate, PeerConnectionEvent, RemoteAudio, SdpKind, SessionDescription};
