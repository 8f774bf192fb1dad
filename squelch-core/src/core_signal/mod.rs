//! Signaling core: offer/answer/candidate exchange for both roles
//!
//! - `registry`: typed ownership of live peer connections
//! - `outgoing`: transmitter bookkeeping and the exclusive capture slot
//! - `incoming`: listener sessions and early-candidate backlog
//! - `machine`: the per-attachment state machine tying them together

pub mod errors;
pub mod events;
pub mod incoming;
pub mod machine;
pub mod outgoing;
pub mod registry;

pub use errors::{SignalError, SignalResult};
pub use events::{Callbacks, RemoteAudioEvent};
pub use incoming::{ListenState, ListenerSession, Listeners, OfferDisposition};
pub use machine::{
    forward_subscription, ChannelSignaling, InputSender, SignalInput, SignalingDeps, SignalingStatus,
};
pub use outgoing::{CaptureSlot, TransmitState, Transmitter};
pub use registry::{ConnectionKey, ConnectionRegistry, Registration, Role};
