//! Squelch: push-to-talk channel signaling core
//!
//! Participants attach to named channels and transmit short voice bursts to
//! everyone else in the channel over peer-to-peer audio. This crate is the
//! signaling half: offer/answer/candidate exchange through a shared
//! [`Directory Store`](core_directory::DirectoryStore), connection ownership,
//! and channel presence. Audio transport sits behind the
//! [`core_media`] ports.

pub mod config;
pub mod core_channel;
pub mod core_client;
pub mod core_directory;
pub mod core_media;
pub mod core_model;
pub mod core_presence;
pub mod core_signal;
pub mod logging;
pub mod metrics;
pub mod test_utils;

pub use config::Config;
pub use core_client::{ClientDeps, ClientHandle, ClientSnapshot};
pub use core_model::{ChannelId, Participant, ParticipantId};
pub use core_signal::{RemoteAudioEvent, SignalError, SignalResult};
pub use logging::{init_logging, LogLevel};
