//! Data model shared by every signaling subsystem
//!
//! Identifiers live in [`ids`]; the JSON records stored in the directory live
//! in [`records`]. Pure data, no I/O.

pub mod ids;
pub mod records;

pub use ids::{ChannelId, ConnectionId, OfferEpoch, Participant, ParticipantId};
pub use records::{AnswerRecord, CandidateRecord, ChannelMeta, OfferRecord, PresenceRecord};
