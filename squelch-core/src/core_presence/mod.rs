//! Presence Tracker: live membership of the attached channel

pub mod tracker;

pub use tracker::{Member, PresenceSnapshot, PresenceTracker};
