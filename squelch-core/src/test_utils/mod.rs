//! Test utilities for Squelch
//!
//! Timeout helpers and ready-made participants wired to one in-memory
//! directory and loopback media network.

pub mod async_helpers;
pub mod fixtures;

pub use async_helpers::*;
pub use fixtures::*;
