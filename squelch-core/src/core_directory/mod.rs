//! Session directory: the shared store used purely for connection metadata
//!
//! - [`store`]: the `DirectoryStore` port, watch subscriptions and events
//! - [`memory`]: in-memory store with per-client sessions
//! - [`path`]: channel namespace layout
//! - [`adapter`]: channel-scoped signaling reads, writes and watches

pub mod adapter;
pub mod errors;
pub mod memory;
pub mod path;
pub mod store;

pub use adapter::{ChannelEvent, SessionDirectory};
pub use errors::{DirectoryError, DirectoryResult};
pub use memory::{MemoryDirectory, MemoryDirectoryClient};
pub use path::{ChannelPaths, DirectoryPath};
pub use store::{DetachHandle, DirectoryEvent, DirectoryStore, SharedDirectory, Subscription};
