//! Client facade consumed by the UI collaborator

mod actor;
pub mod handle;
pub mod types;

pub use handle::ClientHandle;
pub use types::{ClientDeps, ClientSnapshot};
