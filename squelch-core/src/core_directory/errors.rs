//! Directory store errors

use thiserror::Error;

pub type DirectoryResult<T> = Result<T, DirectoryError>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DirectoryError {
    /// The store could not be reached or rejected the write
    #[error("Directory unavailable: {0}")]
    Unavailable(String),

    /// This client's session with the store has been dropped
    #[error("Directory session disconnected")]
    Disconnected,

    /// A record did not have the expected shape
    #[error("Malformed record at {path}: {reason}")]
    Malformed { path: String, reason: String },

    /// Path could not be built (empty or containing `/`)
    #[error("Invalid directory path: {0}")]
    InvalidPath(String),
}
