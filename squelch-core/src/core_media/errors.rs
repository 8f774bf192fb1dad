//! Media layer errors

use thiserror::Error;

pub type MediaResult<T> = Result<T, MediaError>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    /// The user or platform refused microphone access
    #[error("Microphone permission denied: {0}")]
    PermissionDenied(String),

    /// Another application holds the capture device
    #[error("Capture device busy: {0}")]
    DeviceBusy(String),

    /// No usable capture device
    #[error("Capture device unavailable: {0}")]
    DeviceUnavailable(String),

    /// Remote or local description could not be parsed or applied
    #[error("Invalid session description: {0}")]
    InvalidDescription(String),

    /// Candidate could not be parsed or applied
    #[error("Invalid candidate: {0}")]
    InvalidCandidate(String),

    /// Operation not valid in the connection's current state
    #[error("Invalid connection state: {0}")]
    InvalidState(String),

    /// The connection was closed
    #[error("Connection closed")]
    Closed,
}

impl MediaError {
    /// True for failures of the local capture device
    pub fn is_capture_error(&self) -> bool {
        matches!(
            self,
            MediaError::PermissionDenied(_)
                | MediaError::DeviceBusy(_)
                | MediaError::DeviceUnavailable(_)
        )
    }
}
