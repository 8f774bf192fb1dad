//! Signaling error taxonomy

use thiserror::Error;

use crate::core_directory::DirectoryError;
use crate::core_media::MediaError;

/// Result type for signaling operations
pub type SignalResult<T> = Result<T, SignalError>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SignalError {
    /// Capture device unavailable, busy or denied. Not retried.
    #[error("Media acquisition failed: {0}")]
    MediaAcquisition(MediaError),

    /// A required offer/answer publication failed after its retry
    #[error("Directory write failed at {path}: {source}")]
    DirectoryWrite {
        path: String,
        #[source]
        source: DirectoryError,
    },

    /// Remote description or candidate could not be applied; only the
    /// affected connection is torn down
    #[error("Negotiation with {remote} failed: {reason}")]
    Negotiation { remote: String, reason: String },

    /// Event for a connection that no longer exists. Never reported.
    #[error("Stale reference: {0}")]
    StaleReference(String),

    #[error("Not attached to a channel")]
    NotAttached,

    #[error("Already transmitting")]
    AlreadyTransmitting,

    /// Transmit-start was superseded by transmit-stop or a channel change
    #[error("Transmission cancelled")]
    Cancelled,

    #[error("Channel not found: {0}")]
    ChannelNotFound(String),

    /// Directory read or watch failed
    #[error("Directory error: {0}")]
    Directory(#[from] DirectoryError),

    /// The client event loop has stopped
    #[error("Client closed")]
    ClientClosed,
}

impl SignalError {
    pub fn negotiation(remote: impl std::fmt::Display, reason: impl std::fmt::Display) -> Self {
        SignalError::Negotiation {
            remote: remote.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn directory_write(path: impl std::fmt::Display, source: DirectoryError) -> Self {
        SignalError::DirectoryWrite {
            path: path.to_string(),
            source,
        }
    }

    /// Whether the error should reach the `on_error` callback
    pub fn is_reportable(&self) -> bool {
        !matches!(self, SignalError::StaleReference(_) | SignalError::Cancelled)
    }
}
