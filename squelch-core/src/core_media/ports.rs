//! Port traits implemented by a media stack

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

use super::errors::MediaResult;
use super::types::{AudioTrack, IceCandidate, PeerConnectionEvent, SessionDescription};
use crate::core_model::ConnectionId;

/// One negotiated audio path to a single remote participant
#[async_trait]
pub trait PeerConnection: Send + Sync {
    fn id(&self) -> ConnectionId;

    /// Attach the local microphone track (transmitter side only)
    async fn add_track(&self, track: &AudioTrack) -> MediaResult<()>;

    async fn create_offer(&self) -> MediaResult<SessionDescription>;

    async fn create_answer(&self) -> MediaResult<SessionDescription>;

    async fn set_local_description(&self, description: SessionDescription) -> MediaResult<()>;

    async fn set_remote_description(&self, description: SessionDescription) -> MediaResult<()>;

    /// Whether a remote description has been committed
    fn has_remote_description(&self) -> bool;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> MediaResult<()>;

    /// Take the event stream. Returns `None` after the first call.
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<PeerConnectionEvent>>;

    /// Close the connection. Calling it twice is harmless.
    fn close(&self);
}

pub type SharedConnection = Arc<dyn PeerConnection>;

/// Creates fresh peer connections
#[async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    async fn create(&self) -> MediaResult<SharedConnection>;
}

/// Exclusive access to the local audio capture device
#[async_trait]
pub trait AudioCapture: Send + Sync {
    async fn acquire(&self) -> MediaResult<AudioTrack>;

    fn release(&self, track: &AudioTrack);
}
