//! Transmitter-side state
//!
//! `Idle -> AcquiringMedia -> OfferPublished -> AwaitingAnswers -> Active -> Closing -> Idle`

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tracing::debug;

use super::errors::{SignalError, SignalResult};
use crate::core_directory::DetachHandle;
use crate::core_media::{AudioCapture, AudioTrack, IceCandidate};
use crate::core_model::{OfferEpoch, ParticipantId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransmitState {
    #[default]
    Idle,
    AcquiringMedia,
    OfferPublished,
    AwaitingAnswers,
    Active,
    Closing,
}

impl TransmitState {
    pub fn is_idle(self) -> bool {
        self == TransmitState::Idle
    }

    /// States in which an answer to the current offer may still bind
    pub fn accepts_answers(self) -> bool {
        matches!(self, TransmitState::OfferPublished | TransmitState::AwaitingAnswers)
    }

    /// States in which the offer is live in the directory
    pub fn is_publishing(self) -> bool {
        matches!(
            self,
            TransmitState::OfferPublished | TransmitState::AwaitingAnswers | TransmitState::Active
        )
    }
}

impl fmt::Display for TransmitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransmitState::Idle => "idle",
            TransmitState::AcquiringMedia => "acquiring-media",
            TransmitState::OfferPublished => "offer-published",
            TransmitState::AwaitingAnswers => "awaiting-answers",
            TransmitState::Active => "active",
            TransmitState::Closing => "closing",
        };
        f.write_str(s)
    }
}

/// Bookkeeping for the single outgoing transmission of an attachment
pub struct Transmitter {
    state: TransmitState,
    epoch: Option<OfferEpoch>,
    responder: Option<ParticipantId>,
    acquisition: Option<AbortHandle>,
    answers: Option<DetachHandle>,
    pending_start: Option<oneshot::Sender<SignalResult<()>>>,
    published: bool,
    /// Listener candidates that arrived before their sender was bound
    pending: HashMap<ParticipantId, Vec<IceCandidate>>,
    max_pending: usize,
}

impl Transmitter {
    pub fn new(max_pending: usize) -> Self {
        Self {
            state: TransmitState::Idle,
            epoch: None,
            responder: None,
            acquisition: None,
            answers: None,
            pending_start: None,
            published: false,
            pending: HashMap::new(),
            max_pending,
        }
    }

    pub fn state(&self) -> TransmitState {
        self.state
    }

    pub fn set_state(&mut self, state: TransmitState) {
        debug!(from = %self.state, to = %state, "Transmit state change");
        self.state = state;
    }

    pub fn epoch(&self) -> Option<OfferEpoch> {
        self.epoch
    }

    pub fn responder(&self) -> Option<&ParticipantId> {
        self.responder.as_ref()
    }

    pub fn published(&self) -> bool {
        self.published
    }

    /// Enter `AcquiringMedia` under a fresh offer epoch
    pub fn begin(&mut self, reply: oneshot::Sender<SignalResult<()>>) -> SignalResult<OfferEpoch> {
        if !self.state.is_idle() {
            let _ = reply.send(Err(SignalError::AlreadyTransmitting));
            return Err(SignalError::AlreadyTransmitting);
        }
        let epoch = OfferEpoch::generate();
        self.epoch = Some(epoch);
        self.pending_start = Some(reply);
        self.set_state(TransmitState::AcquiringMedia);
        Ok(epoch)
    }

    /// Whether `epoch` names the transmission in progress
    pub fn is_current(&self, epoch: OfferEpoch) -> bool {
        !self.state.is_idle() && self.epoch == Some(epoch)
    }

    pub fn set_acquisition(&mut self, handle: AbortHandle) {
        self.acquisition = Some(handle);
    }

    pub fn clear_acquisition(&mut self) {
        self.acquisition = None;
    }

    pub fn mark_published(&mut self) {
        self.published = true;
        self.set_state(TransmitState::OfferPublished);
    }

    pub fn set_answers_feed(&mut self, feed: DetachHandle) {
        self.answers = Some(feed);
        self.set_state(TransmitState::AwaitingAnswers);
    }

    /// Resolve the pending start request, if any
    pub fn complete_start(&mut self, result: SignalResult<()>) {
        if let Some(reply) = self.pending_start.take() {
            let _ = reply.send(result);
        }
    }

    /// Bind the first responder and go `Active`. Returns the candidates it
    /// sent before binding; every other sender's backlog is discarded.
    pub fn bind(&mut self, responder: ParticipantId) -> Vec<IceCandidate> {
        let backlog = self.pending.remove(&responder).unwrap_or_default();
        self.pending.clear();
        self.responder = Some(responder);
        self.set_state(TransmitState::Active);
        backlog
    }

    /// Hold a listener candidate until its sender is bound. Returns false when
    /// the sender's backlog is full.
    pub fn buffer_candidate(&mut self, sender: ParticipantId, candidate: IceCandidate) -> bool {
        let backlog = self.pending.entry(sender).or_default();
        if backlog.len() >= self.max_pending {
            return false;
        }
        backlog.push(candidate);
        true
    }

    /// Tear down the bookkeeping: cancel acquisition, detach the answers feed,
    /// fail a pending start with `Cancelled` and return to `Idle`.
    pub fn reset(&mut self) {
        if let Some(acquisition) = self.acquisition.take() {
            acquisition.abort();
        }
        if let Some(answers) = self.answers.take() {
            answers.detach();
        }
        self.complete_start(Err(SignalError::Cancelled));
        self.pending.clear();
        self.epoch = None;
        self.responder = None;
        self.published = false;
        self.set_state(TransmitState::Idle);
    }
}

/// Exclusive hold on the capture device. A track is held from acquisition
/// until its transmission finishes and is never carried into the next one.
pub struct CaptureSlot {
    device: Arc<dyn AudioCapture>,
    held: Option<AudioTrack>,
}

impl CaptureSlot {
    pub fn new(device: Arc<dyn AudioCapture>) -> Self {
        Self { device, held: None }
    }

    pub fn device(&self) -> Arc<dyn AudioCapture> {
        self.device.clone()
    }

    /// Record a freshly acquired track. A different track that was still
    /// held is released first.
    pub fn hold(&mut self, track: AudioTrack) -> AudioTrack {
        if let Some(previous) = self.held.take() {
            if previous != track {
                self.device.release(&previous);
            }
        }
        self.held = Some(track.clone());
        track
    }

    /// Give back a track that was acquired but is no longer wanted
    pub fn discard(&self, track: &AudioTrack) {
        if self.held.as_ref() != Some(track) {
            self.device.release(track);
        }
    }

    pub fn release(&mut self) {
        if let Some(track) = self.held.take() {
            self.device.release(&track);
        }
    }
}

impl Drop for CaptureSlot {
    fn drop(&mut self) {
        self.release();
    }
}
