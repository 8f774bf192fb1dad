//! Notifications delivered to the UI collaborator

use std::sync::{Arc, PoisonError, RwLock};
use tracing::error;

use super::errors::SignalError;
use crate::core_media::RemoteAudio;
use crate::core_model::ParticipantId;
use crate::core_presence::PresenceSnapshot;

/// Remote audio availability for one offering participant
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteAudioEvent {
    /// The listener connection to `from` reports an active audio track
    Available { from: ParticipantId, audio: RemoteAudio },
    /// The listener connection to `from` was closed
    Ended { from: ParticipantId },
}

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

fn read<T>(lock: &RwLock<Vec<Callback<T>>>) -> Vec<Callback<T>> {
    lock.read().unwrap_or_else(PoisonError::into_inner).clone()
}

fn push<T>(lock: &RwLock<Vec<Callback<T>>>, callback: Callback<T>) {
    lock.write().unwrap_or_else(PoisonError::into_inner).push(callback);
}

/// Registered UI callbacks
#[derive(Default)]
pub struct Callbacks {
    remote_audio: RwLock<Vec<Callback<RemoteAudioEvent>>>,
    presence: RwLock<Vec<Callback<PresenceSnapshot>>>,
    errors: RwLock<Vec<Callback<SignalError>>>,
}

impl Callbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_remote_audio(&self, callback: impl Fn(&RemoteAudioEvent) + Send + Sync + 'static) {
        push(&self.remote_audio, Arc::new(callback));
    }

    pub fn on_presence_changed(&self, callback: impl Fn(&PresenceSnapshot) + Send + Sync + 'static) {
        push(&self.presence, Arc::new(callback));
    }

    pub fn on_error(&self, callback: impl Fn(&SignalError) + Send + Sync + 'static) {
        push(&self.errors, Arc::new(callback));
    }

    pub fn remote_audio(&self, event: RemoteAudioEvent) {
        for callback in read(&self.remote_audio) {
            callback(&event);
        }
    }

    pub fn presence_changed(&self, snapshot: PresenceSnapshot) {
        for callback in read(&self.presence) {
            callback(&snapshot);
        }
    }

    /// Log and deliver an error. Stale references and cancellations are dropped.
    pub fn error(&self, err: &SignalError) {
        if !err.is_reportable() {
            return;
        }
        error!(error = %err, "Signaling error");
        for callback in read(&self.errors) {
            callback(err);
        }
    }
}
