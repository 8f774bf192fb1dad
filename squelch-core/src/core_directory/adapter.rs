//! Session Directory Adapter
//!
//! Translates signaling intents into reads, writes and watches against the
//! channel-scoped namespaces, and decodes raw [`DirectoryEvent`]s back into
//! typed [`ChannelEvent`]s.

use serde_json::Value;
use tracing::{debug, warn};

use super::errors::{DirectoryError, DirectoryResult};
use super::path::{ChannelPaths, DirectoryPath};
use super::store::{DirectoryEvent, SharedDirectory, Subscription};
use crate::core_model::records::Record;
use crate::core_model::{
    AnswerRecord, CandidateRecord, ChannelId, OfferRecord, ParticipantId, PresenceRecord,
};

/// Typed change within one channel
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    OfferPublished {
        offerer: ParticipantId,
        offer: OfferRecord,
    },
    OfferWithdrawn {
        offerer: ParticipantId,
    },
    AnswerPublished {
        responder: ParticipantId,
        answer: AnswerRecord,
    },
    CandidateAppended {
        publisher: ParticipantId,
        candidate: CandidateRecord,
    },
    PresenceUpdated {
        participant: ParticipantId,
        presence: PresenceRecord,
    },
    PresenceRemoved {
        participant: ParticipantId,
    },
    /// A record under a signaling namespace that failed to decode
    Malformed {
        path: DirectoryPath,
        reason: String,
    },
}

impl ChannelEvent {
    /// Decode a raw event under `paths`. Returns `None` for paths that carry
    /// no signaling meaning (answers to other offerers, removed answers and
    /// candidates, channel metadata).
    pub fn decode(paths: &ChannelPaths, me: &ParticipantId, event: DirectoryEvent) -> Option<Self> {
        let rel: Vec<String> = event.path().relative_to(paths.base())?.to_vec();
        let segments: Vec<&str> = rel.iter().map(String::as_str).collect();

        match (segments.as_slice(), event) {
            (["offers", offerer], DirectoryEvent::Put { path, value }) => {
                Some(decode_record(path, &value, |offer: OfferRecord| ChannelEvent::OfferPublished {
                    offerer: ParticipantId::new(*offerer),
                    offer,
                }))
            }
            (["offers", offerer], DirectoryEvent::Removed { .. }) => Some(ChannelEvent::OfferWithdrawn {
                offerer: ParticipantId::new(*offerer),
            }),
            (["answers", offerer, responder], DirectoryEvent::Put { path, value })
                if *offerer == me.as_str() =>
            {
                Some(decode_record(path, &value, |answer: AnswerRecord| ChannelEvent::AnswerPublished {
                    responder: ParticipantId::new(*responder),
                    answer,
                }))
            }
            (["candidates", publisher, _seq], DirectoryEvent::Put { path, value }) => {
                Some(decode_record(path, &value, |candidate: CandidateRecord| ChannelEvent::CandidateAppended {
                    publisher: ParticipantId::new(*publisher),
                    candidate,
                }))
            }
            (["presence", participant], DirectoryEvent::Put { path, value }) => {
                Some(decode_record(path, &value, |presence: PresenceRecord| ChannelEvent::PresenceUpdated {
                    participant: ParticipantId::new(*participant),
                    presence,
                }))
            }
            (["presence", participant], DirectoryEvent::Removed { .. }) => {
                Some(ChannelEvent::PresenceRemoved {
                    participant: ParticipantId::new(*participant),
                })
            }
            _ => None,
        }
    }
}

fn decode_record<R: Record>(
    path: DirectoryPath,
    value: &Value,
    wrap: impl FnOnce(R) -> ChannelEvent,
) -> ChannelEvent {
    match R::decode(value) {
        Ok(record) => wrap(record),
        Err(e) => ChannelEvent::Malformed {
            path,
            reason: e.to_string(),
        },
    }
}

/// Channel-scoped view of the directory for one participant
#[derive(Clone)]
pub struct SessionDirectory {
    store: SharedDirectory,
    channel: ChannelId,
    paths: ChannelPaths,
    me: ParticipantId,
    publish_attempts: u32,
}

impl SessionDirectory {
    pub fn new(store: SharedDirectory, channel: ChannelId, me: ParticipantId) -> Self {
        Self {
            paths: ChannelPaths::new(&channel),
            store,
            channel,
            me,
            publish_attempts: 2,
        }
    }

    /// Total attempts for offer and answer publication (first try included)
    pub fn with_publish_attempts(mut self, attempts: u32) -> Self {
        self.publish_attempts = attempts.max(1);
        self
    }

    pub fn channel(&self) -> &ChannelId {
        &self.channel
    }

    pub fn paths(&self) -> &ChannelPaths {
        &self.paths
    }

    pub fn me(&self) -> &ParticipantId {
        &self.me
    }

    pub fn decode(&self, event: DirectoryEvent) -> Option<ChannelEvent> {
        ChannelEvent::decode(&self.paths, &self.me, event)
    }

    /// Publish or replace this participant's offer
    pub async fn publish_offer(&self, offer: &OfferRecord) -> DirectoryResult<()> {
        let value = encode(&self.paths.offer(&self.me), offer)?;
        self.set_with_retry(&self.paths.offer(&self.me), value).await
    }

    /// Publish this participant's answer to `offerer`'s current offer
    pub async fn publish_answer(&self, offerer: &ParticipantId, answer: &AnswerRecord) -> DirectoryResult<()> {
        let path = self.paths.answer(offerer, &self.me);
        let value = encode(&path, answer)?;
        self.set_with_retry(&path, value).await
    }

    /// Append a candidate fragment to this participant's collection
    pub async fn append_candidate(&self, candidate: &CandidateRecord) -> DirectoryResult<()> {
        let collection = self.paths.candidates_of(&self.me);
        let value = encode(&collection, candidate)?;
        self.store.append(&collection, value).await.map(|_| ())
    }

    pub async fn watch_offers(&self) -> DirectoryResult<Subscription> {
        self.store.watch(&self.paths.offers()).await
    }

    /// Answers addressed to this participant's offer
    pub async fn watch_answers(&self) -> DirectoryResult<Subscription> {
        self.store.watch(&self.paths.answers_for(&self.me)).await
    }

    pub async fn watch_candidates(&self) -> DirectoryResult<Subscription> {
        self.store.watch(&self.paths.candidates()).await
    }

    pub async fn watch_presence(&self) -> DirectoryResult<Subscription> {
        self.store.watch(&self.paths.presence()).await
    }

    /// Write own presence record and have the store drop it on disconnect
    pub async fn publish_presence(&self, presence: &PresenceRecord) -> DirectoryResult<()> {
        let path = self.paths.presence_of(&self.me);
        let value = encode(&path, presence)?;
        self.store.set(&path, value).await?;
        self.store.remove_on_disconnect(&path).await
    }

    pub async fn remove_presence(&self) -> DirectoryResult<()> {
        let path = self.paths.presence_of(&self.me);
        self.store.remove(std::slice::from_ref(&path)).await?;
        self.store.cancel_on_disconnect(&path).await
    }

    /// Arrange for the store to drop this participant's offer, answers and
    /// candidates if the client disappears mid-transmission
    pub async fn arm_signaling_cleanup(&self) -> DirectoryResult<()> {
        for path in self.signaling_records() {
            self.store.remove_on_disconnect(&path).await?;
        }
        Ok(())
    }

    /// Remove this participant's offer, the answers addressed to it and its
    /// candidates in one atomic step, then disarm the disconnect hooks
    pub async fn remove_signaling_records(&self) -> DirectoryResult<()> {
        let records = self.signaling_records();
        self.store.remove(&records).await?;
        for path in &records {
            if let Err(e) = self.store.cancel_on_disconnect(path).await {
                debug!(%path, error = %e, "Failed to disarm disconnect cleanup");
            }
        }
        Ok(())
    }

    /// Have the store drop this participant's candidates on disconnect. Used
    /// by listeners, which publish candidates without ever publishing an offer.
    pub async fn arm_candidate_cleanup(&self) -> DirectoryResult<()> {
        self.store.remove_on_disconnect(&self.paths.candidates_of(&self.me)).await
    }

    /// Remove this participant's candidates, then disarm their disconnect hook
    pub async fn remove_candidates(&self) -> DirectoryResult<()> {
        let path = self.paths.candidates_of(&self.me);
        self.store.remove(std::slice::from_ref(&path)).await?;
        if let Err(e) = self.store.cancel_on_disconnect(&path).await {
            debug!(%path, error = %e, "Failed to disarm disconnect cleanup");
        }
        Ok(())
    }

    fn signaling_records(&self) -> [DirectoryPath; 3] {
        [
            self.paths.offer(&self.me),
            self.paths.answers_for(&self.me),
            self.paths.candidates_of(&self.me),
        ]
    }

    async fn set_with_retry(&self, path: &DirectoryPath, value: Value) -> DirectoryResult<()> {
        let mut attempt = 1;
        loop {
            match self.store.set(path, value.clone()).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < self.publish_attempts && !matches!(e, DirectoryError::Disconnected) => {
                    warn!(%path, attempt, error = %e, "Directory write failed, retrying");
                    metrics::counter!("signaling.directory.write_failed").increment(1);
                    attempt += 1;
                }
                Err(e) => {
                    metrics::counter!("signaling.directory.write_failed").increment(1);
                    return Err(e);
                }
            }
        }
    }
}

fn encode<R: Record>(path: &DirectoryPath, record: &R) -> DirectoryResult<Value> {
    record.encode().map_err(|e| DirectoryError::Malformed {
        path: path.to_string(),
        reason: e.to_string(),
    })
}
