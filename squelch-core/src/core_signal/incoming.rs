//! Listener-side state, one session per remote offerer
//!
//! `Observed -> Answering -> Connected -> Closed`

use std::collections::HashMap;
use std::fmt;

use crate::core_media::IceCandidate;
use crate::core_model::{OfferEpoch, ParticipantId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenState {
    Observed,
    Answering,
    Connected,
    Closed,
}

impl fmt::Display for ListenState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ListenState::Observed => "observed",
            ListenState::Answering => "answering",
            ListenState::Connected => "connected",
            ListenState::Closed => "closed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerSession {
    pub epoch: OfferEpoch,
    pub state: ListenState,
}

/// What an observed offer means for the listener of its offerer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfferDisposition {
    /// First offer seen from this offerer
    New,
    /// A new epoch while an older session exists
    Replacement { previous: ListenerSession },
    /// Same epoch delivered again
    Redelivery,
}

struct Backlog {
    epoch: OfferEpoch,
    candidates: Vec<IceCandidate>,
}

/// Listener sessions of one attachment plus the candidates that outran
/// their offer
pub struct Listeners {
    sessions: HashMap<ParticipantId, ListenerSession>,
    backlog: HashMap<ParticipantId, Backlog>,
    max_pending: usize,
}

impl Listeners {
    pub fn new(max_pending: usize) -> Self {
        Self {
            sessions: HashMap::new(),
            backlog: HashMap::new(),
            max_pending,
        }
    }

    pub fn classify(&self, offerer: &ParticipantId, epoch: OfferEpoch) -> OfferDisposition {
        match self.sessions.get(offerer) {
            None => OfferDisposition::New,
            Some(session) if session.epoch == epoch => OfferDisposition::Redelivery,
            Some(session) => OfferDisposition::Replacement { previous: *session },
        }
    }

    /// Start a fresh session in `Observed`, discarding any previous one
    pub fn observe(&mut self, offerer: ParticipantId, epoch: OfferEpoch) {
        self.sessions.insert(
            offerer,
            ListenerSession {
                epoch,
                state: ListenState::Observed,
            },
        );
    }

    pub fn get(&self, offerer: &ParticipantId) -> Option<ListenerSession> {
        self.sessions.get(offerer).copied()
    }

    pub fn set_state(&mut self, offerer: &ParticipantId, state: ListenState) {
        if let Some(session) = self.sessions.get_mut(offerer) {
            session.state = state;
        }
    }

    /// Move an answering session to `Connected`. Returns true only on the
    /// transition, so the availability callback fires once per session.
    pub fn mark_connected(&mut self, offerer: &ParticipantId) -> bool {
        match self.sessions.get_mut(offerer) {
            Some(session) if session.state == ListenState::Answering => {
                session.state = ListenState::Connected;
                true
            }
            _ => false,
        }
    }

    /// Whether a candidate for `epoch` should be applied to the live
    /// connection for `offerer` right now
    pub fn accepts_candidate(&self, offerer: &ParticipantId, epoch: OfferEpoch) -> bool {
        matches!(
            self.sessions.get(offerer),
            Some(s) if s.epoch == epoch && matches!(s.state, ListenState::Answering | ListenState::Connected)
        )
    }

    pub fn remove(&mut self, offerer: &ParticipantId) -> Option<ListenerSession> {
        let session = self.sessions.remove(offerer)?;
        self.drop_backlog(offerer, session.epoch);
        Some(session)
    }

    /// Hold a candidate until the connection for its epoch is ready. A
    /// candidate of a different epoch replaces the backlog. Returns false
    /// when the backlog is full.
    pub fn buffer_candidate(
        &mut self,
        offerer: ParticipantId,
        epoch: OfferEpoch,
        candidate: IceCandidate,
    ) -> bool {
        let backlog = self.backlog.entry(offerer).or_insert_with(|| Backlog {
            epoch,
            candidates: Vec::new(),
        });
        if backlog.epoch != epoch {
            backlog.epoch = epoch;
            backlog.candidates.clear();
        }
        if backlog.candidates.len() >= self.max_pending {
            return false;
        }
        backlog.candidates.push(candidate);
        true
    }

    /// Take the buffered candidates for `offerer` if they belong to `epoch`
    pub fn take_backlog(&mut self, offerer: &ParticipantId, epoch: OfferEpoch) -> Vec<IceCandidate> {
        match self.backlog.get(offerer) {
            Some(backlog) if backlog.epoch == epoch => self
                .backlog
                .remove(offerer)
                .map(|b| b.candidates)
                .unwrap_or_default(),
            _ => Vec::new(),
        }
    }

    fn drop_backlog(&mut self, offerer: &ParticipantId, epoch: OfferEpoch) {
        if self.backlog.get(offerer).map(|b| b.epoch) == Some(epoch) {
            self.backlog.remove(offerer);
        }
    }

    #[cfg(test)]
    fn buffered(&self, offerer: &ParticipantId) -> usize {
        self.backlog.get(offerer).map(|b| b.candidates.len()).unwrap_or(0)
    }

    /// Remove every session and backlog
    pub fn drain(&mut self) -> Vec<(ParticipantId, ListenerSession)> {
        self.backlog.clear();
        self.sessions.drain().collect()
    }

    /// Sessions sorted by offerer, for snapshots
    pub fn states(&self) -> Vec<(ParticipantId, ListenState)> {
        let mut states: Vec<_> = self
            .sessions
            .iter()
            .map(|(p, s)| (p.clone(), s.state))
            .collect();
        states.sort_by(|a, b| a.0.as_str().cmp(b.0.as_str()));
        states
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alice() -> ParticipantId {
        ParticipantId::new("alice")
    }

    #[test]
    fn test_offer_classification() {
        let mut listeners = Listeners::new(4);
        let first = OfferEpoch::generate();
        assert_eq!(listeners.classify(&alice(), first), OfferDisposition::New);

        listeners.observe(alice(), first);
        assert_eq!(listeners.classify(&alice(), first), OfferDisposition::Redelivery);

        let second = OfferEpoch::generate();
        match listeners.classify(&alice(), second) {
            OfferDisposition::Replacement { previous } => assert_eq!(previous.epoch, first),
            other => panic!("expected replacement, got {other:?}"),
        }
    }

    #[test]
    fn test_connected_fires_once() {
        let mut listeners = Listeners::new(4);
        listeners.observe(alice(), OfferEpoch::generate());
        assert!(!listeners.mark_connected(&alice()));

        listeners.set_state(&alice(), ListenState::Answering);
        assert!(listeners.mark_connected(&alice()));
        assert!(!listeners.mark_connected(&alice()));
        assert_eq!(listeners.get(&alice()).unwrap().state, ListenState::Connected);
    }

    #[test]
    fn test_backlog_is_per_epoch_and_bounded() {
        let mut listeners = Listeners::new(2);
        let old = OfferEpoch::generate();
        let new = OfferEpoch::generate();

        assert!(listeners.buffer_candidate(alice(), old, IceCandidate::new("candidate:a")));
        assert!(listeners.buffer_candidate(alice(), new, IceCandidate::new("candidate:b")));
        assert!(listeners.buffer_candidate(alice(), new, IceCandidate::new("candidate:c")));
        assert!(!listeners.buffer_candidate(alice(), new, IceCandidate::new("candidate:d")));

        assert!(listeners.take_backlog(&alice(), old).is_empty());
        let flushed = listeners.take_backlog(&alice(), new);
        assert_eq!(flushed.len(), 2);
        assert_eq!(flushed[0].candidate, "candidate:b");
        assert_eq!(listeners.buffered(&alice()), 0);
    }

    #[test]
    fn test_remove_drops_matching_backlog_only() {
        let mut listeners = Listeners::new(4);
        let current = OfferEpoch::generate();
        let next = OfferEpoch::generate();
        listeners.observe(alice(), current);
        listeners.buffer_candidate(alice(), next, IceCandidate::new("candidate:n"));

        listeners.remove(&alice());
        assert_eq!(listeners.buffered(&alice()), 1);
        assert!(listeners.is_empty());
    }
}
