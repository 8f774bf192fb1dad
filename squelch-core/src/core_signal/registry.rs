//! Connection Registry
//!
//! Owns every live peer connection of one channel attachment, keyed by role
//! and remote identity. Enforces one outgoing connection per participant and
//! one incoming connection per remote offerer.

use std::collections::HashMap;
use std::fmt;
use tokio::task::AbortHandle;
use tracing::debug;

use super::errors::{SignalError, SignalResult};
use crate::core_media::SharedConnection;
use crate::core_model::{ConnectionId, OfferEpoch, ParticipantId};

/// Which side of a transmission a connection serves
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// This participant is transmitting
    Outgoing,
    /// This participant is listening to a remote offer
    Incoming,
}

/// Registry key: the outgoing slot, or the incoming slot of one remote offerer
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ConnectionKey {
    Outgoing,
    Incoming(ParticipantId),
}

impl ConnectionKey {
    pub fn role(&self) -> Role {
        match self {
            ConnectionKey::Outgoing => Role::Outgoing,
            ConnectionKey::Incoming(_) => Role::Incoming,
        }
    }

    pub fn remote(&self) -> Option<&ParticipantId> {
        match self {
            ConnectionKey::Outgoing => None,
            ConnectionKey::Incoming(remote) => Some(remote),
        }
    }
}

impl fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionKey::Outgoing => f.write_str("outgoing"),
            ConnectionKey::Incoming(remote) => write!(f, "incoming/{remote}"),
        }
    }
}

/// Outcome of a successful registration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    Inserted,
    /// An incoming connection for the same offerer was closed and replaced
    Replaced(ConnectionId),
}

struct Entry {
    connection: SharedConnection,
    epoch: OfferEpoch,
    forwarder: Option<AbortHandle>,
}

impl Entry {
    fn shut(self) {
        if let Some(forwarder) = self.forwarder {
            forwarder.abort();
        }
        self.connection.close();
    }
}

#[derive(Default)]
pub struct ConnectionRegistry {
    entries: HashMap<ConnectionKey, Entry>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection under `key`.
    ///
    /// A second outgoing registration is rejected with
    /// [`SignalError::AlreadyTransmitting`]; an incoming registration for an
    /// offerer that already has one closes and replaces the old connection.
    pub fn register(
        &mut self,
        key: ConnectionKey,
        epoch: OfferEpoch,
        connection: SharedConnection,
    ) -> SignalResult<Registration> {
        if key == ConnectionKey::Outgoing && self.entries.contains_key(&key) {
            return Err(SignalError::AlreadyTransmitting);
        }

        let entry = Entry {
            connection,
            epoch,
            forwarder: None,
        };
        match self.entries.insert(key.clone(), entry) {
            Some(old) => {
                let old_id = old.connection.id();
                debug!(%key, replaced = %old_id, replaced_epoch = %old.epoch, %epoch, "Replacing connection");
                old.shut();
                Ok(Registration::Replaced(old_id))
            }
            None => Ok(Registration::Inserted),
        }
    }

    /// Attach the task that pumps the connection's events, so that release
    /// stops it as well
    pub fn set_forwarder(&mut self, key: &ConnectionKey, forwarder: AbortHandle) {
        match self.entries.get_mut(key) {
            Some(entry) => entry.forwarder = Some(forwarder),
            None => forwarder.abort(),
        }
    }

    pub fn lookup(&self, key: &ConnectionKey) -> Option<&SharedConnection> {
        self.entries.get(key).map(|e| &e.connection)
    }

    /// Whether `id` is the connection currently registered under `key`
    pub fn is_current(&self, key: &ConnectionKey, id: ConnectionId) -> bool {
        self.entries
            .get(key)
            .map(|e| e.connection.id() == id)
            .unwrap_or(false)
    }

    /// Close and discard the connection under `key`. Safe to call repeatedly;
    /// returns whether anything was released.
    pub fn release(&mut self, key: &ConnectionKey) -> bool {
        match self.entries.remove(key) {
            Some(entry) => {
                debug!(%key, connection = %entry.connection.id(), "Releasing connection");
                entry.shut();
                true
            }
            None => false,
        }
    }

    /// Close everything
    pub fn release_all(&mut self) {
        for (_, entry) in self.entries.drain() {
            entry.shut();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn incoming_count(&self) -> usize {
        self.entries
            .keys()
            .filter(|k| k.role() == Role::Incoming)
            .count()
    }
}

impl Drop for ConnectionRegistry {
    fn drop(&mut self) {
        self.release_all();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::core_media::{
        AudioTrack, IceCandidate, MediaResult, PeerConnection, PeerConnectionEvent,
        SessionDescription,
    };
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
    use std::sync::Arc;
    use tokio::sync::mpsc;

    /// Bare connection that only tracks whether it was closed
    pub(crate) struct FakeConnection {
        id: ConnectionId,
        closed: AtomicBool,
    }

    impl FakeConnection {
        pub(crate) fn new() -> Arc<Self> {
            static NEXT: AtomicU64 = AtomicU64::new(1);
            Arc::new(Self {
                id: ConnectionId(NEXT.fetch_add(1, Ordering::Relaxed)),
                closed: AtomicBool::new(false),
            })
        }

        pub(crate) fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl PeerConnection for FakeConnection {
        fn id(&self) -> ConnectionId {
            self.id
        }
        async fn add_track(&self, _track: &AudioTrack) -> MediaResult<()> {
            Ok(())
        }
        async fn create_offer(&self) -> MediaResult<SessionDescription> {
            Ok(SessionDescription::offer("fake"))
        }
        async fn create_answer(&self) -> MediaResult<SessionDescription> {
            Ok(SessionDescription::answer("fake"))
        }
        async fn set_local_description(&self, _d: SessionDescription) -> MediaResult<()> {
            Ok(())
        }
        async fn set_remote_description(&self, _d: SessionDescription) -> MediaResult<()> {
            Ok(())
        }
        fn has_remote_description(&self) -> bool {
            false
        }
        async fn add_ice_candidate(&self, _c: IceCandidate) -> MediaResult<()> {
            Ok(())
        }
        fn take_events(&self) -> Option<mpsc::UnboundedReceiver<PeerConnectionEvent>> {
            None
        }
        fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_second_outgoing_is_rejected() {
        let mut registry = ConnectionRegistry::new();
        let first = FakeConnection::new();
        registry
            .register(ConnectionKey::Outgoing, OfferEpoch::generate(), first.clone())
            .unwrap();

        let err = registry
            .register(ConnectionKey::Outgoing, OfferEpoch::generate(), FakeConnection::new())
            .unwrap_err();
        assert_eq!(err, SignalError::AlreadyTransmitting);
        assert!(!first.is_closed());
        assert!(registry.is_current(&ConnectionKey::Outgoing, first.id()));
    }

    #[test]
    fn test_incoming_registration_replaces_and_closes_old() {
        let mut registry = ConnectionRegistry::new();
        let key = ConnectionKey::Incoming(ParticipantId::new("alice"));
        let old = FakeConnection::new();
        let new = FakeConnection::new();

        registry.register(key.clone(), OfferEpoch::generate(), old.clone()).unwrap();
        let outcome = registry.register(key.clone(), OfferEpoch::generate(), new.clone()).unwrap();

        assert_eq!(outcome, Registration::Replaced(old.id()));
        assert!(old.is_closed());
        assert!(!new.is_closed());
        assert_eq!(registry.incoming_count(), 1);
    }

    #[test]
    fn test_release_is_idempotent() {
        let mut registry = ConnectionRegistry::new();
        let key = ConnectionKey::Incoming(ParticipantId::new("bob"));
        let conn = FakeConnection::new();
        registry.register(key.clone(), OfferEpoch::generate(), conn.clone()).unwrap();

        assert!(registry.release(&key));
        assert!(!registry.release(&key));
        assert!(!registry.release(&ConnectionKey::Outgoing));
        assert!(conn.is_closed());
        assert!(registry.lookup(&key).is_none());
    }

    #[test]
    fn test_drop_closes_everything() {
        let conn = FakeConnection::new();
        {
            let mut registry = ConnectionRegistry::new();
            registry
                .register(ConnectionKey::Outgoing, OfferEpoch::generate(), conn.clone())
                .unwrap();
        }
        assert!(conn.is_closed());
    }
}
