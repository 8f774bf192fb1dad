//! Presence tracking for one client
//!
//! On attach the tracker publishes the client's own presence record (with
//! on-disconnect removal armed in the store) and subscribes to the channel's
//! presence collection. Every change yields a fresh [`PresenceSnapshot`].
//! Detach removes the record, drops the subscription and reports an empty
//! membership so that counts never leak from one channel into the next.

use std::collections::BTreeMap;
use tracing::{debug, info, warn};

use crate::core_directory::{ChannelEvent, DetachHandle, SessionDirectory};
use crate::core_model::{ChannelId, ParticipantId, PresenceRecord};
use crate::core_signal::{forward_subscription, InputSender, SignalError, SignalResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    pub participant: ParticipantId,
    pub label: String,
    pub joined_at_millis: i64,
}

/// Membership of a channel at one instant
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PresenceSnapshot {
    /// `None` once detached
    pub channel: Option<ChannelId>,
    /// Ordered by join time
    pub members: Vec<Member>,
}

impl PresenceSnapshot {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn count(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn contains(&self, participant: &ParticipantId) -> bool {
        self.members.iter().any(|m| &m.participant == participant)
    }

    /// Labels of the first `limit` members, for compact displays
    pub fn display_labels(&self, limit: usize) -> Vec<&str> {
        self.members
            .iter()
            .take(limit)
            .map(|m| m.label.as_str())
            .collect()
    }
}

pub struct PresenceTracker {
    label: String,
    channel: Option<ChannelId>,
    members: BTreeMap<ParticipantId, PresenceRecord>,
    feed: Option<DetachHandle>,
}

impl PresenceTracker {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            channel: None,
            members: BTreeMap::new(),
            feed: None,
        }
    }

    pub fn channel(&self) -> Option<&ChannelId> {
        self.channel.as_ref()
    }

    /// Publish own presence in `directory`'s channel and start watching the
    /// channel's membership
    pub async fn attach(
        &mut self,
        directory: &SessionDirectory,
        generation: u64,
        inputs: InputSender,
    ) -> SignalResult<()> {
        let record = PresenceRecord::now(self.label.clone());
        directory
            .publish_presence(&record)
            .await
            .map_err(|e| SignalError::directory_write(directory.paths().presence_of(directory.me()), e))?;

        let subscription = match directory.watch_presence().await {
            Ok(subscription) => subscription,
            Err(e) => {
                if let Err(cleanup) = directory.remove_presence().await {
                    warn!(error = %cleanup, "Failed to withdraw presence after watch failure");
                }
                return Err(e.into());
            }
        };

        self.members.clear();
        self.channel = Some(directory.channel().clone());
        self.feed = Some(forward_subscription(subscription, generation, inputs));
        info!(channel = %directory.channel(), label = %self.label, "Presence published");
        Ok(())
    }

    /// Fold a presence change into the membership. Returns the new snapshot,
    /// or `None` for events that are not presence changes.
    pub fn apply(&mut self, event: &ChannelEvent) -> Option<PresenceSnapshot> {
        self.channel.as_ref()?;
        match event {
            ChannelEvent::PresenceUpdated { participant, presence } => {
                self.members.insert(participant.clone(), presence.clone());
            }
            ChannelEvent::PresenceRemoved { participant } => {
                if self.members.remove(participant).is_none() {
                    return None;
                }
            }
            _ => return None,
        }
        debug!(members = self.members.len(), "Presence changed");
        metrics::gauge!("presence.members").set(self.members.len() as f64);
        Some(self.snapshot())
    }

    /// Withdraw own presence and stop watching. Removal is best-effort; the
    /// store's on-disconnect hook covers a failed write.
    pub async fn detach(&mut self, directory: &SessionDirectory) -> PresenceSnapshot {
        if let Some(feed) = self.feed.take() {
            feed.detach();
        }
        if let Err(e) = directory.remove_presence().await {
            warn!(channel = %directory.channel(), error = %e, "Failed to remove presence record");
        }
        self.members.clear();
        self.channel = None;
        metrics::gauge!("presence.members").set(0.0);
        info!(channel = %directory.channel(), "Presence withdrawn");
        PresenceSnapshot::empty()
    }

    pub fn snapshot(&self) -> PresenceSnapshot {
        let mut members: Vec<Member> = self
            .members
            .iter()
            .map(|(participant, record)| Member {
                participant: participant.clone(),
                label: record.label.clone(),
                joined_at_millis: record.joined_at_millis,
            })
            .collect();
        members.sort_by(|a, b| {
            a.joined_at_millis
                .cmp(&b.joined_at_millis)
                .then_with(|| a.participant.cmp(&b.participant))
        });
        PresenceSnapshot {
            channel: self.channel.clone(),
            members,
        }
    }
}

impl Drop for PresenceTracker {
    fn drop(&mut self) {
        if let Some(feed) = self.feed.take() {
            feed.detach();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_directory::{DirectoryStore, MemoryDirectory};
    use crate::core_signal::SignalInput;
    use std::sync::Arc;
    use tokio::sync::mpsc;

    fn member(id: &str, label: &str, joined: i64) -> ChannelEvent {
        ChannelEvent::PresenceUpdated {
            participant: ParticipantId::new(id),
            presence: PresenceRecord {
                label: label.to_string(),
                joined_at_millis: joined,
            },
        }
    }

    fn session(store: &MemoryDirectory, channel: &str, me: &str) -> SessionDirectory {
        SessionDirectory::new(
            Arc::new(store.connect()),
            ChannelId::new(channel),
            ParticipantId::new(me),
        )
    }

    #[test]
    fn test_display_labels_are_truncated_in_join_order() {
        let mut tracker = PresenceTracker::new("me");
        tracker.channel = Some(ChannelId::new("01"));

        tracker.apply(&member("c", "carol", 30));
        tracker.apply(&member("a", "alice", 10));
        let snapshot = tracker.apply(&member("b", "bob", 20)).unwrap();

        assert_eq!(snapshot.count(), 3);
        assert_eq!(snapshot.display_labels(2), vec!["alice", "bob"]);
        assert_eq!(snapshot.display_labels(10).len(), 3);
    }

    #[test]
    fn test_unknown_removal_is_not_a_change() {
        let mut tracker = PresenceTracker::new("me");
        tracker.channel = Some(ChannelId::new("01"));
        assert!(tracker
            .apply(&ChannelEvent::PresenceRemoved {
                participant: ParticipantId::new("ghost"),
            })
            .is_none());
    }

    #[test]
    fn test_events_ignored_while_detached() {
        let mut tracker = PresenceTracker::new("me");
        assert!(tracker.apply(&member("a", "alice", 1)).is_none());
    }

    #[tokio::test]
    async fn test_attach_then_detach_round_trip() {
        let store = MemoryDirectory::new();
        let directory = session(&store, "01", "alice");
        let (tx, mut rx) = mpsc::unbounded_channel();

        let mut tracker = PresenceTracker::new("alice@example.com");
        tracker.attach(&directory, 1, tx).await.unwrap();

        let presence_path = directory.paths().presence_of(directory.me());
        assert!(store.contains(&presence_path));

        let input = rx.recv().await.unwrap();
        let SignalInput::Directory { event, .. } = input else {
            panic!("expected a directory event");
        };
        let snapshot = tracker.apply(&directory.decode(event).unwrap()).unwrap();
        assert_eq!(snapshot.display_labels(10), vec!["alice@example.com"]);

        let snapshot = tracker.detach(&directory).await;
        assert!(snapshot.is_empty());
        assert!(snapshot.channel.is_none());
        assert!(!store.contains(&presence_path));
        assert_eq!(store.watcher_count(&directory.paths().presence()), 0);
    }

    #[tokio::test]
    async fn test_presence_removed_when_client_drops() {
        let store = MemoryDirectory::new();
        let client = store.connect();
        let directory = SessionDirectory::new(
            Arc::new(client.clone()),
            ChannelId::new("01"),
            ParticipantId::new("alice"),
        );
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut tracker = PresenceTracker::new("alice");
        tracker.attach(&directory, 1, tx).await.unwrap();

        client.disconnect();
        let remaining = store.connect().list(&directory.paths().presence()).await.unwrap();
        assert!(remaining.is_empty());
    }
}
