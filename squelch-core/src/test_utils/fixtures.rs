//! Ready-to-use clients for multi-participant tests
//!
//! A [`TestNetwork`] is one shared in-memory directory plus one loopback
//! media network; every [`TestParticipant`] joins it with its own directory
//! session and microphone, and records its callbacks into channels.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::async_helpers::{wait_until, DEFAULT_TEST_TIMEOUT};
use crate::config::Config;
use crate::core_client::{ClientDeps, ClientHandle, ClientSnapshot};
use crate::core_directory::{ChannelPaths, DirectoryPath, MemoryDirectory, MemoryDirectoryClient};
use crate::core_media::{LoopbackCapture, LoopbackNetwork};
use crate::core_model::{ChannelId, Participant};
use crate::core_presence::PresenceSnapshot;
use crate::core_signal::{RemoteAudioEvent, SignalError};

/// Shared directory and media network for a group of participants
#[derive(Clone)]
pub struct TestNetwork {
    pub store: MemoryDirectory,
    pub media: LoopbackNetwork,
    pub config: Config,
}

impl Default for TestNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl TestNetwork {
    pub fn new() -> Self {
        let mut config = Config::default();
        config.channels.default_count = 5;
        config.signaling.cleanup_timeout = Duration::from_secs(1);
        Self {
            store: MemoryDirectory::new(),
            media: LoopbackNetwork::new(),
            config,
        }
    }

    /// Spawn a client for `name` (label `{name}@example.com`)
    pub fn join(&self, name: &str) -> TestParticipant {
        let participant = Participant::new(name, format!("{name}@example.com"));
        let session = self.store.connect();
        let capture = LoopbackCapture::new(format!("{name}-mic"));
        let deps = ClientDeps {
            directory: Arc::new(session.clone()),
            factory: Arc::new(self.media.clone()),
            capture: Arc::new(capture.clone()),
        };
        let (client, task) = ClientHandle::spawn(participant.clone(), deps, &self.config);

        let (audio_tx, audio) = mpsc::unbounded_channel();
        client.on_remote_audio(move |event| {
            let _ = audio_tx.send(event.clone());
        });
        let (presence_tx, presence) = mpsc::unbounded_channel();
        client.on_presence_changed(move |snapshot| {
            let _ = presence_tx.send(snapshot.clone());
        });
        let (errors_tx, errors) = mpsc::unbounded_channel();
        client.on_error(move |err| {
            let _ = errors_tx.send(err.clone());
        });

        TestParticipant {
            participant,
            client,
            task,
            session,
            capture,
            audio,
            presence,
            errors,
        }
    }

    /// Paths of a channel's namespaces
    pub fn paths(&self, channel: &str) -> ChannelPaths {
        ChannelPaths::new(&ChannelId::new(channel))
    }

    /// Number of records currently stored under `prefix`
    pub fn records_under(&self, prefix: &DirectoryPath) -> usize {
        self.store.entries_under(prefix).len()
    }
}

pub struct TestParticipant {
    pub participant: Participant,
    pub client: ClientHandle,
    pub task: JoinHandle<()>,
    pub session: MemoryDirectoryClient,
    pub capture: LoopbackCapture,
    pub audio: mpsc::UnboundedReceiver<RemoteAudioEvent>,
    pub presence: mpsc::UnboundedReceiver<PresenceSnapshot>,
    pub errors: mpsc::UnboundedReceiver<SignalError>,
}

impl TestParticipant {
    pub fn id(&self) -> &crate::core_model::ParticipantId {
        &self.participant.id
    }

    pub async fn snapshot(&self) -> ClientSnapshot {
        self.client.snapshot().await.expect("client event loop stopped")
    }

    /// Wait until the client's snapshot satisfies `condition`
    pub async fn wait_for(&self, condition: impl Fn(&ClientSnapshot) -> bool) -> ClientSnapshot {
        let condition = &condition;
        wait_until(DEFAULT_TEST_TIMEOUT, || async move {
            let snapshot = self.snapshot().await;
            condition(&snapshot).then_some(snapshot)
        })
        .await
    }

    /// Drop off the network without any cleanup: the directory session runs
    /// its on-disconnect removals and the event loop is killed
    pub fn crash(&self) {
        self.session.disconnect();
        self.task.abort();
    }
}
