//! In-process push-to-talk simulation over the memory directory and
//! loopback media

use anyhow::{ensure, Context, Result};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info};

use squelch_core::config::Config;
use squelch_core::core_directory::MemoryDirectory;
use squelch_core::core_media::{LoopbackCapture, LoopbackNetwork};
use squelch_core::{ChannelId, ClientDeps, ClientHandle, ClientSnapshot, Participant, ParticipantId, RemoteAudioEvent};

#[derive(Debug, Clone)]
pub struct SimulationOptions {
    pub participants: usize,
    pub channel: ChannelId,
    pub talk: Duration,
}

#[derive(Debug)]
pub struct ParticipantReport {
    /// State while the first participant was still transmitting
    pub snapshot: ClientSnapshot,
    /// Offerers whose audio became available to this participant
    pub heard: Vec<ParticipantId>,
}

#[derive(Debug)]
pub struct SimulationReport {
    pub channel: ChannelId,
    pub talker: ParticipantId,
    pub participants: Vec<ParticipantReport>,
}

impl SimulationReport {
    pub fn responder(&self) -> Option<&ParticipantId> {
        self.participants.first()?.snapshot.responder.as_ref()
    }

    /// The bound responder, and only it, received the talker's audio
    pub fn delivered(&self) -> bool {
        let Some(responder) = self.responder() else {
            return false;
        };
        self.participants.iter().all(|p| {
            let heard = p.heard.contains(&self.talker);
            heard == (&p.snapshot.participant.id == responder)
        })
    }
}

impl fmt::Display for SimulationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.responder() {
            Some(responder) => writeln!(f, "channel {}: {} transmitting to {}", self.channel, self.talker, responder)?,
            None => writeln!(f, "channel {}: {} transmitting, no responder", self.channel, self.talker)?,
        }
        for p in &self.participants {
            let s = &p.snapshot;
            let listening = s
                .listener_state(&self.talker)
                .map(|state| state.to_string())
                .unwrap_or_else(|| "-".to_string());
            writeln!(
                f,
                "  {:<10} transmit={:<16} listen={:<10} connections={} members={} heard={}",
                s.participant.id,
                s.transmit.to_string(),
                listening,
                s.connections,
                s.presence.count(),
                p.heard.len(),
            )?;
        }
        Ok(())
    }
}

struct SimClient {
    participant: Participant,
    client: ClientHandle,
    task: tokio::task::JoinHandle<()>,
    audio: mpsc::UnboundedReceiver<RemoteAudioEvent>,
}

fn spawn_client(
    index: usize,
    store: &MemoryDirectory,
    media: &LoopbackNetwork,
    config: &Config,
) -> SimClient {
    let name = format!("user{:02}", index + 1);
    let participant = Participant::new(name.as_str(), format!("{name}@squelch.local"));
    let deps = ClientDeps {
        directory: Arc::new(store.connect()),
        factory: Arc::new(media.clone()),
        capture: Arc::new(LoopbackCapture::new(format!("{name}-mic"))),
    };
    let (client, task) = ClientHandle::spawn(participant.clone(), deps, config);
    let (tx, audio) = mpsc::unbounded_channel();
    client.on_remote_audio(move |event| {
        let _ = tx.send(event.clone());
    });
    SimClient {
        participant,
        client,
        task,
        audio,
    }
}

/// Attach `participants` clients to one channel, let the first one talk for
/// `talk`, and report what everyone observed
pub async fn run_simulation(config: &Config, options: SimulationOptions) -> Result<SimulationReport> {
    ensure!(options.participants >= 2, "a simulation needs at least two participants");

    let store = MemoryDirectory::new();
    let media = LoopbackNetwork::new();
    let mut clients: Vec<SimClient> = (0..options.participants)
        .map(|i| spawn_client(i, &store, &media, config))
        .collect();

    for sim in &clients {
        sim.client
            .attach_to_channel(options.channel.clone())
            .await
            .with_context(|| format!("{} could not attach to {}", sim.participant.id, options.channel))?;
    }
    info!(channel = %options.channel, participants = clients.len(), "Participants attached");

    let talker = clients[0].participant.id.clone();
    clients[0].client.start_transmitting().await.context("transmission failed to start")?;
    tokio::time::sleep(options.talk).await;

    let mut snapshots = Vec::with_capacity(clients.len());
    for sim in &clients {
        snapshots.push(sim.client.snapshot().await?);
    }
    clients[0].client.stop_transmitting().await?;

    let mut participants = Vec::with_capacity(clients.len());
    for (sim, snapshot) in clients.iter_mut().zip(snapshots) {
        let mut heard = Vec::new();
        while let Ok(event) = sim.audio.try_recv() {
            if let RemoteAudioEvent::Available { from, .. } = event {
                heard.push(from);
            }
        }
        participants.push(ParticipantReport { snapshot, heard });
    }

    for sim in clients {
        sim.client.shutdown().await?;
        if let Err(e) = sim.task.await {
            debug!(participant = %sim.participant.id, error = %e, "Client task ended abnormally");
        }
    }

    Ok(SimulationReport {
        channel: options.channel,
        talker,
        participants,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use squelch_core::core_signal::{ListenState, TransmitState};

    fn options(participants: usize, channel: &str) -> SimulationOptions {
        SimulationOptions {
            participants,
            channel: ChannelId::new(channel),
            talk: Duration::from_millis(200),
        }
    }

    #[tokio::test]
    async fn test_simulation_delivers_to_one_responder() {
        let report = run_simulation(&Config::default(), options(3, "01")).await.unwrap();

        assert_eq!(report.participants.len(), 3);
        assert_eq!(report.talker, ParticipantId::new("user01"));
        assert!(report.delivered());

        let talker = &report.participants[0].snapshot;
        assert_eq!(talker.transmit, TransmitState::Active);
        assert_eq!(talker.presence.count(), 3);

        let responder = report.responder().unwrap().clone();
        let bound = report
            .participants
            .iter()
            .find(|p| p.snapshot.participant.id == responder)
            .unwrap();
        assert_eq!(
            bound.snapshot.listener_state(&report.talker),
            Some(ListenState::Connected)
        );
    }

    #[tokio::test]
    async fn test_report_lists_every_participant() {
        let report = run_simulation(&Config::default(), options(2, "07")).await.unwrap();
        let text = report.to_string();
        assert!(text.starts_with("channel 07: user01 transmitting to user02"));
        assert!(text.contains("user02"));
        assert_eq!(text.lines().count(), 3);
    }

    #[tokio::test]
    async fn test_simulation_needs_two_participants() {
        assert!(run_simulation(&Config::default(), options(1, "01")).await.is_err());
    }

    #[tokio::test]
    async fn test_simulation_rejects_unknown_channel() {
        let err = run_simulation(&Config::default(), options(2, "missing"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("could not attach"));
    }
}
