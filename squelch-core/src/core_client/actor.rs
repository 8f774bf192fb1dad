//! Client event loop
//!
//! Owns the current channel attachment and processes, one at a time, both
//! user intents from [`ClientHandle`](super::ClientHandle) and the internal
//! [`SignalInput`]s produced by subscriptions, connections and media
//! acquisition. Nothing else mutates signaling state.

use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::types::{ClientCommand, ClientDeps, ClientSnapshot};
use crate::config::{Config, SignalingConfig};
use crate::core_channel::{ChannelCatalog, Direction};
use crate::core_directory::{ChannelEvent, SessionDirectory};
use crate::core_model::{ChannelId, Participant};
use crate::core_presence::PresenceTracker;
use crate::core_signal::{
    Callbacks, ChannelSignaling, SignalError, SignalInput, SignalResult, SignalingDeps, TransmitState,
};

struct Attachment {
    generation: u64,
    signaling: ChannelSignaling,
}

pub(crate) struct ClientActor {
    participant: Participant,
    deps: ClientDeps,
    signaling_deps: SignalingDeps,
    config: SignalingConfig,
    catalog: ChannelCatalog,
    presence: PresenceTracker,
    callbacks: Arc<Callbacks>,
    commands: mpsc::Receiver<ClientCommand>,
    inputs: mpsc::UnboundedReceiver<SignalInput>,
    attachment: Option<Attachment>,
    generation: u64,
    hold: bool,
}

impl ClientActor {
    pub(crate) fn new(
        participant: Participant,
        deps: ClientDeps,
        config: &Config,
        callbacks: Arc<Callbacks>,
        commands: mpsc::Receiver<ClientCommand>,
    ) -> Self {
        let (inputs_tx, inputs) = mpsc::unbounded_channel();
        let signaling_deps = SignalingDeps {
            factory: deps.factory.clone(),
            capture: deps.capture.clone(),
            callbacks: callbacks.clone(),
            inputs: inputs_tx,
        };
        Self {
            presence: PresenceTracker::new(participant.label.clone()),
            catalog: ChannelCatalog::new(deps.directory.clone(), config.channels.clone()),
            config: config.signaling.clone(),
            participant,
            deps,
            signaling_deps,
            callbacks,
            commands,
            inputs,
            attachment: None,
            generation: 0,
            hold: false,
        }
    }

    pub(crate) fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            self.run().await;
        })
    }

    async fn run(mut self) {
        info!(participant = %self.participant.id, "Client started");
        if let Err(e) = self.catalog.ensure_defaults().await {
            warn!(error = %e, "Failed to provision default channels");
        }

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => {
                        if !self.handle_command(command).await {
                            break;
                        }
                    }
                    None => {
                        self.detach().await;
                        break;
                    }
                },
                Some(input) = self.inputs.recv() => self.handle_input(input).await,
            }
        }
        info!(participant = %self.participant.id, "Client stopped");
    }

    /// Returns false once the loop should stop
    async fn handle_command(&mut self, command: ClientCommand) -> bool {
        match command {
            ClientCommand::Attach { channel, reply } => {
                let _ = reply.send(self.attach(channel).await);
            }
            ClientCommand::AttachDefault { reply } => {
                let result = match self.catalog.first().await {
                    Ok(Some(channel)) => self.attach(channel.clone()).await.map(|()| channel),
                    Ok(None) => Err(SignalError::ChannelNotFound("default".to_string())),
                    Err(e) => Err(e.into()),
                };
                let _ = reply.send(result);
            }
            ClientCommand::Navigate { direction, reply } => {
                let _ = reply.send(self.navigate(direction).await);
            }
            ClientCommand::Detach { reply } => {
                self.detach().await;
                let _ = reply.send(());
            }
            ClientCommand::StartTransmit { reply } => self.start_transmitting(reply).await,
            ClientCommand::StopTransmit { reply } => {
                self.hold = false;
                if let Some(attachment) = self.attachment.as_mut() {
                    attachment.signaling.stop_transmitting().await;
                }
                let _ = reply.send(());
            }
            ClientCommand::ToggleHold { reply } => self.toggle_hold(reply).await,
            ClientCommand::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
            ClientCommand::Shutdown { reply } => {
                self.detach().await;
                let _ = reply.send(());
                return false;
            }
        }
        true
    }

    async fn start_transmitting(&mut self, reply: oneshot::Sender<SignalResult<()>>) {
        match self.attachment.as_mut() {
            Some(attachment) => attachment.signaling.start_transmitting(reply).await,
            None => {
                let _ = reply.send(Err(SignalError::NotAttached));
            }
        }
    }

    async fn toggle_hold(&mut self, reply: oneshot::Sender<SignalResult<bool>>) {
        let transmitting = self.transmit_state().map(|s| !s.is_idle()).unwrap_or(false);

        if self.hold && transmitting {
            self.hold = false;
            if let Some(attachment) = self.attachment.as_mut() {
                attachment.signaling.stop_transmitting().await;
            }
            let _ = reply.send(Ok(false));
            return;
        }

        if transmitting {
            // Latch the transmission already in progress
            self.hold = true;
            let _ = reply.send(Ok(true));
            return;
        }

        let (start_tx, start_rx) = oneshot::channel();
        self.start_transmitting(start_tx).await;
        self.hold = self.attachment.is_some();
        tokio::spawn(async move {
            let result = start_rx.await.unwrap_or(Err(SignalError::ClientClosed));
            let _ = reply.send(result.map(|()| true));
        });
    }

    async fn navigate(&mut self, direction: Direction) -> SignalResult<ChannelId> {
        let current = self
            .attachment
            .as_ref()
            .map(|a| a.signaling.directory().channel().clone())
            .ok_or(SignalError::NotAttached)?;
        let target = self
            .catalog
            .neighbor(&current, direction)
            .await?
            .ok_or_else(|| SignalError::ChannelNotFound(current.to_string()))?;
        self.attach(target.clone()).await?;
        Ok(target)
    }

    /// Switch to `channel`: fully detach from the current one, then attach
    async fn attach(&mut self, channel: ChannelId) -> SignalResult<()> {
        if let Some(attachment) = &self.attachment {
            if attachment.signaling.directory().channel() == &channel {
                debug!(%channel, "Already attached");
                return Ok(());
            }
        }
        if self.catalog.get(&channel).await?.is_none() {
            return Err(SignalError::ChannelNotFound(channel.to_string()));
        }

        self.detach().await;

        self.generation += 1;
        let generation = self.generation;
        let directory = SessionDirectory::new(
            self.deps.directory.clone(),
            channel.clone(),
            self.participant.id.clone(),
        )
        .with_publish_attempts(self.config.offer_publish_attempts);

        self.presence
            .attach(&directory, generation, self.signaling_deps.inputs.clone())
            .await?;

        match ChannelSignaling::open(directory.clone(), &self.signaling_deps, generation, &self.config).await {
            Ok(signaling) => {
                self.attachment = Some(Attachment {
                    generation,
                    signaling,
                });
                info!(%channel, participant = %self.participant.id, "Attached to channel");
                Ok(())
            }
            Err(e) => {
                let snapshot = self.presence.detach(&directory).await;
                self.callbacks.presence_changed(snapshot);
                Err(e)
            }
        }
    }

    /// Stop transmitting, close every connection, withdraw presence and
    /// report an empty membership. Does nothing when detached.
    async fn detach(&mut self) {
        self.hold = false;
        let Some(mut attachment) = self.attachment.take() else {
            return;
        };
        attachment.signaling.close().await;
        let snapshot = self.presence.detach(attachment.signaling.directory()).await;
        self.callbacks.presence_changed(snapshot);
        info!(channel = %attachment.signaling.directory().channel(), "Detached from channel");
    }

    async fn handle_input(&mut self, input: SignalInput) {
        let current = self.attachment.as_ref().map(|a| a.generation);
        if current != Some(input.generation()) {
            debug!(generation = input.generation(), "Dropping input from a previous attachment");
            metrics::counter!("signaling.events.stale").increment(1);
            if let SignalInput::MediaReady { result: Ok(track), .. } = input {
                self.deps.capture.release(&track);
            }
            return;
        }
        let Some(attachment) = self.attachment.as_mut() else {
            return;
        };

        match input {
            SignalInput::Directory { event, .. } => {
                let Some(event) = attachment.signaling.directory().decode(event) else {
                    return;
                };
                match event {
                    ChannelEvent::PresenceUpdated { .. } | ChannelEvent::PresenceRemoved { .. } => {
                        if let Some(snapshot) = self.presence.apply(&event) {
                            self.callbacks.presence_changed(snapshot);
                        }
                    }
                    other => attachment.signaling.handle_event(other).await,
                }
            }
            SignalInput::Connection {
                key,
                connection,
                event,
                ..
            } => {
                attachment
                    .signaling
                    .handle_connection_event(key, connection, event)
                    .await
            }
            SignalInput::MediaReady { epoch, result, .. } => {
                attachment.signaling.on_media_ready(epoch, result).await
            }
        }
    }

    fn transmit_state(&self) -> Option<TransmitState> {
        self.attachment.as_ref().map(|a| a.signaling.transmit_state())
    }

    fn snapshot(&self) -> ClientSnapshot {
        let status = self.attachment.as_ref().map(|a| a.signaling.status());
        let transmit = status.as_ref().map(|s| s.transmit).unwrap_or_default();
        ClientSnapshot {
            participant: self.participant.clone(),
            channel: self.attachment.as_ref().map(|a| a.signaling.directory().channel().clone()),
            transmit,
            responder: status.as_ref().and_then(|s| s.responder.clone()),
            hold: self.hold && !transmit.is_idle(),
            listeners: status.as_ref().map(|s| s.listeners.clone()).unwrap_or_default(),
            presence: self.presence.snapshot(),
            connections: status.map(|s| s.connections).unwrap_or(0),
        }
    }
}
