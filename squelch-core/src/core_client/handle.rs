/*
   ClientHandle

   Single entry point for the UI collaborator. Every intent is packaged as a
   ClientCommand and pushed onto the client event loop; the handle awaits the
   reply where the caller needs an outcome.

   E.G: attach_to_channel("01") -> Result<()>
        start_transmitting()    -> Result<()>   (resolves once the offer is published)
        stop_transmitting()                     (no-op when idle)
        on_remote_audio(cb), on_presence_changed(cb), on_error(cb)

    Architecture:

    ┌──────────────────────────────────────────────────┐
    │                UI collaborator                   │
    └─────────────────┬────────────────────▲───────────┘
                      │ ClientHandle API   │ callbacks
    ┌─────────────────▼────────────────────┴───────────┐
    │               Client event loop                  │
    │   commands ──┐                ┌── SignalInput    │
    │              ▼                ▼                  │
    │   ┌─────────────────┐  ┌──────────────────┐      │
    │   │ ChannelSignaling│  │ PresenceTracker  │      │
    │   │ (registry,      │  │                  │      │
    │   │  tx / listeners)│  │                  │      │
    │   └────────┬────────┘  └────────┬─────────┘      │
    └────────────┼────────────────────┼────────────────┘
                 │ SessionDirectory   │
    ┌────────────▼────────────────────▼────────────────┐
    │               Directory Store                    │
    └──────────────────────────────────────────────────┘
*/

use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::actor::ClientActor;
use super::types::{ClientCommand, ClientDeps, ClientSnapshot, Reply};
use crate::config::Config;
use crate::core_channel::Direction;
use crate::core_model::{ChannelId, Participant};
use crate::core_presence::PresenceSnapshot;
use crate::core_signal::{Callbacks, RemoteAudioEvent, SignalError, SignalResult};

#[derive(Clone)]
pub struct ClientHandle {
    command_tx: mpsc::Sender<ClientCommand>,
    callbacks: Arc<Callbacks>,
}

impl ClientHandle {
    /// Create a client for `participant` and spawn its event loop
    pub fn spawn(participant: Participant, deps: ClientDeps, config: &Config) -> (Self, JoinHandle<()>) {
        let (command_tx, command_rx) = mpsc::channel(config.signaling.command_buffer);
        let callbacks = Arc::new(Callbacks::new());

        let actor = ClientActor::new(participant, deps, config, callbacks.clone(), command_rx);
        let handle = actor.spawn();

        (ClientHandle { command_tx, callbacks }, handle)
    }

    async fn request<T>(&self, command: impl FnOnce(Reply<T>) -> ClientCommand) -> SignalResult<T> {
        let (reply, response) = oneshot::channel();
        self.command_tx
            .send(command(reply))
            .await
            .map_err(|_| SignalError::ClientClosed)?;
        response.await.map_err(|_| SignalError::ClientClosed)
    }

    /// Attach to `channel`, detaching from the current one first.
    /// Attaching to the current channel does nothing.
    pub async fn attach_to_channel(&self, channel: impl Into<ChannelId>) -> SignalResult<()> {
        let channel = channel.into();
        self.request(|reply| ClientCommand::Attach { channel, reply }).await?
    }

    /// Attach to the first channel of the catalog
    pub async fn attach_default_channel(&self) -> SignalResult<ChannelId> {
        self.request(|reply| ClientCommand::AttachDefault { reply }).await?
    }

    /// Switch to the next channel in catalog order, staying put at the end
    pub async fn next_channel(&self) -> SignalResult<ChannelId> {
        self.request(|reply| ClientCommand::Navigate {
            direction: Direction::Next,
            reply,
        })
        .await?
    }

    pub async fn previous_channel(&self) -> SignalResult<ChannelId> {
        self.request(|reply| ClientCommand::Navigate {
            direction: Direction::Previous,
            reply,
        })
        .await?
    }

    pub async fn detach_from_channel(&self) -> SignalResult<()> {
        self.request(|reply| ClientCommand::Detach { reply }).await
    }

    /// Start transmitting on the attached channel. Resolves once the offer is
    /// published and answers are being watched.
    pub async fn start_transmitting(&self) -> SignalResult<()> {
        self.request(|reply| ClientCommand::StartTransmit { reply }).await?
    }

    /// Stop transmitting. Safe to call when nothing is being transmitted.
    pub async fn stop_transmitting(&self) -> SignalResult<()> {
        self.request(|reply| ClientCommand::StopTransmit { reply }).await
    }

    /// Latch or release a transmission. Returns whether it is now latched.
    pub async fn toggle_hold(&self) -> SignalResult<bool> {
        self.request(|reply| ClientCommand::ToggleHold { reply }).await?
    }

    pub async fn snapshot(&self) -> SignalResult<ClientSnapshot> {
        self.request(|reply| ClientCommand::Snapshot { reply }).await
    }

    /// Detach and stop the event loop
    pub async fn shutdown(&self) -> SignalResult<()> {
        self.request(|reply| ClientCommand::Shutdown { reply }).await
    }

    pub fn on_remote_audio(&self, callback: impl Fn(&RemoteAudioEvent) + Send + Sync + 'static) {
        self.callbacks.on_remote_audio(callback);
    }

    pub fn on_presence_changed(&self, callback: impl Fn(&PresenceSnapshot) + Send + Sync + 'static) {
        self.callbacks.on_presence_changed(callback);
    }

    pub fn on_error(&self, callback: impl Fn(&SignalError) + Send + Sync + 'static) {
        self.callbacks.on_error(callback);
    }
}
