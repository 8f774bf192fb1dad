//! Commands, dependencies and snapshots of the client event loop

use std::sync::Arc;
use tokio::sync::oneshot;

use crate::core_channel::Direction;
use crate::core_directory::SharedDirectory;
use crate::core_media::{AudioCapture, PeerConnectionFactory};
use crate::core_model::{ChannelId, Participant, ParticipantId};
use crate::core_presence::PresenceSnapshot;
use crate::core_signal::{ListenState, SignalResult, TransmitState};

/// External collaborators of one client
#[derive(Clone)]
pub struct ClientDeps {
    /// This client's session with the Directory Store
    pub directory: SharedDirectory,
    pub factory: Arc<dyn PeerConnectionFactory>,
    pub capture: Arc<dyn AudioCapture>,
}

pub(crate) type Reply<T> = oneshot::Sender<T>;

pub(crate) enum ClientCommand {
    Attach {
        channel: ChannelId,
        reply: Reply<SignalResult<()>>,
    },
    AttachDefault {
        reply: Reply<SignalResult<ChannelId>>,
    },
    Navigate {
        direction: Direction,
        reply: Reply<SignalResult<ChannelId>>,
    },
    Detach {
        reply: Reply<()>,
    },
    StartTransmit {
        reply: Reply<SignalResult<()>>,
    },
    StopTransmit {
        reply: Reply<()>,
    },
    ToggleHold {
        reply: Reply<SignalResult<bool>>,
    },
    Snapshot {
        reply: Reply<ClientSnapshot>,
    },
    Shutdown {
        reply: Reply<()>,
    },
}

/// Observable state of a client at one instant
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSnapshot {
    pub participant: Participant,
    pub channel: Option<ChannelId>,
    pub transmit: TransmitState,
    /// Listener bound to the current transmission
    pub responder: Option<ParticipantId>,
    /// Transmission latched by `toggle_hold`
    pub hold: bool,
    pub listeners: Vec<(ParticipantId, ListenState)>,
    pub presence: PresenceSnapshot,
    /// Live peer connections in the registry
    pub connections: usize,
}

impl ClientSnapshot {
    pub fn listener_state(&self, offerer: &ParticipantId) -> Option<ListenState> {
        self.listeners
            .iter()
            .find(|(p, _)| p == offerer)
            .map(|(_, state)| *state)
    }
}
