//! In-process media stack
//!
//! Connections created by the same [`LoopbackNetwork`] find each other through
//! the connection id embedded in their descriptions. When an offerer applies
//! an answer, the two connections are linked and any local track on one side
//! shows up as a [`PeerConnectionEvent::RemoteTrack`] on the other.
//!
//! Descriptions look like `loopback conn=7 audio=sendonly`; candidates look
//! like `candidate:7:0 udp 127.0.0.1`.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::trace;

use super::errors::{MediaError, MediaResult};
use super::ports::{AudioCapture, PeerConnection, PeerConnectionFactory, SharedConnection};
use super::types::{
    AudioTrack, IceCandidate, PeerConnectionEvent, RemoteAudio, SdpKind, SessionDescription,
};
use crate::core_model::ConnectionId;

/// Number of local candidates gathered after a local description is set
const CANDIDATES_PER_CONNECTION: u32 = 2;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
struct NetworkState {
    connections: HashMap<u64, Weak<LoopbackConnection>>,
}

/// Factory and switchboard for loopback connections
#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    next_id: Arc<AtomicU64>,
    state: Arc<Mutex<NetworkState>>,
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connections created and not yet closed
    pub fn open_connections(&self) -> usize {
        lock(&self.state)
            .connections
            .values()
            .filter_map(Weak::upgrade)
            .filter(|c| !c.is_closed())
            .count()
    }

    /// Candidates applied to a connection so far, in arrival order
    pub fn applied_candidates(&self, id: ConnectionId) -> Vec<IceCandidate> {
        self.find(id.0)
            .map(|c| lock(&c.state).applied_candidates.clone())
            .unwrap_or_default()
    }

    /// Id of the connection a given connection is linked to, if any
    pub fn linked_peer(&self, id: ConnectionId) -> Option<ConnectionId> {
        self.find(id.0)
            .and_then(|c| lock(&c.state).linked)
            .map(ConnectionId)
    }

    fn find(&self, id: u64) -> Option<Arc<LoopbackConnection>> {
        lock(&self.state).connections.get(&id).and_then(Weak::upgrade)
    }

    fn forget(&self, id: u64) {
        lock(&self.state).connections.remove(&id);
    }
}

#[async_trait]
impl PeerConnectionFactory for LoopbackNetwork {
    async fn create(&self) -> MediaResult<SharedConnection> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let connection = Arc::new(LoopbackConnection {
            id,
            network: self.clone(),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            state: Mutex::new(ConnectionState::default()),
        });
        lock(&self.state)
            .connections
            .insert(id, Arc::downgrade(&connection));
        trace!(id, "loopback connection created");
        Ok(connection)
    }
}

#[derive(Default)]
struct ConnectionState {
    tracks: Vec<AudioTrack>,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    linked: Option<u64>,
    applied_candidates: Vec<IceCandidate>,
    closed: bool,
}

/// One side of a loopback audio path
pub struct LoopbackConnection {
    id: u64,
    network: LoopbackNetwork,
    events_tx: mpsc::UnboundedSender<PeerConnectionEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<PeerConnectionEvent>>>,
    state: Mutex<ConnectionState>,
}

impl LoopbackConnection {
    fn is_closed(&self) -> bool {
        lock(&self.state).closed
    }

    fn describe(&self, kind: SdpKind) -> MediaResult<SessionDescription> {
        let state = lock(&self.state);
        if state.closed {
            return Err(MediaError::Closed);
        }
        let direction = if state.tracks.is_empty() { "recvonly" } else { "sendonly" };
        let sdp = format!("loopback conn={} audio={}", self.id, direction);
        Ok(SessionDescription { kind, sdp })
    }

    /// Deliver the other side's tracks to this connection
    fn receive_tracks(&self, tracks: &[AudioTrack]) {
        if self.is_closed() {
            return;
        }
        for track in tracks {
            let _ = self.events_tx.send(PeerConnectionEvent::RemoteTrack(RemoteAudio {
                track_id: track.id.clone(),
            }));
        }
    }
}

fn parse_connection_id(sdp: &str) -> MediaResult<u64> {
    let mut parts = sdp.split_whitespace();
    if parts.next() != Some("loopback") {
        return Err(MediaError::InvalidDescription(format!("not a loopback description: {sdp:?}")));
    }
    parts
        .find_map(|p| p.strip_prefix("conn="))
        .and_then(|id| id.parse().ok())
        .ok_or_else(|| MediaError::InvalidDescription(format!("missing connection id: {sdp:?}")))
}

#[async_trait]
impl PeerConnection for LoopbackConnection {
    fn id(&self) -> ConnectionId {
        ConnectionId(self.id)
    }

    async fn add_track(&self, track: &AudioTrack) -> MediaResult<()> {
        let mut state = lock(&self.state);
        if state.closed {
            return Err(MediaError::Closed);
        }
        state.tracks.push(track.clone());
        Ok(())
    }

    async fn create_offer(&self) -> MediaResult<SessionDescription> {
        self.describe(SdpKind::Offer)
    }

    async fn create_answer(&self) -> MediaResult<SessionDescription> {
        if lock(&self.state).remote.is_none() {
            return Err(MediaError::InvalidState("answer requires a remote offer".into()));
        }
        self.describe(SdpKind::Answer)
    }

    async fn set_local_description(&self, description: SessionDescription) -> MediaResult<()> {
        {
            let mut state = lock(&self.state);
            if state.closed {
                return Err(MediaError::Closed);
            }
            state.local = Some(description);
        }
        for n in 0..CANDIDATES_PER_CONNECTION {
            let candidate = IceCandidate::new(format!("candidate:{}:{} udp 127.0.0.1", self.id, n));
            let _ = self.events_tx.send(PeerConnectionEvent::LocalCandidate(candidate));
        }
        Ok(())
    }

    async fn set_remote_description(&self, description: SessionDescription) -> MediaResult<()> {
        let peer_id = parse_connection_id(&description.sdp)?;
        let kind = description.kind;
        let tracks = {
            let mut state = lock(&self.state);
            if state.closed {
                return Err(MediaError::Closed);
            }
            if state.remote.is_some() {
                return Err(MediaError::InvalidState("remote description already set".into()));
            }
            if kind == SdpKind::Answer && state.local.is_none() {
                return Err(MediaError::InvalidState("answer applied before local offer".into()));
            }
            state.remote = Some(description);
            state.tracks.clone()
        };

        // The offerer applying an answer completes the link in both directions.
        if kind == SdpKind::Answer {
            let peer = self
                .network
                .find(peer_id)
                .ok_or_else(|| MediaError::InvalidDescription(format!("unknown peer conn={peer_id}")))?;
            lock(&self.state).linked = Some(peer_id);
            let peer_tracks = {
                let mut peer_state = lock(&peer.state);
                peer_state.linked = Some(self.id);
                peer_state.tracks.clone()
            };
            peer.receive_tracks(&tracks);
            self.receive_tracks(&peer_tracks);
        }
        Ok(())
    }

    fn has_remote_description(&self) -> bool {
        lock(&self.state).remote.is_some()
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> MediaResult<()> {
        let mut state = lock(&self.state);
        if state.closed {
            return Err(MediaError::Closed);
        }
        if state.remote.is_none() {
            return Err(MediaError::InvalidState("candidate before remote description".into()));
        }
        if !candidate.candidate.starts_with("candidate:") {
            return Err(MediaError::InvalidCandidate(candidate.candidate));
        }
        state.applied_candidates.push(candidate);
        Ok(())
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<PeerConnectionEvent>> {
        lock(&self.events_rx).take()
    }

    fn close(&self) {
        let mut state = lock(&self.state);
        if state.closed {
            return;
        }
        state.closed = true;
        drop(state);
        self.network.forget(self.id);
        trace!(id = self.id, "loopback connection closed");
    }
}

/// How the fake capture device answers the next acquisition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CaptureMode {
    #[default]
    Available,
    Denied,
    Busy,
}

#[derive(Default)]
struct CaptureState {
    mode: CaptureMode,
    delay: Option<Duration>,
    held: Option<AudioTrack>,
    acquisitions: u32,
}

/// Fake exclusive microphone
#[derive(Clone, Default)]
pub struct LoopbackCapture {
    device: String,
    state: Arc<Mutex<CaptureState>>,
}

impl LoopbackCapture {
    pub fn new(device: impl Into<String>) -> Self {
        Self {
            device: device.into(),
            state: Arc::default(),
        }
    }

    pub fn set_mode(&self, mode: CaptureMode) {
        lock(&self.state).mode = mode;
    }

    /// Make every acquisition take `delay` before it resolves
    pub fn set_delay(&self, delay: Option<Duration>) {
        lock(&self.state).delay = delay;
    }

    /// Successful acquisitions so far
    pub fn acquisitions(&self) -> u32 {
        lock(&self.state).acquisitions
    }

    pub fn is_held(&self) -> bool {
        lock(&self.state).held.is_some()
    }
}

#[async_trait]
impl AudioCapture for LoopbackCapture {
    async fn acquire(&self) -> MediaResult<AudioTrack> {
        let delay = lock(&self.state).delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = lock(&self.state);
        match state.mode {
            CaptureMode::Denied => {
                return Err(MediaError::PermissionDenied(self.device.clone()));
            }
            CaptureMode::Busy => return Err(MediaError::DeviceBusy(self.device.clone())),
            CaptureMode::Available => {}
        }
        if state.held.is_some() {
            return Err(MediaError::DeviceBusy(self.device.clone()));
        }
        state.acquisitions += 1;
        let track = AudioTrack {
            id: format!("{}-track-{}", self.device, state.acquisitions),
            device: self.device.clone(),
        };
        state.held = Some(track.clone());
        Ok(track)
    }

    fn release(&self, track: &AudioTrack) {
        let mut state = lock(&self.state);
        if state.held.as_ref() == Some(track) {
            state.held = None;
        }
    }
}
