//! Per-attachment signaling state machine
//!
//! [`ChannelSignaling`] drives both roles for one channel attachment: the
//! single outgoing transmission and one listener per remote offerer. It is
//! owned by the client event loop and every transition runs on that loop, so
//! no two transitions ever interleave. Asynchronous results (directory
//! changes, connection events, media acquisition) come back as
//! [`SignalInput`]s tagged with the attachment generation.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::errors::{SignalError, SignalResult};
use super::events::{Callbacks, RemoteAudioEvent};
use super::incoming::{ListenState, Listeners, OfferDisposition};
use super::outgoing::{CaptureSlot, TransmitState, Transmitter};
use super::registry::{ConnectionKey, ConnectionRegistry};
use crate::config::SignalingConfig;
use crate::metrics::Timer;
use crate::core_directory::{
    ChannelEvent, DetachHandle, DirectoryEvent, DirectoryResult, SessionDirectory, Subscription,
};
use crate::core_media::{
    AudioCapture, AudioTrack, IceCandidate, MediaError, MediaResult, PeerConnectionEvent, PeerConnectionFactory,
    SharedConnection,
};
use crate::core_model::{
    AnswerRecord, CandidateRecord, ConnectionId, OfferEpoch, OfferRecord, ParticipantId,
};

/// Asynchronous result fed back into the client event loop
#[derive(Debug)]
pub enum SignalInput {
    Directory {
        generation: u64,
        event: DirectoryEvent,
    },
    Connection {
        generation: u64,
        key: ConnectionKey,
        connection: ConnectionId,
        event: PeerConnectionEvent,
    },
    MediaReady {
        generation: u64,
        epoch: OfferEpoch,
        result: MediaResult<AudioTrack>,
    },
}

impl SignalInput {
    pub fn generation(&self) -> u64 {
        match self {
            SignalInput::Directory { generation, .. }
            | SignalInput::Connection { generation, .. }
            | SignalInput::MediaReady { generation, .. } => *generation,
        }
    }
}

pub type InputSender = mpsc::UnboundedSender<SignalInput>;

/// Pump a directory subscription into the event loop until it is detached
pub fn forward_subscription(
    mut subscription: Subscription,
    generation: u64,
    inputs: InputSender,
) -> DetachHandle {
    let handle = subscription.detach_handle();
    tokio::spawn(async move {
        while let Some(event) = subscription.next().await {
            if inputs.send(SignalInput::Directory { generation, event }).is_err() {
                break;
            }
        }
    });
    handle
}

/// Collaborators shared by every attachment of a client
#[derive(Clone)]
pub struct SignalingDeps {
    pub factory: Arc<dyn PeerConnectionFactory>,
    pub capture: Arc<dyn AudioCapture>,
    pub callbacks: Arc<Callbacks>,
    pub inputs: InputSender,
}

/// Point-in-time view of one attachment's signaling
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalingStatus {
    pub transmit: TransmitState,
    pub responder: Option<ParticipantId>,
    pub listeners: Vec<(ParticipantId, ListenState)>,
    pub connections: usize,
}

pub struct ChannelSignaling {
    directory: SessionDirectory,
    factory: Arc<dyn PeerConnectionFactory>,
    capture: CaptureSlot,
    callbacks: Arc<Callbacks>,
    inputs: InputSender,
    generation: u64,
    cleanup_timeout: Duration,
    registry: ConnectionRegistry,
    transmitter: Transmitter,
    listeners: Listeners,
    feeds: Vec<DetachHandle>,
    /// Own candidate records may exist in the directory
    own_candidates: bool,
    /// The store will drop own candidates if this client disconnects
    candidate_hook: bool,
}

impl ChannelSignaling {
    /// Subscribe to the channel's offers and candidates
    pub async fn open(
        directory: SessionDirectory,
        deps: &SignalingDeps,
        generation: u64,
        config: &SignalingConfig,
    ) -> SignalResult<Self> {
        let mut signaling = Self {
            factory: deps.factory.clone(),
            capture: CaptureSlot::new(deps.capture.clone()),
            callbacks: deps.callbacks.clone(),
            inputs: deps.inputs.clone(),
            generation,
            cleanup_timeout: config.cleanup_timeout,
            registry: ConnectionRegistry::new(),
            transmitter: Transmitter::new(config.max_pending_candidates),
            listeners: Listeners::new(config.max_pending_candidates),
            feeds: Vec::new(),
            own_candidates: false,
            candidate_hook: false,
            directory,
        };

        let offers = signaling.directory.watch_offers().await?;
        signaling.feeds.push(forward_subscription(offers, generation, signaling.inputs.clone()));
        match signaling.directory.watch_candidates().await {
            Ok(candidates) => {
                signaling
                    .feeds
                    .push(forward_subscription(candidates, generation, signaling.inputs.clone()));
            }
            Err(e) => {
                signaling.detach_feeds();
                return Err(e.into());
            }
        }

        debug!(channel = %signaling.directory.channel(), generation, "Signaling feeds attached");
        Ok(signaling)
    }

    pub fn directory(&self) -> &SessionDirectory {
        &self.directory
    }

    pub fn transmit_state(&self) -> TransmitState {
        self.transmitter.state()
    }

    pub fn status(&self) -> SignalingStatus {
        SignalingStatus {
            transmit: self.transmitter.state(),
            responder: self.transmitter.responder().cloned(),
            listeners: self.listeners.states(),
            connections: self.registry.len(),
        }
    }

    fn me(&self) -> &ParticipantId {
        self.directory.me()
    }

    // ---- transmitter -------------------------------------------------

    /// Begin a transmission. `reply` resolves once the offer is published
    /// and the answers feed is attached, or with the reason it was not.
    pub async fn start_transmitting(&mut self, reply: oneshot::Sender<SignalResult<()>>) {
        let epoch = match self.transmitter.begin(reply) {
            Ok(epoch) => epoch,
            Err(_) => {
                debug!(channel = %self.directory.channel(), "Transmit start rejected, already transmitting");
                return;
            }
        };
        info!(channel = %self.directory.channel(), %epoch, "Transmit start");

        let device = self.capture.device();
        let inputs = self.inputs.clone();
        let generation = self.generation;
        let task = tokio::spawn(async move {
            let result = device.acquire().await;
            let _ = inputs.send(SignalInput::MediaReady {
                generation,
                epoch,
                result,
            });
        });
        self.transmitter.set_acquisition(task.abort_handle());
    }

    /// Continue a transmission once the capture device answered
    pub async fn on_media_ready(&mut self, epoch: OfferEpoch, result: MediaResult<AudioTrack>) {
        if !self.transmitter.is_current(epoch)
            || self.transmitter.state() != TransmitState::AcquiringMedia
        {
            debug!(%epoch, "Dropping media result for superseded transmission");
            if let Ok(track) = result {
                self.capture.discard(&track);
            }
            return;
        }
        self.transmitter.clear_acquisition();

        let track = match result {
            Ok(track) => self.capture.hold(track),
            Err(e) => {
                warn!(channel = %self.directory.channel(), error = %e, "Media acquisition failed");
                metrics::counter!("signaling.media.acquisition_failed").increment(1);
                self.transmitter.complete_start(Err(SignalError::MediaAcquisition(e)));
                self.transmitter.reset();
                return;
            }
        };

        let timer = Timer::new("signaling.offer.setup_ms");
        match self.publish_transmission(epoch, &track).await {
            Ok(()) => {
                timer.stop();
                info!(channel = %self.directory.channel(), %epoch, "Offer published, awaiting answers");
                self.transmitter.complete_start(Ok(()));
            }
            Err(e) => {
                self.transmitter.complete_start(Err(e));
                self.finish_transmission().await;
            }
        }
    }

    async fn publish_transmission(&mut self, epoch: OfferEpoch, track: &AudioTrack) -> SignalResult<()> {
        let local = |e: MediaError| SignalError::negotiation("local", e);
        let connection = self.factory.create().await.map_err(local)?;
        self.registry
            .register(ConnectionKey::Outgoing, epoch, connection.clone())?;
        self.forward_connection(ConnectionKey::Outgoing, &connection);

        connection.add_track(track).await.map_err(local)?;
        let offer = connection.create_offer().await.map_err(local)?;
        connection.set_local_description(offer.clone()).await.map_err(local)?;

        let record = OfferRecord {
            epoch,
            description: offer,
        };
        self.directory
            .publish_offer(&record)
            .await
            .map_err(|e| SignalError::directory_write(self.directory.paths().offer(self.me()), e))?;
        metrics::counter!("signaling.offers.published").increment(1);
        self.transmitter.mark_published();

        match self.directory.arm_signaling_cleanup().await {
            Ok(()) => self.candidate_hook = true,
            Err(e) => warn!(channel = %self.directory.channel(), error = %e, "Failed to arm disconnect cleanup"),
        }

        let answers = self.directory.watch_answers().await?;
        let feed = forward_subscription(answers, self.generation, self.inputs.clone());
        self.transmitter.set_answers_feed(feed);
        Ok(())
    }

    /// Stop the current transmission. Does nothing when idle.
    pub async fn stop_transmitting(&mut self) {
        if self.transmitter.state().is_idle() {
            debug!("Transmit stop while idle");
            return;
        }
        info!(channel = %self.directory.channel(), state = %self.transmitter.state(), "Transmit stop");
        self.finish_transmission().await;
    }

    /// `Closing` then `Idle`: release the connection and device, then remove
    /// the published records best-effort within the cleanup timeout
    async fn finish_transmission(&mut self) {
        self.transmitter.set_state(TransmitState::Closing);
        let published = self.transmitter.published();
        self.transmitter.reset();
        self.registry.release(&ConnectionKey::Outgoing);
        self.capture.release();

        if published
            && self
                .bounded_cleanup("signaling", self.directory.remove_signaling_records())
                .await
        {
            self.own_candidates = false;
            self.candidate_hook = false;
        }
    }

    /// Run a best-effort record removal, giving up after the cleanup timeout
    async fn bounded_cleanup(
        &self,
        records: &'static str,
        removal: impl Future<Output = DirectoryResult<()>>,
    ) -> bool {
        match tokio::time::timeout(self.cleanup_timeout, removal).await {
            Ok(Ok(())) => {
                debug!(channel = %self.directory.channel(), records, "Directory records removed");
                true
            }
            Ok(Err(e)) => {
                warn!(channel = %self.directory.channel(), records, error = %e, "Directory cleanup failed");
                metrics::counter!("signaling.directory.write_failed").increment(1);
                false
            }
            Err(_) => {
                warn!(channel = %self.directory.channel(), records, "Directory cleanup timed out");
                false
            }
        }
    }

    async fn on_answer(&mut self, responder: ParticipantId, answer: AnswerRecord) {
        if !self.transmitter.is_current(answer.offer_epoch) {
            debug!(%responder, "Ignoring answer for a superseded offer");
            metrics::counter!("signaling.events.stale").increment(1);
            return;
        }
        if !self.transmitter.state().accepts_answers() {
            debug!(%responder, bound = ?self.transmitter.responder(), "Ignoring answer, responder already bound");
            metrics::counter!("signaling.answers.ignored").increment(1);
            return;
        }
        let Some(connection) = self.registry.lookup(&ConnectionKey::Outgoing).cloned() else {
            return;
        };
        if connection.has_remote_description() {
            metrics::counter!("signaling.answers.ignored").increment(1);
            return;
        }

        if let Err(e) = connection.set_remote_description(answer.description).await {
            self.report(SignalError::negotiation(&responder, e));
            self.finish_transmission().await;
            return;
        }

        info!(channel = %self.directory.channel(), %responder, "Answer applied, transmission active");
        let backlog = self.transmitter.bind(responder.clone());
        for candidate in backlog {
            if !self.apply_outgoing_candidate(&connection, &responder, candidate).await {
                return;
            }
        }
    }

    async fn on_listener_candidate(&mut self, sender: ParticipantId, record: CandidateRecord) {
        if !self.transmitter.is_current(record.offer_epoch) || !self.transmitter.published() {
            debug!(%sender, "Ignoring candidate for a superseded offer");
            metrics::counter!("signaling.events.stale").increment(1);
            return;
        }
        match self.transmitter.responder().cloned() {
            Some(responder) if responder == sender => {
                if let Some(connection) = self.registry.lookup(&ConnectionKey::Outgoing).cloned() {
                    self.apply_outgoing_candidate(&connection, &sender, record.candidate).await;
                }
            }
            Some(_) => {
                debug!(%sender, "Discarding candidate from unbound listener");
            }
            None => {
                if !self.transmitter.buffer_candidate(sender.clone(), record.candidate) {
                    debug!(%sender, "Candidate backlog full, dropping");
                }
            }
        }
    }

    async fn apply_outgoing_candidate(
        &mut self,
        connection: &SharedConnection,
        sender: &ParticipantId,
        candidate: IceCandidate,
    ) -> bool {
        match connection.add_ice_candidate(candidate).await {
            Ok(()) => true,
            Err(e) => {
                self.report(SignalError::negotiation(sender, e));
                self.finish_transmission().await;
                false
            }
        }
    }

    // ---- listeners ---------------------------------------------------

    async fn on_offer(&mut self, offerer: ParticipantId, offer: OfferRecord) {
        if &offerer == self.me() {
            return;
        }
        match self.listeners.classify(&offerer, offer.epoch) {
            OfferDisposition::Redelivery => {
                debug!(%offerer, epoch = %offer.epoch, "Offer redelivered, keeping listener");
                return;
            }
            OfferDisposition::Replacement { previous } => {
                info!(channel = %self.directory.channel(), %offerer, "Offer replaced, restarting listener");
                self.close_listener(&offerer, previous.state);
            }
            OfferDisposition::New => {}
        }

        let epoch = offer.epoch;
        self.listeners.observe(offerer.clone(), epoch);
        metrics::counter!("signaling.listeners.created").increment(1);

        if let Err(e) = self.answer_offer(&offerer, offer).await {
            self.report(e);
            self.registry.release(&ConnectionKey::Incoming(offerer.clone()));
            self.listeners.set_state(&offerer, ListenState::Closed);
        }
        self.update_connection_gauge();
    }

    async fn answer_offer(&mut self, offerer: &ParticipantId, offer: OfferRecord) -> SignalResult<()> {
        let key = ConnectionKey::Incoming(offerer.clone());
        let remote = |e: MediaError| SignalError::negotiation(offerer, e);

        let connection = self.factory.create().await.map_err(remote)?;
        self.registry.register(key.clone(), offer.epoch, connection.clone())?;
        self.forward_connection(key, &connection);
        self.listeners.set_state(offerer, ListenState::Answering);

        connection.set_remote_description(offer.description).await.map_err(remote)?;
        let answer = connection.create_answer().await.map_err(remote)?;
        connection.set_local_description(answer.clone()).await.map_err(remote)?;

        let record = AnswerRecord {
            offer_epoch: offer.epoch,
            description: answer,
        };
        self.directory.publish_answer(offerer, &record).await.map_err(|e| {
            SignalError::directory_write(self.directory.paths().answer(offerer, self.me()), e)
        })?;
        metrics::counter!("signaling.answers.published").increment(1);
        info!(channel = %self.directory.channel(), %offerer, "Answer published");

        for candidate in self.listeners.take_backlog(offerer, offer.epoch) {
            connection.add_ice_candidate(candidate).await.map_err(remote)?;
        }
        Ok(())
    }

    fn on_offer_withdrawn(&mut self, offerer: ParticipantId) {
        if let Some(session) = self.listeners.get(&offerer) {
            info!(channel = %self.directory.channel(), %offerer, "Offer withdrawn, closing listener");
            self.close_listener(&offerer, session.state);
            self.listeners.remove(&offerer);
            self.update_connection_gauge();
        }
    }

    async fn on_offerer_candidate(&mut self, offerer: ParticipantId, record: CandidateRecord) {
        if self.listeners.accepts_candidate(&offerer, record.offer_epoch) {
            let key = ConnectionKey::Incoming(offerer.clone());
            if let Some(connection) = self.registry.lookup(&key).cloned() {
                if let Err(e) = connection.add_ice_candidate(record.candidate).await {
                    self.fail_listener(&offerer, SignalError::negotiation(&offerer, e));
                }
            }
            return;
        }

        match self.listeners.get(&offerer) {
            Some(session) if session.epoch == record.offer_epoch => {
                debug!(%offerer, state = %session.state, "Dropping candidate for inactive listener");
            }
            _ => {
                if !self.listeners.buffer_candidate(offerer.clone(), record.offer_epoch, record.candidate) {
                    debug!(%offerer, "Candidate backlog full, dropping");
                }
            }
        }
    }

    /// Release the connection for `offerer`, announcing the end of its audio
    /// if it had been announced as available
    fn close_listener(&mut self, offerer: &ParticipantId, state: ListenState) {
        self.registry.release(&ConnectionKey::Incoming(offerer.clone()));
        self.listeners.set_state(offerer, ListenState::Closed);
        if state == ListenState::Connected {
            self.callbacks.remote_audio(RemoteAudioEvent::Ended {
                from: offerer.clone(),
            });
        }
    }

    fn fail_listener(&mut self, offerer: &ParticipantId, err: SignalError) {
        self.report(err);
        if let Some(session) = self.listeners.get(offerer) {
            self.close_listener(offerer, session.state);
        }
        self.update_connection_gauge();
    }

    // ---- dispatch ----------------------------------------------------

    /// Apply a decoded directory change. Presence events are not handled here.
    pub async fn handle_event(&mut self, event: ChannelEvent) {
        match event {
            ChannelEvent::OfferPublished { offerer, offer } => self.on_offer(offerer, offer).await,
            ChannelEvent::OfferWithdrawn { offerer } => self.on_offer_withdrawn(offerer),
            ChannelEvent::AnswerPublished { responder, answer } => self.on_answer(responder, answer).await,
            ChannelEvent::CandidateAppended { publisher, candidate } => {
                if &publisher == self.me() {
                    return;
                }
                let addressed_to_me = candidate.target.as_ref().map(|t| t == self.me());
                match addressed_to_me {
                    None => self.on_offerer_candidate(publisher, candidate).await,
                    Some(true) => self.on_listener_candidate(publisher, candidate).await,
                    Some(false) => {}
                }
            }
            ChannelEvent::Malformed { path, reason } => {
                warn!(%path, %reason, "Ignoring malformed directory record");
                metrics::counter!("signaling.records.malformed").increment(1);
            }
            ChannelEvent::PresenceUpdated { .. } | ChannelEvent::PresenceRemoved { .. } => {}
        }
    }

    /// Apply an event raised by one of this attachment's connections
    pub async fn handle_connection_event(
        &mut self,
        key: ConnectionKey,
        connection: ConnectionId,
        event: PeerConnectionEvent,
    ) {
        if !self.registry.is_current(&key, connection) {
            debug!(%key, %connection, "Dropping event from released connection");
            metrics::counter!("signaling.events.stale").increment(1);
            return;
        }

        match (key, event) {
            (ConnectionKey::Outgoing, PeerConnectionEvent::LocalCandidate(candidate)) => {
                let Some(epoch) = self.transmitter.epoch() else {
                    return;
                };
                self.publish_candidate(CandidateRecord {
                    offer_epoch: epoch,
                    target: None,
                    candidate,
                })
                .await;
            }
            (ConnectionKey::Incoming(offerer), PeerConnectionEvent::LocalCandidate(candidate)) => {
                let Some(session) = self.listeners.get(&offerer) else {
                    return;
                };
                self.publish_candidate(CandidateRecord {
                    offer_epoch: session.epoch,
                    target: Some(offerer),
                    candidate,
                })
                .await;
            }
            (ConnectionKey::Incoming(offerer), PeerConnectionEvent::RemoteTrack(audio)) => {
                if self.listeners.mark_connected(&offerer) {
                    info!(channel = %self.directory.channel(), %offerer, "Listener connected");
                    self.callbacks.remote_audio(RemoteAudioEvent::Available { from: offerer, audio });
                }
            }
            (ConnectionKey::Outgoing, PeerConnectionEvent::RemoteTrack(_)) => {
                debug!("Ignoring inbound track on outgoing connection");
            }
        }
    }

    /// Candidate publication is best-effort. The first one arms disconnect
    /// removal of the whole collection, for listeners and offerers alike.
    async fn publish_candidate(&mut self, record: CandidateRecord) {
        if !self.candidate_hook {
            match self.directory.arm_candidate_cleanup().await {
                Ok(()) => self.candidate_hook = true,
                Err(e) => warn!(channel = %self.directory.channel(), error = %e, "Failed to arm candidate cleanup"),
            }
        }
        self.own_candidates = true;
        match self.directory.append_candidate(&record).await {
            Ok(()) => metrics::counter!("signaling.candidates.published").increment(1),
            Err(e) => {
                warn!(channel = %self.directory.channel(), error = %e, "Candidate publish failed");
                metrics::counter!("signaling.directory.write_failed").increment(1);
            }
        }
    }

    fn forward_connection(&mut self, key: ConnectionKey, connection: &SharedConnection) {
        let Some(mut events) = connection.take_events() else {
            return;
        };
        let inputs = self.inputs.clone();
        let generation = self.generation;
        let id = connection.id();
        let task_key = key.clone();
        let task = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let input = SignalInput::Connection {
                    generation,
                    key: task_key.clone(),
                    connection: id,
                    event,
                };
                if inputs.send(input).is_err() {
                    break;
                }
            }
        });
        self.registry.set_forwarder(&key, task.abort_handle());
    }

    fn report(&self, err: SignalError) {
        if matches!(err, SignalError::Negotiation { .. }) {
            metrics::counter!("signaling.negotiation.failed").increment(1);
        }
        self.callbacks.error(&err);
    }

    fn update_connection_gauge(&self) {
        metrics::gauge!("signaling.connections.incoming").set(self.registry.incoming_count() as f64);
    }

    fn detach_feeds(&mut self) {
        for feed in self.feeds.drain(..) {
            feed.detach();
        }
    }

    /// Leave the channel's signaling: stop transmitting, detach every feed,
    /// close every listener and remove the candidates published as a listener
    pub async fn close(&mut self) {
        self.stop_transmitting().await;
        self.detach_feeds();
        for (offerer, session) in self.listeners.drain() {
            self.close_listener(&offerer, session.state);
        }
        self.registry.release_all();
        self.update_connection_gauge();

        if self.own_candidates
            && self
                .bounded_cleanup("candidates", self.directory.remove_candidates())
                .await
        {
            self.own_candidates = false;
            self.candidate_hook = false;
        }
        debug!(channel = %self.directory.channel(), "Signaling closed");
    }
}

impl Drop for ChannelSignaling {
    fn drop(&mut self) {
        self.detach_feeds();
    }
}
