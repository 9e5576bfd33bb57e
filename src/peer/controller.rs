use crate::config::CoreConfig;
use crate::error::{FailureReason, MediaError, PeerError, RelayError};
use crate::logger::{analyze_candidates, dump_candidate};
use crate::messaging::{DataChannelMessaging, Delivery, Envelope};
use crate::peer::events::{Command, ControllerEvent, Reply, SessionEvent};
use crate::peer::media::{LocalTrack, MediaDevices};
use crate::peer::state::{
    AnswerCheck, Negotiation, OfferCheck, ParticipantConnectionState, PeerState,
};
use crate::peer::transport::{LinkState, PeerTransport, TransportEvent, TransportFactory};
use crate::peer::types::{IceCandidate, MediaKind, Role, SdpPayload, SessionDescription};
use crate::signaling::{Signal, SignalEntry, SignalKind, SignalRelay, Subscription};
use crate::utils::random_id;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

/// Всё, что нужно контроллеру от внешнего мира
pub struct ControllerParams {
    pub session_id: String,
    pub local_id: String,
    pub remote_id: String,
    pub config: Arc<CoreConfig>,
    pub relay: SignalRelay,
    pub devices: Arc<dyn MediaDevices>,
    pub factory: Arc<dyn TransportFactory>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeadlineKind {
    /// Ждём answer на offer полного рукопожатия
    Answer { round: u64 },
    Renegotiation { round: u64 },
    /// Ждём рабочий сетевой путь
    Path,
    /// Связь пропала, ждём что она вернётся сама
    Grace,
}

#[derive(Debug, Clone, Copy)]
struct Deadline {
    at: Instant,
    kind: DeadlineKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OfferKind {
    Initial,
    Retry,
    IceRestart,
    Renegotiation,
}

struct PendingShare {
    enabling: bool,
    previous_local_round: Option<u64>,
    reply: Reply<bool>,
}

/// Запрос экрана, для которого ещё открыт диалог разрешения
struct ScreenRequest {
    attempt: u64,
    reply: Reply<bool>,
    task: JoinHandle<()>,
}

/// Автомат соединения участника: одна задача и одна ограниченная очередь,
/// через которую приходят сигналы relay, события транспорта и команды UI
pub struct PeerConnectionController {
    session_id: String,
    local_id: String,
    remote_id: String,
    role: Role,
    connection_id: String,
    config: Arc<CoreConfig>,
    relay: SignalRelay,
    devices: Arc<dyn MediaDevices>,
    factory: Arc<dyn TransportFactory>,

    transport: Option<Arc<dyn PeerTransport>>,
    generation: u64,
    forwarder: Option<JoinHandle<()>>,
    pump: Option<JoinHandle<()>>,

    conn: ParticipantConnectionState,
    negotiation: Negotiation,
    messaging: DataChannelMessaging,
    deadline: Option<Deadline>,
    pending_share: Option<PendingShare>,
    screen_request: Option<ScreenRequest>,
    screen_attempts: u64,
    gathered: Vec<IceCandidate>,
    handshake_retries_used: u32,
    ice_restarts_used: u32,
    was_connected: bool,
    closed_by_peer: bool,
    released: bool,

    queue_tx: mpsc::Sender<ControllerEvent>,
    events: mpsc::UnboundedSender<SessionEvent>,
    state_tx: watch::Sender<PeerState>,
    leaving: watch::Receiver<bool>,
}

impl PeerConnectionController {
    pub(crate) fn new(
        params: ControllerParams,
        queue_tx: mpsc::Sender<ControllerEvent>,
        events: mpsc::UnboundedSender<SessionEvent>,
        state_tx: watch::Sender<PeerState>,
        leaving: watch::Receiver<bool>,
    ) -> Self {
        let role = Role::for_participants(&params.local_id, &params.remote_id);
        let messaging =
            DataChannelMessaging::new(&params.session_id, &params.local_id, params.relay.clone());
        Self {
            role,
            connection_id: random_id(),
            messaging,
            session_id: params.session_id,
            local_id: params.local_id,
            remote_id: params.remote_id,
            config: params.config,
            relay: params.relay,
            devices: params.devices,
            factory: params.factory,
            transport: None,
            generation: 0,
            forwarder: None,
            pump: None,
            conn: ParticipantConnectionState::default(),
            negotiation: Negotiation::new(),
            deadline: None,
            pending_share: None,
            screen_request: None,
            screen_attempts: 0,
            gathered: Vec::new(),
            handshake_retries_used: 0,
            ice_restarts_used: 0,
            was_connected: false,
            closed_by_peer: false,
            released: false,
            queue_tx,
            events,
            state_tx,
            leaving,
        }
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Основной цикл. `ready` срабатывает, когда захват и запуск завершились
    pub(crate) async fn run(
        mut self,
        mut queue: mpsc::Receiver<ControllerEvent>,
        ready: oneshot::Sender<Result<(), PeerError>>,
    ) {
        info!(
            session_id = %self.session_id,
            participant = %self.local_id,
            connection_id = %self.connection_id,
            role = ?self.role,
            "controller started"
        );
        match self.start().await {
            Ok(true) => {
                let _ = ready.send(Ok(()));
            }
            Ok(false) => {
                info!(participant = %self.local_id, "left while capturing");
                self.shutdown(PeerState::Closed).await;
                let _ = ready.send(Err(PeerError::ControllerGone));
            }
            Err(err) => {
                self.fail(err.clone()).await;
                let _ = ready.send(Err(err));
            }
        }

        while !self.conn.state.is_terminal() {
            let next = match self.deadline.map(|deadline| deadline.at) {
                Some(at) => tokio::select! {
                    biased;
                    event = queue.recv() => Some(event),
                    _ = sleep_until(at) => None,
                },
                None => Some(queue.recv().await),
            };
            match next {
                Some(Some(event)) => self.handle(event).await,
                Some(None) => self.shutdown(PeerState::Closed).await,
                None => self.on_deadline().await,
            }
        }

        queue.close();
        while let Ok(event) = queue.try_recv() {
            if let ControllerEvent::Command(command) = event {
                command.reject(self.stop_error());
            }
        }
        debug!(participant = %self.local_id, "controller task finished");
    }

    async fn start(&mut self) -> Result<bool, PeerError> {
        self.set_state(PeerState::Capturing);
        let Some(audio) = self.capture(MediaKind::Audio).await? else {
            return Ok(false);
        };
        self.conn.media.audio = Some(audio);
        let Some(camera) = self.capture(MediaKind::Video).await? else {
            return Ok(false);
        };
        self.conn.media.camera = Some(camera);
        self.emit(SessionEvent::LocalMedia(self.conn.media.outgoing()));

        self.mark_departed_remotes()?;
        self.build_transport().await?;
        let subscription = self.relay.subscribe(&self.session_id, &self.local_id)?;
        self.pump = Some(tokio::spawn(pump(subscription, self.queue_tx.clone())));

        match self.role {
            Role::Caller => {
                self.set_state(PeerState::Offering);
                self.send_offer(OfferKind::Initial).await?;
            }
            Role::Callee => self.set_state(PeerState::Answering),
        }
        Ok(true)
    }

    /// Захват устройства; `None`, если во время ожидания разрешения пришёл leave
    async fn capture(&self, kind: MediaKind) -> Result<Option<LocalTrack>, PeerError> {
        let devices = self.devices.clone();
        let mut leaving = self.leaving.clone();
        tokio::select! {
            biased;
            _ = wait_for_leave(&mut leaving) => Ok(None),
            result = devices.acquire(kind) => {
                let track = result?;
                debug!(%kind, track = %track.info().id, "device captured");
                Ok(Some(track))
            }
        }
    }

    /// Экземпляры собеседника, уже попрощавшиеся до нашего старта
    fn mark_departed_remotes(&mut self) -> Result<(), PeerError> {
        for entry in self.relay.entries(&self.session_id)? {
            if entry.signal.sender_id != self.remote_id || entry.signal.kind != SignalKind::Message
            {
                continue;
            }
            if let Ok(Envelope::Bye { connection_id, .. }) = entry.signal.decode::<Envelope>() {
                debug!(%connection_id, "remote incarnation already left");
                self.negotiation.mark_closed(&connection_id);
            }
        }
        Ok(())
    }

    async fn build_transport(&mut self) -> Result<(), PeerError> {
        self.drop_transport().await;
        self.generation += 1;
        let generation = self.generation;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let transport = self
            .factory
            .create(&self.local_id, self.role, &self.connection_id, tx)
            .await?;
        let queue = self.queue_tx.clone();
        self.forwarder = Some(tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let event = ControllerEvent::Transport { generation, event };
                if queue.send(event).await.is_err() {
                    break;
                }
            }
        }));
        self.transport = Some(transport.clone());
        self.conn.link_up = false;
        self.conn.data_channel_open = false;
        self.conn.candidates.clear_local();
        self.gathered.clear();

        for track in self.conn.media.outgoing() {
            transport.add_track(&track).await?;
        }
        debug!(generation, "transport ready");
        Ok(())
    }

    async fn drop_transport(&mut self) {
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
        }
        if let Some(transport) = self.transport.take() {
            transport.close().await;
            debug!(generation = self.generation, "transport closed");
        }
    }

    fn transport(&self) -> Result<Arc<dyn PeerTransport>, PeerError> {
        self.transport.clone().ok_or(PeerError::NotConnected)
    }

    /// Прямой путь для сообщений есть только в установленном соединении
    fn direct_path(&self) -> Option<Arc<dyn PeerTransport>> {
        let connected = matches!(
            self.conn.state,
            PeerState::Connected | PeerState::Renegotiating
        );
        if !connected || !self.conn.link_up || !self.conn.data_channel_open {
            return None;
        }
        self.transport
            .clone()
            .filter(|transport| transport.data_channel_open())
    }

    async fn handle(&mut self, event: ControllerEvent) {
        let result = match event {
            ControllerEvent::Signal(entry) => self.on_signal(entry).await,
            ControllerEvent::Transport { generation, event } if generation == self.generation => {
                self.on_transport(event).await
            }
            ControllerEvent::Transport { generation, event } => {
                debug!(generation, ?event, "event from replaced transport ignored");
                Ok(())
            }
            ControllerEvent::RelayClosed => {
                info!(session_id = %self.session_id, "relay closed, session is over");
                self.shutdown(PeerState::Closed).await;
                Ok(())
            }
            ControllerEvent::Command(command) => {
                self.on_command(command).await;
                Ok(())
            }
            ControllerEvent::ScreenCaptured { attempt, result } => {
                self.on_screen_captured(attempt, result).await;
                Ok(())
            }
        };
        if let Err(err) = result {
            self.fail(err).await;
        }
    }

    // ---------- сигналы ----------

    async fn on_signal(&mut self, entry: SignalEntry) -> Result<(), PeerError> {
        let signal = entry.signal;
        if signal.sender_id != self.remote_id {
            debug!(sender = %signal.sender_id, seq = entry.seq, "signal from outside the pair ignored");
            return Ok(());
        }
        match signal.kind {
            SignalKind::Offer => match decode::<SdpPayload>(&signal) {
                Some(offer) => self.on_offer(offer).await,
                None => Ok(()),
            },
            SignalKind::Answer => match decode::<SdpPayload>(&signal) {
                Some(answer) => self.on_answer(answer).await,
                None => Ok(()),
            },
            SignalKind::IceCandidate => match decode::<IceCandidate>(&signal) {
                Some(candidate) => {
                    self.on_remote_candidate(candidate).await;
                    Ok(())
                }
                None => Ok(()),
            },
            SignalKind::Message | SignalKind::Prescription => {
                match self.messaging.receive_relayed(&signal) {
                    Some(envelope) => self.on_envelope(envelope).await,
                    None => Ok(()),
                }
            }
        }
    }

    async fn on_offer(&mut self, offer: SdpPayload) -> Result<(), PeerError> {
        let check = self.negotiation.check_offer(&offer);
        if matches!(check, OfferCheck::Stale | OfferCheck::FromClosedPeer) {
            debug!(?check, round = offer.round, from = %offer.connection_id, "offer discarded");
            return Ok(());
        }

        if self.role == Role::Caller {
            // caller отвечает только на пересогласование от уже связанного callee
            if check != OfferCheck::Fresh
                || self.conn.state != PeerState::Connected
                || !self.conn.link_up
            {
                debug!(?check, state = %self.conn.state, "offer ignored by caller");
                return Ok(());
            }
            if let Some(round) = self.negotiation.pending_offer() {
                info!(own_round = round, their_round = offer.round, "glare: keeping own offer");
                return Ok(());
            }
            return self.answer_offer(offer).await;
        }

        if self.pending_share.is_some() {
            self.revert_share("remote offer took precedence").await;
        }
        let rebind = offer.fresh || check == OfferCheck::NewRemote;
        if rebind && self.negotiation.remote_round.is_some() {
            info!(from = %offer.connection_id, round = offer.round, "full handshake requested, rebuilding transport");
            self.negotiation.reset_descriptions();
            self.build_transport().await?;
            self.set_state(PeerState::Answering);
        }
        self.answer_offer(offer).await
    }

    async fn answer_offer(&mut self, offer: SdpPayload) -> Result<(), PeerError> {
        let renegotiation = self.conn.state == PeerState::Connected
            && self.conn.link_up
            && !offer.fresh
            && !offer.restart;
        if renegotiation {
            self.set_state(PeerState::Renegotiating);
        } else if self.conn.state != PeerState::Answering {
            self.set_state(PeerState::Answering);
        }

        let transport = self.transport()?;
        if let Err(err) = self.apply_offer(&transport, &offer).await {
            if renegotiation && !matches!(err, PeerError::Relay(_)) {
                warn!(%err, "renegotiation answer failed");
                self.emit(SessionEvent::Warning(PeerError::RenegotiationFailed(
                    err.to_string(),
                )));
                self.set_state(PeerState::Connected);
                return Ok(());
            }
            return Err(err);
        }

        if renegotiation {
            self.set_state(PeerState::Connected);
        } else {
            self.deadline = None;
            self.maybe_connected();
            if !self.conn.link_up {
                self.arm(DeadlineKind::Path, self.config.signaling_timeout());
            }
        }
        Ok(())
    }

    /// Порядок: remote description, затем answer
    async fn apply_offer(
        &mut self,
        transport: &Arc<dyn PeerTransport>,
        offer: &SdpPayload,
    ) -> Result<(), PeerError> {
        transport.set_remote_description(offer.sdp.clone()).await?;
        self.negotiation.offer_accepted(offer);
        self.negotiation.remote_round = Some(offer.round);
        self.discard_stale_candidates();
        self.flush_remote_candidates().await;

        let answer = transport.create_answer().await?;
        transport.set_local_description(answer.clone()).await?;
        self.negotiation.local_round = Some(offer.round);

        let mut payload = self.sdp_payload(answer, offer.round);
        payload.target = Some(offer.connection_id.clone());
        self.publish(SignalKind::Answer, &payload)?;
        info!(round = offer.round, to = %offer.connection_id, "answer published");
        self.flush_local_candidates()
    }

    async fn on_answer(&mut self, answer: SdpPayload) -> Result<(), PeerError> {
        match self.negotiation.check_answer(&answer, &self.connection_id) {
            AnswerCheck::Apply => {}
            check => {
                debug!(?check, round = answer.round, from = %answer.connection_id, "answer discarded");
                return Ok(());
            }
        }

        let transport = self.transport()?;
        let renegotiation = self.pending_share.is_some();
        if let Err(err) = transport.set_remote_description(answer.sdp.clone()).await {
            if renegotiation {
                self.revert_share(&err.to_string()).await;
                return Ok(());
            }
            return Err(err.into());
        }
        self.negotiation.answer_accepted(&answer);
        self.negotiation.remote_round = Some(answer.round);
        self.deadline = None;
        info!(round = answer.round, from = %answer.connection_id, "answer applied");
        self.discard_stale_candidates();
        self.flush_remote_candidates().await;

        if renegotiation {
            self.complete_share();
        } else {
            self.maybe_connected();
            if !self.conn.link_up {
                self.arm(DeadlineKind::Path, self.config.signaling_timeout());
            }
        }
        Ok(())
    }

    async fn on_remote_candidate(&mut self, candidate: IceCandidate) {
        if self.negotiation.is_closed(&candidate.connection_id) {
            debug!(from = %candidate.connection_id, "candidate from departed peer dropped");
            return;
        }
        let bound = self.negotiation.remote_connection() == Some(candidate.connection_id.as_str());
        if bound && candidate.round < self.negotiation.candidate_floor() {
            debug!(round = candidate.round, "candidate from previous ICE session dropped");
            return;
        }
        self.conn.candidates.push_remote(candidate);
        self.flush_remote_candidates().await;
    }

    fn discard_stale_candidates(&mut self) {
        let dropped = self
            .conn
            .candidates
            .discard_remote_below(self.negotiation.candidate_floor());
        if dropped > 0 {
            debug!(dropped, "stale remote candidates discarded");
        }
    }

    /// Применяет буферизованных кандидатов, для которых уже есть remote description
    async fn flush_remote_candidates(&mut self) {
        let (Some(remote), Some(round)) = (
            self.negotiation.remote_connection().map(str::to_owned),
            self.negotiation.remote_round,
        ) else {
            return;
        };
        let ready = self.conn.candidates.ready_remote(&remote, round);
        if ready.is_empty() {
            return;
        }
        let Some(transport) = self.transport.clone() else {
            return;
        };
        debug!(count = ready.len(), pending = self.conn.candidates.remote_len(), "applying remote candidates");
        for candidate in ready {
            dump_candidate("REMOTE", &candidate);
            if let Err(err) = transport.add_ice_candidate(candidate).await {
                warn!(%err, "remote candidate rejected");
            }
        }
    }

    fn flush_local_candidates(&mut self) -> Result<(), PeerError> {
        let Some(round) = self.negotiation.local_round else {
            return Ok(());
        };
        for mut candidate in self.conn.candidates.take_local() {
            candidate.round = round;
            candidate.connection_id = self.connection_id.clone();
            self.publish(SignalKind::IceCandidate, &candidate)?;
            self.gathered.push(candidate);
        }
        Ok(())
    }

    async fn on_envelope(&mut self, envelope: Envelope) -> Result<(), PeerError> {
        match envelope {
            Envelope::Chat(message) => self.emit(SessionEvent::Chat(message)),
            Envelope::Prescription(message) => self.emit(SessionEvent::Prescription(message)),
            Envelope::Bye {
                from,
                connection_id,
            } => self.on_bye(&from, &connection_id).await,
        }
        Ok(())
    }

    async fn on_bye(&mut self, from: &str, connection_id: &str) {
        if from != self.remote_id || self.negotiation.is_closed(connection_id) {
            return;
        }
        self.negotiation.mark_closed(connection_id);
        let dropped = self.conn.candidates.discard_remote_from(connection_id);
        debug!(%connection_id, dropped, "remote incarnation said goodbye");

        if self.negotiation.remote_connection() == Some(connection_id) {
            info!(peer = %self.remote_id, "peer left the session");
            self.closed_by_peer = true;
            self.emit(SessionEvent::PeerLeft);
            self.shutdown(PeerState::Closed).await;
        }
    }

    // ---------- транспорт ----------

    async fn on_transport(&mut self, event: TransportEvent) -> Result<(), PeerError> {
        match event {
            TransportEvent::LocalCandidate(candidate) => {
                dump_candidate("LOCAL", &candidate);
                self.conn.candidates.push_local(candidate);
                self.flush_local_candidates()?;
            }
            TransportEvent::GatheringComplete => {
                debug!(count = self.gathered.len(), "candidate gathering complete");
                analyze_candidates(&self.gathered);
            }
            TransportEvent::Link(LinkState::Connected) => {
                self.conn.link_up = true;
                if matches!(self.deadline, Some(Deadline { kind: DeadlineKind::Grace, .. })) {
                    info!("link recovered within grace period");
                    self.deadline = None;
                }
                self.maybe_connected();
            }
            TransportEvent::Link(LinkState::Disconnected) => {
                self.conn.link_up = false;
                if self.conn.state == PeerState::Connected && self.deadline.is_none() {
                    warn!(
                        grace_ms = self.config.grace_period_ms,
                        "link disconnected, starting grace period"
                    );
                    self.arm(DeadlineKind::Grace, self.config.grace_period());
                }
            }
            TransportEvent::Link(LinkState::Failed) => {
                self.conn.link_up = false;
                self.on_path_failure().await?;
            }
            TransportEvent::Link(state) => debug!(?state, "link state"),
            TransportEvent::DataChannelOpen => {
                info!("data channel open");
                self.conn.data_channel_open = true;
            }
            TransportEvent::DataChannelClosed => {
                debug!("data channel closed");
                self.conn.data_channel_open = false;
            }
            TransportEvent::DataMessage(raw) => {
                if let Some(envelope) = self.messaging.receive_direct(&raw) {
                    self.on_envelope(envelope).await?;
                }
            }
            TransportEvent::RemoteTrack(track) => {
                info!(kind = %track.kind, track = %track.id, "remote track");
                self.emit(SessionEvent::RemoteMedia(track));
            }
        }
        Ok(())
    }

    fn maybe_connected(&mut self) {
        if !matches!(self.conn.state, PeerState::Offering | PeerState::Answering) {
            return;
        }
        if !self.conn.link_up || !self.negotiation.descriptions_settled() {
            return;
        }
        if matches!(
            self.deadline,
            Some(Deadline {
                kind: DeadlineKind::Path | DeadlineKind::Grace,
                ..
            })
        ) {
            self.deadline = None;
        }
        if self.was_connected {
            info!(restarts = self.ice_restarts_used, "connection recovered");
        }
        self.ice_restarts_used = 0;
        self.was_connected = true;
        self.set_state(PeerState::Connected);
    }

    /// Потеря пути: ICE restart в пределах бюджета, иначе провал
    async fn on_path_failure(&mut self) -> Result<(), PeerError> {
        self.deadline = None;
        self.conn.link_up = false;
        if self.pending_share.is_some() {
            self.revert_share("network path lost").await;
        }
        self.ice_restarts_used += 1;
        if self.ice_restarts_used > self.config.max_ice_restarts {
            warn!(
                restarts = self.config.max_ice_restarts,
                "network path lost, restart budget exhausted"
            );
            return Err(PeerError::IceFailure);
        }
        warn!(attempt = self.ice_restarts_used, "network path lost, restarting ICE");
        match self.role {
            Role::Caller => {
                self.set_state(PeerState::Offering);
                self.send_offer(OfferKind::IceRestart).await?;
            }
            Role::Callee => {
                // restart инициирует caller, ждём его offer
                self.set_state(PeerState::Answering);
                self.arm(DeadlineKind::Path, self.config.signaling_timeout());
            }
        }
        Ok(())
    }

    // ---------- отправка offer ----------

    async fn send_offer(&mut self, kind: OfferKind) -> Result<u64, PeerError> {
        let transport = self.transport()?;
        let round = self.negotiation.next_round();
        let fresh = matches!(kind, OfferKind::Initial | OfferKind::Retry);
        let restart = kind == OfferKind::IceRestart;
        if fresh || restart {
            self.negotiation.raise_candidate_floor(round);
            self.discard_stale_candidates();
        }

        let offer = transport.create_offer(restart).await?;
        transport.set_local_description(offer.clone()).await?;
        self.negotiation.local_round = Some(round);
        self.negotiation.offer_sent(round);

        let mut payload = self.sdp_payload(offer, round);
        payload.fresh = fresh;
        payload.restart = restart;
        self.publish(SignalKind::Offer, &payload)?;
        info!(round, ?kind, "offer published");
        self.flush_local_candidates()?;

        let deadline = match kind {
            OfferKind::Initial | OfferKind::Retry => DeadlineKind::Answer { round },
            OfferKind::Renegotiation => DeadlineKind::Renegotiation { round },
            OfferKind::IceRestart => DeadlineKind::Path,
        };
        self.arm(deadline, self.config.signaling_timeout());
        Ok(round)
    }

    fn sdp_payload(&self, sdp: SessionDescription, round: u64) -> SdpPayload {
        SdpPayload {
            sdp,
            round,
            connection_id: self.connection_id.clone(),
            target: None,
            fresh: false,
            restart: false,
            ts: chrono::Utc::now().timestamp(),
        }
    }

    fn publish<T: Serialize>(&self, kind: SignalKind, payload: &T) -> Result<(), PeerError> {
        let signal = Signal::encode(kind, self.local_id.clone(), payload)
            .map_err(|err| PeerError::Negotiation(err.to_string()))?;
        self.relay.publish(&self.session_id, signal)?;
        Ok(())
    }

    // ---------- тайм-ауты ----------

    fn arm(&mut self, kind: DeadlineKind, after: Duration) {
        debug!(?kind, after_ms = after.as_millis() as u64, "deadline armed");
        self.deadline = Some(Deadline {
            at: Instant::now() + after,
            kind,
        });
    }

    async fn on_deadline(&mut self) {
        let Some(deadline) = self.deadline.take() else {
            return;
        };
        let pending = self.negotiation.pending_offer();
        let result = match deadline.kind {
            DeadlineKind::Answer { round } if pending == Some(round) => {
                self.on_signaling_timeout().await
            }
            DeadlineKind::Renegotiation { round } if pending == Some(round) => {
                self.revert_share("no answer to renegotiation offer").await;
                Ok(())
            }
            DeadlineKind::Path | DeadlineKind::Grace => self.on_path_failure().await,
            kind => {
                debug!(?kind, "deadline no longer relevant");
                Ok(())
            }
        };
        if let Err(err) = result {
            self.fail(err).await;
        }
    }

    /// Нет answer: один полный повтор рукопожатия с новым транспортом
    async fn on_signaling_timeout(&mut self) -> Result<(), PeerError> {
        if self.handshake_retries_used >= self.config.handshake_retries {
            warn!(retries = self.handshake_retries_used, "no answer after retries");
            return Err(PeerError::SignalingTimeout);
        }
        self.handshake_retries_used += 1;
        warn!(attempt = self.handshake_retries_used, "no answer, retrying full handshake");
        self.negotiation.abandon_offer();
        self.negotiation.reset_descriptions();
        self.build_transport().await?;
        self.send_offer(OfferKind::Retry).await?;
        Ok(())
    }

    // ---------- команды ----------

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::ToggleAudio(reply) => {
                let _ = reply.send(Ok(self.toggle(MediaKind::Audio)));
            }
            Command::ToggleVideo(reply) => {
                let _ = reply.send(Ok(self.toggle(MediaKind::Video)));
            }
            Command::ToggleScreenShare(reply) => self.toggle_screen_share(reply).await,
            Command::SendChat(text, reply) => {
                let envelope = self.messaging.chat(text);
                let _ = reply.send(self.send_envelope(&envelope).await);
            }
            Command::SendPrescription(payload, reply) => {
                let envelope = self.messaging.prescription(payload);
                let _ = reply.send(self.send_envelope(&envelope).await);
            }
            Command::Leave(reply) => {
                info!(participant = %self.local_id, state = %self.conn.state, "leave requested");
                self.shutdown(PeerState::Closed).await;
                let _ = reply.send(Ok(()));
            }
        }
    }

    /// Возвращает новое значение флага; без захвата ничего не меняет
    fn toggle(&self, kind: MediaKind) -> bool {
        let track = match kind {
            MediaKind::Audio => self.conn.media.audio.as_ref(),
            _ => self.conn.media.camera.as_ref(),
        };
        match track {
            Some(track) => {
                let enabled = track.toggle();
                info!(%kind, enabled, "track toggled");
                enabled
            }
            None => false,
        }
    }

    async fn send_envelope(&self, envelope: &Envelope) -> Result<Delivery, PeerError> {
        let direct = self.direct_path();
        self.messaging.send(envelope, direct.as_deref()).await
    }

    async fn toggle_screen_share(&mut self, reply: Reply<bool>) {
        if let Some(request) = self.screen_request.take() {
            // повторное нажатие отменяет ещё не выданный запрос
            request.task.abort();
            info!(attempt = request.attempt, "screen request cancelled");
            let _ = request.reply.send(Ok(false));
            let _ = reply.send(Ok(false));
            return;
        }
        let sharing = self.conn.media.screen.is_some();
        if self.conn.state != PeerState::Connected || !self.conn.link_up {
            let _ = reply.send(Err(PeerError::NotConnected));
            return;
        }
        if self.negotiation.pending_offer().is_some() {
            debug!("negotiation in flight, screen share toggle ignored");
            let _ = reply.send(Ok(sharing));
            return;
        }
        if sharing {
            self.begin_share(false, reply).await;
        } else {
            self.request_screen(reply);
        }
    }

    fn can_renegotiate(&self) -> bool {
        self.conn.state == PeerState::Connected
            && self.conn.link_up
            && self.negotiation.pending_offer().is_none()
    }

    /// Захват экрана идёт в своей задаче, цикл контроллера в это время работает дальше
    fn request_screen(&mut self, reply: Reply<bool>) {
        self.screen_attempts += 1;
        let attempt = self.screen_attempts;
        let devices = self.devices.clone();
        let mut leaving = self.leaving.clone();
        let queue = self.queue_tx.clone();
        let task = tokio::spawn(async move {
            let result = tokio::select! {
                biased;
                _ = wait_for_leave(&mut leaving) => return,
                result = devices.acquire(MediaKind::Screen) => result,
            };
            let event = ControllerEvent::ScreenCaptured { attempt, result };
            if queue.send(event).await.is_err() {
                debug!(attempt, "controller stopped before screen capture finished");
            }
        });
        debug!(attempt, "screen capture requested");
        self.screen_request = Some(ScreenRequest {
            attempt,
            reply,
            task,
        });
    }

    async fn on_screen_captured(&mut self, attempt: u64, result: Result<LocalTrack, MediaError>) {
        let current = self
            .screen_request
            .as_ref()
            .is_some_and(|request| request.attempt == attempt);
        if !current {
            debug!(attempt, "outdated screen capture dropped");
            return;
        }
        let Some(request) = self.screen_request.take() else {
            return;
        };
        let track = match result {
            Ok(track) => track,
            Err(err) => {
                let err = PeerError::from(err);
                warn!(%err, "screen capture failed");
                self.emit(SessionEvent::Warning(PeerError::RenegotiationFailed(
                    err.to_string(),
                )));
                let _ = request.reply.send(Err(err));
                return;
            }
        };
        if !self.can_renegotiate() {
            warn!(state = %self.conn.state, "connection changed during screen prompt, capture released");
            let _ = request.reply.send(Err(PeerError::NotConnected));
            return;
        }
        debug!(track = %track.info().id, "screen captured");
        self.conn.media.screen = Some(track);
        self.begin_share(true, request.reply).await;
    }

    async fn begin_share(&mut self, enabling: bool, reply: Reply<bool>) {
        self.pending_share = Some(PendingShare {
            enabling,
            previous_local_round: self.negotiation.local_round,
            reply,
        });
        self.set_state(PeerState::Renegotiating);
        let outcome = match self.switch_video(enabling).await {
            Ok(()) => self.send_offer(OfferKind::Renegotiation).await.map(|_| ()),
            Err(err) => Err(err),
        };
        if let Err(err) = outcome {
            self.revert_share(&err.to_string()).await;
        }
    }

    async fn switch_video(&self, to_screen: bool) -> Result<(), PeerError> {
        let transport = self.transport()?;
        let track = if to_screen {
            self.conn.media.screen.as_ref()
        } else {
            self.conn.media.camera.as_ref()
        };
        if let Some(track) = track {
            transport.replace_video_track(track.info()).await?;
            debug!(track = %track.info().id, "outgoing video switched");
        }
        Ok(())
    }

    fn complete_share(&mut self) {
        let Some(share) = self.pending_share.take() else {
            return;
        };
        if !share.enabling {
            self.conn.media.screen = None;
        }
        let sharing = self.conn.media.screen.is_some();
        info!(sharing, "screen share renegotiated");
        self.emit(SessionEvent::LocalMedia(self.conn.media.outgoing()));
        let _ = share.reply.send(Ok(sharing));
        self.set_state(PeerState::Connected);
        if !self.conn.link_up && self.deadline.is_none() {
            self.arm(DeadlineKind::Grace, self.config.grace_period());
        }
    }

    /// Неудачное пересогласование: прежний трек возвращается, соединение остаётся
    async fn revert_share(&mut self, reason: &str) {
        let Some(share) = self.pending_share.take() else {
            return;
        };
        if self.negotiation.abandon_offer().is_some() {
            if let Some(transport) = &self.transport {
                if let Err(err) = transport.rollback().await {
                    debug!(%err, "rollback failed");
                }
            }
            self.negotiation.local_round = share.previous_local_round;
        }
        if let Err(err) = self.switch_video(!share.enabling).await {
            warn!(%err, "could not restore previous video track");
        }
        if share.enabling {
            self.conn.media.screen = None;
        }
        if matches!(
            self.deadline,
            Some(Deadline {
                kind: DeadlineKind::Renegotiation { .. },
                ..
            })
        ) {
            self.deadline = None;
        }

        let sharing = self.conn.media.screen.is_some();
        warn!(reason, sharing, "screen share renegotiation failed, track reverted");
        self.emit(SessionEvent::Warning(PeerError::RenegotiationFailed(
            reason.to_string(),
        )));
        let _ = share.reply.send(Ok(sharing));
        if self.conn.state == PeerState::Renegotiating {
            self.set_state(PeerState::Connected);
        }
        if self.conn.state == PeerState::Connected && !self.conn.link_up && self.deadline.is_none()
        {
            self.arm(DeadlineKind::Grace, self.config.grace_period());
        }
    }

    // ---------- завершение ----------

    async fn fail(&mut self, err: PeerError) {
        if let PeerError::Relay(RelayError::SessionClosed(_)) = err {
            info!(session_id = %self.session_id, "session closed, stopping controller");
            self.shutdown(PeerState::Closed).await;
            return;
        }
        let reason = failure_reason(&err);
        let surfaced = match err {
            PeerError::SignalingTimeout | PeerError::IceFailure => {
                PeerError::ConnectionFailed(reason)
            }
            other => other,
        };
        warn!(error = %surfaced, participant = %self.local_id, "controller failed");
        self.emit(SessionEvent::Error(surfaced));
        self.shutdown(PeerState::Failed(reason)).await;
    }

    /// Единый путь освобождения ресурсов; выполняется ровно один раз
    async fn shutdown(&mut self, final_state: PeerState) {
        if self.released {
            return;
        }
        self.released = true;
        self.deadline = None;
        if let Some(request) = self.screen_request.take() {
            request.task.abort();
            let _ = request.reply.send(self.interrupted_share());
        }
        if let Some(share) = self.pending_share.take() {
            let _ = share.reply.send(self.interrupted_share());
        }

        self.say_goodbye().await;
        self.drop_transport().await;
        if let Some(pump) = self.pump.take() {
            pump.abort();
            let _ = pump.await;
        }
        let released = self.conn.media.release();
        self.conn.candidates.clear();
        self.conn.link_up = false;
        self.conn.data_channel_open = false;
        info!(
            participant = %self.local_id,
            released_tracks = released,
            state = %final_state,
            "controller resources released"
        );
        self.set_state(final_state);
    }

    /// bye по data-channel и через relay; ошибки не важны
    async fn say_goodbye(&self) {
        if self.transport.is_none() && self.pump.is_none() {
            return;
        }
        let bye = self.messaging.bye(&self.connection_id);
        if let Some(transport) = self.direct_path() {
            if let Err(err) = self.messaging.send(&bye, Some(transport.as_ref())).await {
                debug!(%err, "bye not sent directly");
            }
        }
        if let Err(err) = self.messaging.send(&bye, None).await {
            debug!(%err, "bye not relayed");
        }
    }

    /// Ответ на демонстрацию экрана, прерванную остановкой контроллера
    fn interrupted_share(&self) -> Result<bool, PeerError> {
        if self.closed_by_peer {
            Err(PeerError::SessionClosedByPeer)
        } else {
            Ok(false)
        }
    }

    fn stop_error(&self) -> PeerError {
        if self.closed_by_peer {
            PeerError::SessionClosedByPeer
        } else {
            PeerError::ControllerGone
        }
    }

    fn set_state(&mut self, next: PeerState) {
        if self.conn.state == next {
            return;
        }
        info!(
            participant = %self.local_id,
            from = %self.conn.state,
            to = %next,
            "peer state changed"
        );
        self.conn.state = next;
        self.state_tx.send_replace(next);
        self.emit(SessionEvent::ConnectionState(next));
    }

    fn emit(&self, event: SessionEvent) {
        if self.events.send(event).is_err() {
            debug!("session event receiver dropped");
        }
    }
}

fn failure_reason(err: &PeerError) -> FailureReason {
    match err {
        PeerError::PermissionDenied(_) => FailureReason::PermissionDenied,
        PeerError::SignalingTimeout => FailureReason::SignalingTimeout,
        PeerError::IceFailure => FailureReason::IceFailure,
        PeerError::ConnectionFailed(reason) => *reason,
        _ => FailureReason::Negotiation,
    }
}

fn decode<T: DeserializeOwned>(signal: &Signal) -> Option<T> {
    match signal.decode::<T>() {
        Ok(value) => Some(value),
        Err(err) => {
            warn!(%err, kind = ?signal.kind, "dropping malformed signal");
            None
        }
    }
}

async fn wait_for_leave(leaving: &mut watch::Receiver<bool>) {
    if leaving.wait_for(|flag| *flag).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Перекачивает relay в очередь. Место в очереди резервируется заранее,
/// поэтому прочитанная запись не теряется
async fn pump(mut subscription: Subscription, queue: mpsc::Sender<ControllerEvent>) {
    loop {
        let Ok(permit) = queue.reserve().await else {
            break;
        };
        match subscription.next().await {
            Some(entry) => permit.send(ControllerEvent::Signal(entry)),
            None => {
                permit.send(ControllerEvent::RelayClosed);
                break;
            }
        }
    }
    debug!(
        session_id = subscription.session_id(),
        participant = subscription.participant_id(),
        "relay pump stopped"
    );
}
