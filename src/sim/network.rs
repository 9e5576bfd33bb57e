use crate::error::TransportError;
use crate::peer::transport::{
    LinkState, PeerTransport, TransportEvent, TransportEvents, TransportFactory,
};
use crate::peer::types::{IceCandidate, MediaKind, Role, SdpKind, SessionDescription, TrackInfo};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;

const SDP_PREFIX: &str = "sim";
const TAG_MARKER: &str = "sim-tag";

/// Кто и в каком ICE-сеансе сгенерировал описание или кандидата
#[derive(Debug, Clone, PartialEq, Eq)]
struct IceTag {
    participant: String,
    endpoint: u64,
    ufrag: u32,
}

impl IceTag {
    fn render(&self, version: u32) -> String {
        format!(
            "{SDP_PREFIX}/{}/{}/{}/{version}",
            self.participant, self.endpoint, self.ufrag
        )
    }

    fn token(&self) -> String {
        format!("{}/{}/{}", self.participant, self.endpoint, self.ufrag)
    }

    fn parse_sdp(sdp: &str) -> Option<Self> {
        let rest = sdp.strip_prefix(SDP_PREFIX)?.strip_prefix('/')?;
        let mut fields = rest.rsplitn(4, '/');
        let _version: u32 = fields.next()?.parse().ok()?;
        let ufrag = fields.next()?.parse().ok()?;
        let endpoint = fields.next()?.parse().ok()?;
        let participant = fields.next()?.to_string();
        Some(Self {
            participant,
            endpoint,
            ufrag,
        })
    }

    fn parse_candidate(candidate: &str) -> Option<Self> {
        let mut words = candidate.split_whitespace();
        words.find(|word| *word == TAG_MARKER)?;
        let token = words.next()?;
        let mut fields = token.rsplitn(3, '/');
        let ufrag = fields.next()?.parse().ok()?;
        let endpoint = fields.next()?.parse().ok()?;
        let participant = fields.next()?.to_string();
        Some(Self {
            participant,
            endpoint,
            ufrag,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
}

struct Endpoint {
    id: u64,
    role: Role,
    events: TransportEvents,
    ufrag: u32,
    version: u32,
    gathered_ufrag: Option<u32>,
    signaling: SignalingState,
    local: Option<SessionDescription>,
    stable_local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    remote_tag: Option<IceTag>,
    restart_pending: bool,
    valid_candidates: usize,
    link: LinkState,
    reported: Option<(String, String)>,
    channel_open: bool,
    outgoing: Vec<TrackInfo>,
    announced: HashSet<String>,
}

impl Endpoint {
    fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }

    fn tag(&self, participant: &str) -> IceTag {
        IceTag {
            participant: participant.to_string(),
            endpoint: self.id,
            ufrag: self.ufrag,
        }
    }

    fn pair_key(&self) -> Option<(String, String)> {
        match (&self.local, &self.remote) {
            (Some(local), Some(remote)) => Some((local.sdp.clone(), remote.sdp.clone())),
            _ => None,
        }
    }
}

#[derive(Default)]
struct NetState {
    endpoints: HashMap<String, Endpoint>,
    next_endpoint: u64,
    unreachable: bool,
    fail_offer: HashSet<String>,
    applied: HashMap<String, Vec<String>>,
    offers: HashMap<String, usize>,
}

impl NetState {
    fn endpoint_mut(&mut self, participant: &str, id: u64) -> Result<&mut Endpoint, TransportError> {
        match self.endpoints.get_mut(participant) {
            Some(endpoint) if endpoint.id == id => Ok(endpoint),
            _ => Err(TransportError::Closed),
        }
    }

    fn endpoint(&self, participant: &str, id: u64) -> Result<&Endpoint, TransportError> {
        match self.endpoints.get(participant) {
            Some(endpoint) if endpoint.id == id => Ok(endpoint),
            _ => Err(TransportError::Closed),
        }
    }

    /// Текущий экземпляр собеседника, если он всё ещё жив
    fn peer_of(&self, participant: &str) -> Option<IceTag> {
        let tag = self.endpoints.get(participant)?.remote_tag.clone()?;
        match self.endpoints.get(&tag.participant) {
            Some(peer) if peer.id == tag.endpoint && tag.participant != participant => Some(tag),
            _ => None,
        }
    }

    fn evaluate(&mut self, participant: &str) {
        let Some(peer_tag) = self.peer_of(participant) else {
            return;
        };
        let (Some(local), Some(peer)) = (
            self.endpoints.get(participant),
            self.endpoints.get(&peer_tag.participant),
        ) else {
            return;
        };
        let crossed = match (&local.local, &local.remote, &peer.local, &peer.remote) {
            (Some(ours), Some(theirs_seen), Some(theirs), Some(ours_seen)) => {
                ours.sdp == ours_seen.sdp && theirs.sdp == theirs_seen.sdp
            }
            _ => false,
        };
        if !crossed || local.valid_candidates == 0 || peer.valid_candidates == 0 {
            return;
        }

        let unreachable = self.unreachable;
        for name in [participant, peer_tag.participant.as_str()] {
            let Some(endpoint) = self.endpoints.get_mut(name) else {
                continue;
            };
            let key = endpoint.pair_key();
            if unreachable {
                if endpoint.reported != key {
                    endpoint.reported = key;
                    endpoint.link = LinkState::Failed;
                    debug!(participant = name, "sim: no route to peer");
                    endpoint.emit(TransportEvent::Link(LinkState::Failed));
                }
                continue;
            }
            if endpoint.link != LinkState::Connected {
                endpoint.reported = key;
                endpoint.link = LinkState::Connected;
                debug!(participant = name, role = ?endpoint.role, "sim: link up");
                endpoint.emit(TransportEvent::Link(LinkState::Connected));
            }
            if !endpoint.channel_open {
                endpoint.channel_open = true;
                endpoint.emit(TransportEvent::DataChannelOpen);
            }
        }
    }
}

/// Общая «сеть» для всех участников теста. Пара соединяется, когда у обеих
/// сторон есть текущие описания друг друга и хотя бы один кандидат собеседника;
/// итог сообщается один раз на пару описаний
#[derive(Clone, Default)]
pub struct SimNetwork {
    state: Arc<Mutex<NetState>>,
}

impl SimNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn factory(&self) -> Arc<SimTransportFactory> {
        Arc::new(SimTransportFactory { net: self.clone() })
    }

    /// Новые пары описаний будут заканчиваться `Failed`
    pub fn set_unreachable(&self, unreachable: bool) {
        self.state.lock().unreachable = unreachable;
    }

    /// Обрывает все установленные пути
    pub fn break_link(&self) {
        let mut state = self.state.lock();
        for (name, endpoint) in state.endpoints.iter_mut() {
            if endpoint.link == LinkState::Connected {
                endpoint.link = LinkState::Disconnected;
                debug!(participant = %name, "sim: link broken");
                endpoint.emit(TransportEvent::Link(LinkState::Disconnected));
            }
        }
    }

    /// Следующий create_offer этого участника завершится ошибкой
    pub fn fail_next_offer(&self, participant: &str) {
        self.state.lock().fail_offer.insert(participant.to_string());
    }

    /// Кандидаты, применённые транспортами участника, в порядке применения
    pub fn applied_candidates(&self, participant: &str) -> Vec<String> {
        self.state
            .lock()
            .applied
            .get(participant)
            .cloned()
            .unwrap_or_default()
    }

    pub fn offers_created(&self, participant: &str) -> usize {
        self.state.lock().offers.get(participant).copied().unwrap_or(0)
    }

    pub fn open_transports(&self) -> usize {
        self.state.lock().endpoints.len()
    }

    /// Трек, который сейчас уходит в видео-слот участника
    pub fn outgoing_video(&self, participant: &str) -> Option<TrackInfo> {
        let state = self.state.lock();
        state
            .endpoints
            .get(participant)?
            .outgoing
            .iter()
            .find(|track| track.kind != MediaKind::Audio)
            .cloned()
    }

    /// Описание от участника без живого транспорта, для сценариев с ручным собеседником
    pub fn scripted_offer(participant: &str, ufrag: u32) -> SessionDescription {
        let tag = IceTag {
            participant: participant.to_string(),
            endpoint: 0,
            ufrag,
        };
        SessionDescription::offer(tag.render(1))
    }

    pub fn scripted_candidate(participant: &str, ufrag: u32, n: u32) -> String {
        let tag = IceTag {
            participant: participant.to_string(),
            endpoint: 0,
            ufrag,
        };
        candidate_line(&tag, n)
    }
}

fn candidate_line(tag: &IceTag, n: u32) -> String {
    format!(
        "candidate:{n} 1 udp 2130706431 10.0.{}.{} {} typ host {TAG_MARKER} {}",
        tag.endpoint % 250,
        n % 250,
        40_000 + tag.ufrag,
        tag.token()
    )
}

pub struct SimTransportFactory {
    net: SimNetwork,
}

#[async_trait]
impl TransportFactory for SimTransportFactory {
    async fn create(
        &self,
        local_id: &str,
        role: Role,
        connection_id: &str,
        events: TransportEvents,
    ) -> Result<Arc<dyn PeerTransport>, TransportError> {
        let mut state = self.net.state.lock();
        state.next_endpoint += 1;
        let id = state.next_endpoint;
        let endpoint = Endpoint {
            id,
            role,
            events,
            ufrag: 1,
            version: 0,
            gathered_ufrag: None,
            signaling: SignalingState::Stable,
            local: None,
            stable_local: None,
            remote: None,
            remote_tag: None,
            restart_pending: false,
            valid_candidates: 0,
            link: LinkState::Connecting,
            reported: None,
            channel_open: false,
            outgoing: Vec::new(),
            announced: HashSet::new(),
        };
        if state.endpoints.insert(local_id.to_string(), endpoint).is_some() {
            debug!(participant = local_id, "sim: previous endpoint replaced");
        }
        debug!(participant = local_id, endpoint = id, %connection_id, "sim: endpoint created");
        Ok(Arc::new(SimTransport {
            net: self.net.clone(),
            participant: local_id.to_string(),
            id,
        }))
    }
}

pub struct SimTransport {
    net: SimNetwork,
    participant: String,
    id: u64,
}

#[async_trait]
impl PeerTransport for SimTransport {
    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription, TransportError> {
        let mut state = self.net.state.lock();
        if state.fail_offer.remove(&self.participant) {
            return Err(TransportError::Negotiation("simulated offer failure".into()));
        }
        *state.offers.entry(self.participant.clone()).or_default() += 1;
        let endpoint = state.endpoint_mut(&self.participant, self.id)?;
        if ice_restart {
            endpoint.ufrag += 1;
        }
        endpoint.version += 1;
        Ok(SessionDescription::offer(
            endpoint.tag(&self.participant).render(endpoint.version),
        ))
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        let mut state = self.net.state.lock();
        let endpoint = state.endpoint_mut(&self.participant, self.id)?;
        if endpoint.signaling != SignalingState::HaveRemoteOffer {
            return Err(TransportError::Negotiation("no remote offer to answer".into()));
        }
        if endpoint.restart_pending {
            endpoint.restart_pending = false;
            endpoint.ufrag += 1;
        }
        endpoint.version += 1;
        Ok(SessionDescription::answer(
            endpoint.tag(&self.participant).render(endpoint.version),
        ))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), TransportError> {
        let mut state = self.net.state.lock();
        let endpoint = state.endpoint_mut(&self.participant, self.id)?;
        let tag = IceTag::parse_sdp(&desc.sdp)
            .filter(|tag| tag.participant == self.participant && tag.endpoint == self.id)
            .ok_or_else(|| TransportError::Negotiation("description from another endpoint".into()))?;

        match (desc.kind, endpoint.signaling) {
            (SdpKind::Offer, SignalingState::Stable) => {
                endpoint.stable_local = endpoint.local.clone();
                endpoint.signaling = SignalingState::HaveLocalOffer;
            }
            (SdpKind::Offer, SignalingState::HaveLocalOffer) => {}
            (SdpKind::Answer, SignalingState::HaveRemoteOffer) => {
                endpoint.signaling = SignalingState::Stable;
            }
            (kind, signaling) => {
                return Err(TransportError::Negotiation(format!(
                    "cannot set local {kind:?} in {signaling:?}"
                )));
            }
        }
        endpoint.local = Some(desc);

        if endpoint.gathered_ufrag != Some(tag.ufrag) {
            endpoint.gathered_ufrag = Some(tag.ufrag);
            endpoint.emit(TransportEvent::LocalCandidate(IceCandidate {
                candidate: candidate_line(&tag, 1),
                sdp_mid: Some("0".into()),
                sdp_mline_index: Some(0),
                connection_id: String::new(),
                round: 0,
            }));
            endpoint.emit(TransportEvent::GatheringComplete);
        }
        state.evaluate(&self.participant);
        Ok(())
    }

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), TransportError> {
        let mut state = self.net.state.lock();
        let tag = IceTag::parse_sdp(&desc.sdp)
            .ok_or_else(|| TransportError::Negotiation("unreadable remote description".into()))?;
        let peer_tracks = match state.endpoints.get(&tag.participant) {
            Some(peer) if peer.id == tag.endpoint => peer.outgoing.clone(),
            _ => Vec::new(),
        };

        let endpoint = state.endpoint_mut(&self.participant, self.id)?;
        match (desc.kind, endpoint.signaling) {
            (SdpKind::Offer, SignalingState::Stable) => {
                endpoint.signaling = SignalingState::HaveRemoteOffer;
            }
            (SdpKind::Answer, SignalingState::HaveLocalOffer) => {
                endpoint.signaling = SignalingState::Stable;
                endpoint.stable_local = None;
            }
            (kind, signaling) => {
                return Err(TransportError::Negotiation(format!(
                    "cannot set remote {kind:?} in {signaling:?}"
                )));
            }
        }
        if endpoint.remote_tag.as_ref() != Some(&tag) {
            if desc.kind == SdpKind::Offer
                && endpoint
                    .remote_tag
                    .as_ref()
                    .is_some_and(|seen| seen.endpoint == tag.endpoint)
            {
                endpoint.restart_pending = true;
            }
            endpoint.remote_tag = Some(tag);
            endpoint.valid_candidates = 0;
        }
        endpoint.remote = Some(desc);

        for track in peer_tracks {
            if endpoint.announced.insert(track.id.clone()) {
                endpoint.emit(TransportEvent::RemoteTrack(track));
            }
        }
        state.evaluate(&self.participant);
        Ok(())
    }

    async fn rollback(&self) -> Result<(), TransportError> {
        let mut state = self.net.state.lock();
        let endpoint = state.endpoint_mut(&self.participant, self.id)?;
        if endpoint.signaling != SignalingState::HaveLocalOffer {
            return Err(TransportError::Negotiation("no local offer to roll back".into()));
        }
        endpoint.local = endpoint.stable_local.take();
        endpoint.signaling = SignalingState::Stable;
        debug!(participant = %self.participant, "sim: local offer rolled back");
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        let mut state = self.net.state.lock();
        let endpoint = state.endpoint_mut(&self.participant, self.id)?;
        if endpoint.remote.is_none() {
            return Err(TransportError::Negotiation("remote description not set".into()));
        }
        let matches_session = IceTag::parse_candidate(&candidate.candidate)
            .is_some_and(|tag| endpoint.remote_tag.as_ref() == Some(&tag));
        if matches_session {
            endpoint.valid_candidates += 1;
        }
        state
            .applied
            .entry(self.participant.clone())
            .or_default()
            .push(candidate.candidate);
        state.evaluate(&self.participant);
        Ok(())
    }

    async fn add_track(&self, track: &TrackInfo) -> Result<(), TransportError> {
        let mut state = self.net.state.lock();
        let endpoint = state.endpoint_mut(&self.participant, self.id)?;
        endpoint.outgoing.push(track.clone());
        Ok(())
    }

    async fn replace_video_track(&self, track: &TrackInfo) -> Result<(), TransportError> {
        let mut state = self.net.state.lock();
        let endpoint = state.endpoint_mut(&self.participant, self.id)?;
        let slot = endpoint
            .outgoing
            .iter_mut()
            .find(|current| current.kind != MediaKind::Audio)
            .ok_or_else(|| TransportError::Negotiation("no video sender".into()))?;
        *slot = track.clone();
        Ok(())
    }

    async fn send_data(&self, text: String) -> Result<(), TransportError> {
        let state = self.net.state.lock();
        let endpoint = state.endpoint(&self.participant, self.id)?;
        if !endpoint.channel_open || endpoint.link != LinkState::Connected {
            return Err(TransportError::ChannelClosed);
        }
        let peer = state
            .peer_of(&self.participant)
            .and_then(|tag| state.endpoints.get(&tag.participant))
            .filter(|peer| peer.channel_open)
            .ok_or(TransportError::ChannelClosed)?;
        peer.emit(TransportEvent::DataMessage(text));
        Ok(())
    }

    fn data_channel_open(&self) -> bool {
        let state = self.net.state.lock();
        state
            .endpoint(&self.participant, self.id)
            .map(|endpoint| endpoint.channel_open)
            .unwrap_or(false)
    }

    async fn close(&self) {
        let mut state = self.net.state.lock();
        let peer = state.peer_of(&self.participant);
        if state.endpoint(&self.participant, self.id).is_err() {
            return;
        }
        state.endpoints.remove(&self.participant);
        debug!(participant = %self.participant, endpoint = self.id, "sim: endpoint closed");

        let Some(peer) = peer else {
            return;
        };
        let Some(endpoint) = state.endpoints.get_mut(&peer.participant) else {
            return;
        };
        let bound_to_us = endpoint
            .remote_tag
            .as_ref()
            .is_some_and(|tag| tag.participant == self.participant && tag.endpoint == self.id);
        if !bound_to_us {
            return;
        }
        if endpoint.channel_open {
            endpoint.channel_open = false;
            endpoint.emit(TransportEvent::DataChannelClosed);
        }
        if endpoint.link == LinkState::Connected {
            endpoint.link = LinkState::Disconnected;
            endpoint.emit(TransportEvent::Link(LinkState::Disconnected));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    async fn endpoint(
        factory: &SimTransportFactory,
        name: &str,
        role: Role,
    ) -> (Arc<dyn PeerTransport>, mpsc::UnboundedReceiver<TransportEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = factory.create(name, role, "c", tx).await.expect("create");
        (transport, rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<TransportEvent>) -> Vec<TransportEvent> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    fn candidates(events: &[TransportEvent]) -> Vec<IceCandidate> {
        events
            .iter()
            .filter_map(|event| match event {
                TransportEvent::LocalCandidate(candidate) => Some(candidate.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn tags_survive_rendering() {
        let tag = IceTag {
            participant: "dr/house".into(),
            endpoint: 7,
            ufrag: 3,
        };
        assert_eq!(IceTag::parse_sdp(&tag.render(9)), Some(tag.clone()));
        assert_eq!(IceTag::parse_candidate(&candidate_line(&tag, 1)), Some(tag));
        assert_eq!(IceTag::parse_sdp("v=0 o=- 1 1 IN IP4 0.0.0.0"), None);
    }

    #[tokio::test]
    async fn crossed_descriptions_and_candidates_connect_both_sides() {
        let net = SimNetwork::new();
        let factory = net.factory();
        let (a, mut a_rx) = endpoint(&factory, "a", Role::Caller).await;
        let (b, mut b_rx) = endpoint(&factory, "b", Role::Callee).await;

        let offer = a.create_offer(false).await.expect("offer");
        a.set_local_description(offer.clone()).await.expect("local offer");
        b.set_remote_description(offer).await.expect("remote offer");
        let answer = b.create_answer().await.expect("answer");
        b.set_local_description(answer.clone()).await.expect("local answer");
        a.set_remote_description(answer).await.expect("remote answer");

        let a_cands = candidates(&drain(&mut a_rx));
        let b_cands = candidates(&drain(&mut b_rx));
        for candidate in a_cands {
            b.add_ice_candidate(candidate).await.expect("b applies");
        }
        assert!(!b.data_channel_open());
        for candidate in b_cands {
            a.add_ice_candidate(candidate).await.expect("a applies");
        }

        assert!(drain(&mut a_rx).contains(&TransportEvent::Link(LinkState::Connected)));
        assert!(drain(&mut b_rx).contains(&TransportEvent::DataChannelOpen));
        a.send_data("ping".into()).await.expect("send");
        assert_eq!(drain(&mut b_rx), vec![TransportEvent::DataMessage("ping".into())]);
    }

    #[tokio::test]
    async fn candidate_before_remote_description_is_rejected() {
        let net = SimNetwork::new();
        let factory = net.factory();
        let (a, _rx) = endpoint(&factory, "a", Role::Caller).await;
        let candidate = IceCandidate {
            candidate: SimNetwork::scripted_candidate("b", 1, 1),
            sdp_mid: None,
            sdp_mline_index: None,
            connection_id: "x".into(),
            round: 1,
        };
        assert!(a.add_ice_candidate(candidate).await.is_err());
        assert!(net.applied_candidates("a").is_empty());
    }

    #[tokio::test]
    async fn rollback_restores_stable_state() {
        let net = SimNetwork::new();
        let factory = net.factory();
        let (a, _rx) = endpoint(&factory, "a", Role::Callee).await;
        assert!(a.rollback().await.is_err());
        let offer = a.create_offer(false).await.expect("offer");
        a.set_local_description(offer).await.expect("local");
        a.rollback().await.expect("rollback");
        a.set_remote_description(SimNetwork::scripted_offer("b", 1))
            .await
            .expect("remote offer after rollback");
    }

    #[tokio::test]
    async fn closed_transport_is_removed() {
        let net = SimNetwork::new();
        let factory = net.factory();
        let (a, _rx) = endpoint(&factory, "a", Role::Caller).await;
        assert_eq!(net.open_transports(), 1);
        a.close().await;
        a.close().await;
        assert_eq!(net.open_transports(), 0);
        assert_eq!(a.create_offer(false).await, Err(TransportError::Closed));
    }
}
