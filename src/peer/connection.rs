use crate::config::CoreConfig;
use crate::error::TransportError;
use crate::peer::data_channel::attach_dc;
use crate::peer::state::DATA_CHANNEL_LABEL;
use crate::peer::transport::{
    LinkState, PeerTransport, TransportEvent, TransportEvents, TransportFactory,
};
use crate::peer::types::{
    IceCandidate, MediaKind, Role, SdpKind, ServerConfig, SessionDescription, TrackInfo,
};
use crate::utils::add_ice_url_scheme;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::rtcp_mux_policy::RTCRtcpMuxPolicy;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;
use webrtc::{
    api::APIBuilder,
    data_channel::{data_channel_init::RTCDataChannelInit, RTCDataChannel},
    ice_transport::ice_server::RTCIceServer,
    peer_connection::{
        configuration::RTCConfiguration, peer_connection_state::RTCPeerConnectionState,
        sdp::session_description::RTCSessionDescription, RTCPeerConnection,
    },
};

pub type DataChannelSlot = Arc<Mutex<Option<Arc<RTCDataChannel>>>>;

/// Транспорт поверх `RTCPeerConnection`
pub struct WebRtcTransport {
    pc: Arc<RTCPeerConnection>,
    data_channel: DataChannelSlot,
    stream_id: String,
    video_sender: Mutex<Option<Arc<RTCRtpSender>>>,
    tracks: Mutex<HashMap<String, Arc<TrackLocalStaticSample>>>,
}

impl WebRtcTransport {
    /// создаём Peer; если caller, то сами делаем data-channel
    pub async fn new(
        servers: &[ServerConfig],
        local_id: &str,
        role: Role,
        connection_id: &str,
        events: TransportEvents,
    ) -> Result<Self, TransportError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();
        let pc = Arc::new(api.new_peer_connection(rtc_config(servers)).await?);

        // Обработчик для сбора локальных кандидатов
        let candidate_events = events.clone();
        let conn_id = connection_id.to_string();
        pc.on_ice_candidate(Box::new(move |cand: Option<RTCIceCandidate>| {
            match cand {
                Some(c) => match c.to_json() {
                    Ok(init) => {
                        let candidate = IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                            connection_id: conn_id.clone(),
                            round: 0,
                        };
                        let _ = candidate_events.send(TransportEvent::LocalCandidate(candidate));
                    }
                    Err(err) => warn!(%err, "failed to serialize local candidate"),
                },
                None => {
                    // cand == None означает конец сбора
                    debug!("ICE candidate gathering completed (null candidate received)");
                    let _ = candidate_events.send(TransportEvent::GatheringComplete);
                }
            }
            Box::pin(async {})
        }));

        pc.on_ice_gathering_state_change(Box::new(move |state| {
            debug!(?state, "ICE gathering state changed");
            Box::pin(async {})
        }));

        let state_events = events.clone();
        let pc_stats = Arc::downgrade(&pc);
        pc.on_peer_connection_state_change(Box::new(move |st: RTCPeerConnectionState| {
            info!(state = ?st, "peer connection state changed");
            let link = match st {
                RTCPeerConnectionState::Connecting => Some(LinkState::Connecting),
                RTCPeerConnectionState::Connected => Some(LinkState::Connected),
                RTCPeerConnectionState::Disconnected => Some(LinkState::Disconnected),
                RTCPeerConnectionState::Failed => Some(LinkState::Failed),
                RTCPeerConnectionState::Closed => Some(LinkState::Closed),
                _ => None,
            };
            if matches!(link, Some(LinkState::Disconnected | LinkState::Failed)) {
                if let Some(pc) = pc_stats.upgrade() {
                    tokio::spawn(async move {
                        dump_selected_pair(&pc, "BEFORE-FAIL").await;
                    });
                }
            }
            if let Some(link) = link {
                let _ = state_events.send(TransportEvent::Link(link));
            }
            Box::pin(async {})
        }));

        let track_events = events.clone();
        pc.on_track(Box::new(move |track: Arc<TrackRemote>, _receiver, _transceiver| {
            let kind = match track.kind() {
                RTPCodecType::Audio => MediaKind::Audio,
                _ => MediaKind::Video,
            };
            let info = TrackInfo {
                id: track.id(),
                kind,
                label: track.stream_id(),
            };
            let _ = track_events.send(TransportEvent::RemoteTrack(info));
            Box::pin(async {})
        }));

        let data_channel: DataChannelSlot = Arc::new(Mutex::new(None));
        match role {
            Role::Caller => {
                let dc = pc
                    .create_data_channel(DATA_CHANNEL_LABEL, Some(RTCDataChannelInit::default()))
                    .await?;
                attach_dc(&dc, &data_channel, &events);
            }
            Role::Callee => {
                let slot = data_channel.clone();
                let dc_events = events.clone();
                pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
                    if dc.label() == DATA_CHANNEL_LABEL {
                        attach_dc(&dc, &slot, &dc_events);
                    } else {
                        warn!(label = dc.label(), "unexpected data channel ignored");
                    }
                    Box::pin(async {})
                }));
            }
        }

        Ok(Self {
            pc,
            data_channel,
            stream_id: format!("{local_id}-media"),
            video_sender: Mutex::new(None),
            tracks: Mutex::new(HashMap::new()),
        })
    }

    /// Трек, в который пайплайн захвата пишет сэмплы
    pub fn local_track(&self, track_id: &str) -> Option<Arc<TrackLocalStaticSample>> {
        self.tracks.lock().get(track_id).cloned()
    }

    fn local_sample_track(&self, info: &TrackInfo) -> Arc<TrackLocalStaticSample> {
        let mut tracks = self.tracks.lock();
        tracks
            .entry(info.id.clone())
            .or_insert_with(|| {
                Arc::new(TrackLocalStaticSample::new(
                    codec_for(info.kind),
                    info.id.clone(),
                    self.stream_id.clone(),
                ))
            })
            .clone()
    }
}

fn codec_for(kind: MediaKind) -> RTCRtpCodecCapability {
    match kind {
        MediaKind::Audio => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_OPUS.to_owned(),
            clock_rate: 48000,
            channels: 2,
            ..Default::default()
        },
        MediaKind::Video | MediaKind::Screen => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_VP8.to_owned(),
            clock_rate: 90000,
            ..Default::default()
        },
    }
}

fn to_rtc(desc: SessionDescription) -> Result<RTCSessionDescription, TransportError> {
    let parsed = match desc.kind {
        SdpKind::Offer => RTCSessionDescription::offer(desc.sdp)?,
        SdpKind::Answer => RTCSessionDescription::answer(desc.sdp)?,
    };
    Ok(parsed)
}

#[async_trait]
impl PeerTransport for WebRtcTransport {
    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription, TransportError> {
        let options = RTCOfferOptions {
            ice_restart,
            ..Default::default()
        };
        let offer = self.pc.create_offer(Some(options)).await?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        let answer = self.pc.create_answer(None).await?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), TransportError> {
        self.pc.set_local_description(to_rtc(desc)?).await?;
        Ok(())
    }

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), TransportError> {
        self.pc.set_remote_description(to_rtc(desc)?).await?;
        Ok(())
    }

    async fn rollback(&self) -> Result<(), TransportError> {
        let mut desc = RTCSessionDescription::default();
        desc.sdp_type = RTCSdpType::Rollback;
        self.pc.set_local_description(desc).await?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: None,
        };
        self.pc.add_ice_candidate(init).await?;
        Ok(())
    }

    async fn add_track(&self, track: &TrackInfo) -> Result<(), TransportError> {
        let local = self.local_sample_track(track);
        let sender = self
            .pc
            .add_track(local as Arc<dyn TrackLocal + Send + Sync>)
            .await?;
        if track.kind != MediaKind::Audio {
            *self.video_sender.lock() = Some(sender);
        }
        debug!(track = %track.id, kind = %track.kind, "local track added");
        Ok(())
    }

    async fn replace_video_track(&self, track: &TrackInfo) -> Result<(), TransportError> {
        let sender = self
            .video_sender
            .lock()
            .clone()
            .ok_or_else(|| TransportError::Negotiation("no video sender".into()))?;
        let local = self.local_sample_track(track);
        sender
            .replace_track(Some(local as Arc<dyn TrackLocal + Send + Sync>))
            .await?;
        debug!(track = %track.id, "video sender track replaced");
        Ok(())
    }

    async fn send_data(&self, text: String) -> Result<(), TransportError> {
        let dc = self
            .data_channel
            .lock()
            .clone()
            .ok_or(TransportError::ChannelClosed)?;
        if dc.ready_state() != RTCDataChannelState::Open {
            return Err(TransportError::ChannelClosed);
        }
        dc.send_text(text).await?;
        Ok(())
    }

    fn data_channel_open(&self) -> bool {
        self.data_channel
            .lock()
            .as_ref()
            .map(|dc| dc.ready_state() == RTCDataChannelState::Open)
            .unwrap_or(false)
    }

    async fn close(&self) {
        if let Err(err) = self.pc.close().await {
            warn!(%err, "peer connection close failed");
        }
    }
}

pub struct WebRtcTransportFactory {
    ice_servers: Vec<ServerConfig>,
}

impl WebRtcTransportFactory {
    pub fn new(config: &CoreConfig) -> Self {
        Self {
            ice_servers: config.ice_servers.clone(),
        }
    }
}

#[async_trait]
impl TransportFactory for WebRtcTransportFactory {
    async fn create(
        &self,
        local_id: &str,
        role: Role,
        connection_id: &str,
        events: TransportEvents,
    ) -> Result<Arc<dyn PeerTransport>, TransportError> {
        let transport =
            WebRtcTransport::new(&self.ice_servers, local_id, role, connection_id, events).await?;
        Ok(Arc::new(transport))
    }
}

/// Создает конфигурацию для peer connection
fn rtc_config(servers: &[ServerConfig]) -> RTCConfiguration {
    RTCConfiguration {
        ice_servers: ice_servers(servers),
        ice_candidate_pool_size: 10,
        bundle_policy: RTCBundlePolicy::MaxBundle,
        rtcp_mux_policy: RTCRtcpMuxPolicy::Require,
        ..Default::default()
    }
}

pub fn ice_servers(servers: &[ServerConfig]) -> Vec<RTCIceServer> {
    servers
        .iter()
        .map(|config| RTCIceServer {
            urls: vec![add_ice_url_scheme(config)],
            username: config.username.clone().unwrap_or_default(),
            credential: config.credential.clone().unwrap_or_default(),
        })
        .collect()
}

/// Быстрый снимок getStats → выбранная пара
pub async fn dump_selected_pair(pc: &RTCPeerConnection, moment: &str) {
    let stats = pc.get_stats().await;
    for (_, v) in stats.reports {
        if let webrtc::stats::StatsReportType::CandidatePair(pair) = v {
            if pair.nominated {
                debug!(
                    "STATS {moment}: {}:{}  type: {:?}  bytes={}/{} state={:?}",
                    pair.local_candidate_id,
                    pair.remote_candidate_id,
                    pair.stats_type,
                    pair.bytes_sent,
                    pair.bytes_received,
                    pair.state
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn track(kind: MediaKind) -> TrackInfo {
        TrackInfo {
            id: format!("{kind}-0"),
            kind,
            label: kind.to_string(),
        }
    }

    #[test]
    fn ice_servers_get_scheme_and_credentials() {
        let servers = vec![ServerConfig {
            id: "t".into(),
            r#type: "turn".into(),
            url: "turn.example.org:3478".into(),
            username: Some("u".into()),
            credential: Some("p".into()),
        }];
        let converted = ice_servers(&servers);
        assert_eq!(converted[0].urls, vec!["turn:turn.example.org:3478".to_string()]);
        assert_eq!(converted[0].username, "u");
    }

    #[tokio::test]
    async fn caller_offer_carries_media_and_data_sections() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let transport = WebRtcTransport::new(&[], "dr-house", Role::Caller, "c1", tx)
            .await
            .expect("transport");
        transport.add_track(&track(MediaKind::Audio)).await.expect("audio");
        transport.add_track(&track(MediaKind::Video)).await.expect("video");
        assert!(transport.local_track("audio-0").is_some());

        let offer = transport.create_offer(false).await.expect("offer");
        assert!(offer.sdp.contains("m=audio"));
        assert!(offer.sdp.contains("m=video"));
        assert!(offer.sdp.contains("m=application"));
        assert!(!transport.data_channel_open());
        transport.close().await;
    }

    #[tokio::test]
    async fn factory_builds_callee_without_data_channel() {
        let config = CoreConfig {
            ice_servers: Vec::new(),
            ..CoreConfig::default()
        };
        let factory = WebRtcTransportFactory::new(&config);
        let (tx, _rx) = mpsc::unbounded_channel();
        let transport = factory
            .create("pt-cameron", Role::Callee, "c2", tx)
            .await
            .expect("transport");
        assert!(!transport.data_channel_open());
        assert_eq!(
            transport.send_data("hello".into()).await,
            Err(TransportError::ChannelClosed)
        );
        transport.close().await;
    }
}
