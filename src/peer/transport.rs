use crate::error::TransportError;
use crate::peer::types::{IceCandidate, Role, SessionDescription, TrackInfo};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Состояние сетевого пути
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// События от транспорта; кандидаты приходят без round, его проставляет контроллер
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    LocalCandidate(IceCandidate),
    GatheringComplete,
    Link(LinkState),
    DataChannelOpen,
    DataChannelClosed,
    DataMessage(String),
    RemoteTrack(TrackInfo),
}

pub type TransportEvents = mpsc::UnboundedSender<TransportEvent>;

#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription, TransportError>;
    async fn create_answer(&self) -> Result<SessionDescription, TransportError>;
    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), TransportError>;
    async fn set_remote_description(&self, desc: SessionDescription)
        -> Result<(), TransportError>;
    /// Откатывает неотвеченный локальный offer
    async fn rollback(&self) -> Result<(), TransportError>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError>;
    async fn add_track(&self, track: &TrackInfo) -> Result<(), TransportError>;
    /// Подменяет исходящий видео-трек без пересоздания соединения
    async fn replace_video_track(&self, track: &TrackInfo) -> Result<(), TransportError>;
    async fn send_data(&self, text: String) -> Result<(), TransportError>;
    fn data_channel_open(&self) -> bool;
    async fn close(&self);
}

#[async_trait]
pub trait TransportFactory: Send + Sync {
    /// Создаёт транспорт; caller сам открывает data-channel, callee его принимает
    async fn create(
        &self,
        local_id: &str,
        role: Role,
        connection_id: &str,
        events: TransportEvents,
    ) -> Result<Arc<dyn PeerTransport>, TransportError>;
}
