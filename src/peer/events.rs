use crate::error::PeerError;
use crate::messaging::{ChatMessage, Delivery, PrescriptionMessage};
use crate::error::MediaError;
use crate::peer::media::LocalTrack;
use crate::peer::state::PeerState;
use crate::peer::transport::TransportEvent;
use crate::peer::types::TrackInfo;
use crate::signaling::SignalEntry;
use serde_json::Value;
use tokio::sync::oneshot;

/// Что видит UI
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    LocalMedia(Vec<TrackInfo>),
    RemoteMedia(TrackInfo),
    ConnectionState(PeerState),
    Chat(ChatMessage),
    Prescription(PrescriptionMessage),
    /// Нефатальные проблемы, сессия продолжается
    Warning(PeerError),
    PeerLeft,
    Error(PeerError),
}

pub type Reply<T> = oneshot::Sender<Result<T, PeerError>>;

#[derive(Debug)]
pub enum Command {
    ToggleAudio(Reply<bool>),
    ToggleVideo(Reply<bool>),
    ToggleScreenShare(Reply<bool>),
    SendChat(String, Reply<Delivery>),
    SendPrescription(Value, Reply<Delivery>),
    Leave(Reply<()>),
}

/// Единая очередь контроллера: сигналы, события транспорта и команды UI
#[derive(Debug)]
pub enum ControllerEvent {
    Signal(SignalEntry),
    Transport {
        generation: u64,
        event: TransportEvent,
    },
    RelayClosed,
    Command(Command),
    /// Итог запроса экрана; `attempt` отсекает отменённые запросы
    ScreenCaptured {
        attempt: u64,
        result: Result<LocalTrack, MediaError>,
    },
}

impl Command {
    /// Ответ на команду, пришедшую после остановки контроллера
    pub(crate) fn reject(self, err: PeerError) {
        match self {
            Command::Leave(reply) => {
                let _ = reply.send(Ok(()));
            }
            Command::ToggleAudio(reply)
            | Command::ToggleVideo(reply)
            | Command::ToggleScreenShare(reply) => {
                let _ = reply.send(Err(err));
            }
            Command::SendChat(_, reply) | Command::SendPrescription(_, reply) => {
                let _ = reply.send(Err(err));
            }
        }
    }
}
