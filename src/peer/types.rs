use serde::{Deserialize, Serialize};
use std::fmt;

/// Тип описания сессии
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// Описание сессии без привязки к конкретному транспорту
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// Полезная нагрузка SDP с метаданными раунда
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SdpPayload {
    pub sdp: SessionDescription,
    pub round: u64,
    /// ID контроллера-отправителя
    pub connection_id: String,
    /// Для answer: ID контроллера, чей offer принят
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    /// Полное рукопожатие (первый offer или повтор с нуля)
    #[serde(default)]
    pub fresh: bool,
    /// ICE restart: кандидаты прошлых раундов больше не нужны
    #[serde(default)]
    pub restart: bool,
    pub ts: i64,
}

/// ICE кандидат для соединения
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct IceCandidate {
    pub candidate: String,
    pub sdp_mid: Option<String>,
    pub sdp_mline_index: Option<u16>,
    pub connection_id: String, // ID соединения для сопоставления
    #[serde(default)]
    pub round: u64,
}

/// Конфигурация ICE сервера
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub id: String,
    pub r#type: String, // 'stun' or 'turn'
    pub url: String,
    pub username: Option<String>,
    pub credential: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Audio,
    Video,
    Screen,
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
            MediaKind::Screen => "screen",
        };
        f.write_str(label)
    }
}

/// Описание трека, которое видят транспорт и UI
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TrackInfo {
    pub id: String,
    pub kind: MediaKind,
    pub label: String,
}

/// Роль в рукопожатии
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Caller,
    Callee,
}

impl Role {
    /// Меньший id всегда звонит первым, так что одновременных offer'ов не бывает
    pub fn for_participants(local_id: &str, remote_id: &str) -> Role {
        if local_id < remote_id {
            Role::Caller
        } else {
            Role::Callee
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_assignment_is_symmetric() {
        assert_eq!(Role::for_participants("dr-house", "pt-wilson"), Role::Caller);
        assert_eq!(Role::for_participants("pt-wilson", "dr-house"), Role::Callee);
    }

    #[test]
    fn server_config_uses_plain_type_key() {
        let raw = r#"{"id":"a","type":"turn","url":"turn:x","username":"u","credential":"c"}"#;
        let parsed: ServerConfig = serde_json::from_str(raw).expect("parse");
        assert_eq!(parsed.r#type, "turn");
    }
}
