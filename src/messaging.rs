use crate::error::PeerError;
use crate::peer::transport::PeerTransport;
use crate::signaling::{Signal, SignalKind, SignalRelay};
use crate::utils::random_id;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub from: String,
    pub text: String,
    pub sent_at: DateTime<Utc>,
}

/// Структурированное назначение; хранение — забота внешнего сервиса
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrescriptionMessage {
    pub id: String,
    pub from: String,
    pub payload: Value,
    pub sent_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Envelope {
    Chat(ChatMessage),
    Prescription(PrescriptionMessage),
    Bye { from: String, connection_id: String },
}

impl Envelope {
    fn id(&self) -> Option<&str> {
        match self {
            Envelope::Chat(msg) => Some(&msg.id),
            Envelope::Prescription(msg) => Some(&msg.id),
            Envelope::Bye { .. } => None,
        }
    }

    fn relay_kind(&self) -> SignalKind {
        match self {
            Envelope::Prescription(_) => SignalKind::Prescription,
            _ => SignalKind::Message,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Direct,
    Relayed,
}

pub struct DataChannelMessaging {
    session_id: String,
    local_id: String,
    relay: SignalRelay,
    seen: HashSet<String>,
}

impl DataChannelMessaging {
    pub fn new(session_id: &str, local_id: &str, relay: SignalRelay) -> Self {
        Self {
            session_id: session_id.to_string(),
            local_id: local_id.to_string(),
            relay,
            seen: HashSet::new(),
        }
    }

    pub fn chat(&self, text: String) -> Envelope {
        Envelope::Chat(ChatMessage {
            id: random_id(),
            from: self.local_id.clone(),
            text,
            sent_at: Utc::now(),
        })
    }

    pub fn prescription(&self, payload: Value) -> Envelope {
        Envelope::Prescription(PrescriptionMessage {
            id: random_id(),
            from: self.local_id.clone(),
            payload,
            sent_at: Utc::now(),
        })
    }

    pub fn bye(&self, connection_id: &str) -> Envelope {
        Envelope::Bye {
            from: self.local_id.clone(),
            connection_id: connection_id.to_string(),
        }
    }

    /// `direct` передаётся только когда соединение установлено и канал открыт.
    /// Если прямой путь недоступен или сломался, сообщение уходит через relay.
    pub async fn send(
        &self,
        envelope: &Envelope,
        direct: Option<&dyn PeerTransport>,
    ) -> Result<Delivery, PeerError> {
        let text = serde_json::to_string(envelope)
            .map_err(|err| PeerError::Negotiation(err.to_string()))?;

        if let Some(transport) = direct {
            match transport.send_data(text).await {
                Ok(()) => {
                    debug!(session_id = %self.session_id, "message sent over data channel");
                    return Ok(Delivery::Direct);
                }
                Err(err) => {
                    warn!(session_id = %self.session_id, %err, "data channel send failed, falling back to relay");
                }
            }
        }

        let signal = Signal::encode(envelope.relay_kind(), self.local_id.clone(), envelope)
            .map_err(|err| PeerError::Negotiation(err.to_string()))?;
        self.relay.publish(&self.session_id, signal)?;
        debug!(session_id = %self.session_id, "message sent over relay");
        Ok(Delivery::Relayed)
    }

    pub fn receive_direct(&mut self, raw: &str) -> Option<Envelope> {
        match serde_json::from_str::<Envelope>(raw) {
            Ok(envelope) => self.accept(envelope),
            Err(err) => {
                warn!(%err, "dropping malformed data channel message");
                None
            }
        }
    }

    pub fn receive_relayed(&mut self, signal: &Signal) -> Option<Envelope> {
        match signal.decode::<Envelope>() {
            Ok(envelope) => self.accept(envelope),
            Err(err) => {
                warn!(%err, sender = %signal.sender_id, "dropping malformed relayed message");
                None
            }
        }
    }

    /// Одно и то же сообщение могло прийти и напрямую, и через relay
    fn accept(&mut self, envelope: Envelope) -> Option<Envelope> {
        if let Some(id) = envelope.id() {
            if !self.seen.insert(id.to_string()) {
                debug!(id, "duplicate message dropped");
                return None;
            }
        }
        Some(envelope)
    }
}
