use crate::error::RelayError;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    Offer,
    Answer,
    IceCandidate,
    Message,
    Prescription,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Signal {
    #[serde(rename = "type")]
    pub kind: SignalKind,
    pub sender_id: String,
    pub payload: Value,
}

impl Signal {
    pub fn new(kind: SignalKind, sender_id: impl Into<String>, payload: Value) -> Self {
        Self {
            kind,
            sender_id: sender_id.into(),
            payload,
        }
    }

    pub fn encode<T: Serialize>(
        kind: SignalKind,
        sender_id: impl Into<String>,
        payload: &T,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self::new(kind, sender_id, serde_json::to_value(payload)?))
    }

    pub fn decode<T: for<'de> Deserialize<'de>>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.payload)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SignalEntry {
    pub seq: u64,
    pub server_timestamp: DateTime<Utc>,
    pub signal: Signal,
}

struct Channel {
    entries: Vec<SignalEntry>,
    closed: bool,
    cursors: HashMap<String, usize>,
    live: usize,
    changes: watch::Sender<usize>,
}

impl Channel {
    fn new() -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            entries: Vec::new(),
            closed: false,
            cursors: HashMap::new(),
            live: 0,
            changes,
        }
    }

    fn next_timestamp(&self) -> DateTime<Utc> {
        let now = Utc::now();
        match self.entries.last() {
            Some(last) if last.server_timestamp >= now => {
                last.server_timestamp + ChronoDuration::microseconds(1)
            }
            _ => now,
        }
    }
}

/// Журнал сигналов сессии только на дописывание; курсор каждого участника
/// сохраняется, так что повторная подписка продолжает с того же места
#[derive(Clone, Default)]
pub struct SignalRelay {
    channels: Arc<Mutex<HashMap<String, Channel>>>,
}

impl SignalRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Открывает канал сессии; повторное открытие ничего не меняет
    pub fn open(&self, session_id: &str) {
        let mut channels = self.channels.lock();
        channels
            .entry(session_id.to_string())
            .or_insert_with(Channel::new);
        debug!(session_id, "relay channel opened");
    }

    /// Дальнейшие publish отклоняются; подписчики дочитывают остаток и завершаются
    pub fn close(&self, session_id: &str) {
        let mut channels = self.channels.lock();
        if let Some(channel) = channels.get_mut(session_id) {
            if !channel.closed {
                channel.closed = true;
                let len = channel.entries.len();
                channel.changes.send_replace(len);
                info!(session_id, entries = len, "relay channel closed");
            }
        }
    }

    pub fn publish(&self, session_id: &str, signal: Signal) -> Result<SignalEntry, RelayError> {
        let mut channels = self.channels.lock();
        let channel = channels
            .get_mut(session_id)
            .ok_or_else(|| RelayError::UnknownSession(session_id.to_string()))?;
        if channel.closed {
            return Err(RelayError::SessionClosed(session_id.to_string()));
        }

        let entry = SignalEntry {
            seq: channel.entries.len() as u64 + 1,
            server_timestamp: channel.next_timestamp(),
            signal,
        };
        debug!(
            session_id,
            seq = entry.seq,
            kind = ?entry.signal.kind,
            sender = %entry.signal.sender_id,
            "signal published"
        );
        channel.entries.push(entry.clone());
        let len = channel.entries.len();
        channel.changes.send_replace(len);
        Ok(entry)
    }

    pub fn subscribe(
        &self,
        session_id: &str,
        participant_id: &str,
    ) -> Result<Subscription, RelayError> {
        let mut channels = self.channels.lock();
        let channel = channels
            .get_mut(session_id)
            .ok_or_else(|| RelayError::UnknownSession(session_id.to_string()))?;
        channel.live += 1;
        let cursor = channel
            .cursors
            .get(participant_id)
            .copied()
            .unwrap_or_default();
        debug!(session_id, participant_id, cursor, "relay subscription opened");
        Ok(Subscription {
            relay: self.clone(),
            session_id: session_id.to_string(),
            participant_id: participant_id.to_string(),
            changes: channel.changes.subscribe(),
        })
    }

    pub fn entries(&self, session_id: &str) -> Result<Vec<SignalEntry>, RelayError> {
        let channels = self.channels.lock();
        channels
            .get(session_id)
            .map(|channel| channel.entries.clone())
            .ok_or_else(|| RelayError::UnknownSession(session_id.to_string()))
    }

    /// Индекс следующей непрочитанной участником записи
    pub fn cursor(&self, session_id: &str, participant_id: &str) -> usize {
        let channels = self.channels.lock();
        channels
            .get(session_id)
            .and_then(|channel| channel.cursors.get(participant_id).copied())
            .unwrap_or_default()
    }

    pub fn subscriber_count(&self, session_id: &str) -> usize {
        let channels = self.channels.lock();
        channels
            .get(session_id)
            .map(|channel| channel.live)
            .unwrap_or_default()
    }

    pub fn is_closed(&self, session_id: &str) -> bool {
        let channels = self.channels.lock();
        channels
            .get(session_id)
            .map(|channel| channel.closed)
            .unwrap_or(true)
    }

    fn take_next(&self, session_id: &str, participant_id: &str) -> Poll {
        let mut channels = self.channels.lock();
        let Some(channel) = channels.get_mut(session_id) else {
            return Poll::Finished;
        };
        let cursor = channel
            .cursors
            .entry(participant_id.to_string())
            .or_default();
        while *cursor < channel.entries.len() {
            let entry = &channel.entries[*cursor];
            *cursor += 1;
            if entry.signal.sender_id != participant_id {
                return Poll::Ready(entry.clone());
            }
        }
        if channel.closed {
            Poll::Finished
        } else {
            Poll::Pending
        }
    }

    fn release(&self, session_id: &str, participant_id: &str) {
        let mut channels = self.channels.lock();
        if let Some(channel) = channels.get_mut(session_id) {
            channel.live = channel.live.saturating_sub(1);
        }
        debug!(session_id, participant_id, "relay subscription released");
    }
}

enum Poll {
    Ready(SignalEntry),
    Pending,
    Finished,
}

/// Живая лента чужих записей. Запись считается прочитанной, как только её
/// вернул `next`; при drop подписки непрочитанное не теряется
pub struct Subscription {
    relay: SignalRelay,
    session_id: String,
    participant_id: String,
    changes: watch::Receiver<usize>,
}

impl Subscription {
    pub async fn next(&mut self) -> Option<SignalEntry> {
        loop {
            let _ = self.changes.borrow_and_update();
            match self.relay.take_next(&self.session_id, &self.participant_id) {
                Poll::Ready(entry) => return Some(entry),
                Poll::Finished => return None,
                Poll::Pending => {
                    if self.changes.changed().await.is_err() {
                        return None;
                    }
                }
            }
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn participant_id(&self) -> &str {
        &self.participant_id
    }

    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.relay.release(&self.session_id, &self.participant_id);
    }
}
