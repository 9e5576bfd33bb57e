use crate::error::SessionError;
use crate::signaling::SignalRelay;
use crate::store::{AppointmentDirectory, Clock, Notifier, NotificationEvent, SessionStore, SystemClock};
use crate::utils::random_id;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Scheduled,
    Active,
    Ended,
    Cancelled,
}

impl SessionStatus {
    /// Порядок статусов: переходы только вперёд
    pub fn rank(self) -> u8 {
        match self {
            SessionStatus::Scheduled => 0,
            SessionStatus::Active => 1,
            SessionStatus::Ended | SessionStatus::Cancelled => 2,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, SessionStatus::Ended | SessionStatus::Cancelled)
    }

    pub fn can_transition_to(self, next: SessionStatus) -> bool {
        matches!(
            (self, next),
            (SessionStatus::Scheduled, SessionStatus::Active)
                | (SessionStatus::Scheduled, SessionStatus::Cancelled)
                | (SessionStatus::Active, SessionStatus::Ended)
                | (SessionStatus::Active, SessionStatus::Cancelled)
        )
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SessionStatus::Scheduled => "scheduled",
            SessionStatus::Active => "active",
            SessionStatus::Ended => "ended",
            SessionStatus::Cancelled => "cancelled",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsultationSession {
    pub id: String,
    pub appointment_id: String,
    pub patient_id: String,
    pub doctor_id: String,
    pub status: SessionStatus,
    pub room_id: String,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_minutes: Option<i64>,
    pub notes: Option<String>,
    pub recording_url: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl ConsultationSession {
    pub fn is_participant(&self, participant_id: &str) -> bool {
        self.patient_id == participant_id || self.doctor_id == participant_id
    }

    /// Второй участник сессии
    pub fn peer_of(&self, participant_id: &str) -> Option<&str> {
        if self.patient_id == participant_id {
            Some(&self.doctor_id)
        } else if self.doctor_id == participant_id {
            Some(&self.patient_id)
        } else {
            None
        }
    }

    fn participants(&self) -> [&str; 2] {
        [self.patient_id.as_str(), self.doctor_id.as_str()]
    }
}

/// Длительность в минутах с округлением до ближайшей
pub fn duration_minutes(start: DateTime<Utc>, end: DateTime<Utc>) -> i64 {
    let seconds = (end - start).num_milliseconds().max(0) as f64 / 1000.0;
    (seconds / 60.0).round() as i64
}

/// Владелец статуса и таймингов сессии
pub struct SessionLifecycleManager {
    store: Arc<dyn SessionStore>,
    appointments: Arc<dyn AppointmentDirectory>,
    relay: SignalRelay,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
    // Кто сейчас подключен: session_id -> participant ids
    connected: Mutex<HashMap<String, HashSet<String>>>,
}

impl SessionLifecycleManager {
    pub fn new(
        store: Arc<dyn SessionStore>,
        appointments: Arc<dyn AppointmentDirectory>,
        relay: SignalRelay,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            store,
            appointments,
            relay,
            notifier,
            clock: Arc::new(SystemClock),
            connected: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn relay(&self) -> &SignalRelay {
        &self.relay
    }

    pub async fn create(
        &self,
        appointment_id: &str,
        patient_id: &str,
        doctor_id: &str,
    ) -> Result<String, SessionError> {
        let session = ConsultationSession {
            id: Uuid::new_v4().to_string(),
            appointment_id: appointment_id.to_string(),
            patient_id: patient_id.to_string(),
            doctor_id: doctor_id.to_string(),
            status: SessionStatus::Scheduled,
            room_id: random_id(),
            start_time: None,
            end_time: None,
            duration_minutes: None,
            notes: None,
            recording_url: None,
            created_at: self.clock.now(),
        };
        let session_id = session.id.clone();
        self.store.insert(session).await?;
        self.relay.open(&session_id);
        info!(%session_id, appointment_id, "consultation session created");
        Ok(session_id)
    }

    pub async fn create_for_appointment(&self, appointment_id: &str) -> Result<String, SessionError> {
        let participants = self
            .appointments
            .participants(appointment_id)
            .await
            .ok_or_else(|| SessionError::AppointmentNotFound(appointment_id.to_string()))?;
        self.create(
            appointment_id,
            &participants.patient_id,
            &participants.doctor_id,
        )
        .await
    }

    pub async fn get(&self, session_id: &str) -> Result<ConsultationSession, SessionError> {
        self.store
            .get(session_id)
            .await?
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))
    }

    pub async fn join(
        &self,
        session_id: &str,
        participant_id: &str,
    ) -> Result<ConsultationSession, SessionError> {
        let mut connected = self.connected.lock().await;
        let mut session = self.get(session_id).await?;

        if !session.is_participant(participant_id) {
            return Err(SessionError::NotParticipant {
                session: session_id.to_string(),
                participant: participant_id.to_string(),
            });
        }
        if session.status.is_terminal() {
            return Err(SessionError::InvalidTransition {
                from: session.status,
                to: SessionStatus::Active,
            });
        }
        let present = connected.entry(session_id.to_string()).or_default();
        if present.contains(participant_id) {
            warn!(session_id, participant_id, "duplicate join rejected");
            return Err(SessionError::AlreadyJoined(participant_id.to_string()));
        }

        if session.status == SessionStatus::Scheduled {
            session.status = SessionStatus::Active;
            session.start_time = Some(self.clock.now());
            self.store.update(session.clone()).await?;
            info!(session_id, participant_id, "session active");
            for participant in session.participants() {
                self.notifier.notify(
                    participant,
                    NotificationEvent::SessionStarted {
                        session_id: session_id.to_string(),
                    },
                );
            }
        }

        present.insert(participant_id.to_string());
        if let Some(peer) = session.peer_of(participant_id) {
            self.notifier.notify(
                peer,
                NotificationEvent::ParticipantJoined {
                    session_id: session_id.to_string(),
                    participant_id: participant_id.to_string(),
                },
            );
        }
        debug!(session_id, participant_id, "participant joined");
        Ok(session)
    }

    /// Снимает отметку о подключении; статус сессии не меняется
    pub async fn leave(&self, session_id: &str, participant_id: &str) -> Result<(), SessionError> {
        let mut connected = self.connected.lock().await;
        let session = self.get(session_id).await?;
        let removed = connected
            .get_mut(session_id)
            .map(|present| present.remove(participant_id))
            .unwrap_or(false);
        if removed {
            if let Some(peer) = session.peer_of(participant_id) {
                self.notifier.notify(
                    peer,
                    NotificationEvent::ParticipantLeft {
                        session_id: session_id.to_string(),
                        participant_id: participant_id.to_string(),
                    },
                );
            }
            debug!(session_id, participant_id, "participant left");
        }
        Ok(())
    }

    pub async fn is_connected(&self, session_id: &str, participant_id: &str) -> bool {
        self.connected
            .lock()
            .await
            .get(session_id)
            .map(|present| present.contains(participant_id))
            .unwrap_or(false)
    }

    pub async fn end(
        &self,
        session_id: &str,
        notes: Option<String>,
    ) -> Result<ConsultationSession, SessionError> {
        let mut connected = self.connected.lock().await;
        let mut session = self.get(session_id).await?;
        Self::check_transition(&session, SessionStatus::Ended)?;

        let end_time = self.clock.now();
        let start_time = session.start_time.unwrap_or(end_time);
        session.status = SessionStatus::Ended;
        session.end_time = Some(end_time);
        session.duration_minutes = Some(duration_minutes(start_time, end_time));
        if notes.is_some() {
            session.notes = notes;
        }
        self.store.update(session.clone()).await?;
        connected.remove(session_id);
        self.relay.close(session_id);

        let minutes = session.duration_minutes.unwrap_or_default();
        info!(session_id, duration_minutes = minutes, "session ended");
        for participant in session.participants() {
            self.notifier.notify(
                participant,
                NotificationEvent::SessionEnded {
                    session_id: session_id.to_string(),
                    duration_minutes: minutes,
                },
            );
        }
        Ok(session)
    }

    pub async fn cancel(
        &self,
        session_id: &str,
        reason: &str,
    ) -> Result<ConsultationSession, SessionError> {
        let mut connected = self.connected.lock().await;
        let mut session = self.get(session_id).await?;
        Self::check_transition(&session, SessionStatus::Cancelled)?;

        session.status = SessionStatus::Cancelled;
        if session.start_time.is_some() {
            session.end_time = Some(self.clock.now());
        }
        session.notes = Some(reason.to_string());
        self.store.update(session.clone()).await?;
        connected.remove(session_id);
        self.relay.close(session_id);

        info!(session_id, reason, "session cancelled");
        for participant in session.participants() {
            self.notifier.notify(
                participant,
                NotificationEvent::SessionCancelled {
                    session_id: session_id.to_string(),
                    reason: reason.to_string(),
                },
            );
        }
        Ok(session)
    }

    /// Текущая длительность: тикает с момента active, не зависит от состояния соединения
    pub async fn elapsed(&self, session_id: &str) -> Result<Option<ChronoDuration>, SessionError> {
        let session = self.get(session_id).await?;
        Ok(match (session.start_time, session.end_time) {
            (Some(start), Some(end)) => Some(end - start),
            (Some(start), None) if session.status == SessionStatus::Active => {
                Some(self.clock.now() - start)
            }
            _ => None,
        })
    }

    fn check_transition(
        session: &ConsultationSession,
        next: SessionStatus,
    ) -> Result<(), SessionError> {
        if session.status.can_transition_to(next) {
            Ok(())
        } else {
            Err(SessionError::InvalidTransition {
                from: session.status,
                to: next,
            })
        }
    }
}
