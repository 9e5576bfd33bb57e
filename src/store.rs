use crate::error::SessionError;
use crate::session::ConsultationSession;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppointmentParticipants {
    pub patient_id: String,
    pub doctor_id: String,
}

#[async_trait]
pub trait AppointmentDirectory: Send + Sync {
    async fn participants(&self, appointment_id: &str) -> Option<AppointmentParticipants>;
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn insert(&self, session: ConsultationSession) -> Result<(), SessionError>;
    async fn get(&self, session_id: &str) -> Result<Option<ConsultationSession>, SessionError>;
    async fn update(&self, session: ConsultationSession) -> Result<(), SessionError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum NotificationEvent {
    SessionStarted { session_id: String },
    ParticipantJoined { session_id: String, participant_id: String },
    ParticipantLeft { session_id: String, participant_id: String },
    SessionEnded { session_id: String, duration_minutes: i64 },
    SessionCancelled { session_id: String, reason: String },
}

/// Журнал аудита, ответа не ждём
pub trait Notifier: Send + Sync {
    fn notify(&self, participant_id: &str, event: NotificationEvent);
}

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Debug, Default)]
pub struct InMemorySessionStore {
    sessions: RwLock<HashMap<String, ConsultationSession>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn insert(&self, session: ConsultationSession) -> Result<(), SessionError> {
        let mut guard = self.sessions.write();
        if guard.contains_key(&session.id) {
            return Err(SessionError::Store(format!(
                "session {} already exists",
                session.id
            )));
        }
        guard.insert(session.id.clone(), session);
        Ok(())
    }

    async fn get(&self, session_id: &str) -> Result<Option<ConsultationSession>, SessionError> {
        Ok(self.sessions.read().get(session_id).cloned())
    }

    async fn update(&self, session: ConsultationSession) -> Result<(), SessionError> {
        let mut guard = self.sessions.write();
        match guard.get_mut(&session.id) {
            Some(slot) => {
                *slot = session;
                Ok(())
            }
            None => Err(SessionError::NotFound(session.id)),
        }
    }
}

#[derive(Debug, Default)]
pub struct InMemoryAppointments {
    appointments: RwLock<HashMap<String, AppointmentParticipants>>,
}

impl InMemoryAppointments {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, appointment_id: &str, patient_id: &str, doctor_id: &str) {
        self.appointments.write().insert(
            appointment_id.to_string(),
            AppointmentParticipants {
                patient_id: patient_id.to_string(),
                doctor_id: doctor_id.to_string(),
            },
        );
    }
}

#[async_trait]
impl AppointmentDirectory for InMemoryAppointments {
    async fn participants(&self, appointment_id: &str) -> Option<AppointmentParticipants> {
        self.appointments.read().get(appointment_id).cloned()
    }
}

/// Пишет уведомления в лог
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, participant_id: &str, event: NotificationEvent) {
        info!(participant_id, ?event, "notification");
    }
}

/// Складывает уведомления в память, чтобы их можно было проверить
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    events: Mutex<Vec<(String, NotificationEvent)>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<(String, NotificationEvent)> {
        self.events.lock().clone()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, participant_id: &str, event: NotificationEvent) {
        self.events.lock().push((participant_id.to_string(), event));
    }
}
