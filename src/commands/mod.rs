mod call_api;

pub use call_api::CallHandle;

use crate::config::CoreConfig;
use crate::error::{CallError, SessionError};
use crate::peer::controller::ControllerParams;
use crate::peer::events::SessionEvent;
use crate::peer::handle::{self, ControllerHandle};
use crate::peer::media::MediaDevices;
use crate::peer::transport::TransportFactory;
use crate::session::{ConsultationSession, SessionLifecycleManager};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Звонок, в который только что вошли: ручка управления и поток событий для UI
pub struct JoinedCall {
    pub handle: CallHandle,
    pub events: mpsc::UnboundedReceiver<SessionEvent>,
}

type CallKey = (String, String);

/// Живые контроллеры этого процесса и отметки о подключении в менеджере сессий
pub(crate) struct CallRegistry {
    manager: Arc<SessionLifecycleManager>,
    calls: Mutex<HashMap<CallKey, ControllerHandle>>,
    // join/leave меняют реестр и менеджер вместе, под одним замком
    membership: tokio::sync::Mutex<()>,
}

impl CallRegistry {
    fn key(handle: &ControllerHandle) -> CallKey {
        (
            handle.session_id().to_string(),
            handle.participant_id().to_string(),
        )
    }

    fn remove_if_current(&self, handle: &ControllerHandle) -> bool {
        let mut calls = self.calls.lock();
        let key = Self::key(handle);
        let current = calls
            .get(&key)
            .is_some_and(|live| live.connection_id() == handle.connection_id());
        if current {
            calls.remove(&key);
        }
        current
    }

    /// Снимает участника после завершения его контроллера
    pub(crate) async fn forget(&self, handle: &ControllerHandle) -> Result<(), SessionError> {
        let _membership = self.membership.lock().await;
        if self.remove_if_current(handle) {
            self.manager
                .leave(handle.session_id(), handle.participant_id())
                .await?;
            debug!(
                session_id = handle.session_id(),
                participant = handle.participant_id(),
                "call forgotten"
            );
        }
        Ok(())
    }

    fn session_calls(&self, session_id: &str) -> Vec<ControllerHandle> {
        self.calls
            .lock()
            .values()
            .filter(|handle| handle.session_id() == session_id)
            .cloned()
            .collect()
    }
}

pub struct ConsultationService {
    registry: Arc<CallRegistry>,
    config: Arc<CoreConfig>,
    devices: Arc<dyn MediaDevices>,
    factory: Arc<dyn TransportFactory>,
}

impl ConsultationService {
    pub fn new(
        manager: Arc<SessionLifecycleManager>,
        config: CoreConfig,
        devices: Arc<dyn MediaDevices>,
        factory: Arc<dyn TransportFactory>,
    ) -> Self {
        Self {
            registry: Arc::new(CallRegistry {
                manager,
                calls: Mutex::new(HashMap::new()),
                membership: tokio::sync::Mutex::new(()),
            }),
            config: Arc::new(config),
            devices,
            factory,
        }
    }

    pub fn manager(&self) -> &Arc<SessionLifecycleManager> {
        &self.registry.manager
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub async fn create_session(
        &self,
        appointment_id: &str,
        patient_id: &str,
        doctor_id: &str,
    ) -> Result<String, CallError> {
        Ok(self
            .registry
            .manager
            .create(appointment_id, patient_id, doctor_id)
            .await?)
    }

    pub async fn create_for_appointment(&self, appointment_id: &str) -> Result<String, CallError> {
        Ok(self
            .registry
            .manager
            .create_for_appointment(appointment_id)
            .await?)
    }

    /// Входит в звонок. Возвращается после захвата камеры и микрофона;
    /// отказ в доступе приходит сразу ошибкой, участник при этом снимается
    pub async fn join(&self, session_id: &str, participant_id: &str) -> Result<JoinedCall, CallError> {
        let (controller, events, startup) = {
            let _membership = self.registry.membership.lock().await;
            self.reap(session_id, participant_id).await?;

            let session = self.registry.manager.join(session_id, participant_id).await?;
            let remote_id = remote_of(&session, participant_id)?;
            let params = ControllerParams {
                session_id: session_id.to_string(),
                local_id: participant_id.to_string(),
                remote_id,
                config: self.config.clone(),
                relay: self.registry.manager.relay().clone(),
                devices: self.devices.clone(),
                factory: self.factory.clone(),
            };
            let (controller, events, startup) = handle::spawn(params);
            self.registry
                .calls
                .lock()
                .insert(CallRegistry::key(&controller), controller.clone());
            (controller, events, startup)
        };
        self.watch(controller.clone());

        if let Err(err) = startup.wait().await {
            warn!(session_id, participant_id, %err, "call did not start");
            controller.leave().await;
            self.registry.forget(&controller).await?;
            return Err(err.into());
        }
        info!(
            session_id,
            participant_id,
            connection_id = controller.connection_id(),
            "joined call"
        );
        Ok(JoinedCall {
            handle: CallHandle::new(controller, self.registry.clone()),
            events,
        })
    }

    /// Контроллер, который уже остановился, но ещё числится в реестре
    async fn reap(&self, session_id: &str, participant_id: &str) -> Result<(), SessionError> {
        let key = (session_id.to_string(), participant_id.to_string());
        let stale = {
            let mut calls = self.registry.calls.lock();
            match calls.get(&key) {
                Some(handle) if handle.state().is_terminal() => calls.remove(&key),
                _ => None,
            }
        };
        if stale.is_some() {
            debug!(session_id, participant_id, "stale call reaped");
            self.registry.manager.leave(session_id, participant_id).await?;
        }
        Ok(())
    }

    fn watch(&self, controller: ControllerHandle) {
        let registry = self.registry.clone();
        tokio::spawn(async move {
            let state = controller.closed().await;
            debug!(
                participant = controller.participant_id(),
                %state,
                "controller finished"
            );
            if let Err(err) = registry.forget(&controller).await {
                warn!(%err, "could not mark participant as left");
            }
        });
    }

    /// Сначала гасит живые звонки сессии, затем фиксирует окончание
    pub async fn end_session(
        &self,
        session_id: &str,
        notes: Option<String>,
    ) -> Result<ConsultationSession, CallError> {
        self.leave_all(session_id).await?;
        Ok(self.registry.manager.end(session_id, notes).await?)
    }

    pub async fn cancel_session(
        &self,
        session_id: &str,
        reason: &str,
    ) -> Result<ConsultationSession, CallError> {
        self.leave_all(session_id).await?;
        Ok(self.registry.manager.cancel(session_id, reason).await?)
    }

    async fn leave_all(&self, session_id: &str) -> Result<(), SessionError> {
        let calls = self.registry.session_calls(session_id);
        if !calls.is_empty() {
            info!(session_id, live = calls.len(), "leaving live calls");
        }
        for controller in calls {
            controller.leave().await;
            self.registry.forget(&controller).await?;
        }
        Ok(())
    }

    pub fn live_calls(&self) -> usize {
        self.registry.calls.lock().len()
    }
}

fn remote_of(session: &ConsultationSession, participant_id: &str) -> Result<String, SessionError> {
    session
        .peer_of(participant_id)
        .map(str::to_owned)
        .ok_or_else(|| SessionError::NotParticipant {
            session: session.id.clone(),
            participant: participant_id.to_string(),
        })
}
