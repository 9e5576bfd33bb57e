use super::CallRegistry;
use crate::error::CallError;
use crate::messaging::Delivery;
use crate::peer::handle::ControllerHandle;
use crate::peer::state::PeerState;
use serde_json::Value;
use std::sync::Arc;
use tracing::info;

/// Управление звонком со стороны UI
#[derive(Clone)]
pub struct CallHandle {
    controller: ControllerHandle,
    registry: Arc<CallRegistry>,
}

impl CallHandle {
    pub(crate) fn new(controller: ControllerHandle, registry: Arc<CallRegistry>) -> Self {
        Self {
            controller,
            registry,
        }
    }

    pub fn session_id(&self) -> &str {
        self.controller.session_id()
    }

    pub fn participant_id(&self) -> &str {
        self.controller.participant_id()
    }

    pub fn state(&self) -> PeerState {
        self.controller.state()
    }

    pub async fn wait_for_state(&self, accept: impl Fn(PeerState) -> bool) -> PeerState {
        self.controller.wait_for_state(accept).await
    }

    pub async fn send_chat_message(&self, text: impl Into<String>) -> Result<Delivery, CallError> {
        Ok(self.controller.send_chat_message(text).await?)
    }

    pub async fn send_prescription(&self, payload: Value) -> Result<Delivery, CallError> {
        Ok(self.controller.send_prescription(payload).await?)
    }

    pub async fn toggle_audio(&self) -> Result<bool, CallError> {
        Ok(self.controller.toggle_audio().await?)
    }

    pub async fn toggle_video(&self) -> Result<bool, CallError> {
        Ok(self.controller.toggle_video().await?)
    }

    /// true, если после вызова идёт демонстрация экрана
    pub async fn toggle_screen_share(&self) -> Result<bool, CallError> {
        Ok(self.controller.toggle_screen_share().await?)
    }

    /// Закрывает звонок и снимает отметку о подключении
    pub async fn leave(&self) -> Result<(), CallError> {
        self.controller.leave().await;
        self.registry.forget(&self.controller).await?;
        info!(
            session_id = self.session_id(),
            participant = self.participant_id(),
            "left call"
        );
        Ok(())
    }
}
