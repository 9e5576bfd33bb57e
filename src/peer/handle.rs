use crate::error::PeerError;
use crate::messaging::Delivery;
use crate::peer::controller::{ControllerParams, PeerConnectionController};
use crate::peer::events::{Command, ControllerEvent, Reply, SessionEvent};
use crate::peer::state::PeerState;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Результат запуска: захват завершён (или провален)
pub struct Startup(oneshot::Receiver<Result<(), PeerError>>);

impl Startup {
    pub async fn wait(self) -> Result<(), PeerError> {
        self.0.await.unwrap_or(Err(PeerError::ControllerGone))
    }
}

/// Ручка к задаче контроллера; клонируется свободно
#[derive(Clone)]
pub struct ControllerHandle {
    session_id: String,
    participant_id: String,
    connection_id: String,
    queue: mpsc::Sender<ControllerEvent>,
    state: watch::Receiver<PeerState>,
    leaving: Arc<watch::Sender<bool>>,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

/// Запускает контроллер участника в отдельной задаче
pub fn spawn(
    params: ControllerParams,
) -> (ControllerHandle, mpsc::UnboundedReceiver<SessionEvent>, Startup) {
    let (queue_tx, queue_rx) = mpsc::channel(params.config.event_queue_capacity.max(1));
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (state_tx, state_rx) = watch::channel(PeerState::Idle);
    let (leaving_tx, leaving_rx) = watch::channel(false);
    let (ready_tx, ready_rx) = oneshot::channel();

    let session_id = params.session_id.clone();
    let participant_id = params.local_id.clone();
    let controller =
        PeerConnectionController::new(params, queue_tx.clone(), events_tx, state_tx, leaving_rx);
    let connection_id = controller.connection_id().to_string();
    let task = tokio::spawn(controller.run(queue_rx, ready_tx));

    let handle = ControllerHandle {
        session_id,
        participant_id,
        connection_id,
        queue: queue_tx,
        state: state_rx,
        leaving: Arc::new(leaving_tx),
        task: Arc::new(Mutex::new(Some(task))),
    };
    (handle, events_rx, Startup(ready_rx))
}

impl ControllerHandle {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn participant_id(&self) -> &str {
        &self.participant_id
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub fn state(&self) -> PeerState {
        *self.state.borrow()
    }

    /// Ждёт состояния, удовлетворяющего условию; после остановки возвращает последнее
    pub async fn wait_for_state(&self, accept: impl Fn(PeerState) -> bool) -> PeerState {
        let mut state = self.state.clone();
        if let Ok(current) = state.wait_for(|current| accept(*current)).await {
            return *current;
        }
        let last = *state.borrow();
        last
    }

    pub async fn closed(&self) -> PeerState {
        self.wait_for_state(PeerState::is_terminal).await
    }

    fn before_capture(&self) -> bool {
        matches!(self.state(), PeerState::Idle | PeerState::Capturing)
    }

    async fn request<T>(&self, command: impl FnOnce(Reply<T>) -> Command) -> Result<T, PeerError> {
        let (tx, rx) = oneshot::channel();
        self.queue
            .send(ControllerEvent::Command(command(tx)))
            .await
            .map_err(|_| PeerError::ControllerGone)?;
        rx.await.map_err(|_| PeerError::ControllerGone)?
    }

    /// До захвата ничего не делает и возвращает false
    pub async fn toggle_audio(&self) -> Result<bool, PeerError> {
        if self.before_capture() {
            return Ok(false);
        }
        self.request(Command::ToggleAudio).await
    }

    pub async fn toggle_video(&self) -> Result<bool, PeerError> {
        if self.before_capture() {
            return Ok(false);
        }
        self.request(Command::ToggleVideo).await
    }

    /// true, если после вызова идёт демонстрация экрана
    pub async fn toggle_screen_share(&self) -> Result<bool, PeerError> {
        self.request(Command::ToggleScreenShare).await
    }

    pub async fn send_chat_message(&self, text: impl Into<String>) -> Result<Delivery, PeerError> {
        let text = text.into();
        self.request(|reply| Command::SendChat(text, reply)).await
    }

    pub async fn send_prescription(&self, payload: Value) -> Result<Delivery, PeerError> {
        self.request(|reply| Command::SendPrescription(payload, reply)).await
    }

    /// Можно вызывать из любого состояния и сколько угодно раз.
    /// Возвращается, когда задача контроллера завершена и ресурсы отпущены
    pub async fn leave(&self) {
        self.leaving.send_replace(true);
        if let Err(err) = self.request(Command::Leave).await {
            debug!(%err, participant = %self.participant_id, "controller already stopped");
        }
        let mut task = self.task.lock().await;
        if let Some(task) = task.take() {
            if let Err(err) = task.await {
                warn!(%err, participant = %self.participant_id, "controller task ended abnormally");
            }
        }
    }
}
