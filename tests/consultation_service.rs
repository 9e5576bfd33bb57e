use std::sync::Arc;
use std::time::Duration;
use teleconsult::config::CoreConfig;
use teleconsult::error::{CallError, PeerError, SessionError};
use teleconsult::messaging::Delivery;
use teleconsult::peer::{MediaKind, PeerState, SessionEvent};
use teleconsult::session::{SessionLifecycleManager, SessionStatus};
use teleconsult::signaling::SignalRelay;
use teleconsult::sim::{ManualClock, SimMediaDevices, SimNetwork};
use teleconsult::store::{InMemoryAppointments, InMemorySessionStore, RecordingNotifier};
use teleconsult::{ConsultationService, JoinedCall};
use tokio::time::timeout;

const DOCTOR: &str = "dr-house";
const PATIENT: &str = "pt-wilson";
const PATIENCE: Duration = Duration::from_secs(120);

struct Fixture {
    service: ConsultationService,
    devices: Arc<SimMediaDevices>,
    net: SimNetwork,
    relay: SignalRelay,
    clock: Arc<ManualClock>,
}

fn fixture() -> Fixture {
    let appointments = Arc::new(InMemoryAppointments::new());
    appointments.insert("appt-7", PATIENT, DOCTOR);
    let relay = SignalRelay::new();
    let clock = Arc::new(ManualClock::default());
    let manager = SessionLifecycleManager::new(
        Arc::new(InMemorySessionStore::new()),
        appointments,
        relay.clone(),
        Arc::new(RecordingNotifier::new()),
    )
    .with_clock(clock.clone());

    let devices = Arc::new(SimMediaDevices::new());
    let net = SimNetwork::new();
    let service = ConsultationService::new(
        Arc::new(manager),
        CoreConfig::default(),
        devices.clone(),
        net.factory(),
    );
    Fixture {
        service,
        devices,
        net,
        relay,
        clock,
    }
}

async fn connected(call: &JoinedCall) {
    let state = timeout(
        PATIENCE,
        call.handle
            .wait_for_state(|state| state == PeerState::Connected || state.is_terminal()),
    )
    .await
    .expect("connected in time");
    assert_eq!(state, PeerState::Connected);
}

#[tokio::test(start_paused = true)]
async fn consultation_from_join_to_end() {
    let fx = fixture();
    let session_id = fx.service.create_for_appointment("appt-7").await.unwrap();

    let doctor = fx.service.join(&session_id, DOCTOR).await.unwrap();
    let mut patient = fx.service.join(&session_id, PATIENT).await.unwrap();
    connected(&doctor).await;
    connected(&patient).await;
    assert_eq!(fx.service.live_calls(), 2);

    let session = fx.service.manager().get(&session_id).await.unwrap();
    assert_eq!(session.status, SessionStatus::Active);

    assert_eq!(
        doctor.handle.send_chat_message("please take a deep breath").await,
        Ok(Delivery::Direct)
    );
    let mut got_chat = false;
    while let Ok(Some(event)) = timeout(PATIENCE, patient.events.recv()).await {
        if let SessionEvent::Chat(message) = event {
            assert_eq!(message.text, "please take a deep breath");
            got_chat = true;
            break;
        }
    }
    assert!(got_chat);

    fx.clock.advance(chrono::Duration::seconds(125));
    let ended = fx
        .service
        .end_session(&session_id, Some("follow up in two weeks".into()))
        .await
        .unwrap();
    assert_eq!(ended.status, SessionStatus::Ended);
    assert_eq!(ended.duration_minutes, Some(2));

    assert_eq!(doctor.handle.state(), PeerState::Closed);
    assert_eq!(patient.handle.state(), PeerState::Closed);
    assert_eq!(fx.service.live_calls(), 0);
    assert_eq!(fx.devices.outstanding(), 0);
    assert_eq!(fx.relay.subscriber_count(&session_id), 0);
    assert_eq!(fx.net.open_transports(), 0);
    assert!(!fx.service.manager().is_connected(&session_id, DOCTOR).await);

    let late = fx.service.join(&session_id, DOCTOR).await;
    assert!(matches!(
        late,
        Err(CallError::Session(SessionError::InvalidTransition { .. }))
    ));
}

#[tokio::test(start_paused = true)]
async fn denied_microphone_fails_join_immediately() {
    let fx = fixture();
    let session_id = fx.service.create_for_appointment("appt-7").await.unwrap();
    fx.devices.deny(MediaKind::Audio);

    let result = fx.service.join(&session_id, PATIENT).await;
    assert!(matches!(
        result,
        Err(CallError::Peer(PeerError::PermissionDenied(MediaKind::Audio)))
    ));
    assert_eq!(fx.devices.outstanding(), 0);
    assert_eq!(fx.service.live_calls(), 0);
    assert!(!fx.service.manager().is_connected(&session_id, PATIENT).await);

    fx.devices.allow(MediaKind::Audio);
    let patient = fx.service.join(&session_id, PATIENT).await.unwrap();
    assert_eq!(patient.handle.state(), PeerState::Answering);
    patient.handle.leave().await.unwrap();
    assert_eq!(fx.devices.outstanding(), 0);
}

#[tokio::test(start_paused = true)]
async fn denied_camera_fails_join_without_holding_the_microphone() {
    let fx = fixture();
    let session_id = fx.service.create_for_appointment("appt-7").await.unwrap();
    fx.devices.deny(MediaKind::Video);

    let result = fx.service.join(&session_id, DOCTOR).await;
    assert!(matches!(
        result,
        Err(CallError::Peer(PeerError::PermissionDenied(MediaKind::Video)))
    ));
    assert_eq!(fx.devices.outstanding(), 0);
    assert_eq!(fx.service.live_calls(), 0);
    assert!(!fx.service.manager().is_connected(&session_id, DOCTOR).await);
}

#[tokio::test(start_paused = true)]
async fn second_join_while_live_is_rejected() {
    let fx = fixture();
    let session_id = fx.service.create_for_appointment("appt-7").await.unwrap();
    let doctor = fx.service.join(&session_id, DOCTOR).await.unwrap();

    let again = fx.service.join(&session_id, DOCTOR).await;
    assert!(matches!(
        again,
        Err(CallError::Session(SessionError::AlreadyJoined(_)))
    ));
    assert_eq!(fx.devices.outstanding(), 2, "no second capture");

    doctor.handle.leave().await.unwrap();
    let rejoined = fx.service.join(&session_id, DOCTOR).await.unwrap();
    assert_eq!(rejoined.handle.state(), PeerState::Offering);
    rejoined.handle.leave().await.unwrap();
    assert_eq!(fx.devices.outstanding(), 0);
}

#[tokio::test(start_paused = true)]
async fn outsiders_cannot_join() {
    let fx = fixture();
    let session_id = fx.service.create_for_appointment("appt-7").await.unwrap();
    let result = fx.service.join(&session_id, "dr-cuddy").await;
    assert!(matches!(
        result,
        Err(CallError::Session(SessionError::NotParticipant { .. }))
    ));
    assert_eq!(fx.devices.outstanding(), 0);
}

#[tokio::test(start_paused = true)]
async fn failed_call_can_be_joined_again() {
    let fx = fixture();
    let session_id = fx.service.create_for_appointment("appt-7").await.unwrap();
    let doctor = fx.service.join(&session_id, DOCTOR).await.unwrap();

    // собеседник не пришёл: повтор и провал по тайм-ауту
    let end = timeout(PATIENCE, doctor.handle.wait_for_state(PeerState::is_terminal))
        .await
        .unwrap();
    assert!(matches!(end, PeerState::Failed(_)));
    assert_eq!(fx.devices.outstanding(), 0);

    let again = fx.service.join(&session_id, DOCTOR).await.unwrap();
    assert_eq!(again.handle.state(), PeerState::Offering);
    again.handle.leave().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn cancel_tears_down_live_calls() {
    let fx = fixture();
    let session_id = fx
        .service
        .create_session("appt-9", PATIENT, DOCTOR)
        .await
        .unwrap();
    let doctor = fx.service.join(&session_id, DOCTOR).await.unwrap();

    let cancelled = fx
        .service
        .cancel_session(&session_id, "patient no-show")
        .await
        .unwrap();
    assert_eq!(cancelled.status, SessionStatus::Cancelled);
    assert_eq!(cancelled.notes.as_deref(), Some("patient no-show"));
    assert_eq!(doctor.handle.state(), PeerState::Closed);
    assert_eq!(fx.devices.outstanding(), 0);
    assert!(fx.relay.is_closed(&session_id));

    let ended = fx.service.end_session(&session_id, None).await;
    assert!(matches!(
        ended,
        Err(CallError::Session(SessionError::InvalidTransition { .. }))
    ));
}
