use proptest::prelude::*;
use std::sync::Arc;
use teleconsult::session::{SessionLifecycleManager, SessionStatus};
use teleconsult::signaling::SignalRelay;
use teleconsult::sim::ManualClock;
use teleconsult::store::{InMemoryAppointments, InMemorySessionStore, LogNotifier};

#[derive(Debug, Clone)]
enum Op {
    Join(&'static str),
    Leave(&'static str),
    End,
    Cancel,
    Tick(i64),
}

fn op() -> impl Strategy<Value = Op> {
    let who = prop_oneof![Just("pt-wilson"), Just("dr-house"), Just("dr-cuddy")];
    prop_oneof![
        4 => who.clone().prop_map(Op::Join),
        2 => who.prop_map(Op::Leave),
        1 => Just(Op::End),
        1 => Just(Op::Cancel),
        2 => (1i64..600).prop_map(Op::Tick),
    ]
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("runtime")
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    #[test]
    fn prop_status_never_moves_backwards(ops in prop::collection::vec(op(), 1..40)) {
        let clock = Arc::new(ManualClock::default());
        let manager = SessionLifecycleManager::new(
            Arc::new(InMemorySessionStore::new()),
            Arc::new(InMemoryAppointments::new()),
            SignalRelay::new(),
            Arc::new(LogNotifier),
        )
        .with_clock(clock.clone());

        runtime().block_on(async {
            let id = manager.create("appt-1", "pt-wilson", "dr-house").await.unwrap();
            let mut status = SessionStatus::Scheduled;
            let mut started = None;

            for op in ops {
                let _ = match op {
                    Op::Join(who) => manager.join(&id, who).await.map(|_| ()),
                    Op::Leave(who) => manager.leave(&id, who).await,
                    Op::End => manager.end(&id, None).await.map(|_| ()),
                    Op::Cancel => manager.cancel(&id, "no-show").await.map(|_| ()),
                    Op::Tick(secs) => {
                        clock.advance(chrono::Duration::seconds(secs));
                        Ok(())
                    }
                };

                let session = manager.get(&id).await.unwrap();
                prop_assert!(
                    session.status.rank() >= status.rank(),
                    "{} -> {}", status, session.status
                );
                if status.is_terminal() {
                    prop_assert_eq!(session.status, status);
                }
                if status != session.status {
                    prop_assert!(status.can_transition_to(session.status));
                }
                if started.is_some() {
                    prop_assert_eq!(session.start_time, started);
                }
                started = session.start_time;
                status = session.status;

                if status == SessionStatus::Ended {
                    prop_assert!(session.duration_minutes.is_some());
                }
            }
            Ok(())
        })?;
    }
}
