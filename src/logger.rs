use crate::peer::types::IceCandidate;
use std::sync::Once;
use tracing::{debug, warn};
use tracing_subscriber::fmt::time::ChronoLocal;
use tracing_subscriber::EnvFilter;

static INIT: Once = Once::new();

/// Включено ли логирование в этой сборке
pub fn enabled() -> bool {
    if !crate::config::LOGGING_ENABLED {
        return false;
    }
    #[cfg(debug_assertions)]
    {
        // В режиме разработки дополнительно проверяем dev::ENABLE_LOGGING
        if !crate::config::dev::ENABLE_LOGGING {
            return false;
        }
    }
    true
}

/// Логирование с временными метками; повторный вызов ничего не делает
pub fn init() {
    if !enabled() {
        return;
    }
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let installed = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_timer(ChronoLocal::new("%Y-%m-%d %H:%M:%S%.3f".to_string()))
            .with_target(false)
            .try_init();
        if installed.is_err() {
            debug!("tracing subscriber already installed");
        }
    });
}

/// Печать ICE-candidate при появлении (Trickle-ICE)
pub fn dump_candidate(label: &str, cand: &IceCandidate) {
    debug!(
        "Trickle {label}: candidate={} sdp_mid={:?} sdp_mline_index={:?} connection_id={} round={}",
        cand.candidate, cand.sdp_mid, cand.sdp_mline_index, cand.connection_id, cand.round
    );
}

pub fn analyze_candidates(candidates: &[IceCandidate]) {
    let mut host_count = 0;
    let mut srflx_count = 0;
    let mut relay_count = 0;

    for candidate in candidates {
        if candidate.candidate.contains("typ host") {
            host_count += 1;
        } else if candidate.candidate.contains("typ srflx") {
            srflx_count += 1;
        } else if candidate.candidate.contains("typ relay") {
            relay_count += 1;
        }
    }

    debug!(
        "Candidate analysis: {} host, {} srflx, {} relay",
        host_count, srflx_count, relay_count
    );

    if !candidates.is_empty() && relay_count == 0 {
        warn!("No TURN relay candidates found! Connection through NAT may fail.");
    }
}
