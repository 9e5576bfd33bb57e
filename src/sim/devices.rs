use crate::error::MediaError;
use crate::peer::media::{DeviceLease, LocalTrack, MediaDevices};
use crate::peer::types::{MediaKind, TrackInfo};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

/// Устройства захвата без железа: считают выданные треки и умеют
/// отказывать или «думать» над разрешением
pub struct SimMediaDevices {
    outstanding: Arc<AtomicUsize>,
    next_track: AtomicU64,
    denied: Mutex<HashSet<MediaKind>>,
    gate: watch::Sender<bool>,
}

impl Default for SimMediaDevices {
    fn default() -> Self {
        Self::new()
    }
}

impl SimMediaDevices {
    pub fn new() -> Self {
        let (gate, _) = watch::channel(true);
        Self {
            outstanding: Arc::new(AtomicUsize::new(0)),
            next_track: AtomicU64::new(1),
            denied: Mutex::new(HashSet::new()),
            gate,
        }
    }

    /// Треки, которые выданы и ещё не отпущены
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }

    pub fn deny(&self, kind: MediaKind) {
        self.denied.lock().insert(kind);
    }

    pub fn allow(&self, kind: MediaKind) {
        self.denied.lock().remove(&kind);
    }

    /// Запросы разрешения повисают до `grant`
    pub fn hold_permission(&self) {
        self.gate.send_replace(false);
    }

    pub fn grant(&self) {
        self.gate.send_replace(true);
    }
}

#[async_trait]
impl MediaDevices for SimMediaDevices {
    async fn acquire(&self, kind: MediaKind) -> Result<LocalTrack, MediaError> {
        let mut gate = self.gate.subscribe();
        if gate.wait_for(|open| *open).await.is_err() {
            return Err(MediaError::Unavailable("device prompt dismissed".into()));
        }
        if self.denied.lock().contains(&kind) {
            debug!(%kind, "sim: capture denied");
            return Err(MediaError::PermissionDenied(kind));
        }

        let n = self.next_track.fetch_add(1, Ordering::SeqCst);
        self.outstanding.fetch_add(1, Ordering::SeqCst);
        let outstanding = self.outstanding.clone();
        let info = TrackInfo {
            id: format!("{kind}-{n}"),
            kind,
            label: format!("sim {kind}"),
        };
        Ok(LocalTrack::new(
            info,
            DeviceLease::new(move || {
                outstanding.fetch_sub(1, Ordering::SeqCst);
            }),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn dropped_tracks_are_returned() {
        let devices = SimMediaDevices::new();
        let audio = devices.acquire(MediaKind::Audio).await.expect("audio");
        let video = devices.acquire(MediaKind::Video).await.expect("video");
        assert_ne!(audio.info().id, video.info().id);
        assert_eq!(devices.outstanding(), 2);
        drop(audio);
        drop(video);
        assert_eq!(devices.outstanding(), 0);
    }

    #[tokio::test]
    async fn denied_kind_fails_without_leaking() {
        let devices = SimMediaDevices::new();
        devices.deny(MediaKind::Screen);
        let err = devices.acquire(MediaKind::Screen).await.expect_err("denied");
        assert_eq!(err, MediaError::PermissionDenied(MediaKind::Screen));
        assert_eq!(devices.outstanding(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn held_prompt_waits_for_grant() {
        let devices = Arc::new(SimMediaDevices::new());
        devices.hold_permission();
        let pending = tokio::spawn({
            let devices = devices.clone();
            async move { devices.acquire(MediaKind::Audio).await }
        });
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(!pending.is_finished());
        devices.grant();
        let track = pending.await.expect("join").expect("granted");
        assert_eq!(track.kind(), MediaKind::Audio);
    }
}
