use crate::error::MediaError;
use crate::peer::types::{MediaKind, TrackInfo};
use async_trait::async_trait;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Доступ к устройствам захвата. Единственная точка, где ядро ждёт разрешения пользователя/ОС
#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn acquire(&self, kind: MediaKind) -> Result<LocalTrack, MediaError>;
}

/// Аренда устройства: освобождается ровно один раз, в том числе на путях ошибок
pub struct DeviceLease {
    on_release: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl DeviceLease {
    pub fn new(on_release: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            on_release: Some(Box::new(on_release)),
        }
    }
}

impl Drop for DeviceLease {
    fn drop(&mut self) {
        if let Some(release) = self.on_release.take() {
            release();
        }
    }
}

/// Локальный трек; принадлежит только контроллеру своего участника
pub struct LocalTrack {
    info: TrackInfo,
    enabled: Arc<AtomicBool>,
    _lease: DeviceLease,
}

impl LocalTrack {
    pub fn new(info: TrackInfo, lease: DeviceLease) -> Self {
        Self {
            info,
            enabled: Arc::new(AtomicBool::new(true)),
            _lease: lease,
        }
    }

    pub fn info(&self) -> &TrackInfo {
        &self.info
    }

    pub fn kind(&self) -> MediaKind {
        self.info.kind
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Переключает флаг и возвращает новое значение
    pub fn toggle(&self) -> bool {
        !self.enabled.fetch_xor(true, Ordering::SeqCst)
    }
}

impl fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalTrack")
            .field("info", &self.info)
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

/// Набор захваченных треков участника
#[derive(Debug, Default)]
pub struct LocalMedia {
    pub audio: Option<LocalTrack>,
    pub camera: Option<LocalTrack>,
    pub screen: Option<LocalTrack>,
}

impl LocalMedia {
    /// Трек, который сейчас уходит в видео-слот
    pub fn outgoing_video(&self) -> Option<&LocalTrack> {
        self.screen.as_ref().or(self.camera.as_ref())
    }

    pub fn outgoing(&self) -> Vec<TrackInfo> {
        self.audio
            .iter()
            .chain(self.outgoing_video())
            .map(|track| track.info().clone())
            .collect()
    }

    pub fn held(&self) -> usize {
        [&self.audio, &self.camera, &self.screen]
            .iter()
            .filter(|slot| slot.is_some())
            .count()
    }

    /// Отпускает все устройства
    pub fn release(&mut self) -> usize {
        let held = self.held();
        self.audio = None;
        self.camera = None;
        self.screen = None;
        held
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn track(kind: MediaKind, counter: &Arc<AtomicUsize>) -> LocalTrack {
        counter.fetch_add(1, Ordering::SeqCst);
        let counter = counter.clone();
        LocalTrack::new(
            TrackInfo {
                id: format!("{kind}-1"),
                kind,
                label: kind.to_string(),
            },
            DeviceLease::new(move || {
                counter.fetch_sub(1, Ordering::SeqCst);
            }),
        )
    }

    #[test]
    fn release_drops_every_lease() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut media = LocalMedia {
            audio: Some(track(MediaKind::Audio, &counter)),
            camera: Some(track(MediaKind::Video, &counter)),
            screen: Some(track(MediaKind::Screen, &counter)),
        };
        assert_eq!(counter.load(Ordering::SeqCst), 3);
        assert_eq!(media.outgoing_video().map(|t| t.kind()), Some(MediaKind::Screen));
        assert_eq!(media.release(), 3);
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert_eq!(media.release(), 0);
    }

    #[test]
    fn toggle_flips_enabled_flag() {
        let counter = Arc::new(AtomicUsize::new(0));
        let audio = track(MediaKind::Audio, &counter);
        assert!(audio.is_enabled());
        assert!(!audio.toggle());
        assert!(!audio.is_enabled());
        assert!(audio.toggle());
    }
}
