//! Collaborator interfaces for everything outside the core.
//!
//! The manifest source, log sink, notifier and media surface are external
//! collaborators; the core only ever talks to them through these traits. A
//! headless surface implementation is included for kiosk dry runs and
//! development on machines without a display stack.

use crate::media::{MediaDescriptor, RawRow, ViewLogRecord};
use crate::playback::PlayerEvent;
use anyhow::Result;
use async_trait::async_trait;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Remote manifest source: rows for a device scope, or failure.
#[async_trait]
pub trait ManifestSource: Send + Sync {
    async fn fetch(&self, scope: &str) -> Result<Vec<RawRow>>;
}

/// Remote log sink. Fire-and-forget; callers drop failures.
#[async_trait]
pub trait LogSink: Send + Sync {
    async fn post(&self, record: &ViewLogRecord) -> Result<()>;
}

/// Severity of a user-facing notice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeLevel {
    Info,
    Warn,
    Error,
}

/// Notification/toast collaborator. Never awaited by core logic.
pub trait Notifier: Send + Sync {
    fn notify(&self, level: NoticeLevel, title: &str, message: &str);
}

/// Notifier that forwards notices to the log. The production shell replaces
/// this with an on-screen toast presenter.
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, level: NoticeLevel, title: &str, message: &str) {
        match level {
            NoticeLevel::Info => tracing::info!("{}: {}", title, message),
            NoticeLevel::Warn => tracing::warn!("{}: {}", title, message),
            NoticeLevel::Error => tracing::error!("{}: {}", title, message),
        }
    }
}

/// Media-rendering collaborator.
///
/// The engine issues imperative commands; the surface reports back through
/// `PlayerEvent`s (ready, ended, error) on the engine's event channel.
#[async_trait]
pub trait MediaSurface: Send + Sync {
    /// Display an item full-screen. `looping` asks the renderer to restart
    /// the media itself instead of reporting end of stream.
    async fn show(&self, item: &MediaDescriptor, path: &Path, looping: bool);
    /// Pause or resume the current media (videos freeze while transitioning).
    async fn set_paused(&self, paused: bool);
    /// Toggle self-looping on the current media.
    async fn set_looping(&self, looping: bool);
    /// Drive the fade animation; 0.0 is fully faded out, 1.0 fully visible.
    async fn set_opacity(&self, opacity: f32);
    /// Blank the screen (no playable content).
    async fn clear(&self);
}

/// Display-less surface for dry runs.
///
/// Reports every item ready immediately and simulates video end-of-stream
/// after a fixed duration, so the whole playback loop can be exercised
/// without a renderer attached.
pub struct HeadlessSurface {
    events: mpsc::Sender<PlayerEvent>,
    simulated_video: Duration,
    looping: AtomicBool,
    pending_end: Mutex<Option<JoinHandle<()>>>,
}

impl HeadlessSurface {
    pub fn new(events: mpsc::Sender<PlayerEvent>, simulated_video: Duration) -> Arc<Self> {
        Arc::new(Self {
            events,
            simulated_video,
            looping: AtomicBool::new(false),
            pending_end: Mutex::new(None),
        })
    }

    fn cancel_pending_end(&self) {
        if let Some(handle) = self.pending_end.lock().expect("surface poisoned").take() {
            handle.abort();
        }
    }
}

#[async_trait]
impl MediaSurface for HeadlessSurface {
    async fn show(&self, item: &MediaDescriptor, path: &Path, looping: bool) {
        tracing::info!(
            "[surface] showing {} \"{}\" from {:?} (looping: {})",
            item.id,
            item.title,
            path,
            looping
        );
        self.cancel_pending_end();
        self.looping.store(looping, Ordering::SeqCst);

        let duration = item
            .is_video()
            .then(|| self.simulated_video.as_secs_f32());
        let _ = self.events.send(PlayerEvent::MediaReady { duration }).await;

        if item.is_video() && !looping {
            let events = self.events.clone();
            let wait = self.simulated_video;
            let handle = tokio::spawn(async move {
                tokio::time::sleep(wait).await;
                let _ = events.send(PlayerEvent::MediaEnded).await;
            });
            *self.pending_end.lock().expect("surface poisoned") = Some(handle);
        }
    }

    async fn set_paused(&self, paused: bool) {
        tracing::debug!("[surface] paused: {}", paused);
    }

    async fn set_looping(&self, looping: bool) {
        tracing::debug!("[surface] looping: {}", looping);
        self.looping.store(looping, Ordering::SeqCst);
        if looping {
            // A looping video never reports end of stream.
            self.cancel_pending_end();
        }
    }

    async fn set_opacity(&self, opacity: f32) {
        tracing::trace!("[surface] opacity: {:.2}", opacity);
    }

    async fn clear(&self) {
        tracing::info!("[surface] cleared");
        self.cancel_pending_end();
    }
}

impl Drop for HeadlessSurface {
    fn drop(&mut self) {
        self.cancel_pending_end();
    }
}
