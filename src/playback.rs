//! Playback engine.
//!
//! A single event-driven state machine owns the playlist position. Images
//! advance on a display timer, videos on the surface's end-of-stream signal,
//! and every advancement runs through a two-phase fade transition. All state
//! transitions funnel through `handle_event`, so the transition table is
//! testable without any rendering stack behind it.

use crate::cache::MediaCache;
use crate::config::Settings;
use crate::media::{MediaDescriptor, PlaylistSnapshot, ViewLogRecord};
use crate::surface::{MediaSurface, NoticeLevel, Notifier};
use crate::viewlog::ViewLogger;
use chrono::Local;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::JoinHandle;

/// Discrete events feeding the state machine.
#[derive(Debug, Clone, PartialEq)]
pub enum PlayerEvent {
    /// A new playlist snapshot was published.
    SnapshotChanged,
    /// The surface finished preparing the current media.
    MediaReady { duration: Option<f32> },
    /// The surface reached end of stream.
    MediaEnded,
    /// The surface failed to decode or display the current media.
    MediaError { message: String },
    /// The image display window elapsed.
    DisplayElapsed { generation: u64 },
    /// One fade phase elapsed.
    TransitionElapsed { generation: u64 },
    /// Tear the engine down.
    Shutdown,
}

/// Phase of the playback state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackPhase {
    /// No resolvable content; screen is blank, no timers run.
    Idle,
    /// An item is on screen.
    Showing,
    /// Fading the current item out.
    TransitioningOut,
    /// Fading the next item in.
    TransitioningIn,
}

/// Observable engine state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaybackState {
    pub current_index: usize,
    pub phase: PlaybackPhase,
}

/// Pending timers, aborted as a unit on teardown so no stale callback can
/// mutate state after the engine is gone.
struct TimerRegistry {
    handles: Vec<JoinHandle<()>>,
}

impl TimerRegistry {
    fn new() -> Self {
        Self {
            handles: Vec::new(),
        }
    }

    fn arm(&mut self, tx: &mpsc::Sender<PlayerEvent>, delay: Duration, event: PlayerEvent) {
        self.handles.retain(|h| !h.is_finished());
        let tx = tx.clone();
        self.handles.push(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(event).await;
        }));
    }

    fn cancel_all(&mut self) {
        for handle in self.handles.drain(..) {
            handle.abort();
        }
    }
}

/// Drives timed advancement through the current snapshot.
pub struct PlaybackEngine {
    snapshot_rx: watch::Receiver<Arc<PlaylistSnapshot>>,
    cache: Arc<RwLock<MediaCache>>,
    surface: Arc<dyn MediaSurface>,
    notifier: Arc<dyn Notifier>,
    logger: ViewLogger,
    events_tx: mpsc::Sender<PlayerEvent>,
    device_id: String,
    image_duration: Duration,
    transition: Duration,
    video_loop_threshold: f32,

    snapshot: Arc<PlaylistSnapshot>,
    index: usize,
    phase: PlaybackPhase,
    /// Bumped whenever the shown item or phase lineage changes; timer events
    /// carrying an older generation are stale and ignored.
    generation: u64,
    /// Ready signal that arrived while still fading in; applied on Showing.
    pending_ready: Option<Option<f32>>,
    timers: TimerRegistry,
}

impl PlaybackEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        snapshot_rx: watch::Receiver<Arc<PlaylistSnapshot>>,
        cache: Arc<RwLock<MediaCache>>,
        surface: Arc<dyn MediaSurface>,
        notifier: Arc<dyn Notifier>,
        logger: ViewLogger,
        events_tx: mpsc::Sender<PlayerEvent>,
        device_id: String,
        settings: &Settings,
    ) -> Self {
        Self {
            snapshot_rx,
            cache,
            surface,
            notifier,
            logger,
            events_tx,
            device_id,
            image_duration: settings.image_duration(),
            transition: settings.transition_duration(),
            video_loop_threshold: settings.video_loop_threshold_secs,
            snapshot: Arc::new(PlaylistSnapshot::default()),
            index: 0,
            phase: PlaybackPhase::Idle,
            generation: 0,
            pending_ready: None,
            timers: TimerRegistry::new(),
        }
    }

    pub fn state(&self) -> PlaybackState {
        PlaybackState {
            current_index: self.index,
            phase: self.phase,
        }
    }

    /// Event loop: drains surface/timer events and snapshot publications
    /// until shutdown, then cancels every pending timer.
    pub async fn run(mut self, mut events: mpsc::Receiver<PlayerEvent>) {
        let mut watch_rx = self.snapshot_rx.clone();
        let tx = self.events_tx.clone();
        let forwarder = tokio::spawn(async move {
            while watch_rx.changed().await.is_ok() {
                if tx.send(PlayerEvent::SnapshotChanged).await.is_err() {
                    break;
                }
            }
        });

        // The watch channel may already hold a snapshot.
        self.handle_event(PlayerEvent::SnapshotChanged).await;

        while let Some(event) = events.recv().await {
            if event == PlayerEvent::Shutdown {
                break;
            }
            self.handle_event(event).await;
        }

        forwarder.abort();
        self.teardown().await;
    }

    /// Single entry point for every state transition.
    pub async fn handle_event(&mut self, event: PlayerEvent) {
        match event {
            PlayerEvent::SnapshotChanged => self.on_snapshot_changed().await,
            PlayerEvent::MediaReady { duration } => self.on_media_ready(duration).await,
            PlayerEvent::MediaEnded => self.on_media_finished(false).await,
            PlayerEvent::MediaError { message } => {
                tracing::warn!("Render error on item {}: {}", self.index, message);
                self.notifier.notify(
                    NoticeLevel::Warn,
                    "Playback Error",
                    "There was a problem playing this media",
                );
                self.on_media_finished(true).await;
            }
            PlayerEvent::DisplayElapsed { generation } => {
                if generation == self.generation && self.phase == PlaybackPhase::Showing {
                    self.begin_transition().await;
                }
            }
            PlayerEvent::TransitionElapsed { generation } => {
                if generation == self.generation {
                    self.on_transition_step().await;
                }
            }
            PlayerEvent::Shutdown => {}
        }
    }

    /// Cancel timers and blank the surface. Must run on teardown so no stale
    /// timer fires into a dead engine.
    pub async fn teardown(&mut self) {
        self.timers.cancel_all();
        self.surface.clear().await;
    }

    async fn on_snapshot_changed(&mut self) {
        let snapshot = self.snapshot_rx.borrow().clone();
        self.snapshot = snapshot;
        let len = self.snapshot.len();
        tracing::debug!("Snapshot changed: {} items", len);

        if len == 0 {
            if self.phase != PlaybackPhase::Idle {
                self.enter_idle().await;
            }
            return;
        }

        // Keep the numeric position across routine refreshes; only clamp
        // when the new list is shorter.
        if self.index >= len {
            self.index %= len;
        }

        if self.phase == PlaybackPhase::Idle && self.present_from(self.index).await {
            self.phase = PlaybackPhase::Showing;
            self.arm_display().await;
        }
    }

    async fn on_media_ready(&mut self, duration: Option<f32>) {
        match self.phase {
            PlaybackPhase::Showing => self.apply_ready(duration).await,
            // Still fading in; apply once the transition completes.
            PlaybackPhase::TransitioningIn => self.pending_ready = Some(duration),
            _ => {}
        }
    }

    async fn on_media_finished(&mut self, was_error: bool) {
        if self.phase != PlaybackPhase::Showing {
            tracing::debug!("Ignoring end signal while {:?}", self.phase);
            return;
        }

        if !was_error {
            if let Some(item) = self.snapshot.get(self.index) {
                // A lone video self-loops; end of stream never cycles it.
                if item.is_video() && self.snapshot.len() == 1 {
                    return;
                }
            }
        }

        self.begin_transition().await;
    }

    async fn begin_transition(&mut self) {
        self.phase = PlaybackPhase::TransitioningOut;
        self.generation += 1;
        self.surface.set_paused(true).await;
        self.surface.set_opacity(0.0).await;
        self.timers.arm(
            &self.events_tx,
            self.transition,
            PlayerEvent::TransitionElapsed {
                generation: self.generation,
            },
        );
    }

    async fn on_transition_step(&mut self) {
        match self.phase {
            PlaybackPhase::TransitioningOut => {
                let len = self.snapshot.len();
                let next = if len == 0 { 0 } else { (self.index + 1) % len };
                if len == 0 || !self.present_from(next).await {
                    self.enter_idle().await;
                    return;
                }
                self.phase = PlaybackPhase::TransitioningIn;
                self.surface.set_opacity(1.0).await;
                self.timers.arm(
                    &self.events_tx,
                    self.transition,
                    PlayerEvent::TransitionElapsed {
                        generation: self.generation,
                    },
                );
            }
            PlaybackPhase::TransitioningIn => {
                self.phase = PlaybackPhase::Showing;
                self.surface.set_paused(false).await;
                self.arm_display().await;
            }
            _ => {}
        }
    }

    /// Resolve and present the first cached item at or after `start`, in
    /// ring order. Unresolvable items are skipped without rendering.
    async fn present_from(&mut self, start: usize) -> bool {
        let len = self.snapshot.len();
        if len == 0 {
            return false;
        }

        for offset in 0..len {
            let idx = (start + offset) % len;
            let Some(item) = self.snapshot.get(idx).cloned() else {
                continue;
            };
            let path = self.cache.write().await.resolve(&item.id);
            let Some(path) = path else {
                tracing::debug!("Skipping unresolvable item {}", item.id);
                continue;
            };

            self.index = idx;
            self.generation += 1;
            self.pending_ready = None;
            let looping = item.is_video() && len == 1;
            self.surface.show(&item, &path, looping).await;
            return true;
        }
        false
    }

    /// Per-kind entry actions once an item is fully on screen.
    async fn arm_display(&mut self) {
        let Some(item) = self.snapshot.get(self.index).cloned() else {
            return;
        };

        if item.is_video() {
            if let Some(duration) = self.pending_ready.take() {
                self.apply_ready(duration).await;
            }
            // Otherwise wait for the surface's ready signal.
        } else {
            // Images log immediately for the whole display window.
            self.emit_view_log(&item, self.image_duration);
            self.timers.arm(
                &self.events_tx,
                self.image_duration,
                PlayerEvent::DisplayElapsed {
                    generation: self.generation,
                },
            );
        }
    }

    /// Handle a video's ready signal: log the view and configure looping for
    /// short clips, which replay seamlessly inside one display window.
    async fn apply_ready(&mut self, duration: Option<f32>) {
        let Some(item) = self.snapshot.get(self.index).cloned() else {
            return;
        };
        if !item.is_video() {
            return;
        }

        let window = match duration {
            Some(secs) if secs > 0.0 => Duration::from_secs_f32(secs),
            // No reported duration: log a conservative default window.
            _ => self.image_duration,
        };
        self.emit_view_log(&item, window);

        if let Some(secs) = duration {
            if secs > 0.0 && secs < self.video_loop_threshold && self.snapshot.len() > 1 {
                self.surface.set_looping(true).await;
                let display_window = window.max(self.image_duration);
                self.timers.arm(
                    &self.events_tx,
                    display_window,
                    PlayerEvent::DisplayElapsed {
                        generation: self.generation,
                    },
                );
            }
        }
    }

    async fn enter_idle(&mut self) {
        tracing::info!("No playable content; idling");
        self.phase = PlaybackPhase::Idle;
        self.generation += 1;
        self.pending_ready = None;
        self.timers.cancel_all();
        self.surface.clear().await;
    }

    fn emit_view_log(&self, item: &MediaDescriptor, window: Duration) {
        let start = Local::now();
        let end = start
            + chrono::Duration::from_std(window).unwrap_or_else(|_| chrono::Duration::zero());
        self.logger
            .record(ViewLogRecord::new(&self.device_id, &item.id, start, end));
    }
}
