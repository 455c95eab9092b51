//! Digital signage player.
//!
//! Polls a sheet-backed manifest, keeps a verified local media cache, cycles
//! through the playlist full-screen and reports views back to a log sheet.

mod cache;
mod config;
mod download;
mod media;
mod playback;
mod store;
mod surface;
mod sync;
mod viewlog;

use crate::cache::MediaCache;
use crate::config::Settings;
use crate::download::{Downloader, HttpFetcher};
use crate::media::PlaylistSnapshot;
use crate::playback::{PlaybackEngine, PlayerEvent};
use crate::store::KvStore;
use crate::surface::{HeadlessSurface, LogNotifier, MediaSurface, Notifier};
use crate::sync::{SheetManifestSource, SyncController};
use crate::viewlog::{ScriptLogSink, ViewLogger};
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, RwLock};
use tracing_subscriber::EnvFilter;

/// Simulated clip length for the headless surface's end-of-stream signal.
const DRY_RUN_VIDEO_SECS: u64 = 30;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let settings = Settings::load()?;
    if settings.manifest_url.is_empty() {
        anyhow::bail!("manifest_url must be configured (signage.toml or SIGNAGE_MANIFEST_URL)");
    }

    let store = Arc::new(KvStore::open(settings.data_dir.join("state.json"))?);
    let cache = Arc::new(RwLock::new(MediaCache::new(
        settings.cache_dir.clone(),
        settings.max_cache_gb,
        settings.video_min_bytes,
    )?));

    let client = reqwest::Client::builder()
        .user_agent(concat!("signage-player/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("Failed to build HTTP client")?;

    let notifier: Arc<dyn Notifier> = Arc::new(LogNotifier);
    let fetcher = Arc::new(HttpFetcher::new(client.clone()));
    let downloader = Arc::new(Downloader::new(
        fetcher,
        cache.clone(),
        notifier.clone(),
        &settings,
    ));
    let manifest = Arc::new(SheetManifestSource::new(
        client.clone(),
        settings.manifest_url.clone(),
    ));
    let sink = Arc::new(ScriptLogSink::new(client, settings.log_sink_url.clone()));
    let (logger, _log_task) = ViewLogger::spawn(sink);

    // Device identity: configured value wins, else the persisted one.
    let configured = settings.device_id.clone();
    let stored = store.get("device_id");
    let device_id = configured
        .clone()
        .or_else(|| stored.clone())
        .context("No device id; set device_id in signage.toml or SIGNAGE_DEVICE_ID")?;

    let (publisher, snapshot_rx) = watch::channel(Arc::new(PlaylistSnapshot::default()));
    let controller = Arc::new(SyncController::new(
        manifest,
        downloader,
        cache.clone(),
        store.clone(),
        notifier.clone(),
        publisher,
        device_id.clone(),
        settings.refresh_interval(),
    ));

    // Cold start: put the previous playlist on air before the first fetch.
    controller.publish_persisted();

    // A newly configured id must exist in the manifest before it sticks.
    if configured.is_some() && stored.as_deref() != Some(device_id.as_str()) {
        match controller.validate_device_id(&device_id).await {
            Ok(true) => store.set("device_id", &device_id)?,
            Ok(false) => {
                anyhow::bail!("Device id {:?} is not present in the manifest", device_id)
            }
            Err(err) => {
                tracing::warn!("Device id validation deferred ({:#}); continuing", err);
            }
        }
    }

    let (events_tx, events_rx) = mpsc::channel(64);
    let surface: Arc<dyn MediaSurface> = HeadlessSurface::new(
        events_tx.clone(),
        Duration::from_secs(DRY_RUN_VIDEO_SECS),
    );
    let engine = PlaybackEngine::new(
        snapshot_rx,
        cache,
        surface,
        notifier,
        logger,
        events_tx.clone(),
        device_id,
        &settings,
    );

    let sync_task = tokio::spawn(controller.clone().run_loop());
    let engine_task = tokio::spawn(engine.run(events_rx));

    tracing::info!("Signage player running");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("Shutting down");

    sync_task.abort();
    let _ = events_tx.send(PlayerEvent::Shutdown).await;
    let _ = engine_task.await;

    Ok(())
}
