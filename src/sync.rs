//! Manifest synchronization.
//!
//! Periodically fetches the sheet-backed manifest, validates it defensively,
//! converges the cache through the download manager, and publishes immutable
//! playlist snapshots. A persisted copy of the last snapshot keeps playback
//! alive across restarts and network outages.

use crate::cache::MediaCache;
use crate::download::Downloader;
use crate::media::{cell_text, MediaDescriptor, PlaylistSnapshot, RawRow};
use crate::store::KvStore;
use crate::surface::{ManifestSource, NoticeLevel, Notifier};
use anyhow::{Context, Result};
use async_trait::async_trait;
use rand::Rng;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};

/// KV key the last published snapshot is persisted under.
const SNAPSHOT_KEY: &str = "snapshot";

/// Manifest source reading a Google Sheet through the gviz JSON endpoint.
pub struct SheetManifestSource {
    client: reqwest::Client,
    base_url: String,
}

impl SheetManifestSource {
    pub fn new(client: reqwest::Client, base_url: String) -> Self {
        Self { client, base_url }
    }
}

#[async_trait]
impl ManifestSource for SheetManifestSource {
    async fn fetch(&self, _scope: &str) -> Result<Vec<RawRow>> {
        // The sheet holds rows for every device; scope filtering happens
        // after validation.
        let url = format!(
            "{}/gviz/tq?tqx=out:json&tq={}",
            self.base_url.trim_end_matches('/'),
            urlencoding::encode("select *")
        );

        let body = self
            .client
            .get(&url)
            .send()
            .await
            .context("Failed to fetch manifest")?
            .error_for_status()
            .context("Manifest endpoint returned error")?
            .text()
            .await
            .context("Failed to read manifest body")?;

        parse_gviz(&body)
    }
}

/// Parse the gviz `tq?tqx=out:json` response.
///
/// The body is JavaScript, not JSON: a `google.visualization.Query.
/// setResponse(...)` call wrapping the real object. Everything outside the
/// outermost braces is stripped rather than counted, so padding changes on
/// Google's side do not break parsing.
pub fn parse_gviz(body: &str) -> Result<Vec<RawRow>> {
    let start = body.find('{').context("gviz response has no JSON object")?;
    let end = body.rfind('}').context("gviz response has no JSON object")?;
    let json: Value =
        serde_json::from_str(&body[start..=end]).context("Failed to parse gviz JSON")?;

    let rows = json
        .pointer("/table/rows")
        .and_then(Value::as_array)
        .context("gviz response has no rows")?;

    Ok(rows
        .iter()
        .map(|row| {
            let cells = row
                .get("c")
                .and_then(Value::as_array)
                .map(|cells| {
                    cells
                        .iter()
                        .map(|cell| {
                            cell.get("v").cloned().filter(|v| !v.is_null())
                        })
                        .collect()
                })
                .unwrap_or_default();
            RawRow::from_cells(cells)
        })
        .collect())
}

/// Fetches, validates and publishes playlist snapshots on a fixed interval.
pub struct SyncController {
    source: Arc<dyn ManifestSource>,
    downloader: Arc<Downloader>,
    cache: Arc<RwLock<MediaCache>>,
    store: Arc<KvStore>,
    notifier: Arc<dyn Notifier>,
    publisher: watch::Sender<Arc<PlaylistSnapshot>>,
    scope: String,
    refresh_interval: Duration,
    in_flight: AtomicBool,
}

impl SyncController {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        source: Arc<dyn ManifestSource>,
        downloader: Arc<Downloader>,
        cache: Arc<RwLock<MediaCache>>,
        store: Arc<KvStore>,
        notifier: Arc<dyn Notifier>,
        publisher: watch::Sender<Arc<PlaylistSnapshot>>,
        scope: String,
        refresh_interval: Duration,
    ) -> Self {
        Self {
            source,
            downloader,
            cache,
            store,
            notifier,
            publisher,
            scope,
            refresh_interval,
            in_flight: AtomicBool::new(false),
        }
    }

    /// Publish the persisted snapshot, if one matches the configured scope.
    /// Lets a cold start show the previous content before the first fetch.
    pub fn publish_persisted(&self) -> bool {
        let Some(json) = self.store.get(SNAPSHOT_KEY) else {
            return false;
        };
        match serde_json::from_str::<PlaylistSnapshot>(&json) {
            Ok(snapshot) if snapshot.scope == self.scope && !snapshot.is_empty() => {
                tracing::info!(
                    "Restored persisted playlist with {} items",
                    snapshot.len()
                );
                self.publisher.send_replace(Arc::new(snapshot));
                true
            }
            Ok(_) => false,
            Err(e) => {
                tracing::warn!("Discarding unreadable persisted playlist: {}", e);
                let _ = self.store.remove(SNAPSHOT_KEY);
                false
            }
        }
    }

    /// One fetch-validate-download-publish pass.
    ///
    /// Single-flight: if a cycle is already running this returns immediately
    /// without queueing. Fetch failures keep the previous snapshot on air and
    /// only surface when there is nothing to serve at all.
    pub async fn run_cycle(&self) -> Result<()> {
        if self.in_flight.swap(true, Ordering::SeqCst) {
            tracing::debug!("Sync cycle already in flight, skipping");
            return Ok(());
        }
        let _flight = FlightGuard(&self.in_flight);

        let rows = match self.source.fetch(&self.scope).await {
            Ok(rows) => rows,
            Err(err) => {
                if self.has_any_snapshot() {
                    tracing::warn!("Manifest fetch failed, serving last snapshot: {}", err);
                } else {
                    self.notifier.notify(
                        NoticeLevel::Error,
                        "Sync Error",
                        "Failed to fetch media content",
                    );
                }
                return Err(err).context("Manifest fetch failed");
            }
        };

        let items = self.validate_rows(rows);
        if items.is_empty() {
            if !self.has_any_snapshot() {
                self.notifier.notify(
                    NoticeLevel::Warn,
                    "No Content",
                    "No media content available for this device",
                );
            }
            tracing::info!("Manifest has no items for scope {}", self.scope);
            return Ok(());
        }

        let snapshot = PlaylistSnapshot::new(self.scope.clone(), items);
        let report = self.downloader.sync(&snapshot).await;
        tracing::info!(
            "Sync cycle: {} downloaded, {} cached, {} failed",
            report.completed.len(),
            report.skipped.len(),
            report.failed.len()
        );
        if !report.fully_synced() {
            tracing::warn!(
                "{} items left uncached; retrying next cycle",
                report.failed.len()
            );
        }

        {
            let mut cache = self.cache.write().await;
            cache.cleanup_orphans(&snapshot.items);
            let stats = cache.stats();
            tracing::debug!(
                "Cache holds {} entries ({:.1} MB)",
                stats.item_count,
                stats.current_size as f64 / 1024.0 / 1024.0
            );
        }

        let json = serde_json::to_string(&snapshot).context("Failed to serialize snapshot")?;
        self.publisher.send_replace(Arc::new(snapshot));
        if let Err(e) = self.store.set(SNAPSHOT_KEY, &json) {
            tracing::warn!("Failed to persist snapshot: {}", e);
        }

        Ok(())
    }

    /// Drop invalid rows, keep the configured scope, order by sheet ordinal
    /// and dedupe ids (first occurrence wins).
    fn validate_rows(&self, rows: Vec<RawRow>) -> Vec<MediaDescriptor> {
        let mut seen: HashSet<String> = HashSet::new();
        let mut items: Vec<MediaDescriptor> = rows
            .iter()
            .filter_map(|row| {
                let item = MediaDescriptor::from_row(row);
                if item.is_none() {
                    tracing::debug!("Dropping invalid manifest row: {:?}", row);
                }
                item
            })
            .filter(|item| item.owner_scope == self.scope)
            .filter(|item| seen.insert(item.id.clone()))
            .collect();
        items.sort_by_key(|item| item.order);
        items
    }

    fn has_any_snapshot(&self) -> bool {
        !self.publisher.borrow().is_empty() || self.store.get(SNAPSHOT_KEY).is_some()
    }

    /// Validate a candidate device id, cache-first.
    ///
    /// A scope present in the persisted or published snapshot validates
    /// without a network round-trip; anything else falls through to a fresh
    /// fetch-and-check.
    pub async fn validate_device_id(&self, candidate: &str) -> Result<bool> {
        let candidate = candidate.trim();
        if candidate.is_empty() {
            return Ok(false);
        }

        if self
            .publisher
            .borrow()
            .items
            .iter()
            .any(|m| m.owner_scope == candidate)
        {
            return Ok(true);
        }
        if let Some(json) = self.store.get(SNAPSHOT_KEY) {
            if let Ok(snapshot) = serde_json::from_str::<PlaylistSnapshot>(&json) {
                if snapshot.items.iter().any(|m| m.owner_scope == candidate) {
                    return Ok(true);
                }
            }
        }

        let rows = self
            .source
            .fetch(candidate)
            .await
            .context("Failed to fetch manifest for device validation")?;
        Ok(rows
            .iter()
            .any(|row| cell_text(&row.tv_id).as_deref() == Some(candidate)))
    }

    /// Fixed-interval sync loop. Failed cycles back off with a little jitter
    /// so a fleet of players does not hammer a recovering host in lockstep.
    pub async fn run_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.refresh_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            interval.tick().await;
            if let Err(err) = self.run_cycle().await {
                tracing::warn!("Sync cycle failed: {:#}", err);
                let jitter = rand::thread_rng().gen_range(0..5000);
                tokio::time::sleep(Duration::from_millis(jitter)).await;
            }
        }
    }
}

struct FlightGuard<'a>(&'a AtomicBool);

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::{DownloadError, Fetcher};
    use crate::media::MediaKind;
    use crate::surface::NoticeLevel;
    use serde_json::json;
    use std::path::Path;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    const GVIZ_BODY: &str = "/*O_o*/\ngoogle.visualization.Query.setResponse({\"version\":\"0.6\",\"table\":{\"cols\":[],\"rows\":[\
        {\"c\":[{\"v\":1.0},{\"v\":101.0},{\"v\":\"123\"},{\"v\":\"First\"},{\"v\":\"https://cdn/a.png\"},{\"v\":\"Image\"}]},\
        {\"c\":[{\"v\":2.0},{\"v\":102.0},{\"v\":\"123\"},{\"v\":\"Second\"},{\"v\":\"https://cdn/b.mp4\"},{\"v\":\"video\"}]},\
        {\"c\":[null,{\"v\":103.0},{\"v\":\"999\"},{\"v\":\"Elsewhere\"},{\"v\":\"https://cdn/c.png\"},{\"v\":\"image\"}]},\
        {\"c\":[{\"v\":3.0},{\"v\":104.0},{\"v\":\"123\"},{\"v\":\"Broken\"},{\"v\":\"https://cdn/d.xyz\"},{\"v\":\"slideshow\"}]}\
        ]}});";

    struct MockSource {
        rows: Result<Vec<RawRow>, ()>,
        calls: AtomicUsize,
    }

    impl MockSource {
        fn ok(rows: Vec<RawRow>) -> Self {
            Self {
                rows: Ok(rows),
                calls: AtomicUsize::new(0),
            }
        }

        fn failing() -> Self {
            Self {
                rows: Err(()),
                calls: AtomicUsize::new(0),
            }
        }

        fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ManifestSource for MockSource {
        async fn fetch(&self, _scope: &str) -> Result<Vec<RawRow>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            // A short pause keeps two concurrent cycles overlapping.
            tokio::time::sleep(Duration::from_millis(20)).await;
            match &self.rows {
                Ok(rows) => Ok(rows.clone()),
                Err(()) => anyhow::bail!("manifest unreachable"),
            }
        }
    }

    struct StaticFetcher;

    #[async_trait]
    impl Fetcher for StaticFetcher {
        async fn fetch_to(
            &self,
            url: &str,
            dest: &Path,
            _timeout: Duration,
        ) -> Result<u64, DownloadError> {
            let body: &[u8] = if url.ends_with(".png") {
                b"\x89PNG\r\n\x1a\npayload"
            } else {
                b"\x00\x00\x00\x18ftypmp42-payload"
            };
            std::fs::write(dest, body)?;
            Ok(body.len() as u64)
        }

        async fn fetch_text(
            &self,
            _url: &str,
            _timeout: Duration,
        ) -> Result<String, DownloadError> {
            Ok(String::new())
        }
    }

    #[derive(Default)]
    struct RecordingNotifier {
        notices: Mutex<Vec<(NoticeLevel, String)>>,
    }

    impl Notifier for RecordingNotifier {
        fn notify(&self, level: NoticeLevel, title: &str, _message: &str) {
            self.notices
                .lock()
                .unwrap()
                .push((level, title.to_string()));
        }
    }

    fn row(order: i64, id: &str, scope: &str, title: &str, url: &str, kind: &str) -> RawRow {
        RawRow::from_cells(vec![
            Some(json!(order)),
            Some(json!(id)),
            Some(json!(scope)),
            Some(json!(title)),
            Some(json!(url)),
            Some(json!(kind)),
        ])
    }

    struct Rig {
        controller: Arc<SyncController>,
        source: Arc<MockSource>,
        notifier: Arc<RecordingNotifier>,
        subscriber: watch::Receiver<Arc<PlaylistSnapshot>>,
        _dir: tempfile::TempDir,
    }

    fn rig(source: MockSource) -> Rig {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(source);
        let notifier = Arc::new(RecordingNotifier::default());
        let cache = Arc::new(RwLock::new(
            MediaCache::with_max_bytes(dir.path().join("cache"), 1024 * 1024, 8).unwrap(),
        ));
        let store = Arc::new(KvStore::open(dir.path().join("state.json")).unwrap());
        let settings = crate::config::Settings {
            video_min_bytes: 8,
            ..crate::config::Settings::default()
        };
        let downloader = Arc::new(Downloader::new(
            Arc::new(StaticFetcher),
            cache.clone(),
            notifier.clone(),
            &settings,
        ));
        let (publisher, subscriber) = watch::channel(Arc::new(PlaylistSnapshot::default()));
        let controller = Arc::new(SyncController::new(
            source.clone(),
            downloader,
            cache,
            store,
            notifier.clone(),
            publisher,
            "123".to_string(),
            Duration::from_secs(60),
        ));
        Rig {
            controller,
            source,
            notifier,
            subscriber,
            _dir: dir,
        }
    }

    #[test]
    fn gviz_body_parses_into_rows() {
        let rows = parse_gviz(GVIZ_BODY).unwrap();
        assert_eq!(rows.len(), 4);
        assert_eq!(cell_text(&rows[0].title), Some("First".into()));
        assert_eq!(cell_text(&rows[0].content_id), Some("101".into()));
        // Null cells stay missing.
        assert!(rows[2].order.is_none());

        assert!(parse_gviz("not a gviz response").is_err());
    }

    #[tokio::test]
    async fn cycle_publishes_valid_scoped_rows_only() {
        let rig = rig(MockSource::ok(parse_gviz(GVIZ_BODY).unwrap()));

        rig.controller.run_cycle().await.unwrap();

        let snapshot = rig.subscriber.borrow().clone();
        // Row 103 is another scope, row 104 has an unknown kind.
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot.items[0].id, "101");
        assert_eq!(snapshot.items[0].kind, MediaKind::Image);
        assert_eq!(snapshot.items[1].id, "102");
        assert_eq!(snapshot.items[1].kind, MediaKind::Video);
    }

    #[tokio::test]
    async fn rows_are_ordered_and_deduped() {
        let rows = vec![
            row(5, "b", "123", "Late", "https://cdn/late.png", "image"),
            row(1, "a", "123", "Early", "https://cdn/early.png", "image"),
            row(9, "a", "123", "Duplicate", "https://cdn/dup.png", "image"),
        ];
        let rig = rig(MockSource::ok(rows));

        rig.controller.run_cycle().await.unwrap();

        let snapshot = rig.subscriber.borrow().clone();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot.items[0].id, "a");
        assert_eq!(snapshot.items[0].title, "Early");
        assert_eq!(snapshot.items[1].id, "b");
    }

    #[tokio::test]
    async fn fetch_failure_keeps_last_snapshot_quiet() {
        let rig2 = rig(MockSource::failing());
        // Pre-seed the published snapshot as if a previous cycle succeeded.
        rig2.controller
            .publisher
            .send_replace(Arc::new(PlaylistSnapshot::new(
                "123".into(),
                vec![crate::media::MediaDescriptor {
                    id: "a".into(),
                    title: "Only".into(),
                    source_url: "https://cdn/only.png".into(),
                    kind: MediaKind::Image,
                    owner_scope: "123".into(),
                    order: 1,
                }],
            )));

        assert!(rig2.controller.run_cycle().await.is_err());
        assert_eq!(rig2.subscriber.borrow().len(), 1, "snapshot still on air");
        assert!(rig2.notifier.notices.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn fetch_failure_with_nothing_to_serve_notifies() {
        let rig = rig(MockSource::failing());

        assert!(rig.controller.run_cycle().await.is_err());

        let notices = rig.notifier.notices.lock().unwrap();
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].0, NoticeLevel::Error);
    }

    #[tokio::test]
    async fn persisted_snapshot_restores_on_cold_start() {
        let rig = rig(MockSource::ok(vec![row(
            1,
            "a",
            "123",
            "Only",
            "https://cdn/only.png",
            "image",
        )]));
        rig.controller.run_cycle().await.unwrap();

        // Fresh publisher simulating a restart with the same store.
        let (publisher, subscriber) = watch::channel(Arc::new(PlaylistSnapshot::default()));
        let restarted = SyncController::new(
            rig.source.clone(),
            rig.controller.downloader.clone(),
            rig.controller.cache.clone(),
            rig.controller.store.clone(),
            rig.notifier.clone(),
            publisher,
            "123".to_string(),
            Duration::from_secs(60),
        );

        assert!(restarted.publish_persisted());
        assert_eq!(subscriber.borrow().len(), 1);
        assert_eq!(subscriber.borrow().items[0].id, "a");
    }

    #[tokio::test]
    async fn device_validation_is_cache_first() {
        let rig = rig(MockSource::ok(vec![
            row(1, "a", "123", "Mine", "https://cdn/mine.png", "image"),
            row(2, "b", "456", "Other", "https://cdn/other.png", "image"),
        ]));
        rig.controller.run_cycle().await.unwrap();
        let calls_after_cycle = rig.source.call_count();

        // Present in the published snapshot: no network.
        assert!(rig.controller.validate_device_id("123").await.unwrap());
        assert_eq!(rig.source.call_count(), calls_after_cycle);

        // Unknown locally: falls through to a fresh fetch, found in rows.
        assert!(rig.controller.validate_device_id("456").await.unwrap());
        assert_eq!(rig.source.call_count(), calls_after_cycle + 1);

        // Not found anywhere.
        assert!(!rig.controller.validate_device_id("999").await.unwrap());
        assert!(!rig.controller.validate_device_id("").await.unwrap());
    }

    #[tokio::test]
    async fn overlapping_cycles_are_single_flight() {
        let rig = rig(MockSource::ok(vec![row(
            1,
            "a",
            "123",
            "Only",
            "https://cdn/only.png",
            "image",
        )]));

        let c1 = rig.controller.clone();
        let first = tokio::spawn(async move { c1.run_cycle().await });
        // Give the first cycle time to enter its fetch.
        tokio::time::sleep(Duration::from_millis(5)).await;
        rig.controller.run_cycle().await.unwrap();

        first.await.unwrap().unwrap();
        assert_eq!(rig.source.call_count(), 1);
    }
}
