//! Download manager: converges local disk state to a playlist snapshot.
//!
//! Remote hosts are treated as hostile. Drive-style sources are acquired
//! through an ordered list of tiers (direct transform, confirmation-token
//! handshake, alternate endpoint), and every downloaded payload is verified
//! before it may enter the cache.

use crate::cache::MediaCache;
use crate::config::Settings;
use crate::media::{MediaDescriptor, MediaKind, PlaylistSnapshot};
use crate::surface::{NoticeLevel, Notifier};
use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use url::Url;

/// How many leading bytes are sniffed for payload signatures.
const SNIFF_LEN: usize = 512;

/// Payloads larger than this skip content sniffing; size alone vouches for
/// them (a real interstitial page is always small).
const SNIFF_SIZE_LIMIT: u64 = 256 * 1024;

/// Failure taxonomy for one media item.
#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    /// Transient transport failure; retried on the next sync cycle.
    #[error("network error: {0}")]
    Network(String),
    /// The host returned something other than media.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
    /// Local disk failure; fatal for the item this cycle.
    #[error("storage error: {0}")]
    Storage(String),
}

impl From<reqwest::Error> for DownloadError {
    fn from(err: reqwest::Error) -> Self {
        DownloadError::Network(err.to_string())
    }
}

impl From<std::io::Error> for DownloadError {
    fn from(err: std::io::Error) -> Self {
        DownloadError::Storage(err.to_string())
    }
}

/// Transport seam. The production fetcher streams over HTTP; tests swap in
/// scripted payloads.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Stream a URL into a file. Returns the number of bytes written.
    async fn fetch_to(&self, url: &str, dest: &Path, timeout: Duration)
        -> Result<u64, DownloadError>;

    /// Fetch a small text body (the Drive confirmation interstitial).
    async fn fetch_text(&self, url: &str, timeout: Duration) -> Result<String, DownloadError>;
}

/// Streaming HTTP fetcher backed by reqwest.
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch_to(
        &self,
        url: &str,
        dest: &Path,
        timeout: Duration,
    ) -> Result<u64, DownloadError> {
        let response = self
            .client
            .get(url)
            .timeout(timeout)
            .send()
            .await?
            .error_for_status()?;

        let mut file = tokio::fs::File::create(dest).await?;
        let mut body = response.bytes_stream();
        let mut written = 0u64;

        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;

        Ok(written)
    }

    async fn fetch_text(&self, url: &str, timeout: Duration) -> Result<String, DownloadError> {
        let response = self
            .client
            .get(url)
            .timeout(timeout)
            .send()
            .await?
            .error_for_status()?;
        Ok(response.text().await?)
    }
}

/// One acquisition strategy, tried in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tier {
    /// The direct-link transform of the source URL.
    Direct,
    /// Drive's large-file flow: pick the confirmation token off the
    /// interstitial, retry with `confirm=` attached.
    DriveConfirm,
    /// Alternate Drive endpoint, last resort.
    DriveAlternate,
}

/// Outcome of one `sync` pass over a snapshot.
#[derive(Debug, Default)]
pub struct DownloadReport {
    /// Items downloaded and verified this pass.
    pub completed: Vec<String>,
    /// Items already cached; no network I/O performed.
    pub skipped: Vec<String>,
    /// Items that exhausted every tier. Retried next cycle.
    pub failed: Vec<(String, DownloadError)>,
}

impl DownloadReport {
    pub fn fully_synced(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Converges the cache to a snapshot's media set.
#[derive(Clone)]
pub struct Downloader {
    fetcher: Arc<dyn Fetcher>,
    cache: Arc<RwLock<MediaCache>>,
    notifier: Arc<dyn Notifier>,
    image_timeout: Duration,
    video_timeout: Duration,
    concurrency: usize,
    video_min_bytes: u64,
}

impl Downloader {
    pub fn new(
        fetcher: Arc<dyn Fetcher>,
        cache: Arc<RwLock<MediaCache>>,
        notifier: Arc<dyn Notifier>,
        settings: &Settings,
    ) -> Self {
        Self {
            fetcher,
            cache,
            notifier,
            image_timeout: Duration::from_secs(settings.download.image_timeout_secs),
            video_timeout: Duration::from_secs(settings.download.video_timeout_secs),
            concurrency: settings.download.concurrency.max(1),
            video_min_bytes: settings.video_min_bytes,
        }
    }

    /// Ensure every item in the snapshot has a verified local file.
    ///
    /// Already-cached items short-circuit without network I/O, so re-running
    /// against an unchanged snapshot is free. Failed items are reported and
    /// left uncached for the next cycle.
    pub async fn sync(&self, snapshot: &PlaylistSnapshot) -> DownloadReport {
        let mut report = DownloadReport::default();
        let mut pending: Vec<MediaDescriptor> = Vec::new();

        {
            let cache = self.cache.read().await;
            for media in &snapshot.items {
                if cache.has(&media.id) {
                    report.skipped.push(media.id.clone());
                } else {
                    pending.push(media.clone());
                }
            }
        }

        if pending.is_empty() {
            tracing::debug!("Cache already converged ({} items)", snapshot.len());
            return report;
        }

        tracing::info!(
            "Syncing {} of {} media items",
            pending.len(),
            snapshot.len()
        );

        let results: Vec<(String, String, Result<(), DownloadError>)> =
            stream::iter(pending.into_iter().map(|media| {
                let this = self.clone();
                async move {
                    (
                        media.id.clone(),
                        media.title.clone(),
                        this.ensure_item(&media).await,
                    )
                }
            }))
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        for (id, title, result) in results {
            match result {
                Ok(()) => {
                    tracing::info!("Downloaded {} \"{}\"", id, title);
                    report.completed.push(id);
                }
                Err(err) => {
                    tracing::warn!("Failed to download {} \"{}\": {}", id, title, err);
                    self.notifier.notify(
                        NoticeLevel::Error,
                        "Download Error",
                        &format!("Failed to download file: {}", title),
                    );
                    report.failed.push((id, err));
                }
            }
        }

        report
    }

    /// Acquire one item through the tier ladder.
    async fn ensure_item(&self, media: &MediaDescriptor) -> Result<(), DownloadError> {
        let final_path = self.cache.read().await.entry_path(media);
        if let Some(parent) = final_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let part_path = partial_path(&final_path);

        let timeout = match media.kind {
            MediaKind::Image => self.image_timeout,
            MediaKind::Video => self.video_timeout,
        };

        let drive_id = drive_file_id(&media.source_url);
        let tiers: &[Tier] = if drive_id.is_some() {
            &[Tier::Direct, Tier::DriveConfirm, Tier::DriveAlternate]
        } else {
            &[Tier::Direct]
        };

        let mut last_err = DownloadError::Network("no tiers attempted".into());

        for &tier in tiers {
            match self
                .attempt_tier(tier, media, drive_id.as_deref(), &part_path, timeout)
                .await
            {
                Ok(size) => {
                    match verify_payload(&part_path, size, media.kind, self.video_min_bytes) {
                        Ok(()) => {
                            tokio::fs::rename(&part_path, &final_path).await?;
                            self.cache
                                .write()
                                .await
                                .put(&media.id, &final_path, size, media.kind)
                                .map_err(|e| DownloadError::InvalidPayload(e.to_string()))?;
                            return Ok(());
                        }
                        Err(err) => {
                            tracing::debug!(
                                "Tier {:?} for {} produced invalid payload: {}",
                                tier,
                                media.id,
                                err
                            );
                            remove_quietly(&part_path).await;
                            last_err = err;
                        }
                    }
                }
                Err(err @ DownloadError::Storage(_)) => {
                    // Disk trouble will not improve on the next tier.
                    remove_quietly(&part_path).await;
                    return Err(err);
                }
                Err(err) => {
                    tracing::debug!("Tier {:?} for {} failed: {}", tier, media.id, err);
                    remove_quietly(&part_path).await;
                    last_err = err;
                }
            }
        }

        Err(last_err)
    }

    async fn attempt_tier(
        &self,
        tier: Tier,
        media: &MediaDescriptor,
        drive_id: Option<&str>,
        dest: &Path,
        timeout: Duration,
    ) -> Result<u64, DownloadError> {
        let url = match (tier, drive_id) {
            (Tier::Direct, Some(id)) => drive_direct_url(id),
            (Tier::Direct, None) => media.source_url.clone(),
            (Tier::DriveConfirm, Some(id)) => {
                let interstitial = self
                    .fetcher
                    .fetch_text(&drive_direct_url(id), self.image_timeout)
                    .await?;
                let token = confirm_token(&interstitial).unwrap_or_else(|| "t".to_string());
                format!(
                    "https://drive.google.com/uc?export=download&id={}&confirm={}",
                    id, token
                )
            }
            (Tier::DriveAlternate, Some(id)) => format!(
                "https://drive.usercontent.google.com/download?id={}&export=download&confirm=t",
                id
            ),
            // Non-Drive sources only get the direct tier.
            (Tier::DriveConfirm | Tier::DriveAlternate, None) => {
                return Err(DownloadError::InvalidPayload("no drive id".into()))
            }
        };

        self.fetcher.fetch_to(&url, dest, timeout).await
    }
}

/// Sibling path a download streams into before verification.
fn partial_path(final_path: &Path) -> PathBuf {
    let name = final_path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("download");
    final_path.with_file_name(format!("{}.part", name))
}

async fn remove_quietly(path: &Path) {
    if tokio::fs::metadata(path).await.is_ok() {
        let _ = tokio::fs::remove_file(path).await;
    }
}

/// Extract a Drive file id from a share/view/uc-style link.
fn drive_file_id(source_url: &str) -> Option<String> {
    let url = Url::parse(source_url).ok()?;
    let host = url.host_str()?;
    if host != "drive.google.com" && host != "drive.usercontent.google.com" {
        return None;
    }

    if let Some((_, id)) = url.query_pairs().find(|(k, _)| k == "id") {
        if !id.is_empty() {
            return Some(id.into_owned());
        }
    }

    // Share links look like /file/d/<id>/view.
    let mut segments = url.path_segments()?;
    while let Some(segment) = segments.next() {
        if segment == "d" {
            return segments.next().filter(|s| !s.is_empty()).map(str::to_string);
        }
    }
    None
}

fn drive_direct_url(id: &str) -> String {
    format!("https://drive.google.com/uc?export=download&id={}", id)
}

/// Pull the anti-virus-scan confirmation token off a Drive interstitial.
fn confirm_token(body: &str) -> Option<String> {
    let start = body.find("confirm=")? + "confirm=".len();
    let token: String = body[start..]
        .chars()
        .take_while(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .collect();
    (!token.is_empty()).then_some(token)
}

/// Accept a payload only if it plausibly matches its declared kind.
///
/// Small payloads are content-sniffed (HTML interstitials, image magic);
/// large ones are vouched for by size alone.
fn verify_payload(
    path: &Path,
    size: u64,
    kind: MediaKind,
    video_min_bytes: u64,
) -> Result<(), DownloadError> {
    if size == 0 {
        return Err(DownloadError::InvalidPayload("empty file".into()));
    }
    if kind == MediaKind::Video && size < video_min_bytes {
        return Err(DownloadError::InvalidPayload(format!(
            "{} bytes is implausibly small for a video",
            size
        )));
    }

    if size <= SNIFF_SIZE_LIMIT {
        let head = read_head(path)?;
        if looks_like_html(&head) {
            return Err(DownloadError::InvalidPayload(
                "host returned an HTML page".into(),
            ));
        }
        if kind == MediaKind::Image && image::guess_format(&head).is_err() {
            return Err(DownloadError::InvalidPayload(
                "unrecognized image format".into(),
            ));
        }
    }

    Ok(())
}

fn read_head(path: &Path) -> Result<Vec<u8>, DownloadError> {
    let mut file = std::fs::File::open(path)?;
    let mut head = vec![0u8; SNIFF_LEN];
    let mut filled = 0;
    while filled < head.len() {
        let n = file.read(&mut head[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    head.truncate(filled);
    Ok(head)
}

fn looks_like_html(head: &[u8]) -> bool {
    let text = String::from_utf8_lossy(head).to_ascii_lowercase();
    let trimmed = text.trim_start_matches(['\u{feff}', ' ', '\t', '\r', '\n']);
    trimmed.starts_with("<!doctype") || trimmed.starts_with("<html") || text.contains("<html")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::MediaKind;
    use crate::surface::LogNotifier;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const PNG_MAGIC: &[u8] = b"\x89PNG\r\n\x1a\nrestofpayload";
    const MP4_HEAD: &[u8] = b"\x00\x00\x00\x18ftypmp42";
    const DRIVE_INTERSTITIAL: &str =
        "<!DOCTYPE html><html><body><a href=\"/uc?export=download&confirm=TOKEN42&id=abc\">\
         Download anyway</a></body></html>";

    /// Scripted fetcher: the first rule whose substring matches the URL wins.
    struct MockFetcher {
        rules: Vec<(&'static str, Vec<u8>)>,
        interstitial: String,
        calls: AtomicUsize,
    }

    impl MockFetcher {
        fn new(rules: Vec<(&'static str, Vec<u8>)>) -> Self {
            Self {
                rules,
                interstitial: DRIVE_INTERSTITIAL.to_string(),
                calls: AtomicUsize::new(0),
            }
        }

        fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Fetcher for MockFetcher {
        async fn fetch_to(
            &self,
            url: &str,
            dest: &Path,
            _timeout: Duration,
        ) -> Result<u64, DownloadError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            for (needle, body) in &self.rules {
                if url.contains(needle) {
                    std::fs::write(dest, body)?;
                    return Ok(body.len() as u64);
                }
            }
            Err(DownloadError::Network(format!("no rule for {}", url)))
        }

        async fn fetch_text(
            &self,
            _url: &str,
            _timeout: Duration,
        ) -> Result<String, DownloadError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.interstitial.clone())
        }
    }

    fn media(id: &str, url: &str, kind: MediaKind) -> MediaDescriptor {
        MediaDescriptor {
            id: id.to_string(),
            title: format!("item-{}", id),
            source_url: url.to_string(),
            kind,
            owner_scope: "tv-1".to_string(),
            order: 0,
        }
    }

    fn settings() -> Settings {
        Settings {
            video_min_bytes: 8,
            ..Settings::default()
        }
    }

    fn downloader(
        fetcher: Arc<MockFetcher>,
        dir: &std::path::Path,
    ) -> (Downloader, Arc<RwLock<MediaCache>>) {
        let cache = Arc::new(RwLock::new(
            MediaCache::with_max_bytes(dir.into(), 1024 * 1024, 8).unwrap(),
        ));
        let d = Downloader::new(fetcher, cache.clone(), Arc::new(LogNotifier), &settings());
        (d, cache)
    }

    #[tokio::test]
    async fn sync_downloads_then_short_circuits() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = Arc::new(MockFetcher::new(vec![
            ("a.png", PNG_MAGIC.to_vec()),
            ("b.mp4", MP4_HEAD.to_vec()),
        ]));
        let (downloader, cache) = downloader(fetcher.clone(), dir.path());

        let snapshot = PlaylistSnapshot::new(
            "tv-1".into(),
            vec![
                media("1", "https://cdn.example.com/a.png", MediaKind::Image),
                media("2", "https://cdn.example.com/b.mp4", MediaKind::Video),
            ],
        );

        let report = downloader.sync(&snapshot).await;
        assert_eq!(report.completed.len(), 2);
        assert!(report.fully_synced());
        assert!(cache.read().await.has("1"));
        assert!(cache.read().await.has("2"));

        // Second pass: every item short-circuits, zero network calls.
        let calls_before = fetcher.call_count();
        let report = downloader.sync(&snapshot).await;
        assert_eq!(report.skipped.len(), 2);
        assert!(report.completed.is_empty());
        assert_eq!(fetcher.call_count(), calls_before);
    }

    #[tokio::test]
    async fn drive_html_interstitial_falls_through_to_confirm_tier() {
        let dir = tempfile::tempdir().unwrap();
        // Direct tier serves the interstitial; the confirm tier serves media.
        let fetcher = Arc::new(MockFetcher::new(vec![
            ("confirm=TOKEN42", MP4_HEAD.to_vec()),
            ("uc?export=download", DRIVE_INTERSTITIAL.as_bytes().to_vec()),
        ]));
        let (downloader, cache) = downloader(fetcher, dir.path());

        let snapshot = PlaylistSnapshot::new(
            "tv-1".into(),
            vec![media(
                "9",
                "https://drive.google.com/file/d/abc123/view?usp=sharing",
                MediaKind::Video,
            )],
        );

        let report = downloader.sync(&snapshot).await;
        assert!(report.fully_synced(), "failed: {:?}", report.failed);

        let mut cache = cache.write().await;
        let path = cache.resolve("9").expect("cached");
        assert_eq!(std::fs::read(&path).unwrap(), MP4_HEAD);
    }

    #[tokio::test]
    async fn exhausted_tiers_leave_item_uncached_and_cleaned_up() {
        let dir = tempfile::tempdir().unwrap();
        // Every tier serves HTML.
        let fetcher = Arc::new(MockFetcher::new(vec![(
            "google.com",
            DRIVE_INTERSTITIAL.as_bytes().to_vec(),
        )]));
        let (downloader, cache) = downloader(fetcher, dir.path());

        let desc = media(
            "7",
            "https://drive.google.com/uc?export=download&id=xyz",
            MediaKind::Video,
        );
        let snapshot = PlaylistSnapshot::new("tv-1".into(), vec![desc.clone()]);

        let report = downloader.sync(&snapshot).await;
        assert_eq!(report.failed.len(), 1);
        assert!(matches!(
            report.failed[0].1,
            DownloadError::InvalidPayload(_)
        ));
        assert!(!cache.read().await.has("7"));

        // No final file, no leftover partial.
        let final_path = cache.read().await.entry_path(&desc);
        assert!(!final_path.exists());
        assert!(!partial_path(&final_path).exists());
    }

    #[test]
    fn drive_ids_come_out_of_every_link_shape() {
        assert_eq!(
            drive_file_id("https://drive.google.com/file/d/abc123/view?usp=sharing"),
            Some("abc123".into())
        );
        assert_eq!(
            drive_file_id("https://drive.google.com/uc?export=download&id=xyz789"),
            Some("xyz789".into())
        );
        assert_eq!(drive_file_id("https://cdn.example.com/a.png"), None);
        assert_eq!(drive_file_id("not a url"), None);
    }

    #[test]
    fn confirm_token_is_parsed_from_interstitial() {
        assert_eq!(confirm_token(DRIVE_INTERSTITIAL), Some("TOKEN42".into()));
        assert_eq!(confirm_token("<html>nothing here</html>"), None);
    }

    #[test]
    fn verification_rejects_bogus_payloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("payload");

        std::fs::write(&path, b"").unwrap();
        assert!(verify_payload(&path, 0, MediaKind::Image, 8).is_err());

        std::fs::write(&path, DRIVE_INTERSTITIAL).unwrap();
        let err = verify_payload(
            &path,
            DRIVE_INTERSTITIAL.len() as u64,
            MediaKind::Video,
            8,
        )
        .unwrap_err();
        assert!(matches!(err, DownloadError::InvalidPayload(_)));

        // Below the plausible-size floor for video.
        std::fs::write(&path, MP4_HEAD).unwrap();
        assert!(verify_payload(&path, MP4_HEAD.len() as u64, MediaKind::Video, 1024).is_err());

        // Image kind requires recognizable image magic.
        std::fs::write(&path, b"definitely not an image").unwrap();
        assert!(verify_payload(&path, 23, MediaKind::Image, 8).is_err());

        std::fs::write(&path, PNG_MAGIC).unwrap();
        assert!(verify_payload(&path, PNG_MAGIC.len() as u64, MediaKind::Image, 8).is_ok());
    }
}
