//! Verified media cache for offline playback.
//!
//! Maps media ids to local files, gating entries on verification so an error
//! page can never masquerade as a cached video. Evicts least-recently-used
//! entries when the byte budget is exceeded.

use crate::media::{MediaDescriptor, MediaKind};
use anyhow::{bail, Context, Result};
use lru::LruCache;
use std::fs;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Metadata for one cached media file.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub path: PathBuf,
    pub size: u64,
    pub verified: bool,
}

/// On-disk cache of playlist media, one subdirectory per media id.
///
/// Single writer (the download manager); the playback engine only resolves
/// paths. Startup rescans the directory so a cold start is warm.
pub struct MediaCache {
    cache_dir: PathBuf,
    max_size: u64,
    current_size: u64,
    video_min_bytes: u64,
    lru: LruCache<String, CacheEntry>,
}

impl MediaCache {
    /// Create a cache with a gigabyte budget.
    pub fn new(cache_dir: PathBuf, max_size_gb: u64, video_min_bytes: u64) -> Result<Self> {
        Self::with_max_bytes(cache_dir, max_size_gb * 1024 * 1024 * 1024, video_min_bytes)
    }

    /// Create a cache with an exact byte budget.
    pub fn with_max_bytes(cache_dir: PathBuf, max_size: u64, video_min_bytes: u64) -> Result<Self> {
        fs::create_dir_all(&cache_dir).context("Failed to create cache directory")?;

        let mut cache = Self {
            cache_dir,
            max_size,
            current_size: 0,
            video_min_bytes,
            lru: LruCache::new(NonZeroUsize::new(10000).unwrap()),
        };

        cache.scan_existing()?;

        tracing::info!(
            "Cache initialized: {} entries, {:.2} MB used",
            cache.lru.len(),
            cache.current_size as f64 / 1024.0 / 1024.0
        );

        Ok(cache)
    }

    /// Rebuild the index from files already on disk. Files that survived a
    /// previous run passed verification before they were written.
    fn scan_existing(&mut self) -> Result<()> {
        for entry in WalkDir::new(&self.cache_dir)
            .min_depth(2)
            .max_depth(2)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path().to_path_buf();

            // Leftover partial downloads are junk.
            if path.extension().map(|e| e == "part").unwrap_or(false) {
                let _ = fs::remove_file(&path);
                continue;
            }

            let Ok(metadata) = fs::metadata(&path) else {
                continue;
            };
            let size = metadata.len();

            let media_id = path
                .parent()
                .and_then(|p| p.file_name())
                .and_then(|n| n.to_str())
                .map(str::to_string);

            if let Some(media_id) = media_id {
                if size == 0 {
                    let _ = fs::remove_file(&path);
                    continue;
                }
                self.lru.put(
                    media_id,
                    CacheEntry {
                        path,
                        size,
                        verified: true,
                    },
                );
                self.current_size += size;
            }
        }
        Ok(())
    }

    /// Where a descriptor's media file belongs on disk.
    pub fn entry_path(&self, media: &MediaDescriptor) -> PathBuf {
        let stem = sanitize_stem(&media.title);
        let ext = extension_for(media);
        self.cache_dir
            .join(&media.id)
            .join(format!("{}.{}", stem, ext))
    }

    /// True iff a verified entry exists and its file is still on disk.
    pub fn has(&self, media_id: &str) -> bool {
        self.lru
            .peek(media_id)
            .map(|e| e.verified && e.path.exists())
            .unwrap_or(false)
    }

    /// Resolve a media id to its local file, promoting it in LRU order.
    pub fn resolve(&mut self, media_id: &str) -> Option<PathBuf> {
        let entry = self.lru.get(media_id)?;
        if entry.verified && entry.path.exists() {
            Some(entry.path.clone())
        } else {
            None
        }
    }

    /// Record a downloaded file as a verified entry.
    ///
    /// Refuses empty files and videos below the plausible-size floor; refused
    /// files are not recorded and the caller is expected to delete them.
    pub fn put(&mut self, media_id: &str, path: &Path, size: u64, kind: MediaKind) -> Result<()> {
        if size == 0 {
            bail!("refusing to cache empty file for {}", media_id);
        }
        if kind == MediaKind::Video && size < self.video_min_bytes {
            bail!(
                "refusing to cache {}-byte video for {} (floor {})",
                size,
                media_id,
                self.video_min_bytes
            );
        }

        // Re-registering the same id replaces the old entry.
        if let Some(old) = self.lru.pop(media_id) {
            self.current_size = self.current_size.saturating_sub(old.size);
            if old.path != path && old.path.exists() {
                let _ = fs::remove_file(&old.path);
            }
        }

        while self.current_size + size > self.max_size {
            if !self.evict_lru() {
                tracing::warn!("Cache full and cannot evict, continuing anyway");
                break;
            }
        }

        self.lru.put(
            media_id.to_string(),
            CacheEntry {
                path: path.to_path_buf(),
                size,
                verified: true,
            },
        );
        self.current_size += size;

        tracing::debug!(
            "Cached {} ({:.2} KB), total: {:.2} MB",
            media_id,
            size as f64 / 1024.0,
            self.current_size as f64 / 1024.0 / 1024.0
        );

        Ok(())
    }

    /// Drop an entry and delete its file. Used when a cached file later turns
    /// out to be truncated or otherwise bogus.
    pub fn invalidate(&mut self, media_id: &str) {
        if let Some(entry) = self.lru.pop(media_id) {
            tracing::debug!("Invalidating cached entry for {}", media_id);
            remove_entry_file(&entry);
            self.current_size = self.current_size.saturating_sub(entry.size);
        }
    }

    /// Evict the least recently used entry. Returns false when empty.
    fn evict_lru(&mut self) -> bool {
        if let Some((key, entry)) = self.lru.pop_lru() {
            tracing::debug!("Evicting {} ({:?})", key, entry.path);
            remove_entry_file(&entry);
            self.current_size = self.current_size.saturating_sub(entry.size);
            return true;
        }
        false
    }

    /// Remove entries whose media id no longer appears in the playlist.
    pub fn cleanup_orphans(&mut self, playlist: &[MediaDescriptor]) {
        let playlist_ids: std::collections::HashSet<_> =
            playlist.iter().map(|m| m.id.as_str()).collect();

        let orphans: Vec<String> = self
            .lru
            .iter()
            .filter(|(id, _)| !playlist_ids.contains(id.as_str()))
            .map(|(id, _)| id.clone())
            .collect();

        for id in orphans {
            tracing::debug!("Removing orphaned cache entry: {}", id);
            self.invalidate(&id);
        }
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            current_size: self.current_size,
            max_size: self.max_size,
            item_count: self.lru.len(),
        }
    }
}

/// Cache statistics.
#[derive(Debug, Clone)]
pub struct CacheStats {
    pub current_size: u64,
    pub max_size: u64,
    pub item_count: usize,
}

fn remove_entry_file(entry: &CacheEntry) {
    if entry.path.exists() {
        if let Err(e) = fs::remove_file(&entry.path) {
            tracing::warn!("Failed to remove cached file: {}", e);
        }
    }
    // Drop the per-media directory if it is now empty.
    if let Some(parent) = entry.path.parent() {
        let _ = fs::remove_dir(parent);
    }
}

/// Reduce a title to a filesystem-safe filename stem.
fn sanitize_stem(title: &str) -> String {
    let stem: String = title
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    let stem = stem.trim_matches('_').to_string();
    if stem.is_empty() {
        "media".to_string()
    } else {
        stem
    }
}

/// Pick a file extension from the source URL, falling back to a default per
/// kind when the URL (a Drive link, typically) carries none.
fn extension_for(media: &MediaDescriptor) -> String {
    let tail = media
        .source_url
        .rsplit('/')
        .next()
        .unwrap_or("")
        .split('?')
        .next()
        .unwrap_or("");

    if let Some((_, ext)) = tail.rsplit_once('.') {
        if !ext.is_empty() && ext.len() <= 4 && ext.chars().all(|c| c.is_ascii_alphanumeric()) {
            return ext.to_ascii_lowercase();
        }
    }

    match media.kind {
        MediaKind::Image => "jpg".to_string(),
        MediaKind::Video => "mp4".to_string(),
    }
}
