//! Media data model shared by every component.
//!
//! The manifest vocabulary: raw sheet rows, validated media descriptors,
//! immutable playlist snapshots, and the view-log record shape.

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Kind of a playable item. Drives both download verification and playback
/// advancement: images run on a fixed display timer, videos advance on the
/// surface's end-of-stream signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Video,
}

impl MediaKind {
    /// Parse a manifest kind cell, case-insensitively. Unrecognized values
    /// make the whole row invalid.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "image" => Some(MediaKind::Image),
            "video" => Some(MediaKind::Video),
            _ => None,
        }
    }
}

/// One raw manifest row as fetched, before validation.
///
/// Column order follows the sheet: ordinal, content id, device id, title,
/// link, kind. Cells arrive as loosely typed JSON values and may be missing.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawRow {
    pub order: Option<Value>,
    pub content_id: Option<Value>,
    pub tv_id: Option<Value>,
    pub title: Option<Value>,
    pub url: Option<Value>,
    pub kind: Option<Value>,
}

impl RawRow {
    /// Build a row from positional gviz cells. Short rows are padded with
    /// missing cells and fail validation later instead of panicking.
    pub fn from_cells(mut cells: Vec<Option<Value>>) -> Self {
        cells.resize(6, None);
        let mut it = cells.into_iter();
        Self {
            order: it.next().flatten(),
            content_id: it.next().flatten(),
            tv_id: it.next().flatten(),
            title: it.next().flatten(),
            url: it.next().flatten(),
            kind: it.next().flatten(),
        }
    }
}

/// Coerce a loosely typed sheet cell to trimmed text. Integral numbers lose
/// their trailing `.0` so numeric ids compare equal to their string form.
pub fn cell_text(cell: &Option<Value>) -> Option<String> {
    match cell {
        Some(Value::String(s)) => {
            let s = s.trim();
            (!s.is_empty()).then(|| s.to_string())
        }
        Some(Value::Number(n)) => {
            if let Some(f) = n.as_f64() {
                if f.fract() == 0.0 {
                    return Some(format!("{}", f as i64));
                }
            }
            Some(n.to_string())
        }
        _ => None,
    }
}

/// A validated, playable manifest entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaDescriptor {
    /// Stable unique key; cache key and log content id.
    pub id: String,
    /// Human label, also the local filename stem.
    pub title: String,
    /// Remote location; may be a Drive share link needing transformation.
    pub source_url: String,
    pub kind: MediaKind,
    /// Device/screen this item belongs to.
    pub owner_scope: String,
    /// Sheet ordinal used for stable playlist ordering.
    pub order: i64,
}

impl MediaDescriptor {
    /// Validate a raw row. Returns `None` for rows with missing url, title or
    /// scope, or an unrecognized kind; callers drop those silently.
    pub fn from_row(row: &RawRow) -> Option<Self> {
        let id = cell_text(&row.content_id)?;
        let title = cell_text(&row.title)?;
        let source_url = cell_text(&row.url)?;
        let owner_scope = cell_text(&row.tv_id)?;
        let kind = MediaKind::parse(&cell_text(&row.kind)?)?;
        let order = cell_text(&row.order)
            .and_then(|s| s.parse::<i64>().ok())
            .unwrap_or(0);

        Some(Self {
            id,
            title,
            source_url,
            kind,
            owner_scope,
            order,
        })
    }

    pub fn is_video(&self) -> bool {
        self.kind == MediaKind::Video
    }
}

/// Immutable ordered playlist captured at one sync point. Superseded, never
/// mutated; the playback engine swaps to a new snapshot between items.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlaylistSnapshot {
    /// Device scope this snapshot was fetched for.
    pub scope: String,
    pub items: Vec<MediaDescriptor>,
}

impl PlaylistSnapshot {
    pub fn new(scope: String, items: Vec<MediaDescriptor>) -> Self {
        Self { scope, items }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&MediaDescriptor> {
        self.items.get(index)
    }
}

/// One playback view, in the column layout the log sheet expects. Immutable
/// once constructed; handed to the view logger and forgotten.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ViewLogRecord {
    pub tv_id: String,
    pub content_id: String,
    pub timestamp_start: String,
    pub timestamp_end: String,
    pub date: String,
}

impl ViewLogRecord {
    pub fn new(
        device_id: &str,
        media_id: &str,
        start: DateTime<Local>,
        end: DateTime<Local>,
    ) -> Self {
        Self {
            tv_id: device_id.to_string(),
            content_id: media_id.to_string(),
            timestamp_start: start.format("%I:%M:%S %p").to_string(),
            timestamp_end: end.format("%I:%M:%S %p").to_string(),
            date: start.format("%d/%m/%Y").to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(cells: Vec<Value>) -> RawRow {
        RawRow::from_cells(cells.into_iter().map(Some).collect())
    }

    #[test]
    fn kind_parses_case_insensitively() {
        assert_eq!(MediaKind::parse("Image"), Some(MediaKind::Image));
        assert_eq!(MediaKind::parse("VIDEO"), Some(MediaKind::Video));
        assert_eq!(MediaKind::parse(" video "), Some(MediaKind::Video));
        assert_eq!(MediaKind::parse("gif"), None);
        assert_eq!(MediaKind::parse(""), None);
    }

    #[test]
    fn numeric_cells_coerce_to_clean_strings() {
        assert_eq!(cell_text(&Some(json!(123.0))), Some("123".into()));
        assert_eq!(cell_text(&Some(json!("  42 "))), Some("42".into()));
        assert_eq!(cell_text(&Some(json!(""))), None);
        assert_eq!(cell_text(&None), None);
        assert_eq!(cell_text(&Some(Value::Null)), None);
    }

    #[test]
    fn valid_row_becomes_descriptor() {
        let r = row(vec![
            json!(7),
            json!(101),
            json!("tv-3"),
            json!("Lobby Promo"),
            json!("https://example.com/promo.mp4"),
            json!("Video"),
        ]);
        let d = MediaDescriptor::from_row(&r).expect("valid row");
        assert_eq!(d.id, "101");
        assert_eq!(d.title, "Lobby Promo");
        assert_eq!(d.owner_scope, "tv-3");
        assert_eq!(d.kind, MediaKind::Video);
        assert_eq!(d.order, 7);
    }

    #[test]
    fn rows_with_missing_columns_are_rejected() {
        // No url.
        let r = row(vec![json!(1), json!(2), json!(3), json!("t")]);
        assert!(MediaDescriptor::from_row(&r).is_none());

        // Unknown kind.
        let r = row(vec![
            json!(1),
            json!(2),
            json!(3),
            json!("t"),
            json!("https://x/y.jpg"),
            json!("slideshow"),
        ]);
        assert!(MediaDescriptor::from_row(&r).is_none());
    }

    #[test]
    fn view_log_record_uses_sheet_column_names() {
        let start = Local::now();
        let rec = ViewLogRecord::new("tv-1", "42", start, start);
        let json = serde_json::to_value(&rec).unwrap();
        assert!(json.get("tv_id").is_some());
        assert!(json.get("content_id").is_some());
        assert!(json.get("timestamp_start").is_some());
        assert!(json.get("date").is_some());
    }
}
