//! Core types for the durable streams server.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ledger::ProducerLedger;

/// A contiguous run of bytes committed by one append.
#[derive(Debug, Clone)]
pub struct Segment {
    /// Byte offset of the first byte of this segment in the log.
    pub start: u64,
    /// Raw bytes, stored exactly as committed.
    pub data: Bytes,
}

impl Segment {
    /// Offset one past the last byte of this segment.
    pub fn end(&self) -> u64 {
        self.start + self.data.len() as u64
    }
}

/// Boundary of one delivery unit within the log: a whole append body, or for
/// JSON streams one top-level value. SSE `data` events never split one of
/// these and never join two.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntrySpan {
    pub start: u64,
    pub len: u64,
}

impl EntrySpan {
    pub fn end(&self) -> u64 {
        self.start + self.len
    }
}

/// Per-stream state. Guarded by the store's lock; never shared outside it.
#[derive(Debug, Clone)]
pub struct StreamState {
    /// Normalized URL path identifying the stream.
    pub path: String,
    /// MIME type, immutable after creation.
    pub content_type: Option<String>,
    /// Committed byte log, in append order. Segments are contiguous:
    /// `segments[i].end() == segments[i+1].start` and the first starts at 0.
    pub segments: Vec<Segment>,
    /// Delivery-unit boundaries within the log.
    pub entries: Vec<EntrySpan>,
    /// Offset one past the last committed byte.
    pub next_offset: u64,
    /// Last accepted `Stream-Seq` token (weak writer-ordering mode).
    pub last_seq: Option<String>,
    /// Idempotency state per producer id.
    pub producers: ProducerLedger,
    /// Relative TTL in seconds.
    pub ttl_seconds: Option<u64>,
    /// Absolute expiry.
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl StreamState {
    pub fn new(path: String) -> Self {
        Self {
            path,
            content_type: None,
            segments: Vec::new(),
            entries: Vec::new(),
            next_offset: 0,
            last_seq: None,
            producers: ProducerLedger::default(),
            ttl_seconds: None,
            expires_at: None,
            created_at: Utc::now(),
        }
    }

    /// Check if the stream has expired.
    pub fn is_expired(&self) -> bool {
        if let Some(expires_at) = self.expires_at {
            return Utc::now() >= expires_at;
        }
        if let Some(ttl_seconds) = self.ttl_seconds {
            let expiry = self.created_at + chrono::Duration::seconds(ttl_seconds as i64);
            return Utc::now() >= expiry;
        }
        false
    }

    /// Check if this stream uses JSON-batch semantics.
    pub fn is_json(&self) -> bool {
        self.content_type
            .as_ref()
            .map(|ct| normalize_content_type(ct).starts_with("application/json"))
            .unwrap_or(false)
    }

    /// Copy the committed bytes in `[from, next_offset)`.
    pub fn slice_from(&self, from: u64) -> Bytes {
        self.slice_range(from, self.next_offset)
    }

    /// Delivery units at or after `from`. A unit that straddles `from` is
    /// truncated so only unseen bytes are delivered.
    pub fn entries_from(&self, from: u64) -> Vec<(Bytes, u64)> {
        let mut out = Vec::new();
        for span in &self.entries {
            if span.end() <= from {
                continue;
            }
            let begin = span.start.max(from);
            out.push((self.slice_range(begin, span.end()), span.end()));
        }
        out
    }

    fn slice_range(&self, from: u64, to: u64) -> Bytes {
        let mut out = Vec::with_capacity(to.saturating_sub(from) as usize);
        for seg in &self.segments {
            if seg.end() <= from || seg.start >= to {
                continue;
            }
            let skip = from.saturating_sub(seg.start) as usize;
            let take = (to.min(seg.end()) - seg.start) as usize;
            out.extend_from_slice(&seg.data[skip..take]);
        }
        Bytes::from(out)
    }
}

/// Metadata snapshot returned by HEAD.
#[derive(Debug, Clone)]
pub struct StreamMeta {
    pub content_type: Option<String>,
    pub next_offset: u64,
    pub ttl_seconds: Option<u64>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Stream lifecycle event for embedder hooks.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamLifecycleEvent {
    Created {
        path: String,
        content_type: Option<String>,
        timestamp: i64,
    },
    Deleted {
        path: String,
        timestamp: i64,
    },
}

/// Configuration for creating a stream.
#[derive(Debug, Clone, Default)]
pub struct StreamConfig {
    pub content_type: Option<String>,
    pub ttl_seconds: Option<u64>,
    pub expires_at: Option<DateTime<Utc>>,
    pub initial_data: Option<Bytes>,
}

/// Result of a catch-up read.
#[derive(Debug, Clone)]
pub struct ReadResult {
    /// Bytes in `[requested offset, next_offset)`.
    pub bytes: Bytes,
    /// Delivery units covering the same range, for SSE framing.
    pub entries: Vec<(Bytes, u64)>,
    /// Offset after the last byte delivered.
    pub next_offset: u64,
    /// True when the delivered upper bound equals the tail at compose time.
    pub up_to_date: bool,
}

/// Server configuration options.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Port to listen on (0 for auto-assign).
    pub port: u16,
    /// Host to bind to.
    pub host: String,
    /// Long-poll timeout in milliseconds. Kept below common client read
    /// timeouts (~30 s).
    pub long_poll_timeout_ms: u64,
    /// Data directory for file-backed storage (None for in-memory).
    pub data_dir: Option<String>,
    /// Enable response compression on catch-up reads.
    pub compression: bool,
    /// Cursor interval in seconds.
    pub cursor_interval_seconds: u64,
    /// Cursor epoch for interval calculation.
    pub cursor_epoch: DateTime<Utc>,
    /// TTL sweep interval in milliseconds.
    pub sweep_interval_ms: u64,
    /// Largest accepted append body, in bytes.
    pub max_append_bytes: usize,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            port: 4437,
            host: "127.0.0.1".to_string(),
            long_poll_timeout_ms: 20_000,
            data_dir: None,
            compression: true,
            cursor_interval_seconds: 20,
            // October 9, 2024 as default epoch
            cursor_epoch: DateTime::parse_from_rfc3339("2024-10-09T00:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
            sweep_interval_ms: 1_000,
            max_append_bytes: 16 * 1024 * 1024,
        }
    }
}

/// Normalize a content type by stripping charset and parameters.
pub fn normalize_content_type(content_type: &str) -> &str {
    content_type
        .split(';')
        .next()
        .unwrap_or(content_type)
        .trim()
}

/// Normalize a stream URL path: leading slash, no trailing slash except
/// root, no duplicate slashes.
pub fn normalize_path(path: &str) -> String {
    let mut out = String::with_capacity(path.len() + 1);
    for part in path.split('/').filter(|p| !p.is_empty()) {
        out.push('/');
        out.push_str(part);
    }
    if out.is_empty() {
        out.push('/');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream_with(bodies: &[&[u8]]) -> StreamState {
        let mut s = StreamState::new("/t".to_string());
        for body in bodies {
            let start = s.next_offset;
            s.segments.push(Segment {
                start,
                data: Bytes::copy_from_slice(body),
            });
            s.entries.push(EntrySpan {
                start,
                len: body.len() as u64,
            });
            s.next_offset = start + body.len() as u64;
        }
        s
    }

    #[test]
    fn slice_from_is_byte_exact() {
        let s = stream_with(&[b"hello", b"world"]);
        assert_eq!(s.slice_from(0), Bytes::from_static(b"helloworld"));
        assert_eq!(s.slice_from(5), Bytes::from_static(b"world"));
        assert_eq!(s.slice_from(7), Bytes::from_static(b"rld"));
        assert_eq!(s.slice_from(10), Bytes::new());
    }

    #[test]
    fn entries_from_respects_boundaries() {
        let s = stream_with(&[b"hello", b"world"]);
        let entries = s.entries_from(0);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0], (Bytes::from_static(b"hello"), 5));
        assert_eq!(entries[1], (Bytes::from_static(b"world"), 10));

        // Mid-entry offset truncates the straddling unit.
        let entries = s.entries_from(7);
        assert_eq!(entries, vec![(Bytes::from_static(b"rld"), 10)]);
    }

    #[test]
    fn expiry_from_ttl() {
        let mut s = StreamState::new("/t".to_string());
        assert!(!s.is_expired());
        s.ttl_seconds = Some(0);
        assert!(s.is_expired());
    }

    #[test]
    fn expiry_from_absolute() {
        let mut s = StreamState::new("/t".to_string());
        s.expires_at = Some(Utc::now() - chrono::Duration::seconds(1));
        assert!(s.is_expired());
    }

    #[test]
    fn json_detection_includes_parameters() {
        let mut s = StreamState::new("/t".to_string());
        s.content_type = Some("application/json; charset=utf-8".to_string());
        assert!(s.is_json());
        s.content_type = Some("text/plain".to_string());
        assert!(!s.is_json());
    }

    #[test]
    fn normalizes_paths() {
        assert_eq!(normalize_path("a/b"), "/a/b");
        assert_eq!(normalize_path("/a//b/"), "/a/b");
        assert_eq!(normalize_path(""), "/");
    }

    #[test]
    fn normalizes_content_types() {
        assert_eq!(
            normalize_content_type("application/json; charset=utf-8"),
            "application/json"
        );
        assert_eq!(normalize_content_type("text/plain"), "text/plain");
    }
}
