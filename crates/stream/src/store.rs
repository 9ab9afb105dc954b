//! In-memory stream storage.
//!
//! Owns all per-stream state: the byte log, offset bookkeeping, the
//! idempotency ledger, and append notifications for long-poll and SSE
//! waiters. The path map is guarded by a read-write lock used only for
//! lookup, create, and delete; each stream's tuple of
//! `(byteLog, nextOffset, idempotency)` is guarded by its own mutex, so
//! appends to different streams never contend. No lock is ever held
//! across an await point.

use std::{collections::HashMap, sync::Arc};

use bytes::Bytes;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::{
    json::{prepare_json_append, JsonBatchError},
    ledger::{self, Decision, ProducerClaim},
    offset::Offset,
    persist::{PersistOp, Persister},
    types::{
        normalize_content_type, EntrySpan, ReadResult, Segment, StreamConfig, StreamLifecycleEvent,
        StreamMeta, StreamState,
    },
};

/// Error types for store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("stream not found: {0}")]
    NotFound(String),

    #[error("stream already exists with content type {existing:?}")]
    ContentTypeConflict { existing: Option<String> },

    #[error("content-type mismatch: stream is {expected}, append is {actual}")]
    AppendContentTypeMismatch { expected: String, actual: String },

    #[error("sequence {received} is not after {last}")]
    SequenceConflict { last: String, received: String },

    #[error("offset {offset} is beyond the stream tail {next_offset}")]
    OffsetBeyondTail { offset: u64, next_offset: u64 },

    #[error("stale epoch {received}, current epoch is {current}")]
    StaleEpoch { current: u64, received: u64 },

    #[error("sequence gap: expected {expected}, received {received}")]
    SequenceGap { expected: u64, received: u64 },

    #[error("empty body not allowed")]
    EmptyBody,

    #[error("cannot specify both TTL and Expires-At")]
    TtlConflict,

    #[error(transparent)]
    Json(#[from] JsonBatchError),
}

/// Notification sent when a stream changes.
#[derive(Debug, Clone)]
pub struct StreamEvent {
    pub path: String,
    pub kind: StreamEventKind,
}

#[derive(Debug, Clone)]
pub enum StreamEventKind {
    /// New bytes were committed; `next_offset` is the tail afterward.
    Appended { next_offset: u64 },
    /// The stream was deleted (explicitly or by expiry). Terminal for
    /// every waiter.
    Deleted,
}

/// Result of a create call.
#[derive(Debug, Clone, Copy)]
pub struct CreateOutcome {
    /// True if a new stream was created, false if one already existed
    /// with the same content type.
    pub created: bool,
    pub next_offset: u64,
}

/// Result of an accepted (or deduplicated) append.
#[derive(Debug, Clone, Copy)]
pub struct AppendOutcome {
    pub next_offset: u64,
    /// True when the append was a producer replay and no bytes moved.
    pub duplicate: bool,
}

type LifecycleHook = Box<dyn Fn(StreamLifecycleEvent) + Send + Sync>;
type StreamSlot = Arc<Mutex<StreamState>>;

/// In-memory stream store with waiter notification.
pub struct StreamStore {
    /// Streams indexed by normalized path.
    streams: RwLock<HashMap<String, StreamSlot>>,
    /// Broadcast channel for append/delete notifications.
    notify_tx: broadcast::Sender<StreamEvent>,
    /// Lifecycle event callback.
    on_lifecycle: Option<LifecycleHook>,
    /// Optional file-backed journal.
    persister: Option<Persister>,
}

impl StreamStore {
    /// Create a new empty in-memory store.
    pub fn new() -> Arc<Self> {
        let (notify_tx, _) = broadcast::channel(1024);
        Arc::new(Self {
            streams: RwLock::new(HashMap::new()),
            notify_tx,
            on_lifecycle: None,
            persister: None,
        })
    }

    /// Create a store with lifecycle callbacks.
    pub fn with_lifecycle<F>(on_lifecycle: F) -> Arc<Self>
    where
        F: Fn(StreamLifecycleEvent) + Send + Sync + 'static,
    {
        let (notify_tx, _) = broadcast::channel(1024);
        Arc::new(Self {
            streams: RwLock::new(HashMap::new()),
            notify_tx,
            on_lifecycle: Some(Box::new(on_lifecycle)),
            persister: None,
        })
    }

    /// Create a store journaling to `persister`, recovering any streams
    /// it already holds.
    pub fn with_persistence(persister: Persister) -> std::io::Result<Arc<Self>> {
        let recovered = persister.load_all()?;
        let (notify_tx, _) = broadcast::channel(1024);
        info!(streams = recovered.len(), "recovered persisted streams");
        let streams = recovered
            .into_iter()
            .map(|(path, state)| (path, Arc::new(Mutex::new(state))))
            .collect();
        Ok(Arc::new(Self {
            streams: RwLock::new(streams),
            notify_tx,
            on_lifecycle: None,
            persister: Some(persister),
        }))
    }

    /// Subscribe to stream change notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<StreamEvent> {
        self.notify_tx.subscribe()
    }

    /// Check if a stream exists (and is not expired).
    pub fn has(&self, path: &str) -> bool {
        self.live(path).is_some()
    }

    /// Number of live streams.
    pub fn len(&self) -> usize {
        let slots: Vec<StreamSlot> = self.streams.read().values().cloned().collect();
        slots.iter().filter(|s| !s.lock().is_expired()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Create a new stream.
    ///
    /// Creation is idempotent on content type: a stream that already
    /// exists with the same content type reports `created: false`, and
    /// any `initial_data` is appended to it as an anonymous append.
    pub fn create(&self, path: &str, config: StreamConfig) -> Result<CreateOutcome, StoreError> {
        if config.ttl_seconds.is_some() && config.expires_at.is_some() {
            return Err(StoreError::TtlConflict);
        }

        // Fast path: the stream already exists.
        if let Some(slot) = self.live(path) {
            let mut stream = slot.lock();
            let existing_ct = stream.content_type.as_deref().map(normalize_content_type);
            let new_ct = config.content_type.as_deref().map(normalize_content_type);
            if existing_ct != new_ct {
                return Err(StoreError::ContentTypeConflict {
                    existing: stream.content_type.clone(),
                });
            }
            let mut next_offset = stream.next_offset;
            if let Some(data) = config.initial_data {
                if !data.is_empty() {
                    let (data, boundaries) = Self::prepare_commit(&stream, data)?;
                    next_offset = self.commit_prepared(&mut stream, data, boundaries);
                    drop(stream);
                    self.notify(path, next_offset);
                }
            }
            return Ok(CreateOutcome {
                created: false,
                next_offset,
            });
        }

        let mut stream = StreamState::new(path.to_string());
        stream.content_type = config.content_type.clone();
        stream.ttl_seconds = config.ttl_seconds;
        stream.expires_at = config.expires_at;

        let prepared = match &config.initial_data {
            Some(data) if !data.is_empty() => Some(Self::prepare_commit(&stream, data.clone())?),
            _ => None,
        };

        {
            let mut streams = self.streams.write();
            if let Some(racing) = streams.get(path) {
                // Lost a create race; retry against the winner unless it
                // is itself already expired.
                if !racing.lock().is_expired() {
                    drop(streams);
                    return self.create(path, config);
                }
                streams.remove(path);
                self.after_remove(path);
            }

            self.record(PersistOp::Create {
                path: path.to_string(),
                content_type: stream.content_type.clone(),
                ttl_seconds: stream.ttl_seconds,
                expires_at: stream.expires_at,
                created_at: stream.created_at,
            });
            let next_offset = match prepared {
                Some((data, boundaries)) => self.commit_prepared(&mut stream, data, boundaries),
                None => 0,
            };
            streams.insert(path.to_string(), Arc::new(Mutex::new(stream)));

            info!(path = %path, "created stream");
            self.emit_lifecycle(StreamLifecycleEvent::Created {
                path: path.to_string(),
                content_type: config.content_type,
                timestamp: Utc::now().timestamp_millis(),
            });

            Ok(CreateOutcome {
                created: true,
                next_offset,
            })
        }
    }

    /// Stream metadata, or None if absent/expired.
    pub fn head(&self, path: &str) -> Option<StreamMeta> {
        let slot = self.live(path)?;
        let stream = slot.lock();
        Some(StreamMeta {
            content_type: stream.content_type.clone(),
            next_offset: stream.next_offset,
            ttl_seconds: stream.ttl_seconds,
            expires_at: stream.expires_at,
        })
    }

    /// Delete a stream, waking all waiters with a terminal signal.
    pub fn delete(&self, path: &str) -> bool {
        let removed = self.streams.write().remove(path).is_some();
        if removed {
            info!(path = %path, "deleted stream");
            self.after_remove(path);
        }
        removed
    }

    /// Append data to a stream.
    ///
    /// `producer` carries the `Producer-Id/Epoch/Seq` triple when the
    /// append is producer-qualified; `seq` is the weak `Stream-Seq`
    /// ordering token used by non-idempotent writers.
    pub fn append(
        &self,
        path: &str,
        data: Bytes,
        content_type: Option<&str>,
        seq: Option<&str>,
        producer: Option<(&str, ProducerClaim)>,
    ) -> Result<AppendOutcome, StoreError> {
        if data.is_empty() {
            return Err(StoreError::EmptyBody);
        }

        let slot = self
            .live(path)
            .ok_or_else(|| StoreError::NotFound(path.to_string()))?;
        let mut stream = slot.lock();

        if let (Some(ct), Some(stream_ct)) = (content_type, stream.content_type.as_deref()) {
            if normalize_content_type(ct) != normalize_content_type(stream_ct) {
                return Err(StoreError::AppendContentTypeMismatch {
                    expected: stream_ct.to_string(),
                    actual: ct.to_string(),
                });
            }
        }

        // Validate and shape the body before the ledger sees it, so a
        // malformed batch cannot claim an epoch or advance a sequence.
        let (data, boundaries) = Self::prepare_commit(&stream, data)?;

        if let Some((id, claim)) = producer {
            let record = stream.producers.entry(id.to_string()).or_default();
            let before = record.clone();
            match ledger::evaluate(record, claim) {
                Decision::Fenced { current_epoch } => {
                    return Err(StoreError::StaleEpoch {
                        current: current_epoch,
                        received: claim.epoch,
                    });
                }
                Decision::Gap { expected } => {
                    let changed = *record != before;
                    let record = record.clone();
                    if changed {
                        // The epoch was claimed even though this append
                        // was rejected; journal the fence.
                        self.record(PersistOp::Ledger {
                            path: path.to_string(),
                            producer_id: id.to_string(),
                            record,
                        });
                    }
                    return Err(StoreError::SequenceGap {
                        expected,
                        received: claim.seq,
                    });
                }
                Decision::Duplicate { end } => {
                    debug!(path = %path, producer = %id, seq = claim.seq, "duplicate append");
                    return Ok(AppendOutcome {
                        next_offset: end,
                        duplicate: true,
                    });
                }
                Decision::Accept => {
                    let start = stream.next_offset;
                    let next_offset = self.commit_prepared(&mut stream, data, boundaries);
                    let record = stream
                        .producers
                        .get_mut(id)
                        .expect("record inserted above");
                    ledger::commit(record, claim, start, next_offset);
                    let record = record.clone();
                    self.record(PersistOp::Ledger {
                        path: path.to_string(),
                        producer_id: id.to_string(),
                        record,
                    });
                    drop(stream);
                    self.notify(path, next_offset);
                    return Ok(AppendOutcome {
                        next_offset,
                        duplicate: false,
                    });
                }
            }
        }

        // Weak ordering mode: an opaque token that must strictly increase.
        if let Some(s) = seq {
            if let Some(last) = stream.last_seq.as_deref() {
                if s <= last {
                    return Err(StoreError::SequenceConflict {
                        last: last.to_string(),
                        received: s.to_string(),
                    });
                }
            }
            stream.last_seq = Some(s.to_string());
        }

        let next_offset = self.commit_prepared(&mut stream, data, boundaries);
        drop(stream);
        self.notify(path, next_offset);
        Ok(AppendOutcome {
            next_offset,
            duplicate: false,
        })
    }

    /// Read committed bytes from `offset` to the tail.
    pub fn read(&self, path: &str, offset: &Offset) -> Result<ReadResult, StoreError> {
        let slot = self
            .live(path)
            .ok_or_else(|| StoreError::NotFound(path.to_string()))?;
        let stream = slot.lock();

        let from = offset.resolve(stream.next_offset);
        if from > stream.next_offset {
            return Err(StoreError::OffsetBeyondTail {
                offset: from,
                next_offset: stream.next_offset,
            });
        }

        Ok(ReadResult {
            bytes: stream.slice_from(from),
            entries: stream.entries_from(from),
            next_offset: stream.next_offset,
            up_to_date: true,
        })
    }

    /// Current tail offset of a stream.
    pub fn next_offset(&self, path: &str) -> Option<u64> {
        self.live(path).map(|slot| slot.lock().next_offset)
    }

    /// Content type of a stream.
    pub fn content_type(&self, path: &str) -> Option<String> {
        self.live(path).and_then(|slot| slot.lock().content_type.clone())
    }

    /// Remove every expired stream, waking its waiters. Returns the
    /// removed paths.
    pub fn sweep_expired(&self) -> Vec<String> {
        let snapshot: Vec<(String, StreamSlot)> = {
            let streams = self.streams.read();
            streams
                .iter()
                .map(|(path, slot)| (path.clone(), slot.clone()))
                .collect()
        };

        let mut removed = Vec::new();
        for (path, slot) in snapshot {
            // Evaluate expiry in its own statement: the stream lock must
            // be released before the map lock is taken for removal.
            let expired = slot.lock().is_expired();
            if expired && self.remove_if_same(&path, &slot) {
                removed.push(path);
            }
        }
        removed
    }

    /// List all non-expired stream paths.
    pub fn list(&self) -> Vec<String> {
        let snapshot: Vec<(String, StreamSlot)> = {
            let streams = self.streams.read();
            streams
                .iter()
                .map(|(path, slot)| (path.clone(), slot.clone()))
                .collect()
        };
        snapshot
            .into_iter()
            .filter(|(_, slot)| !slot.lock().is_expired())
            .map(|(path, _)| path)
            .collect()
    }

    /// Drop all streams without journaling deletes.
    pub fn clear(&self) {
        self.streams.write().clear();
    }

    /// Block until all journaled operations have reached disk.
    pub fn flush_persistence(&self) {
        if let Some(persister) = &self.persister {
            persister.flush();
        }
    }

    /// Look up a stream, lazily removing it if expired.
    fn live(&self, path: &str) -> Option<StreamSlot> {
        let slot = self.streams.read().get(path).cloned()?;
        if slot.lock().is_expired() {
            self.remove_if_same(path, &slot);
            return None;
        }
        Some(slot)
    }

    /// Remove `path` only while it still maps to `expected`, so a
    /// concurrently re-created stream is never torn down by a stale
    /// expiry observation.
    fn remove_if_same(&self, path: &str, expected: &StreamSlot) -> bool {
        let mut streams = self.streams.write();
        match streams.get(path) {
            Some(current) if Arc::ptr_eq(current, expected) => {
                streams.remove(path);
                drop(streams);
                info!(path = %path, "deleted stream");
                self.after_remove(path);
                true
            }
            _ => false,
        }
    }

    /// Validate and shape an append body for `stream`. For JSON streams
    /// the body is validated and arrays are flattened one level. Runs
    /// before the ledger or the journal see the append, so a rejected
    /// body leaves no trace.
    fn prepare_commit(
        stream: &StreamState,
        data: Bytes,
    ) -> Result<(Bytes, Vec<(usize, usize)>), StoreError> {
        if stream.is_json() {
            let batch = prepare_json_append(&data)?;
            Ok((batch.data, batch.boundaries))
        } else {
            let len = data.len();
            Ok((data, vec![(0, len)]))
        }
    }

    /// Commit a prepared body under the stream's lock.
    fn commit_prepared(
        &self,
        stream: &mut StreamState,
        data: Bytes,
        boundaries: Vec<(usize, usize)>,
    ) -> u64 {
        let start = stream.next_offset;
        let entries: Vec<EntrySpan> = boundaries
            .iter()
            .map(|&(off, len)| EntrySpan {
                start: start + off as u64,
                len: len as u64,
            })
            .collect();

        stream.segments.push(Segment {
            start,
            data: data.clone(),
        });
        stream.entries.extend_from_slice(&entries);
        stream.next_offset = start + data.len() as u64;

        self.record(PersistOp::Append {
            path: stream.path.clone(),
            data,
            entries,
        });

        debug!(path = %stream.path, next_offset = stream.next_offset, "appended");
        stream.next_offset
    }

    /// Journal, notify, and fire hooks after a map entry is gone.
    fn after_remove(&self, path: &str) {
        self.record(PersistOp::Delete {
            path: path.to_string(),
        });
        let _ = self.notify_tx.send(StreamEvent {
            path: path.to_string(),
            kind: StreamEventKind::Deleted,
        });
        self.emit_lifecycle(StreamLifecycleEvent::Deleted {
            path: path.to_string(),
            timestamp: Utc::now().timestamp_millis(),
        });
    }

    fn notify(&self, path: &str, next_offset: u64) {
        let _ = self.notify_tx.send(StreamEvent {
            path: path.to_string(),
            kind: StreamEventKind::Appended { next_offset },
        });
    }

    fn record(&self, op: PersistOp) {
        if let Some(persister) = &self.persister {
            persister.record(op);
        }
    }

    fn emit_lifecycle(&self, event: StreamLifecycleEvent) {
        if let Some(callback) = &self.on_lifecycle {
            callback(event);
        }
    }
}
