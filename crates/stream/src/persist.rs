//! File-backed persistence.
//!
//! Each stream journals to one file of JSON-line records under the data
//! directory. Appends are handed to a dedicated flusher thread over a
//! channel, so the store's critical section never touches disk while
//! the channel order preserves commit order. Recovery replays each
//! journal into a `StreamState`.

use std::{
    collections::HashMap,
    fs,
    io::{BufRead, BufReader, Write},
    path::{Path, PathBuf},
    sync::mpsc,
    thread,
};

use base64::{engine::general_purpose::STANDARD, Engine};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::{
    ledger::ProducerRecord,
    types::{EntrySpan, Segment, StreamState},
};

/// Longest slug prefix carried in a journal file name.
const SLUG_MAX: usize = 96;

/// Filesystem name for a stream's journal: a readable slug of the path
/// plus a digest of the full path for uniqueness. Not reversible; the
/// journal's create record carries the original path.
fn journal_name(path: &str) -> String {
    let digest = Sha256::digest(path.as_bytes());
    let hash = hex::encode(&digest[..8]);
    let slug: String = path
        .trim_start_matches('/')
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .take(SLUG_MAX)
        .collect();
    if slug.is_empty() {
        format!("{}.log", hash)
    } else {
        format!("{}-{}.log", slug, hash)
    }
}

/// A journaled state change.
#[derive(Debug, Clone)]
pub enum PersistOp {
    Create {
        path: String,
        content_type: Option<String>,
        ttl_seconds: Option<u64>,
        expires_at: Option<DateTime<Utc>>,
        created_at: DateTime<Utc>,
    },
    Append {
        path: String,
        data: Bytes,
        entries: Vec<EntrySpan>,
    },
    Ledger {
        path: String,
        producer_id: String,
        record: ProducerRecord,
    },
    Delete {
        path: String,
    },
}

/// On-disk record format. Version-prefixed so the layout can evolve.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum JournalRecord {
    Create {
        v: u8,
        path: String,
        content_type: Option<String>,
        ttl_seconds: Option<u64>,
        expires_at: Option<DateTime<Utc>>,
        created_at: DateTime<Utc>,
    },
    Append {
        data: String,
        entries: Vec<EntrySpan>,
    },
    Ledger {
        producer_id: String,
        record: ProducerRecord,
    },
}

enum Message {
    Op(PersistOp),
    Flush(mpsc::SyncSender<()>),
}

/// Handle for journaling store mutations.
pub struct Persister {
    dir: PathBuf,
    tx: mpsc::Sender<Message>,
}

impl Persister {
    /// Open (creating if needed) a data directory and start the flusher.
    pub fn open(dir: impl Into<PathBuf>) -> std::io::Result<Persister> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let (tx, rx) = mpsc::channel::<Message>();
        let flush_dir = dir.clone();
        thread::Builder::new()
            .name("stream-persist".to_string())
            .spawn(move || flusher(flush_dir, rx))?;
        Ok(Persister { dir, tx })
    }

    /// Queue an operation for the flusher. Ops are applied in send
    /// order, which under the store lock is commit order.
    pub fn record(&self, op: PersistOp) {
        if self.tx.send(Message::Op(op)).is_err() {
            warn!("persistence flusher is gone; journaling disabled");
        }
    }

    /// Block until every queued operation has been applied.
    pub fn flush(&self) {
        let (ack_tx, ack_rx) = mpsc::sync_channel(1);
        if self.tx.send(Message::Flush(ack_tx)).is_ok() {
            let _ = ack_rx.recv();
        }
    }

    /// Replay every journal in the data directory.
    pub fn load_all(&self) -> std::io::Result<HashMap<String, StreamState>> {
        let mut streams = HashMap::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let file_path = entry.path();
            if file_path.extension().and_then(|e| e.to_str()) != Some("log") {
                continue;
            }
            match load_journal(&file_path) {
                Ok(Some(stream)) => {
                    streams.insert(stream.path.clone(), stream);
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(file = %file_path.display(), error = %err, "skipping unreadable journal");
                }
            }
        }
        Ok(streams)
    }

    fn journal_path(dir: &Path, stream_path: &str) -> PathBuf {
        dir.join(journal_name(stream_path))
    }
}

fn flusher(dir: PathBuf, rx: mpsc::Receiver<Message>) {
    while let Ok(message) = rx.recv() {
        match message {
            Message::Op(op) => {
                if let Err(err) = apply(&dir, &op) {
                    warn!(error = %err, "failed to journal stream operation");
                }
            }
            Message::Flush(ack) => {
                let _ = ack.send(());
            }
        }
    }
    debug!("persistence flusher stopped");
}

fn apply(dir: &Path, op: &PersistOp) -> std::io::Result<()> {
    match op {
        PersistOp::Create {
            path,
            content_type,
            ttl_seconds,
            expires_at,
            created_at,
        } => {
            // Truncate: re-creation after delete starts a fresh log.
            let mut file = fs::File::create(Persister::journal_path(dir, path))?;
            write_record(
                &mut file,
                &JournalRecord::Create {
                    v: 1,
                    path: path.clone(),
                    content_type: content_type.clone(),
                    ttl_seconds: *ttl_seconds,
                    expires_at: *expires_at,
                    created_at: *created_at,
                },
            )
        }
        PersistOp::Append {
            path,
            data,
            entries,
        } => {
            let mut file = fs::OpenOptions::new()
                .append(true)
                .create(true)
                .open(Persister::journal_path(dir, path))?;
            write_record(
                &mut file,
                &JournalRecord::Append {
                    data: STANDARD.encode(data),
                    entries: entries.clone(),
                },
            )
        }
        PersistOp::Ledger {
            path,
            producer_id,
            record,
        } => {
            let mut file = fs::OpenOptions::new()
                .append(true)
                .create(true)
                .open(Persister::journal_path(dir, path))?;
            write_record(
                &mut file,
                &JournalRecord::Ledger {
                    producer_id: producer_id.clone(),
                    record: record.clone(),
                },
            )
        }
        PersistOp::Delete { path } => {
            let journal = Persister::journal_path(dir, path);
            match fs::remove_file(journal) {
                Ok(()) => Ok(()),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(err) => Err(err),
            }
        }
    }
}

fn write_record(file: &mut fs::File, record: &JournalRecord) -> std::io::Result<()> {
    let mut line = serde_json::to_vec(record)?;
    line.push(b'\n');
    file.write_all(&line)
}

fn load_journal(file_path: &Path) -> std::io::Result<Option<StreamState>> {
    let file = fs::File::open(file_path)?;
    let reader = BufReader::new(file);
    let mut stream: Option<StreamState> = None;

    for line in reader.lines() {
        let line = line?;
        if line.is_empty() {
            continue;
        }
        let record: JournalRecord = match serde_json::from_str(&line) {
            Ok(r) => r,
            Err(err) => {
                // A torn tail write loses at most the final record.
                warn!(file = %file_path.display(), error = %err, "stopping at corrupt journal record");
                break;
            }
        };
        match record {
            JournalRecord::Create {
                path,
                content_type,
                ttl_seconds,
                expires_at,
                created_at,
                ..
            } => {
                let mut state = StreamState::new(path);
                state.content_type = content_type;
                state.ttl_seconds = ttl_seconds;
                state.expires_at = expires_at;
                state.created_at = created_at;
                stream = Some(state);
            }
            JournalRecord::Append { data, entries } => {
                let Some(state) = stream.as_mut() else {
                    continue;
                };
                let Ok(bytes) = STANDARD.decode(&data) else {
                    warn!(file = %file_path.display(), "stopping at undecodable append record");
                    break;
                };
                let start = state.next_offset;
                state.next_offset = start + bytes.len() as u64;
                state.segments.push(Segment {
                    start,
                    data: Bytes::from(bytes),
                });
                state.entries.extend(entries);
            }
            JournalRecord::Ledger {
                producer_id,
                record,
            } => {
                if let Some(state) = stream.as_mut() {
                    state.producers.insert(producer_id, record);
                }
            }
        }
    }

    Ok(stream)
}
