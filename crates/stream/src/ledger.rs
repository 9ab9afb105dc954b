//! Per-stream idempotency ledger for exactly-once producers.
//!
//! Each producer id tracks `(epoch, nextExpectedSeq, lastRange)`. The epoch
//! fences zombie writers; the sequence dedups retries; the last accepted
//! range lets a duplicate replay answer with the original offset.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Ledger state for one producer id. Both counters only ever increase.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProducerRecord {
    pub epoch: u64,
    pub next_expected_seq: u64,
    /// `[start, end)` of the last accepted append, if any this epoch.
    pub last_range: Option<(u64, u64)>,
}

/// All producer records for one stream.
pub type ProducerLedger = HashMap<String, ProducerRecord>;

/// Producer headers accompanying an append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProducerClaim {
    pub epoch: u64,
    pub seq: u64,
}

/// What to do with a producer-qualified append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Stale epoch: reject 403, echoing the ledger's epoch.
    Fenced { current_epoch: u64 },
    /// In-sequence append: commit and advance.
    Accept,
    /// Replay of an already-accepted append: do not commit; answer 204
    /// with the end of the last accepted range.
    Duplicate { end: u64 },
    /// Sequence ran ahead: reject 409 with the expected seq.
    Gap { expected: u64 },
}

/// Apply the fencing/dedup decision table to one append attempt.
///
/// A claim with a higher epoch resets the record (epoch taken, sequence
/// back to zero) before the sequence check runs, so even a rejected
/// attempt under the new epoch fences older writers.
pub fn evaluate(record: &mut ProducerRecord, claim: ProducerClaim) -> Decision {
    if claim.epoch < record.epoch {
        return Decision::Fenced {
            current_epoch: record.epoch,
        };
    }
    if claim.epoch > record.epoch {
        record.epoch = claim.epoch;
        record.next_expected_seq = 0;
        record.last_range = None;
    }
    match claim.seq.cmp(&record.next_expected_seq) {
        std::cmp::Ordering::Equal => Decision::Accept,
        std::cmp::Ordering::Greater => Decision::Gap {
            expected: record.next_expected_seq,
        },
        std::cmp::Ordering::Less => Decision::Duplicate {
            // The record retains only the last accepted range; every
            // seq below nextExpectedSeq answers with its end.
            end: record.last_range.map(|(_, end)| end).unwrap_or(0),
        },
    }
}

/// Record an accepted append of `[start, end)` at `claim`.
pub fn commit(record: &mut ProducerRecord, claim: ProducerClaim, start: u64, end: u64) {
    record.next_expected_seq = claim.seq + 1;
    record.last_range = Some((start, end));
}
