//! # Core Data Model
//!
//! The record, batch, and outcome types that flow through the engine.
//!
//! ## Key Invariants
//!
//! - **Record immutability**: a [`Record`] is never mutated after fetch;
//!   transforms produce [`TransformedRecord`] copies.
//! - **Deterministic fingerprints**: equal inputs always hash to equal
//!   [`Fingerprint`] values (fixed-seed hasher, stable within a build).
//! - **Disjoint partitions**: every record maps to exactly one
//!   [`ResourcePartition`] via a pure partitioning function.
//! - **Outcomes are write-once**: an [`Outcome`] is created by a worker or
//!   the batch writer, recorded by the aggregator, and never mutated.

use crate::error::EngineError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Fixed seeds for the engine's deterministic hashers. Fingerprints and
/// partition assignments must not vary between runs of the same build.
const HASH_SEEDS: (u64, u64, u64, u64) = (
    0x5161_7c6b_8f2d_9e41,
    0x93a4_f1e0_27c5_6b88,
    0x0b7d_2e9a_c413_57f6,
    0xe8c2_55d1_7a90_3b24,
);

/// Build the engine's fixed-seed hasher state
pub(crate) fn deterministic_hasher() -> ahash::RandomState {
    ahash::RandomState::with_seeds(HASH_SEEDS.0, HASH_SEEDS.1, HASH_SEEDS.2, HASH_SEEDS.3)
}

/// Stable identity of a record in the backing store
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordId(pub String);

impl RecordId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for RecordId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for RecordId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// An opaque key-value payload with a stable identity, immutable once fetched
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub id: RecordId,
    pub payload: serde_json::Value,
}

impl Record {
    pub fn new(id: impl Into<RecordId>, payload: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            payload,
        }
    }
}

/// A transformed copy of a record, ready for submission to the sink
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransformedRecord {
    pub id: RecordId,
    pub payload: serde_json::Value,
}

impl TransformedRecord {
    pub fn new(id: impl Into<RecordId>, payload: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            payload,
        }
    }
}

/// An ordered, bounded sequence of records produced by the fetcher
///
/// Sequence numbers are assigned monotonically; insertion order within a
/// batch is significant for deterministic retry/replay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordBatch {
    pub sequence: u64,
    pub records: Vec<Record>,
}

impl RecordBatch {
    pub fn new(sequence: u64, records: Vec<Record>) -> Self {
        Self { sequence, records }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Deterministic cache key derived from a record or computation inputs
///
/// Equal inputs yield equal fingerprints (referential transparency): the
/// hash covers the record id and the canonical JSON rendering of the
/// payload, using the engine's fixed-seed hasher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint(pub u64);

impl Fingerprint {
    /// Fingerprint a record by id and canonical payload rendering
    pub fn of_record(record: &Record) -> Self {
        let rendered = record.payload.to_string();
        let hasher = deterministic_hasher();
        Self(hasher.hash_one((record.id.as_str(), rendered.as_str())))
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Disjoint subdivision of the shared resource used as lock granularity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourcePartition(pub u32);

impl fmt::Display for ResourcePartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "partition-{}", self.0)
    }
}

/// Tagged result for a record or batch; created once, never mutated
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The record was transformed and accepted by the sink
    Success(TransformedRecord),
    /// A recoverable failure; a later run may retry this record
    Retryable(EngineError),
    /// A permanent failure; retrying cannot succeed
    Fatal(EngineError),
}

/// An outcome paired with the identity of the record it describes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordOutcome {
    pub record_id: RecordId,
    pub outcome: Outcome,
}

impl RecordOutcome {
    pub fn success(record: TransformedRecord) -> Self {
        Self {
            record_id: record.id.clone(),
            outcome: Outcome::Success(record),
        }
    }

    pub fn retryable(record_id: RecordId, error: EngineError) -> Self {
        Self {
            record_id,
            outcome: Outcome::Retryable(error),
        }
    }

    pub fn fatal(record_id: RecordId, error: EngineError) -> Self {
        Self {
            record_id,
            outcome: Outcome::Fatal(error),
        }
    }
}

/// A permanently failed record and its cause, listed in the run report
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FatalFailure {
    pub record_id: RecordId,
    pub error: String,
}

/// How a run's production side ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunTermination {
    /// The source returned its final page; all fetched records were dispatched
    SourceExhausted,
    /// The source failed mid-run; in-flight work was drained before reporting
    SourceFailed(String),
    /// The run-level cancellation signal fired
    Cancelled,
}

/// Structured summary of a completed (possibly partial) run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub records_fetched: u64,
    pub records_processed: u64,
    pub success_count: u64,
    pub retryable_count: u64,
    pub fatal_count: u64,
    pub fatal_failures: Vec<FatalFailure>,
    pub termination: RunTermination,
}
