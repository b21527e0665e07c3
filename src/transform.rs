//! # Record Transform Pipeline
//!
//! The per-record transform seam and the pure partitioning function that
//! maps every record to exactly one resource partition.
//!
//! Transforms declare their locking intent per record via [`AccessMode`]
//! and may opt individual records into memoization by supplying a
//! [`Fingerprint`]. Transform state must not be shared across workers;
//! implementations are called concurrently and should be pure with respect
//! to their input record.

use crate::error::EngineError;
use crate::types::{deterministic_hasher, Fingerprint, Record, ResourcePartition, TransformedRecord};
use async_trait::async_trait;
use std::fmt;

/// The lock class a transform needs for a given record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    /// Read-only derivation; holders on the same partition may overlap
    Shared,
    /// A mutation that must not interleave with any other holder
    Exclusive,
}

/// A per-record transform failure, isolated to that record's outcome
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransformError {
    pub message: String,
    pub retryable: bool,
}

impl TransformError {
    /// A transient failure; the record may succeed on a later run
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    /// A permanent failure; retrying this record cannot succeed
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }

    /// Attach the failed record's identity, producing the engine error
    pub fn for_record(self, record_id: &crate::types::RecordId) -> EngineError {
        EngineError::transform_failure(record_id.as_str(), self.message, self.retryable)
    }
}

impl fmt::Display for TransformError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for TransformError {}

/// The transform applied to every fetched record
#[async_trait]
pub trait RecordTransform: Send + Sync {
    /// Produce the transformed copy of a record
    async fn apply(&self, record: &Record) -> Result<TransformedRecord, TransformError>;

    /// Lock class needed while transforming this record (default: Shared)
    fn access_mode(&self, record: &Record) -> AccessMode {
        let _ = record;
        AccessMode::Shared
    }

    /// Cache key for this record's derivation; `None` skips memoization
    /// (the default). Returned fingerprints must be deterministic: equal
    /// inputs, equal keys.
    fn fingerprint(&self, record: &Record) -> Option<Fingerprint> {
        let _ = record;
        None
    }
}

/// Pure mapping from a record to its resource partition
///
/// Partitions must be disjoint and the mapping stable: the same record
/// always lands on the same partition, and lock ordering within that
/// partition is what gives exclusive transforms their total order.
pub trait Partitioner: Send + Sync {
    fn partition_for(&self, record: &Record) -> ResourcePartition;
}

/// Default partitioner: fixed-seed hash of the record id modulo the
/// configured partition count
#[derive(Debug, Clone)]
pub struct KeyHashPartitioner {
    partition_count: u32,
    hasher: ahash::RandomState,
}

impl KeyHashPartitioner {
    pub fn new(partition_count: u32) -> Self {
        Self {
            partition_count: partition_count.max(1),
            hasher: deterministic_hasher(),
        }
    }
}

impl Partitioner for KeyHashPartitioner {
    fn partition_for(&self, record: &Record) -> ResourcePartition {
        let hash = self.hasher.hash_one(record.id.as_str());
        ResourcePartition((hash % u64::from(self.partition_count)) as u32)
    }
}
