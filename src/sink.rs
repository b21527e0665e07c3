//! # Sink Interface
//!
//! The transactional write interface to the external sink. Batch
//! submissions are assumed all-or-nothing; sinks that cannot guarantee
//! atomic group writes opt into a documented degraded mode where the batch
//! writer issues compensating reverts after a failed submission.

use crate::error::{EngineError, EngineResult};
use crate::types::{RecordId, TransformedRecord};
use async_trait::async_trait;

/// Factory for sink connections, used by the connection pool to open
/// fresh connections and replace discarded ones
#[async_trait]
pub trait SinkConnector: Send + Sync {
    async fn connect(&self) -> EngineResult<Box<dyn SinkConnection>>;
}

/// A single connection to the sink
///
/// Connections are exclusively owned between pool acquisition and release,
/// so methods take `&mut self`; no internal synchronization is required of
/// implementations.
#[async_trait]
pub trait SinkConnection: Send + Sync {
    /// Submit a group of records as one atomic operation
    ///
    /// On failure nothing from the group may remain visible. If the sink
    /// cannot guarantee that, return `false` from
    /// [`supports_atomic_batches`](Self::supports_atomic_batches) and
    /// implement [`revert_records`](Self::revert_records); the batch writer
    /// then compensates after each failed submission before retrying.
    async fn submit_batch(&mut self, records: &[TransformedRecord]) -> EngineResult<()>;

    /// Cheap liveness probe, called by the pool before reusing an idle
    /// connection
    async fn is_healthy(&mut self) -> bool;

    /// Whether `submit_batch` is all-or-nothing (default: true)
    fn supports_atomic_batches(&self) -> bool {
        true
    }

    /// Compensating delete for partially applied groups (degraded mode)
    ///
    /// Only called when `supports_atomic_batches` is false. The default
    /// refuses, which makes a non-atomic sink without compensation a
    /// configuration mistake surfaced at the first failed flush.
    async fn revert_records(&mut self, record_ids: &[RecordId]) -> EngineResult<()> {
        let _ = record_ids;
        Err(EngineError::sink_write_failure(
            0,
            "sink does not support compensating reverts",
        ))
    }
}
