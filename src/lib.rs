#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Conveyor Core
//!
//! A concurrent batch record-processing engine: pulls large volumes of
//! records from a backing store, transforms them, and writes results back
//! while managing concurrency, connection reuse, and contention on shared
//! resources.
//!
//! ## Architecture
//!
//! The engine is a pipeline of narrow components:
//!
//! - [`fetcher`] - pages the source into ordered, bounded record batches
//! - `dispatcher` - partitions batches across a fixed worker pool
//!   through a bounded queue (backpressure on the fetcher)
//! - [`locks`] - per-partition shared/exclusive locking, no global lock
//! - [`cache`] - LRU memoization with single-flight computation
//! - [`writer`] - all-or-nothing flush groups with bounded retries
//! - [`pool`] - bounded, validated reuse of sink connections
//! - [`aggregator`] - additive outcome collection into a [`RunReport`]
//!
//! The backing store and the sink are external collaborators behind the
//! [`source::RecordSource`] and [`sink::SinkConnector`] traits; the engine
//! assumes nothing about their internals beyond paged reads and atomic
//! group writes.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use conveyor_core::{BatchEngine, EngineConfig};
//! use std::sync::Arc;
//!
//! # async fn example(
//! #     source: Arc<dyn conveyor_core::RecordSource>,
//! #     connector: Arc<dyn conveyor_core::SinkConnector>,
//! #     transform: Arc<dyn conveyor_core::RecordTransform>,
//! # ) -> conveyor_core::EngineResult<()> {
//! let engine = BatchEngine::new(source, connector, transform, EngineConfig::default());
//! let shutdown = engine.shutdown_token();
//! let report = engine.run().await?;
//! println!("{} succeeded, {} fatal", report.success_count, report.fatal_count);
//! # Ok(())
//! # }
//! ```

pub mod aggregator;
pub mod backoff;
pub mod cache;
pub mod config;
mod dispatcher;
pub mod engine;
pub mod error;
pub mod fetcher;
pub mod locks;
pub mod logging;
pub mod pool;
pub mod sink;
pub mod source;
pub mod transform;
pub mod types;
pub mod writer;

pub use aggregator::OutcomeAggregator;
pub use backoff::BackoffSchedule;
pub use cache::{CacheStats, FingerprintCache};
pub use config::EngineConfig;
pub use engine::BatchEngine;
pub use error::{EngineError, EngineResult};
pub use fetcher::BatchFetcher;
pub use locks::{LockCoordinator, PartitionGuard};
pub use logging::init_telemetry;
pub use pool::{ConnectionPool, PoolStats, PooledConnection};
pub use sink::{SinkConnection, SinkConnector};
pub use source::{PageCursor, RecordSource, SourcePage};
pub use transform::{
    AccessMode, KeyHashPartitioner, Partitioner, RecordTransform, TransformError,
};
pub use types::{
    FatalFailure, Fingerprint, Outcome, Record, RecordBatch, RecordId, RecordOutcome,
    ResourcePartition, RunReport, RunTermination, TransformedRecord,
};
pub use writer::BatchWriter;
