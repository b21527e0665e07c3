//! # Batch Engine
//!
//! Wires the components together and drives a run to completion.
//!
//! ## Control Flow
//!
//! The fetcher pages the source and produces batches; the dispatcher feeds
//! them through a bounded queue to the worker pool; each worker locks the
//! record's partition, consults the cache, transforms, and hands results
//! to its batch writer; writers flush all-or-nothing groups through pooled
//! connections; every record's outcome lands in the aggregator, which
//! assembles the final [`RunReport`].
//!
//! ## Shutdown
//!
//! `shutdown_token()` exposes the run-level cancellation signal. Cancelling
//! it stops production, lets each worker finish its current record, and
//! marks everything not yet written `Retryable` — no forced interruption
//! mid-write — while still producing a report reflecting partial
//! completion. A source failure drains more gently: queued and in-flight
//! batches are processed and flushed normally before the report.

use crate::aggregator::OutcomeAggregator;
use crate::cache::FingerprintCache;
use crate::config::EngineConfig;
use crate::dispatcher::{Dispatcher, WorkerContext};
use crate::error::EngineResult;
use crate::fetcher::BatchFetcher;
use crate::locks::LockCoordinator;
use crate::pool::ConnectionPool;
use crate::sink::SinkConnector;
use crate::source::RecordSource;
use crate::transform::{KeyHashPartitioner, Partitioner, RecordTransform};
use crate::types::{RunReport, RunTermination};
use chrono::Utc;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument};
use uuid::Uuid;

/// The assembled batch record-processing engine
pub struct BatchEngine {
    source: Arc<dyn RecordSource>,
    connector: Arc<dyn SinkConnector>,
    transform: Arc<dyn RecordTransform>,
    partitioner: Arc<dyn Partitioner>,
    config: EngineConfig,
    shutdown: CancellationToken,
    run_id: Uuid,
}

impl BatchEngine {
    /// Assemble an engine with the default key-hash partitioner
    pub fn new(
        source: Arc<dyn RecordSource>,
        connector: Arc<dyn SinkConnector>,
        transform: Arc<dyn RecordTransform>,
        config: EngineConfig,
    ) -> Self {
        let partitioner = Arc::new(KeyHashPartitioner::new(config.partition_count));
        Self {
            source,
            connector,
            transform,
            partitioner,
            config,
            shutdown: CancellationToken::new(),
            run_id: Uuid::new_v4(),
        }
    }

    /// Replace the partitioner (must stay pure: same record, same partition)
    pub fn with_partitioner(mut self, partitioner: Arc<dyn Partitioner>) -> Self {
        self.partitioner = partitioner;
        self
    }

    /// Handle for cancelling the run from outside
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Drive the run to completion and report
    ///
    /// Fails fast only on invalid configuration; every operational failure
    /// surfaces inside the report instead.
    #[instrument(skip_all, fields(run_id = %self.run_id))]
    pub async fn run(self) -> EngineResult<RunReport> {
        let config = self.config.normalized();
        config.validate()?;

        let started_at = Utc::now();
        info!(
            workers = config.worker_count,
            batch_size = config.batch_size,
            pool_size = config.pool_size,
            cache_capacity = config.cache_capacity,
            partitions = config.partition_count,
            "🚚 ENGINE: run starting"
        );

        let pool = Arc::new(ConnectionPool::new(
            Arc::clone(&self.connector),
            config.pool_size,
            config.acquire_timeout,
        ));
        let cache = Arc::new(FingerprintCache::new(config.cache_capacity));
        let locks = Arc::new(LockCoordinator::new(config.lock_timeout));
        let aggregator = Arc::new(OutcomeAggregator::new());

        let ctx = WorkerContext {
            transform: Arc::clone(&self.transform),
            partitioner: Arc::clone(&self.partitioner),
            locks: Arc::clone(&locks),
            cache: Arc::clone(&cache),
            aggregator: Arc::clone(&aggregator),
            shutdown: self.shutdown.clone(),
        };
        let dispatcher = Dispatcher::start(&config, Arc::clone(&pool), ctx);
        let mut fetcher = BatchFetcher::new(Arc::clone(&self.source), config.batch_size);

        // Producer loop: the only party that talks to the source
        let termination = loop {
            if self.shutdown.is_cancelled() {
                break RunTermination::Cancelled;
            }
            match fetcher.next_batch().await {
                Ok(Some(batch)) => {
                    if dispatcher.submit(batch).await.is_err() {
                        break RunTermination::Cancelled;
                    }
                }
                Ok(None) => break RunTermination::SourceExhausted,
                Err(source_error) => {
                    error!(
                        error = %source_error,
                        "🚚 ENGINE: source failed, draining in-flight work"
                    );
                    break RunTermination::SourceFailed(source_error.to_string());
                }
            }
        };

        // Close the queue and let workers drain and flush
        dispatcher.shutdown().await;

        // A run the writer cancelled (pool never available) ended by
        // cancellation even if the source had already been exhausted
        let termination = if self.shutdown.is_cancelled()
            && matches!(termination, RunTermination::SourceExhausted)
        {
            RunTermination::Cancelled
        } else {
            termination
        };

        let pool_stats = pool.stats();
        let cache_stats = cache.stats();
        let report = aggregator.finish(
            self.run_id,
            started_at,
            fetcher.records_fetched(),
            termination,
        );
        info!(
            records_fetched = report.records_fetched,
            success = report.success_count,
            retryable = report.retryable_count,
            fatal = report.fatal_count,
            connections_created = pool_stats.created,
            connections_reused = pool_stats.reused,
            connections_discarded = pool_stats.discarded,
            cache_hits = cache_stats.hits,
            cache_misses = cache_stats.misses,
            partitions_touched = locks.active_partitions(),
            termination = ?report.termination,
            "🚚 ENGINE: run complete"
        );
        Ok(report)
    }
}
