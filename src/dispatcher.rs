//! # Worker Pool / Dispatcher
//!
//! A fixed pool of worker tasks consuming record batches from one bounded
//! queue.
//!
//! ## Key Features
//!
//! - **Backpressure**: `submit` blocks the fetcher once the queue bound is
//!   reached; nothing buffers without limit
//! - **Partial-failure isolation**: one record's failure becomes its
//!   outcome and processing continues with the next record in the batch
//! - **One partition at a time**: each record's lock guard is dropped
//!   before the next record starts, so cross-partition cycles cannot form
//! - **Cancellation at defined points**: workers observe the shutdown
//!   token at the top of each record and mark everything not yet written
//!   `Retryable`, never interrupting a write in progress
//!
//! Each worker owns a private [`BatchWriter`] and flushes it at the end of
//! every input batch, so sink groups track input batches.

use crate::aggregator::OutcomeAggregator;
use crate::cache::FingerprintCache;
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::locks::LockCoordinator;
use crate::pool::ConnectionPool;
use crate::transform::{Partitioner, RecordTransform};
use crate::types::{Record, RecordBatch, RecordOutcome, TransformedRecord};
use crate::writer::BatchWriter;
use futures::future::join_all;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Shared collaborators handed to every worker
#[derive(Clone)]
pub(crate) struct WorkerContext {
    pub transform: Arc<dyn RecordTransform>,
    pub partitioner: Arc<dyn Partitioner>,
    pub locks: Arc<LockCoordinator>,
    pub cache: Arc<FingerprintCache<TransformedRecord>>,
    pub aggregator: Arc<OutcomeAggregator>,
    pub shutdown: CancellationToken,
}

/// Fixed-size worker pool fed through a bounded dispatch queue
pub(crate) struct Dispatcher {
    tx: mpsc::Sender<RecordBatch>,
    queue: Arc<Mutex<mpsc::Receiver<RecordBatch>>>,
    handles: Vec<JoinHandle<()>>,
    aggregator: Arc<OutcomeAggregator>,
    shutdown: CancellationToken,
}

impl Dispatcher {
    /// Spawn `worker_count` workers consuming a queue of `queue_depth`
    pub(crate) fn start(
        config: &EngineConfig,
        pool: Arc<ConnectionPool>,
        ctx: WorkerContext,
    ) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_depth().max(1));
        let queue = Arc::new(Mutex::new(rx));
        let aggregator = Arc::clone(&ctx.aggregator);
        let shutdown = ctx.shutdown.clone();

        let handles = (0..config.worker_count.max(1))
            .map(|id| {
                let worker = BatchWorker {
                    id,
                    writer: BatchWriter::new(
                        Arc::clone(&pool),
                        Arc::clone(&ctx.aggregator),
                        config,
                        ctx.shutdown.clone(),
                    ),
                    ctx: ctx.clone(),
                };
                tokio::spawn(worker.run(Arc::clone(&queue)))
            })
            .collect();

        Self {
            tx,
            queue,
            handles,
            aggregator,
            shutdown,
        }
    }

    /// Hand a batch to the next available worker
    ///
    /// Blocks while the queue is full (backpressure on the fetcher). The
    /// wait observes the shutdown token: a batch that cannot be dispatched
    /// has its records marked `Retryable` rather than silently dropped.
    pub(crate) async fn submit(&self, batch: RecordBatch) -> EngineResult<()> {
        tokio::select! {
            _ = self.shutdown.cancelled() => {
                self.record_batch_retryable(batch);
                Err(EngineError::cancelled("shutdown while dispatch queue was full"))
            }
            reserved = self.tx.reserve() => match reserved {
                Ok(permit) => {
                    permit.send(batch);
                    Ok(())
                }
                Err(_) => {
                    self.record_batch_retryable(batch);
                    Err(EngineError::cancelled("dispatch queue closed"))
                }
            },
        }
    }

    fn record_batch_retryable(&self, batch: RecordBatch) {
        let error = EngineError::cancelled("shutdown before batch was dispatched");
        for record in batch.records {
            self.aggregator
                .record(RecordOutcome::retryable(record.id, error.clone()));
        }
    }

    /// Close the queue, wait for workers to drain, and account for any
    /// batches cancellation left undispatched
    pub(crate) async fn shutdown(self) {
        drop(self.tx);
        for result in join_all(self.handles).await {
            if let Err(join_error) = result {
                warn!(error = %join_error, "⚙️ DISPATCHER: worker task failed");
            }
        }

        // Only a cancelled run leaves batches behind in the queue
        let mut rx = self.queue.lock().await;
        while let Ok(batch) = rx.try_recv() {
            let error = EngineError::cancelled("shutdown before batch was dispatched");
            for record in batch.records {
                self.aggregator
                    .record(RecordOutcome::retryable(record.id, error.clone()));
            }
        }
    }
}

/// One worker task: processes batches to completion, one at a time
struct BatchWorker {
    id: usize,
    ctx: WorkerContext,
    writer: BatchWriter,
}

impl BatchWorker {
    async fn run(mut self, queue: Arc<Mutex<mpsc::Receiver<RecordBatch>>>) {
        debug!(worker = self.id, "⚙️ WORKER: started");
        loop {
            // Hold the queue lock only for the dequeue itself
            let batch = {
                let mut rx = queue.lock().await;
                tokio::select! {
                    _ = self.ctx.shutdown.cancelled() => None,
                    batch = rx.recv() => batch,
                }
            };
            let Some(batch) = batch else { break };
            self.process_batch(batch).await;
        }
        // Drain transformed-but-unwritten work before exiting
        self.writer.flush().await;
        debug!(worker = self.id, "⚙️ WORKER: exited");
    }

    async fn process_batch(&mut self, batch: RecordBatch) {
        debug!(
            worker = self.id,
            sequence = batch.sequence,
            size = batch.len(),
            "⚙️ WORKER: processing batch"
        );

        let mut records = batch.records.into_iter();
        while let Some(record) = records.next() {
            if self.ctx.shutdown.is_cancelled() {
                // Finish nothing new: the current and remaining records of
                // this batch become retryable
                let error = EngineError::cancelled("shutdown during batch processing");
                self.ctx
                    .aggregator
                    .record(RecordOutcome::retryable(record.id, error.clone()));
                for remaining in records.by_ref() {
                    self.ctx
                        .aggregator
                        .record(RecordOutcome::retryable(remaining.id, error.clone()));
                }
                break;
            }

            match self.process_record(&record).await {
                Ok(transformed) => self.writer.push(transformed).await,
                Err(error) => {
                    let outcome = if error.is_retryable() {
                        RecordOutcome::retryable(record.id, error)
                    } else {
                        RecordOutcome::fatal(record.id, error)
                    };
                    self.ctx.aggregator.record(outcome);
                }
            }
        }

        // Flush per input batch so sink groups track input batches
        self.writer.flush().await;
    }

    /// Lock, consult the cache, transform. The partition guard is held for
    /// exactly this record and drops before the writer can flush.
    async fn process_record(&self, record: &Record) -> EngineResult<TransformedRecord> {
        let partition = self.ctx.partitioner.partition_for(record);
        let mode = self.ctx.transform.access_mode(record);
        let _guard = self
            .ctx
            .locks
            .acquire(mode, partition, &self.ctx.shutdown)
            .await?;

        match self.ctx.transform.fingerprint(record) {
            Some(fingerprint) => {
                self.ctx
                    .cache
                    .get_or_compute(fingerprint, || async {
                        self.ctx
                            .transform
                            .apply(record)
                            .await
                            .map_err(|error| error.for_record(&record.id))
                    })
                    .await
            }
            None => self
                .ctx
                .transform
                .apply(record)
                .await
                .map_err(|error| error.for_record(&record.id)),
        }
    }
}
