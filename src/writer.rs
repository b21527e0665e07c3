//! # Batch Writer
//!
//! Accumulates transformed records and flushes them to the sink in
//! bounded-size, all-or-nothing groups.
//!
//! ## Flush lifecycle
//!
//! A group is submitted through one pooled connection per attempt (scoped
//! acquisition, released on every path). On failure the flush retries up
//! to `max_retries` times with the configured backoff between attempts;
//! exhausted retries mark every record of the group `Fatal`. Because the
//! sink operation is all-or-nothing, a failed group reports as a unit, not
//! per record.
//!
//! ## Degraded mode
//!
//! A connection that cannot guarantee atomic group writes
//! (`supports_atomic_batches() == false`) gets a compensating
//! `revert_records` after each failed submission before the retry; a
//! failed compensation escalates the group to `Fatal` immediately.
//!
//! ## Run-level failures
//!
//! A flush whose every attempt timed out waiting for a connection means
//! the pool never became available; the writer marks the group fatal and
//! cancels the run so the report reflects partial completion.

use crate::aggregator::OutcomeAggregator;
use crate::backoff::BackoffSchedule;
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::pool::ConnectionPool;
use crate::types::{RecordId, RecordOutcome, TransformedRecord};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// A failed flush attempt and whether it may still be retried
struct FlushFailure {
    error: EngineError,
    escalate: bool,
}

/// Accumulates transformed records and flushes them in atomic groups
pub struct BatchWriter {
    pool: Arc<ConnectionPool>,
    aggregator: Arc<OutcomeAggregator>,
    batch_size: usize,
    max_retries: u32,
    backoff: BackoffSchedule,
    shutdown: CancellationToken,
    pending: Vec<TransformedRecord>,
}

impl BatchWriter {
    pub fn new(
        pool: Arc<ConnectionPool>,
        aggregator: Arc<OutcomeAggregator>,
        config: &EngineConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            pool,
            aggregator,
            batch_size: config.batch_size.max(1),
            max_retries: config.max_retries,
            backoff: config.retry_backoff.clone(),
            shutdown,
            pending: Vec::new(),
        }
    }

    /// Accumulate one record, flushing when the group reaches `batch_size`
    pub async fn push(&mut self, record: TransformedRecord) {
        self.pending.push(record);
        if self.pending.len() >= self.batch_size {
            self.flush().await;
        }
    }

    /// Records accumulated but not yet flushed
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Submit the pending group all-or-nothing; every record ends in an
    /// outcome regardless of how the flush goes
    pub async fn flush(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        let group = std::mem::take(&mut self.pending);
        let ids: Vec<RecordId> = group.iter().map(|record| record.id.clone()).collect();

        let mut attempt: u32 = 0;
        let mut pool_exhausted_throughout = true;
        loop {
            if self.shutdown.is_cancelled() {
                self.record_all_retryable(
                    group,
                    EngineError::cancelled("shutdown before flush completed"),
                );
                return;
            }

            match self.try_submit(&group, &ids, attempt).await {
                Ok(()) => {
                    debug!(
                        records = group.len(),
                        attempt, "📝 WRITER: group committed"
                    );
                    if attempt > 0 {
                        info!(
                            records = group.len(),
                            retries = attempt,
                            "📝 WRITER: group committed after retries"
                        );
                    }
                    for record in group {
                        self.aggregator.record(RecordOutcome::success(record));
                    }
                    return;
                }
                Err(failure) => {
                    if matches!(failure.error, EngineError::Cancelled { .. }) {
                        self.record_all_retryable(group, failure.error);
                        return;
                    }
                    if !matches!(failure.error, EngineError::PoolExhausted { .. }) {
                        pool_exhausted_throughout = false;
                    }

                    if failure.escalate || attempt >= self.max_retries {
                        error!(
                            records = group.len(),
                            attempts = attempt + 1,
                            error = %failure.error,
                            "📝 WRITER: group failed permanently"
                        );
                        let pool_never_available = pool_exhausted_throughout
                            && matches!(failure.error, EngineError::PoolExhausted { .. });
                        self.record_all_fatal(group, failure.error);
                        if pool_never_available {
                            error!("📝 WRITER: pool never became available, cancelling run");
                            self.shutdown.cancel();
                        }
                        return;
                    }

                    attempt += 1;
                    let delay = self.backoff.delay_for_attempt(attempt);
                    warn!(
                        records = group.len(),
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %failure.error,
                        "📝 WRITER: flush failed, backing off before retry"
                    );
                    tokio::select! {
                        _ = self.shutdown.cancelled() => {
                            self.record_all_retryable(
                                group,
                                EngineError::cancelled("shutdown during retry backoff"),
                            );
                            return;
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    /// One submission attempt through a scoped connection lease
    async fn try_submit(
        &self,
        group: &[TransformedRecord],
        ids: &[RecordId],
        attempt: u32,
    ) -> Result<(), FlushFailure> {
        let mut conn = self
            .pool
            .acquire(&self.shutdown)
            .await
            .map_err(|error| FlushFailure {
                error,
                escalate: false,
            })?;

        match conn.submit_batch(group).await {
            Ok(()) => Ok(()),
            Err(error) => {
                if !conn.supports_atomic_batches() {
                    // Degraded mode: compensate for a possibly partial write
                    // before the group can be retried
                    if let Err(revert_error) = conn.revert_records(ids).await {
                        return Err(FlushFailure {
                            error: EngineError::sink_write_failure(
                                attempt + 1,
                                format!(
                                    "submission failed ({error}); compensation failed ({revert_error})"
                                ),
                            ),
                            escalate: true,
                        });
                    }
                    debug!(
                        records = ids.len(),
                        "📝 WRITER: compensating revert applied"
                    );
                }
                Err(FlushFailure {
                    error,
                    escalate: false,
                })
            }
        }
    }

    fn record_all_retryable(&self, group: Vec<TransformedRecord>, error: EngineError) {
        for record in group {
            self.aggregator
                .record(RecordOutcome::retryable(record.id, error.clone()));
        }
    }

    fn record_all_fatal(&self, group: Vec<TransformedRecord>, error: EngineError) {
        for record in group {
            self.aggregator
                .record(RecordOutcome::fatal(record.id, error.clone()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::{SinkConnection, SinkConnector};
    use crate::error::EngineResult;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Fails the first `failures` submissions, then succeeds
    struct ScriptedConnector {
        failures: Arc<AtomicUsize>,
        submissions: Arc<AtomicUsize>,
        atomic: bool,
        reverts: Arc<AtomicUsize>,
        revert_fails: bool,
    }

    struct ScriptedConnection {
        failures: Arc<AtomicUsize>,
        submissions: Arc<AtomicUsize>,
        atomic: bool,
        reverts: Arc<AtomicUsize>,
        revert_fails: bool,
    }

    #[async_trait]
    impl SinkConnector for ScriptedConnector {
        async fn connect(&self) -> EngineResult<Box<dyn SinkConnection>> {
            Ok(Box::new(ScriptedConnection {
                failures: Arc::clone(&self.failures),
                submissions: Arc::clone(&self.submissions),
                atomic: self.atomic,
                reverts: Arc::clone(&self.reverts),
                revert_fails: self.revert_fails,
            }))
        }
    }

    #[async_trait]
    impl SinkConnection for ScriptedConnection {
        async fn submit_batch(&mut self, _records: &[TransformedRecord]) -> EngineResult<()> {
            self.submissions.fetch_add(1, Ordering::SeqCst);
            if self.failures.load(Ordering::SeqCst) > 0 {
                self.failures.fetch_sub(1, Ordering::SeqCst);
                return Err(EngineError::sink_write_failure(1, "scripted failure"));
            }
            Ok(())
        }

        async fn is_healthy(&mut self) -> bool {
            true
        }

        fn supports_atomic_batches(&self) -> bool {
            self.atomic
        }

        async fn revert_records(&mut self, _record_ids: &[RecordId]) -> EngineResult<()> {
            self.reverts.fetch_add(1, Ordering::SeqCst);
            if self.revert_fails {
                Err(EngineError::sink_write_failure(1, "revert refused"))
            } else {
                Ok(())
            }
        }
    }

    struct Fixture {
        writer: BatchWriter,
        aggregator: Arc<OutcomeAggregator>,
        submissions: Arc<AtomicUsize>,
        reverts: Arc<AtomicUsize>,
    }

    fn fixture(failures: usize, max_retries: u32, atomic: bool, revert_fails: bool) -> Fixture {
        let submissions = Arc::new(AtomicUsize::new(0));
        let reverts = Arc::new(AtomicUsize::new(0));
        let connector = Arc::new(ScriptedConnector {
            failures: Arc::new(AtomicUsize::new(failures)),
            submissions: Arc::clone(&submissions),
            atomic,
            reverts: Arc::clone(&reverts),
            revert_fails,
        });
        let pool = Arc::new(ConnectionPool::new(connector, 2, Duration::from_secs(1)));
        let aggregator = Arc::new(OutcomeAggregator::new());
        let config = EngineConfig {
            batch_size: 10,
            max_retries,
            retry_backoff: BackoffSchedule {
                base: Duration::from_millis(1),
                ..BackoffSchedule::default()
            },
            ..EngineConfig::default()
        };
        let writer = BatchWriter::new(
            Arc::clone(&pool),
            Arc::clone(&aggregator),
            &config,
            CancellationToken::new(),
        );
        Fixture {
            writer,
            aggregator,
            submissions,
            reverts,
        }
    }

    fn records(n: usize) -> Vec<TransformedRecord> {
        (0..n)
            .map(|i| TransformedRecord::new(format!("r-{i}"), json!({"n": i})))
            .collect()
    }

    #[tokio::test]
    async fn test_flush_succeeds_after_retries() {
        let mut fx = fixture(3, 3, true, false);
        for record in records(5) {
            fx.writer.push(record).await;
        }
        fx.writer.flush().await;

        // 3 failures + 1 success
        assert_eq!(fx.submissions.load(Ordering::SeqCst), 4);
        assert_eq!(fx.aggregator.success_count(), 5);
        assert_eq!(fx.aggregator.fatal_count(), 0);
    }

    #[tokio::test]
    async fn test_exhausted_retries_mark_group_fatal() {
        let mut fx = fixture(100, 2, true, false);
        for record in records(4) {
            fx.writer.push(record).await;
        }
        fx.writer.flush().await;

        // initial attempt + 2 retries
        assert_eq!(fx.submissions.load(Ordering::SeqCst), 3);
        assert_eq!(fx.aggregator.fatal_count(), 4);
        assert_eq!(fx.aggregator.success_count(), 0);
    }

    #[tokio::test]
    async fn test_push_flushes_at_batch_size() {
        let mut fx = fixture(0, 0, true, false);
        for record in records(25) {
            fx.writer.push(record).await;
        }
        // 10 + 10 flushed, 5 still pending
        assert_eq!(fx.submissions.load(Ordering::SeqCst), 2);
        assert_eq!(fx.writer.pending_len(), 5);
        fx.writer.flush().await;
        assert_eq!(fx.aggregator.success_count(), 25);
    }

    #[tokio::test]
    async fn test_degraded_mode_reverts_between_attempts() {
        let mut fx = fixture(2, 3, false, false);
        for record in records(3) {
            fx.writer.push(record).await;
        }
        fx.writer.flush().await;

        assert_eq!(fx.reverts.load(Ordering::SeqCst), 2);
        assert_eq!(fx.aggregator.success_count(), 3);
    }

    #[tokio::test]
    async fn test_failed_compensation_escalates_immediately() {
        let mut fx = fixture(5, 3, false, true);
        for record in records(3) {
            fx.writer.push(record).await;
        }
        fx.writer.flush().await;

        // One submission, one failed revert, no retries
        assert_eq!(fx.submissions.load(Ordering::SeqCst), 1);
        assert_eq!(fx.reverts.load(Ordering::SeqCst), 1);
        assert_eq!(fx.aggregator.fatal_count(), 3);
    }

    #[tokio::test]
    async fn test_cancelled_flush_marks_group_retryable() {
        let mut fx = fixture(100, 5, true, false);
        // Cancel before flushing
        fx.writer.shutdown.cancel();
        for record in records(2) {
            fx.writer.pending.push(record);
        }
        fx.writer.flush().await;

        assert_eq!(fx.submissions.load(Ordering::SeqCst), 0);
        assert_eq!(fx.aggregator.retryable_count(), 2);
    }
}
