//! # Outcome Aggregator
//!
//! Purely additive collection of per-record outcomes for end-of-run
//! reporting. Counters are lock-free; only the fatal-failure detail list
//! sits behind a mutex. The aggregator has no rollback semantics of its
//! own: recording an outcome is final.

use crate::types::{
    FatalFailure, Outcome, RecordOutcome, RunReport, RunTermination,
};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;
use uuid::Uuid;

/// Collects every record's outcome over a run
#[derive(Default)]
pub struct OutcomeAggregator {
    success: AtomicU64,
    retryable: AtomicU64,
    fatal: AtomicU64,
    fatal_failures: Mutex<Vec<FatalFailure>>,
}

impl OutcomeAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one outcome; never fails, never blocks workers on each other
    pub fn record(&self, record_outcome: RecordOutcome) {
        match &record_outcome.outcome {
            Outcome::Success(_) => {
                self.success.fetch_add(1, Ordering::Relaxed);
            }
            Outcome::Retryable(error) => {
                self.retryable.fetch_add(1, Ordering::Relaxed);
                debug!(
                    record_id = %record_outcome.record_id,
                    error = %error,
                    "📊 AGGREGATOR: retryable outcome"
                );
            }
            Outcome::Fatal(error) => {
                self.fatal.fetch_add(1, Ordering::Relaxed);
                self.fatal_failures.lock().push(FatalFailure {
                    record_id: record_outcome.record_id,
                    error: error.to_string(),
                });
            }
        }
    }

    pub fn success_count(&self) -> u64 {
        self.success.load(Ordering::Relaxed)
    }

    pub fn retryable_count(&self) -> u64 {
        self.retryable.load(Ordering::Relaxed)
    }

    pub fn fatal_count(&self) -> u64 {
        self.fatal.load(Ordering::Relaxed)
    }

    /// Assemble the run report from everything recorded so far
    pub fn finish(
        &self,
        run_id: Uuid,
        started_at: DateTime<Utc>,
        records_fetched: u64,
        termination: RunTermination,
    ) -> RunReport {
        let success_count = self.success_count();
        let retryable_count = self.retryable_count();
        let fatal_count = self.fatal_count();
        RunReport {
            run_id,
            started_at,
            finished_at: Utc::now(),
            records_fetched,
            records_processed: success_count + retryable_count + fatal_count,
            success_count,
            retryable_count,
            fatal_count,
            fatal_failures: self.fatal_failures.lock().clone(),
            termination,
        }
    }
}
