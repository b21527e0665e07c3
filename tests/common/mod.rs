//! Shared test doubles for engine integration tests: a paged in-memory
//! source, a scriptable in-memory sink, and counting transforms.

// Not every test binary uses every helper
#![allow(dead_code)]

use async_trait::async_trait;
use conveyor_core::{
    EngineError, EngineResult, Fingerprint, PageCursor, Record, RecordId, RecordTransform,
    SinkConnection, SinkConnector, RecordSource, SourcePage, TransformError, TransformedRecord,
};
use parking_lot::Mutex;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Build `n` records with ids `r-0..r-n` and numeric payloads
pub fn make_records(n: usize) -> Vec<Record> {
    (0..n)
        .map(|i| Record::new(format!("r-{i}"), json!({"n": i})))
        .collect()
}

/// In-memory source serving fixed records in pages, offset-encoded cursor
pub struct MemorySource {
    records: Vec<Record>,
    page_size: usize,
    fail_at_offset: Option<usize>,
}

impl MemorySource {
    pub fn new(records: Vec<Record>, page_size: usize) -> Self {
        Self {
            records,
            page_size: page_size.max(1),
            fail_at_offset: None,
        }
    }

    /// Fail every fetch at or past the given offset
    pub fn failing_at(mut self, offset: usize) -> Self {
        self.fail_at_offset = Some(offset);
        self
    }
}

#[async_trait]
impl RecordSource for MemorySource {
    async fn fetch_page(
        &self,
        cursor: Option<PageCursor>,
        _limit: usize,
    ) -> EngineResult<SourcePage> {
        let offset: usize = match cursor {
            Some(token) => token
                .as_str()
                .parse()
                .map_err(|_| EngineError::source_read_failure("unparsable cursor"))?,
            None => 0,
        };
        if let Some(fail_at) = self.fail_at_offset {
            if offset >= fail_at {
                return Err(EngineError::source_read_failure("scripted source failure"));
            }
        }
        let end = (offset + self.page_size).min(self.records.len());
        let records = self.records[offset..end].to_vec();
        let next_cursor =
            (end < self.records.len()).then(|| PageCursor::new(end.to_string()));
        Ok(SourcePage::new(records, next_cursor))
    }
}

/// Shared, scriptable state behind every [`MemoryConnector`] connection
#[derive(Default)]
pub struct SinkState {
    /// Successfully committed groups, in commit order
    pub submitted: Vec<Vec<TransformedRecord>>,
    /// Total submission attempts, failed ones included
    pub submit_attempts: usize,
    /// Compensating reverts issued in degraded mode
    pub reverts: usize,
    fail_remaining: HashMap<RecordId, usize>,
    fail_forever: HashSet<RecordId>,
}

impl SinkState {
    pub fn committed_count(&self) -> usize {
        self.submitted.iter().map(Vec::len).sum()
    }

    pub fn committed_ids(&self) -> Vec<RecordId> {
        self.submitted
            .iter()
            .flatten()
            .map(|record| record.id.clone())
            .collect()
    }
}

/// Connector producing connections that share one scripted [`SinkState`]
#[derive(Clone, Default)]
pub struct MemoryConnector {
    state: Arc<Mutex<SinkState>>,
    atomic: bool,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(SinkState::default())),
            atomic: true,
        }
    }

    /// Sink without atomic group writes (engages the writer's degraded mode)
    pub fn non_atomic() -> Self {
        Self {
            state: Arc::new(Mutex::new(SinkState::default())),
            atomic: false,
        }
    }

    /// Fail the next `times` submissions of any group containing `record_id`
    pub fn fail_times_for(&self, record_id: impl Into<RecordId>, times: usize) {
        self.state
            .lock()
            .fail_remaining
            .insert(record_id.into(), times);
    }

    /// Permanently fail every group containing `record_id`
    pub fn fail_forever_for(&self, record_id: impl Into<RecordId>) {
        self.state.lock().fail_forever.insert(record_id.into());
    }

    pub fn state(&self) -> Arc<Mutex<SinkState>> {
        Arc::clone(&self.state)
    }
}

#[async_trait]
impl SinkConnector for MemoryConnector {
    async fn connect(&self) -> EngineResult<Box<dyn SinkConnection>> {
        Ok(Box::new(MemoryConnection {
            state: Arc::clone(&self.state),
            atomic: self.atomic,
        }))
    }
}

struct MemoryConnection {
    state: Arc<Mutex<SinkState>>,
    atomic: bool,
}

#[async_trait]
impl SinkConnection for MemoryConnection {
    async fn submit_batch(&mut self, records: &[TransformedRecord]) -> EngineResult<()> {
        let mut state = self.state.lock();
        state.submit_attempts += 1;

        if records
            .iter()
            .any(|record| state.fail_forever.contains(&record.id))
        {
            return Err(EngineError::sink_write_failure(1, "scripted permanent failure"));
        }

        let scripted = records.iter().find_map(|record| {
            state
                .fail_remaining
                .get(&record.id)
                .copied()
                .filter(|remaining| *remaining > 0)
                .map(|_| record.id.clone())
        });
        if let Some(record_id) = scripted {
            if let Some(remaining) = state.fail_remaining.get_mut(&record_id) {
                *remaining -= 1;
            }
            return Err(EngineError::sink_write_failure(1, "scripted transient failure"));
        }

        state.submitted.push(records.to_vec());
        Ok(())
    }

    async fn is_healthy(&mut self) -> bool {
        true
    }

    fn supports_atomic_batches(&self) -> bool {
        self.atomic
    }

    async fn revert_records(&mut self, _record_ids: &[RecordId]) -> EngineResult<()> {
        self.state.lock().reverts += 1;
        Ok(())
    }
}

/// Pure transform that doubles the numeric payload and counts invocations
pub struct DoublingTransform {
    invocations: Arc<AtomicUsize>,
    use_fingerprints: bool,
    delay: Option<Duration>,
}

impl DoublingTransform {
    pub fn new() -> Self {
        Self {
            invocations: Arc::new(AtomicUsize::new(0)),
            use_fingerprints: false,
            delay: None,
        }
    }

    /// Opt every record into memoization by content fingerprint
    pub fn with_fingerprints(mut self) -> Self {
        self.use_fingerprints = true;
        self
    }

    /// Slow the transform down (cancellation tests)
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn invocation_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.invocations)
    }
}

impl Default for DoublingTransform {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RecordTransform for DoublingTransform {
    async fn apply(&self, record: &Record) -> Result<TransformedRecord, TransformError> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let n = record
            .payload
            .get("n")
            .and_then(|v| v.as_i64())
            .ok_or_else(|| TransformError::fatal("payload has no numeric field"))?;
        Ok(TransformedRecord::new(
            record.id.clone(),
            json!({"n": n, "doubled": n * 2}),
        ))
    }

    fn fingerprint(&self, record: &Record) -> Option<Fingerprint> {
        self.use_fingerprints.then(|| Fingerprint::of_record(record))
    }
}
