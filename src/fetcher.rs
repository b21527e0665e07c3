//! # Batch Fetcher
//!
//! Pages the record source with a monotonically advancing cursor and
//! re-chunks pages into batches of up to `batch_size`, buffering any
//! remainder for the next batch.
//!
//! Under stable source data a record is never refetched: the cursor only
//! moves forward and is never reused once consumed. A page that neither
//! returns records nor advances the cursor terminates the sequence
//! defensively rather than spinning on a stalled source.

use crate::error::EngineResult;
use crate::source::{PageCursor, RecordSource};
use crate::types::RecordBatch;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, warn};

/// Produces the lazy, finite sequence of record batches for a run
pub struct BatchFetcher {
    source: Arc<dyn RecordSource>,
    batch_size: usize,
    cursor: Option<PageCursor>,
    buffer: VecDeque<crate::types::Record>,
    exhausted: bool,
    next_sequence: u64,
    records_fetched: u64,
}

impl BatchFetcher {
    pub fn new(source: Arc<dyn RecordSource>, batch_size: usize) -> Self {
        Self {
            source,
            batch_size: batch_size.max(1),
            cursor: None,
            buffer: VecDeque::new(),
            exhausted: false,
            next_sequence: 0,
            records_fetched: 0,
        }
    }

    /// Produce the next batch, or `None` once the source is exhausted
    ///
    /// A source error ends production: the broken cursor cannot be retried
    /// without risking duplication, so the error propagates and later
    /// calls return `None`.
    pub async fn next_batch(&mut self) -> EngineResult<Option<RecordBatch>> {
        while !self.exhausted && self.buffer.len() < self.batch_size {
            let page = match self
                .source
                .fetch_page(self.cursor.clone(), self.batch_size)
                .await
            {
                Ok(page) => page,
                Err(err) => {
                    self.exhausted = true;
                    return Err(err);
                }
            };

            let fetched = page.records.len();
            self.records_fetched += fetched as u64;
            self.buffer.extend(page.records);

            match page.next_cursor {
                None => {
                    self.exhausted = true;
                }
                Some(next) => {
                    if self.cursor.as_ref() == Some(&next) {
                        // Stalled cursor: stop instead of refetching the
                        // same page forever
                        warn!(
                            cursor = %next.as_str(),
                            "📥 FETCHER: cursor did not advance, ending production"
                        );
                        self.exhausted = true;
                    } else {
                        self.cursor = Some(next);
                    }
                }
            }

            if fetched == 0 && !self.exhausted {
                // Empty page with an advancing cursor: keep paging
                debug!("📥 FETCHER: empty page, advancing cursor");
            }
        }

        if self.buffer.is_empty() {
            return Ok(None);
        }

        let take = self.batch_size.min(self.buffer.len());
        let records: Vec<_> = self.buffer.drain(..take).collect();
        let batch = RecordBatch::new(self.next_sequence, records);
        self.next_sequence += 1;
        debug!(
            sequence = batch.sequence,
            size = batch.len(),
            "📥 FETCHER: produced batch"
        );
        Ok(Some(batch))
    }

    /// Total records pulled from the source so far
    pub fn records_fetched(&self) -> u64 {
        self.records_fetched
    }
}
