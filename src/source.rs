//! # Record Source Interface
//!
//! The paged read interface to the external backing store. The store is an
//! opaque collaborator: the engine makes no assumption about its query
//! planning, indexing, or wire protocol — only that it can serve bounded
//! pages behind a monotonically advancing cursor.

use crate::error::EngineResult;
use crate::types::Record;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Opaque paging token encoded by the source (offset, keyset, etc.)
///
/// The engine never interprets the token; it only carries the most recent
/// one back into the next `fetch_page` call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageCursor(pub String);

impl PageCursor {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// One page of records plus the cursor for the next page
///
/// `next_cursor = None` signals the final page.
#[derive(Debug, Clone)]
pub struct SourcePage {
    pub records: Vec<Record>,
    pub next_cursor: Option<PageCursor>,
}

impl SourcePage {
    pub fn new(records: Vec<Record>, next_cursor: Option<PageCursor>) -> Self {
        Self {
            records,
            next_cursor,
        }
    }

    /// The terminal empty page
    pub fn end() -> Self {
        Self {
            records: Vec::new(),
            next_cursor: None,
        }
    }
}

/// Paged read access to the backing store
///
/// Consistency under concurrent source mutation is explicitly best-effort:
/// no snapshot isolation is assumed, so duplicates or omissions are
/// possible and downstream writes must be idempotent (record-identity
/// dedup is the sink's concern). Implementations should surface failures
/// as [`EngineError::SourceReadFailure`](crate::error::EngineError); a
/// broken cursor cannot be retried without risking duplication, so the
/// engine treats read failures as fatal to the production side of a run.
#[async_trait]
pub trait RecordSource: Send + Sync {
    /// Fetch up to `limit` records at `cursor` (`None` = start of sequence)
    async fn fetch_page(
        &self,
        cursor: Option<PageCursor>,
        limit: usize,
    ) -> EngineResult<SourcePage>;
}
