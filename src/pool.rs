//! # Connection Pool Manager
//!
//! A bounded pool of reusable sink connections.
//!
//! ## Key Features
//!
//! - **Bounded leasing**: at most `pool_size` connections are leased at any
//!   moment, enforced by a semaphore
//! - **Timed acquisition**: waiting past `acquire_timeout` fails with
//!   `PoolExhausted` instead of blocking forever
//! - **Validate-on-reuse**: idle connections get a cheap liveness probe
//!   before being handed out; broken ones are discarded and replaced
//! - **Scoped release**: a [`PooledConnection`] returns itself to the pool
//!   on drop, on every exit path
//!
//! No connection is ever handed to two holders simultaneously: the lease
//! is exclusive between acquisition and drop.

use crate::error::{EngineError, EngineResult};
use crate::sink::{SinkConnection, SinkConnector};
use crate::types::{RecordId, TransformedRecord};
use crossbeam::queue::SegQueue;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Counters describing pool behavior over a run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Fresh connections opened through the connector
    pub created: u64,
    /// Idle connections revalidated and handed out again
    pub reused: u64,
    /// Broken connections dropped at validation
    pub discarded: u64,
    /// Permits currently available for acquisition
    pub permits_available: usize,
}

/// State shared between the pool and its outstanding leases
struct PoolShared {
    idle: SegQueue<Box<dyn SinkConnection>>,
    created: AtomicU64,
    reused: AtomicU64,
    discarded: AtomicU64,
}

/// Bounded manager of reusable sink connections
pub struct ConnectionPool {
    connector: Arc<dyn SinkConnector>,
    permits: Arc<Semaphore>,
    acquire_timeout: Duration,
    shared: Arc<PoolShared>,
}

impl ConnectionPool {
    pub fn new(
        connector: Arc<dyn SinkConnector>,
        pool_size: usize,
        acquire_timeout: Duration,
    ) -> Self {
        Self {
            connector,
            permits: Arc::new(Semaphore::new(pool_size.max(1))),
            acquire_timeout,
            shared: Arc::new(PoolShared {
                idle: SegQueue::new(),
                created: AtomicU64::new(0),
                reused: AtomicU64::new(0),
                discarded: AtomicU64::new(0),
            }),
        }
    }

    /// Lease a connection, waiting up to `acquire_timeout` for a permit
    ///
    /// The wait observes the run-level shutdown token; a cancelled wait
    /// returns `Cancelled`, an expired one `PoolExhausted`.
    pub async fn acquire(&self, shutdown: &CancellationToken) -> EngineResult<PooledConnection> {
        let permit = tokio::select! {
            _ = shutdown.cancelled() => {
                return Err(EngineError::cancelled("shutdown while waiting for a connection"));
            }
            acquired = timeout(self.acquire_timeout, self.permits.clone().acquire_owned()) => {
                match acquired {
                    Ok(Ok(permit)) => permit,
                    Ok(Err(_)) => return Err(EngineError::pool_exhausted("pool is closed")),
                    Err(_) => {
                        return Err(EngineError::pool_exhausted(format!(
                            "no connection available within {:?}",
                            self.acquire_timeout
                        )));
                    }
                }
            }
        };

        // Prefer a revalidated idle connection over opening a new one
        while let Some(mut conn) = self.shared.idle.pop() {
            if conn.is_healthy().await {
                self.shared.reused.fetch_add(1, Ordering::Relaxed);
                return Ok(PooledConnection {
                    conn: Some(conn),
                    shared: Arc::clone(&self.shared),
                    _permit: permit,
                });
            }
            self.shared.discarded.fetch_add(1, Ordering::Relaxed);
            debug!("💧 POOL: discarded broken idle connection");
        }

        let conn = self.connector.connect().await?;
        self.shared.created.fetch_add(1, Ordering::Relaxed);
        debug!(
            created = self.shared.created.load(Ordering::Relaxed),
            "💧 POOL: opened fresh connection"
        );
        Ok(PooledConnection {
            conn: Some(conn),
            shared: Arc::clone(&self.shared),
            _permit: permit,
        })
    }

    /// Snapshot of pool counters
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            created: self.shared.created.load(Ordering::Relaxed),
            reused: self.shared.reused.load(Ordering::Relaxed),
            discarded: self.shared.discarded.load(Ordering::Relaxed),
            permits_available: self.permits.available_permits(),
        }
    }
}

/// An exclusively held lease on a sink connection
///
/// Dropping the lease pushes the connection back onto the idle queue and
/// releases its permit, whether the flush succeeded or failed.
pub struct PooledConnection {
    conn: Option<Box<dyn SinkConnection>>,
    shared: Arc<PoolShared>,
    _permit: OwnedSemaphorePermit,
}

impl PooledConnection {
    fn conn_mut(&mut self) -> &mut dyn SinkConnection {
        match self.conn.as_mut() {
            Some(conn) => conn.as_mut(),
            // The option is only emptied in Drop
            None => unreachable!("pooled connection accessed after release"),
        }
    }

    /// Submit a group of records through the leased connection
    pub async fn submit_batch(&mut self, records: &[TransformedRecord]) -> EngineResult<()> {
        self.conn_mut().submit_batch(records).await
    }

    /// Whether the underlying sink guarantees all-or-nothing group writes
    pub fn supports_atomic_batches(&self) -> bool {
        self.conn
            .as_ref()
            .map(|conn| conn.supports_atomic_batches())
            .unwrap_or(true)
    }

    /// Issue a compensating revert through the leased connection
    pub async fn revert_records(&mut self, record_ids: &[RecordId]) -> EngineResult<()> {
        self.conn_mut().revert_records(record_ids).await
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.shared.idle.push(conn);
        }
        // _permit drops after the connection is back on the idle queue
    }
}
