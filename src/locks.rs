//! # Lock Coordinator
//!
//! Fine-grained shared/exclusive locking over resource partitions.
//!
//! Instead of one coarse global lock, the coordinator keeps a table of
//! per-partition rw-locks created on demand: contention on one partition
//! never blocks work on a disjoint partition, while mutual exclusion is
//! preserved per logical unit.
//!
//! ## Fairness policy
//!
//! tokio's `RwLock` queues acquisitions fairly with write preference: an
//! exclusive waiter blocks later shared acquisitions on that partition, so
//! writers cannot starve behind a stream of readers. This is the
//! documented, consistent policy for every partition.
//!
//! ## Deadlock avoidance
//!
//! Holders take locks on at most one partition at a time (the worker loop
//! acquires one guard per record and drops it before the next), so
//! cross-partition lock-ordering cycles cannot form.

use crate::error::{EngineError, EngineResult};
use crate::transform::AccessMode;
use crate::types::ResourcePartition;
use dashmap::DashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

/// Scoped access to a partition, released on drop
pub enum PartitionGuard {
    Shared(OwnedRwLockReadGuard<()>),
    Exclusive(OwnedRwLockWriteGuard<()>),
}

impl PartitionGuard {
    pub fn is_exclusive(&self) -> bool {
        matches!(self, Self::Exclusive(_))
    }
}

/// Table of per-partition rw-locks with optional acquisition timeout
pub struct LockCoordinator {
    table: DashMap<ResourcePartition, Arc<RwLock<()>>>,
    lock_timeout: Option<Duration>,
}

impl LockCoordinator {
    pub fn new(lock_timeout: Option<Duration>) -> Self {
        Self {
            table: DashMap::new(),
            lock_timeout,
        }
    }

    /// Acquire the lock class a transform declared for this record
    pub async fn acquire(
        &self,
        mode: AccessMode,
        partition: ResourcePartition,
        shutdown: &CancellationToken,
    ) -> EngineResult<PartitionGuard> {
        match mode {
            AccessMode::Shared => self.acquire_shared(partition, shutdown).await,
            AccessMode::Exclusive => self.acquire_exclusive(partition, shutdown).await,
        }
    }

    /// Acquire shared access; holders on the same partition may overlap
    pub async fn acquire_shared(
        &self,
        partition: ResourcePartition,
        shutdown: &CancellationToken,
    ) -> EngineResult<PartitionGuard> {
        let lock = self.lock_for(partition);
        let guard = self.wait(partition, shutdown, lock.read_owned()).await?;
        Ok(PartitionGuard::Shared(guard))
    }

    /// Acquire exclusive access; waits for all outstanding holders and
    /// blocks new acquisitions on this partition until released
    pub async fn acquire_exclusive(
        &self,
        partition: ResourcePartition,
        shutdown: &CancellationToken,
    ) -> EngineResult<PartitionGuard> {
        let lock = self.lock_for(partition);
        let guard = self.wait(partition, shutdown, lock.write_owned()).await?;
        Ok(PartitionGuard::Exclusive(guard))
    }

    /// Number of partitions that have been locked at least once
    pub fn active_partitions(&self) -> usize {
        self.table.len()
    }

    fn lock_for(&self, partition: ResourcePartition) -> Arc<RwLock<()>> {
        self.table
            .entry(partition)
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .clone()
    }

    /// Wait for an acquisition, observing the optional timeout and the
    /// run-level shutdown token
    async fn wait<G>(
        &self,
        partition: ResourcePartition,
        shutdown: &CancellationToken,
        acquire: impl Future<Output = G>,
    ) -> EngineResult<G> {
        match self.lock_timeout {
            Some(limit) => tokio::select! {
                _ = shutdown.cancelled() => {
                    Err(EngineError::cancelled("shutdown while waiting for a partition lock"))
                }
                acquired = timeout(limit, acquire) => acquired.map_err(|_| {
                    EngineError::lock_timeout(
                        partition.0,
                        format!("no access within {limit:?}"),
                    )
                }),
            },
            None => tokio::select! {
                _ = shutdown.cancelled() => {
                    Err(EngineError::cancelled("shutdown while waiting for a partition lock"))
                }
                guard = acquire => Ok(guard),
            },
        }
    }
}
