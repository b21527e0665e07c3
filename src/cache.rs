//! # Fingerprint Cache
//!
//! Bounded memoization of idempotent derivations, keyed by deterministic
//! fingerprints.
//!
//! ## Key Features
//!
//! - **LRU bound**: capacity-limited; inserting past capacity evicts the
//!   least-recently-used entry
//! - **Single-flight**: concurrent `get_or_compute` calls for one
//!   fingerprint run the computation exactly once; followers wait on the
//!   leader's published result
//! - **Failures are not cached**: a failed computation is delivered to
//!   every waiter and forgotten, so a later call recomputes
//! - **Leader-loss recovery**: if a leader task is cancelled mid-compute,
//!   the closed channel wakes its followers and one of them takes over
//!
//! A capacity of 0 disables memoization entirely; computations then run
//! directly with no coordination.

use crate::error::EngineResult;
use crate::types::Fingerprint;
use dashmap::DashMap;
use lru::LruCache;
use parking_lot::Mutex;
use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::watch;
use tracing::debug;

/// A computation's published result, `None` while still in flight
type FlightSlot<V> = Option<EngineResult<V>>;

/// Counters describing cache behavior over a run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Entries currently resident
    pub entries: usize,
}

/// Bounded, single-flight memoization layer
pub struct FingerprintCache<V> {
    /// `None` when capacity is 0 (memoization disabled)
    lru: Option<Mutex<LruCache<Fingerprint, V>>>,
    inflight: DashMap<Fingerprint, watch::Receiver<FlightSlot<V>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

enum Flight<V> {
    Leader(watch::Sender<FlightSlot<V>>),
    Follower(watch::Receiver<FlightSlot<V>>),
}

impl<V: Clone + Send + Sync + 'static> FingerprintCache<V> {
    pub fn new(capacity: usize) -> Self {
        Self {
            lru: NonZeroUsize::new(capacity).map(|cap| Mutex::new(LruCache::new(cap))),
            inflight: DashMap::new(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Return the cached value for `fingerprint`, or compute and cache it
    ///
    /// At most one computation per fingerprint is in flight at a time;
    /// concurrent callers for the same key wait on that computation and
    /// observe the same result. Errors propagate to every waiter without
    /// being cached.
    pub async fn get_or_compute<F, Fut>(
        &self,
        fingerprint: Fingerprint,
        compute: F,
    ) -> EngineResult<V>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = EngineResult<V>>,
    {
        let Some(lru) = self.lru.as_ref() else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return compute().await;
        };

        loop {
            if let Some(value) = lru.lock().get(&fingerprint).cloned() {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(value);
            }

            // Join the in-flight computation for this key, or register as
            // its leader. The entry guard must not be held across an await.
            let flight = match self.inflight.entry(fingerprint) {
                dashmap::mapref::entry::Entry::Occupied(entry) => {
                    Flight::Follower(entry.get().clone())
                }
                dashmap::mapref::entry::Entry::Vacant(entry) => {
                    let (tx, rx) = watch::channel(None);
                    entry.insert(rx);
                    Flight::Leader(tx)
                }
            };

            match flight {
                Flight::Leader(tx) => {
                    // Double-check after registering: a previous leader may
                    // have inserted between our miss and the registration.
                    if let Some(value) = lru.lock().get(&fingerprint).cloned() {
                        self.inflight.remove(&fingerprint);
                        let _ = tx.send(Some(Ok(value.clone())));
                        self.hits.fetch_add(1, Ordering::Relaxed);
                        return Ok(value);
                    }

                    self.misses.fetch_add(1, Ordering::Relaxed);
                    let result = compute().await;
                    if let Ok(value) = &result {
                        lru.lock().put(fingerprint, value.clone());
                    }
                    // Publish after the insert so late arrivals hit the cache
                    self.inflight.remove(&fingerprint);
                    let _ = tx.send(Some(result.clone()));
                    return result;
                }
                Flight::Follower(mut rx) => {
                    loop {
                        let settled = rx.borrow().clone();
                        if let Some(result) = settled {
                            if result.is_ok() {
                                self.hits.fetch_add(1, Ordering::Relaxed);
                            }
                            return result;
                        }
                        if rx.changed().await.is_err() {
                            // Leader vanished without publishing. Clear the
                            // stale flight and race for leadership.
                            debug!(
                                fingerprint = %fingerprint,
                                "🗄️ CACHE: in-flight leader vanished, retrying"
                            );
                            self.inflight
                                .remove_if(&fingerprint, |_, stored| stored.has_changed().is_err());
                            break;
                        }
                    }
                    // Re-enter the outer loop: check the cache, then rejoin
                    // or lead the next flight.
                }
            }
        }
    }

    /// Snapshot of cache counters
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.lru.as_ref().map(|lru| lru.lock().len()).unwrap_or(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_memoizes_computed_values() {
        let cache: FingerprintCache<u64> = FingerprintCache::new(8);
        let calls = AtomicUsize::new(0);
        let fp = Fingerprint(1);

        for _ in 0..3 {
            let value = cache
                .get_or_compute(fp, || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(42)
                })
                .await
                .unwrap();
            assert_eq!(value, 42);
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let stats = cache.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 2);
    }

    #[tokio::test]
    async fn test_single_flight_runs_computation_once() {
        let cache: Arc<FingerprintCache<u64>> = Arc::new(FingerprintCache::new(8));
        let calls = Arc::new(AtomicUsize::new(0));
        let fp = Fingerprint(7);

        let mut handles = Vec::new();
        for _ in 0..16 {
            let cache = Arc::clone(&cache);
            let calls = Arc::clone(&calls);
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_compute(fp, || {
                        let calls = Arc::clone(&calls);
                        async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(50)).await;
                            Ok(99u64)
                        }
                    })
                    .await
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), 99);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failures_are_not_cached() {
        let cache: FingerprintCache<u64> = FingerprintCache::new(8);
        let calls = AtomicUsize::new(0);
        let fp = Fingerprint(3);

        let result = cache
            .get_or_compute(fp, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(EngineError::transform_failure("r-1", "transient", true))
            })
            .await;
        assert!(result.is_err());

        // A later call recomputes and may succeed
        let value = cache
            .get_or_compute(fp, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(5)
            })
            .await
            .unwrap();
        assert_eq!(value, 5);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failed_flight_reaches_every_waiter() {
        let cache: Arc<FingerprintCache<u64>> = Arc::new(FingerprintCache::new(8));
        let fp = Fingerprint(13);
        let expected = EngineError::transform_failure("r-1", "flaky", true);

        // Leader whose computation fails after the followers have joined
        let leader = {
            let cache = Arc::clone(&cache);
            let error = expected.clone();
            tokio::spawn(async move {
                cache
                    .get_or_compute(fp, || {
                        let error = error.clone();
                        async move {
                            tokio::time::sleep(Duration::from_millis(50)).await;
                            Err::<u64, _>(error)
                        }
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let follower_calls = Arc::new(AtomicUsize::new(0));
        let mut followers = Vec::new();
        for _ in 0..8 {
            let cache = Arc::clone(&cache);
            let follower_calls = Arc::clone(&follower_calls);
            followers.push(tokio::spawn(async move {
                cache
                    .get_or_compute(fp, || {
                        let follower_calls = Arc::clone(&follower_calls);
                        async move {
                            follower_calls.fetch_add(1, Ordering::SeqCst);
                            Ok(1u64)
                        }
                    })
                    .await
            }));
        }

        assert_eq!(leader.await.unwrap().unwrap_err(), expected);
        for follower in followers {
            // Every waiter observes the leader's error, verbatim
            assert_eq!(follower.await.unwrap().unwrap_err(), expected);
        }
        // No follower computed anything; the error was fanned out, not cached
        assert_eq!(follower_calls.load(Ordering::SeqCst), 0);
        let value = cache.get_or_compute(fp, || async { Ok(21u64) }).await.unwrap();
        assert_eq!(value, 21);
    }

    #[tokio::test]
    async fn test_lru_evicts_least_recently_used() {
        let cache: FingerprintCache<u64> = FingerprintCache::new(2);

        cache.get_or_compute(Fingerprint(1), || async { Ok(1) }).await.unwrap();
        cache.get_or_compute(Fingerprint(2), || async { Ok(2) }).await.unwrap();
        // Touch key 1 so key 2 becomes the eviction candidate
        cache.get_or_compute(Fingerprint(1), || async { Ok(0) }).await.unwrap();
        cache.get_or_compute(Fingerprint(3), || async { Ok(3) }).await.unwrap();

        let recompute = AtomicUsize::new(0);
        let value = cache
            .get_or_compute(Fingerprint(2), || async {
                recompute.fetch_add(1, Ordering::SeqCst);
                Ok(22)
            })
            .await
            .unwrap();
        assert_eq!(value, 22);
        assert_eq!(recompute.load(Ordering::SeqCst), 1);

        // Key 1 survived the eviction
        let value = cache
            .get_or_compute(Fingerprint(1), || async { Ok(0) })
            .await
            .unwrap();
        assert_eq!(value, 1);
    }

    #[tokio::test]
    async fn test_zero_capacity_disables_memoization() {
        let cache: FingerprintCache<u64> = FingerprintCache::new(0);
        let calls = AtomicUsize::new(0);
        let fp = Fingerprint(9);

        for _ in 0..3 {
            cache
                .get_or_compute(fp, || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(1)
                })
                .await
                .unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(cache.stats().entries, 0);
    }

    #[tokio::test]
    async fn test_followers_recover_from_vanished_leader() {
        let cache: Arc<FingerprintCache<u64>> = Arc::new(FingerprintCache::new(8));
        let fp = Fingerprint(11);

        // Leader that never publishes: aborted mid-compute
        let leader = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move {
                cache
                    .get_or_compute(fp, || async {
                        tokio::time::sleep(Duration::from_secs(60)).await;
                        Ok(0u64)
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let follower = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move {
                cache.get_or_compute(fp, || async { Ok(7u64) }).await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        leader.abort();
        let _ = leader.await;

        // The follower notices the closed channel and takes over
        let value = tokio::time::timeout(Duration::from_secs(1), follower)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(value, 7);
    }
}
