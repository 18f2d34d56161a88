//! Connection pool over a depot's content endpoints.
//!
//! The pool hands out leases on endpoints, takes them back as healthy or
//! broken, and evicts endpoints that keep failing. When the last endpoint is
//! evicted it cancels the sync's token so every worker unwinds.
//!
//! Bookkeeping sits behind a `std::sync::Mutex` that is never held across an
//! `.await`; waiters park on a [`Notify`] until a lease is returned.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::config::PoolConfig;
use crate::error::{Error, Result};
use crate::types::{AppId, DepotId, ServerEndpoint};

/// Health and load of one endpoint
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EndpointStatus {
    /// The endpoint
    pub endpoint: ServerEndpoint,
    /// Leases currently outstanding
    pub in_flight: usize,
    /// Consecutive broken releases
    pub failures: u32,
    /// Removed from rotation for good
    pub evicted: bool,
}

struct EndpointState {
    endpoint: ServerEndpoint,
    in_flight: usize,
    failures: u32,
    penalized_until: Option<Instant>,
    evicted: bool,
}

impl EndpointState {
    fn is_penalized(&self, now: Instant) -> bool {
        self.penalized_until.is_some_and(|until| until > now)
    }
}

struct Shared {
    endpoints: Mutex<Vec<EndpointState>>,
    available: Notify,
    config: PoolConfig,
    exhausted: AtomicBool,
    cancel_on_exhaustion: CancellationToken,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Vec<EndpointState>> {
        // A panic while holding the lock leaves plain counters behind; keep going
        self.endpoints
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn return_lease(&self, index: usize, healthy: bool) {
        let exhausted_now = {
            let mut endpoints = self.lock();
            let Some(state) = endpoints.get_mut(index) else {
                return;
            };
            state.in_flight = state.in_flight.saturating_sub(1);

            if healthy {
                state.failures = 0;
                state.penalized_until = None;
            } else if !state.evicted {
                state.failures += 1;
                state.penalized_until = Some(Instant::now() + self.config.penalty);
                if state.failures >= self.config.max_endpoint_failures {
                    state.evicted = true;
                    tracing::warn!(
                        endpoint = %state.endpoint,
                        failures = state.failures,
                        "Evicting endpoint after repeated failures"
                    );
                } else {
                    tracing::debug!(
                        endpoint = %state.endpoint,
                        failures = state.failures,
                        "Endpoint returned broken, demoting"
                    );
                }
            }

            endpoints.iter().all(|e| e.evicted)
        };

        if exhausted_now {
            self.mark_exhausted();
        }
        self.available.notify_waiters();
    }

    fn mark_exhausted(&self) {
        if !self.exhausted.swap(true, Ordering::SeqCst) {
            tracing::error!("No viable endpoints remain, cancelling sync");
        }
        self.cancel_on_exhaustion.cancel();
        self.available.notify_waiters();
    }
}

/// Outcome of one non-blocking acquisition attempt
enum TryAcquire {
    Leased(PooledEndpoint),
    Busy,
    Exhausted,
}

/// Pool of content endpoints for one sync.
///
/// Cheap to clone; clones share the same bookkeeping.
#[derive(Clone)]
pub struct ConnectionPool {
    shared: Arc<Shared>,
}

impl ConnectionPool {
    /// Create a pool over `endpoints` that cancels `cancel_on_exhaustion` once
    /// every endpoint has been evicted.
    pub fn new(
        endpoints: Vec<ServerEndpoint>,
        config: PoolConfig,
        cancel_on_exhaustion: CancellationToken,
    ) -> Self {
        let endpoints = endpoints
            .into_iter()
            .map(|endpoint| EndpointState {
                endpoint,
                in_flight: 0,
                failures: 0,
                penalized_until: None,
                evicted: false,
            })
            .collect();

        Self {
            shared: Arc::new(Shared {
                endpoints: Mutex::new(endpoints),
                available: Notify::new(),
                config,
                exhausted: AtomicBool::new(false),
                cancel_on_exhaustion,
            }),
        }
    }

    /// Lease an endpoint for `depot_id`, waiting until one has spare capacity.
    ///
    /// Fails fast with [`Error::Cancelled`] once `cancel` fires and with
    /// [`Error::PoolExhausted`] once no endpoint remains viable.
    pub async fn acquire(
        &self,
        app_id: AppId,
        depot_id: DepotId,
        cancel: &CancellationToken,
    ) -> Result<PooledEndpoint> {
        loop {
            if self.is_exhausted() {
                return Err(Error::PoolExhausted { depot_id });
            }
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            // Register interest before inspecting state so a release between
            // the check and the wait is not missed.
            let notified = self.shared.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.try_acquire() {
                TryAcquire::Leased(lease) => {
                    tracing::trace!(
                        app_id = %app_id,
                        depot_id = %depot_id,
                        endpoint = %lease.endpoint,
                        "Leased endpoint"
                    );
                    return Ok(lease);
                }
                TryAcquire::Exhausted => {
                    self.shared.mark_exhausted();
                    return Err(Error::PoolExhausted { depot_id });
                }
                TryAcquire::Busy => {}
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = cancel.cancelled() => {}
                _ = self.shared.cancel_on_exhaustion.cancelled() => {}
            }
        }
    }

    fn try_acquire(&self) -> TryAcquire {
        let cap = self.shared.config.connections_per_endpoint;
        let now = Instant::now();
        let mut endpoints = self.shared.lock();

        if endpoints.iter().all(|e| e.evicted) {
            return TryAcquire::Exhausted;
        }

        let best = endpoints
            .iter()
            .enumerate()
            .filter(|(_, e)| !e.evicted && e.in_flight < cap)
            .min_by_key(|(i, e)| {
                (
                    e.is_penalized(now),
                    e.endpoint.priority,
                    e.failures,
                    e.in_flight,
                    *i,
                )
            })
            .map(|(i, _)| i);

        match best {
            Some(index) => {
                let state = &mut endpoints[index];
                state.in_flight += 1;
                TryAcquire::Leased(PooledEndpoint {
                    index,
                    endpoint: state.endpoint.clone(),
                    shared: Some(Arc::clone(&self.shared)),
                })
            }
            None => TryAcquire::Busy,
        }
    }

    /// Return a lease. Broken leases demote, and eventually evict, the endpoint.
    pub fn release(&self, lease: PooledEndpoint, healthy: bool) {
        lease.finish(healthy);
    }

    /// True once every endpoint has been evicted
    pub fn is_exhausted(&self) -> bool {
        self.shared.exhausted.load(Ordering::SeqCst)
    }

    /// Current health of every endpoint, in construction order
    pub fn snapshot(&self) -> Vec<EndpointStatus> {
        self.shared
            .lock()
            .iter()
            .map(|e| EndpointStatus {
                endpoint: e.endpoint.clone(),
                in_flight: e.in_flight,
                failures: e.failures,
                evicted: e.evicted,
            })
            .collect()
    }
}

/// A leased endpoint. Return it with [`ConnectionPool::release`]; dropping it
/// without release frees the slot without touching the endpoint's health.
pub struct PooledEndpoint {
    index: usize,
    endpoint: ServerEndpoint,
    shared: Option<Arc<Shared>>,
}

impl PooledEndpoint {
    /// The leased endpoint
    pub fn endpoint(&self) -> &ServerEndpoint {
        &self.endpoint
    }

    fn finish(mut self, healthy: bool) {
        if let Some(shared) = self.shared.take() {
            shared.return_lease(self.index, healthy);
        }
    }
}

impl Drop for PooledEndpoint {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.take() {
            let mut endpoints = shared.lock();
            if let Some(state) = endpoints.get_mut(self.index) {
                state.in_flight = state.in_flight.saturating_sub(1);
            }
            drop(endpoints);
            shared.available.notify_waiters();
        }
    }
}

impl std::fmt::Debug for PooledEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledEndpoint")
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const APP: AppId = AppId(453090);
    const DEPOT: DepotId = DepotId(453094);

    fn config(cap: usize, max_failures: u32) -> PoolConfig {
        PoolConfig {
            connections_per_endpoint: cap,
            max_endpoint_failures: max_failures,
            penalty: Duration::from_secs(60),
        }
    }

    fn endpoints(n: u16) -> Vec<ServerEndpoint> {
        (0..n)
            .map(|i| ServerEndpoint::new(format!("cdn{i}.example.com"), 80))
            .collect()
    }

    #[tokio::test]
    async fn acquire_spreads_load_across_endpoints() {
        let token = CancellationToken::new();
        let pool = ConnectionPool::new(endpoints(2), config(4, 3), token.clone());

        let a = pool.acquire(APP, DEPOT, &token).await.unwrap();
        let b = pool.acquire(APP, DEPOT, &token).await.unwrap();

        assert_ne!(
            a.endpoint(),
            b.endpoint(),
            "least-loaded endpoint should be chosen"
        );
    }

    #[tokio::test]
    async fn priority_wins_over_load() {
        let token = CancellationToken::new();
        let mut eps = endpoints(2);
        eps[1].priority = -1;
        let pool = ConnectionPool::new(eps.clone(), config(4, 3), token.clone());

        let a = pool.acquire(APP, DEPOT, &token).await.unwrap();
        let b = pool.acquire(APP, DEPOT, &token).await.unwrap();

        assert_eq!(a.endpoint(), &eps[1]);
        assert_eq!(b.endpoint(), &eps[1]);
    }

    #[tokio::test]
    async fn broken_release_demotes_endpoint() {
        let token = CancellationToken::new();
        let eps = endpoints(2);
        let pool = ConnectionPool::new(eps.clone(), config(4, 3), token.clone());

        let first = pool.acquire(APP, DEPOT, &token).await.unwrap();
        assert_eq!(first.endpoint(), &eps[0]);
        pool.release(first, false);

        let next = pool.acquire(APP, DEPOT, &token).await.unwrap();
        assert_eq!(next.endpoint(), &eps[1], "demoted endpoint should be passed over");
        assert_eq!(pool.snapshot()[0].failures, 1);
    }

    #[tokio::test]
    async fn healthy_release_resets_failures() {
        let token = CancellationToken::new();
        let pool = ConnectionPool::new(endpoints(1), config(4, 3), token.clone());

        let lease = pool.acquire(APP, DEPOT, &token).await.unwrap();
        pool.release(lease, false);
        let lease = pool.acquire(APP, DEPOT, &token).await.unwrap();
        pool.release(lease, true);

        let status = &pool.snapshot()[0];
        assert_eq!(status.failures, 0);
        assert_eq!(status.in_flight, 0);
    }

    #[tokio::test]
    async fn evicting_last_endpoint_exhausts_pool_and_cancels() {
        let token = CancellationToken::new();
        let pool = ConnectionPool::new(endpoints(1), config(4, 2), token.clone());

        for _ in 0..2 {
            let lease = pool.acquire(APP, DEPOT, &token).await.unwrap();
            pool.release(lease, false);
        }

        assert!(pool.is_exhausted());
        assert!(token.is_cancelled(), "exhaustion must cancel the sync token");
        assert!(matches!(
            pool.acquire(APP, DEPOT, &token).await,
            Err(Error::PoolExhausted { depot_id: DEPOT })
        ));
    }

    #[tokio::test]
    async fn empty_pool_is_exhausted_on_first_acquire() {
        let token = CancellationToken::new();
        let pool = ConnectionPool::new(vec![], PoolConfig::default(), token.clone());

        assert!(matches!(
            pool.acquire(APP, DEPOT, &token).await,
            Err(Error::PoolExhausted { .. })
        ));
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn acquire_waits_for_capacity_then_succeeds() {
        let token = CancellationToken::new();
        let pool = ConnectionPool::new(endpoints(1), config(1, 3), token.clone());

        let held = pool.acquire(APP, DEPOT, &token).await.unwrap();

        let waiter = {
            let pool = pool.clone();
            let token = token.clone();
            tokio::spawn(async move { pool.acquire(APP, DEPOT, &token).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished(), "second acquire should be parked");

        pool.release(held, true);
        let lease = tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .expect("waiter should wake on release")
            .unwrap();
        assert!(lease.is_ok());
    }

    #[tokio::test]
    async fn cancellation_wakes_parked_acquire() {
        let token = CancellationToken::new();
        let pool = ConnectionPool::new(endpoints(1), config(1, 3), token.clone());
        let _held = pool.acquire(APP, DEPOT, &token).await.unwrap();

        let waiter = {
            let pool = pool.clone();
            let token = token.clone();
            tokio::spawn(async move { pool.acquire(APP, DEPOT, &token).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        token.cancel();

        let result = tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .expect("cancel should wake waiter")
            .unwrap();
        assert!(matches!(result, Err(Error::Cancelled)));
    }

    #[tokio::test]
    async fn no_acquire_succeeds_after_cancel() {
        let token = CancellationToken::new();
        let pool = ConnectionPool::new(endpoints(3), PoolConfig::default(), token.clone());
        token.cancel();

        for _ in 0..5 {
            assert!(matches!(
                pool.acquire(APP, DEPOT, &token).await,
                Err(Error::Cancelled)
            ));
        }
        assert!(!pool.is_exhausted(), "explicit cancel is not exhaustion");
    }

    #[tokio::test]
    async fn dropped_lease_frees_slot_without_penalty() {
        let token = CancellationToken::new();
        let pool = ConnectionPool::new(endpoints(1), config(1, 3), token.clone());

        let lease = pool.acquire(APP, DEPOT, &token).await.unwrap();
        drop(lease);

        let status = &pool.snapshot()[0];
        assert_eq!(status.in_flight, 0);
        assert_eq!(status.failures, 0);
        assert!(pool.acquire(APP, DEPOT, &token).await.is_ok());
    }
}
