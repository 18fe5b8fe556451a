//! Request coalescing.
//!
//! At most one producer runs per cache key at a time. Everybody asking for the same key while it is being produced
//! waits for the very same outcome:
//!
//! ```text
//! fetch(k) ─┐
//!           │                             spawned driver
//! fetch(k) ─┼──► RequestCoalescer ──────► producer ◄── cancel token
//!           │        │                        │    ◄── timeout ceiling
//! fetch(k) ─┘        │                        │
//!                    ▼                        ▼
//!              [all callers get the     [one outcome, published
//!               same outcome] ◄──────── through a watch channel]
//! ```
//!
//! The producer is driven by its own task so that it keeps running even if every caller walks away, and the registry
//! entry is always removed once the outcome is known. Removal is generation-checked: a request that was cancelled and
//! replaced can never evict its successor.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt::Debug;
use std::future::Future;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::config::EngineConfig;
use crate::error::FetchError;
use crate::error::FetchResult;
use crate::error::SourceError;
use crate::types::CacheKey;
use crate::types::SharedResult;

type Outcome = Option<FetchResult<SharedResult>>;

#[derive(Clone)]
struct InFlight {
    generation: u64,
    outcome:    watch::Receiver<Outcome>,
    cancel:     CancellationToken,
}

#[derive(Debug, Default)]
struct Counters {
    total:     AtomicU64,
    coalesced: AtomicU64,
    started:   AtomicU64,
    cancelled: AtomicU64,
    timed_out: AtomicU64,
}

/// Statistics for monitoring coalescing effectiveness.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CoalescerStats {
    /// Every call to `fetch` or `fetch_replacing`.
    pub total:     u64,
    /// Calls that attached to a request already in flight.
    pub coalesced: u64,
    /// Calls that invoked their producer.
    pub started:   u64,
    pub cancelled: u64,
    pub timed_out: u64,
}

impl CoalescerStats {
    /// Returns the coalescing ratio (0.0 to 1.0)
    pub fn coalescing_ratio(&self) -> f64 {
        if self.total == 0 {
            0.0
        }
        else {
            self.coalesced as f64 / self.total as f64
        }
    }
}

#[derive(Default)]
struct Registry {
    in_flight:       Mutex<HashMap<CacheKey, InFlight>>,
    next_generation: AtomicU64,
    counters:        Counters,
}

impl Registry {
    fn evict(&self, key: &CacheKey, generation: u64) {
        let mut in_flight = self.in_flight.lock();
        if in_flight.get(key).is_some_and(|e| e.generation == generation) {
            in_flight.remove(key);
            debug!(key = %key, generation, "in-flight entry evicted");
        }
    }
}

// Evicts the registry entry when the driver is done with it, including when the producer panics.
struct EvictionGuard {
    registry:   Arc<Registry>,
    key:        CacheKey,
    generation: u64,
}

impl Drop for EvictionGuard {
    fn drop(&mut self) {
        self.registry.evict(&self.key, self.generation);
    }
}

/// Deduplicates concurrent fetches of the same key.
///
/// The coalescer is a plain service object: construct one per engine (or per test) and share it behind an `Arc`.
pub struct RequestCoalescer {
    registry: Arc<Registry>,
    timeout:  Duration,
}

impl RequestCoalescer {
    /// `timeout` is the ceiling after which a request still in flight is resolved with [`FetchError::Timeout`].
    pub fn new(timeout: Duration) -> Self {
        Self {
            registry: Arc::new(Registry::default()),
            timeout,
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(config.request_timeout())
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Returns the outcome of the request in flight for `key`, or starts one with `producer`.
    ///
    /// The producer is invoked at most once per request generation and receives the request's cancellation token.
    /// Producer errors are delivered to every waiter and nothing is remembered about them afterwards.
    pub async fn fetch<F, Fut, R>(&self, key: &CacheKey, producer: F) -> FetchResult<SharedResult>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<R, SourceError>> + Send + 'static,
        R: Into<SharedResult> + Send + 'static,
    {
        self.fetch_with(key, producer, false).await
    }

    /// Like [`fetch`](Self::fetch) but cancels whatever is in flight for `key` first. Previous waiters get
    /// [`FetchError::Cancelled`].
    pub async fn fetch_replacing<F, Fut, R>(&self, key: &CacheKey, producer: F) -> FetchResult<SharedResult>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<R, SourceError>> + Send + 'static,
        R: Into<SharedResult> + Send + 'static,
    {
        self.fetch_with(key, producer, true).await
    }

    async fn fetch_with<F, Fut, R>(&self, key: &CacheKey, producer: F, replace: bool) -> FetchResult<SharedResult>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<R, SourceError>> + Send + 'static,
        R: Into<SharedResult> + Send + 'static,
    {
        let counters = &self.registry.counters;
        counters.total.fetch_add(1, Ordering::Relaxed);

        let (outcome, start) = {
            let mut in_flight = self.registry.in_flight.lock();

            if replace {
                if let Some(previous) = in_flight.remove(key) {
                    previous.cancel.cancel();
                    counters.cancelled.fetch_add(1, Ordering::Relaxed);
                    debug!(key = %key, generation = previous.generation, "replacing in-flight request");
                }
            }

            if let Some(entry) = in_flight.get(key) {
                counters.coalesced.fetch_add(1, Ordering::Relaxed);
                debug!(key = %key, generation = entry.generation, "coalescing with in-flight request");
                (entry.outcome.clone(), None)
            }
            else {
                let generation = self.registry.next_generation.fetch_add(1, Ordering::Relaxed);
                let cancel = CancellationToken::new();
                let (tx, rx) = watch::channel(None);
                in_flight.insert(
                    key.clone(),
                    InFlight {
                        generation,
                        outcome: rx.clone(),
                        cancel: cancel.clone(),
                    },
                );
                counters.started.fetch_add(1, Ordering::Relaxed);
                debug!(key = %key, generation, in_flight = in_flight.len(), "starting new request");
                (rx, Some((generation, cancel, tx)))
            }
        };

        // The producer is user code; never call it with the registry locked. The guard is armed first so that a
        // producer panicking right away still evicts its entry and releases the waiters.
        if let Some((generation, cancel, tx)) = start {
            let guard = EvictionGuard {
                registry: Arc::clone(&self.registry),
                key: key.clone(),
                generation,
            };
            let work = producer(cancel.clone());
            tokio::spawn(Self::drive(work, cancel, tx, guard, self.timeout));
        }

        Self::wait(key, outcome).await
    }

    async fn drive<Fut, R>(
        work: Fut,
        cancel: CancellationToken,
        tx: watch::Sender<Outcome>,
        guard: EvictionGuard,
        ceiling: Duration,
    ) where
        Fut: Future<Output = Result<R, SourceError>> + Send + 'static,
        R: Into<SharedResult> + Send + 'static,
    {
        let key = guard.key.clone();

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(key = %key, "request cancelled");
                Err(FetchError::Cancelled { key })
            }
            result = work => result.map(Into::into).map_err(|err| {
                warn!(key = %key, error = %err, "producer failed");
                FetchError::from(err)
            }),
            _ = tokio::time::sleep(ceiling) => {
                cancel.cancel();
                guard.registry.counters.timed_out.fetch_add(1, Ordering::Relaxed);
                warn!(key = %key, after = ?ceiling, "request exceeded its ceiling, forcing resolution");
                Err(FetchError::Timeout { key, after: ceiling })
            }
        };

        // Evict before publishing so that a waiter reacting to the outcome can start a fresh request right away.
        drop(guard);
        tx.send_replace(Some(outcome));
    }

    async fn wait(key: &CacheKey, mut outcome: watch::Receiver<Outcome>) -> FetchResult<SharedResult> {
        match outcome.wait_for(Option::is_some).await {
            Ok(published) => (*published).clone().unwrap_or_else(|| {
                Err(SourceError::new(format!("request '{key}' resolved without an outcome")).into())
            }),
            Err(_) => Err(SourceError::new(format!("producer of '{key}' terminated without an outcome")).into()),
        }
    }

    /// Cancels the request in flight for `key`. Its waiters resolve with [`FetchError::Cancelled`] and the key can be
    /// fetched again immediately. Returns `false` if nothing was in flight.
    pub fn cancel(&self, key: &CacheKey) -> bool {
        let removed = self.registry.in_flight.lock().remove(key);
        match removed {
            Some(entry) => {
                entry.cancel.cancel();
                self.registry.counters.cancelled.fetch_add(1, Ordering::Relaxed);
                debug!(key = %key, generation = entry.generation, "in-flight request cancelled");
                true
            }
            None => false,
        }
    }

    /// Cancels everything in flight. Returns the number of cancelled requests.
    pub fn cancel_all(&self) -> usize {
        let drained: Vec<InFlight> = self.registry.in_flight.lock().drain().map(|(_, e)| e).collect();
        for entry in &drained {
            entry.cancel.cancel();
        }
        self.registry
            .counters
            .cancelled
            .fetch_add(drained.len() as u64, Ordering::Relaxed);
        drained.len()
    }

    pub fn is_in_flight(&self, key: &CacheKey) -> bool {
        self.registry.in_flight.lock().contains_key(key)
    }

    /// Returns the number of currently in-flight requests.
    pub fn in_flight_count(&self) -> usize {
        self.registry.in_flight.lock().len()
    }

    /// Returns a snapshot of the current statistics.
    pub fn stats(&self) -> CoalescerStats {
        let c = &self.registry.counters;
        CoalescerStats {
            total:     c.total.load(Ordering::Relaxed),
            coalesced: c.coalesced.load(Ordering::Relaxed),
            started:   c.started.load(Ordering::Relaxed),
            cancelled: c.cancelled.load(Ordering::Relaxed),
            timed_out: c.timed_out.load(Ordering::Relaxed),
        }
    }

    pub fn log_stats(&self) {
        let stats = self.stats();
        info!(
            total = stats.total,
            coalesced = stats.coalesced,
            started = stats.started,
            cancelled = stats.cancelled,
            timed_out = stats.timed_out,
            in_flight = self.in_flight_count(),
            coalescing_ratio = format!("{:.1}%", stats.coalescing_ratio() * 100.0),
            "Request coalescing statistics"
        );
    }
}

impl Debug for RequestCoalescer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestCoalescer")
            .field("timeout", &self.timeout)
            .field("in_flight", &self.in_flight_count())
            .finish()
    }
}
