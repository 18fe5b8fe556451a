//! Progressive loading.
//!
//! A load is served in two steps. The first one asks for a row-limited slice of the data and hands it to the caller
//! as soon as it arrives. The second one, the complete result, is deferred to an [`IdleScheduler`] and reported
//! through a callback only if nothing newer has been requested in the meantime.
//!
//! Both steps go through the cache store and the request coalescer, so repeated loads of the same criteria are cheap
//! and concurrent ones never hit the data source twice.

use futures::FutureExt;
use parking_lot::Mutex;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::instrument;
use tracing::warn;

use crate::coalescer::RequestCoalescer;
use crate::config::EngineConfig;
use crate::error::FetchError;
use crate::error::FetchResult;
use crate::error::SourceError;
use crate::fingerprint::Fingerprinter;
use crate::scheduler::TokioIdleScheduler;
use crate::store::TtlStore;
use crate::traits::DataSource;
use crate::traits::IdleScheduler;
use crate::types::CacheKey;
use crate::types::FetchCriteria;
use crate::types::FetchMode;
use crate::types::LoadOutcome;
use crate::types::ResultSet;
use crate::types::SharedResult;

// Cache-through, coalesced access to the data source. Cloned into background tasks.
#[derive(Clone)]
struct Fetcher {
    source:    Arc<dyn DataSource>,
    store:     Arc<TtlStore>,
    coalescer: Arc<RequestCoalescer>,
    ttl:       Duration,
}

impl Fetcher {
    async fn fetch(&self, key: &CacheKey, criteria: &FetchCriteria) -> FetchResult<SharedResult> {
        if let Some(hit) = self.store.get(key).await {
            return Ok(hit);
        }

        let source = Arc::clone(&self.source);
        let store = Arc::clone(&self.store);
        let criteria = criteria.clone();
        let owned_key = key.clone();
        let ttl = self.ttl;

        self.coalescer
            .fetch(key, move |cancel: CancellationToken| async move {
                // A request that finished between our cache miss and this point has stored its result already.
                if let Some(hit) = store.get(&owned_key).await {
                    return Ok(hit);
                }
                let items = source.query(&criteria, &cancel).await?;
                let result: SharedResult = Arc::new(ResultSet::from(items));
                // A cancelled answer may already be stale; don't let it into the cache.
                if !cancel.is_cancelled() {
                    store.set(&owned_key, Arc::clone(&result), ttl).await;
                }
                Ok::<_, SourceError>(result)
            })
            .await
    }
}

#[derive(Debug, Default)]
struct LoadState {
    generation:  u64,
    last_key:    Option<CacheKey>,
    last_issued: Option<Instant>,
    background:  Option<CancellationToken>,
}

impl LoadState {
    // Drops this loader's interest in pending background work. The coalesced fetch itself may have other waiters and
    // is left alone. Returns whether there was anything to drop.
    fn supersede(&mut self) -> bool {
        self.generation += 1;
        match self.background.take() {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }
}

/// Two-step loader of directory data.
///
/// One loader corresponds to one logical consumer (a map view, a list): a new load supersedes the previous one.
pub struct ProgressiveLoader {
    fetcher:       Fetcher,
    scheduler:     Arc<dyn IdleScheduler>,
    fingerprinter: Fingerprinter,
    config:        EngineConfig,
    state:         Arc<Mutex<LoadState>>,
}

impl ProgressiveLoader {
    /// Creates a loader with its own cache store and coalescer; the full step runs on the tokio runtime.
    pub fn new(source: Arc<dyn DataSource>, config: EngineConfig) -> Self {
        Self {
            fetcher: Fetcher {
                source,
                store: Arc::new(TtlStore::new(&config)),
                coalescer: Arc::new(RequestCoalescer::from_config(&config)),
                ttl: config.cache_ttl(),
            },
            scheduler: Arc::new(TokioIdleScheduler),
            fingerprinter: Fingerprinter::from_config(&config),
            config,
            state: Arc::new(Mutex::new(LoadState::default())),
        }
    }

    /// Use a cache store shared with other loaders.
    pub fn with_store(mut self, store: Arc<TtlStore>) -> Self {
        self.fetcher.store = store;
        self
    }

    /// Use a coalescer shared with other loaders.
    pub fn with_coalescer(mut self, coalescer: Arc<RequestCoalescer>) -> Self {
        self.fetcher.coalescer = coalescer;
        self
    }

    pub fn with_scheduler(mut self, scheduler: Arc<dyn IdleScheduler>) -> Self {
        self.scheduler = scheduler;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn fingerprinter(&self) -> &Fingerprinter {
        &self.fingerprinter
    }

    pub fn store(&self) -> &Arc<TtlStore> {
        &self.fetcher.store
    }

    pub fn coalescer(&self) -> &Arc<RequestCoalescer> {
        &self.fetcher.coalescer
    }

    /// Key identifying the data set behind `criteria` regardless of its fetch mode.
    pub fn session_key(&self, criteria: &FetchCriteria) -> CacheKey {
        self.fingerprinter
            .fingerprint(&criteria.clone().with_mode(FetchMode::Full))
    }

    /// Single cached, coalesced fetch of `criteria` as is.
    #[instrument(level = "trace", skip(self))]
    pub async fn fetch(&self, criteria: &FetchCriteria) -> FetchResult<SharedResult> {
        let key = self.fingerprinter.fingerprint(criteria);
        self.fetcher.fetch(&key, criteria).await
    }

    /// Loads `criteria` progressively.
    ///
    /// `on_initial` is called with the bounded result before this method returns. `on_full` is called later, from
    /// the scheduler, with the complete result unless the load has been superseded, the full fetch failed, or the
    /// complete result has no more items than the bounded one and `skip_redundant_full` is set.
    ///
    /// Both callbacks run while the loader's state is locked so that no newer load can slip in between the staleness
    /// check and the callback. They must not call back into the loader.
    ///
    /// Returns [`FetchError::Cancelled`] without calling `on_initial` if a newer load superseded this one while the
    /// bounded fetch was in progress.
    #[instrument(level = "debug", skip_all, fields(criteria = ?criteria))]
    pub async fn load_progressive<I, F>(
        &self,
        criteria: &FetchCriteria,
        on_initial: I,
        on_full: F,
    ) -> FetchResult<LoadOutcome>
    where
        I: FnOnce(SharedResult) + Send,
        F: FnOnce(SharedResult) + Send + 'static,
    {
        let initial_criteria = criteria.clone().with_mode(FetchMode::Bounded {
            limit: self.config.initial_limit(),
        });
        let full_criteria = criteria.clone().with_mode(FetchMode::Full);
        let initial_key = self.fingerprinter.fingerprint(&initial_criteria);
        let full_key = self.fingerprinter.fingerprint(&full_criteria);

        let (generation, token) = {
            let mut state = self.state.lock();
            let now = Instant::now();

            if state.last_key.as_ref() == Some(&full_key)
                && state
                    .last_issued
                    .is_some_and(|at| now.saturating_duration_since(at) < self.config.dedup_window())
            {
                debug!(key = %full_key, "identical load issued moments ago, skipping");
                return Ok(LoadOutcome::Skipped);
            }

            if state.supersede() {
                debug!(key = %full_key, "superseding the previous background load");
            }
            let token = CancellationToken::new();
            state.background = Some(token.clone());
            state.last_key = Some(full_key.clone());
            state.last_issued = Some(now);
            (state.generation, token)
        };

        let initial = match self.fetcher.fetch(&initial_key, &initial_criteria).await {
            Ok(initial) => initial,
            Err(err) => {
                {
                    // A failed load must not make an immediate retry look like a duplicate.
                    let mut state = self.state.lock();
                    if state.generation == generation {
                        state.last_key = None;
                        state.last_issued = None;
                    }
                }
                if err.is_cancelled() {
                    debug!(key = %initial_key, "initial fetch cancelled");
                }
                else {
                    error!(key = %initial_key, criteria = ?criteria, error = %err, "initial fetch failed");
                }
                return Err(err);
            }
        };

        let initial_count = initial.len();
        {
            let state = self.state.lock();
            if token.is_cancelled() || state.generation != generation {
                debug!(key = %initial_key, "load superseded before its initial result arrived");
                return Err(FetchError::Cancelled { key: initial_key });
            }
            on_initial(initial);
        }

        let task = Self::background(
            self.fetcher.clone(),
            Arc::clone(&self.state),
            generation,
            token,
            full_key,
            full_criteria,
            initial_count,
            self.config.skip_redundant_full(),
            on_full,
        );
        self.scheduler.run_when_idle(task.boxed()).await;

        Ok(LoadOutcome::Loaded {
            initial: initial_count,
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn background<F>(
        fetcher: Fetcher,
        state: Arc<Mutex<LoadState>>,
        generation: u64,
        token: CancellationToken,
        key: CacheKey,
        criteria: FetchCriteria,
        initial_count: usize,
        skip_redundant: bool,
        on_full: F,
    ) where
        F: FnOnce(SharedResult) + Send + 'static,
    {
        let result = tokio::select! {
            biased;
            _ = token.cancelled() => {
                debug!(key = %key, "full fetch abandoned");
                return;
            }
            result = fetcher.fetch(&key, &criteria) => result,
        };

        let full = match result {
            Ok(full) => full,
            Err(err) if err.is_cancelled() => {
                debug!(key = %key, "full fetch cancelled");
                return;
            }
            Err(err) => {
                warn!(key = %key, criteria = ?criteria, error = %err, "full fetch failed, keeping the initial result");
                return;
            }
        };

        let state = state.lock();
        if token.is_cancelled() || state.generation != generation {
            debug!(key = %key, "dropping full result of a superseded load");
            return;
        }

        if skip_redundant && full.len() <= initial_count {
            debug!(key = %key, items = full.len(), "full result adds nothing over the initial one");
            return;
        }

        debug!(key = %key, items = full.len(), "delivering full result");
        on_full(full);
        drop(state);
    }

    /// Abandons the pending full step of the last load, if any. Its `on_full` will never be called.
    ///
    /// The underlying full fetch keeps running if it is coalesced with other waiters; its result still lands in the
    /// cache.
    pub fn cancel_background(&self) -> bool {
        let mut state = self.state.lock();
        // Forget the last load too, so that reissuing it right away isn't treated as a duplicate.
        state.last_key = None;
        state.last_issued = None;
        state.supersede()
    }

    /// Drops every cache entry produced under this loader's namespace and key version.
    pub async fn invalidate_all(&self) {
        self.fetcher
            .store
            .invalidate_by_prefix(self.fingerprinter.prefix())
            .await;
    }
}

impl Debug for ProgressiveLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressiveLoader")
            .field("source", &self.fetcher.source.name())
            .field("prefix", &self.fingerprinter.prefix())
            .field("generation", &self.state.lock().generation)
            .finish()
    }
}
