#![cfg(any(test, feature = "test"))]
//! Fixtures shared by unit and integration tests.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Once;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use crate::error::SourceError;
use crate::source::MemorySource;
use crate::traits::DataSource;
use crate::types::DatasetItem;
use crate::types::FetchCriteria;
use crate::types::FetchMode;

static TRACING: Once = Once::new();

/// Installs a `fmt` subscriber honouring `RUST_LOG`. Safe to call from every test.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// `n` items located in Los Angeles, ids `item-0` to `item-{n-1}`.
///
/// Locations form a 20x20 lattice starting at (33.9, -118.6) with 0.01° latitude and 0.05° longitude steps, so bounds
/// tests can reason about which items fall inside a box.
pub fn sample_items(n: usize) -> Vec<DatasetItem> {
    (0..n)
        .map(|i| {
            DatasetItem::new(format!("item-{i}"), format!("Listing {i}"))
                .with_city("la")
                .with_status(if i % 3 == 0 { "pending" } else { "active" })
                .with_category(if i % 2 == 0 { "roofing" } else { "plumbing" })
                .with_location(33.9 + (i % 20) as f64 * 0.01, -118.6 + ((i / 20) % 20) as f64 * 0.05)
        })
        .collect()
}

/// Like [`sample_items`] but with ids prefixed by `city` and the city set accordingly.
pub fn sample_city_items(city: &str, n: usize) -> Vec<DatasetItem> {
    sample_items(n)
        .into_iter()
        .enumerate()
        .map(|(i, mut item)| {
            item.id = format!("{city}-{i}").into();
            item.city = Some(city.to_string());
            item
        })
        .collect()
}

/// [`MemorySource`] which remembers every query it answers.
#[derive(Debug, Default)]
pub struct CountingSource {
    inner:   MemorySource,
    queries: Mutex<Vec<FetchCriteria>>,
}

impl CountingSource {
    pub fn new(items: Vec<DatasetItem>) -> Self {
        Self {
            inner:   MemorySource::new(items),
            queries: Mutex::new(Vec::new()),
        }
    }

    pub fn query_count(&self) -> usize {
        self.queries.lock().len()
    }

    pub fn full_query_count(&self) -> usize {
        self.queries.lock().iter().filter(|c| c.mode == FetchMode::Full).count()
    }

    pub fn bounded_query_count(&self) -> usize {
        self.query_count() - self.full_query_count()
    }

    pub fn queries(&self) -> Vec<FetchCriteria> {
        self.queries.lock().clone()
    }
}

#[async_trait]
impl DataSource for CountingSource {
    async fn query(&self, criteria: &FetchCriteria, cancel: &CancellationToken) -> Result<Vec<DatasetItem>, SourceError> {
        self.queries.lock().push(criteria.clone());
        self.inner.query(criteria, cancel).await
    }

    fn name(&self) -> &str {
        "counting"
    }
}

/// Source whose full-mode queries block until [`open`](GatedSource::open) hands out a permit. Bounded queries pass
/// straight through. A blocked query gives up with an error as soon as its cancellation token fires.
#[derive(Debug)]
pub struct GatedSource {
    inner:     MemorySource,
    gate:      Semaphore,
    started:   AtomicUsize,
    cancelled: AtomicUsize,
}

impl GatedSource {
    pub fn new(items: Vec<DatasetItem>) -> Self {
        Self {
            inner:     MemorySource::new(items),
            gate:      Semaphore::new(0),
            started:   AtomicUsize::new(0),
            cancelled: AtomicUsize::new(0),
        }
    }

    /// Lets `n` blocked (or future) full queries through.
    pub fn open(&self, n: usize) {
        self.gate.add_permits(n);
    }

    /// Full queries that reached the gate.
    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    /// Full queries that observed their cancellation token while waiting.
    pub fn cancelled(&self) -> usize {
        self.cancelled.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DataSource for GatedSource {
    async fn query(&self, criteria: &FetchCriteria, cancel: &CancellationToken) -> Result<Vec<DatasetItem>, SourceError> {
        if criteria.mode == FetchMode::Full {
            self.started.fetch_add(1, Ordering::SeqCst);
            tokio::select! {
                permit = self.gate.acquire() => {
                    permit.map_err(|err| SourceError::with_source("gate closed", err))?.forget();
                }
                _ = cancel.cancelled() => {
                    self.cancelled.fetch_add(1, Ordering::SeqCst);
                    return Err(SourceError::new("cancelled while waiting at the gate"));
                }
            }
        }
        self.inner.query(criteria, cancel).await
    }

    fn name(&self) -> &str {
        "gated"
    }
}

/// Source that fails full-mode queries, or every query when built with [`always`](FailingSource::always).
#[derive(Debug)]
pub struct FailingSource {
    inner:    MemorySource,
    fail_all: bool,
    failures: AtomicUsize,
}

impl FailingSource {
    pub fn full_only(items: Vec<DatasetItem>) -> Self {
        Self {
            inner:    MemorySource::new(items),
            fail_all: false,
            failures: AtomicUsize::new(0),
        }
    }

    pub fn always() -> Self {
        Self {
            inner:    MemorySource::default(),
            fail_all: true,
            failures: AtomicUsize::new(0),
        }
    }

    pub fn failures(&self) -> usize {
        self.failures.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DataSource for FailingSource {
    async fn query(&self, criteria: &FetchCriteria, cancel: &CancellationToken) -> Result<Vec<DatasetItem>, SourceError> {
        if self.fail_all || criteria.mode == FetchMode::Full {
            self.failures.fetch_add(1, Ordering::SeqCst);
            return Err(SourceError::new(format!("backend unavailable ({})", criteria.mode)));
        }
        self.inner.query(criteria, cancel).await
    }

    fn name(&self) -> &str {
        "failing"
    }
}

/// Convenience for handing a fixture to an engine while keeping a handle for assertions.
pub fn shared<S: DataSource>(source: S) -> (Arc<S>, Arc<dyn DataSource>) {
    let source = Arc::new(source);
    let dynamic: Arc<dyn DataSource> = source.clone();
    (source, dynamic)
}
