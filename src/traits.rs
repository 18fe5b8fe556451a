use async_trait::async_trait;
use futures::future::BoxFuture;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::error::SourceError;
use crate::types::DatasetItem;
use crate::types::FetchCriteria;

/// The backend answering directory queries.
///
/// Implementations must honour every dimension of [`FetchCriteria`]: text search, status, category membership, city
/// scope, id inclusion (priority ids) and exclusion, and the row limit of [`FetchMode::Bounded`](crate::types::FetchMode).
#[async_trait]
pub trait DataSource: Send + Sync + 'static {
    /// `cancel` is fired when nobody is interested in the answer anymore. Implementations are expected to check it
    /// before and, if possible, while talking to the backend.
    async fn query(&self, criteria: &FetchCriteria, cancel: &CancellationToken)
        -> Result<Vec<DatasetItem>, SourceError>;

    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }
}

/// A slower cache tier that may be shared between processes; e.g. an HTTP edge cache or Redis.
///
/// Payloads are opaque bytes. The tier is responsible for expiring entries after `ttl`.
#[async_trait]
pub trait SharedTier: Send + Sync + 'static {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, SourceError>;
    async fn put(&self, key: &str, payload: Vec<u8>, ttl: Duration) -> Result<(), SourceError>;
    async fn remove(&self, key: &str) -> Result<(), SourceError>;
    async fn remove_prefix(&self, prefix: &str) -> Result<(), SourceError>;
}

/// Runs deferred work when the environment is otherwise idle.
///
/// Whether the call returns before or after `task` completes is up to the implementation.
#[async_trait]
pub trait IdleScheduler: Send + Sync + 'static {
    async fn run_when_idle(&self, task: BoxFuture<'static, ()>);
}
