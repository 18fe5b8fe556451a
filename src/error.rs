use crate::types::CacheKey;
use std::error::Error as StdError;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Failure reported by a [`DataSource`](crate::traits::DataSource) or a [`SharedTier`](crate::traits::SharedTier).
#[derive(Debug, Error)]
#[error("{message}")]
pub struct SourceError {
    message: String,
    #[source]
    source:  Option<Box<dyn StdError + Send + Sync + 'static>>,
}

impl SourceError {
    pub fn new<S: ToString>(message: S) -> Self {
        Self {
            message: message.to_string(),
            source:  None,
        }
    }

    pub fn with_source<S, E>(message: S, source: E) -> Self
    where
        S: ToString,
        E: StdError + Send + Sync + 'static,
    {
        Self {
            message: message.to_string(),
            source:  Some(Box::new(source)),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<serde_json::Error> for SourceError {
    fn from(err: serde_json::Error) -> Self {
        Self::with_source("malformed cache payload", err)
    }
}

/// What a waiter of a coalesced fetch can get instead of a result.
///
/// The enum is cheap to clone so that every waiter of the same in-flight request receives its own copy.
#[derive(Debug, Clone, Error)]
pub enum FetchError {
    #[error("data source failed: {0}")]
    Source(Arc<SourceError>),

    /// The request was superseded or explicitly aborted. Callers normally ignore it.
    #[error("request '{key}' was cancelled")]
    Cancelled { key: CacheKey },

    #[error("request '{key}' timed out after {after:?}")]
    Timeout { key: CacheKey, after: Duration },
}

impl FetchError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    /// Source failures and timeouts are worth another attempt; cancellations are not.
    pub fn is_retryable(&self) -> bool {
        !self.is_cancelled()
    }
}

impl From<SourceError> for FetchError {
    fn from(err: SourceError) -> Self {
        Self::Source(Arc::new(err))
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ConfigError {
    #[error("zoom cap tiers must be sorted by ascending zoom: {zoom} follows {previous}")]
    UnsortedZoomTiers { previous: f64, zoom: f64 },

    #[error("zoom caps must not shrink as zoom grows: cap {cap} at zoom {zoom} is below {previous}")]
    ShrinkingZoomCaps { previous: usize, cap: usize, zoom: f64 },
}

pub type FetchResult<T> = Result<T, FetchError>;
