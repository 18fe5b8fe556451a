//! Two-tier TTL cache of fetched result sets.
//!
//! The local tier is an in-process [moka](https://crates.io/crates/moka) cache with per-entry expiry. The optional
//! shared tier is anything implementing [`SharedTier`]; entries travel there as JSON. Reads go local first, then
//! shared; a shared hit is promoted into the local tier for whatever TTL it has left. Writes go to both tiers.
//!
//! The shared tier is an optimization only: its failures are logged and treated as misses.

use async_trait::async_trait;
use dashmap::DashMap;
use moka::future::Cache;
use moka::Expiry;
use serde::Deserialize;
use serde::Serialize;
use std::fmt::Debug;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;
use tracing::debug;
use tracing::warn;

use crate::config::EngineConfig;
use crate::error::SourceError;
use crate::traits::SharedTier;
use crate::types::CacheKey;
use crate::types::ResultSet;
use crate::types::SharedResult;

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub value:      SharedResult,
    pub expires_at: Instant,
}

impl CacheEntry {
    fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

struct EntryExpiry;

impl Expiry<CacheKey, CacheEntry> for EntryExpiry {
    fn expire_after_create(&self, _key: &CacheKey, value: &CacheEntry, created_at: Instant) -> Option<Duration> {
        Some(value.expires_at.saturating_duration_since(created_at))
    }

    fn expire_after_update(
        &self,
        _key: &CacheKey,
        value: &CacheEntry,
        updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.expires_at.saturating_duration_since(updated_at))
    }
}

#[derive(Serialize, Deserialize)]
struct SharedPayload {
    #[serde(rename = "e")]
    expires_at_ms: u64,
    #[serde(rename = "v")]
    value:         ResultSet,
}

/// Longest lifetime an entry can get. Longer TTLs are clamped to it, which keeps deadline arithmetic from
/// overflowing.
pub const MAX_TTL: Duration = Duration::from_secs(365 * 24 * 60 * 60);

fn unix_ms(at: SystemTime) -> u64 {
    at.duration_since(UNIX_EPOCH).map_or(0, |d| d.as_millis() as u64)
}

#[derive(Debug, Default)]
struct Counters {
    local_hits:  AtomicU64,
    shared_hits: AtomicU64,
    misses:      AtomicU64,
    writes:      AtomicU64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub local_hits:  u64,
    pub shared_hits: u64,
    pub misses:      u64,
    pub writes:      u64,
}

impl CacheStats {
    pub fn hit_ratio(&self) -> f64 {
        let hits = self.local_hits + self.shared_hits;
        let total = hits + self.misses;
        if total == 0 {
            0.0
        }
        else {
            hits as f64 / total as f64
        }
    }
}

pub struct TtlStore {
    local:       Cache<CacheKey, CacheEntry>,
    shared:      Option<Arc<dyn SharedTier>>,
    default_ttl: Duration,
    counters:    Counters,
}

impl TtlStore {
    pub fn new(config: &EngineConfig) -> Self {
        Self::build(config, None)
    }

    pub fn with_shared_tier(config: &EngineConfig, shared: Arc<dyn SharedTier>) -> Self {
        Self::build(config, Some(shared))
    }

    fn build(config: &EngineConfig, shared: Option<Arc<dyn SharedTier>>) -> Self {
        let local = Cache::builder()
            .name(&format!("{}-local", config.namespace()))
            .max_capacity(config.local_capacity())
            .expire_after(EntryExpiry)
            .support_invalidation_closures()
            .build();

        Self {
            local,
            shared,
            default_ttl: config.cache_ttl(),
            counters: Counters::default(),
        }
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    pub fn has_shared_tier(&self) -> bool {
        self.shared.is_some()
    }

    pub async fn get(&self, key: &CacheKey) -> Option<SharedResult> {
        let now = Instant::now();

        if let Some(entry) = self.local.get(key).await {
            if entry.is_live(now) {
                self.counters.local_hits.fetch_add(1, Ordering::Relaxed);
                debug!(key = %key, "local cache hit");
                return Some(entry.value);
            }
            self.local.invalidate(key).await;
        }

        if let Some(value) = self.get_shared(key).await {
            self.counters.shared_hits.fetch_add(1, Ordering::Relaxed);
            debug!(key = %key, "shared cache hit");
            return Some(value);
        }

        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        debug!(key = %key, "cache miss");
        None
    }

    async fn get_shared(&self, key: &CacheKey) -> Option<SharedResult> {
        let shared = self.shared.as_ref()?;

        let payload = match shared.get(key.as_str()).await {
            Ok(Some(payload)) => payload,
            Ok(None) => return None,
            Err(err) => {
                warn!(key = %key, error = %err, "shared cache tier read failed");
                return None;
            }
        };

        let payload: SharedPayload = match serde_json::from_slice(&payload) {
            Ok(p) => p,
            Err(err) => {
                warn!(key = %key, error = %err, "dropping undecodable shared cache entry");
                self.remove_shared(key).await;
                return None;
            }
        };

        let now_ms = unix_ms(SystemTime::now());
        if payload.expires_at_ms <= now_ms {
            self.remove_shared(key).await;
            return None;
        }

        let remaining = Duration::from_millis(payload.expires_at_ms - now_ms).min(MAX_TTL);
        let value = Arc::new(payload.value);
        self.local
            .insert(
                key.clone(),
                CacheEntry {
                    value:      Arc::clone(&value),
                    expires_at: Instant::now() + remaining,
                },
            )
            .await;
        Some(value)
    }

    async fn remove_shared(&self, key: &CacheKey) {
        if let Some(shared) = self.shared.as_ref() {
            if let Err(err) = shared.remove(key.as_str()).await {
                warn!(key = %key, error = %err, "shared cache tier removal failed");
            }
        }
    }

    /// Stores `value` under `key` for `ttl`, at most [`MAX_TTL`].
    pub async fn set(&self, key: &CacheKey, value: SharedResult, ttl: Duration) {
        let ttl = ttl.min(MAX_TTL);
        self.counters.writes.fetch_add(1, Ordering::Relaxed);
        debug!(key = %key, items = value.len(), ttl = ?ttl, "cache write");

        if let Some(shared) = self.shared.as_ref() {
            let payload = SharedPayload {
                expires_at_ms: unix_ms(SystemTime::now() + ttl),
                value:         (*value).clone(),
            };
            match serde_json::to_vec(&payload) {
                Ok(bytes) => {
                    if let Err(err) = shared.put(key.as_str(), bytes, ttl).await {
                        warn!(key = %key, error = %err, "shared cache tier write failed");
                    }
                }
                Err(err) => warn!(key = %key, error = %err, "failed to encode shared cache entry"),
            }
        }

        self.local
            .insert(
                key.clone(),
                CacheEntry {
                    value,
                    expires_at: Instant::now() + ttl,
                },
            )
            .await;
    }

    pub async fn invalidate(&self, key: &CacheKey) {
        debug!(key = %key, "invalidating cache entry");
        self.local.invalidate(key).await;
        self.remove_shared(key).await;
    }

    pub async fn invalidate_by_prefix(&self, prefix: &str) {
        debug!(prefix, "invalidating cache entries by prefix");
        let owned = prefix.to_string();
        if let Err(err) = self.local.invalidate_entries_if(move |key, _| key.starts_with(&owned)) {
            // Only possible if invalidation closures were not enabled; fall back to a full sweep.
            warn!(prefix, error = %err, "predicate invalidation unavailable, sweeping local tier");
            let doomed: Vec<Arc<CacheKey>> = self
                .local
                .iter()
                .filter(|(key, _)| key.starts_with(prefix))
                .map(|(key, _)| key)
                .collect();
            for key in doomed {
                self.local.invalidate(key.as_ref()).await;
            }
        }

        if let Some(shared) = self.shared.as_ref() {
            if let Err(err) = shared.remove_prefix(prefix).await {
                warn!(prefix, error = %err, "shared cache tier prefix removal failed");
            }
        }
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            local_hits:  self.counters.local_hits.load(Ordering::Relaxed),
            shared_hits: self.counters.shared_hits.load(Ordering::Relaxed),
            misses:      self.counters.misses.load(Ordering::Relaxed),
            writes:      self.counters.writes.load(Ordering::Relaxed),
        }
    }

    /// Approximate number of entries in the local tier.
    pub async fn entry_count(&self) -> u64 {
        self.local.run_pending_tasks().await;
        self.local.entry_count()
    }
}

impl Debug for TtlStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TtlStore")
            .field("name", &self.local.name())
            .field("shared", &self.shared.is_some())
            .field("default_ttl", &self.default_ttl)
            .field("stats", &self.stats())
            .finish()
    }
}

/// In-process stand-in for a shared tier. Useful for tests and single-node deployments.
#[derive(Debug, Default)]
pub struct MemorySharedTier {
    entries: DashMap<String, (Vec<u8>, Instant)>,
}

impl MemorySharedTier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl SharedTier for MemorySharedTier {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, SourceError> {
        let now = Instant::now();
        let expired = match self.entries.get(key) {
            Some(entry) if now < entry.1 => return Ok(Some(entry.0.clone())),
            Some(_) => true,
            None => false,
        };
        if expired {
            self.entries.remove_if(key, |_, (_, expires_at)| now >= *expires_at);
        }
        Ok(None)
    }

    async fn put(&self, key: &str, payload: Vec<u8>, ttl: Duration) -> Result<(), SourceError> {
        self.entries.insert(key.to_string(), (payload, Instant::now() + ttl.min(MAX_TTL)));
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), SourceError> {
        self.entries.remove(key);
        Ok(())
    }

    async fn remove_prefix(&self, prefix: &str) -> Result<(), SourceError> {
        self.entries.retain(|key, _| !key.starts_with(prefix));
        Ok(())
    }
}
