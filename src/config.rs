use crate::window::ZoomCaps;
use fieldx::fxstruct;
use std::time::Duration;

/// Policy knobs of the engine.
///
/// None of the values is a contract; they are heuristics tuned for an interactive map and can be adjusted per
/// deployment.
///
/// ```ignore
/// let config = EngineConfig::builder()
///     .namespace("listings")
///     .key_version(4)
///     .initial_limit(200)
///     .cache_ttl(Duration::from_secs(120))
///     .build()?;
/// ```
#[derive(Debug, Clone)]
#[fxstruct(no_new, default, builder, get(copy))]
pub struct EngineConfig {
    /// Leading segment of every cache key.
    #[fieldx(get(clone), builder(into), default("mapsync".to_string()))]
    namespace: String,

    /// Bump whenever the meaning of a query changes so that old cache entries stop matching.
    #[fieldx(default(1))]
    key_version: u32,

    #[fieldx(default(Duration::from_secs(60)))]
    cache_ttl: Duration,

    /// Upper bound of entries kept by the in-process cache tier.
    #[fieldx(default(10_000))]
    local_capacity: u64,

    /// Row limit of the cheap initial fetch.
    #[fieldx(default(150))]
    initial_limit: usize,

    /// Ceiling after which a stuck in-flight request is forcibly resolved and evicted.
    #[fieldx(default(Duration::from_secs(30)))]
    request_timeout: Duration,

    /// Identical progressive loads issued closer than this are dropped.
    #[fieldx(default(Duration::from_millis(100)))]
    dedup_window: Duration,

    /// Merges of same-sized result sets closer than this are dropped.
    #[fieldx(default(Duration::from_millis(100)))]
    merge_window: Duration,

    /// Don't report a full result which brings nothing over the initial one.
    #[fieldx(default(true))]
    skip_redundant_full: bool,

    #[fieldx(get(clone), default(ZoomCaps::default()))]
    zoom_caps: ZoomCaps,
}
