//! # mapsync
//!
//! Request coalescing, TTL caching and progressive synchronization of datasets shown on a map.
//!
//! # The Basics
//!
//! The crate is designed for the following use case:
//!
//! - A directory-like backend answering filtered queries; e.g., listings by city, status and category.
//! - Queries are expensive enough that asking twice for the same thing hurts.
//! - Users want to see *something* right away, and the rest of the data soon after.
//! - The consumer can't render everything it has; what's on screen depends on the map's zoom and bounds.
//!
//! The engine operates on the following principles:
//!
//! - It is backend-agnostic: the backend is a [`DataSource`](traits::DataSource).
//! - Identical concurrent queries share one execution; see [`RequestCoalescer`](coalescer::RequestCoalescer).
//! - Results are cached with a TTL in an in-process [moka](https://crates.io/crates/moka) tier, optionally backed by a
//!   shared tier; see [`TtlStore`](store::TtlStore).
//! - A load first delivers a row-limited result and then, when the runtime is idle, the complete one; see
//!   [`ProgressiveLoader`](progressive::ProgressiveLoader).
//! - Successive results are merged into one stable dataset which is windowed down to what the viewport needs; see
//!   [`DatasetSession`](session::DatasetSession).
//! - Fully async, with explicit cancellation everywhere work can be abandoned.
//!
//! The flow of a request:
//!
//! ```text
//! criteria ─► Fingerprinter ─► TtlStore ─(miss)─► RequestCoalescer ─► DataSource
//!                                  ▲                                      │
//!                                  └──────────────── write ◄──────────────┘
//!
//! ProgressiveLoader: bounded fetch ─► on_initial ─► IdleScheduler ─► full fetch ─► on_full
//! DatasetSession:    on_initial / on_full ─► ResultMerger ─► MergedDataset ─► ViewportWindower
//! ```
//!
//! # Policies
//!
//! Every threshold the engine relies on, from cache TTL and initial row limit to dedup windows and zoom caps, is a
//! field of [`EngineConfig`](config::EngineConfig). The defaults are tuned for an interactive map and aren't a
//! contract.

pub mod coalescer;
pub mod config;
pub mod error;
pub mod fingerprint;
pub mod merger;
pub mod progressive;
pub mod scheduler;
pub mod session;
pub mod source;
pub mod store;
pub mod test;
pub mod traits;
pub mod types;
pub mod window;

#[doc(inline)]
pub use progressive::ProgressiveLoader;
#[doc(inline)]
pub use session::DatasetSession;

pub mod prelude {
    pub use crate::coalescer::RequestCoalescer;
    pub use crate::config::EngineConfig;
    pub use crate::error::*;
    pub use crate::fingerprint::Fingerprinter;
    pub use crate::merger::MergeStatus;
    pub use crate::merger::MergedDataset;
    pub use crate::merger::ResultMerger;
    pub use crate::progressive::ProgressiveLoader;
    pub use crate::scheduler::ImmediateScheduler;
    pub use crate::scheduler::TokioIdleScheduler;
    pub use crate::session::DatasetSession;
    pub use crate::source::MemorySource;
    pub use crate::store::TtlStore;
    pub use crate::traits::*;
    pub use crate::types::*;
    pub use crate::window::ViewportWindower;
    pub use crate::window::ZoomCaps;
}
