//! Cachet cache system
//!
//! Content cache with pluggable validity:
//!
//! - **Keys**: deterministic strings built from a namespace, a stable id and
//!   sorted, percent-encoded attributes ([`keys`]).
//! - **Validity**: tokens stored with each value and compared by the producer
//!   against freshly computed ones ([`ValidityToken`]).
//! - **Regions**: bounded LRU stores with an optional disk spill tier
//!   ([`CacheStore`]), wrapped with a tag index for push invalidation
//!   ([`EventCache`]).
//! - **Refresh**: background jobs that keep selected entries warm
//!   ([`RefreshScheduler`]).
//!
//! ## Configuration
//!
//! Regions and refresh jobs come from `cachet.toml`:
//!
//! ```toml
//! [store]
//! work_dir = "/var/lib/cachet"
//!
//! [[store.regions]]
//! name = "main"
//! max_entries = 1000
//! directory = "main"
//!
//! [[refresh]]
//! uri = "feeds/news.xml"
//! cache-name = "news"
//! interval-seconds = 300
//! ```

mod config;
mod entry;
mod events;
pub mod keys;
mod lock;
mod regions;
mod registry;
mod scheduler;
mod store;
mod tier;
mod validity;

pub use config::{DEFAULT_MAX_ENTRIES, DEFAULT_REGION, StoreConfig};
pub use entry::{CacheEntry, CachedResponse};
pub use events::{ActionError, EventAction, EventCache, NamedEvent};
pub use keys::{AttributeMap, CopletInstance};
pub use regions::CacheRegions;
pub use registry::EventRegistry;
pub use scheduler::{
    DEFAULT_REFRESH_INTERVAL, RefreshError, RefreshJob, RefreshJobConfig, RefreshOutcome,
    RefreshScheduler, SchedulerHandle,
};
pub use store::{Cache, CacheStore, Keys, StoreError};
pub use tier::{BackingTier, DiskTier, TierError};
pub use validity::{AttributeSet, IncludeEntry, LiveInclude, ValidityToken, is_valid_all};
