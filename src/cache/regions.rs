//! Named regions opened from configuration.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::info;

use super::config::{DEFAULT_REGION, StoreConfig};
use super::events::EventCache;
use super::store::{Cache, StoreError};

/// Every configured region, each an independent [`EventCache`].
#[derive(Default)]
pub struct CacheRegions {
    regions: BTreeMap<String, Arc<EventCache>>,
}

impl CacheRegions {
    /// Open each configured region. Duplicate names are a configuration error.
    pub fn open<'a, I>(configs: I) -> Result<Self, StoreError>
    where
        I: IntoIterator<Item = &'a StoreConfig>,
    {
        let mut regions = BTreeMap::new();
        for config in configs {
            if regions.contains_key(&config.region) {
                return Err(StoreError::config(
                    &config.region,
                    "region is configured more than once",
                ));
            }
            let cache = EventCache::open(config)?;
            regions.insert(config.region.clone(), Arc::new(cache));
        }

        info!(regions = regions.len(), "cache regions opened");
        Ok(Self { regions })
    }

    pub fn get(&self, name: &str) -> Option<Arc<EventCache>> {
        self.regions.get(name).cloned()
    }

    /// The `main` region, or the only region when there is just one.
    pub fn default_region(&self) -> Option<Arc<EventCache>> {
        self.get(DEFAULT_REGION).or_else(|| {
            (self.regions.len() == 1)
                .then(|| self.regions.values().next().cloned())
                .flatten()
        })
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.regions.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    /// Close every region, returning the total number of flushed entries.
    pub fn close_all(&self) -> usize {
        self.regions
            .values()
            .map(|region| {
                let flushed = region.close();
                info!(region = %region.region(), flushed, "region closed");
                flushed
            })
            .sum()
    }
}
