//! Region storage.
//!
//! [`CacheStore`] keeps a bounded LRU map of entries in memory. When a spill
//! directory is configured, entries evicted for capacity move to a
//! [`BackingTier`] and memory misses fall through to it. Tier failures never
//! reach the caller: they are logged and the operation degrades to a miss or a
//! no-op.
//!
//! The store does not compare validity. Producers fetch a [`CachedResponse`],
//! compare their freshly computed validity against it and store a new entry
//! when it is stale. Two producers that miss on the same key concurrently
//! both recompute and the last `put` wins; there is no per-key single flight.

use std::collections::HashSet;
use std::io;
use std::path::PathBuf;
use std::sync::RwLock;

use bytes::Bytes;
use lru::LruCache;
use metrics::counter;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::config::StoreConfig;
use super::entry::{CacheEntry, CachedResponse};
use super::lock;
use super::tier::{BackingTier, DiskTier, TierError};
use super::validity::ValidityToken;

const METRIC_HIT: &str = "cachet_store_hit_total";
const METRIC_MISS: &str = "cachet_store_miss_total";
const METRIC_EVICT: &str = "cachet_store_evict_total";
const METRIC_SPILL: &str = "cachet_store_spill_total";
const METRIC_TIER_ERROR: &str = "cachet_tier_error_total";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid configuration for region `{region}`: {reason}")]
    Config { region: String, reason: String },
    #[error("cache directory `{path}` for region `{region}` is not usable: {source}")]
    Directory {
        region: String,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to open backing tier for region `{region}`: {source}")]
    Tier {
        region: String,
        #[source]
        source: TierError,
    },
}

impl StoreError {
    pub(crate) fn config(region: &str, reason: impl Into<String>) -> Self {
        Self::Config {
            region: region.to_string(),
            reason: reason.into(),
        }
    }
}

/// Operations shared by every cache region.
///
/// None of these return errors: storage faults are recovered inside the
/// implementation.
pub trait Cache: Send + Sync {
    fn region(&self) -> &str;

    /// Value and stored validity for `key`, if present and not expired.
    fn get_response(&self, key: &str) -> Option<CachedResponse>;

    /// Replace any entry stored under the entry's key.
    fn put(&self, entry: CacheEntry);

    fn remove(&self, key: &str);

    fn clear(&self);

    /// Evict one entry chosen by the eviction policy, returning its key.
    fn free(&self) -> Option<String>;

    fn contains_key(&self, key: &str) -> bool;

    /// Snapshot of the keys currently held, in no particular order.
    fn keys(&self) -> Keys;

    fn size(&self) -> usize;

    fn get(&self, key: &str) -> Option<Bytes> {
        self.get_response(key).map(|response| response.value)
    }

    fn store(&self, key: &str, value: Bytes, validity: Vec<ValidityToken>) {
        self.put(CacheEntry::new(key, value, validity));
    }
}

/// Iterator over a key snapshot taken by [`Cache::keys`].
#[derive(Debug)]
pub struct Keys {
    inner: std::vec::IntoIter<String>,
}

impl Keys {
    fn new(keys: Vec<String>) -> Self {
        Self {
            inner: keys.into_iter(),
        }
    }
}

impl Iterator for Keys {
    type Item = String;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

impl ExactSizeIterator for Keys {}

impl From<Vec<String>> for Keys {
    fn from(keys: Vec<String>) -> Self {
        Self::new(keys)
    }
}

/// Keys that left the region entirely during an operation.
pub(crate) type Dropped = Vec<String>;

/// Result of deleting a key from memory and the tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Removal {
    Removed,
    Absent,
    /// The tier copy could not be deleted and can still be read back.
    Stranded,
}

/// One cache region.
pub struct CacheStore {
    region: String,
    entries: RwLock<LruCache<String, CacheEntry>>,
    tier: Option<Box<dyn BackingTier>>,
}

impl CacheStore {
    /// Open a region, preparing its spill directory when one is configured.
    pub fn open(config: &StoreConfig) -> Result<Self, StoreError> {
        let tier = match config.prepare()? {
            Some(directory) => {
                let tier = DiskTier::open(&config.region, directory).map_err(|source| {
                    StoreError::Tier {
                        region: config.region.clone(),
                        source,
                    }
                })?;
                Some(Box::new(tier) as Box<dyn BackingTier>)
            }
            None => None,
        };

        Ok(Self::assemble(config, tier))
    }

    /// Open a region over a caller-supplied tier; `config.directory` is ignored.
    pub fn with_tier(
        config: &StoreConfig,
        tier: impl BackingTier + 'static,
    ) -> Result<Self, StoreError> {
        if config.region.trim().is_empty() {
            return Err(StoreError::config(&config.region, "region name must not be empty"));
        }
        Ok(Self::assemble(config, Some(Box::new(tier))))
    }

    fn assemble(config: &StoreConfig, tier: Option<Box<dyn BackingTier>>) -> Self {
        info!(
            region = %config.region,
            max_entries = config.max_entries_non_zero().get(),
            spill = tier.is_some(),
            "cache region opened"
        );

        Self {
            region: config.region.clone(),
            entries: RwLock::new(LruCache::new(config.max_entries_non_zero())),
            tier,
        }
    }

    /// Move every in-memory entry to the tier and empty the memory map.
    ///
    /// Returns the number of entries flushed. Without a tier the entries are
    /// simply discarded.
    pub fn close(&self) -> usize {
        let mut entries = lock::write(&self.entries, &self.region, "close");
        let mut flushed = 0;

        while let Some((key, entry)) = entries.pop_lru() {
            let Some(tier) = &self.tier else {
                continue;
            };
            if entry.is_expired() {
                continue;
            }
            match tier.save(&entry) {
                Ok(()) => flushed += 1,
                Err(err) => self.tier_failed("close", &key, &err),
            }
        }

        info!(region = %self.region, flushed, "cache region closed");
        flushed
    }

    pub fn has_tier(&self) -> bool {
        self.tier.is_some()
    }

    /// Number of entries held in memory, excluding the tier.
    pub fn memory_len(&self) -> usize {
        lock::read(&self.entries, &self.region, "memory_len").len()
    }

    pub(crate) fn fetch(&self, key: &str) -> (Option<CacheEntry>, Dropped) {
        let mut dropped = Dropped::new();
        let mut entries = lock::write(&self.entries, &self.region, "get");

        if let Some(entry) = entries.get(key) {
            if !entry.is_expired() {
                self.record_hit("memory");
                return (Some(entry.clone()), dropped);
            }
            entries.pop(key);
            debug!(region = %self.region, key, "expired entry removed on read");
            dropped.push(key.to_string());
            self.record_miss();
            return (None, dropped);
        }

        let Some(tier) = &self.tier else {
            self.record_miss();
            return (None, dropped);
        };

        let loaded = match tier.load(key) {
            Ok(loaded) => loaded,
            Err(err) => {
                self.tier_failed("get", key, &err);
                self.record_miss();
                return (None, dropped);
            }
        };

        let Some(entry) = loaded else {
            self.record_miss();
            return (None, dropped);
        };

        if let Err(err) = tier.delete(key) {
            self.tier_failed("get", key, &err);
        }

        if entry.is_expired() {
            dropped.push(key.to_string());
            self.record_miss();
            return (None, dropped);
        }

        self.record_hit("tier");
        if let Some((displaced, evicted)) = entries.push(key.to_string(), entry.clone()) {
            dropped.extend(self.evict(displaced, evicted));
        }
        (Some(entry), dropped)
    }

    pub(crate) fn insert(&self, entry: CacheEntry) -> Dropped {
        let key = entry.key.clone();
        let mut entries = lock::write(&self.entries, &self.region, "store");

        if let Some(tier) = &self.tier
            && let Err(err) = tier.delete(&key)
        {
            self.tier_failed("store", &key, &err);
        }

        debug!(region = %self.region, key = %key, tokens = entry.validity.len(), "entry stored");

        match entries.push(key.clone(), entry) {
            Some((displaced, _)) if displaced == key => Dropped::new(),
            Some((displaced, evicted)) => self.evict(displaced, evicted).into_iter().collect(),
            None => Dropped::new(),
        }
    }

    pub(crate) fn delete(&self, key: &str) -> Removal {
        let mut entries = lock::write(&self.entries, &self.region, "remove");
        let in_memory = entries.pop(key).is_some();

        let found = match &self.tier {
            Some(tier) => match tier.delete(key) {
                Ok(found) => found,
                Err(err) => {
                    self.tier_failed("remove", key, &err);
                    return Removal::Stranded;
                }
            },
            None => false,
        };

        if in_memory || found {
            Removal::Removed
        } else {
            Removal::Absent
        }
    }

    /// Empty both layers. Returns false when the tier kept some of its records.
    pub(crate) fn wipe(&self) -> bool {
        lock::write(&self.entries, &self.region, "clear").clear();
        match &self.tier {
            Some(tier) => match tier.clear() {
                Ok(()) => true,
                Err(err) => {
                    self.tier_failed("clear", "*", &err);
                    false
                }
            },
            None => true,
        }
    }

    pub(crate) fn release_one(&self) -> Option<(String, bool)> {
        let mut entries = lock::write(&self.entries, &self.region, "free");
        let (key, entry) = entries.pop_lru()?;
        let dropped = self.evict(key.clone(), entry).is_some();
        Some((key, dropped))
    }

    /// Keys with the event names they are tagged with, across both tiers.
    pub(crate) fn tagged_keys(&self) -> Vec<(String, Vec<String>)> {
        let mut tagged: Vec<(String, Vec<String>)> =
            lock::read(&self.entries, &self.region, "tagged_keys")
                .iter()
                .filter(|(_, entry)| !entry.events.is_empty())
                .map(|(key, entry)| (key.clone(), entry.events.clone()))
                .collect();

        if let Some(tier) = &self.tier {
            match tier.tagged() {
                Ok(spilled) => tagged.extend(spilled),
                Err(err) => self.tier_failed("tagged_keys", "*", &err),
            }
        }
        tagged
    }

    /// Spill an evicted entry, returning its key if it left the region.
    fn evict(&self, key: String, entry: CacheEntry) -> Option<String> {
        counter!(METRIC_EVICT, "region" => self.region.clone()).increment(1);

        let Some(tier) = &self.tier else {
            debug!(region = %self.region, key = %key, "entry evicted");
            return Some(key);
        };
        if entry.is_expired() {
            return Some(key);
        }

        match tier.save(&entry) {
            Ok(()) => {
                counter!(METRIC_SPILL, "region" => self.region.clone()).increment(1);
                debug!(region = %self.region, key = %key, "entry spilled to tier");
                None
            }
            Err(err) => {
                self.tier_failed("spill", &key, &err);
                Some(key)
            }
        }
    }

    fn record_hit(&self, layer: &'static str) {
        counter!(METRIC_HIT, "region" => self.region.clone(), "layer" => layer).increment(1);
    }

    fn record_miss(&self) {
        counter!(METRIC_MISS, "region" => self.region.clone()).increment(1);
    }

    fn tier_failed(&self, op: &'static str, key: &str, err: &TierError) {
        counter!(METRIC_TIER_ERROR, "region" => self.region.clone(), "op" => op).increment(1);
        warn!(region = %self.region, op, key, error = %err, "cache tier operation failed");
    }
}

impl Cache for CacheStore {
    fn region(&self) -> &str {
        &self.region
    }

    fn get_response(&self, key: &str) -> Option<CachedResponse> {
        self.fetch(key).0.map(|entry| entry.response())
    }

    fn put(&self, entry: CacheEntry) {
        self.insert(entry);
    }

    fn remove(&self, key: &str) {
        self.delete(key);
    }

    fn clear(&self) {
        self.wipe();
    }

    fn free(&self) -> Option<String> {
        self.release_one().map(|(key, _)| key)
    }

    fn contains_key(&self, key: &str) -> bool {
        let in_memory = lock::read(&self.entries, &self.region, "contains_key")
            .peek(key)
            .is_some_and(|entry| !entry.is_expired());
        if in_memory {
            return true;
        }

        match &self.tier {
            Some(tier) => tier.contains(key).unwrap_or_else(|err| {
                self.tier_failed("contains_key", key, &err);
                false
            }),
            None => false,
        }
    }

    fn keys(&self) -> Keys {
        let mut keys: HashSet<String> = lock::read(&self.entries, &self.region, "keys")
            .iter()
            .filter(|(_, entry)| !entry.is_expired())
            .map(|(key, _)| key.clone())
            .collect();

        if let Some(tier) = &self.tier {
            match tier.keys() {
                Ok(spilled) => keys.extend(spilled),
                Err(err) => self.tier_failed("keys", "*", &err),
            }
        }

        Keys::new(keys.into_iter().collect())
    }

    fn size(&self) -> usize {
        self.keys().len()
    }
}
