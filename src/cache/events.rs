//! Push invalidation.
//!
//! An [`EventCache`] wraps a region and indexes its entries by the event names
//! they were tagged with at store time. Processing a [`NamedEvent`] removes
//! every entry carrying that tag. Untagged entries are never touched here and
//! go stale only through validity comparison.
//!
//! When the backing tier refuses a delete, the key keeps its tags and is
//! marked stranded: reads treat it as absent and retry the delete until the
//! tier copy is gone.

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use metrics::counter;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::config::StoreConfig;
use super::entry::{CacheEntry, CachedResponse};
use super::lock;
use super::registry::EventRegistry;
use super::store::{Cache, CacheStore, Dropped, Keys, Removal, StoreError};
use super::validity::ValidityToken;

const METRIC_EVENT_INVALIDATED: &str = "cachet_event_invalidated_total";

/// An invalidation signal matched against entry tags by name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NamedEvent {
    name: String,
}

impl NamedEvent {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for NamedEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// A region with an event tag index.
///
/// Every mutation runs under the index lock so that a store and an event on
/// the same key cannot interleave and leave a tagged entry behind.
pub struct EventCache {
    store: CacheStore,
    index: Mutex<TagIndex>,
}

#[derive(Debug, Default)]
struct TagIndex {
    tags: EventRegistry,
    /// Removed keys whose tier copy could not be deleted yet.
    stranded: HashSet<String>,
}

impl TagIndex {
    fn forget(&mut self, key: &str) {
        self.tags.unregister(key);
        self.stranded.remove(key);
    }

    /// Record the outcome of a delete. Returns true if the entry is gone.
    fn settle(&mut self, key: &str, removal: Removal) -> bool {
        match removal {
            Removal::Removed | Removal::Absent => {
                self.forget(key);
                true
            }
            Removal::Stranded => {
                self.stranded.insert(key.to_string());
                false
            }
        }
    }
}

impl EventCache {
    /// Open the region and rebuild the tag index from entries already on disk.
    pub fn open(config: &StoreConfig) -> Result<Self, StoreError> {
        CacheStore::open(config).map(Self::from_store)
    }

    pub fn from_store(store: CacheStore) -> Self {
        let mut index = TagIndex::default();
        for (key, events) in store.tagged_keys() {
            index.tags.register(&key, events);
        }
        if index.tags.key_count() > 0 {
            info!(
                region = %store.region(),
                keys = index.tags.key_count(),
                events = index.tags.event_count(),
                "event index rebuilt"
            );
        }

        Self {
            store,
            index: Mutex::new(index),
        }
    }

    /// Store a value that is removed when `event` is processed.
    pub fn store_tagged(
        &self,
        key: &str,
        value: impl Into<Bytes>,
        validity: Vec<ValidityToken>,
        event: &str,
    ) {
        self.put(CacheEntry::new(key, value, validity).with_event(event));
    }

    /// Remove every entry tagged with the event's name.
    ///
    /// Returns how many entries were removed. Unknown names remove nothing.
    /// Keys whose tier copy survives stay tagged and are retried by the next
    /// read or event.
    pub fn process_event(&self, event: &NamedEvent) -> usize {
        let mut index = lock::exclusive(&self.index, self.store.region(), "process_event");
        let affected = index.tags.keys_for_event(event.name());

        let mut removed = 0;
        let mut stranded = 0;
        for key in &affected {
            let removal = self.store.delete(key);
            if index.settle(key, removal) {
                removed += usize::from(removal == Removal::Removed);
            } else {
                stranded += 1;
            }
        }
        drop(index);

        if stranded > 0 {
            warn!(
                region = %self.store.region(),
                event = %event,
                stranded,
                "event left entries in the tier; they stay hidden and tagged"
            );
        }
        counter!(
            METRIC_EVENT_INVALIDATED,
            "region" => self.store.region().to_string()
        )
        .increment(removed as u64);
        info!(
            region = %self.store.region(),
            event = %event,
            removed,
            "event processed"
        );
        removed
    }

    /// Event names currently attached to `key`.
    pub fn events_for_key(&self, key: &str) -> Vec<String> {
        let mut events: Vec<String> = lock::exclusive(&self.index, self.store.region(), "events")
            .tags
            .events_for_key(key)
            .into_iter()
            .collect();
        events.sort_unstable();
        events
    }

    /// Flush to the backing tier. Tags travel with the entries.
    pub fn close(&self) -> usize {
        let _index = lock::exclusive(&self.index, self.store.region(), "close");
        self.store.close()
    }

    pub(crate) fn store_ref(&self) -> &CacheStore {
        &self.store
    }

    fn untag_dropped(index: &mut TagIndex, dropped: Dropped) {
        for key in dropped {
            debug!(key = %key, "untagging dropped entry");
            index.forget(&key);
        }
    }
}

impl Cache for EventCache {
    fn region(&self) -> &str {
        self.store.region()
    }

    fn get_response(&self, key: &str) -> Option<CachedResponse> {
        let mut index = lock::exclusive(&self.index, self.store.region(), "get");
        if index.stranded.contains(key) {
            let removal = self.store.delete(key);
            index.settle(key, removal);
            return None;
        }

        let (entry, dropped) = self.store.fetch(key);
        Self::untag_dropped(&mut index, dropped);
        entry.map(|entry| entry.response())
    }

    fn put(&self, entry: CacheEntry) {
        let mut index = lock::exclusive(&self.index, self.store.region(), "store");
        let key = entry.key.clone();
        let events = entry.events.clone();

        let dropped = self.store.insert(entry);
        index.stranded.remove(&key);
        index.tags.register(&key, events);
        Self::untag_dropped(&mut index, dropped);
    }

    fn remove(&self, key: &str) {
        let mut index = lock::exclusive(&self.index, self.store.region(), "remove");
        let removal = self.store.delete(key);
        index.settle(key, removal);
    }

    fn clear(&self) {
        let mut index = lock::exclusive(&self.index, self.store.region(), "clear");
        if self.store.wipe() {
            index.tags.clear();
            index.stranded.clear();
            return;
        }

        // Tagged records may survive in the tier: keep their tags and hide them.
        let tagged: Vec<String> = index.tags.keys().map(str::to_string).collect();
        warn!(
            region = %self.store.region(),
            tagged = tagged.len(),
            "clear left entries in the tier; tagged keys stay hidden"
        );
        index.stranded.extend(tagged);
    }

    fn free(&self) -> Option<String> {
        let mut index = lock::exclusive(&self.index, self.store.region(), "free");
        let (key, dropped) = self.store.release_one()?;
        if dropped {
            index.forget(&key);
        }
        Some(key)
    }

    fn contains_key(&self, key: &str) -> bool {
        let index = lock::exclusive(&self.index, self.store.region(), "contains_key");
        !index.stranded.contains(key) && self.store.contains_key(key)
    }

    fn keys(&self) -> Keys {
        let index = lock::exclusive(&self.index, self.store.region(), "keys");
        self.store
            .keys()
            .filter(|key| !index.stranded.contains(key))
            .collect::<Vec<_>>()
            .into()
    }

    fn size(&self) -> usize {
        self.keys().len()
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ActionError {
    #[error("event name parameter is missing or blank")]
    MissingEventName,
}

/// External trigger that turns a single string parameter into an event.
#[derive(Clone)]
pub struct EventAction {
    cache: Arc<EventCache>,
}

impl EventAction {
    pub fn new(cache: Arc<EventCache>) -> Self {
        Self { cache }
    }

    /// Process the named event, returning the number of entries removed.
    pub fn act(&self, name: Option<&str>) -> Result<usize, ActionError> {
        let name = name
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .ok_or(ActionError::MissingEventName)?;

        Ok(self.cache.process_event(&NamedEvent::new(name)))
    }
}
