//! Bidirectional event registry.
//!
//! Tracks which keys are tagged with which event names so that an event can
//! find every entry it invalidates, and a removed entry can drop its tags.

use std::collections::{HashMap, HashSet};

/// event name → keys and key → event names.
///
/// Not synchronised on its own; [`super::EventCache`] guards it together with
/// the store mutation it mirrors.
#[derive(Debug, Default)]
pub struct EventRegistry {
    event_to_keys: HashMap<String, HashSet<String>>,
    key_to_events: HashMap<String, HashSet<String>>,
}

impl EventRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tag `key` with `events`, replacing any tags it had before.
    pub fn register<I, S>(&mut self, key: &str, events: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.unregister(key);

        let events: HashSet<String> = events.into_iter().map(Into::into).collect();
        if events.is_empty() {
            return;
        }
        for event in &events {
            self.event_to_keys
                .entry(event.clone())
                .or_default()
                .insert(key.to_string());
        }
        self.key_to_events.insert(key.to_string(), events);
    }

    pub fn keys_for_event(&self, event: &str) -> HashSet<String> {
        self.event_to_keys.get(event).cloned().unwrap_or_default()
    }

    /// Every key that carries at least one tag.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.key_to_events.keys().map(String::as_str)
    }

    pub fn events_for_key(&self, key: &str) -> HashSet<String> {
        self.key_to_events.get(key).cloned().unwrap_or_default()
    }

    /// Drop every tag on `key`.
    pub fn unregister(&mut self, key: &str) {
        let Some(events) = self.key_to_events.remove(key) else {
            return;
        };
        for event in events {
            if let Some(keys) = self.event_to_keys.get_mut(&event) {
                keys.remove(key);
                if keys.is_empty() {
                    self.event_to_keys.remove(&event);
                }
            }
        }
    }

    /// Remove an event and return the keys that were tagged with it.
    ///
    /// Each affected key loses all of its tags since its entry is about to be
    /// removed from the store.
    pub fn take_event(&mut self, event: &str) -> HashSet<String> {
        let affected = self.event_to_keys.remove(event).unwrap_or_default();
        for key in &affected {
            self.unregister(key);
        }
        affected
    }

    pub fn clear(&mut self) {
        self.event_to_keys.clear();
        self.key_to_events.clear();
    }

    pub fn event_count(&self) -> usize {
        self.event_to_keys.len()
    }

    pub fn key_count(&self) -> usize {
        self.key_to_events.len()
    }
}
