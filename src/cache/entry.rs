//! Cache entries and the value/validity pair handed back to producers.

use std::time::Duration;

use bytes::Bytes;
use time::OffsetDateTime;

use super::validity::{ValidityToken, is_valid_all};

/// A stored value with its validity and invalidation metadata.
///
/// Entries are immutable once stored; storing another entry under the same
/// key replaces this one.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: String,
    pub value: Bytes,
    pub validity: Vec<ValidityToken>,
    /// Event names whose occurrence removes this entry.
    pub events: Vec<String>,
    pub stored_at: OffsetDateTime,
    pub expires_at: Option<OffsetDateTime>,
}

impl CacheEntry {
    pub fn new(key: impl Into<String>, value: impl Into<Bytes>, validity: Vec<ValidityToken>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            validity,
            events: Vec::new(),
            stored_at: OffsetDateTime::now_utc(),
            expires_at: None,
        }
    }

    pub fn with_event(mut self, event: impl Into<String>) -> Self {
        let event = event.into();
        if !self.events.contains(&event) {
            self.events.push(event);
        }
        self
    }

    /// Expire the entry a fixed time after it was stored.
    ///
    /// Zero means never, and so does a lifetime that overflows the calendar.
    pub fn expires_in(mut self, ttl: Duration) -> Self {
        self.expires_at = if ttl.is_zero() {
            None
        } else {
            time::Duration::try_from(ttl)
                .ok()
                .and_then(|ttl| self.stored_at.checked_add(ttl))
        };
        self
    }

    pub fn is_expired_at(&self, now: OffsetDateTime) -> bool {
        self.expires_at.is_some_and(|deadline| now >= deadline)
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(OffsetDateTime::now_utc())
    }

    pub fn response(&self) -> CachedResponse {
        CachedResponse {
            validity: self.validity.clone(),
            value: self.value.clone(),
        }
    }
}

/// Cached value together with the validity it was stored with.
#[derive(Debug, Clone)]
pub struct CachedResponse {
    pub validity: Vec<ValidityToken>,
    pub value: Bytes,
}

impl CachedResponse {
    /// Compare a freshly computed validity against the stored one.
    pub fn is_fresh(&self, candidate: &[ValidityToken]) -> bool {
        is_valid_all(candidate, &self.validity)
    }
}
