//! Validity tokens.
//!
//! A token answers one question: is the value stored alongside it still fresh?
//! The producer computes a new token for the current state of its inputs and
//! compares it against the token held by the cache:
//!
//! ```ignore
//! if candidate.is_valid(&stored) {
//!     // serve the cached value
//! }
//! ```
//!
//! Comparison is directional. It is neither symmetric nor transitive in
//! general because [`LiveInclude`] consults external state at comparison time,
//! so callers always pass the previously stored token as the argument.

use std::collections::BTreeMap;
use std::fmt;
use std::ptr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, warn};
use url::form_urlencoded;

use crate::source::{LastModified, ResolveError, SourceGuard, SourceResolver};

/// Freshness token attached to every cache entry.
#[derive(Debug, Clone)]
pub enum ValidityToken {
    /// Valid against a `TimeStamp` with the same value.
    TimeStamp(i64),
    /// Valid against an `AttributeSet` with an identical map.
    AttributeSet(AttributeSet),
    /// Valid when both halves are valid against the stored halves.
    Composite(Box<ValidityToken>, Box<ValidityToken>),
    /// Valid when lengths match and every pair is valid, in order.
    Aggregate(Vec<ValidityToken>),
    /// Valid when every included source still reports its recorded timestamp.
    LiveInclude(Arc<LiveInclude>),
    /// Valid against another `AlwaysValid`.
    AlwaysValid,
}

impl ValidityToken {
    pub fn composite(first: ValidityToken, second: ValidityToken) -> Self {
        Self::Composite(Box::new(first), Box::new(second))
    }

    pub fn attributes<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self::AttributeSet(AttributeSet::new(pairs))
    }

    pub fn live(include: LiveInclude) -> Self {
        Self::LiveInclude(Arc::new(include))
    }

    /// Compare this newly computed token against a previously stored one.
    ///
    /// Tokens of different variants never validate each other.
    pub fn is_valid(&self, stored: &ValidityToken) -> bool {
        match (self, stored) {
            (Self::TimeStamp(current), Self::TimeStamp(previous)) => current == previous,
            (Self::AttributeSet(current), Self::AttributeSet(previous)) => {
                current.canonical == previous.canonical
            }
            (Self::Composite(first, second), Self::Composite(stored_first, stored_second)) => {
                first.is_valid(stored_first) && second.is_valid(stored_second)
            }
            (Self::Aggregate(current), Self::Aggregate(previous)) => {
                is_valid_all(current, previous)
            }
            (Self::LiveInclude(current), Self::LiveInclude(previous)) => current.matches(previous),
            (Self::AlwaysValid, Self::AlwaysValid) => true,
            _ => false,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::TimeStamp(_) => "timestamp",
            Self::AttributeSet(_) => "attribute_set",
            Self::Composite(..) => "composite",
            Self::Aggregate(_) => "aggregate",
            Self::LiveInclude(_) => "live_include",
            Self::AlwaysValid => "always_valid",
        }
    }
}

/// Pairwise comparison of a candidate validity list against a stored one.
///
/// Lengths must match; elements are compared in order.
pub fn is_valid_all(candidate: &[ValidityToken], stored: &[ValidityToken]) -> bool {
    candidate.len() == stored.len()
        && candidate
            .iter()
            .zip(stored)
            .all(|(current, previous)| current.is_valid(previous))
}

/// An attribute map compared through its canonical string form.
#[derive(Clone, PartialEq, Eq)]
pub struct AttributeSet {
    attributes: BTreeMap<String, String>,
    canonical: String,
}

impl AttributeSet {
    pub fn new<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let attributes: BTreeMap<String, String> = pairs
            .into_iter()
            .map(|(name, value)| (name.into(), value.into()))
            .collect();
        let canonical = form_urlencoded::Serializer::new(String::new())
            .extend_pairs(attributes.iter())
            .finish();

        Self {
            attributes,
            canonical,
        }
    }

    pub fn attributes(&self) -> &BTreeMap<String, String> {
        &self.attributes
    }

    pub fn canonical(&self) -> &str {
        &self.canonical
    }
}

impl fmt::Debug for AttributeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("AttributeSet").field(&self.canonical).finish()
    }
}

/// One included resource and the timestamp it had when the value was built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncludeEntry {
    pub uri: String,
    pub last_modified: LastModified,
}

impl IncludeEntry {
    pub fn new(uri: impl Into<String>, last_modified: LastModified) -> Self {
        Self {
            uri: uri.into(),
            last_modified,
        }
    }
}

/// Validity of a value assembled from included resources.
///
/// Comparison re-resolves every recorded URI and checks its current
/// last-modified time, so it performs read-only I/O through the resolver.
/// Any resolution failure makes the comparison fail.
///
/// A new token starts out fresh, meaning its state is not yet known. The
/// flag only matters when a token is compared with itself: that first
/// comparison clears the flag and reports stale, so a token never validates
/// its own first use. Comparing two distinct tokens ignores the flag and
/// always checks the recorded modification times. Restored tokens start
/// with the flag cleared.
pub struct LiveInclude {
    entries: Vec<IncludeEntry>,
    resolver: Option<Arc<dyn SourceResolver>>,
    /// Set until the token has been through a comparison.
    fresh: AtomicBool,
}

impl LiveInclude {
    pub fn new(resolver: Arc<dyn SourceResolver>, entries: Vec<IncludeEntry>) -> Self {
        Self {
            entries,
            resolver: Some(resolver),
            fresh: AtomicBool::new(true),
        }
    }

    /// Resolve each URI now and record its current last-modified time.
    pub fn capture<I, S>(resolver: Arc<dyn SourceResolver>, uris: I) -> Result<Self, ResolveError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let entries = uris
            .into_iter()
            .map(|uri| -> Result<IncludeEntry, ResolveError> {
                let uri = uri.as_ref();
                let guard = SourceGuard::acquire(resolver.as_ref(), uri)?;
                Ok(IncludeEntry::new(uri, guard.last_modified()?))
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self::new(resolver, entries))
    }

    /// Rebuild a token from persisted entries; it has no resolver of its own.
    pub(crate) fn restored(entries: Vec<IncludeEntry>) -> Self {
        Self {
            entries,
            resolver: None,
            fresh: AtomicBool::new(false),
        }
    }

    pub fn entries(&self) -> &[IncludeEntry] {
        &self.entries
    }

    pub fn is_fresh(&self) -> bool {
        self.fresh.load(Ordering::SeqCst)
    }

    fn matches(&self, stored: &LiveInclude) -> bool {
        // A token that was never compared must not validate itself on first use.
        if ptr::eq(self, stored) && self.fresh.swap(false, Ordering::SeqCst) {
            debug!("live include compared against itself before first check");
            return false;
        }

        let Some(resolver) = self.resolver.as_deref().or(stored.resolver.as_deref()) else {
            warn!(
                entries = stored.entries.len(),
                "live include comparison has no resolver; treating as stale"
            );
            return false;
        };

        for entry in &stored.entries {
            let current = SourceGuard::acquire(resolver, &entry.uri)
                .and_then(|guard| guard.last_modified());
            match current {
                Ok(last_modified) if last_modified == entry.last_modified => {}
                Ok(last_modified) => {
                    debug!(
                        uri = %entry.uri,
                        stored = entry.last_modified,
                        current = last_modified,
                        "included source changed"
                    );
                    return false;
                }
                Err(err) => {
                    warn!(
                        uri = %entry.uri,
                        error = %err,
                        "failed to re-resolve included source; treating as stale"
                    );
                    return false;
                }
            }
        }

        self.fresh.store(false, Ordering::SeqCst);
        stored.fresh.store(false, Ordering::SeqCst);
        true
    }
}

impl fmt::Debug for LiveInclude {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LiveInclude")
            .field("entries", &self.entries)
            .field("has_resolver", &self.resolver.is_some())
            .field("fresh", &self.is_fresh())
            .finish()
    }
}
