//! Secondary storage behind a region's in-memory map.
//!
//! Entries evicted from memory spill into a [`BackingTier`]; memory misses
//! fall through to it. The tier is allowed to fail: the store logs tier
//! errors and degrades to a miss or a no-op.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use base64::{Engine as _, engine::general_purpose::STANDARD};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use time::OffsetDateTime;
use tracing::{debug, warn};

use super::entry::CacheEntry;
use super::lock;
use super::validity::{AttributeSet, IncludeEntry, LiveInclude, ValidityToken};

const RECORD_EXTENSION: &str = "entry";
const PARTIAL_EXTENSION: &str = "partial";

#[derive(Debug, Error)]
pub enum TierError {
    #[error("tier io error at `{path}`: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to encode tier record for `{key}`: {source}")]
    Encode {
        key: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("corrupt tier record at `{path}`: {reason}")]
    Corrupt { path: PathBuf, reason: String },
    #[error("tier unavailable: {0}")]
    Unavailable(String),
}

impl TierError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    fn corrupt(path: &Path, reason: impl fmt::Display) -> Self {
        Self::Corrupt {
            path: path.to_path_buf(),
            reason: reason.to_string(),
        }
    }
}

/// Storage below the in-memory map.
pub trait BackingTier: Send + Sync + fmt::Debug {
    fn load(&self, key: &str) -> Result<Option<CacheEntry>, TierError>;
    fn save(&self, entry: &CacheEntry) -> Result<(), TierError>;
    /// Returns whether an entry was present.
    fn delete(&self, key: &str) -> Result<bool, TierError>;
    fn contains(&self, key: &str) -> Result<bool, TierError>;
    /// Keys of unexpired records.
    fn keys(&self) -> Result<Vec<String>, TierError>;
    fn len(&self) -> Result<usize, TierError>;
    fn clear(&self) -> Result<(), TierError>;

    /// Unexpired keys carrying event tags, with their tags.
    fn tagged(&self) -> Result<Vec<(String, Vec<String>)>, TierError> {
        let mut tagged = Vec::new();
        for key in self.keys()? {
            if let Some(entry) = self.load(&key)?
                && !entry.events.is_empty()
            {
                tagged.push((key, entry.events));
            }
        }
        Ok(tagged)
    }
}

impl<T: BackingTier + ?Sized> BackingTier for Arc<T> {
    fn load(&self, key: &str) -> Result<Option<CacheEntry>, TierError> {
        (**self).load(key)
    }

    fn save(&self, entry: &CacheEntry) -> Result<(), TierError> {
        (**self).save(entry)
    }

    fn delete(&self, key: &str) -> Result<bool, TierError> {
        (**self).delete(key)
    }

    fn contains(&self, key: &str) -> Result<bool, TierError> {
        (**self).contains(key)
    }

    fn keys(&self) -> Result<Vec<String>, TierError> {
        (**self).keys()
    }

    fn len(&self) -> Result<usize, TierError> {
        (**self).len()
    }

    fn clear(&self) -> Result<(), TierError> {
        (**self).clear()
    }

    fn tagged(&self) -> Result<Vec<(String, Vec<String>)>, TierError> {
        (**self).tagged()
    }
}

/// One JSON file per entry under the region directory.
///
/// Files are named by the SHA-256 of the key. An index of key to file path,
/// tags and expiry is built when the tier is opened and kept in step with
/// writes, so listing never reads record bodies.
#[derive(Debug)]
pub struct DiskTier {
    region: String,
    directory: PathBuf,
    index: RwLock<HashMap<String, IndexedRecord>>,
}

#[derive(Debug, Clone)]
struct IndexedRecord {
    path: PathBuf,
    events: Vec<String>,
    expires_at: Option<OffsetDateTime>,
}

impl IndexedRecord {
    fn is_live(&self, now: OffsetDateTime) -> bool {
        self.expires_at.is_none_or(|deadline| now < deadline)
    }
}

impl DiskTier {
    /// Open the tier, indexing any records already present in `directory`.
    ///
    /// Unreadable or corrupt records are skipped with a warning.
    pub fn open(region: impl Into<String>, directory: impl Into<PathBuf>) -> Result<Self, TierError> {
        let region = region.into();
        let directory = directory.into();
        let mut index = HashMap::new();

        let listing = std::fs::read_dir(&directory).map_err(|err| TierError::io(&directory, err))?;
        for dir_entry in listing {
            let path = dir_entry.map_err(|err| TierError::io(&directory, err))?.path();
            match path.extension().and_then(|ext| ext.to_str()) {
                Some(RECORD_EXTENSION) => match read_record(&path) {
                    Ok(record) => {
                        let indexed = IndexedRecord {
                            path,
                            events: record.events,
                            expires_at: record.expires_at,
                        };
                        index.insert(record.key, indexed);
                    }
                    Err(err) => {
                        warn!(region = %region, error = %err, "skipping unreadable tier record");
                    }
                },
                Some(PARTIAL_EXTENSION) => {
                    if let Err(err) = std::fs::remove_file(&path) {
                        warn!(
                            region = %region,
                            path = %path.display(),
                            error = %err,
                            "failed to remove partial tier record"
                        );
                    }
                }
                _ => {}
            }
        }

        debug!(region = %region, entries = index.len(), directory = %directory.display(), "disk tier opened");

        Ok(Self {
            region,
            directory,
            index: RwLock::new(index),
        })
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    fn record_path(&self, key: &str) -> PathBuf {
        let mut hasher = Sha256::new();
        hasher.update(key.as_bytes());
        self.directory
            .join(format!("{}.{RECORD_EXTENSION}", hex::encode(hasher.finalize())))
    }
}

impl BackingTier for DiskTier {
    fn load(&self, key: &str) -> Result<Option<CacheEntry>, TierError> {
        let path = match lock::read(&self.index, &self.region, "tier.load").get(key) {
            Some(indexed) => indexed.path.clone(),
            None => return Ok(None),
        };

        match read_record(&path) {
            Ok(record) => record.into_entry(&path).map(Some),
            Err(TierError::Io { source, .. }) if source.kind() == io::ErrorKind::NotFound => {
                lock::write(&self.index, &self.region, "tier.load").remove(key);
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    fn save(&self, entry: &CacheEntry) -> Result<(), TierError> {
        let path = self.record_path(&entry.key);
        let partial = path.with_extension(PARTIAL_EXTENSION);
        let encoded = serde_json::to_vec(&DiskRecord::from(entry)).map_err(|source| {
            TierError::Encode {
                key: entry.key.clone(),
                source,
            }
        })?;

        let mut index = lock::write(&self.index, &self.region, "tier.save");
        std::fs::write(&partial, encoded).map_err(|err| TierError::io(&partial, err))?;
        std::fs::rename(&partial, &path).map_err(|err| TierError::io(&path, err))?;
        index.insert(
            entry.key.clone(),
            IndexedRecord {
                path,
                events: entry.events.clone(),
                expires_at: entry.expires_at,
            },
        );
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<bool, TierError> {
        let mut index = lock::write(&self.index, &self.region, "tier.delete");
        let Some(indexed) = index.remove(key) else {
            return Ok(false);
        };

        match std::fs::remove_file(&indexed.path) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(err) => {
                let path = indexed.path.clone();
                index.insert(key.to_string(), indexed);
                Err(TierError::io(&path, err))
            }
        }
    }

    fn contains(&self, key: &str) -> Result<bool, TierError> {
        let now = OffsetDateTime::now_utc();
        Ok(lock::read(&self.index, &self.region, "tier.contains")
            .get(key)
            .is_some_and(|indexed| indexed.is_live(now)))
    }

    fn keys(&self) -> Result<Vec<String>, TierError> {
        let now = OffsetDateTime::now_utc();
        Ok(lock::read(&self.index, &self.region, "tier.keys")
            .iter()
            .filter(|(_, indexed)| indexed.is_live(now))
            .map(|(key, _)| key.clone())
            .collect())
    }

    fn len(&self) -> Result<usize, TierError> {
        let now = OffsetDateTime::now_utc();
        Ok(lock::read(&self.index, &self.region, "tier.len")
            .values()
            .filter(|indexed| indexed.is_live(now))
            .count())
    }

    fn tagged(&self) -> Result<Vec<(String, Vec<String>)>, TierError> {
        let now = OffsetDateTime::now_utc();
        Ok(lock::read(&self.index, &self.region, "tier.tagged")
            .iter()
            .filter(|(_, indexed)| !indexed.events.is_empty() && indexed.is_live(now))
            .map(|(key, indexed)| (key.clone(), indexed.events.clone()))
            .collect())
    }

    fn clear(&self) -> Result<(), TierError> {
        let mut index = lock::write(&self.index, &self.region, "tier.clear");
        let mut first_error = None;
        index.retain(|_, indexed| match std::fs::remove_file(&indexed.path) {
            Ok(()) => false,
            Err(err) if err.kind() == io::ErrorKind::NotFound => false,
            Err(err) => {
                first_error.get_or_insert_with(|| TierError::io(&indexed.path, err));
                true
            }
        });

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

fn read_record(path: &Path) -> Result<DiskRecord, TierError> {
    let raw = std::fs::read(path).map_err(|err| TierError::io(path, err))?;
    serde_json::from_slice(&raw).map_err(|err| TierError::corrupt(path, err))
}

#[derive(Debug, Serialize, Deserialize)]
struct DiskRecord {
    key: String,
    value: String,
    validity: Vec<PersistedValidity>,
    #[serde(default)]
    events: Vec<String>,
    #[serde(with = "time::serde::rfc3339")]
    stored_at: OffsetDateTime,
    #[serde(default, with = "time::serde::rfc3339::option")]
    expires_at: Option<OffsetDateTime>,
}

impl From<&CacheEntry> for DiskRecord {
    fn from(entry: &CacheEntry) -> Self {
        Self {
            key: entry.key.clone(),
            value: STANDARD.encode(&entry.value),
            validity: entry.validity.iter().map(PersistedValidity::from).collect(),
            events: entry.events.clone(),
            stored_at: entry.stored_at,
            expires_at: entry.expires_at,
        }
    }
}

impl DiskRecord {
    fn into_entry(self, path: &Path) -> Result<CacheEntry, TierError> {
        let value = STANDARD
            .decode(self.value.as_bytes())
            .map_err(|err| TierError::corrupt(path, err))?;

        Ok(CacheEntry {
            key: self.key,
            value: value.into(),
            validity: self.validity.into_iter().map(ValidityToken::from).collect(),
            events: self.events,
            stored_at: self.stored_at,
            expires_at: self.expires_at,
        })
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum PersistedValidity {
    TimeStamp {
        value: i64,
    },
    AttributeSet {
        attributes: BTreeMap<String, String>,
    },
    Composite {
        first: Box<PersistedValidity>,
        second: Box<PersistedValidity>,
    },
    Aggregate {
        tokens: Vec<PersistedValidity>,
    },
    LiveInclude {
        entries: Vec<PersistedInclude>,
    },
    AlwaysValid,
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedInclude {
    uri: String,
    last_modified: i64,
}

impl From<&ValidityToken> for PersistedValidity {
    fn from(token: &ValidityToken) -> Self {
        match token {
            ValidityToken::TimeStamp(value) => Self::TimeStamp { value: *value },
            ValidityToken::AttributeSet(set) => Self::AttributeSet {
                attributes: set.attributes().clone(),
            },
            ValidityToken::Composite(first, second) => Self::Composite {
                first: Box::new(first.as_ref().into()),
                second: Box::new(second.as_ref().into()),
            },
            ValidityToken::Aggregate(tokens) => Self::Aggregate {
                tokens: tokens.iter().map(Self::from).collect(),
            },
            ValidityToken::LiveInclude(include) => Self::LiveInclude {
                entries: include
                    .entries()
                    .iter()
                    .map(|entry| PersistedInclude {
                        uri: entry.uri.clone(),
                        last_modified: entry.last_modified,
                    })
                    .collect(),
            },
            ValidityToken::AlwaysValid => Self::AlwaysValid,
        }
    }
}

impl From<PersistedValidity> for ValidityToken {
    fn from(persisted: PersistedValidity) -> Self {
        match persisted {
            PersistedValidity::TimeStamp { value } => Self::TimeStamp(value),
            PersistedValidity::AttributeSet { attributes } => {
                Self::AttributeSet(AttributeSet::new(attributes))
            }
            PersistedValidity::Composite { first, second } => {
                Self::composite((*first).into(), (*second).into())
            }
            PersistedValidity::Aggregate { tokens } => {
                Self::Aggregate(tokens.into_iter().map(Self::from).collect())
            }
            PersistedValidity::LiveInclude { entries } => {
                Self::LiveInclude(Arc::new(LiveInclude::restored(
                    entries
                        .into_iter()
                        .map(|entry| IncludeEntry::new(entry.uri, entry.last_modified))
                        .collect(),
                )))
            }
            PersistedValidity::AlwaysValid => Self::AlwaysValid,
        }
    }
}
