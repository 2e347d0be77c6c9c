//! Region configuration.
//!
//! A region is one independent key space: an LRU map bounded by
//! `max_entries`, optionally spilling to a directory on disk.

use std::io;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use super::store::StoreError;

pub const DEFAULT_REGION: &str = "main";
pub const DEFAULT_MAX_ENTRIES: usize = 1000;
const PROBE_FILE: &str = ".cachet-probe";

/// Configuration for one cache region.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Region name; regions never share keys.
    pub region: String,
    /// Maximum entries held in memory.
    pub max_entries: usize,
    /// Spill directory, relative paths resolve against `work_dir`.
    pub directory: Option<PathBuf>,
    pub work_dir: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            region: DEFAULT_REGION.to_string(),
            max_entries: DEFAULT_MAX_ENTRIES,
            directory: None,
            work_dir: PathBuf::from("."),
        }
    }
}

impl StoreConfig {
    pub fn new(region: impl Into<String>) -> Self {
        Self {
            region: region.into(),
            ..Default::default()
        }
    }

    pub fn with_max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = max_entries;
        self
    }

    pub fn with_directory(mut self, directory: impl Into<PathBuf>) -> Self {
        self.directory = Some(directory.into());
        self
    }

    pub fn with_work_dir(mut self, work_dir: impl Into<PathBuf>) -> Self {
        self.work_dir = work_dir.into();
        self
    }

    /// Returns the capacity as NonZeroUsize, clamping to 1 if zero.
    pub fn max_entries_non_zero(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.max_entries).unwrap_or(NonZeroUsize::MIN)
    }

    /// The spill directory after resolving it against the work directory.
    pub fn resolved_directory(&self) -> Option<PathBuf> {
        self.directory.as_ref().map(|directory| {
            if directory.is_absolute() {
                directory.clone()
            } else {
                self.work_dir.join(directory)
            }
        })
    }

    /// Check the configuration and prepare the spill directory.
    ///
    /// The directory is created when absent and must be readable and
    /// writable; anything else is a fatal configuration error.
    pub fn prepare(&self) -> Result<Option<PathBuf>, StoreError> {
        if self.region.trim().is_empty() {
            return Err(StoreError::config(&self.region, "region name must not be empty"));
        }

        let Some(directory) = self.resolved_directory() else {
            return Ok(None);
        };

        std::fs::create_dir_all(&directory)
            .and_then(|()| probe_read_write(&directory))
            .map_err(|source| StoreError::Directory {
                region: self.region.clone(),
                path: directory.clone(),
                source,
            })?;

        Ok(Some(directory))
    }
}

fn probe_read_write(directory: &Path) -> io::Result<()> {
    std::fs::read_dir(directory)?;
    let probe = directory.join(PROBE_FILE);
    std::fs::write(&probe, b"probe")?;
    std::fs::remove_file(&probe)
}
