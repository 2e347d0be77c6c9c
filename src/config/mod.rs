//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{
    collections::HashSet,
    path::PathBuf,
    str::FromStr,
    time::Duration,
};

use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

use crate::cache::{
    DEFAULT_MAX_ENTRIES, DEFAULT_REFRESH_INTERVAL, DEFAULT_REGION, RefreshJobConfig, StoreConfig,
};

mod cli;

pub use cli::{CliArgs, Command, EventArgs, Overrides, RegionArgs, RunArgs};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "cachet";
const ENV_PREFIX: &str = "CACHET";
const DEFAULT_WORK_DIR: &str = ".";
/// One hundred years.
const MAX_CACHE_EXPIRES_SECS: u64 = 100 * 365 * 24 * 60 * 60;

/// Fully validated runtime settings.
#[derive(Debug, Clone)]
pub struct Settings {
    pub logging: LoggingSettings,
    pub store: StoreSettings,
    pub refresh: Vec<RefreshJobConfig>,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct StoreSettings {
    pub work_dir: PathBuf,
    /// One entry per region, each already bound to `work_dir`.
    pub regions: Vec<StoreConfig>,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Parse the command line and load settings with its overrides applied.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let cli = CliArgs::parse();
    let settings = load(&cli)?;
    Ok((cli, settings))
}

pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix(ENV_PREFIX).separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    if let Some(command) = cli.command.as_ref() {
        raw.apply_overrides(command.overrides());
    }

    Settings::from_raw(raw)
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    logging: RawLoggingSettings,
    store: RawStoreSettings,
    refresh: Vec<RawRefreshSettings>,
}

impl RawSettings {
    fn apply_overrides(&mut self, overrides: &Overrides) {
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(work_dir) = overrides.store_work_dir.as_ref() {
            self.store.work_dir = Some(work_dir.clone());
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            logging,
            store,
            refresh,
        } = raw;

        let logging = build_logging_settings(logging)?;
        let store = build_store_settings(store)?;
        let refresh = build_refresh_settings(refresh, &store)?;

        Ok(Self {
            logging,
            store,
            refresh,
        })
    }

    pub fn region(&self, name: &str) -> Option<&StoreConfig> {
        self.store.regions.iter().find(|region| region.region == name)
    }
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_store_settings(store: RawStoreSettings) -> Result<StoreSettings, LoadError> {
    let work_dir = store
        .work_dir
        .unwrap_or_else(|| PathBuf::from(DEFAULT_WORK_DIR));
    if work_dir.as_os_str().is_empty() {
        return Err(LoadError::invalid(
            "store.work_dir",
            "path must not be empty",
        ));
    }

    let raw_regions = if store.regions.is_empty() {
        vec![RawRegionSettings::default()]
    } else {
        store.regions
    };

    let mut seen = HashSet::new();
    let mut regions = Vec::with_capacity(raw_regions.len());
    for raw in raw_regions {
        let name = raw
            .name
            .map(|name| name.trim().to_string())
            .unwrap_or_else(|| DEFAULT_REGION.to_string());
        if name.is_empty() {
            return Err(LoadError::invalid(
                "store.regions.name",
                "region name must not be empty",
            ));
        }
        if !seen.insert(name.clone()) {
            return Err(LoadError::invalid(
                "store.regions.name",
                format!("region `{name}` is configured more than once"),
            ));
        }

        let max_entries = raw.max_entries.unwrap_or(DEFAULT_MAX_ENTRIES);
        if max_entries == 0 {
            return Err(LoadError::invalid(
                "store.regions.max_entries",
                format!("region `{name}` must hold at least one entry"),
            ));
        }

        let mut config = StoreConfig::new(name)
            .with_max_entries(max_entries)
            .with_work_dir(work_dir.clone());
        if let Some(directory) = raw.directory.filter(|dir| !dir.as_os_str().is_empty()) {
            config = config.with_directory(directory);
        }
        regions.push(config);
    }

    Ok(StoreSettings { work_dir, regions })
}

fn build_refresh_settings(
    refresh: Vec<RawRefreshSettings>,
    store: &StoreSettings,
) -> Result<Vec<RefreshJobConfig>, LoadError> {
    refresh
        .into_iter()
        .map(|raw| {
            let region = raw
                .cache_role
                .unwrap_or_else(|| DEFAULT_REGION.to_string());
            if !store.regions.iter().any(|config| config.region == region) {
                return Err(LoadError::invalid(
                    "refresh.cache-role",
                    format!("region `{region}` is not configured"),
                ));
            }

            let interval = match raw.interval_seconds {
                Some(0) => {
                    return Err(LoadError::invalid(
                        "refresh.interval-seconds",
                        "must be greater than zero",
                    ));
                }
                Some(seconds) => Duration::from_secs(seconds),
                None => DEFAULT_REFRESH_INTERVAL,
            };

            let expires = raw.cache_expires.unwrap_or(0);
            if expires > MAX_CACHE_EXPIRES_SECS {
                return Err(LoadError::invalid(
                    "refresh.cache-expires",
                    format!("must be at most {MAX_CACHE_EXPIRES_SECS} seconds"),
                ));
            }

            Ok(RefreshJobConfig {
                uri: non_blank(raw.uri),
                region,
                expires: Duration::from_secs(expires),
                cache_name: non_blank(raw.cache_name),
                interval,
            })
        })
        .collect()
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.and_then(|value| {
        let trimmed = value.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawStoreSettings {
    work_dir: Option<PathBuf>,
    regions: Vec<RawRegionSettings>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawRegionSettings {
    name: Option<String>,
    max_entries: Option<usize>,
    directory: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default, rename_all = "kebab-case")]
struct RawRefreshSettings {
    uri: Option<String>,
    cache_role: Option<String>,
    cache_expires: Option<u64>,
    cache_name: Option<String>,
    interval_seconds: Option<u64>,
}

#[cfg(test)]
mod tests;
