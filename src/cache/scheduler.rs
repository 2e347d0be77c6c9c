//! Scheduled refresh of hot entries.
//!
//! A [`RefreshJob`] re-fetches one resource and stores it under a fixed key,
//! unconditionally, every time it fires. The [`RefreshScheduler`] runs each
//! job on its own ticker until its cancellation token fires. A cycle that
//! fails leaves whatever the region already holds in place.

use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::{counter, histogram};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::config::DEFAULT_REGION;
use super::entry::CacheEntry;
use super::events::EventCache;
use super::regions::CacheRegions;
use super::store::Cache;
use super::validity::ValidityToken;
use crate::source::{ResolveError, SourceGuard, SourceResolver};

const METRIC_REFRESH_TOTAL: &str = "cachet_refresh_total";
const METRIC_REFRESH_DURATION: &str = "cachet_refresh_duration_seconds";

pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(300);
const MIN_REFRESH_INTERVAL: Duration = Duration::from_millis(1);

/// Fixed configuration of one refresh job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshJobConfig {
    /// Resource to refresh. A job without one does nothing.
    pub uri: Option<String>,
    /// Target region ("cache-role").
    pub region: String,
    /// Lifetime of stored entries; zero relies on validity alone.
    pub expires: Duration,
    /// Explicit key; defaults to the uri.
    pub cache_name: Option<String>,
    pub interval: Duration,
}

impl Default for RefreshJobConfig {
    fn default() -> Self {
        Self {
            uri: None,
            region: DEFAULT_REGION.to_string(),
            expires: Duration::ZERO,
            cache_name: None,
            interval: DEFAULT_REFRESH_INTERVAL,
        }
    }
}

impl RefreshJobConfig {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: Some(uri.into()),
            ..Default::default()
        }
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = region.into();
        self
    }

    pub fn with_expires(mut self, expires: Duration) -> Self {
        self.expires = expires;
        self
    }

    pub fn with_cache_name(mut self, cache_name: impl Into<String>) -> Self {
        self.cache_name = Some(cache_name.into());
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Key the refreshed value is stored under.
    pub fn key(&self) -> Option<&str> {
        self.cache_name.as_deref().or(self.uri.as_deref())
    }
}

#[derive(Debug, Error)]
pub enum RefreshError {
    #[error("refresh job for `{uri}` targets unknown region `{region}`")]
    UnknownRegion { uri: String, region: String },
    #[error(transparent)]
    Resolve(#[from] ResolveError),
}

/// What one refresh cycle did.
#[derive(Debug)]
pub enum RefreshOutcome {
    Stored { key: String, bytes: usize },
    /// No uri configured.
    Skipped,
    Failed(RefreshError),
}

impl RefreshOutcome {
    fn label(&self) -> &'static str {
        match self {
            Self::Stored { .. } => "stored",
            Self::Skipped => "skipped",
            Self::Failed(_) => "failed",
        }
    }
}

pub struct RefreshJob {
    config: RefreshJobConfig,
    cache: Arc<EventCache>,
    resolver: Arc<dyn SourceResolver>,
}

impl RefreshJob {
    pub fn new(
        config: RefreshJobConfig,
        cache: Arc<EventCache>,
        resolver: Arc<dyn SourceResolver>,
    ) -> Self {
        Self {
            config,
            cache,
            resolver,
        }
    }

    /// Bind a job to its configured region.
    pub fn bind(
        config: RefreshJobConfig,
        regions: &CacheRegions,
        resolver: Arc<dyn SourceResolver>,
    ) -> Result<Self, RefreshError> {
        let cache = regions
            .get(&config.region)
            .ok_or_else(|| RefreshError::UnknownRegion {
                uri: config.uri.clone().unwrap_or_default(),
                region: config.region.clone(),
            })?;
        Ok(Self::new(config, cache, resolver))
    }

    pub fn config(&self) -> &RefreshJobConfig {
        &self.config
    }

    /// Fetch the resource and overwrite the cached entry.
    ///
    /// Runs blocking resolver I/O; call from a blocking context.
    pub fn run_once(&self) -> RefreshOutcome {
        let (Some(uri), Some(key)) = (self.config.uri.as_deref(), self.config.key()) else {
            debug!(region = %self.config.region, "refresh job has no uri");
            return self.finish(RefreshOutcome::Skipped, Instant::now());
        };

        let started = Instant::now();
        let outcome = match self.fetch(uri, key) {
            Ok(entry) => {
                let bytes = entry.value.len();
                self.cache.put(entry);
                info!(region = %self.config.region, uri, key, bytes, "entry refreshed");
                RefreshOutcome::Stored {
                    key: key.to_string(),
                    bytes,
                }
            }
            Err(err) => {
                warn!(
                    region = %self.config.region,
                    uri,
                    key,
                    error = %err,
                    "refresh failed, keeping cached entry"
                );
                RefreshOutcome::Failed(err)
            }
        };
        self.finish(outcome, started)
    }

    fn fetch(&self, uri: &str, key: &str) -> Result<CacheEntry, RefreshError> {
        let mut source = SourceGuard::acquire(self.resolver.as_ref(), uri)?;
        let last_modified = source.last_modified()?;
        let value = source.read()?;

        Ok(
            CacheEntry::new(key, value, vec![ValidityToken::TimeStamp(last_modified)])
                .expires_in(self.config.expires),
        )
    }

    fn finish(&self, outcome: RefreshOutcome, started: Instant) -> RefreshOutcome {
        counter!(
            METRIC_REFRESH_TOTAL,
            "region" => self.config.region.clone(),
            "outcome" => outcome.label()
        )
        .increment(1);
        histogram!(METRIC_REFRESH_DURATION, "region" => self.config.region.clone())
            .record(started.elapsed().as_secs_f64());
        outcome
    }
}

/// Runs refresh jobs on independent tickers.
#[derive(Default)]
pub struct RefreshScheduler {
    jobs: Vec<Arc<RefreshJob>>,
}

impl RefreshScheduler {
    pub fn new(jobs: impl IntoIterator<Item = RefreshJob>) -> Self {
        Self {
            jobs: jobs.into_iter().map(Arc::new).collect(),
        }
    }

    pub fn push(&mut self, job: RefreshJob) {
        self.jobs.push(Arc::new(job));
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Run every job once on the calling thread.
    pub fn run_all_once(&self) -> Vec<RefreshOutcome> {
        self.jobs.iter().map(|job| job.run_once()).collect()
    }

    /// Spawn one ticker task per job. Must be called inside a tokio runtime.
    pub fn start(self) -> SchedulerHandle {
        let shutdown = CancellationToken::new();
        let tasks = self
            .jobs
            .into_iter()
            .map(|job| tokio::spawn(run_job(job, shutdown.clone())))
            .collect::<Vec<_>>();

        info!(jobs = tasks.len(), "refresh scheduler started");
        SchedulerHandle { shutdown, tasks }
    }
}

async fn run_job(job: Arc<RefreshJob>, shutdown: CancellationToken) {
    let period = job.config.interval.max(MIN_REFRESH_INTERVAL);
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    debug!(
        region = %job.config.region,
        uri = job.config.uri.as_deref().unwrap_or_default(),
        interval_ms = period.as_millis() as u64,
        "refresh job scheduled"
    );

    loop {
        tokio::select! {
            biased;

            _ = shutdown.cancelled() => break,

            _ = ticker.tick() => {
                let cycle = Arc::clone(&job);
                if let Err(err) = tokio::task::spawn_blocking(move || cycle.run_once()).await {
                    warn!(region = %job.config.region, error = %err, "refresh cycle aborted");
                }
            }
        }
    }
}

/// Handle to a running scheduler.
pub struct SchedulerHandle {
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl SchedulerHandle {
    pub fn cancellation_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Stop all tickers, waiting for in-flight cycles to finish.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        for task in self.tasks {
            if let Err(err) = task.await {
                warn!(error = %err, "refresh task ended abnormally");
            }
        }
        info!("refresh scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use bytes::Bytes;

    use super::*;
    use crate::cache::config::StoreConfig;
    use crate::source::FileSourceResolver;

    fn region() -> Arc<EventCache> {
        Arc::new(EventCache::open(&StoreConfig::new("main")).expect("open"))
    }

    fn resolver(dir: &tempfile::TempDir) -> Arc<dyn SourceResolver> {
        Arc::new(FileSourceResolver::new(dir.path()))
    }

    #[test]
    fn key_defaults_to_uri() {
        let config = RefreshJobConfig::new("feeds/news.xml");
        assert_eq!(config.key(), Some("feeds/news.xml"));
        assert_eq!(config.with_cache_name("news").key(), Some("news"));
        assert_eq!(RefreshJobConfig::default().key(), None);
    }

    #[test]
    fn run_once_stores_unconditionally() {
        let dir = tempfile::tempdir().expect("temp dir");
        fs::write(dir.path().join("news.xml"), "<news/>").expect("write");
        let cache = region();
        cache.store("news", Bytes::from("stale"), vec![ValidityToken::AlwaysValid]);

        let job = RefreshJob::new(
            RefreshJobConfig::new("news.xml").with_cache_name("news"),
            cache.clone(),
            resolver(&dir),
        );

        assert!(matches!(job.run_once(), RefreshOutcome::Stored { ref key, bytes: 7 } if key == "news"));
        assert_eq!(cache.get("news"), Some(Bytes::from("<news/>")));
    }

    #[test]
    fn failed_refresh_keeps_previous_entry() {
        let dir = tempfile::tempdir().expect("temp dir");
        let cache = region();
        cache.store("missing.xml", Bytes::from("old"), Vec::new());

        let job = RefreshJob::new(RefreshJobConfig::new("missing.xml"), cache.clone(), resolver(&dir));

        assert!(matches!(
            job.run_once(),
            RefreshOutcome::Failed(RefreshError::Resolve(ResolveError::NotFound { .. }))
        ));
        assert_eq!(cache.get("missing.xml"), Some(Bytes::from("old")));
    }

    #[test]
    fn job_without_uri_is_skipped() {
        let dir = tempfile::tempdir().expect("temp dir");
        let cache = region();
        let job = RefreshJob::new(RefreshJobConfig::default(), cache.clone(), resolver(&dir));

        assert!(matches!(job.run_once(), RefreshOutcome::Skipped));
        assert_eq!(cache.size(), 0);
    }

    #[test]
    fn expiry_is_applied_to_refreshed_entries() {
        let dir = tempfile::tempdir().expect("temp dir");
        fs::write(dir.path().join("a.txt"), "A").expect("write");
        let cache = region();
        let job = RefreshJob::new(
            RefreshJobConfig::new("a.txt").with_expires(Duration::from_secs(60)),
            cache.clone(),
            resolver(&dir),
        );

        job.run_once();
        let stored = cache.store_ref().fetch("a.txt").0.expect("stored");
        assert!(stored.expires_at.is_some());
    }

    #[test]
    fn overlong_expiry_stores_without_deadline() {
        let dir = tempfile::tempdir().expect("temp dir");
        fs::write(dir.path().join("a.txt"), "A").expect("write");
        let cache = region();
        let job = RefreshJob::new(
            RefreshJobConfig::new("a.txt").with_expires(Duration::from_secs(400_000_000_000)),
            cache.clone(),
            resolver(&dir),
        );

        assert!(matches!(job.run_once(), RefreshOutcome::Stored { .. }));
        let stored = cache.store_ref().fetch("a.txt").0.expect("stored");
        assert!(stored.expires_at.is_none());
        assert_eq!(cache.get("a.txt"), Some(Bytes::from("A")));
    }

    #[test]
    fn bind_rejects_unknown_region() {
        let dir = tempfile::tempdir().expect("temp dir");
        let regions = CacheRegions::open(&[StoreConfig::new("main")]).expect("open");
        let config = RefreshJobConfig::new("a.txt").with_region("portal");

        assert!(matches!(
            RefreshJob::bind(config, &regions, resolver(&dir)),
            Err(RefreshError::UnknownRegion { .. })
        ));
    }

    #[tokio::test]
    async fn scheduler_refreshes_until_shutdown() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("a.txt");
        fs::write(&path, "one").expect("write");
        let cache = region();

        let scheduler = RefreshScheduler::new([RefreshJob::new(
            RefreshJobConfig::new("a.txt").with_interval(Duration::from_millis(20)),
            cache.clone(),
            resolver(&dir),
        )]);
        let handle = scheduler.start();

        wait_for(&cache, "a.txt", "one").await;
        fs::write(&path, "two").expect("rewrite");
        wait_for(&cache, "a.txt", "two").await;

        handle.shutdown().await;
        fs::write(&path, "three").expect("rewrite");
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(cache.get("a.txt"), Some(Bytes::from("two")));
    }

    async fn wait_for(cache: &EventCache, key: &str, expected: &str) {
        for _ in 0..200 {
            if cache.get(key).as_deref() == Some(expected.as_bytes()) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("`{key}` never became `{expected}`");
    }
}
