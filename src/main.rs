use std::{process, sync::Arc};

use cachet::{
    cache::{
        Cache, CacheRegions, EventAction, EventCache, RefreshJob, RefreshOutcome, RefreshScheduler,
    },
    config::{self, Command, EventArgs, RegionArgs, RunArgs, Settings},
    infra::{error::InfraError, telemetry},
    source::{FileSourceResolver, SourceResolver},
};
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &InfraError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), InfraError> {
    let (cli_args, settings) = config::load_with_cli()?;

    let command = cli_args
        .command
        .unwrap_or(Command::Run(RunArgs::default()));

    telemetry::init(&settings.logging)?;

    match command {
        Command::Run(_) => run_service(settings).await,
        Command::Keys(args) => run_keys(&settings, &args),
        Command::Clear(args) => run_clear(&settings, &args),
        Command::Event(args) => run_event(&settings, &args),
        Command::Refresh(_) => run_refresh_once(settings).await,
    }
}

async fn run_service(settings: Settings) -> Result<(), InfraError> {
    let (regions, scheduler) = build_scheduler(&settings)?;
    let handle = scheduler.start();

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");

    handle.shutdown().await;
    let flushed = regions.close_all();
    info!(flushed, "cachet stopped");
    Ok(())
}

async fn run_refresh_once(settings: Settings) -> Result<(), InfraError> {
    let (regions, scheduler) = build_scheduler(&settings)?;

    let outcomes = tokio::task::spawn_blocking(move || scheduler.run_all_once())
        .await
        .map_err(|err| InfraError::configuration(format!("refresh worker failed: {err}")))?;

    let failed = outcomes
        .iter()
        .filter(|outcome| matches!(outcome, RefreshOutcome::Failed(_)))
        .count();
    regions.close_all();

    info!(jobs = outcomes.len(), failed, "refresh pass finished");
    if failed > 0 {
        warn!(failed, "some refresh jobs kept their previous entries");
    }
    Ok(())
}

fn run_keys(settings: &Settings, args: &RegionArgs) -> Result<(), InfraError> {
    let cache = open_region(settings, &args.region)?;

    let mut keys: Vec<String> = cache.keys().collect();
    keys.sort_unstable();
    for key in &keys {
        println!("{key}");
    }

    cache.close();
    Ok(())
}

fn run_clear(settings: &Settings, args: &RegionArgs) -> Result<(), InfraError> {
    let cache = open_region(settings, &args.region)?;
    let size = cache.size();
    cache.clear();
    cache.close();

    info!(region = %args.region, removed = size, "region cleared");
    Ok(())
}

fn run_event(settings: &Settings, args: &EventArgs) -> Result<(), InfraError> {
    let cache = Arc::new(open_region(settings, &args.target.region)?);
    let action = EventAction::new(cache.clone());

    let outcome = action.act(args.name.as_deref());
    cache.close();

    let removed = outcome?;
    println!("{removed}");
    Ok(())
}

fn open_region(settings: &Settings, name: &str) -> Result<EventCache, InfraError> {
    let config = settings
        .region(name)
        .ok_or_else(|| InfraError::configuration(format!("region `{name}` is not configured")))?;
    Ok(EventCache::open(config)?)
}

fn build_scheduler(settings: &Settings) -> Result<(CacheRegions, RefreshScheduler), InfraError> {
    let regions = CacheRegions::open(&settings.store.regions)?;
    let resolver: Arc<dyn SourceResolver> =
        Arc::new(FileSourceResolver::new(settings.store.work_dir.clone()));

    let mut scheduler = RefreshScheduler::default();
    for job in &settings.refresh {
        scheduler.push(RefreshJob::bind(job.clone(), &regions, resolver.clone())?);
    }

    Ok((regions, scheduler))
}
