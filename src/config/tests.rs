use std::path::Path;

use clap::Parser;

use super::*;

#[test]
fn cli_overrides_take_highest_precedence() {
    let mut raw = RawSettings::default();
    raw.logging.level = Some("info".to_string());
    raw.store.work_dir = Some(PathBuf::from("/srv/cachet"));

    let overrides = Overrides {
        log_level: Some("debug".to_string()),
        store_work_dir: Some(PathBuf::from("/var/cache/cachet")),
        ..Default::default()
    };

    raw.apply_overrides(&overrides);
    let settings = Settings::from_raw(raw).expect("valid settings");

    assert_eq!(settings.logging.level, LevelFilter::DEBUG);
    assert_eq!(settings.store.work_dir, Path::new("/var/cache/cachet"));
    assert_eq!(settings.store.regions[0].work_dir, Path::new("/var/cache/cachet"));
}

#[test]
fn defaults_to_single_main_region() {
    let settings = Settings::from_raw(RawSettings::default()).expect("valid settings");

    assert_eq!(settings.store.regions.len(), 1);
    let main = settings.region("main").expect("main region");
    assert_eq!(main.max_entries, DEFAULT_MAX_ENTRIES);
    assert!(main.directory.is_none());
    assert!(settings.refresh.is_empty());
    assert!(matches!(settings.logging.format, LogFormat::Compact));
}

#[test]
fn cli_json_logging_enforces_format() {
    let mut raw = RawSettings::default();
    let overrides = Overrides {
        log_json: Some(true),
        ..Default::default()
    };

    raw.apply_overrides(&overrides);
    let settings = Settings::from_raw(raw).expect("valid settings");

    assert!(matches!(settings.logging.format, LogFormat::Json));
}

#[test]
fn rejects_zero_capacity_region() {
    let mut raw = RawSettings::default();
    raw.store.regions.push(RawRegionSettings {
        name: Some("main".to_string()),
        max_entries: Some(0),
        directory: None,
    });

    assert!(matches!(
        Settings::from_raw(raw),
        Err(LoadError::Invalid { key: "store.regions.max_entries", .. })
    ));
}

#[test]
fn rejects_duplicate_regions() {
    let mut raw = RawSettings::default();
    raw.store.regions = vec![RawRegionSettings::default(), RawRegionSettings::default()];

    assert!(matches!(
        Settings::from_raw(raw),
        Err(LoadError::Invalid { key: "store.regions.name", .. })
    ));
}

#[test]
fn refresh_defaults_and_region_check() {
    let mut raw = RawSettings::default();
    raw.refresh.push(RawRefreshSettings {
        uri: Some("feeds/news.xml".to_string()),
        ..Default::default()
    });
    let settings = Settings::from_raw(raw.clone()).expect("valid settings");

    let job = &settings.refresh[0];
    assert_eq!(job.region, "main");
    assert_eq!(job.expires, Duration::ZERO);
    assert_eq!(job.interval, DEFAULT_REFRESH_INTERVAL);
    assert_eq!(job.key(), Some("feeds/news.xml"));

    raw.refresh[0].cache_role = Some("portal".to_string());
    assert!(matches!(
        Settings::from_raw(raw),
        Err(LoadError::Invalid { key: "refresh.cache-role", .. })
    ));
}

#[test]
fn rejects_zero_refresh_interval() {
    let mut raw = RawSettings::default();
    raw.refresh.push(RawRefreshSettings {
        uri: Some("a".to_string()),
        interval_seconds: Some(0),
        ..Default::default()
    });

    assert!(matches!(
        Settings::from_raw(raw),
        Err(LoadError::Invalid { key: "refresh.interval-seconds", .. })
    ));
}

#[test]
fn rejects_out_of_range_cache_expires() {
    let mut raw = RawSettings::default();
    raw.refresh.push(RawRefreshSettings {
        uri: Some("a".to_string()),
        cache_expires: Some(400_000_000_000),
        ..Default::default()
    });

    assert!(matches!(
        Settings::from_raw(raw.clone()),
        Err(LoadError::Invalid { key: "refresh.cache-expires", .. })
    ));

    raw.refresh[0].cache_expires = Some(MAX_CACHE_EXPIRES_SECS);
    let settings = Settings::from_raw(raw).expect("upper bound is accepted");
    assert_eq!(
        settings.refresh[0].expires,
        Duration::from_secs(MAX_CACHE_EXPIRES_SECS)
    );
}

#[test]
fn loads_regions_and_jobs_from_file() {
    let dir = tempfile::tempdir().expect("temp dir");
    let path = dir.path().join("cachet.toml");
    std::fs::write(
        &path,
        r#"
[logging]
level = "warn"

[store]
work_dir = "/var/lib/cachet"

[[store.regions]]
name = "main"
max_entries = 50
directory = "main"

[[store.regions]]
name = "portal"

[[refresh]]
uri = "file:///srv/feeds/news.xml"
cache-role = "portal"
cache-expires = 120
cache-name = "news"
interval-seconds = 30
"#,
    )
    .expect("write config");

    let cli = CliArgs::parse_from(["cachet", "--config-file", path.to_str().expect("utf-8")]);
    let settings = load(&cli).expect("load settings");

    assert_eq!(settings.logging.level, LevelFilter::WARN);
    assert_eq!(settings.store.regions.len(), 2);
    let main = settings.region("main").expect("main");
    assert_eq!(main.max_entries, 50);
    assert_eq!(
        main.resolved_directory(),
        Some(PathBuf::from("/var/lib/cachet/main"))
    );

    let job = &settings.refresh[0];
    assert_eq!(job.region, "portal");
    assert_eq!(job.expires, Duration::from_secs(120));
    assert_eq!(job.key(), Some("news"));
    assert_eq!(job.interval, Duration::from_secs(30));
}

#[test]
fn parse_event_command() {
    let args = CliArgs::parse_from(["cachet", "event", "--region", "portal", "user-changed"]);

    match args.command.expect("event command") {
        Command::Event(event) => {
            assert_eq!(event.target.region, "portal");
            assert_eq!(event.name.as_deref(), Some("user-changed"));
        }
        _ => panic!("wrong command parsed"),
    }
}

#[test]
fn event_name_is_optional_at_parse_time() {
    let args = CliArgs::parse_from(["cachet", "event"]);

    match args.command.expect("event command") {
        Command::Event(event) => {
            assert_eq!(event.target.region, "main");
            assert!(event.name.is_none());
        }
        _ => panic!("wrong command parsed"),
    }
}

#[test]
fn parse_run_overrides() {
    let args = CliArgs::parse_from(["cachet", "run", "--log-level", "trace", "--log-json", "yes"]);

    let command = args.command.expect("run command");
    let overrides = command.overrides();
    assert_eq!(overrides.log_level.as_deref(), Some("trace"));
    assert_eq!(overrides.log_json, Some(true));
    assert!(matches!(command, Command::Run(_)));
}
