use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use bytes::Bytes;
use cachet::cache::{
    BackingTier, Cache, CacheEntry, CacheRegions, CacheStore, CopletInstance, DiskTier,
    EventAction, EventCache, NamedEvent, StoreConfig, TierError, ValidityToken,
};

fn render(
    coplet: &CopletInstance,
    cache: &dyn Cache,
    validity: Vec<ValidityToken>,
    body: &str,
) -> (Bytes, bool) {
    let key = coplet.cache_key("coplet", true);
    if let Some(cached) = cache.get_response(&key)
        && cached.is_fresh(&validity)
    {
        return (cached.value, false);
    }

    let value = Bytes::from(body.to_string());
    cache.store(&key, value.clone(), validity);
    (value, true)
}

#[test]
fn coplet_output_is_recomputed_only_when_stale() {
    let cache = CacheStore::open(&StoreConfig::default()).expect("open");
    let coplet = CopletInstance::new("42", "http://x/y");
    let key = coplet.cache_key("coplet", true);
    assert_eq!(key, "coplet:42/http://x/y");

    cache.store(&key, Bytes::from("A"), vec![ValidityToken::TimeStamp(1000)]);
    assert_eq!(cache.get(&key), Some(Bytes::from("A")));

    let (value, recomputed) =
        render(&coplet, &cache, vec![ValidityToken::TimeStamp(1000)], "unused");
    assert_eq!(value, Bytes::from("A"));
    assert!(!recomputed);

    let (value, recomputed) = render(&coplet, &cache, vec![ValidityToken::TimeStamp(2000)], "B");
    assert_eq!(value, Bytes::from("B"));
    assert!(recomputed);
    assert_eq!(cache.get(&key), Some(Bytes::from("B")));
}

#[test]
fn events_remove_tagged_entries_and_leave_others() {
    let cache = EventCache::open(&StoreConfig::default()).expect("open");
    let stamp = vec![ValidityToken::TimeStamp(1)];

    for n in 0..20 {
        let tag = if n % 2 == 0 { "E" } else { "F" };
        cache.store_tagged(&format!("k{n}"), format!("v{n}"), stamp.clone(), tag);
    }
    cache.store("untagged", Bytes::from("u"), stamp.clone());

    assert_eq!(cache.process_event(&NamedEvent::new("E")), 10);

    for n in 0..20 {
        let present = cache.get(&format!("k{n}")).is_some();
        assert_eq!(present, n % 2 == 1, "k{n}");
    }
    assert!(cache.contains_key("untagged"));
    assert_eq!(cache.process_event(&NamedEvent::new("E")), 0);
}

#[test]
fn event_action_is_the_only_external_entry_point() {
    let configs = [StoreConfig::new("main"), StoreConfig::new("portal")];
    let regions = CacheRegions::open(&configs).expect("open");
    let portal = regions.get("portal").expect("portal");
    let main = regions.get("main").expect("main");

    portal.store_tagged("p", "P", Vec::new(), "layout-changed");
    main.store_tagged("m", "M", Vec::new(), "layout-changed");

    let action = EventAction::new(portal.clone());
    assert!(action.act(Some("")).is_err());
    assert_eq!(action.act(Some("layout-changed")), Ok(1));

    assert!(!portal.contains_key("p"));
    assert!(main.contains_key("m"));
}

#[derive(Debug)]
struct FaultyTier {
    inner: DiskTier,
    down: AtomicBool,
}

impl FaultyTier {
    fn guard(&self) -> Result<(), TierError> {
        if self.down.load(Ordering::SeqCst) {
            return Err(TierError::Unavailable("injected fault".to_string()));
        }
        Ok(())
    }
}

impl BackingTier for FaultyTier {
    fn load(&self, key: &str) -> Result<Option<CacheEntry>, TierError> {
        self.guard()?;
        self.inner.load(key)
    }

    fn save(&self, entry: &CacheEntry) -> Result<(), TierError> {
        self.guard()?;
        self.inner.save(entry)
    }

    fn delete(&self, key: &str) -> Result<bool, TierError> {
        self.guard()?;
        self.inner.delete(key)
    }

    fn contains(&self, key: &str) -> Result<bool, TierError> {
        self.guard()?;
        self.inner.contains(key)
    }

    fn keys(&self) -> Result<Vec<String>, TierError> {
        self.guard()?;
        self.inner.keys()
    }

    fn len(&self) -> Result<usize, TierError> {
        self.guard()?;
        self.inner.len()
    }

    fn clear(&self) -> Result<(), TierError> {
        self.guard()?;
        self.inner.clear()
    }
}

#[test]
fn tier_fault_is_a_miss_and_store_recovers() {
    let dir = tempfile::tempdir().expect("temp dir");
    let tier = Arc::new(FaultyTier {
        inner: DiskTier::open("main", dir.path()).expect("open tier"),
        down: AtomicBool::new(false),
    });
    let config = StoreConfig::new("main").with_max_entries(1);
    let cache = CacheStore::with_tier(&config, tier.clone()).expect("open");

    cache.store("spilled", Bytes::from("S"), Vec::new());
    cache.store("hot", Bytes::from("H"), Vec::new());

    tier.down.store(true, Ordering::SeqCst);
    assert!(cache.get("spilled").is_none());
    assert_eq!(cache.get("hot"), Some(Bytes::from("H")));
    cache.store("spilled", Bytes::from("S2"), Vec::new());

    tier.down.store(false, Ordering::SeqCst);
    cache.store("spilled", Bytes::from("S3"), Vec::new());
    assert_eq!(cache.get("spilled"), Some(Bytes::from("S3")));
}

fn faulty_event_cache(dir: &tempfile::TempDir) -> (Arc<FaultyTier>, EventCache) {
    let tier = Arc::new(FaultyTier {
        inner: DiskTier::open("main", dir.path()).expect("open tier"),
        down: AtomicBool::new(false),
    });
    let config = StoreConfig::new("main").with_max_entries(1);
    let store = CacheStore::with_tier(&config, tier.clone()).expect("open");
    (tier, EventCache::from_store(store))
}

#[test]
fn event_during_tier_fault_never_resurrects_the_entry() {
    let dir = tempfile::tempdir().expect("temp dir");
    let (tier, cache) = faulty_event_cache(&dir);
    cache.store_tagged("k", "stale", Vec::new(), "E");
    cache.store("hot", Bytes::from("H"), Vec::new());
    assert!(tier.inner.contains("k").expect("k spilled"));

    tier.down.store(true, Ordering::SeqCst);
    assert_eq!(cache.process_event(&NamedEvent::new("E")), 0);
    assert!(cache.get("k").is_none());
    assert_eq!(cache.events_for_key("k"), vec!["E"]);

    tier.down.store(false, Ordering::SeqCst);
    assert!(!cache.contains_key("k"));
    assert!(cache.get("k").is_none());
    assert!(!tier.inner.contains("k").expect("tier copy deleted"));
    assert!(cache.events_for_key("k").is_empty());
    assert_eq!(cache.get("hot"), Some(Bytes::from("H")));
}

#[test]
fn clear_during_tier_fault_keeps_spilled_entries_invalidatable() {
    let dir = tempfile::tempdir().expect("temp dir");
    let (tier, cache) = faulty_event_cache(&dir);
    cache.store_tagged("k", "v", Vec::new(), "E");
    cache.store("hot", Bytes::from("H"), Vec::new());

    tier.down.store(true, Ordering::SeqCst);
    cache.clear();

    tier.down.store(false, Ordering::SeqCst);
    assert_eq!(cache.keys().collect::<Vec<_>>(), Vec::<String>::new());
    assert_eq!(cache.process_event(&NamedEvent::new("E")), 1);
    assert!(cache.get("k").is_none());
    assert!(!tier.inner.contains("k").expect("tier copy deleted"));

    cache.store_tagged("k", "fresh", Vec::new(), "E");
    assert_eq!(cache.get("k"), Some(Bytes::from("fresh")));
}

#[test]
fn closed_regions_survive_a_restart() {
    let work = tempfile::tempdir().expect("temp dir");
    let config = StoreConfig::new("main")
        .with_work_dir(work.path())
        .with_directory("data/main")
        .with_max_entries(2);

    {
        let cache = EventCache::open(&config).expect("open");
        for n in 0..5 {
            cache.store_tagged(
                &format!("k{n}"),
                format!("v{n}"),
                vec![ValidityToken::attributes([("lang", "de")])],
                "content-changed",
            );
        }
        assert_eq!(cache.size(), 5);
        cache.close();
    }

    let cache = EventCache::open(&config).expect("reopen");
    assert_eq!(cache.size(), 5);
    let response = cache.get_response("k3").expect("persisted");
    assert_eq!(response.value, Bytes::from("v3"));
    assert!(response.is_fresh(&[ValidityToken::attributes([("lang", "de")])]));

    assert_eq!(cache.process_event(&NamedEvent::new("content-changed")), 5);
    assert_eq!(cache.size(), 0);
}

#[test]
fn unusable_directory_fails_at_open() {
    let work = tempfile::tempdir().expect("temp dir");
    std::fs::write(work.path().join("occupied"), b"not a directory").expect("write");

    let config = StoreConfig::new("main")
        .with_work_dir(work.path())
        .with_directory("occupied");
    assert!(CacheStore::open(&config).is_err());
}

#[test]
fn concurrent_producers_and_events_do_not_leave_tagged_entries() {
    let config = StoreConfig::default().with_max_entries(10_000);
    let cache = Arc::new(EventCache::open(&config).expect("open"));

    let producers: Vec<_> = (0..4)
        .map(|worker| {
            let cache = cache.clone();
            thread::spawn(move || {
                for n in 0..200 {
                    cache.store_tagged(&format!("w{worker}:{n}"), "v", Vec::new(), "E");
                }
            })
        })
        .collect();
    for producer in producers {
        producer.join().expect("producer");
    }

    cache.process_event(&NamedEvent::new("E"));
    assert_eq!(cache.size(), 0);
    assert!(cache.events_for_key("w0:0").is_empty());
}
