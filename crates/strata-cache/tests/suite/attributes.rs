use std::time::Duration;

use strata_cache::{keys, AttributeStore, AttributeStoreConfig, CacheConfig, CacheDir, Properties};
use strata_core::RootUrl;
use strata_scheduler::Scheduler;

fn cache_dir(temp: &tempfile::TempDir) -> CacheDir {
    CacheDir::new(CacheConfig {
        cache_root_override: Some(temp.path().join("cache")),
    })
    .unwrap()
}

fn root(name: &str) -> RootUrl {
    RootUrl::parse(&format!("file:///work/{name}/src/")).unwrap()
}

fn on_disk(cache: &CacheDir, root: &RootUrl) -> Properties {
    Properties::load(&cache.root_dir(root).attributes_path()).unwrap()
}

#[test]
fn ensure_reports_difference_and_check_only_does_not_mutate() {
    let temp = tempfile::tempdir().unwrap();
    let store = AttributeStore::new(cache_dir(&temp), AttributeStoreConfig::default());
    let r = root("app");

    assert!(store.ensure(&r, keys::SOURCE_LEVEL, Some("17"), true).unwrap());
    assert_eq!(store.get(&r, keys::SOURCE_LEVEL, None).unwrap(), None);

    assert!(store.ensure(&r, keys::SOURCE_LEVEL, Some("17"), false).unwrap());
    assert!(!store.ensure(&r, keys::SOURCE_LEVEL, Some("17"), false).unwrap());
    assert_eq!(
        store.get(&r, keys::SOURCE_LEVEL, None).unwrap().as_deref(),
        Some("17")
    );

    assert!(store.ensure(&r, keys::SOURCE_LEVEL, None, false).unwrap());
    assert_eq!(
        store.get(&r, keys::SOURCE_LEVEL, Some("11")).unwrap().as_deref(),
        Some("11")
    );
}

#[test]
fn write_through_without_scheduler() {
    let temp = tempfile::tempdir().unwrap();
    let cache = cache_dir(&temp);
    let store = AttributeStore::new(cache.clone(), AttributeStoreConfig::default());
    let r = root("lib");

    store.set(&r, keys::MODULE_NAME, Some("com.example.lib")).unwrap();
    assert_eq!(on_disk(&cache, &r).get(keys::MODULE_NAME), Some("com.example.lib"));
    assert!(!store.has_pending_write(&r));
}

#[test]
fn deferred_writes_coalesce_and_flush_is_a_barrier() {
    let temp = tempfile::tempdir().unwrap();
    let cache = cache_dir(&temp);
    let store = AttributeStore::with_scheduler(
        cache.clone(),
        AttributeStoreConfig {
            write_delay: Duration::from_secs(60),
            cache_ttl: Duration::from_secs(60),
        },
        Scheduler::default(),
    );
    let r = root("app");

    store.set(&r, keys::DIRTY, Some("true")).unwrap();
    store.set(&r, keys::SOURCE_LEVEL, Some("21")).unwrap();
    assert!(store.has_pending_write(&r));
    assert!(on_disk(&cache, &r).is_empty());

    store.flush(&r).unwrap();
    let persisted = on_disk(&cache, &r);
    assert_eq!(persisted.get(keys::DIRTY), Some("true"));
    assert_eq!(persisted.get(keys::SOURCE_LEVEL), Some("21"));
    assert!(!store.has_pending_write(&r));
}

#[test]
fn deferred_write_lands_after_delay() {
    let temp = tempfile::tempdir().unwrap();
    let cache = cache_dir(&temp);
    let store = AttributeStore::with_scheduler(
        cache.clone(),
        AttributeStoreConfig {
            write_delay: Duration::from_millis(20),
            cache_ttl: Duration::from_secs(60),
        },
        Scheduler::default(),
    );
    let r = root("app");
    store.set(&r, keys::MODULE_NAME, Some("app")).unwrap();

    let mut written = false;
    for _ in 0..200 {
        if on_disk(&cache, &r).get(keys::MODULE_NAME) == Some("app") {
            written = true;
            break;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    assert!(written, "deferred write never happened");
}

#[test]
fn evicted_dirty_root_is_kept_until_written() {
    let temp = tempfile::tempdir().unwrap();
    let cache = cache_dir(&temp);
    let store = AttributeStore::with_scheduler(
        cache.clone(),
        AttributeStoreConfig {
            write_delay: Duration::from_secs(60),
            cache_ttl: Duration::from_secs(60),
        },
        Scheduler::default(),
    );
    let a = root("a");
    let b = root("b");

    store.set(&a, keys::MODULE_NAME, Some("a")).unwrap();
    // Touching another root pushes `a` out of the single cache slot.
    store.set(&b, keys::MODULE_NAME, Some("b")).unwrap();
    assert_eq!(store.get(&a, keys::MODULE_NAME, None).unwrap().as_deref(), Some("a"));
    assert!(store.has_pending_write(&a));

    store.flush_all().unwrap();
    assert_eq!(on_disk(&cache, &a).get(keys::MODULE_NAME), Some("a"));
    assert_eq!(on_disk(&cache, &b).get(keys::MODULE_NAME), Some("b"));
}

#[test]
fn expired_slot_reloads_from_disk() {
    let temp = tempfile::tempdir().unwrap();
    let cache = cache_dir(&temp);
    let store = AttributeStore::new(
        cache.clone(),
        AttributeStoreConfig {
            write_delay: Duration::ZERO,
            cache_ttl: Duration::ZERO,
        },
    );
    let r = root("app");
    store.set(&r, keys::SOURCE_LEVEL, Some("8")).unwrap();

    let mut external = Properties::new();
    external.set(keys::SOURCE_LEVEL, "17");
    external.store(&cache.root_dir(&r).attributes_path()).unwrap();

    assert_eq!(
        store.get(&r, keys::SOURCE_LEVEL, None).unwrap().as_deref(),
        Some("17")
    );
}

#[test]
fn corrupt_attributes_read_as_empty() {
    let temp = tempfile::tempdir().unwrap();
    let cache = cache_dir(&temp);
    let r = root("app");
    let path = cache.root_dir(&r).attributes_path();
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(&path, "this line has no separator\n").unwrap();

    let store = AttributeStore::new(cache, AttributeStoreConfig::default());
    assert_eq!(store.get(&r, keys::DIRTY, None).unwrap(), None);
    assert!(store.ensure(&r, keys::DIRTY, Some("true"), false).unwrap());
}
