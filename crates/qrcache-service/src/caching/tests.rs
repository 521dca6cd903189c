use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use anyhow::Result;
use bytes::Bytes;
use filetime::FileTime;

use crate::config::{CacheConfigs, Config, DiskCacheConfig};

use super::*;

fn tempdir() -> io::Result<tempfile::TempDir> {
    tempfile::tempdir_in(".")
}

/// Creates a cache file that was last written `age` ago.
fn create_aged(dir: &Path, name: &str, contents: &[u8], age: Duration) -> PathBuf {
    fs::create_dir_all(dir).unwrap();
    let path = dir.join(name);
    fs::write(&path, contents).unwrap();
    let mtime = FileTime::from_system_time(SystemTime::now() - age);
    filetime::set_file_mtime(&path, mtime).unwrap();
    path
}

fn basenames(dir: &Path) -> Vec<String> {
    let mut names: Vec<_> = fs::read_dir(dir)
        .unwrap()
        .map(|x| x.unwrap().file_name().into_string().unwrap())
        .collect();
    names.sort();
    names
}

fn key(name: &str) -> CacheKey {
    CacheKey::from_locator(&format!("https://example.com/{name}.png"))
}

#[tokio::test]
async fn test_cache_dir_created() -> Result<()> {
    let basedir = tempdir()?;
    let store = DiskStore::open(IMAGES_CACHE, basedir.path(), Default::default())?;

    assert_eq!(store.cache_dir(), basedir.path().join("images"));
    assert!(fs::metadata(basedir.path().join("images"))?.is_dir());
    assert!(fs::metadata(basedir.path().join("tmp").join("images"))?.is_dir());

    Ok(())
}

#[tokio::test]
async fn test_tmp_cleared() -> Result<()> {
    let basedir = tempdir()?;
    let tmpdir = basedir.path().join("tmp").join("images");

    fs::create_dir_all(&tmpdir)?;
    let spam = tmpdir.join("spam");
    fs::write(&spam, b"half a png")?;
    assert!(spam.is_file());

    let _store = DiskStore::open(IMAGES_CACHE, basedir.path(), Default::default())?;

    assert!(fs::metadata(spam).is_err());
    assert!(tmpdir.is_dir());

    Ok(())
}

#[tokio::test]
async fn test_tmp_dirs_are_per_store() -> Result<()> {
    let basedir = tempdir()?;
    let other_tmp = basedir.path().join("tmp").join("thumbnails");

    fs::create_dir_all(&other_tmp)?;
    let in_flight = other_tmp.join("tmp1234");
    fs::write(&in_flight, b"being written")?;

    let _store = DiskStore::open(IMAGES_CACHE, basedir.path(), Default::default())?;

    assert!(in_flight.is_file());

    Ok(())
}

#[tokio::test]
async fn test_get_put_remove() -> Result<()> {
    qrcache_test::setup();
    let basedir = tempdir()?;
    let store = DiskStore::open(IMAGES_CACHE, basedir.path(), Default::default())?;

    assert_eq!(store.get(&key("a")).await, None);

    store.put(&key("a"), Bytes::from_static(b"first")).await;
    assert_eq!(store.get(&key("a")).await.as_deref(), Some(&b"first"[..]));
    assert!(store.path_for(&key("a")).is_file());

    // overwriting replaces the whole entry
    store.put(&key("a"), Bytes::from_static(b"2nd")).await;
    assert_eq!(store.get(&key("a")).await.as_deref(), Some(&b"2nd"[..]));

    store.remove(&key("a")).await;
    assert_eq!(store.get(&key("a")).await, None);
    // removing something absent is fine
    store.remove(&key("a")).await;

    assert_eq!(store.stats().writes(), 2);
    assert_eq!(store.stats().hits(), 2);
    assert_eq!(store.stats().reads(), 4);

    Ok(())
}

#[tokio::test]
async fn test_clear() -> Result<()> {
    let basedir = tempdir()?;
    let store = DiskStore::open(IMAGES_CACHE, basedir.path(), Default::default())?;

    for name in ["a", "b", "c"] {
        store.put(&key(name), Bytes::from(name.as_bytes().to_vec())).await;
    }
    assert_eq!(basenames(store.cache_dir()).len(), 3);

    store.clear().await;

    assert!(basenames(store.cache_dir()).is_empty());
    assert_eq!(store.get(&key("a")).await, None);

    Ok(())
}

#[tokio::test]
async fn test_store_is_fire_and_forget() -> Result<()> {
    let basedir = tempdir()?;
    let store = DiskStore::open(IMAGES_CACHE, basedir.path(), Default::default())?;

    store.store(&key("a"), Bytes::from_static(b"payload"));
    // later operations observe earlier writes
    assert_eq!(store.get(&key("a")).await.as_deref(), Some(&b"payload"[..]));

    Ok(())
}

#[tokio::test]
async fn test_writes_are_atomic() -> Result<()> {
    let basedir = tempdir()?;
    let store = DiskStore::open(IMAGES_CACHE, basedir.path(), Default::default())?;

    let writes = (0..10u8).map(|i| {
        let store = store.clone();
        async move { store.put(&key("same"), Bytes::from(vec![i; 64])).await }
    });
    futures::future::join_all(writes).await;
    store.sync().await;

    // one complete file, and no leftover temporary files
    assert_eq!(basenames(store.cache_dir()), vec![key("same").file_name()]);
    assert!(basenames(&basedir.path().join("tmp").join("images")).is_empty());

    let contents = store.get(&key("same")).await.unwrap();
    assert_eq!(contents.len(), 64);
    assert!(contents.iter().all(|b| *b == contents[0]));

    Ok(())
}

#[tokio::test]
async fn test_expired_entry_is_a_miss() -> Result<()> {
    let basedir = tempdir()?;
    let config = DiskCacheConfig {
        max_age: Some(Duration::from_secs(60)),
        ..Default::default()
    };
    let store = DiskStore::open(IMAGES_CACHE, basedir.path(), config)?;

    store.put(&key("old"), Bytes::from_static(b"old")).await;
    store.put(&key("fresh"), Bytes::from_static(b"fresh")).await;

    let path = store.path_for(&key("old"));
    let mtime = FileTime::from_system_time(SystemTime::now() - Duration::from_secs(61));
    filetime::set_file_mtime(&path, mtime)?;

    assert_eq!(store.get(&key("old")).await, None);
    assert!(!path.exists());
    assert_eq!(store.stats().expired(), 1);

    assert!(store.get(&key("fresh")).await.is_some());

    Ok(())
}

#[tokio::test]
async fn test_no_max_age() -> Result<()> {
    let basedir = tempdir()?;
    let config = DiskCacheConfig {
        max_age: None,
        ..Default::default()
    };
    create_aged(
        &basedir.path().join("images"),
        &key("ancient").file_name(),
        b"ancient",
        Duration::from_secs(365 * 24 * 3600),
    );

    let store = DiskStore::open(IMAGES_CACHE, basedir.path(), config)?;
    assert_eq!(
        store.get(&key("ancient")).await.as_deref(),
        Some(&b"ancient"[..])
    );

    Ok(())
}

#[tokio::test]
async fn test_startup_sweep() -> Result<()> {
    let basedir = tempdir()?;
    let cachedir = basedir.path().join("images");

    let stale = create_aged(&cachedir, "stale.img", b"stale", Duration::from_secs(3600));
    let fresh = create_aged(&cachedir, "fresh.img", b"fresh", Duration::from_secs(10));

    let config = DiskCacheConfig {
        max_age: Some(Duration::from_secs(60)),
        ..Default::default()
    };
    let store = DiskStore::open(IMAGES_CACHE, basedir.path(), config)?;
    store.sync().await;

    assert!(!stale.exists());
    assert!(fresh.exists());
    assert_eq!(store.stats().expired(), 1);

    Ok(())
}

#[tokio::test]
async fn test_size_eviction_removes_oldest() -> Result<()> {
    let basedir = tempdir()?;
    let config = DiskCacheConfig {
        max_size: 10,
        max_age: None,
    };
    let store = DiskStore::open(IMAGES_CACHE, basedir.path(), config)?;

    let age = |name: &str, secs: u64| {
        let mtime = FileTime::from_system_time(SystemTime::now() - Duration::from_secs(secs));
        filetime::set_file_mtime(store.path_for(&key(name)), mtime).unwrap();
    };

    store.put(&key("a"), Bytes::from_static(b"aaaa")).await;
    store.sync().await;
    age("a", 300);

    store.put(&key("b"), Bytes::from_static(b"bbbb")).await;
    store.sync().await;
    age("b", 200);

    // 12 bytes exceed the budget of 10, which evicts the oldest entry only
    store.put(&key("c"), Bytes::from_static(b"cccc")).await;
    store.sync().await;

    assert!(!store.path_for(&key("a")).exists());
    assert!(store.path_for(&key("b")).exists());
    assert!(store.path_for(&key("c")).exists());
    assert_eq!(store.stats().evicted(), 1);

    let total: u64 = fs::read_dir(store.cache_dir())?
        .map(|e| e.unwrap().metadata().unwrap().len())
        .sum();
    assert!(total <= 10);

    Ok(())
}

#[tokio::test]
async fn test_oversized_entry_is_evicted() -> Result<()> {
    let basedir = tempdir()?;
    let config = DiskCacheConfig {
        max_size: 4,
        max_age: None,
    };
    let store = DiskStore::open(IMAGES_CACHE, basedir.path(), config)?;

    store.put(&key("big"), Bytes::from_static(b"way too big")).await;
    store.sync().await;

    assert_eq!(store.get(&key("big")).await, None);
    assert!(basenames(store.cache_dir()).is_empty());

    Ok(())
}

#[tokio::test]
async fn test_cleanup() -> Result<()> {
    let basedir = tempdir()?;
    let config = DiskCacheConfig {
        max_size: 10,
        max_age: Some(Duration::from_secs(3600)),
    };
    let store = DiskStore::open(IMAGES_CACHE, basedir.path(), config)?;
    store.sync().await;

    let cachedir = store.cache_dir().to_path_buf();
    let old = create_aged(&cachedir, "old.img", b"1111", Duration::from_secs(7200));
    let mid = create_aged(&cachedir, "mid.img", b"2222", Duration::from_secs(1800));
    let new = create_aged(&cachedir, "new.img", b"3333", Duration::from_secs(60));
    let newest = create_aged(&cachedir, "newest.img", b"4444", Duration::from_secs(1));

    let expected = CleanupStats {
        removed_files: 2,
        removed_bytes: 8,
        retained_files: 2,
        retained_bytes: 8,
    };

    // a dry run reports, but does not delete anything
    let stats = store.cleanup(true).await?;
    assert_eq!(stats, expected);
    for path in [&old, &mid, &new, &newest] {
        assert!(path.exists());
    }
    assert_eq!(store.stats().expired(), 0);
    assert_eq!(store.stats().evicted(), 0);

    let stats = store.cleanup(false).await?;
    assert_eq!(stats, expected);
    assert_eq!(basenames(&cachedir), vec!["new.img", "newest.img"]);

    assert_eq!(store.stats().expired(), 1);
    assert_eq!(store.stats().evicted(), 1);

    Ok(())
}

#[tokio::test]
async fn test_cleanup_from_config() -> Result<()> {
    let basedir = tempdir()?;
    let stale = create_aged(
        &basedir.path().join("images"),
        "stale.img",
        b"stale",
        Duration::from_secs(3600),
    );

    let config = Config {
        cache_dir: Some(basedir.path().to_path_buf()),
        caches: CacheConfigs {
            disk: DiskCacheConfig {
                max_age: Some(Duration::from_secs(60)),
                ..Default::default()
            },
            ..Default::default()
        },
        ..Default::default()
    };

    cleanup(&config, false).await?;
    assert!(!stale.exists());

    // without a `cache_dir` there is nothing to clean up
    assert!(cleanup(&Config::default(), false).await.is_err());

    Ok(())
}

#[tokio::test]
async fn test_dry_run_from_config_keeps_files() -> Result<()> {
    let basedir = tempdir()?;
    let stale = create_aged(
        &basedir.path().join("images"),
        "stale.img",
        b"stale",
        Duration::from_secs(3600),
    );
    let partial = create_aged(
        &basedir.path().join("tmp").join("images"),
        "tmp5678",
        b"partial",
        Duration::ZERO,
    );

    let config = Config {
        cache_dir: Some(basedir.path().to_path_buf()),
        caches: CacheConfigs {
            disk: DiskCacheConfig {
                max_age: Some(Duration::from_secs(60)),
                ..Default::default()
            },
            ..Default::default()
        },
        ..Default::default()
    };

    let stats = cleanup(&config, true).await?;
    assert_eq!(
        stats,
        CleanupStats {
            removed_files: 1,
            removed_bytes: 5,
            retained_files: 0,
            retained_bytes: 0,
        }
    );
    assert!(stale.exists());
    assert!(partial.exists());

    let stats = cleanup(&config, false).await?;
    assert_eq!(stats.removed_files, 1);
    assert!(!stale.exists());

    Ok(())
}
