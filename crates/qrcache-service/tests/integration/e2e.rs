use std::fs;
use std::sync::Arc;

use qrcache_service::caching::CacheKey;

use crate::{HitCounter, reopen_cache, setup_cache};

#[tokio::test]
async fn test_download_then_cached() {
    let (cache, cache_dir) = setup_cache(|_| {});
    let server = HitCounter::new();
    let url = server.url("png/32/qr.png");

    let image = cache.image(&url).await.unwrap();
    assert_eq!((image.width(), image.height()), (32, 32));
    assert_eq!(server.accesses(), 1);

    // the image ended up in both layers
    let key = CacheKey::from_url(&url);
    assert!(cache.memory().contains(&key));
    let disk = cache.disk().unwrap();
    disk.sync().await;
    let file = cache_dir.path().join("images").join(key.file_name());
    assert_eq!(fs::read(file).unwrap(), image.data().as_ref());

    // the second request neither touches the network nor the disk
    let reads = disk.stats().reads();
    let again = cache.image(&url).await.unwrap();
    assert!(Arc::ptr_eq(&image, &again));
    assert_eq!(server.accesses(), 0);
    assert_eq!(disk.stats().reads(), reads);
}

#[tokio::test]
async fn test_survives_restart() {
    let (cache, cache_dir) = setup_cache(|_| {});
    let server = HitCounter::new();
    let url = server.url("png/16/restart.png");

    cache.image(&url).await.unwrap();
    cache.disk().unwrap().sync().await;
    assert_eq!(server.accesses(), 1);
    drop(cache);

    let cache = reopen_cache(&cache_dir);
    let image = cache.image(&url).await.unwrap();
    assert_eq!(image.width(), 16);
    assert_eq!(server.accesses(), 0);
    assert_eq!(cache.disk().unwrap().stats().hits(), 1);
}

#[tokio::test]
async fn test_memory_pressure() {
    let (cache, _cache_dir) = setup_cache(|_| {});
    let server = HitCounter::new();
    let url = server.url("png/16/pressure.png");

    cache.image(&url).await.unwrap();
    cache.disk().unwrap().sync().await;

    cache.handle_memory_pressure();
    assert!(cache.memory().is_empty());

    assert!(cache.image(&url).await.is_some());
    assert_eq!(server.accesses(), 1);
    assert_eq!(cache.disk().unwrap().stats().hits(), 1);
}

#[tokio::test]
async fn test_without_cache_dir() {
    let (cache, _cache_dir) = setup_cache(|config| config.cache_dir = None);
    let server = HitCounter::new();
    let url = server.url("png/16/nodisk.png");

    assert!(cache.disk().is_none());
    assert!(cache.image(&url).await.is_some());
    assert!(cache.image(&url).await.is_some());
    assert_eq!(server.accesses(), 1);

    cache.handle_memory_pressure();
    assert!(cache.image(&url).await.is_some());
    assert_eq!(server.accesses(), 1);
}

#[tokio::test]
async fn test_concurrent_downloads_are_bounded() {
    let (cache, _cache_dir) = setup_cache(|config| {
        config.downloads.max_concurrent_downloads = 2;
    });
    let server = HitCounter::new();

    let requests = (0..4).map(|i| {
        let cache = Arc::clone(&cache);
        let url = server.url(&format!("delay/100ms/png/8/{i}.png"));
        tokio::spawn(async move { cache.image(&url).await })
    });
    let results = futures::future::join_all(requests).await;

    for result in results {
        assert!(result.unwrap().is_some());
    }

    let stats = cache.fetcher().stats();
    assert_eq!(stats.completed(), 4);
    assert!(stats.max_in_flight() <= 2);
    assert_eq!(stats.in_flight(), 0);
}
