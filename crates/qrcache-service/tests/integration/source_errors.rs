use qrcache_service::caching::CacheKey;
use qrcache_service::retry::RetryPreset;

use crate::{HitCounter, setup_cache};

#[tokio::test]
async fn test_not_found() {
    let (cache, _cache_dir) = setup_cache(|config| {
        config.downloads.retry = RetryPreset::Conservative;
    });
    let server = HitCounter::new();
    let url = server.url("respond_statuscode/404/qr.png");

    assert!(cache.image(&url).await.is_none());
    // terminal errors are not retried
    assert_eq!(server.accesses(), 1);

    // and not cached either
    assert!(cache.image(&url).await.is_none());
    assert_eq!(server.accesses(), 1);
}

#[tokio::test]
async fn test_malformed_image() {
    let (cache, _cache_dir) = setup_cache(|_| {});
    let server = HitCounter::new();
    let url = server.url("garbage_data/not-an-image");

    assert!(cache.image(&url).await.is_none());

    let disk = cache.disk().unwrap();
    disk.sync().await;
    assert!(!disk.path_for(&CacheKey::from_url(&url)).exists());
    assert!(cache.memory().is_empty());
}

#[tokio::test]
async fn test_unavailable_without_retries() {
    let (cache, _cache_dir) = setup_cache(|_| {});
    let server = HitCounter::new();
    let url = server.url("respond_statuscode/503/qr.png");

    assert!(cache.image(&url).await.is_none());
    assert_eq!(server.accesses(), 1);
}

#[tokio::test]
async fn test_unavailable_is_retried() {
    let (cache, _cache_dir) = setup_cache(|config| {
        config.downloads.retry = RetryPreset::Conservative;
    });
    let server = HitCounter::new();
    let url = server.url("respond_statuscode/503/qr.png");

    assert!(cache.image(&url).await.is_none());
    assert_eq!(server.accesses(), 2);
    assert_eq!(cache.fetcher().stats().failed(), 2);
}
