use std::sync::Arc;

use qrcache_service::config::Config;
use qrcache_service::images::ImageCache;
use qrcache_test as test;

pub use test::{HitCounter, TempDir};

/// Setup tests and create an image cache.
///
/// This function returns a tuple containing the cache to test, and a temporary cache directory.
/// The directory is cleaned up when the [`TempDir`] instance is dropped. Keep it as guard until
/// the test has finished.
/// The `update_config` closure can modify any default configuration if needed before the cache
/// is created.
pub fn setup_cache(update_config: impl FnOnce(&mut Config)) -> (Arc<ImageCache>, TempDir) {
    test::setup();

    let cache_dir = test::tempdir();

    let mut config = Config {
        cache_dir: Some(cache_dir.path().to_owned()),
        ..Default::default()
    };
    update_config(&mut config);

    let cache = ImageCache::from_config(&config).unwrap();
    (Arc::new(cache), cache_dir)
}

/// Creates a second image cache on top of an existing cache directory.
///
/// This behaves like the cache of a restarted process.
pub fn reopen_cache(cache_dir: &TempDir) -> Arc<ImageCache> {
    let config = Config {
        cache_dir: Some(cache_dir.path().to_owned()),
        ..Default::default()
    };
    Arc::new(ImageCache::from_config(&config).unwrap())
}
