//! The tiered image cache: memory, then disk, then the network.

use std::sync::{Arc, Weak};

use url::Url;

use crate::caching::{CacheContents, CacheKey, DiskStore, IMAGES_CACHE, MemoryStore};
use crate::config::{Config, MemoryCacheConfig};
use crate::download::{BoundedFetcher, HttpImageSource, Image};
use crate::retry::{RetryConfig, execute_with_retry};
use crate::utils::http::DownloadTimeouts;

/// A platform facility notifying about memory pressure.
pub trait MemoryPressureSource {
    /// Registers `callback` to be invoked whenever the system runs low on memory.
    fn subscribe(&self, callback: Box<dyn Fn() + Send + Sync>);
}

/// Loads images by URL, serving them from the fastest layer that has them.
///
/// See the [`caching`](crate::caching) module for a description of the layers.
#[derive(Debug)]
pub struct ImageCache {
    memory: MemoryStore<Arc<Image>>,
    disk: Option<DiskStore>,
    fetcher: BoundedFetcher,
    retry: Option<RetryConfig>,
}

impl ImageCache {
    /// Assembles a cache from its layers.
    ///
    /// Without a `disk` store, every in-memory miss results in a download. With a `retry`
    /// policy, failed downloads are retried according to it.
    pub fn new(
        memory: MemoryStore<Arc<Image>>,
        disk: Option<DiskStore>,
        fetcher: BoundedFetcher,
        retry: Option<RetryConfig>,
    ) -> Self {
        Self {
            memory,
            disk,
            fetcher,
            retry,
        }
    }

    /// Creates the cache described by `config`, downloading images over HTTP.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let MemoryCacheConfig {
            max_cost,
            max_count,
        } = config.caches.memory;
        let memory = MemoryStore::new(IMAGES_CACHE, max_cost, max_count);

        let disk = match &config.cache_dir {
            Some(cache_dir) => Some(DiskStore::open(
                IMAGES_CACHE,
                cache_dir,
                config.caches.disk,
            )?),
            None => None,
        };

        let timeouts = DownloadTimeouts::from_config(&config.downloads);
        let source = Arc::new(HttpImageSource::with_timeouts(timeouts)?);
        let fetcher = BoundedFetcher::from_config(source, &config.downloads);

        Ok(Self::new(
            memory,
            disk,
            fetcher,
            config.downloads.retry.config(),
        ))
    }

    pub fn memory(&self) -> &MemoryStore<Arc<Image>> {
        &self.memory
    }

    pub fn disk(&self) -> Option<&DiskStore> {
        self.disk.as_ref()
    }

    pub fn fetcher(&self) -> &BoundedFetcher {
        &self.fetcher
    }

    /// Loads the image behind `url`.
    ///
    /// Returns `None` if the image is neither cached nor could be downloaded. The reason is
    /// logged, it is not surfaced to the caller.
    pub async fn image(&self, url: &Url) -> Option<Arc<Image>> {
        let key = CacheKey::from_url(url);
        metric!(counter("caches.access") += 1, "cache" => IMAGES_CACHE);

        if let Some(image) = self.memory.get(&key) {
            tracing::trace!(key = %key, "Memory cache hit");
            metric!(counter("caches.memory.hit") += 1, "cache" => IMAGES_CACHE);
            return Some(image);
        }

        if let Some(image) = self.load_from_disk(&key).await {
            return Some(image);
        }

        metric!(counter("caches.computation") += 1, "cache" => IMAGES_CACHE);
        let image = match self.download(url).await {
            Ok(image) => Arc::new(image),
            Err(err) => {
                tracing::warn!(
                    error = &err as &dyn std::error::Error,
                    url = %url,
                    "Failed to load image"
                );
                return None;
            }
        };

        self.memory.put(key.clone(), Arc::clone(&image), image.cost());
        if let Some(disk) = &self.disk {
            disk.store(&key, image.data().clone());
        }

        Some(image)
    }

    async fn load_from_disk(&self, key: &CacheKey) -> Option<Arc<Image>> {
        let disk = self.disk.as_ref()?;
        let data = disk.get(key).await?;

        match Image::decode_blocking(data).await {
            Ok(image) => {
                tracing::trace!(key = %key, "File cache hit");
                metric!(counter("caches.file.hit") += 1, "cache" => IMAGES_CACHE);

                let image = Arc::new(image);
                self.memory.put(key.clone(), Arc::clone(&image), image.cost());
                Some(image)
            }
            Err(err) => {
                tracing::warn!(
                    error = &err as &dyn std::error::Error,
                    key = %key,
                    "Removing undecodable cache file"
                );
                disk.remove(key).await;
                None
            }
        }
    }

    async fn download(&self, url: &Url) -> CacheContents<Image> {
        match &self.retry {
            Some(retry) => execute_with_retry(retry, || self.fetcher.fetch(url)).await,
            None => self.fetcher.fetch(url).await,
        }
    }

    /// Drops all decoded images held in memory.
    ///
    /// The disk cache is left untouched, so images are reloaded from there.
    pub fn handle_memory_pressure(&self) {
        tracing::info!(
            count = self.memory.len(),
            cost = self.memory.total_cost(),
            "Memory pressure, clearing in-memory image cache"
        );
        self.memory.clear();
    }
}

/// Clears the in-memory layer of `cache` whenever `source` reports memory pressure.
///
/// The subscription does not keep the cache alive.
pub fn register_memory_pressure(cache: &Arc<ImageCache>, source: &dyn MemoryPressureSource) {
    let cache: Weak<ImageCache> = Arc::downgrade(cache);
    source.subscribe(Box::new(move || {
        if let Some(cache) = cache.upgrade() {
            cache.handle_memory_pressure();
        }
    }));
}
