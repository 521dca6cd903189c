//! Downloading of images under a global concurrency limit.
//!
//! Where the bytes of an image come from is abstracted by the [`ImageSource`] trait, with
//! [`HttpImageSource`] being the implementation used in production. The [`BoundedFetcher`]
//! wraps a source, limits how many downloads are in flight at once, enforces the overall
//! download timeout and decodes the result into an [`Image`].

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use bytes::Bytes;
use futures::future::BoxFuture;
use image::DynamicImage;
use tokio::sync::Semaphore;
use url::Url;

use crate::caching::{CacheContents, CacheError};
use crate::config::DownloadConfig;
use crate::utils::defer::defer;
use crate::utils::http::DownloadTimeouts;

mod http;

pub use http::HttpImageSource;

/// The user agent sent along with every image request.
pub const USER_AGENT: &str = concat!("qrcache/", env!("CARGO_PKG_VERSION"));

impl From<reqwest::Error> for CacheError {
    fn from(error: reqwest::Error) -> Self {
        Self::download_error(&error)
    }
}

/// Something that produces the encoded bytes of an image, given its URL.
pub trait ImageSource: fmt::Debug + Send + Sync {
    /// Fetches the raw, still encoded image behind `url`.
    fn fetch<'a>(&'a self, url: &'a Url) -> BoxFuture<'a, CacheContents<Bytes>>;
}

/// A decoded image, together with the bytes it was decoded from.
#[derive(Clone)]
pub struct Image {
    data: Bytes,
    image: DynamicImage,
}

impl fmt::Debug for Image {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Image")
            .field("width", &self.width())
            .field("height", &self.height())
            .field("data_len", &self.data.len())
            .finish()
    }
}

impl Image {
    /// Decodes `data`, guessing the image format from its contents.
    pub fn decode(data: Bytes) -> CacheContents<Self> {
        let image = image::load_from_memory(&data)
            .map_err(|err| CacheError::Malformed(err.to_string()))?;
        Ok(Self { data, image })
    }

    /// Like [`Image::decode`], but runs on the blocking thread pool.
    pub async fn decode_blocking(data: Bytes) -> CacheContents<Self> {
        tokio::task::spawn_blocking(move || Self::decode(data))
            .await
            .unwrap_or_else(|e| Err(CacheError::from_std_error(e)))
    }

    /// The encoded bytes, as they are persisted in the disk cache.
    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn image(&self) -> &DynamicImage {
        &self.image
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    /// The memory held by this image, counting both its decoded pixels and encoded bytes.
    pub fn cost(&self) -> u64 {
        self.image.as_bytes().len() as u64 + self.data.len() as u64
    }
}

/// Counters about the downloads of a [`BoundedFetcher`].
#[derive(Debug, Default)]
pub struct FetcherStats {
    completed: AtomicU64,
    failed: AtomicU64,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl FetcherStats {
    /// Number of downloads that produced an image.
    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    /// Number of downloads that ended with an error.
    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    /// Number of downloads currently holding a slot.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// The highest number of downloads that were in flight at the same time.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

/// Downloads images through an [`ImageSource`], with at most a fixed number in flight.
///
/// Requests beyond the limit wait for a free slot and are admitted in arrival order. A slot is
/// given back as soon as the download finishes, fails, times out or is dropped.
#[derive(Debug, Clone)]
pub struct BoundedFetcher {
    source: Arc<dyn ImageSource>,
    permits: Arc<Semaphore>,
    max_concurrent: usize,
    timeouts: DownloadTimeouts,
    stats: Arc<FetcherStats>,
}

impl BoundedFetcher {
    pub fn new(
        source: Arc<dyn ImageSource>,
        max_concurrent: usize,
        timeouts: DownloadTimeouts,
    ) -> Self {
        let max_concurrent = max_concurrent.max(1);
        Self {
            source,
            permits: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
            timeouts,
            stats: Default::default(),
        }
    }

    pub fn from_config(source: Arc<dyn ImageSource>, config: &DownloadConfig) -> Self {
        Self::new(
            source,
            config.max_concurrent_downloads,
            DownloadTimeouts::from_config(config),
        )
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    pub fn stats(&self) -> &FetcherStats {
        &self.stats
    }

    /// Downloads and decodes the image behind `url`.
    ///
    /// A download exceeding the configured maximum duration fails with
    /// [`CacheError::Timeout`]. Bytes that do not decode fail with [`CacheError::Malformed`].
    pub async fn fetch(&self, url: &Url) -> CacheContents<Image> {
        let result = match self.download(url).await {
            Ok(data) => Image::decode_blocking(data).await,
            Err(err) => Err(err),
        };

        match &result {
            Ok(_) => self.stats.completed.fetch_add(1, Ordering::Relaxed),
            Err(_) => self.stats.failed.fetch_add(1, Ordering::Relaxed),
        };
        if let Err(err) = &result {
            tracing::debug!(
                error = err as &dyn std::error::Error,
                url = %url,
                "failed to download image"
            );
            metric!(counter("download.failed") += 1, "reason" => err.kind());
        }

        result
    }

    async fn download(&self, url: &Url) -> CacheContents<Bytes> {
        // The semaphore is never closed.
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| CacheError::InternalError)?;

        let stats = &self.stats;
        let in_flight = stats.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        stats.max_in_flight.fetch_max(in_flight, Ordering::SeqCst);
        metric!(gauge("download.inflight") = in_flight as u64);
        let _in_flight = defer(|| {
            stats.in_flight.fetch_sub(1, Ordering::SeqCst);
        });

        tracing::trace!(url = %url, in_flight, "Downloading image");
        let timeout = self.timeouts.max_download;
        let start = std::time::Instant::now();

        let result = tokio::time::timeout(timeout, self.source.fetch(url))
            .await
            .unwrap_or(Err(CacheError::Timeout(timeout)));

        metric!(timer("download.duration") = start.elapsed());
        if let Ok(data) = &result {
            metric!(time_raw("download.size") = data.len() as u64);
        }

        result
    }
}
