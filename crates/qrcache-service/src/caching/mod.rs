//! # Image Caching infrastructure
//!
//! Rendering screens full of QR codes means loading the same handful of images over and over.
//! To keep that fast and to survive flaky networks, images are cached in two layers in front of
//! the network.
//! This module includes the building blocks of those layers and our central [`CacheError`] type.
//!
//! ## Cache Layers
//!
//! - An in-memory layer, the [`MemoryStore`], holding decoded images bounded by a total byte cost
//!   and an entry count, and evicting the least recently used entries first.
//! - A file-system layer, the [`DiskStore`], persisting the raw downloaded bytes. It is bounded by
//!   a maximum total size, evicting the oldest files first, and by a maximum age after which
//!   entries are considered stale.
//!
//! A cache request, driven by the [`ImageCache`](crate::images::ImageCache), goes through the
//! following steps:
//! - First, it goes through the in-memory layer.
//! - On miss, it will try to load the image from the file-system, if enabled, and promote it
//!   into the in-memory layer.
//! - On miss, it will finally download the image, put it into the in-memory layer and schedule
//!   writing it to the file-system.
//!
//! ### Metrics
//!
//! We collect a couple of metrics, each of those is tagged with a `cache` field:
//!
//! - `caches.access`: All accesses.
//! - `caches.memory.hit`: Accesses served by the in-memory layer.
//! - `caches.file.hit`: Accesses served by the file-system layer.
//! - `caches.computation`: Actual downloads, not served by any of the caching layers.
//! - `caches.file.write`, `caches.file.expired`, `caches.file.evicted` and
//!   `caches.memory.evicted`: Writes and removals of the respective layer.
//!
//! ### Configuration
//!
//! The in-memory layer is always active, with budgets from [`MemoryCacheConfig`].
//!
//! The file-system layer is gated by the [`Config::cache_dir`] option. If no `cache_dir` is
//! configured, every in-memory miss results in a download.
//! Its limits are configured via [`DiskCacheConfig`]. Entries expire 7 days after they were
//! written by default, and the layer is kept under 200 MiB.
//!
//! ## [`CacheKey`]
//!
//! The [`CacheKey`] is used both as the key for the in-memory cache, as well as the file name of
//! the file-system cache. It is the SHA-256 digest of the image URL.
//!
//! ## [`CacheError`]
//!
//! [`CacheError`] encodes why an image could not be loaded. Transient network problems, like
//! [`CacheError::Timeout`], are retryable, while [`CacheError::NotFound`] or
//! [`CacheError::Malformed`] will not change by retrying.
//!
//! Lastly, the [`CacheError::InternalError`] is a catch-all for unexpected errors that might happen.
//! Failures of the file-system layer never surface as errors, they are logged and the affected
//! item is simply treated as not cached.
//!
//! [`Config::cache_dir`]: crate::config::Config::cache_dir
//! [`MemoryCacheConfig`]: crate::config::MemoryCacheConfig
//! [`DiskCacheConfig`]: crate::config::DiskCacheConfig

mod cache_error;
mod cache_key;
mod cleanup;
mod disk;
mod memory;
#[cfg(test)]
mod tests;

pub use cache_error::{CacheContents, CacheError};
pub use cache_key::{CACHE_FILE_EXTENSION, CacheKey};
pub use cleanup::cleanup;
pub use disk::{CleanupStats, DiskStats, DiskStore};
pub use memory::MemoryStore;

/// Name of the image cache, used for its directory and as metrics tag.
pub const IMAGES_CACHE: &str = "images";
