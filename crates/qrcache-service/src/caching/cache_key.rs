use std::fmt::{self, Write};
use std::sync::Arc;

use sha2::{Digest, Sha256};
use url::Url;

/// File extension of cache files written by the [`DiskStore`](super::DiskStore).
pub const CACHE_FILE_EXTENSION: &str = "img";

/// Identifies one cached image.
///
/// The key is the SHA-256 digest of the image's absolute URL. Equality and hashing only consider
/// the digest, the URL is kept around for logging.
#[derive(Debug, Clone, Eq)]
pub struct CacheKey {
    url: Arc<str>,
    hash: [u8; 32],
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.url)
    }
}

impl PartialEq for CacheKey {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
    }
}

impl std::hash::Hash for CacheKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.hash.hash(state);
    }
}

impl From<&Url> for CacheKey {
    fn from(url: &Url) -> Self {
        Self::from_url(url)
    }
}

impl CacheKey {
    /// Creates the [`CacheKey`] for the given [`Url`].
    pub fn from_url(url: &Url) -> Self {
        Self::from_locator(url.as_str())
    }

    /// Creates the [`CacheKey`] for an arbitrary resource locator.
    ///
    /// **NOTE**: The locator has to be stable, as it would otherwise lead to bad cache reuse.
    pub fn from_locator(locator: &str) -> Self {
        let hash = Sha256::digest(locator.as_bytes());
        let hash = <[u8; 32]>::from(hash);

        CacheKey {
            url: locator.into(),
            hash,
        }
    }

    /// Returns the resource locator this key was created from.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Returns the lowercase hex-formatted digest.
    pub fn hex(&self) -> String {
        let mut hex = String::with_capacity(64);
        for b in &self.hash {
            // Writing into a `String` is infallible.
            let _ = write!(hex, "{b:02x}");
        }
        hex
    }

    /// Returns the file name used for this key inside a cache directory.
    ///
    /// The file name is the hex digest followed by [`CACHE_FILE_EXTENSION`], which makes it
    /// filesystem-safe regardless of the characters in the URL.
    pub fn file_name(&self) -> String {
        format!("{}.{CACHE_FILE_EXTENSION}", self.hex())
    }
}
