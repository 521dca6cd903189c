use std::error::Error;
use std::time::Duration;

use thiserror::Error;

use crate::retry::Retryable;

/// An error that happens when loading an image from a remote location.
///
/// Variants are split into two classes: transient network conditions, which are worth retrying,
/// and problems with the request or the payload itself, which will not go away on their own.
/// See [`CacheError::is_retryable`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    /// The image was not found at the remote location.
    #[error("not found")]
    NotFound,
    /// The image could not be fetched due to missing permissions.
    ///
    /// The attached string contains the remote's response.
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    /// The image could not be fetched due to a timeout.
    #[error("download timed out after {0:?}")]
    Timeout(Duration),
    /// The image could not be fetched due to another problem, like connection loss,
    /// DNS resolution, or a 5xx server response.
    #[error("download failed: {0}")]
    DownloadError(String),
    /// The remote asked us to slow down.
    #[error("rate limited")]
    RateLimited,
    /// The remote, or the whole retry budget, is exhausted.
    #[error("service unavailable")]
    ServiceUnavailable,
    /// The payload was fetched successfully, but is not a valid image.
    #[error("malformed: {0}")]
    Malformed(String),
    /// An unexpected error in the cache itself.
    #[error("internal error")]
    InternalError,
}

impl CacheError {
    /// Whether retrying the same request has a chance of producing a different result.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout(_) | Self::DownloadError(_) | Self::RateLimited | Self::ServiceUnavailable
        )
    }

    /// A short, stable name of the variant, used as a metrics tag.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound => "notfound",
            Self::PermissionDenied(_) => "permissiondenied",
            Self::Timeout(_) => "timeout",
            Self::DownloadError(_) => "downloaderror",
            Self::RateLimited => "ratelimited",
            Self::ServiceUnavailable => "unavailable",
            Self::Malformed(_) => "malformed",
            Self::InternalError => "internalerror",
        }
    }

    /// Creates a [`DownloadError`](Self::DownloadError) from the root cause of `error`.
    pub(crate) fn download_error(mut error: &dyn Error) -> Self {
        while let Some(src) = error.source() {
            error = src;
        }

        let mut error_string = error.to_string();

        // Special-case a few error strings
        if error_string.contains("certificate verify failed") {
            error_string = "certificate verify failed".to_string();
        }

        if error_string.contains("SSL routines") {
            error_string = "SSL error".to_string();
        }

        Self::DownloadError(error_string)
    }

    #[track_caller]
    pub fn from_std_error<E: Error + 'static>(e: E) -> Self {
        let dynerr: &dyn Error = &e; // tracing expects a `&dyn Error`
        tracing::error!(error = dynerr);
        Self::InternalError
    }
}

impl Retryable for CacheError {
    fn is_retryable(&self) -> bool {
        CacheError::is_retryable(self)
    }

    fn exhausted() -> Self {
        Self::ServiceUnavailable
    }
}

impl From<std::io::Error> for CacheError {
    #[track_caller]
    fn from(err: std::io::Error) -> Self {
        Self::from_std_error(err)
    }
}

/// The result of loading an image, or the reason why it could not be loaded.
pub type CacheContents<T = ()> = Result<T, CacheError>;
