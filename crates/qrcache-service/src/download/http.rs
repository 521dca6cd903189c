//! Support to download images from HTTP servers.

use bytes::{Bytes, BytesMut};
use futures::future::BoxFuture;
use futures::{FutureExt, TryStreamExt};
use reqwest::{Client, StatusCode, header};
use url::Url;

use crate::caching::{CacheContents, CacheError};
use crate::utils::http::{DownloadTimeouts, create_client};

use super::{ImageSource, USER_AGENT};

/// Upper bound for the buffer reserved up front based on the `Content-Length` of a response.
const MAX_PREALLOCATION: u64 = 8 * 1024 * 1024;

/// [`ImageSource`] that downloads images with a plain `GET` request.
#[derive(Debug, Clone)]
pub struct HttpImageSource {
    client: Client,
    timeouts: DownloadTimeouts,
}

impl HttpImageSource {
    pub fn new(client: Client, timeouts: DownloadTimeouts) -> Self {
        Self { client, timeouts }
    }

    /// Creates a source with a fresh client configured for `timeouts`.
    pub fn with_timeouts(timeouts: DownloadTimeouts) -> reqwest::Result<Self> {
        Ok(Self::new(create_client(&timeouts)?, timeouts))
    }

    async fn download(&self, url: &Url) -> CacheContents<Bytes> {
        tracing::debug!("Fetching image from `{}`", url);

        let request = self
            .client
            .get(url.clone())
            .header(header::USER_AGENT, USER_AGENT)
            .send();

        let response = tokio::time::timeout(self.timeouts.head, request)
            .await
            .map_err(|_| CacheError::Timeout(self.timeouts.head))?
            .map_err(|err| self.request_error(err))?;

        let status = response.status();
        if !status.is_success() {
            return Err(status_error(url, status));
        }

        let mut data = match response.content_length() {
            Some(len) => BytesMut::with_capacity(len.min(MAX_PREALLOCATION) as usize),
            None => BytesMut::new(),
        };
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream
            .try_next()
            .await
            .map_err(|err| self.request_error(err))?
        {
            data.extend_from_slice(&chunk);
        }

        tracing::trace!(url = %url, len = data.len(), "Fetched image");
        Ok(data.freeze())
    }

    fn request_error(&self, err: reqwest::Error) -> CacheError {
        if err.is_timeout() {
            let timeout = match err.is_connect() {
                true => self.timeouts.connect,
                false => self.timeouts.max_download,
            };
            CacheError::Timeout(timeout)
        } else {
            err.into()
        }
    }
}

impl ImageSource for HttpImageSource {
    fn fetch<'a>(&'a self, url: &'a Url) -> BoxFuture<'a, CacheContents<Bytes>> {
        self.download(url).boxed()
    }
}

/// Converts an unsuccessful HTTP status into a [`CacheError`].
fn status_error(url: &Url, status: StatusCode) -> CacheError {
    match status {
        StatusCode::FORBIDDEN | StatusCode::UNAUTHORIZED => {
            tracing::debug!("Insufficient permissions to download `{url}`: {status}");
            CacheError::PermissionDenied(status.to_string())
        }
        StatusCode::TOO_MANY_REQUESTS => {
            tracing::debug!("Rate limited when downloading `{url}`");
            CacheError::RateLimited
        }
        StatusCode::SERVICE_UNAVAILABLE => {
            tracing::debug!("Service unavailable when downloading `{url}`");
            CacheError::ServiceUnavailable
        }
        status if status.is_client_error() => {
            // If it's a client error, chances are it's a 404.
            tracing::debug!("Unexpected client error status code from `{url}`: {status}");
            CacheError::NotFound
        }
        status => {
            tracing::debug!("Unexpected status code from `{url}`: {status}");
            CacheError::DownloadError(status.to_string())
        }
    }
}
