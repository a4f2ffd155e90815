//! Support to mirror objects from HTTP servers.

use futures::future::BoxFuture;
use futures::{FutureExt, TryStreamExt};
use reqwest::{header, Client, Response, Url};

use crate::caching::{CacheEntry, CacheError};

use super::{ByteStream, ObjectStore, RemoteMetadata};

/// HTTP User-Agent string to use.
const USER_AGENT: &str = concat!("blobmirror/", env!("CARGO_PKG_VERSION"));

/// Store backend that reads objects from an HTTP(S) server.
#[derive(Debug, Clone)]
pub struct HttpStore {
    client: Client,
    base_url: Url,
}

impl HttpStore {
    /// Creates a store rooted at `base_url`.
    pub fn new(mut base_url: Url) -> anyhow::Result<Self> {
        // `Url::join` drops the last path segment unless the base ends in `/`.
        if !base_url.path().ends_with('/') {
            base_url.set_path(&format!("{}/", base_url.path()));
        }

        let client = Client::builder().user_agent(USER_AGENT).build()?;
        Ok(Self { client, base_url })
    }

    fn url_for(&self, key: &str) -> CacheEntry<Url> {
        // A key the URL grammar rejects cannot exist on the remote either.
        self.base_url.join(key).map_err(|_| CacheError::NotFound)
    }

    fn check_status(response: Response, url: &Url) -> CacheEntry<Response> {
        let status = response.status();
        if status.is_success() {
            Ok(response)
        } else if status.is_client_error() {
            tracing::debug!("Remote returned {} for `{}`", status, url);
            Err(CacheError::NotFound)
        } else {
            Err(CacheError::DownloadError(status.to_string()))
        }
    }
}

impl ObjectStore for HttpStore {
    fn stat<'a>(&'a self, key: &'a str) -> BoxFuture<'a, CacheEntry<RemoteMetadata>> {
        async move {
            let url = self.url_for(key)?;
            tracing::debug!("Probing `{}`", url);

            let response = self.client.head(url.clone()).send().await?;
            let response = Self::check_status(response, &url)?;

            let length = response
                .headers()
                .get(header::CONTENT_LENGTH)
                .and_then(|hv| hv.to_str().ok())
                .and_then(|s| s.parse::<u64>().ok());
            let last_modified = response
                .headers()
                .get(header::LAST_MODIFIED)
                .and_then(|hv| hv.to_str().ok())
                .and_then(|s| httpdate::parse_http_date(s).ok());

            Ok(RemoteMetadata {
                length,
                last_modified,
            })
        }
        .boxed()
    }

    fn open<'a>(&'a self, key: &'a str) -> BoxFuture<'a, CacheEntry<ByteStream>> {
        async move {
            let url = self.url_for(key)?;
            tracing::debug!("Fetching `{}`", url);

            let response = self.client.get(url.clone()).send().await?;
            let response = Self::check_status(response, &url)?;

            let stream: ByteStream = Box::pin(response.bytes_stream().map_err(CacheError::from));
            Ok(stream)
        }
        .boxed()
    }
}
