//! HTTP remote cache backend
//!
//! Entries live at `{url}/{key}` where `key` is the lowercase hex form.
//! `HEAD` probes, `GET` downloads and `PUT` uploads. A `404` is a miss.

use async_trait::async_trait;
use buildcache::{CacheKey, Error, RemoteCacheService, RemoteConfig, RemoteError, RemoteResult};
use bytes::Bytes;
use reqwest::{Client, RequestBuilder, StatusCode};
use std::time::Duration;
use tracing::debug;

/// Remote cache spoken to over plain HTTP
#[derive(Debug, Clone)]
pub struct HttpRemote {
    client: Client,
    base_url: String,
    token: Option<String>,
    timeout: Duration,
}

impl HttpRemote {
    /// Build a client for `base_url` whose requests give up after `timeout`
    pub fn new(
        base_url: impl Into<String>,
        token: Option<String>,
        timeout: Duration,
    ) -> buildcache::Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("buildcache/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .map_err(|e| Error::configuration(format!("Failed to create HTTP client: {e}")))?;
        let base_url = base_url.into().trim_end_matches('/').to_string();
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(Error::configuration(format!(
                "remote url must be http(s), got '{base_url}'"
            )));
        }
        Ok(Self {
            client,
            base_url,
            token,
            timeout,
        })
    }

    /// Build a client from remote configuration
    pub fn from_config(config: &RemoteConfig) -> buildcache::Result<Self> {
        let url = config
            .url
            .as_deref()
            .ok_or_else(|| Error::configuration("http remote requires a url"))?;
        Self::new(url, config.token.clone(), config.timeout())
    }

    /// Base URL entries are resolved against
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn entry_url(&self, key: &CacheKey) -> String {
        format!("{}/{}", self.base_url, key.to_hex())
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    fn transport_error(&self, operation: &str, error: &reqwest::Error) -> RemoteError {
        if error.is_timeout() {
            RemoteError::timeout(operation, self.timeout.as_secs())
        } else if error.is_body() || error.is_decode() {
            RemoteError::protocol(format!("{operation}: {error}"))
        } else {
            RemoteError::connection(&self.base_url, error.to_string())
        }
    }
}

#[async_trait]
impl RemoteCacheService for HttpRemote {
    fn name(&self) -> &str {
        "http"
    }

    async fn contains(&self, key: &CacheKey) -> RemoteResult<bool> {
        let response = self
            .authorize(self.client.head(self.entry_url(key)))
            .send()
            .await
            .map_err(|e| self.transport_error("contains", &e))?;
        match response.status() {
            status if status.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            status => Err(RemoteError::status("contains", status.as_u16())),
        }
    }

    async fn load(&self, key: &CacheKey) -> RemoteResult<Option<Bytes>> {
        let url = self.entry_url(key);
        debug!(%url, "Downloading build cache entry");
        let response = self
            .authorize(self.client.get(&url))
            .send()
            .await
            .map_err(|e| self.transport_error("load", &e))?;
        match response.status() {
            status if status.is_success() => {
                let body = response
                    .bytes()
                    .await
                    .map_err(|e| self.transport_error("load", &e))?;
                Ok(Some(body))
            }
            StatusCode::NOT_FOUND => Ok(None),
            status => Err(RemoteError::status("load", status.as_u16())),
        }
    }

    async fn store(&self, key: &CacheKey, data: Bytes) -> RemoteResult<()> {
        let url = self.entry_url(key);
        debug!(%url, size = data.len(), "Uploading build cache entry");
        let response = self
            .authorize(self.client.put(&url).body(data))
            .send()
            .await
            .map_err(|e| self.transport_error("store", &e))?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(RemoteError::status("store", status.as_u16()))
        }
    }
}
