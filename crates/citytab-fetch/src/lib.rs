//! Page fetching for citytab: live HTTP pages and saved fixture pages.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::StatusCode;
use thiserror::Error;
use tracing::{debug, info_span, Instrument};
use url::Url;

pub const CRATE_NAME: &str = "citytab-fetch";

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed for {url}: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("no fixture page for {url} (looked for {})", .path.display())]
    FixtureMissing { url: String, path: PathBuf },
    #[error("reading fixture {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Source of raw page markup.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, url: &Url) -> Result<String, FetchError>;
}

/// Only a plain 200 counts as a fetched page; redirects are followed by the client.
pub fn is_fetch_success(status: StatusCode) -> bool {
    status == StatusCode::OK
}

#[derive(Debug, Clone, Default)]
pub struct HttpClientConfig {
    /// `None` keeps the transport default.
    pub timeout: Option<Duration>,
    pub user_agent: Option<String>,
}

#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder().gzip(true).brotli(true);

        if let Some(timeout) = config.timeout {
            builder = builder.timeout(timeout);
        }
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, url: &Url) -> Result<String, FetchError> {
        let span = info_span!("http_fetch", %url);
        async move {
            let resp = self
                .client
                .get(url.clone())
                .send()
                .await
                .map_err(|source| FetchError::Request {
                    url: url.to_string(),
                    source,
                })?;

            let status = resp.status();
            if !is_fetch_success(status) {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: resp.url().to_string(),
                });
            }

            let body = resp.text().await.map_err(|source| FetchError::Request {
                url: url.to_string(),
                source,
            })?;
            debug!(bytes = body.len(), "fetched page");
            Ok(body)
        }
        .instrument(span)
        .await
    }
}

/// Serves pages saved on disk, one `<last path segment>.html` file per URL.
#[derive(Debug, Clone)]
pub struct FixtureFetcher {
    root: PathBuf,
}

impl FixtureFetcher {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn fixture_path(&self, url: &Url) -> PathBuf {
        let name = url
            .path_segments()
            .and_then(|segments| segments.filter(|s| !s.is_empty()).last())
            .unwrap_or("index");
        self.root.join(format!("{name}.html"))
    }
}

#[async_trait]
impl Fetcher for FixtureFetcher {
    async fn fetch(&self, url: &Url) -> Result<String, FetchError> {
        let path = self.fixture_path(url);
        match tokio::fs::read_to_string(&path).await {
            Ok(body) => {
                debug!(path = %path.display(), "served fixture page");
                Ok(body)
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(FetchError::FixtureMissing {
                    url: url.to_string(),
                    path,
                })
            }
            Err(source) => Err(FetchError::Io { path, source }),
        }
    }
}
