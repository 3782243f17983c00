//! HTTP feed fetching plus the blob-store and spreadsheet clients maskfeed publishes through.

use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{info, info_span, Instrument};
use url::Url;

pub mod auth;
pub mod blob;
pub mod sheets;

pub use auth::{AuthError, MetadataServerToken, StaticToken, TokenProvider};
pub use blob::{BlobObject, BlobStore, ChecksumMode, GcsBlobStore, LocalBlobStore, StoredBlob};
pub use sheets::{
    BatchUpdateValuesRequest, BatchUpdateValuesResponse, MajorDimension, SheetsApi, SheetsClient,
    ValueInputOption, ValueRange,
};

pub const CRATE_NAME: &str = "maskfeed-storage";

/// Query parameter appended to every feed request to defeat intermediary caches.
pub const CACHE_BUST_PARAM: &str = "cachebust";

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("invalid feed url {url}: {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("response body from {url} is not valid UTF-8")]
    Decode {
        url: String,
        #[source]
        source: std::string::FromUtf8Error,
    },
}

/// Failure writing to (or reading the layout of) a publish destination.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("authentication failed: {0}")]
    Auth(#[from] AuthError),
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("{service} returned http {status}: {body}")]
    HttpStatus {
        service: &'static str,
        status: u16,
        body: String,
    },
    #[error("decoding {service} response: {source}")]
    Decode {
        service: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
    #[error("destination layout: {0}")]
    Layout(String),
}

/// Anything that can hand back the text of a CSV feed.
#[async_trait]
pub trait CsvSource: Send + Sync {
    async fn fetch_csv(&self, feed_id: &str, url: &str) -> Result<String, FetchError>;
}

/// Appends `cachebust=<epoch millis>` to `url`, replacing an earlier value.
pub fn cache_busted_url(url: &str, now: DateTime<Utc>) -> Result<Url, FetchError> {
    let mut parsed = Url::parse(url).map_err(|source| FetchError::InvalidUrl {
        url: url.to_string(),
        source,
    })?;
    let kept: Vec<(String, String)> = parsed
        .query_pairs()
        .filter(|(k, _)| k != CACHE_BUST_PARAM)
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    parsed
        .query_pairs_mut()
        .clear()
        .extend_pairs(kept)
        .append_pair(CACHE_BUST_PARAM, &now.timestamp_millis().to_string());
    Ok(parsed)
}

#[derive(Debug, Clone, Default)]
pub struct HttpClientConfig {
    /// `None` leaves the request unbounded; the caller's scheduler caps run time.
    pub timeout: Option<Duration>,
    pub user_agent: Option<String>,
}

/// Plain GET fetcher. A failed request is returned to the caller as-is; the
/// next scheduled run is the retry.
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

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    pub async fn fetch_bytes(&self, url: &Url) -> Result<Vec<u8>, FetchError> {
        let resp = self.client.get(url.clone()).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: resp.url().to_string(),
            });
        }
        Ok(resp.bytes().await?.to_vec())
    }
}

#[async_trait]
impl CsvSource for HttpFetcher {
    async fn fetch_csv(&self, feed_id: &str, url: &str) -> Result<String, FetchError> {
        let started = Instant::now();
        let busted = cache_busted_url(url, Utc::now())?;
        let span = info_span!("http_fetch", feed_id, url);

        async move {
            let body = self.fetch_bytes(&busted).await?;
            let bytes = body.len();
            let text = String::from_utf8(body).map_err(|source| FetchError::Decode {
                url: url.to_string(),
                source,
            })?;
            info!(
                bytes,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "feed fetched"
            );
            Ok::<_, FetchError>(text)
        }
        .instrument(span)
        .await
    }
}
