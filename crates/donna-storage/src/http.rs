//! Feed poll HTTP: conditional GET with bounded retries on transient failures.

use std::time::Duration;

use anyhow::Context;
use donna_core::FeedMetadata;
use reqwest::header::{HeaderMap, HeaderName, ETAG, IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED};
use reqwest::{Response, StatusCode};
use thiserror::Error;
use tracing::{debug, info_span, Instrument};

/// How many times a feed poll is retried and how long it waits in between.
/// The wait doubles per retry up to `max_wait`.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub retries: usize,
    pub first_wait: Duration,
    pub max_wait: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 2,
            first_wait: Duration::from_millis(500),
            max_wait: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Wait before retry number `retry` (zero-based), or `None` once retries are spent.
    pub fn wait_before(&self, retry: usize) -> Option<Duration> {
        if retry >= self.retries {
            return None;
        }
        let doubled = (0..retry).fold(self.first_wait, |wait, _| wait.saturating_mul(2));
        Some(doubled.min(self.max_wait))
    }
}

/// Feed hosts that are overloaded or rate limiting deserve another try; anything
/// else in the 4xx range will not improve by asking again.
fn worth_retrying_status(status: StatusCode) -> bool {
    status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
}

fn worth_retrying_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect()
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub retry: RetryPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            user_agent: None,
            retry: RetryPolicy::default(),
        }
    }
}

/// A feed document, or an empty body when the server answered `304`.
#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

impl FetchedResponse {
    pub fn is_not_modified(&self) -> bool {
        self.status == StatusCode::NOT_MODIFIED
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("feed answered {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    retry: RetryPolicy,
}

fn header_string(headers: &HeaderMap, name: HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(ToString::to_string)
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().context("building feed http client")?;
        Ok(Self {
            client,
            retry: config.retry,
        })
    }

    /// GET `url`, retrying transient failures. When `validators` carry an ETag or
    /// Last-Modified value the request is conditional and a `304` is returned as
    /// a successful, empty [`FetchedResponse`].
    pub async fn fetch(
        &self,
        url: &str,
        validators: Option<&FeedMetadata>,
    ) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", url);
        self.poll(url, validators).instrument(span).await
    }

    async fn poll(
        &self,
        url: &str,
        validators: Option<&FeedMetadata>,
    ) -> Result<FetchedResponse, FetchError> {
        let mut retry = 0;
        loop {
            let failure = match self.conditional_get(url, validators).await {
                Ok(resp) if resp.status().is_success() || resp.status() == StatusCode::NOT_MODIFIED => {
                    return read_feed(resp).await;
                }
                Ok(resp) => {
                    let status = resp.status();
                    let failure = FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: resp.url().to_string(),
                    };
                    if !worth_retrying_status(status) {
                        return Err(failure);
                    }
                    failure
                }
                Err(err) if worth_retrying_error(&err) => FetchError::Request(err),
                Err(err) => return Err(FetchError::Request(err)),
            };

            let Some(wait) = self.retry.wait_before(retry) else {
                return Err(failure);
            };
            debug!(error = %failure, retry, ?wait, "feed poll failed; retrying");
            tokio::time::sleep(wait).await;
            retry += 1;
        }
    }

    async fn conditional_get(
        &self,
        url: &str,
        validators: Option<&FeedMetadata>,
    ) -> Result<Response, reqwest::Error> {
        let mut request = self.client.get(url);
        if let Some(meta) = validators {
            if let Some(etag) = &meta.etag {
                request = request.header(IF_NONE_MATCH, etag.as_str());
            }
            if let Some(last_modified) = &meta.last_modified {
                request = request.header(IF_MODIFIED_SINCE, last_modified.as_str());
            }
        }
        request.send().await
    }
}

async fn read_feed(resp: Response) -> Result<FetchedResponse, FetchError> {
    let status = resp.status();
    let final_url = resp.url().to_string();
    let etag = header_string(resp.headers(), ETAG);
    let last_modified = header_string(resp.headers(), LAST_MODIFIED);
    let body = if status == StatusCode::NOT_MODIFIED {
        debug!(%final_url, "not modified");
        Vec::new()
    } else {
        resp.bytes().await?.to_vec()
    };
    Ok(FetchedResponse {
        status,
        final_url,
        body,
        etag,
        last_modified,
    })
}
