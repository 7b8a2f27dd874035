//! HTTP plumbing shared by the crawl engine: client construction with a
//! per-source connect timeout and a cancellable GET-with-retry.

use std::collections::HashMap;
use std::time::Duration;

use reqwest::Client;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::warn;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("fetch cancelled")]
    Cancelled,
    #[error("fetch {url} failed after {attempts} attempts: {last}")]
    Exhausted {
        url: String,
        attempts: u32,
        last: String,
    },
}

/// Fixed-interval retry discipline used for listing and meta pages.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl RetryPolicy {
    pub fn new(interval_secs: u64, max_attempts: u32) -> Self {
        Self {
            interval: Duration::from_secs(interval_secs),
            // A zero cap would mean "never even try".
            max_attempts: max_attempts.max(1),
        }
    }
}

/// Client with the source's connect timeout. Total request time is bounded
/// by the remote, not by us; slow bodies are fine, dead peers are not.
pub fn build_client(connect_timeout_secs: u64) -> reqwest::Result<Client> {
    Client::builder()
        .connect_timeout(Duration::from_secs(connect_timeout_secs.max(1)))
        .build()
}

/// GET `url` with the configured headers, retrying transport errors and
/// non-200 statuses on a fixed interval. The stop token is honored before
/// the request and during every retry sleep.
pub async fn get_text_with_retry(
    client: &Client,
    url: &str,
    headers: &HashMap<String, String>,
    policy: RetryPolicy,
    stop: &CancellationToken,
) -> Result<String, FetchError> {
    let mut last = String::from("no attempt made");
    for attempt in 0..policy.max_attempts {
        if stop.is_cancelled() {
            return Err(FetchError::Cancelled);
        }
        let mut request = client.get(url);
        for (key, value) in headers {
            request = request.header(key, value);
        }
        match request.send().await {
            Ok(response) if response.status().as_u16() == 200 => {
                match response.text().await {
                    Ok(body) => return Ok(body),
                    Err(err) => last = format!("read body: {err}"),
                }
            }
            Ok(response) => last = format!("status {}", response.status()),
            Err(err) => last = err.to_string(),
        }
        warn!(url, attempt, error = %last, "request failed");
        tokio::select! {
            _ = stop.cancelled() => return Err(FetchError::Cancelled),
            _ = tokio::time::sleep(policy.interval) => {}
        }
    }
    Err(FetchError::Exhausted {
        url: url.to_string(),
        attempts: policy.max_attempts,
        last,
    })
}
