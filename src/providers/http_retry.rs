//! Shared HTTP retry wrapper with 429/5xx handling and Retry-After support.
//!
//! `send_with_retry()` replaces `request.send()` in the Drive and Graph adapters:
//! - exponential backoff with jitter on 429 and 5xx responses
//! - numeric `Retry-After` honored (capped at 5 minutes)
//! - non-retryable statuses are returned untouched for the caller to map

use reqwest::{Client, Request, Response};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use super::ProviderError;

/// Configuration for HTTP retry behavior
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HttpRetryConfig {
    /// Maximum number of retry attempts (default: 3)
    pub max_retries: u32,
    /// Base delay in milliseconds for exponential backoff (default: 1000)
    pub base_delay_ms: u64,
    /// Maximum delay cap in milliseconds (default: 30000)
    pub max_delay_ms: u64,
    /// Backoff multiplier (default: 2.0)
    pub backoff_multiplier: f64,
}

impl Default for HttpRetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
            backoff_multiplier: 2.0,
        }
    }
}

impl HttpRetryConfig {
    /// No retries at all
    pub fn disabled() -> Self {
        Self { max_retries: 0, ..Self::default() }
    }
}

fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}

/// Numeric Retry-After only; HTTP-date values fall back to backoff
fn parse_retry_after(response: &Response) -> Option<Duration> {
    let value = response.headers().get(reqwest::header::RETRY_AFTER)?.to_str().ok()?;
    let secs = value.trim().parse::<u64>().ok()?;
    Some(Duration::from_secs(secs.min(300)))
}

fn calculate_delay(attempt: u32, config: &HttpRetryConfig) -> Duration {
    let base = config.base_delay_ms as f64 * config.backoff_multiplier.powi(attempt as i32);
    let capped = base.min(config.max_delay_ms as f64);
    // 10-30% jitter
    let jitter = capped * (0.1 + rand::random::<f64>() * 0.2);
    Duration::from_millis((capped + jitter) as u64)
}

/// Send a request, retrying transient failures.
///
/// The body must be in-memory bytes (or absent) so it can be replayed.
pub async fn send_with_retry(
    client: &Client,
    request: Request,
    config: &HttpRetryConfig,
) -> Result<Response, ProviderError> {
    let method = request.method().clone();
    let url = request.url().clone();
    let headers = request.headers().clone();
    let body_bytes = request.body()
        .and_then(|b| b.as_bytes())
        .map(|b| b.to_vec());

    let mut last_response = client.execute(request).await
        .map_err(|e| ProviderError::NetworkError(e.to_string()))?;

    for attempt in 0..config.max_retries {
        if !is_retryable_status(last_response.status().as_u16()) {
            return Ok(last_response);
        }

        let delay = parse_retry_after(&last_response)
            .unwrap_or_else(|| calculate_delay(attempt, config));

        debug!(
            "HTTP {} {} returned {}. Retry {}/{} after {:?}",
            method, url.path(), last_response.status(), attempt + 1, config.max_retries, delay
        );

        tokio::time::sleep(delay).await;

        let mut retry_req = client.request(method.clone(), url.clone()).headers(headers.clone());
        if let Some(ref body) = body_bytes {
            retry_req = retry_req.body(body.clone());
        }

        last_response = retry_req.send().await
            .map_err(|e| ProviderError::NetworkError(e.to_string()))?;
    }

    Ok(last_response)
}
