use std::time::Duration;

use reqwest::header::{HeaderMap, CONTENT_LENGTH, CONTENT_TYPE};
use reqwest::{Client, StatusCode};
use url::Url;

use crate::error::{AppError, Result};
use crate::models::Metadata;

const DEFAULT_MIME_TYPE: &str = "application/octet-stream";

/// Learn MIME type and size of `url` without downloading it.
///
/// Transport errors and 5xx responses are retried `retries` times with a
/// constant `backoff`. A missing content length is reported as size `-1`.
pub async fn fetch_metadata(
    client: &Client,
    url: &Url,
    retries: u32,
    backoff: Duration,
) -> Result<Metadata> {
    let mut attempt = 0;
    loop {
        match probe(client, url).await {
            Ok(metadata) => return Ok(metadata),
            Err(e) if attempt < retries && is_retryable(&e) => {
                attempt += 1;
                tracing::debug!(url = %url, attempt, "Metadata probe failed, retrying: {}", e);
                tokio::time::sleep(backoff).await;
            }
            Err(e) => return Err(e),
        }
    }
}

async fn probe(client: &Client, url: &Url) -> Result<Metadata> {
    let response = client.head(url.clone()).send().await?;

    // some hosts refuse HEAD; the headers of a GET are just as good
    let response = if response.status() == StatusCode::METHOD_NOT_ALLOWED {
        client.get(url.clone()).send().await?
    } else {
        response
    };

    if !response.status().is_success() {
        return Err(AppError::status(response.status(), url.as_str()));
    }

    Ok(metadata_from_headers(response.headers()))
}

pub fn metadata_from_headers(headers: &HeaderMap) -> Metadata {
    let mime_type = headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(';').next())
        .map(|v| v.trim().to_ascii_lowercase())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| DEFAULT_MIME_TYPE.to_string());

    // read the header itself: for HEAD responses the body length is always zero
    let size = headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<i64>().ok())
        .unwrap_or(-1);

    Metadata { mime_type, size }
}

fn is_retryable(err: &AppError) -> bool {
    match err {
        AppError::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
        AppError::HttpStatus { status, .. } => *status >= 500,
        _ => false,
    }
}
