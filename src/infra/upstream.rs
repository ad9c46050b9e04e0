//! HTTP client for the JSON API the gateway fronts.

use std::time::Duration;

use axum::http::{
    HeaderMap, HeaderName, HeaderValue, Method, StatusCode,
    header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE, COOKIE},
};
use bytes::Bytes;
use reqwest::Client;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use super::error::InfraError;

/// Credentials passed through on every upstream request.
const CREDENTIAL_HEADERS: [HeaderName; 2] = [AUTHORIZATION, COOKIE];

/// Extra headers passed through on forwarded writes only. Reads are cached
/// per path and query, so they never negotiate on client headers.
const WRITE_HEADERS: [HeaderName; 2] = [ACCEPT, CONTENT_TYPE];

/// Keep error bodies bounded when they end up in logs.
const ERROR_BODY_LIMIT: usize = 512;

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("upstream request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("upstream answered {status}: {body}")]
    Status { status: StatusCode, body: String },
    #[error("upstream body is not JSON: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Raw upstream reply for forwarded writes.
#[derive(Debug)]
pub struct UpstreamResponse {
    pub status: StatusCode,
    pub content_type: Option<HeaderValue>,
    pub body: Bytes,
}

#[derive(Debug, Clone)]
pub struct UpstreamClient {
    client: Client,
    base_url: String,
}

impl UpstreamClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, InfraError> {
        let client = Client::builder()
            .user_agent(concat!("hubcache/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .map_err(|err| InfraError::upstream(err.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path_and_query: &str) -> String {
        format!("{}{path_and_query}", self.base_url)
    }

    /// `GET` a JSON document; any non-2xx status is an error.
    pub async fn fetch_json(
        &self,
        path_and_query: &str,
        headers: &HeaderMap,
    ) -> Result<Value, UpstreamError> {
        let request = forward_headers(
            self.client.get(self.url(path_and_query)),
            headers,
            &CREDENTIAL_HEADERS,
        )
        .header(ACCEPT, HeaderValue::from_static("application/json"));
        let response = request.send().await?;
        let status = response.status();
        let body = response.bytes().await?;
        debug!(
            upstream = %self.base_url,
            path = path_and_query,
            status = status.as_u16(),
            "Upstream read completed"
        );

        if !status.is_success() {
            return Err(UpstreamError::Status {
                status,
                body: truncate(&body),
            });
        }
        Ok(serde_json::from_slice(&body)?)
    }

    /// Forward a request as-is and hand back whatever the upstream answered.
    pub async fn forward(
        &self,
        method: Method,
        path_and_query: &str,
        headers: &HeaderMap,
        body: Bytes,
    ) -> Result<UpstreamResponse, UpstreamError> {
        let request = forward_headers(
            self.client.request(method.clone(), self.url(path_and_query)),
            headers,
            &CREDENTIAL_HEADERS,
        );
        let request = forward_headers(request, headers, &WRITE_HEADERS);
        let response = request.body(body).send().await?;
        let status = response.status();
        let content_type = response.headers().get(CONTENT_TYPE).cloned();
        let body = response.bytes().await?;
        debug!(
            upstream = %self.base_url,
            method = %method,
            path = path_and_query,
            status = status.as_u16(),
            "Upstream write completed"
        );

        Ok(UpstreamResponse {
            status,
            content_type,
            body,
        })
    }
}

fn forward_headers(
    mut request: reqwest::RequestBuilder,
    headers: &HeaderMap,
    names: &[HeaderName],
) -> reqwest::RequestBuilder {
    for name in names {
        if let Some(value) = headers.get(name) {
            request = request.header(name.clone(), value.clone());
        }
    }
    request
}

fn truncate(body: &[u8]) -> String {
    let text = String::from_utf8_lossy(body);
    match text.char_indices().nth(ERROR_BODY_LIMIT) {
        Some((cut, _)) => format!("{}…", &text[..cut]),
        None => text.into_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_loses_trailing_slash() {
        let client = UpstreamClient::new("http://api.test/", Duration::from_secs(1)).unwrap();
        assert_eq!(client.base_url(), "http://api.test");
        assert_eq!(client.url("/listings?page=2"), "http://api.test/listings?page=2");
    }

    #[test]
    fn long_error_bodies_are_truncated() {
        let body = "x".repeat(ERROR_BODY_LIMIT + 10);
        let truncated = truncate(body.as_bytes());
        assert_eq!(truncated.chars().count(), ERROR_BODY_LIMIT + 1);
        assert!(truncated.ends_with('…'));
        assert_eq!(truncate(b"short"), "short");
    }
}
