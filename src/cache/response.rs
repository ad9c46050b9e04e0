//! HTTP response synthesis from a strategy and a JSON payload.

use std::sync::Arc;

use axum::{
    body::Body,
    http::{
        HeaderMap, HeaderName, HeaderValue, StatusCode,
        header::{CACHE_CONTROL, CONTENT_TYPE, PRAGMA},
    },
    response::Response,
};
use serde::Serialize;
use thiserror::Error;
use tracing::warn;

use super::config::CacheConfig;
use super::executor::Cached;
use super::strategy::{Strategy, StrategyName, StrategyRegistry};

pub const X_BUILD_ID: HeaderName = HeaderName::from_static("x-build-id");
pub const X_CACHE: HeaderName = HeaderName::from_static("x-cache");

const NO_STORE: &str = "private, no-store, no-cache, must-revalidate";

#[derive(Debug, Error)]
pub enum SynthesizerError {
    #[error("`{0}` is not a valid header name")]
    InvalidHeaderName(String),
    #[error("build id `{0}` is not a valid header value")]
    InvalidBuildId(String),
}

/// Renders payloads as JSON responses carrying the caching headers of a strategy.
#[derive(Clone)]
pub struct ResponseSynthesizer {
    registry: Arc<StrategyRegistry>,
    cdn_headers: Arc<[HeaderName]>,
    build_id: Option<HeaderValue>,
}

impl ResponseSynthesizer {
    pub fn new(
        registry: Arc<StrategyRegistry>,
        config: &CacheConfig,
    ) -> Result<Self, SynthesizerError> {
        let cdn_headers = config
            .cdn_headers
            .iter()
            .map(|name| {
                HeaderName::from_bytes(name.as_bytes())
                    .map_err(|_| SynthesizerError::InvalidHeaderName(name.clone()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        let build_id = config
            .build_id
            .as_deref()
            .map(|id| {
                HeaderValue::from_str(id).map_err(|_| SynthesizerError::InvalidBuildId(id.into()))
            })
            .transpose()?;

        Ok(Self {
            registry,
            cdn_headers: cdn_headers.into(),
            build_id,
        })
    }

    pub fn create_response<T: Serialize + ?Sized>(
        &self,
        payload: &T,
        strategy: StrategyName,
    ) -> Response {
        self.create_response_with_status(StatusCode::OK, payload, strategy)
    }

    /// Non-2xx statuses are always rendered uncacheable, whatever `strategy` says.
    pub fn create_response_with_status<T: Serialize + ?Sized>(
        &self,
        status: StatusCode,
        payload: &T,
        strategy: StrategyName,
    ) -> Response {
        let effective = if status.is_success() {
            strategy
        } else {
            StrategyName::UserPrivate
        };

        match serde_json::to_vec(payload) {
            Ok(body) => self.build(status, body, effective),
            Err(err) => {
                warn!(
                    cache = "response",
                    strategy = %strategy,
                    error = %err,
                    "Response payload could not be serialized"
                );
                self.error_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "response could not be serialized",
                )
            }
        }
    }

    /// Render a cached query result, reporting how it was answered in `X-Cache`.
    pub fn cached_response<T: Serialize>(
        &self,
        cached: &Cached<T>,
        strategy: StrategyName,
    ) -> Response {
        let mut response = self.create_response(&cached.value, strategy);
        response
            .headers_mut()
            .insert(X_CACHE, HeaderValue::from_static(cached.status.as_str()));
        response
    }

    /// Uncacheable `{"error": message}` response.
    pub fn error_response(&self, status: StatusCode, message: &str) -> Response {
        let body = serde_json::json!({ "error": message }).to_string().into_bytes();
        self.build(status, body, StrategyName::UserPrivate)
    }

    fn build(&self, status: StatusCode, body: Vec<u8>, strategy: StrategyName) -> Response {
        let policy = self.registry.get(strategy);
        let mut response = Response::new(Body::from(body));
        *response.status_mut() = status;

        let headers = response.headers_mut();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if policy.cacheable {
            if let Ok(value) = HeaderValue::from_str(&cache_control_value(policy)) {
                headers.insert(CACHE_CONTROL, value);
            }
            if let Some(cdn_value) = cdn_cache_control_value(policy) {
                if let Ok(value) = HeaderValue::from_str(&cdn_value) {
                    for name in self.cdn_headers.iter() {
                        headers.insert(name.clone(), value.clone());
                    }
                }
            }
        } else {
            apply_no_store(headers, &self.cdn_headers);
        }
        if let Some(build_id) = &self.build_id {
            headers.insert(X_BUILD_ID, build_id.clone());
        }

        response
    }
}

/// `Cache-Control` value advertised for a strategy.
pub fn cache_control_value(policy: &Strategy) -> String {
    if !policy.cacheable {
        return NO_STORE.to_string();
    }

    let mut value = format!("public, max-age={}", policy.max_age.as_secs());
    if let Some(cdn) = policy.cdn_max_age {
        value.push_str(&format!(", s-maxage={}", cdn.as_secs()));
    }
    if !policy.stale_while_revalidate.is_zero() {
        value.push_str(&format!(
            ", stale-while-revalidate={}",
            policy.stale_while_revalidate.as_secs()
        ));
    }
    value
}

/// Value for CDN-specific cache headers, when the strategy has a CDN TTL.
pub fn cdn_cache_control_value(policy: &Strategy) -> Option<String> {
    if !policy.cacheable {
        return Some("no-store".to_string());
    }
    policy
        .cdn_max_age
        .map(|cdn| format!("public, max-age={}", cdn.as_secs()))
}

/// Mark a response as never storable by browsers, proxies or CDNs.
pub fn apply_no_store(headers: &mut HeaderMap, cdn_headers: &[HeaderName]) {
    headers.insert(CACHE_CONTROL, HeaderValue::from_static(NO_STORE));
    headers.insert(PRAGMA, HeaderValue::from_static("no-cache"));
    for name in cdn_headers {
        headers.insert(name.clone(), HeaderValue::from_static("no-store"));
    }
}

/// The CDN header used when none is configured explicitly.
pub fn default_cdn_header() -> HeaderName {
    HeaderName::from_static("cdn-cache-control")
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use axum::body::to_bytes;
    use insta::assert_snapshot;

    use super::*;
    use crate::cache::executor::CacheStatus;

    fn synthesizer(config: &CacheConfig) -> ResponseSynthesizer {
        ResponseSynthesizer::new(Arc::new(StrategyRegistry::standard()), config)
            .expect("valid synthesizer config")
    }

    fn header<'a>(response: &'a Response, name: &str) -> Option<&'a str> {
        response
            .headers()
            .get(name)
            .and_then(|value| value.to_str().ok())
    }

    #[test]
    fn cache_control_values_per_strategy() {
        let registry = StrategyRegistry::standard();
        let render = |name| cache_control_value(registry.get(name));

        assert_snapshot!(
            render(StrategyName::StaticImmutable),
            @"public, max-age=86400, s-maxage=31536000, stale-while-revalidate=604800"
        );
        assert_snapshot!(
            render(StrategyName::ApiStandard),
            @"public, max-age=300, s-maxage=300, stale-while-revalidate=600"
        );
        assert_snapshot!(
            render(StrategyName::DynamicContent),
            @"public, max-age=60, s-maxage=60, stale-while-revalidate=30"
        );
        assert_snapshot!(
            render(StrategyName::UserPrivate),
            @"private, no-store, no-cache, must-revalidate"
        );
    }

    #[test]
    fn zero_swr_and_missing_cdn_are_omitted() {
        let policy = Strategy::cacheable(StrategyName::ApiStandard, 30, 0, None);
        assert_snapshot!(cache_control_value(&policy), @"public, max-age=30");
        assert_eq!(cdn_cache_control_value(&policy), None);
    }

    #[tokio::test]
    async fn cacheable_response_carries_json_and_cdn_headers() {
        let synth = synthesizer(&CacheConfig::default());
        let mut payload = BTreeMap::new();
        payload.insert("name", "RustConf");

        let response = synth.create_response(&payload, StrategyName::DatabaseQueries);

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(header(&response, "content-type"), Some("application/json"));
        assert_eq!(
            header(&response, "cache-control"),
            Some("public, max-age=300, s-maxage=600, stale-while-revalidate=600")
        );
        assert_eq!(
            header(&response, "cdn-cache-control"),
            Some("public, max-age=600")
        );
        assert!(response.headers().get("pragma").is_none());

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], br#"{"name":"RustConf"}"#);
    }

    #[test]
    fn private_response_is_no_store_everywhere() {
        let synth = synthesizer(&CacheConfig {
            cdn_headers: vec!["CDN-Cache-Control".into(), "Vercel-CDN-Cache-Control".into()],
            ..Default::default()
        });

        let response = synth.create_response(&"me", StrategyName::UserPrivate);

        assert_eq!(header(&response, "cache-control"), Some(NO_STORE));
        assert_eq!(header(&response, "pragma"), Some("no-cache"));
        assert_eq!(header(&response, "cdn-cache-control"), Some("no-store"));
        assert_eq!(header(&response, "vercel-cdn-cache-control"), Some("no-store"));
    }

    #[test]
    fn error_statuses_force_private_headers() {
        let synth = synthesizer(&CacheConfig::default());

        let response = synth.create_response_with_status(
            StatusCode::NOT_FOUND,
            &serde_json::json!({ "error": "missing" }),
            StrategyName::StaticImmutable,
        );

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(header(&response, "cache-control"), Some(NO_STORE));
    }

    #[tokio::test]
    async fn error_response_body_shape() {
        let synth = synthesizer(&CacheConfig::default());
        let response = synth.error_response(StatusCode::BAD_GATEWAY, "upstream unavailable");

        assert_eq!(header(&response, "cache-control"), Some(NO_STORE));
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], br#"{"error":"upstream unavailable"}"#);
    }

    #[test]
    fn unserializable_payload_becomes_private_500() {
        let synth = synthesizer(&CacheConfig::default());
        let mut payload = std::collections::HashMap::new();
        payload.insert((1, 2), "tuple keys are not valid JSON object keys");

        let response = synth.create_response(&payload, StrategyName::ApiStandard);

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(header(&response, "cache-control"), Some(NO_STORE));
    }

    #[test]
    fn build_id_and_cache_status_headers() {
        let synth = synthesizer(&CacheConfig {
            build_id: Some("2024.06.1".into()),
            ..Default::default()
        });
        let cached = Cached {
            value: 7,
            status: CacheStatus::Stale,
        };

        let response = synth.cached_response(&cached, StrategyName::ApiStandard);

        assert_eq!(header(&response, "x-build-id"), Some("2024.06.1"));
        assert_eq!(header(&response, "x-cache"), Some("STALE"));
    }

    #[test]
    fn invalid_cdn_header_name_is_rejected() {
        let result = ResponseSynthesizer::new(
            Arc::new(StrategyRegistry::standard()),
            &CacheConfig {
                cdn_headers: vec!["bad header".into()],
                ..Default::default()
            },
        );
        assert!(matches!(result, Err(SynthesizerError::InvalidHeaderName(_))));
    }
}
