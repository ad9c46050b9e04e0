//! Read-through gateway in front of the upstream JSON API.

use std::sync::Arc;

use axum::{
    body::{Body, Bytes},
    extract::{Path, RawQuery, State},
    http::{
        HeaderMap, HeaderValue, Method, StatusCode,
        header::{AUTHORIZATION, CONTENT_TYPE, COOKIE},
    },
    response::Response,
};
use tracing::{info, warn};

use crate::{
    application::error::AppError,
    cache::{
        CacheKey, ResponseSynthesizer, StrategyName, UnifiedCache, apply_no_store,
        canonical_query, default_cdn_header,
    },
    config::RouteRule,
    infra::upstream::UpstreamClient,
};

const DEFAULT_ROUTE_TAG: &str = "api";
const KEY_KIND: &str = "api";

#[derive(Clone)]
pub struct GatewayState {
    pub cache: UnifiedCache,
    pub synthesizer: ResponseSynthesizer,
    pub upstream: Option<UpstreamClient>,
    pub routes: Arc<RouteTable>,
}

/// Strategy and tags that apply to one upstream path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedRoute {
    pub strategy: StrategyName,
    pub tags: Vec<String>,
}

/// Route rules ordered so the longest matching prefix wins.
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    rules: Vec<RouteRule>,
}

impl RouteTable {
    pub fn new(mut rules: Vec<RouteRule>) -> Self {
        rules.sort_by(|left, right| right.prefix.len().cmp(&left.prefix.len()));
        Self { rules }
    }

    pub fn resolve(&self, path: &str) -> ResolvedRoute {
        self.rules
            .iter()
            .find(|rule| prefix_matches(&rule.prefix, path))
            .map(|rule| ResolvedRoute {
                strategy: rule.strategy,
                tags: rule.tags.clone(),
            })
            .unwrap_or_else(|| ResolvedRoute {
                strategy: StrategyName::ApiStandard,
                tags: vec![DEFAULT_ROUTE_TAG.to_string()],
            })
    }
}

/// Prefixes match on whole path segments: `/listings` covers `/listings/4` but not `/listingsx`.
fn prefix_matches(prefix: &str, path: &str) -> bool {
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/') || prefix.ends_with('/'),
        None => false,
    }
}

fn carries_credentials(headers: &HeaderMap) -> bool {
    headers.contains_key(AUTHORIZATION) || headers.contains_key(COOKIE)
}

fn upstream_target(path: &str, query: &str) -> String {
    if query.is_empty() {
        path.to_string()
    } else {
        format!("{path}?{query}")
    }
}

pub(super) async fn api_read(
    State(state): State<GatewayState>,
    Path(path): Path<String>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let upstream = state.upstream.clone().ok_or(AppError::UpstreamDisabled)?;

    let path = format!("/{path}");
    let route = state.routes.resolve(&path);
    let strategy = if carries_credentials(&headers) {
        StrategyName::UserPrivate
    } else {
        route.strategy
    };

    let query = canonical_query(query.as_deref());
    let mut key = CacheKey::new(KEY_KIND).part(&path);
    if !query.is_empty() {
        key = key.part(&query);
    }
    let target = upstream_target(&path, &query);

    let cached = state
        .cache
        .cached_query_tagged_traced(key.as_str(), strategy, route.tags, move || async move {
            upstream.fetch_json(&target, &headers).await
        })
        .await?;

    Ok(state.synthesizer.cached_response(&cached, strategy))
}

pub(super) async fn api_write(
    State(state): State<GatewayState>,
    method: Method,
    Path(path): Path<String>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    let upstream = state.upstream.as_ref().ok_or(AppError::UpstreamDisabled)?;

    let path = format!("/{path}");
    let target = upstream_target(&path, query.as_deref().unwrap_or(""));
    let reply = upstream
        .forward(method.clone(), &target, &headers, body)
        .await
        .map_err(crate::cache::CacheError::producer)?;

    if reply.status.is_success() {
        let route = state.routes.resolve(&path);
        invalidate(&state.cache, &path, route.tags).await;
        info!(
            method = %method,
            path = %path,
            status = reply.status.as_u16(),
            "Write forwarded; related entries invalidated"
        );
    }

    let mut response = Response::new(Body::from(reply.body));
    *response.status_mut() = reply.status;
    let response_headers = response.headers_mut();
    response_headers.insert(
        CONTENT_TYPE,
        reply
            .content_type
            .unwrap_or_else(|| HeaderValue::from_static("application/json")),
    );
    apply_no_store(response_headers, &[default_cdn_header()]);
    Ok(response)
}

/// Purge the route's tags and every entry keyed under `path`.
///
/// Failures are logged; the write itself already succeeded upstream.
async fn invalidate(cache: &UnifiedCache, path: &str, tags: Vec<String>) {
    if let Err(err) = cache.purge_by_tags(tags).await {
        warn!(cache = "gateway", path, error = %err, "Tag invalidation after write failed");
    }
    let scope = KeyScope::of(path);
    let mut result = cache.purge_by_key(&scope.exact).await.map(drop);
    for prefix in &scope.prefixes {
        if result.is_err() {
            break;
        }
        result = cache.purge_by_prefix(prefix).await.map(drop);
    }
    if let Err(err) = result {
        warn!(cache = "gateway", path, error = %err, "Key invalidation after write failed");
    }
}

/// Cache keys derived from one path: the path itself, its query variants and
/// the paths below it. Siblings sharing a textual prefix are left alone.
#[derive(Debug, PartialEq, Eq)]
struct KeyScope {
    exact: String,
    prefixes: [String; 2],
}

impl KeyScope {
    fn of(path: &str) -> Self {
        let exact = CacheKey::new(KEY_KIND).part(path).into_string();
        let below = if exact.ends_with('/') {
            exact.clone()
        } else {
            format!("{exact}/")
        };
        Self {
            prefixes: [format!("{exact}:"), below],
            exact,
        }
    }
}

pub(super) async fn health() -> StatusCode {
    StatusCode::NO_CONTENT
}
