//! Operator endpoints: explicit purges and cache statistics.

use axum::{Json, extract::State};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{
    application::error::AppError,
    cache::{CacheStats, PurgeReport, UnifiedCache},
};

#[derive(Clone)]
pub struct AdminState {
    pub cache: UnifiedCache,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub(super) struct PurgeRequest {
    tags: Vec<String>,
    keys: Vec<String>,
    prefix: Option<String>,
    all: bool,
}

impl PurgeRequest {
    fn is_empty(&self) -> bool {
        self.tags.is_empty() && self.keys.is_empty() && self.prefix.is_none() && !self.all
    }
}

#[derive(Debug, Default, Serialize)]
pub(super) struct PurgeSummary {
    keys: usize,
    detached_fills: usize,
}

impl PurgeSummary {
    fn add(&mut self, report: PurgeReport) {
        self.keys += report.keys;
        self.detached_fills += report.detached_fills;
    }
}

pub(super) async fn purge(
    State(state): State<AdminState>,
    Json(request): Json<PurgeRequest>,
) -> Result<Json<PurgeSummary>, AppError> {
    if request.is_empty() {
        return Err(AppError::validation(
            "purge request names no tags, keys, prefix or `all`",
        ));
    }

    let mut summary = PurgeSummary::default();
    if request.all {
        summary.add(state.cache.purge_all().await?);
    } else {
        if !request.tags.is_empty() {
            summary.add(state.cache.purge_by_tags(request.tags).await?);
        }
        for key in &request.keys {
            summary.add(state.cache.purge_by_key(key).await?);
        }
        if let Some(prefix) = request.prefix.as_deref() {
            summary.add(state.cache.purge_by_prefix(prefix).await?);
        }
    }

    info!(
        cache = "admin",
        keys = summary.keys,
        detached_fills = summary.detached_fills,
        "Purge requested by operator"
    );
    Ok(Json(summary))
}

pub(super) async fn stats(State(state): State<AdminState>) -> Result<Json<CacheStats>, AppError> {
    Ok(Json(state.cache.stats().await?))
}
