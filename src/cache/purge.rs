//! Invalidation.
//!
//! Every purge runs under the write side of the purge gate: it first detaches
//! in-flight fills for the affected keys, then removes stored entries and
//! their tag mappings. A read that starts after a purge returns therefore
//! always misses, and a fill that was running during the purge never writes
//! its result.

use std::collections::BTreeSet;

use serde::Serialize;
use tracing::{info, warn};

use super::metrics;
use super::store::{StoreError, StoreResult};
use super::unified::UnifiedCache;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PurgeReport {
    /// Entries invalidated.
    pub keys: usize,
    /// In-flight fills whose results will be discarded.
    pub detached_fills: usize,
}

impl UnifiedCache {
    /// Record `tags` for an existing key, replacing its previous tags.
    ///
    /// Fills record their own tags on write-back; this is for entries whose
    /// dependencies are only known after the fact.
    pub async fn associate<I>(&self, key: &str, tags: I) -> StoreResult<()>
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        let tags: BTreeSet<String> = tags.into_iter().map(Into::into).collect();
        self.inner.tags.associate(key, &tags).await
    }

    /// Invalidate every entry recorded under any of `tags`. Unknown tags are ignored.
    pub async fn purge_by_tags<I>(&self, tags: I) -> StoreResult<PurgeReport>
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        let tags: Vec<String> = tags.into_iter().map(Into::into).collect();
        if tags.is_empty() {
            return Ok(PurgeReport::default());
        }

        let _gate = self.inner.purge_gate.write().await;
        let mut detached = self.inner.flights.detach_tagged(&tags);
        let keys: Vec<String> = self
            .inner
            .tags
            .keys_for_tags(&tags)
            .await
            .inspect_err(|err| purge_failed("tags", err))?
            .into_iter()
            .collect();
        detached += self.inner.flights.detach_keys(&keys);
        self.remove_keys(&keys, "tags").await?;

        let report = PurgeReport {
            keys: keys.len(),
            detached_fills: detached,
        };
        metrics::purged("tags", report.keys);
        info!(
            cache = "purge",
            scope = "tags",
            tags = ?tags,
            keys = report.keys,
            detached_fills = report.detached_fills,
            "Purged entries by tag"
        );
        Ok(report)
    }

    pub async fn purge_by_key(&self, key: &str) -> StoreResult<PurgeReport> {
        let keys = vec![key.to_string()];
        let _gate = self.inner.purge_gate.write().await;
        let detached = self.inner.flights.detach_keys(&keys);
        let removed = self.remove_keys(&keys, "key").await?;

        metrics::purged("key", removed);
        info!(cache = "purge", scope = "key", key, removed, "Purged entry");
        Ok(PurgeReport {
            keys: removed,
            detached_fills: detached,
        })
    }

    /// Invalidate every key starting with `prefix`.
    pub async fn purge_by_prefix(&self, prefix: &str) -> StoreResult<PurgeReport> {
        let _gate = self.inner.purge_gate.write().await;
        let detached = self.inner.flights.detach_prefix(prefix);
        let removed = self
            .inner
            .store
            .remove_prefix(prefix)
            .await
            .inspect_err(|err| purge_failed("prefix", err))?;
        if !removed.is_empty() {
            self.inner
                .tags
                .forget(&removed)
                .await
                .inspect_err(|err| purge_failed("prefix", err))?;
        }

        metrics::purged("prefix", removed.len());
        info!(
            cache = "purge",
            scope = "prefix",
            prefix,
            keys = removed.len(),
            detached_fills = detached,
            "Purged entries by prefix"
        );
        Ok(PurgeReport {
            keys: removed.len(),
            detached_fills: detached,
        })
    }

    pub async fn purge_all(&self) -> StoreResult<PurgeReport> {
        let _gate = self.inner.purge_gate.write().await;
        let detached = self.inner.flights.detach_all();
        let tracked = self
            .inner
            .tags
            .stats()
            .await
            .map(|stats| stats.keys)
            .unwrap_or(0);
        self.inner
            .store
            .clear()
            .await
            .inspect_err(|err| purge_failed("all", err))?;
        self.inner
            .tags
            .clear()
            .await
            .inspect_err(|err| purge_failed("all", err))?;

        metrics::purged("all", tracked);
        info!(
            cache = "purge",
            scope = "all",
            detached_fills = detached,
            "Purged entire cache"
        );
        Ok(PurgeReport {
            keys: tracked,
            detached_fills: detached,
        })
    }

    async fn remove_keys(&self, keys: &[String], scope: &'static str) -> StoreResult<usize> {
        if keys.is_empty() {
            return Ok(0);
        }
        let removed = self
            .inner
            .store
            .remove(keys)
            .await
            .inspect_err(|err| purge_failed(scope, err))?;
        self.inner
            .tags
            .forget(keys)
            .await
            .inspect_err(|err| purge_failed(scope, err))?;
        Ok(removed)
    }
}

fn purge_failed(scope: &'static str, err: &StoreError) {
    metrics::store_error("purge");
    warn!(cache = "purge", scope, error = %err, "Purge failed");
}
