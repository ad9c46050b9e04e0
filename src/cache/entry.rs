//! Stored cache entries and their freshness windows.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use time::macros::datetime;

use super::strategy::Strategy;

/// Where an entry sits relative to its TTL windows at a given instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    /// `now < expires_at`
    Fresh,
    /// `expires_at <= now < stale_until`
    Stale,
    /// Past `stale_until`; must be treated as absent.
    Expired,
}

/// A produced value together with its TTL windows and tags.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    pub value: serde_json::Value,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub stale_until: OffsetDateTime,
    #[serde(default)]
    pub tags: BTreeSet<String>,
}

impl CacheEntry {
    pub fn new(
        key: impl Into<String>,
        value: serde_json::Value,
        strategy: &Strategy,
        tags: BTreeSet<String>,
        now: OffsetDateTime,
    ) -> Self {
        let expires_at = saturating_after(now, strategy.max_age);
        Self {
            key: key.into(),
            value,
            created_at: now,
            expires_at,
            stale_until: saturating_after(expires_at, strategy.stale_while_revalidate),
            tags,
        }
    }

    pub fn freshness(&self, now: OffsetDateTime) -> Freshness {
        if now < self.expires_at {
            Freshness::Fresh
        } else if now < self.stale_until {
            Freshness::Stale
        } else {
            Freshness::Expired
        }
    }

    pub fn is_fresh(&self, now: OffsetDateTime) -> bool {
        self.freshness(now) == Freshness::Fresh
    }

    /// Milliseconds the entry should be retained by a backend with native expiry.
    pub fn retention_ms(&self, now: OffsetDateTime) -> u64 {
        let remaining = (self.stale_until - now).whole_milliseconds();
        u64::try_from(remaining).unwrap_or(0)
    }
}

const LATEST: OffsetDateTime = datetime!(9999-12-31 23:59:59 UTC);

/// `at + window`, clamped to the last representable RFC 3339 instant.
fn saturating_after(at: OffsetDateTime, window: std::time::Duration) -> OffsetDateTime {
    time::Duration::try_from(window)
        .ok()
        .and_then(|window| at.checked_add(window))
        .map_or(LATEST, |later| later.min(LATEST))
}
