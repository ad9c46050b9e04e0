//! Named cache policies.
//!
//! The set of strategies is closed: every call site names one of the
//! [`StrategyName`] variants and the [`StrategyRegistry`] maps it to the
//! TTLs and cacheability used by the executor and the response synthesizer.
//! The registry is built once at startup and shared immutably.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

const MINUTE: u64 = 60;
const HOUR: u64 = 60 * MINUTE;
const DAY: u64 = 24 * HOUR;

/// Upper bound for every configured TTL window.
pub const MAX_TTL_SECS: u64 = 100 * 365 * DAY;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StrategyName {
    /// Content that never changes once created (verified certificates, archived events).
    StaticImmutable,
    /// General read endpoints.
    ApiStandard,
    /// Expensive aggregate queries.
    DatabaseQueries,
    /// Frequently changing public listings.
    DynamicContent,
    /// Per-user data; never stored, never shared.
    UserPrivate,
}

impl StrategyName {
    pub const ALL: [StrategyName; 5] = [
        StrategyName::StaticImmutable,
        StrategyName::ApiStandard,
        StrategyName::DatabaseQueries,
        StrategyName::DynamicContent,
        StrategyName::UserPrivate,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            StrategyName::StaticImmutable => "STATIC_IMMUTABLE",
            StrategyName::ApiStandard => "API_STANDARD",
            StrategyName::DatabaseQueries => "DATABASE_QUERIES",
            StrategyName::DynamicContent => "DYNAMIC_CONTENT",
            StrategyName::UserPrivate => "USER_PRIVATE",
        }
    }

    fn slot(self) -> usize {
        match self {
            StrategyName::StaticImmutable => 0,
            StrategyName::ApiStandard => 1,
            StrategyName::DatabaseQueries => 2,
            StrategyName::DynamicContent => 3,
            StrategyName::UserPrivate => 4,
        }
    }
}

impl fmt::Display for StrategyName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StrategyName {
    type Err = StrategyError;

    /// Accepts the canonical upper-case names as well as lower-case and
    /// kebab-case spellings, since configuration sources may fold case.
    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let normalized = raw.trim().replace('-', "_").to_ascii_uppercase();
        StrategyName::ALL
            .into_iter()
            .find(|name| name.as_str() == normalized)
            .ok_or_else(|| StrategyError::Unknown(raw.to_string()))
    }
}

/// Cache policy bundle for one strategy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Strategy {
    pub name: StrategyName,
    pub max_age: Duration,
    pub stale_while_revalidate: Duration,
    pub cdn_max_age: Option<Duration>,
    pub cacheable: bool,
}

impl Strategy {
    pub const fn cacheable(
        name: StrategyName,
        max_age_secs: u64,
        stale_while_revalidate_secs: u64,
        cdn_max_age_secs: Option<u64>,
    ) -> Self {
        let cdn_max_age = match cdn_max_age_secs {
            Some(secs) => Some(Duration::from_secs(secs)),
            None => None,
        };
        Self {
            name,
            max_age: Duration::from_secs(max_age_secs),
            stale_while_revalidate: Duration::from_secs(stale_while_revalidate_secs),
            cdn_max_age,
            cacheable: true,
        }
    }

    pub const fn uncacheable(name: StrategyName) -> Self {
        Self {
            name,
            max_age: Duration::ZERO,
            stale_while_revalidate: Duration::ZERO,
            cdn_max_age: None,
            cacheable: false,
        }
    }

    /// Whether stale entries are served while a background refresh runs.
    pub fn serves_stale(&self) -> bool {
        self.cacheable && !self.stale_while_revalidate.is_zero()
    }

    fn check_bounds(&self) -> Result<(), StrategyError> {
        let windows = [
            ("max_age", Some(self.max_age)),
            ("stale_while_revalidate", Some(self.stale_while_revalidate)),
            ("cdn_max_age", self.cdn_max_age),
        ];
        for (window, value) in windows {
            if let Some(value) = value {
                if value.as_secs() > MAX_TTL_SECS {
                    return Err(StrategyError::TtlTooLong {
                        name: self.name,
                        window,
                        secs: value.as_secs(),
                    });
                }
            }
        }
        Ok(())
    }

    fn apply(mut self, tuning: &StrategyOverride) -> Self {
        if let Some(secs) = tuning.max_age_secs {
            self.max_age = Duration::from_secs(secs);
        }
        if let Some(secs) = tuning.stale_while_revalidate_secs {
            self.stale_while_revalidate = Duration::from_secs(secs);
        }
        if let Some(secs) = tuning.cdn_max_age_secs {
            self.cdn_max_age = Some(Duration::from_secs(secs));
        }
        self
    }
}

/// TTL tuning for a cacheable strategy. Cacheability itself is not tunable.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StrategyOverride {
    pub max_age_secs: Option<u64>,
    pub stale_while_revalidate_secs: Option<u64>,
    pub cdn_max_age_secs: Option<u64>,
}

impl StrategyOverride {
    fn is_empty(&self) -> bool {
        self.max_age_secs.is_none()
            && self.stale_while_revalidate_secs.is_none()
            && self.cdn_max_age_secs.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StrategyError {
    #[error("unknown cache strategy `{0}`")]
    Unknown(String),
    #[error("strategy table has no entry for {0}")]
    Missing(StrategyName),
    #[error("strategy table lists {0} more than once")]
    Duplicate(StrategyName),
    #[error("{0} must not be cacheable")]
    PrivateCacheable(StrategyName),
    #[error("{0} cannot be tuned because it is never cached")]
    TuningUncacheable(StrategyName),
    #[error("{name} {window} of {secs}s exceeds the {limit}s limit", limit = MAX_TTL_SECS)]
    TtlTooLong {
        name: StrategyName,
        window: &'static str,
        secs: u64,
    },
}

/// Immutable lookup table from [`StrategyName`] to [`Strategy`].
#[derive(Debug, Clone)]
pub struct StrategyRegistry {
    strategies: Vec<Strategy>,
}

impl StrategyRegistry {
    /// Built-in policy table.
    pub fn standard() -> Self {
        Self {
            strategies: vec![
                Strategy::cacheable(
                    StrategyName::StaticImmutable,
                    DAY,
                    7 * DAY,
                    Some(365 * DAY),
                ),
                Strategy::cacheable(
                    StrategyName::ApiStandard,
                    5 * MINUTE,
                    10 * MINUTE,
                    Some(5 * MINUTE),
                ),
                Strategy::cacheable(
                    StrategyName::DatabaseQueries,
                    5 * MINUTE,
                    10 * MINUTE,
                    Some(10 * MINUTE),
                ),
                Strategy::cacheable(StrategyName::DynamicContent, MINUTE, 30, Some(MINUTE)),
                Strategy::uncacheable(StrategyName::UserPrivate),
            ],
        }
    }

    /// Build a registry from an explicit table.
    ///
    /// The table must name every strategy exactly once and `USER_PRIVATE`
    /// must stay uncacheable.
    pub fn from_table(table: impl IntoIterator<Item = Strategy>) -> Result<Self, StrategyError> {
        let mut slots: Vec<Option<Strategy>> = vec![None; StrategyName::ALL.len()];
        for strategy in table {
            let slot = &mut slots[strategy.name.slot()];
            if slot.is_some() {
                return Err(StrategyError::Duplicate(strategy.name));
            }
            if strategy.name == StrategyName::UserPrivate && strategy.cacheable {
                return Err(StrategyError::PrivateCacheable(strategy.name));
            }
            strategy.check_bounds()?;
            *slot = Some(strategy);
        }

        let strategies = StrategyName::ALL
            .into_iter()
            .zip(slots)
            .map(|(name, slot)| slot.ok_or(StrategyError::Missing(name)))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self { strategies })
    }

    /// The standard table with TTL overrides applied.
    pub fn with_overrides(
        overrides: &HashMap<StrategyName, StrategyOverride>,
    ) -> Result<Self, StrategyError> {
        let table = Self::standard()
            .strategies
            .into_iter()
            .map(|strategy| match overrides.get(&strategy.name) {
                Some(tuning) if tuning.is_empty() => Ok(strategy),
                Some(_) if !strategy.cacheable => {
                    Err(StrategyError::TuningUncacheable(strategy.name))
                }
                Some(tuning) => Ok(strategy.apply(tuning)),
                None => Ok(strategy),
            })
            .collect::<Result<Vec<_>, _>>()?;
        Self::from_table(table)
    }

    pub fn get(&self, name: StrategyName) -> &Strategy {
        &self.strategies[name.slot()]
    }

    /// Resolve a textual strategy name, failing on names outside the closed set.
    pub fn lookup(&self, raw: &str) -> Result<&Strategy, StrategyError> {
        raw.parse::<StrategyName>().map(|name| self.get(name))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Strategy> {
        self.strategies.iter()
    }
}

impl Default for StrategyRegistry {
    fn default() -> Self {
        Self::standard()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_table_covers_every_strategy() {
        let registry = StrategyRegistry::standard();
        for name in StrategyName::ALL {
            assert_eq!(registry.get(name).name, name);
        }
    }

    #[test]
    fn user_private_is_never_cacheable() {
        let registry = StrategyRegistry::standard();
        let private = registry.get(StrategyName::UserPrivate);
        assert!(!private.cacheable);
        assert!(!private.serves_stale());
        assert_eq!(private.max_age, Duration::ZERO);
    }

    #[test]
    fn api_standard_swr_is_twice_max_age() {
        let registry = StrategyRegistry::standard();
        let api = registry.get(StrategyName::ApiStandard);
        assert_eq!(api.stale_while_revalidate, api.max_age * 2);
    }

    #[test]
    fn names_parse_case_insensitively() {
        assert_eq!(
            "dynamic-content".parse::<StrategyName>(),
            Ok(StrategyName::DynamicContent)
        );
        assert_eq!(
            "API_STANDARD".parse::<StrategyName>(),
            Ok(StrategyName::ApiStandard)
        );
        assert_eq!(
            "nope".parse::<StrategyName>(),
            Err(StrategyError::Unknown("nope".to_string()))
        );
    }

    #[test]
    fn lookup_rejects_unknown_names() {
        let registry = StrategyRegistry::standard();
        assert!(registry.lookup("HALF_CACHED").is_err());
        assert_eq!(
            registry.lookup("user_private").map(|s| s.name),
            Ok(StrategyName::UserPrivate)
        );
    }

    #[test]
    fn incomplete_table_is_rejected() {
        let table = vec![Strategy::uncacheable(StrategyName::UserPrivate)];
        assert_eq!(
            StrategyRegistry::from_table(table).unwrap_err(),
            StrategyError::Missing(StrategyName::StaticImmutable)
        );
    }

    #[test]
    fn duplicate_entries_are_rejected() {
        let mut table: Vec<Strategy> = StrategyRegistry::standard().iter().cloned().collect();
        table.push(Strategy::uncacheable(StrategyName::ApiStandard));
        assert_eq!(
            StrategyRegistry::from_table(table).unwrap_err(),
            StrategyError::Duplicate(StrategyName::ApiStandard)
        );
    }

    #[test]
    fn cacheable_private_strategy_is_rejected() {
        let table = StrategyRegistry::standard()
            .iter()
            .cloned()
            .map(|strategy| {
                if strategy.name == StrategyName::UserPrivate {
                    Strategy::cacheable(StrategyName::UserPrivate, 10, 0, None)
                } else {
                    strategy
                }
            })
            .collect::<Vec<_>>();
        assert!(matches!(
            StrategyRegistry::from_table(table),
            Err(StrategyError::PrivateCacheable(StrategyName::UserPrivate))
        ));
    }

    #[test]
    fn overrides_tune_ttls() {
        let mut overrides = HashMap::new();
        overrides.insert(
            StrategyName::DynamicContent,
            StrategyOverride {
                max_age_secs: Some(15),
                stale_while_revalidate_secs: Some(0),
                cdn_max_age_secs: None,
            },
        );

        let registry = StrategyRegistry::with_overrides(&overrides).expect("valid overrides");
        let dynamic = registry.get(StrategyName::DynamicContent);
        assert_eq!(dynamic.max_age, Duration::from_secs(15));
        assert!(!dynamic.serves_stale());
        assert_eq!(dynamic.cdn_max_age, Some(Duration::from_secs(60)));
    }

    #[test]
    fn overrides_cannot_tune_private() {
        let mut overrides = HashMap::new();
        overrides.insert(
            StrategyName::UserPrivate,
            StrategyOverride {
                max_age_secs: Some(30),
                ..Default::default()
            },
        );
        assert_eq!(
            StrategyRegistry::with_overrides(&overrides).unwrap_err(),
            StrategyError::TuningUncacheable(StrategyName::UserPrivate)
        );
    }

    #[test]
    fn overrides_beyond_the_ttl_limit_are_rejected() {
        let mut overrides = HashMap::new();
        overrides.insert(
            StrategyName::ApiStandard,
            StrategyOverride {
                max_age_secs: Some(1_000_000_000_000),
                ..Default::default()
            },
        );
        assert_eq!(
            StrategyRegistry::with_overrides(&overrides).unwrap_err(),
            StrategyError::TtlTooLong {
                name: StrategyName::ApiStandard,
                window: "max_age",
                secs: 1_000_000_000_000,
            }
        );

        overrides.insert(
            StrategyName::ApiStandard,
            StrategyOverride {
                max_age_secs: Some(MAX_TTL_SECS),
                stale_while_revalidate_secs: Some(MAX_TTL_SECS),
                cdn_max_age_secs: Some(MAX_TTL_SECS),
            },
        );
        assert!(StrategyRegistry::with_overrides(&overrides).is_ok());
    }
}
