//! Per-key single-flight registry.
//!
//! At most one fill runs per key in this process; later callers for the same
//! key clone the shared future of the running fill. Purges detach flights so
//! that new callers start over and the detached fill skips its write-back.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use serde_json::Value;

use super::error::CacheError;

pub(crate) type FillFuture = Shared<BoxFuture<'static, Result<Value, CacheError>>>;

struct Flight {
    id: u64,
    tags: BTreeSet<String>,
    future: FillFuture,
}

pub(crate) enum Joined {
    /// This caller started the fill.
    Leader(FillFuture),
    /// A fill was already running.
    Follower(FillFuture),
}

impl Joined {
    pub(crate) fn is_leader(&self) -> bool {
        matches!(self, Joined::Leader(_))
    }

    pub(crate) fn into_future(self) -> FillFuture {
        match self {
            Joined::Leader(future) | Joined::Follower(future) => future,
        }
    }
}

#[derive(Default)]
pub(crate) struct InFlightFills {
    flights: DashMap<String, Flight>,
    next_id: AtomicU64,
}

impl InFlightFills {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Join the running fill for `key` or start one with `start`.
    ///
    /// `start` receives the guard that identifies the new flight; the flight
    /// is unregistered when the guard drops.
    pub(crate) fn join_or_start<F>(
        self: &Arc<Self>,
        key: &str,
        tags: &BTreeSet<String>,
        start: F,
    ) -> Joined
    where
        F: FnOnce(FlightGuard) -> BoxFuture<'static, Result<Value, CacheError>>,
    {
        match self.flights.entry(key.to_string()) {
            Entry::Occupied(running) => Joined::Follower(running.get().future.clone()),
            Entry::Vacant(slot) => {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                let guard = FlightGuard {
                    fills: Arc::clone(self),
                    key: key.to_string(),
                    id,
                };
                let future = start(guard).shared();
                slot.insert(Flight {
                    id,
                    tags: tags.clone(),
                    future: future.clone(),
                });
                Joined::Leader(future)
            }
        }
    }

    pub(crate) fn is_current(&self, key: &str, id: u64) -> bool {
        self.flights
            .get(key)
            .map(|flight| flight.id == id)
            .unwrap_or(false)
    }

    fn finish(&self, key: &str, id: u64) {
        self.flights.remove_if(key, |_, flight| flight.id == id);
    }

    pub(crate) fn detach_keys<'a>(&self, keys: impl IntoIterator<Item = &'a String>) -> usize {
        keys.into_iter()
            .filter(|key| self.flights.remove(key.as_str()).is_some())
            .count()
    }

    pub(crate) fn detach_tagged(&self, tags: &[String]) -> usize {
        self.detach_where(|_, flight| tags.iter().any(|tag| flight.tags.contains(tag)))
    }

    pub(crate) fn detach_prefix(&self, prefix: &str) -> usize {
        self.detach_where(|key, _| key.starts_with(prefix))
    }

    pub(crate) fn detach_all(&self) -> usize {
        let detached = self.flights.len();
        self.flights.clear();
        detached
    }

    fn detach_where(&self, matches: impl Fn(&str, &Flight) -> bool) -> usize {
        let before = self.flights.len();
        self.flights.retain(|key, flight| !matches(key, flight));
        before.saturating_sub(self.flights.len())
    }

    pub(crate) fn len(&self) -> usize {
        self.flights.len()
    }
}

/// Identity of one fill; unregisters the flight on drop.
pub(crate) struct FlightGuard {
    fills: Arc<InFlightFills>,
    key: String,
    id: u64,
}

impl FlightGuard {
    pub(crate) fn key(&self) -> &str {
        &self.key
    }

    /// False once a purge detached this fill or a newer fill replaced it.
    pub(crate) fn is_current(&self) -> bool {
        self.fills.is_current(&self.key, self.id)
    }
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        self.fills.finish(&self.key, self.id);
    }
}

#[cfg(test)]
mod tests {
    use futures::future;
    use serde_json::json;

    use super::*;

    fn ready(value: Value) -> BoxFuture<'static, Result<Value, CacheError>> {
        future::ready(Ok(value)).boxed()
    }

    fn tags(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|name| name.to_string()).collect()
    }

    #[tokio::test]
    async fn second_caller_joins_running_flight() {
        let fills = Arc::new(InFlightFills::new());
        let mut guards = Vec::new();

        let first = fills.join_or_start("k", &BTreeSet::new(), |guard| {
            guards.push(guard);
            ready(json!(1))
        });
        let second = fills.join_or_start("k", &BTreeSet::new(), |_| ready(json!(2)));

        assert!(first.is_leader());
        assert!(!second.is_leader());
        assert_eq!(second.into_future().await.unwrap(), json!(1));
        assert_eq!(fills.len(), 1);

        drop(guards);
        assert_eq!(fills.len(), 0);
    }

    #[tokio::test]
    async fn detached_flight_is_no_longer_current() {
        let fills = Arc::new(InFlightFills::new());
        let mut guards = Vec::new();
        fills.join_or_start("events:list", &tags(&["events"]), |guard| {
            guards.push(guard);
            ready(json!(null))
        });

        assert!(guards[0].is_current());
        assert_eq!(fills.detach_tagged(&["events".to_string()]), 1);
        assert!(!guards[0].is_current());

        let restarted = fills.join_or_start("events:list", &tags(&["events"]), |guard| {
            guards.push(guard);
            ready(json!(null))
        });
        assert!(restarted.is_leader());

        // Dropping the stale guard must not unregister the new flight.
        let stale = guards.remove(0);
        drop(stale);
        assert!(guards[0].is_current());
    }

    #[tokio::test]
    async fn detach_by_prefix_and_keys() {
        let fills = Arc::new(InFlightFills::new());
        let mut guards = Vec::new();
        for key in ["events:1", "events:2", "companies:1"] {
            fills.join_or_start(key, &BTreeSet::new(), |guard| {
                guards.push(guard);
                ready(json!(null))
            });
        }

        assert_eq!(fills.detach_prefix("events:"), 2);
        assert_eq!(fills.detach_keys(&["companies:1".to_string()]), 1);
        assert_eq!(fills.detach_all(), 0);
        assert_eq!(guards[0].key(), "events:1");
    }
}
