//! Tag index.
//!
//! Tracks tag → keys and key → tags so a mutation can find every entry
//! derived from the data it touched.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::RwLock;

use async_trait::async_trait;
use serde::Serialize;

use super::lock::{rw_read, rw_write};
use super::store::StoreResult;

const SOURCE: &str = "cache::tags";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TagIndexStats {
    pub tags: usize,
    pub keys: usize,
}

#[async_trait]
pub trait TagIndex: Send + Sync + 'static {
    /// Record the tags of `key`, replacing any previously recorded set.
    async fn associate(&self, key: &str, tags: &BTreeSet<String>) -> StoreResult<()>;

    /// Union of the keys recorded under any of `tags`. Unknown tags contribute nothing.
    async fn keys_for_tags(&self, tags: &[String]) -> StoreResult<BTreeSet<String>>;

    /// Drop every mapping that mentions one of `keys`.
    async fn forget(&self, keys: &[String]) -> StoreResult<()>;

    async fn clear(&self) -> StoreResult<()>;

    async fn stats(&self) -> StoreResult<TagIndexStats>;
}

#[derive(Default)]
struct Mappings {
    tag_to_keys: HashMap<String, HashSet<String>>,
    key_to_tags: HashMap<String, BTreeSet<String>>,
}

impl Mappings {
    fn unlink(&mut self, key: &str) {
        let Some(tags) = self.key_to_tags.remove(key) else {
            return;
        };
        for tag in tags {
            if let Some(keys) = self.tag_to_keys.get_mut(&tag) {
                keys.remove(key);
                if keys.is_empty() {
                    self.tag_to_keys.remove(&tag);
                }
            }
        }
    }
}

/// In-process bidirectional tag index.
///
/// Both directions sit behind one lock so they can never disagree.
#[derive(Default)]
pub struct MemoryTagIndex {
    mappings: RwLock<Mappings>,
}

impl MemoryTagIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tags currently recorded for `key`.
    pub fn tags_for_key(&self, key: &str) -> BTreeSet<String> {
        rw_read(&self.mappings, SOURCE, "tags_for_key")
            .key_to_tags
            .get(key)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl TagIndex for MemoryTagIndex {
    async fn associate(&self, key: &str, tags: &BTreeSet<String>) -> StoreResult<()> {
        let mut mappings = rw_write(&self.mappings, SOURCE, "associate");
        mappings.unlink(key);
        if tags.is_empty() {
            return Ok(());
        }
        for tag in tags {
            mappings
                .tag_to_keys
                .entry(tag.clone())
                .or_default()
                .insert(key.to_string());
        }
        mappings.key_to_tags.insert(key.to_string(), tags.clone());
        Ok(())
    }

    async fn keys_for_tags(&self, tags: &[String]) -> StoreResult<BTreeSet<String>> {
        let mappings = rw_read(&self.mappings, SOURCE, "keys_for_tags");
        Ok(tags
            .iter()
            .filter_map(|tag| mappings.tag_to_keys.get(tag))
            .flatten()
            .cloned()
            .collect())
    }

    async fn forget(&self, keys: &[String]) -> StoreResult<()> {
        let mut mappings = rw_write(&self.mappings, SOURCE, "forget");
        for key in keys {
            mappings.unlink(key);
        }
        Ok(())
    }

    async fn clear(&self) -> StoreResult<()> {
        *rw_write(&self.mappings, SOURCE, "clear") = Mappings::default();
        Ok(())
    }

    async fn stats(&self) -> StoreResult<TagIndexStats> {
        let mappings = rw_read(&self.mappings, SOURCE, "stats");
        Ok(TagIndexStats {
            tags: mappings.tag_to_keys.len(),
            keys: mappings.key_to_tags.len(),
        })
    }
}
