//! Redis-backed store and tag index, shared by every instance.
//!
//! Key layout under the configured namespace `ns`:
//!
//! - `ns:entry:<key>`: JSON-encoded [`CacheEntry`], expiring at `stale_until`
//! - `ns:tag:<tag>`: set of keys recorded under the tag, expiring no earlier
//!   than its longest-lived member
//! - `ns:keytags:<key>`: set of tags recorded for the key, expiring with the entry
//! - `ns:lock:<key>`: fill lock token
//!
//! The connection is opened on first use. While Redis is unreachable every
//! operation fails with [`StoreError::Unavailable`] and reconnects are
//! attempted at most once per [`RECONNECT_BACKOFF`].

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Pipeline, RedisError, RedisResult, Script};
use time::OffsetDateTime;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::entry::{CacheEntry, Freshness};
use super::lock::mutex_lock;
use super::store::{CacheStore, FillLock, StoreError, StoreResult};
use super::tags::{TagIndex, TagIndexStats};

const SOURCE: &str = "cache::redis";
const SCAN_BATCH: usize = 200;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
pub const RECONNECT_BACKOFF: Duration = Duration::from_secs(5);

const RELEASE_LOCK: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
end
return 0
"#;

/// KEYS: entry, keytags, new tag sets. ARGV: tag key prefix, key, tags.
/// Unlinks the previous tags, then records the new ones if the entry is live.
const ASSOCIATE: &str = r#"
local previous = redis.call("SMEMBERS", KEYS[2])
for _, tag in ipairs(previous) do
    redis.call("SREM", ARGV[1] .. tag, ARGV[2])
end
redis.call("DEL", KEYS[2])

local ttl = redis.call("PTTL", KEYS[1])
if ttl < 0 or #KEYS < 3 then
    return 0
end
for i = 3, #KEYS do
    redis.call("SADD", KEYS[i], ARGV[2])
    if redis.call("PTTL", KEYS[i]) < ttl then
        redis.call("PEXPIRE", KEYS[i], ttl)
    end
    redis.call("SADD", KEYS[2], ARGV[i])
end
redis.call("PEXPIRE", KEYS[2], ttl)
return #KEYS - 2
"#;

/// KEYS: tag sets. ARGV: entry key prefix.
/// Returns the members whose entry still exists and drops the rest.
const LIVE_MEMBERS: &str = r#"
local live = {}
local found = {}
for _, tag_key in ipairs(KEYS) do
    for _, member in ipairs(redis.call("SMEMBERS", tag_key)) do
        if redis.call("EXISTS", ARGV[1] .. member) == 1 then
            if not live[member] then
                live[member] = true
                table.insert(found, member)
            end
        else
            redis.call("SREM", tag_key, member)
        end
    end
end
return found
"#;

impl From<RedisError> for StoreError {
    fn from(err: RedisError) -> Self {
        StoreError::Unavailable(err.to_string())
    }
}

#[derive(Clone)]
struct Namespace(String);

impl Namespace {
    fn entry(&self, key: &str) -> String {
        format!("{}:entry:{key}", self.0)
    }

    fn entry_prefix(&self) -> String {
        format!("{}:entry:", self.0)
    }

    fn tag(&self, tag: &str) -> String {
        format!("{}:tag:{tag}", self.0)
    }

    fn tag_prefix(&self) -> String {
        format!("{}:tag:", self.0)
    }

    fn key_tags(&self, key: &str) -> String {
        format!("{}:keytags:{key}", self.0)
    }

    fn lock(&self, key: &str) -> String {
        format!("{}:lock:{key}", self.0)
    }

    fn pattern(&self, section: &str, prefix: &str) -> String {
        format!("{}:{section}:{}*", escape_glob(&self.0), escape_glob(prefix))
    }
}

/// Escape the characters Redis `MATCH` patterns treat specially.
fn escape_glob(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for ch in raw.chars() {
        if matches!(ch, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}

/// Collect every key matching `pattern` with non-blocking `SCAN`.
async fn scan_keys(conn: &mut ConnectionManager, pattern: &str) -> RedisResult<Vec<String>> {
    let mut cursor: u64 = 0;
    let mut found = Vec::new();
    loop {
        let (next_cursor, keys): (u64, Vec<String>) = redis::cmd("SCAN")
            .arg(cursor)
            .arg("MATCH")
            .arg(pattern)
            .arg("COUNT")
            .arg(SCAN_BATCH)
            .query_async(conn)
            .await?;
        found.extend(keys);
        cursor = next_cursor;
        if cursor == 0 {
            break;
        }
    }
    Ok(found)
}

async fn delete_keys(conn: &mut ConnectionManager, keys: &[String]) -> RedisResult<()> {
    for chunk in keys.chunks(SCAN_BATCH) {
        let mut pipe = Pipeline::new();
        for key in chunk {
            pipe.del(key).ignore();
        }
        pipe.query_async::<_, ()>(conn).await?;
    }
    Ok(())
}

/// Shared Redis connection, established lazily and re-attempted after failures.
#[derive(Clone)]
pub struct RedisConnection {
    inner: Arc<ConnectionState>,
}

struct ConnectionState {
    client: redis::Client,
    conn: OnceCell<ConnectionManager>,
    retry_after: Mutex<Option<Instant>>,
}

impl RedisConnection {
    /// Validate `url` without connecting.
    pub fn open(url: &str) -> StoreResult<Self> {
        let client = redis::Client::open(url)?;
        Ok(Self {
            inner: Arc::new(ConnectionState {
                client,
                conn: OnceCell::new(),
                retry_after: Mutex::new(None),
            }),
        })
    }

    /// A handle on the multiplexed connection, connecting first if needed.
    pub async fn get(&self) -> StoreResult<ConnectionManager> {
        if let Some(conn) = self.inner.conn.get() {
            return Ok(conn.clone());
        }
        let retry_after = *mutex_lock(&self.inner.retry_after, SOURCE, "backoff");
        if retry_after.is_some_and(|at| Instant::now() < at) {
            return Err(StoreError::Unavailable(
                "redis unreachable; waiting before reconnecting".to_string(),
            ));
        }

        let client = self.inner.client.clone();
        let connected = self
            .inner
            .conn
            .get_or_try_init(|| async move {
                match tokio::time::timeout(CONNECT_TIMEOUT, ConnectionManager::new(client)).await {
                    Ok(result) => {
                        let conn = result?;
                        info!(cache = "redis", "Connected to Redis");
                        Ok::<_, StoreError>(conn)
                    }
                    Err(_) => Err(StoreError::Unavailable(format!(
                        "redis connect timed out after {}ms",
                        CONNECT_TIMEOUT.as_millis()
                    ))),
                }
            })
            .await;

        match connected {
            Ok(conn) => {
                *mutex_lock(&self.inner.retry_after, SOURCE, "backoff") = None;
                Ok(conn.clone())
            }
            Err(err) => {
                *mutex_lock(&self.inner.retry_after, SOURCE, "backoff") =
                    Some(Instant::now() + RECONNECT_BACKOFF);
                warn!(
                    cache = "redis",
                    error = %err,
                    retry_in_ms = RECONNECT_BACKOFF.as_millis() as u64,
                    "Redis unreachable; cache lookups fall through to producers"
                );
                Err(err)
            }
        }
    }
}

pub struct RedisStore {
    conn: RedisConnection,
    ns: Namespace,
}

impl RedisStore {
    pub fn new(conn: RedisConnection, namespace: &str) -> Self {
        Self {
            conn,
            ns: Namespace(namespace.to_string()),
        }
    }

    /// A handle on the same lazily established connection.
    pub fn connection(&self) -> RedisConnection {
        self.conn.clone()
    }
}

#[async_trait]
impl CacheStore for RedisStore {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn get(&self, key: &str) -> StoreResult<Option<CacheEntry>> {
        let mut conn = self.conn.get().await?;
        let entry_key = self.ns.entry(key);
        let raw: Option<String> = conn.get(&entry_key).await?;
        let Some(raw) = raw else {
            return Ok(None);
        };

        match serde_json::from_str::<CacheEntry>(&raw) {
            Ok(entry) if entry.freshness(OffsetDateTime::now_utc()) == Freshness::Expired => {
                Ok(None)
            }
            Ok(entry) => Ok(Some(entry)),
            Err(err) => {
                warn!(cache = "redis", key, error = %err, "Dropping undecodable entry");
                conn.del::<_, ()>(&entry_key).await?;
                Ok(None)
            }
        }
    }

    async fn put(&self, entry: CacheEntry) -> StoreResult<Vec<String>> {
        let retention_ms = entry.retention_ms(OffsetDateTime::now_utc());
        if retention_ms == 0 {
            return Ok(Vec::new());
        }
        let encoded =
            serde_json::to_string(&entry).map_err(|err| StoreError::Encoding(err.to_string()))?;

        let mut conn = self.conn.get().await?;
        redis::cmd("SET")
            .arg(self.ns.entry(&entry.key))
            .arg(encoded)
            .arg("PX")
            .arg(retention_ms)
            .query_async::<_, ()>(&mut conn)
            .await?;
        debug!(cache = "redis", key = %entry.key, retention_ms, "Stored entry");
        Ok(Vec::new())
    }

    async fn remove(&self, keys: &[String]) -> StoreResult<usize> {
        if keys.is_empty() {
            return Ok(0);
        }
        let entry_keys: Vec<String> = keys.iter().map(|key| self.ns.entry(key)).collect();
        let mut conn = self.conn.get().await?;
        let removed: usize = conn.del(entry_keys).await?;
        Ok(removed)
    }

    async fn remove_prefix(&self, prefix: &str) -> StoreResult<Vec<String>> {
        let mut conn = self.conn.get().await?;
        let found = scan_keys(&mut conn, &self.ns.pattern("entry", prefix)).await?;
        delete_keys(&mut conn, &found).await?;

        let entry_prefix = self.ns.entry_prefix();
        Ok(found
            .into_iter()
            .filter_map(|key| key.strip_prefix(&entry_prefix).map(str::to_string))
            .collect())
    }

    async fn clear(&self) -> StoreResult<()> {
        let mut conn = self.conn.get().await?;
        let found = scan_keys(&mut conn, &self.ns.pattern("entry", "")).await?;
        delete_keys(&mut conn, &found).await?;
        Ok(())
    }

    async fn acquire_fill_lock(&self, key: &str, lease: Duration) -> StoreResult<FillLock> {
        let token = Uuid::new_v4().to_string();
        let lease_ms = u64::try_from(lease.as_millis()).unwrap_or(u64::MAX).max(1);
        let mut conn = self.conn.get().await?;
        let acquired: Option<String> = redis::cmd("SET")
            .arg(self.ns.lock(key))
            .arg(&token)
            .arg("NX")
            .arg("PX")
            .arg(lease_ms)
            .query_async(&mut conn)
            .await?;
        Ok(match acquired {
            Some(_) => FillLock::Acquired(Some(token)),
            None => FillLock::Contended,
        })
    }

    async fn release_fill_lock(&self, key: &str, token: String) -> StoreResult<()> {
        let mut conn = self.conn.get().await?;
        Script::new(RELEASE_LOCK)
            .key(self.ns.lock(key))
            .arg(token)
            .invoke_async::<_, i32>(&mut conn)
            .await?;
        Ok(())
    }
}

pub struct RedisTagIndex {
    conn: RedisConnection,
    ns: Namespace,
}

impl RedisTagIndex {
    pub fn new(conn: RedisConnection, namespace: &str) -> Self {
        Self {
            conn,
            ns: Namespace(namespace.to_string()),
        }
    }

    /// Queue removal of `key` from every tag set it was recorded in.
    async fn queue_unlink(
        &self,
        conn: &mut ConnectionManager,
        pipe: &mut Pipeline,
        key: &str,
    ) -> RedisResult<()> {
        let key_tags = self.ns.key_tags(key);
        let previous: Vec<String> = conn.smembers(&key_tags).await?;
        for tag in previous {
            pipe.srem(self.ns.tag(&tag), key).ignore();
        }
        pipe.del(key_tags).ignore();
        Ok(())
    }
}

#[async_trait]
impl TagIndex for RedisTagIndex {
    /// Mappings expire with the entry; a key without a live entry is only unlinked.
    async fn associate(&self, key: &str, tags: &BTreeSet<String>) -> StoreResult<()> {
        let mut conn = self.conn.get().await?;
        let script = Script::new(ASSOCIATE);
        let mut invocation = script.prepare_invoke();
        invocation
            .key(self.ns.entry(key))
            .key(self.ns.key_tags(key))
            .arg(self.ns.tag_prefix())
            .arg(key);
        for tag in tags {
            invocation.key(self.ns.tag(tag)).arg(tag);
        }
        invocation.invoke_async::<_, i64>(&mut conn).await?;
        Ok(())
    }

    async fn keys_for_tags(&self, tags: &[String]) -> StoreResult<BTreeSet<String>> {
        if tags.is_empty() {
            return Ok(BTreeSet::new());
        }
        let mut conn = self.conn.get().await?;
        let script = Script::new(LIVE_MEMBERS);
        let mut invocation = script.prepare_invoke();
        for tag in tags {
            invocation.key(self.ns.tag(tag));
        }
        invocation.arg(self.ns.entry_prefix());
        let keys: Vec<String> = invocation.invoke_async(&mut conn).await?;
        Ok(keys.into_iter().collect())
    }

    async fn forget(&self, keys: &[String]) -> StoreResult<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.get().await?;
        let mut pipe = Pipeline::new();
        pipe.atomic();
        for key in keys {
            self.queue_unlink(&mut conn, &mut pipe, key).await?;
        }
        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    async fn clear(&self) -> StoreResult<()> {
        let mut conn = self.conn.get().await?;
        let mut found = scan_keys(&mut conn, &self.ns.pattern("tag", "")).await?;
        found.extend(scan_keys(&mut conn, &self.ns.pattern("keytags", "")).await?);
        delete_keys(&mut conn, &found).await?;
        Ok(())
    }

    async fn stats(&self) -> StoreResult<TagIndexStats> {
        let mut conn = self.conn.get().await?;
        let tags = scan_keys(&mut conn, &self.ns.pattern("tag", "")).await?;
        let keys = scan_keys(&mut conn, &self.ns.pattern("keytags", "")).await?;
        Ok(TagIndexStats {
            tags: tags.len(),
            keys: keys.len(),
        })
    }
}
