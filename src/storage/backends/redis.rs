//! Redis key-value store and queue
//!
//! Records are stored as JSON strings under `{prefix}{table}:{key}`.
//! Conditional writes run as Lua scripts so the check and the write happen
//! in one server-side step.

use async_trait::async_trait;
use deadpool_redis::{Config, Pool, PoolConfig, Runtime};
use redis::{AsyncCommands, RedisError, Script};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::RedisConfig;
use crate::storage::{
    error::{StorageError, StorageResult},
    traits::{KeyValueStore, MessageQueue},
    types::{Condition, QueueMessage, Record, Table},
};

const CHECK_FN: &str = r#"
local function check(cond, rec)
  if cond.op == 'not_exists' then return rec == nil end
  if cond.op == 'exists' then return rec ~= nil end
  if cond.op == 'field_equals' then
    if rec == nil then return false end
    local v = rec[cond.field]
    if v == nil or v == cjson.null then return cond.value == nil or cond.value == cjson.null end
    if cond.value == nil or cond.value == cjson.null then return false end
    return cjson.encode(v) == cjson.encode(cond.value)
  end
  if cond.op == 'all' then
    for _, c in ipairs(cond.conditions) do
      if not check(c, rec) then return false end
    end
    return true
  end
  return false
end
"#;

const UPDATE_BODY: &str = r#"
local raw = redis.call('GET', KEYS[1])
if not raw then return redis.error_reply('NOT_FOUND') end
local rec = cjson.decode(raw)
if not check(cjson.decode(ARGV[2]), rec) then return redis.error_reply('CONFLICT') end
for k, v in pairs(cjson.decode(ARGV[1])) do
  if v == cjson.null then rec[k] = nil else rec[k] = v end
end
local out = cjson.encode(rec)
local ttl = tonumber(ARGV[3])
if ttl > 0 then
  redis.call('SET', KEYS[1], out, 'PX', ttl)
else
  redis.call('SET', KEYS[1], out, 'KEEPTTL')
end
return out
"#;

const DELETE_BODY: &str = r#"
local raw = redis.call('GET', KEYS[1])
if not raw then return redis.error_reply('NOT_FOUND') end
if ARGV[1] ~= '' then
  if not check(cjson.decode(ARGV[1]), cjson.decode(raw)) then
    return redis.error_reply('CONFLICT')
  end
end
redis.call('DEL', KEYS[1])
return 1
"#;

fn map_redis_error(context: &str, e: RedisError) -> StorageError {
    match e.code() {
        Some("CONFLICT") => StorageError::conflict(context),
        Some("NOT_FOUND") => StorageError::not_found(context),
        _ if e.is_io_error() || e.is_timeout() || e.is_connection_dropped() => {
            StorageError::unavailable(format!("{}: {}", context, e))
        }
        _ => StorageError::Other(anyhow::anyhow!("{}: {}", context, e)),
    }
}

/// Create a connection pool from config
async fn create_pool(config: &RedisConfig) -> StorageResult<Pool> {
    let mut pool_config = Config::from_url(&config.url);
    let mut pool = PoolConfig::new(config.pool_size);
    pool.timeouts.wait = Some(Duration::from_secs(10));
    pool.timeouts.create = Some(Duration::from_secs(10));
    pool.timeouts.recycle = Some(Duration::from_secs(10));
    pool_config.pool = Some(pool);

    let pool = pool_config
        .create_pool(Some(Runtime::Tokio1))
        .map_err(|e| StorageError::connection(format!("Failed to create Redis pool: {}", e)))?;

    // Test connection
    let mut conn = pool
        .get()
        .await
        .map_err(|e| StorageError::connection(format!("Failed to connect to Redis: {}", e)))?;
    let pong: String = redis::cmd("PING")
        .query_async(&mut conn)
        .await
        .map_err(|e| map_redis_error("PING", e))?;
    debug!("Redis responded to PING with {}", pong);

    Ok(pool)
}

/// Redis-backed key-value store
pub struct RedisKeyValueStore {
    pool: Arc<Pool>,
    key_prefix: String,
    update_script: Script,
    delete_script: Script,
}

impl RedisKeyValueStore {
    /// Create new Redis key-value store
    pub async fn new(config: &RedisConfig) -> StorageResult<Self> {
        info!("Initializing Redis key-value store");
        let pool = create_pool(config).await?;

        Ok(Self {
            pool: Arc::new(pool),
            key_prefix: config.key_prefix.clone(),
            update_script: Script::new(&format!("{}{}", CHECK_FN, UPDATE_BODY)),
            delete_script: Script::new(&format!("{}{}", CHECK_FN, DELETE_BODY)),
        })
    }

    /// Generate key with prefix
    fn make_key(&self, table: Table, key: &str) -> String {
        format!("{}{}:{}", self.key_prefix, table, key)
    }

    async fn conn(&self) -> StorageResult<deadpool_redis::Connection> {
        self.pool
            .get()
            .await
            .map_err(|e| StorageError::connection(e.to_string()))
    }

    fn encode(record: &Record) -> StorageResult<String> {
        serde_json::to_string(record).map_err(StorageError::serialization)
    }

    fn decode(raw: &str) -> StorageResult<Record> {
        // cjson encodes an empty table as `{}` but may also emit `[]`
        if raw == "[]" {
            return Ok(Record::new());
        }
        serde_json::from_str(raw).map_err(StorageError::serialization)
    }
}

#[async_trait]
impl KeyValueStore for RedisKeyValueStore {
    async fn get(&self, table: Table, key: &str) -> StorageResult<Option<Record>> {
        let redis_key = self.make_key(table, key);
        let mut conn = self.conn().await?;
        let raw: Option<String> = conn
            .get(&redis_key)
            .await
            .map_err(|e| map_redis_error(&redis_key, e))?;
        raw.as_deref().map(Self::decode).transpose()
    }

    async fn put(
        &self,
        table: Table,
        key: &str,
        record: Record,
        ttl: Option<Duration>,
    ) -> StorageResult<()> {
        let redis_key = self.make_key(table, key);
        let value = Self::encode(&record)?;
        let mut conn = self.conn().await?;

        let mut cmd = redis::cmd("SET");
        cmd.arg(&redis_key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl.as_millis() as u64);
        }
        let _: () = cmd
            .query_async(&mut conn)
            .await
            .map_err(|e| map_redis_error(&redis_key, e))?;
        Ok(())
    }

    async fn put_if_absent(
        &self,
        table: Table,
        key: &str,
        record: Record,
        ttl: Option<Duration>,
    ) -> StorageResult<()> {
        let redis_key = self.make_key(table, key);
        let value = Self::encode(&record)?;
        let mut conn = self.conn().await?;

        let mut cmd = redis::cmd("SET");
        cmd.arg(&redis_key).arg(value).arg("NX");
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl.as_millis() as u64);
        }
        let created: Option<String> = cmd
            .query_async(&mut conn)
            .await
            .map_err(|e| map_redis_error(&redis_key, e))?;

        match created {
            Some(_) => Ok(()),
            None => Err(StorageError::conflict(format!(
                "Record already exists: {}",
                redis_key
            ))),
        }
    }

    async fn update_if(
        &self,
        table: Table,
        key: &str,
        changes: Record,
        condition: Condition,
        ttl: Option<Duration>,
    ) -> StorageResult<Record> {
        let redis_key = self.make_key(table, key);
        let changes = Self::encode(&changes)?;
        let condition = serde_json::to_string(&condition)?;
        let ttl_ms = ttl.map(|t| t.as_millis() as u64).unwrap_or(0);
        let mut conn = self.conn().await?;

        let raw: String = self
            .update_script
            .key(&redis_key)
            .arg(changes)
            .arg(condition)
            .arg(ttl_ms)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| map_redis_error(&redis_key, e))?;

        Self::decode(&raw)
    }

    async fn delete(
        &self,
        table: Table,
        key: &str,
        condition: Option<Condition>,
    ) -> StorageResult<()> {
        let redis_key = self.make_key(table, key);
        let condition = match condition {
            Some(c) => serde_json::to_string(&c)?,
            None => String::new(),
        };
        let mut conn = self.conn().await?;

        let _: i64 = self
            .delete_script
            .key(&redis_key)
            .arg(condition)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| map_redis_error(&redis_key, e))?;
        Ok(())
    }

    async fn scan_keys(&self, table: Table) -> StorageResult<Vec<String>> {
        let prefix = self.make_key(table, "");
        let pattern = format!("{}*", prefix);
        let mut conn = self.conn().await?;

        let mut keys = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(500)
                .query_async(&mut conn)
                .await
                .map_err(|e| map_redis_error(&pattern, e))?;

            keys.extend(
                batch
                    .into_iter()
                    .filter_map(|k| k.strip_prefix(&prefix).map(str::to_string)),
            );
            if next == 0 {
                break;
            }
            cursor = next;
        }

        keys.sort();
        keys.dedup();
        Ok(keys)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct QueuedBody {
    id: String,
    body: String,
}

/// Redis list-backed queue
///
/// Received messages move to a processing list and stay there until deleted.
/// `recover_in_flight` pushes them back after a consumer crash.
pub struct RedisQueue {
    pool: Arc<Pool>,
    queue_key: String,
    processing_key: String,
}

impl RedisQueue {
    pub async fn new(config: &RedisConfig, queue_name: &str) -> StorageResult<Self> {
        info!("Initializing Redis queue {}", queue_name);
        let pool = create_pool(config).await?;
        let queue_key = format!("{}queue:{}", config.key_prefix, queue_name);

        Ok(Self {
            pool: Arc::new(pool),
            processing_key: format!("{}:processing", queue_key),
            queue_key,
        })
    }

    async fn conn(&self) -> StorageResult<deadpool_redis::Connection> {
        self.pool
            .get()
            .await
            .map_err(|e| StorageError::connection(e.to_string()))
    }

    /// Move every unacknowledged message back to the ready list
    pub async fn recover_in_flight(&self) -> StorageResult<usize> {
        let mut conn = self.conn().await?;
        let mut moved = 0;
        loop {
            let item: Option<String> = redis::cmd("RPOPLPUSH")
                .arg(&self.processing_key)
                .arg(&self.queue_key)
                .query_async(&mut conn)
                .await
                .map_err(|e| map_redis_error(&self.processing_key, e))?;
            if item.is_none() {
                break;
            }
            moved += 1;
        }
        if moved > 0 {
            warn!("Recovered {} unacknowledged messages", moved);
        }
        Ok(moved)
    }
}

#[async_trait]
impl MessageQueue for RedisQueue {
    async fn send(&self, body: String) -> StorageResult<String> {
        let id = Uuid::new_v4().to_string();
        let payload = serde_json::to_string(&QueuedBody {
            id: id.clone(),
            body,
        })?;
        let mut conn = self.conn().await?;
        let _: i64 = conn
            .lpush(&self.queue_key, payload)
            .await
            .map_err(|e| map_redis_error(&self.queue_key, e))?;
        Ok(id)
    }

    async fn receive(
        &self,
        max_messages: usize,
        wait: Duration,
    ) -> StorageResult<Vec<QueueMessage>> {
        let mut conn = self.conn().await?;
        let mut raw_items = Vec::new();

        let wait_secs = wait.as_secs_f64().max(0.1);
        let first: Option<String> = redis::cmd("BRPOPLPUSH")
            .arg(&self.queue_key)
            .arg(&self.processing_key)
            .arg(wait_secs)
            .query_async(&mut conn)
            .await
            .map_err(|e| map_redis_error(&self.queue_key, e))?;

        if let Some(item) = first {
            raw_items.push(item);
            while raw_items.len() < max_messages {
                let next: Option<String> = redis::cmd("RPOPLPUSH")
                    .arg(&self.queue_key)
                    .arg(&self.processing_key)
                    .query_async(&mut conn)
                    .await
                    .map_err(|e| map_redis_error(&self.queue_key, e))?;
                match next {
                    Some(item) => raw_items.push(item),
                    None => break,
                }
            }
        }

        raw_items
            .into_iter()
            .map(|raw| {
                let queued: QueuedBody = serde_json::from_str(&raw)?;
                Ok(QueueMessage {
                    receipt: raw,
                    body: queued.body,
                    receive_count: 1,
                })
            })
            .collect()
    }

    async fn delete(&self, receipt: &str) -> StorageResult<()> {
        let mut conn = self.conn().await?;
        let removed: i64 = conn
            .lrem(&self.processing_key, 1, receipt)
            .await
            .map_err(|e| map_redis_error(&self.processing_key, e))?;
        if removed == 0 {
            return Err(StorageError::not_found("Receipt not in flight"));
        }
        Ok(())
    }
}
