//! Redis-backed queue.
//!
//! Key shapes:
//! - `queue:primary`  zset, score = priority composite (see `primary_score`)
//! - `queue:retry`    zset, score = `visible_at` epoch ms
//! - `queue:dead`     list of terminal envelopes
//! - `queue:inflight:<worker_id>` hash task_id -> lease deadline (epoch ms)
//! - `queue:workers`  set of worker ids with (possibly stale) inflight hashes
//! - `queue:tasks`    membership set backing duplicate-enqueue rejection
//! - `queue:msg:<task_id>` JSON envelope
//!
//! Every multi-step operation is a single Lua script so the broker is
//! the serialization point and a message is never in two places.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use deadpool_redis::{Config as PoolConfig, Pool, Runtime};
use redis::{AsyncCommands, Script, Value};
use uuid::Uuid;

use voidrunner_core::config::QueueConfig;
use voidrunner_core::models::QueueMessage;

use crate::backoff::retry_delay;
use crate::queue::{
    primary_score, NackOutcome, QueueDepths, QueueError, SweepReport, TaskQueue,
};

const PRIMARY_KEY: &str = "queue:primary";
const RETRY_KEY: &str = "queue:retry";
const DEAD_KEY: &str = "queue:dead";
const WORKERS_KEY: &str = "queue:workers";
const TASKS_KEY: &str = "queue:tasks";
const MSG_PREFIX: &str = "queue:msg:";
const INFLIGHT_PREFIX: &str = "queue:inflight:";

// KEYS: primary, tasks. ARGV: task_id, score, payload, depth_cap, msg_prefix
const ENQUEUE_LUA: &str = r#"
if redis.call('ZCARD', KEYS[1]) >= tonumber(ARGV[4]) then
  return 'FULL'
end
if redis.call('SISMEMBER', KEYS[2], ARGV[1]) == 1 then
  return 'DUP'
end
redis.call('SADD', KEYS[2], ARGV[1])
redis.call('SET', ARGV[5] .. ARGV[1], ARGV[3])
redis.call('ZADD', KEYS[1], ARGV[2], ARGV[1])
return 'OK'
"#;

// KEYS: primary, inflight:<worker>, workers, tasks
// ARGV: lease_expires_ms, worker_id, msg_prefix
const LEASE_LUA: &str = r#"
while true do
  local popped = redis.call('ZPOPMIN', KEYS[1])
  if #popped == 0 then
    return false
  end
  local task_id = popped[1]
  local payload = redis.call('GET', ARGV[3] .. task_id)
  if payload then
    redis.call('HSET', KEYS[2], task_id, ARGV[1])
    redis.call('SADD', KEYS[3], ARGV[2])
    return {task_id, payload}
  end
  -- Orphaned index entry without an envelope; drop and keep popping.
  redis.call('SREM', KEYS[4], task_id)
end
"#;

// KEYS: inflight:<worker>, tasks. ARGV: task_id, msg_prefix
const ACK_LUA: &str = r#"
if redis.call('HDEL', KEYS[1], ARGV[1]) == 0 then
  return 'EXPIRED'
end
redis.call('DEL', ARGV[2] .. ARGV[1])
redis.call('SREM', KEYS[2], ARGV[1])
return 'OK'
"#;

// KEYS: inflight:<worker>, retry, dead, tasks
// ARGV: task_id, payload, visible_at_ms, to_dead, msg_prefix
const NACK_LUA: &str = r#"
if redis.call('HDEL', KEYS[1], ARGV[1]) == 0 then
  return 'EXPIRED'
end
if ARGV[4] == '1' then
  redis.call('DEL', ARGV[5] .. ARGV[1])
  redis.call('SREM', KEYS[4], ARGV[1])
  redis.call('RPUSH', KEYS[3], ARGV[2])
  return 'DEAD'
end
redis.call('SET', ARGV[5] .. ARGV[1], ARGV[2])
redis.call('ZADD', KEYS[2], ARGV[3], ARGV[1])
return 'RETRY'
"#;

// KEYS: inflight:<worker>. ARGV: task_id, lease_expires_ms
const EXTEND_LUA: &str = r#"
if redis.call('HEXISTS', KEYS[1], ARGV[1]) == 0 then
  return 'EXPIRED'
end
redis.call('HSET', KEYS[1], ARGV[1], ARGV[2])
return 'OK'
"#;

// KEYS: primary, retry, tasks. ARGV: task_id, msg_prefix
const REMOVE_LUA: &str = r#"
local removed = redis.call('ZREM', KEYS[1], ARGV[1]) + redis.call('ZREM', KEYS[2], ARGV[1])
if removed > 0 then
  redis.call('DEL', ARGV[2] .. ARGV[1])
  redis.call('SREM', KEYS[3], ARGV[1])
  return 1
end
return 0
"#;

// Promote due retries, then reclaim expired leases. Reclaimed envelopes
// are nacked on behalf of the crashed worker with deterministic backoff
// (jitter matters for live retries, not for crash recovery).
// KEYS: retry, primary, dead, workers, tasks
// ARGV: now_ms, msg_prefix, inflight_prefix, base_secs, cap_secs
const SWEEP_LUA: &str = r#"
local now = tonumber(ARGV[1])
local promoted = 0
local reclaimed = 0
local dead = {}

local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', now)
for _, task_id in ipairs(due) do
  redis.call('ZREM', KEYS[1], task_id)
  local payload = redis.call('GET', ARGV[2] .. task_id)
  if payload then
    local msg = cjson.decode(payload)
    local score = (10 - msg.priority) * 1e13 + msg.enqueued_at
    redis.call('ZADD', KEYS[2], score, task_id)
    promoted = promoted + 1
  else
    redis.call('SREM', KEYS[5], task_id)
  end
end

local workers = redis.call('SMEMBERS', KEYS[4])
for _, worker in ipairs(workers) do
  local inflight_key = ARGV[3] .. worker
  local entries = redis.call('HGETALL', inflight_key)
  for i = 1, #entries, 2 do
    local task_id = entries[i]
    local expires = tonumber(entries[i + 1])
    if expires < now then
      redis.call('HDEL', inflight_key, task_id)
      local payload = redis.call('GET', ARGV[2] .. task_id)
      if payload then
        local msg = cjson.decode(payload)
        msg.attempts = msg.attempts + 1
        if msg.attempts >= msg.max_attempts then
          redis.call('DEL', ARGV[2] .. task_id)
          redis.call('SREM', KEYS[5], task_id)
          redis.call('RPUSH', KEYS[3], cjson.encode(msg))
          table.insert(dead, task_id)
        else
          local delay = math.min(tonumber(ARGV[4]) * 2 ^ (msg.attempts - 1), tonumber(ARGV[5]))
          msg.visible_at = now + delay * 1000
          redis.call('SET', ARGV[2] .. task_id, cjson.encode(msg))
          redis.call('ZADD', KEYS[1], msg.visible_at, task_id)
          reclaimed = reclaimed + 1
        end
      else
        redis.call('SREM', KEYS[5], task_id)
      end
    end
  end
  if redis.call('HLEN', inflight_key) == 0 then
    redis.call('SREM', KEYS[4], worker)
  end
end

local result = {promoted, reclaimed}
for _, task_id in ipairs(dead) do
  table.insert(result, task_id)
end
return result
"#;

struct Scripts {
    enqueue: Script,
    lease: Script,
    ack: Script,
    nack: Script,
    extend: Script,
    remove: Script,
    sweep: Script,
}

impl Scripts {
    fn new() -> Self {
        Self {
            enqueue: Script::new(ENQUEUE_LUA),
            lease: Script::new(LEASE_LUA),
            ack: Script::new(ACK_LUA),
            nack: Script::new(NACK_LUA),
            extend: Script::new(EXTEND_LUA),
            remove: Script::new(REMOVE_LUA),
            sweep: Script::new(SWEEP_LUA),
        }
    }
}

pub struct RedisTaskQueue {
    pool: Pool,
    config: QueueConfig,
    scripts: Scripts,
}

impl RedisTaskQueue {
    pub fn new(config: QueueConfig) -> Result<Self, QueueError> {
        let pool = PoolConfig::from_url(&config.redis_url)
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| QueueError::Backend(format!("failed to create redis pool: {}", e)))?;
        Ok(Self {
            pool,
            config,
            scripts: Scripts::new(),
        })
    }

    async fn conn(&self) -> Result<deadpool_redis::Connection, QueueError> {
        self.pool
            .get()
            .await
            .map_err(|e| QueueError::Backend(format!("redis pool exhausted: {}", e)))
    }

    fn inflight_key(worker_id: &str) -> String {
        format!("{}{}", INFLIGHT_PREFIX, worker_id)
    }
}

fn backend(e: redis::RedisError) -> QueueError {
    QueueError::Backend(e.to_string())
}

#[async_trait]
impl TaskQueue for RedisTaskQueue {
    #[tracing::instrument(skip(self, msg), fields(task_id = %msg.task_id))]
    async fn enqueue(&self, msg: QueueMessage) -> Result<(), QueueError> {
        let mut conn = self.conn().await?;
        let payload = serde_json::to_string(&msg)?;
        let score = primary_score(msg.priority, msg.enqueued_at);

        let status: String = self
            .scripts
            .enqueue
            .key(PRIMARY_KEY)
            .key(TASKS_KEY)
            .arg(msg.task_id.to_string())
            .arg(score)
            .arg(payload)
            .arg(self.config.depth_cap)
            .arg(MSG_PREFIX)
            .invoke_async(&mut conn)
            .await
            .map_err(backend)?;

        match status.as_str() {
            "OK" => {
                tracing::debug!(priority = msg.priority, "Message enqueued");
                Ok(())
            }
            "FULL" => Err(QueueError::QueueFull),
            "DUP" => Err(QueueError::Duplicate(msg.task_id)),
            other => Err(QueueError::Backend(format!(
                "unexpected enqueue reply: {}",
                other
            ))),
        }
    }

    #[tracing::instrument(skip(self))]
    async fn lease(
        &self,
        worker_id: &str,
        lease: Duration,
    ) -> Result<Option<QueueMessage>, QueueError> {
        let mut conn = self.conn().await?;
        let expires = Utc::now().timestamp_millis() + lease.as_millis() as i64;

        let reply: Option<(String, String)> = self
            .scripts
            .lease
            .key(PRIMARY_KEY)
            .key(Self::inflight_key(worker_id))
            .key(WORKERS_KEY)
            .key(TASKS_KEY)
            .arg(expires)
            .arg(worker_id)
            .arg(MSG_PREFIX)
            .invoke_async(&mut conn)
            .await
            .map_err(backend)?;

        match reply {
            Some((task_id, payload)) => {
                let msg: QueueMessage = serde_json::from_str(&payload)?;
                tracing::debug!(task_id = %task_id, attempts = msg.attempts, "Message leased");
                Ok(Some(msg))
            }
            None => Ok(None),
        }
    }

    #[tracing::instrument(skip(self))]
    async fn ack(&self, worker_id: &str, task_id: Uuid) -> Result<(), QueueError> {
        let mut conn = self.conn().await?;
        let status: String = self
            .scripts
            .ack
            .key(Self::inflight_key(worker_id))
            .key(TASKS_KEY)
            .arg(task_id.to_string())
            .arg(MSG_PREFIX)
            .invoke_async(&mut conn)
            .await
            .map_err(backend)?;

        match status.as_str() {
            "OK" => Ok(()),
            _ => Err(QueueError::LeaseExpired(task_id)),
        }
    }

    #[tracing::instrument(skip(self, msg), fields(task_id = %msg.task_id))]
    async fn nack(
        &self,
        worker_id: &str,
        msg: &QueueMessage,
        reason: &str,
    ) -> Result<NackOutcome, QueueError> {
        let mut conn = self.conn().await?;

        let mut updated = msg.clone();
        updated.attempts = msg.attempts + 1;
        let to_dead = updated.attempts >= updated.max_attempts;
        if !to_dead {
            let delay = retry_delay(
                updated.attempts,
                Duration::from_secs(self.config.backoff_base_secs),
                Duration::from_secs(self.config.backoff_max_secs),
            );
            updated.visible_at = Utc::now()
                + chrono::Duration::milliseconds(delay.as_millis() as i64);
        }
        let payload = serde_json::to_string(&updated)?;

        let status: String = self
            .scripts
            .nack
            .key(Self::inflight_key(worker_id))
            .key(RETRY_KEY)
            .key(DEAD_KEY)
            .key(TASKS_KEY)
            .arg(msg.task_id.to_string())
            .arg(payload)
            .arg(updated.visible_at.timestamp_millis())
            .arg(if to_dead { "1" } else { "0" })
            .arg(MSG_PREFIX)
            .invoke_async(&mut conn)
            .await
            .map_err(backend)?;

        match status.as_str() {
            "RETRY" => {
                tracing::info!(
                    attempts = updated.attempts,
                    visible_at = %updated.visible_at,
                    reason = reason,
                    "Message nacked to retry"
                );
                Ok(NackOutcome::Retried {
                    visible_at: updated.visible_at,
                })
            }
            "DEAD" => {
                tracing::warn!(
                    attempts = updated.attempts,
                    reason = reason,
                    "Message dead-lettered"
                );
                Ok(NackOutcome::DeadLettered)
            }
            _ => Err(QueueError::LeaseExpired(msg.task_id)),
        }
    }

    #[tracing::instrument(skip(self))]
    async fn extend_lease(
        &self,
        worker_id: &str,
        task_id: Uuid,
        lease: Duration,
    ) -> Result<(), QueueError> {
        let mut conn = self.conn().await?;
        let expires = Utc::now().timestamp_millis() + lease.as_millis() as i64;
        let status: String = self
            .scripts
            .extend
            .key(Self::inflight_key(worker_id))
            .arg(task_id.to_string())
            .arg(expires)
            .invoke_async(&mut conn)
            .await
            .map_err(backend)?;

        match status.as_str() {
            "OK" => Ok(()),
            _ => Err(QueueError::LeaseExpired(task_id)),
        }
    }

    #[tracing::instrument(skip(self))]
    async fn remove(&self, task_id: Uuid) -> Result<bool, QueueError> {
        let mut conn = self.conn().await?;
        let removed: i64 = self
            .scripts
            .remove
            .key(PRIMARY_KEY)
            .key(RETRY_KEY)
            .key(TASKS_KEY)
            .arg(task_id.to_string())
            .arg(MSG_PREFIX)
            .invoke_async(&mut conn)
            .await
            .map_err(backend)?;
        Ok(removed == 1)
    }

    #[tracing::instrument(skip(self))]
    async fn sweep(&self) -> Result<SweepReport, QueueError> {
        let mut conn = self.conn().await?;
        let reply: Value = self
            .scripts
            .sweep
            .key(RETRY_KEY)
            .key(PRIMARY_KEY)
            .key(DEAD_KEY)
            .key(WORKERS_KEY)
            .key(TASKS_KEY)
            .arg(Utc::now().timestamp_millis())
            .arg(MSG_PREFIX)
            .arg(INFLIGHT_PREFIX)
            .arg(self.config.backoff_base_secs)
            .arg(self.config.backoff_max_secs)
            .invoke_async(&mut conn)
            .await
            .map_err(backend)?;

        parse_sweep_reply(reply)
    }

    #[tracing::instrument(skip(self))]
    async fn dead_letters(&self, limit: usize) -> Result<Vec<QueueMessage>, QueueError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.conn().await?;
        let raw: Vec<String> = conn
            .lrange(DEAD_KEY, -(limit as isize), -1)
            .await
            .map_err(backend)?;
        let mut messages = Vec::with_capacity(raw.len());
        for payload in raw {
            messages.push(serde_json::from_str(&payload)?);
        }
        Ok(messages)
    }

    async fn depths(&self) -> Result<QueueDepths, QueueError> {
        let mut conn = self.conn().await?;
        let primary: u64 = conn.zcard(PRIMARY_KEY).await.map_err(backend)?;
        let retry: u64 = conn.zcard(RETRY_KEY).await.map_err(backend)?;
        let dead: u64 = conn.llen(DEAD_KEY).await.map_err(backend)?;
        let workers: Vec<String> = conn.smembers(WORKERS_KEY).await.map_err(backend)?;
        let mut inflight = 0u64;
        for worker in workers {
            let held: u64 = conn
                .hlen(Self::inflight_key(&worker))
                .await
                .map_err(backend)?;
            inflight += held;
        }
        Ok(QueueDepths {
            primary,
            retry,
            dead,
            inflight,
        })
    }

    async fn ping(&self) -> Result<(), QueueError> {
        let mut conn = self.conn().await?;
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(backend)?;
        Ok(())
    }
}

fn parse_sweep_reply(reply: Value) -> Result<SweepReport, QueueError> {
    let items = match reply {
        Value::Array(items) => items,
        other => {
            return Err(QueueError::Backend(format!(
                "unexpected sweep reply: {:?}",
                other
            )))
        }
    };
    let mut report = SweepReport::default();
    for (index, item) in items.into_iter().enumerate() {
        match (index, item) {
            (0, Value::Int(n)) => report.promoted = n.max(0) as u64,
            (1, Value::Int(n)) => report.reclaimed = n.max(0) as u64,
            (_, Value::BulkString(bytes)) => {
                let raw = String::from_utf8_lossy(&bytes).to_string();
                let task_id = raw.parse::<Uuid>().map_err(|e| {
                    QueueError::Backend(format!("sweep returned bad task id {}: {}", raw, e))
                })?;
                report.dead_lettered.push(task_id);
            }
            (i, other) => {
                return Err(QueueError::Backend(format!(
                    "unexpected sweep reply element {}: {:?}",
                    i, other
                )))
            }
        }
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sweep_reply_parses_counts_and_ids() {
        let id = Uuid::new_v4();
        let reply = Value::Array(vec![
            Value::Int(3),
            Value::Int(1),
            Value::BulkString(id.to_string().into_bytes()),
        ]);
        let report = parse_sweep_reply(reply).unwrap();
        assert_eq!(report.promoted, 3);
        assert_eq!(report.reclaimed, 1);
        assert_eq!(report.dead_lettered, vec![id]);
    }

    #[test]
    fn sweep_reply_rejects_garbage() {
        assert!(parse_sweep_reply(Value::Int(7)).is_err());
        let reply = Value::Array(vec![
            Value::Int(0),
            Value::Int(0),
            Value::BulkString(b"not-a-uuid".to_vec()),
        ]);
        assert!(parse_sweep_reply(reply).is_err());
    }
}
