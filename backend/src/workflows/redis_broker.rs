//! Redis-backed reliable queue.
//!
//! Layout under the configured queue name:
//! - `{name}:pending` list of task payloads, pushed left and popped from the right
//! - `{name}:receipts` hash of lease token to leased payload
//! - `{name}:leases` zset of lease tokens scored by visibility deadline (ms)
//! - `{name}:attempts` hash of task id to redelivery count
//!
//! Every lease gets a fresh token, which is the delivery's receipt. Acking a
//! token whose lease already expired is a no-op, so a late consumer cannot
//! release the lease of whoever picked the task up next. Every multi-key
//! step runs as a Lua script so a crash never leaves a task in two places.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::Script;
use uuid::Uuid;

use super::engine::ExecutionTask;
use super::queue::{Broker, Delivery, QueueDepth, QueueResult};

const DEQUEUE: &str = r#"
    local msg = redis.call("RPOP", KEYS[1])
    if not msg then
        return false
    end
    redis.call("HSET", KEYS[2], ARGV[2], msg)
    redis.call("ZADD", KEYS[3], ARGV[1], ARGV[2])
    local id = cjson.decode(msg)["task_id"]
    local attempts = redis.call("HGET", KEYS[4], id) or "0"
    return {msg, attempts}
"#;

const ACK: &str = r#"
    local msg = redis.call("HGET", KEYS[1], ARGV[1])
    if not msg then
        return 0
    end
    redis.call("HDEL", KEYS[1], ARGV[1])
    redis.call("ZREM", KEYS[2], ARGV[1])
    local id = cjson.decode(msg)["task_id"]
    redis.call("HDEL", KEYS[3], id)
    return 1
"#;

const REQUEUE_EXPIRED: &str = r#"
    local expired = redis.call("ZRANGEBYSCORE", KEYS[3], "-inf", ARGV[1])
    local moved = 0
    for _, token in ipairs(expired) do
        redis.call("ZREM", KEYS[3], token)
        local msg = redis.call("HGET", KEYS[2], token)
        if msg then
            redis.call("HDEL", KEYS[2], token)
            redis.call("RPUSH", KEYS[1], msg)
            local id = cjson.decode(msg)["task_id"]
            redis.call("HINCRBY", KEYS[4], id, 1)
            moved = moved + 1
        end
    end
    return moved
"#;

pub struct RedisBroker {
    conn: ConnectionManager,
    pending: String,
    receipts: String,
    leases: String,
    attempts: String,
}

impl RedisBroker {
    pub async fn connect(url: &str, name: &str) -> QueueResult<Self> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self {
            conn,
            pending: format!("{name}:pending"),
            receipts: format!("{name}:receipts"),
            leases: format!("{name}:leases"),
            attempts: format!("{name}:attempts"),
        })
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn declare(&self) -> QueueResult<()> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    async fn enqueue(&self, task: &ExecutionTask) -> QueueResult<()> {
        let payload = serde_json::to_string(task)?;
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("LPUSH")
            .arg(&self.pending)
            .arg(payload)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn dequeue(&self, visibility: Duration) -> QueueResult<Option<Delivery>> {
        let deadline = lease_deadline(Utc::now().timestamp_millis(), visibility);
        let token = Uuid::new_v4().to_string();
        let mut conn = self.conn.clone();
        let leased: Option<(String, u32)> = Script::new(DEQUEUE)
            .key(&self.pending)
            .key(&self.receipts)
            .key(&self.leases)
            .key(&self.attempts)
            .arg(deadline)
            .arg(&token)
            .invoke_async(&mut conn)
            .await?;

        let Some((payload, attempts)) = leased else {
            return Ok(None);
        };
        let mut task: ExecutionTask = serde_json::from_str(&payload)?;
        task.attempt = attempts;
        Ok(Some(Delivery { task, receipt: token }))
    }

    async fn ack(&self, receipt: &str) -> QueueResult<()> {
        let mut conn = self.conn.clone();
        let released: i64 = Script::new(ACK)
            .key(&self.receipts)
            .key(&self.leases)
            .key(&self.attempts)
            .arg(receipt)
            .invoke_async(&mut conn)
            .await?;
        if released == 0 {
            tracing::debug!(%receipt, "Ack for an expired lease ignored");
        }
        Ok(())
    }

    async fn requeue_expired(&self) -> QueueResult<u64> {
        let mut conn = self.conn.clone();
        let moved: u64 = Script::new(REQUEUE_EXPIRED)
            .key(&self.pending)
            .key(&self.receipts)
            .key(&self.leases)
            .key(&self.attempts)
            .arg(Utc::now().timestamp_millis())
            .invoke_async(&mut conn)
            .await?;
        Ok(moved)
    }

    async fn purge(&self) -> QueueResult<u64> {
        let mut conn = self.conn.clone();
        let (pending, in_flight): (u64, u64) = redis::pipe()
            .atomic()
            .cmd("LLEN")
            .arg(&self.pending)
            .cmd("HLEN")
            .arg(&self.receipts)
            .query_async(&mut conn)
            .await?;
        let _: () = redis::cmd("DEL")
            .arg(&self.pending)
            .arg(&self.receipts)
            .arg(&self.leases)
            .arg(&self.attempts)
            .query_async(&mut conn)
            .await?;
        Ok(pending + in_flight)
    }

    async fn depth(&self) -> QueueResult<QueueDepth> {
        let mut conn = self.conn.clone();
        let (pending, in_flight): (u64, u64) = redis::pipe()
            .cmd("LLEN")
            .arg(&self.pending)
            .cmd("HLEN")
            .arg(&self.receipts)
            .query_async(&mut conn)
            .await?;
        Ok(QueueDepth { pending, in_flight })
    }
}

fn lease_deadline(now_ms: i64, visibility: Duration) -> i64 {
    now_ms.saturating_add(i64::try_from(visibility.as_millis()).unwrap_or(i64::MAX))
}
