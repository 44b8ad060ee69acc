//! Redis Streams-backed queue transport.
//!
//! - **Stream key**: `tallyforge:jobs:stream` (XADD / XREADGROUP)
//! - **Consumer group**: one group shared by all workers; each worker is a
//!   named consumer, so an item is delivered to exactly one of them
//! - **Delayed items**: parked in a sorted set scored by their due time and
//!   promoted onto the stream when it passes
//!
//! Retry-on-failure and dead-lettering are deliberately left to the Redis
//! pending-entries machinery and operational tooling around it; the
//! coordination core only sees `enqueue`/`dequeue`.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use std::time::Duration;
use tracing::warn;

use tallyforge_coordination::{QueueError, QueueItem, QueueItemId, QueueTransport};

/// Default stream key for work items.
const DEFAULT_STREAM_KEY: &str = "tallyforge:jobs:stream";

/// Default sorted-set key for delayed work items.
const DEFAULT_DELAYED_KEY: &str = "tallyforge:jobs:delayed";

/// Default consumer group shared by all workers.
const DEFAULT_GROUP: &str = "workers";

/// How many due delayed items are promoted per dequeue.
const PROMOTE_BATCH: usize = 16;

#[derive(Debug, Clone)]
pub struct RedisStreamsQueue {
    client: Arc<redis::Client>,
    stream_key: String,
    delayed_key: String,
    group: String,
    consumer: String,
}

impl RedisStreamsQueue {
    /// Create a new Redis Streams queue transport.
    ///
    /// # Arguments
    ///
    /// * `redis_url` - Redis connection URL (e.g., "redis://localhost:6379")
    /// * `stream_key` - Stream key (default: "tallyforge:jobs:stream")
    /// * `group` - Consumer group name (default: "workers")
    pub fn new(
        redis_url: impl AsRef<str>,
        stream_key: Option<String>,
        group: Option<String>,
    ) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| QueueError::Unavailable(e.to_string()))?;

        let queue = Self {
            client: Arc::new(client),
            stream_key: stream_key.unwrap_or_else(|| DEFAULT_STREAM_KEY.to_string()),
            delayed_key: DEFAULT_DELAYED_KEY.to_string(),
            group: group.unwrap_or_else(|| DEFAULT_GROUP.to_string()),
            consumer: format!("consumer-{}", uuid::Uuid::now_v7()),
        };
        queue.ensure_consumer_group();
        Ok(queue)
    }

    /// Ensure the consumer group exists (idempotent).
    fn ensure_consumer_group(&self) {
        let Ok(mut conn) = self.client.get_connection() else {
            return;
        };

        // XGROUP CREATE with MKSTREAM creates the stream if it doesn't exist.
        // If the group already exists this returns an error, which we ignore.
        let _: Result<String, _> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&self.stream_key)
            .arg(&self.group)
            .arg("0")
            .arg("MKSTREAM")
            .query(&mut conn);
    }

    fn connection(&self) -> Result<redis::Connection, QueueError> {
        self.client
            .get_connection()
            .map_err(|e| QueueError::Unavailable(e.to_string()))
    }

    fn append(&self, conn: &mut redis::Connection, payload: &str, kind: &str) -> Result<(), QueueError> {
        let _: String = redis::cmd("XADD")
            .arg(&self.stream_key)
            .arg("*")
            .arg("kind")
            .arg(kind)
            .arg("payload")
            .arg(payload)
            .query(conn)
            .map_err(|e| QueueError::Unavailable(format!("XADD failed: {}", e)))?;
        Ok(())
    }

    /// Move due delayed items onto the stream.
    fn promote_due(&self, conn: &mut redis::Connection) -> Result<(), QueueError> {
        let now_ms = Utc::now().timestamp_millis();

        let due: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(&self.delayed_key)
            .arg("-inf")
            .arg(now_ms)
            .arg("LIMIT")
            .arg(0)
            .arg(PROMOTE_BATCH)
            .query(conn)
            .map_err(|e| QueueError::Unavailable(format!("ZRANGEBYSCORE failed: {}", e)))?;

        for payload in due {
            // ZREM returns 1 only for the promoter that won the race.
            let removed: u64 = redis::cmd("ZREM")
                .arg(&self.delayed_key)
                .arg(&payload)
                .query(conn)
                .map_err(|e| QueueError::Unavailable(format!("ZREM failed: {}", e)))?;
            if removed == 0 {
                continue;
            }

            let kind = serde_json::from_str::<QueueItem>(&payload)
                .map(|item| item.kind.as_str().to_string())
                .unwrap_or_default();
            self.append(conn, &payload, &kind)?;
        }

        Ok(())
    }

    fn read_one(&self, conn: &mut redis::Connection) -> Result<Option<(String, String)>, QueueError> {
        // XREADGROUP with ">" delivers a new entry to this consumer, or nil.
        let reply: Option<HashMap<String, Vec<redis::Value>>> = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(&self.group)
            .arg(&self.consumer)
            .arg("COUNT")
            .arg(1)
            .arg("STREAMS")
            .arg(&self.stream_key)
            .arg(">")
            .query(conn)
            .map_err(|e| QueueError::Unavailable(format!("XREADGROUP failed: {}", e)))?;

        let Some(streams) = reply else {
            return Ok(None);
        };
        let Some(entries) = streams.get(&self.stream_key) else {
            return Ok(None);
        };
        let Some(entry) = entries.first() else {
            return Ok(None);
        };

        parse_stream_entry(entry).map(Some)
    }

    fn acknowledge(&self, conn: &mut redis::Connection, message_id: &str) {
        let result: Result<u64, _> = redis::cmd("XACK")
            .arg(&self.stream_key)
            .arg(&self.group)
            .arg(message_id)
            .query(conn);
        if let Err(e) = result {
            warn!(message_id = %message_id, error = %e, "XACK failed");
        }
    }
}

/// Entry format: [message_id, [field1, value1, field2, value2, ...]].
fn parse_stream_entry(entry: &redis::Value) -> Result<(String, String), QueueError> {
    let redis::Value::Bulk(parts) = entry else {
        return Err(QueueError::Malformed("invalid entry format".to_string()));
    };
    if parts.len() < 2 {
        return Err(QueueError::Malformed("entry too short".to_string()));
    }

    let message_id = match &parts[0] {
        redis::Value::Data(data) => String::from_utf8_lossy(data).to_string(),
        _ => return Err(QueueError::Malformed("invalid message id".to_string())),
    };

    let redis::Value::Bulk(fields) = &parts[1] else {
        return Err(QueueError::Malformed("invalid fields format".to_string()));
    };

    let mut payload = None;
    for chunk in fields.chunks(2) {
        if let [redis::Value::Data(key), redis::Value::Data(value)] = chunk {
            if key.as_slice() == b"payload" {
                payload = Some(String::from_utf8_lossy(value).to_string());
            }
        }
    }

    let payload =
        payload.ok_or_else(|| QueueError::Malformed("missing payload field".to_string()))?;
    Ok((message_id, payload))
}

impl QueueTransport for RedisStreamsQueue {
    fn enqueue(&self, item: QueueItem, delay: Option<Duration>) -> Result<QueueItemId, QueueError> {
        let id = item.id;
        let payload = serde_json::to_string(&item)
            .map_err(|e| QueueError::Malformed(e.to_string()))?;

        let mut conn = self.connection()?;
        match delay {
            Some(delay) if !delay.is_zero() => {
                let due_ms = Utc::now().timestamp_millis() + delay.as_millis() as i64;
                let _: u64 = redis::cmd("ZADD")
                    .arg(&self.delayed_key)
                    .arg(due_ms)
                    .arg(&payload)
                    .query(&mut conn)
                    .map_err(|e| QueueError::Unavailable(format!("ZADD failed: {}", e)))?;
            }
            _ => self.append(&mut conn, &payload, item.kind.as_str())?,
        }

        Ok(id)
    }

    fn dequeue(&self) -> Result<Option<QueueItem>, QueueError> {
        let mut conn = self.connection()?;
        self.promote_due(&mut conn)?;

        let Some((message_id, payload)) = self.read_one(&mut conn)? else {
            return Ok(None);
        };

        // Acked on read; handler retries are the transport operator's concern
        // (pending-entry inspection, XAUTOCLAIM tooling).
        self.acknowledge(&mut conn, &message_id);

        let item: QueueItem = serde_json::from_str(&payload)
            .map_err(|e| QueueError::Malformed(format!("failed to decode work item: {}", e)))?;
        Ok(Some(item))
    }
}
