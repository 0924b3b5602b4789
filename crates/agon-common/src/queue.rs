//! Redis Stream job queue shared by the evaluation and leaderboard workers.
//!
//! Messages carry a JSON `payload` field and a `retry_count` field. Retries
//! are parked in a `<stream>:delayed` sorted set scored by due time and moved
//! back into the stream by [`StreamQueue::promote_due`]. Jobs that exhaust
//! their retries, or fail fatally, land in `<stream>:dlq`.

use std::collections::HashMap;
use std::time::Duration;

use deadpool_redis::redis::{self, Value};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{AppError, AppResult, Disposition};

/// Upper bound on a single backoff step.
const MAX_BACKOFF: Duration = Duration::from_secs(300);

/// How many parked retries are moved back per promotion pass.
const PROMOTE_BATCH: usize = 100;

/// Claims a parked retry and re-adds it to the stream as one step: the
/// member is removed and the job appended, or neither happens.
const PROMOTE_SCRIPT: &str = r#"
if redis.call('ZREM', KEYS[1], ARGV[1]) == 0 then
  return false
end
return redis.call('XADD', KEYS[2], '*', 'payload', ARGV[2], 'retry_count', ARGV[3])
"#;

/// One message read from the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamMessage {
    pub id: String,
    pub payload: String,
    pub retry_count: u32,
}

/// Redelivery policy applied by [`StreamQueue::settle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_backoff_ms: u64,
}

impl RetryPolicy {
    /// Delay before the next attempt, or `None` once retries are used up.
    pub fn next_delay(&self, retry_count: u32) -> Option<Duration> {
        (retry_count < self.max_retries).then(|| backoff_delay(self.base_backoff_ms, retry_count))
    }
}

/// What [`StreamQueue::settle`] did with a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settled {
    Completed,
    Retried(Duration),
    DeadLettered,
}

/// Retry parked in the delayed set until it is due.
#[derive(Debug, Serialize, Deserialize)]
struct ParkedRetry {
    token: Uuid,
    payload: String,
    retry_count: u32,
}

/// Consumer-group handle over one Redis stream.
#[derive(Clone)]
pub struct StreamQueue {
    pool: deadpool_redis::Pool,
    stream: String,
    group: String,
    consumer: String,
}

impl StreamQueue {
    pub fn new(
        pool: deadpool_redis::Pool,
        stream: impl Into<String>,
        group: impl Into<String>,
        consumer: impl Into<String>,
    ) -> Self {
        Self {
            pool,
            stream: stream.into(),
            group: group.into(),
            consumer: consumer.into(),
        }
    }

    pub fn stream(&self) -> &str {
        &self.stream
    }

    pub fn dead_letter_stream(&self) -> String {
        format!("{}:dlq", self.stream)
    }

    fn delayed_key(&self) -> String {
        format!("{}:delayed", self.stream)
    }

    /// Create the consumer group (ignore error if it already exists)
    pub async fn initialize(&self) -> AppResult<()> {
        let mut conn = self.pool.get().await?;

        let result: Result<(), redis::RedisError> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&self.stream)
            .arg(&self.group)
            .arg("$")
            .arg("MKSTREAM")
            .query_async(&mut *conn)
            .await;

        match result {
            Ok(_) => {
                tracing::info!(
                    "Created consumer group '{}' on stream '{}'",
                    self.group,
                    self.stream
                );
                Ok(())
            }
            Err(e) if e.to_string().contains("BUSYGROUP") => {
                tracing::debug!("Consumer group '{}' already exists", self.group);
                Ok(())
            }
            Err(e) => Err(AppError::QueueError(format!(
                "Failed to create consumer group: {}",
                e
            ))),
        }
    }

    /// Block up to `block_ms` for the next new message.
    pub async fn read_next(&self, block_ms: usize) -> AppResult<Option<StreamMessage>> {
        let mut conn = self.pool.get().await?;

        let result: Value = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(&self.group)
            .arg(&self.consumer)
            .arg("COUNT")
            .arg(1)
            .arg("BLOCK")
            .arg(block_ms)
            .arg("STREAMS")
            .arg(&self.stream)
            .arg(">")
            .query_async(&mut *conn)
            .await?;

        parse_read_reply(&result)
    }

    /// Take ownership of messages a dead consumer left pending for longer
    /// than `min_idle_ms`.
    pub async fn reclaim_stale(&self, min_idle_ms: u64, count: usize) -> AppResult<Vec<StreamMessage>> {
        let mut conn = self.pool.get().await?;

        let reply: Value = redis::cmd("XAUTOCLAIM")
            .arg(&self.stream)
            .arg(&self.group)
            .arg(&self.consumer)
            .arg(min_idle_ms)
            .arg("0-0")
            .arg("COUNT")
            .arg(count)
            .query_async(&mut *conn)
            .await?;

        let entries = match &reply {
            Value::Array(parts) => match parts.get(1) {
                Some(Value::Array(entries)) => entries,
                _ => return Ok(Vec::new()),
            },
            _ => return Ok(Vec::new()),
        };

        let mut messages = Vec::new();
        for entry in entries {
            // Entries deleted while pending come back without fields.
            if let Ok(msg) = parse_entry(entry) {
                messages.push(msg);
            }
        }

        if !messages.is_empty() {
            tracing::info!(
                "Reclaimed {} abandoned message(s) on '{}'",
                messages.len(),
                self.stream
            );
        }

        Ok(messages)
    }

    /// Append a fresh job to the stream.
    pub async fn publish(&self, payload: &str) -> AppResult<String> {
        self.add(payload, 0).await
    }

    async fn add(&self, payload: &str, retry_count: u32) -> AppResult<String> {
        let mut conn = self.pool.get().await?;

        let id: String = redis::cmd("XADD")
            .arg(&self.stream)
            .arg("*")
            .arg("payload")
            .arg(payload)
            .arg("retry_count")
            .arg(retry_count.to_string())
            .query_async(&mut *conn)
            .await?;

        Ok(id)
    }

    /// Acknowledge and delete a finished message.
    pub async fn complete(&self, message_id: &str) -> AppResult<()> {
        let mut conn = self.pool.get().await?;

        redis::pipe()
            .atomic()
            .cmd("XACK")
            .arg(&self.stream)
            .arg(&self.group)
            .arg(message_id)
            .ignore()
            .cmd("XDEL")
            .arg(&self.stream)
            .arg(message_id)
            .ignore()
            .query_async::<()>(&mut *conn)
            .await?;

        Ok(())
    }

    /// Park the message for redelivery after `delay`, with its retry count
    /// incremented, and remove the original from the stream.
    pub async fn schedule_retry(&self, msg: &StreamMessage, delay: Duration) -> AppResult<()> {
        let parked = ParkedRetry {
            token: Uuid::new_v4(),
            payload: msg.payload.clone(),
            retry_count: msg.retry_count + 1,
        };
        let member = serde_json::to_string(&parked)?;
        let due_ms = chrono::Utc::now().timestamp_millis() + delay.as_millis() as i64;

        {
            let mut conn = self.pool.get().await?;
            redis::cmd("ZADD")
                .arg(self.delayed_key())
                .arg(due_ms)
                .arg(member)
                .query_async::<i64>(&mut *conn)
                .await?;
        }

        self.complete(&msg.id).await
    }

    /// Move parked retries whose due time has passed back into the stream.
    pub async fn promote_due(&self, now_ms: i64) -> AppResult<usize> {
        let mut conn = self.pool.get().await?;

        let due: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(self.delayed_key())
            .arg("-inf")
            .arg(now_ms)
            .arg("LIMIT")
            .arg(0)
            .arg(PROMOTE_BATCH)
            .query_async(&mut *conn)
            .await?;

        let mut promoted = 0;
        for member in due {
            let parked: ParkedRetry = match serde_json::from_str(&member) {
                Ok(p) => p,
                Err(e) => {
                    tracing::error!("Dropping unreadable parked retry on '{}': {}", self.stream, e);
                    redis::cmd("ZREM")
                        .arg(self.delayed_key())
                        .arg(&member)
                        .query_async::<i64>(&mut *conn)
                        .await?;
                    continue;
                }
            };

            // Nil when another consumer claimed the member first.
            let id: Option<String> = redis::cmd("EVAL")
                .arg(PROMOTE_SCRIPT)
                .arg(2)
                .arg(self.delayed_key())
                .arg(&self.stream)
                .arg(&member)
                .arg(&parked.payload)
                .arg(parked.retry_count.to_string())
                .query_async(&mut *conn)
                .await?;
            if id.is_some() {
                promoted += 1;
            }
        }

        Ok(promoted)
    }

    /// Move a message to the dead-letter stream and remove the original.
    pub async fn dead_letter(&self, msg: &StreamMessage, error: &str) -> AppResult<()> {
        {
            let mut conn = self.pool.get().await?;

            tracing::error!(
                "Sending message {} to dead letter stream '{}': {}",
                msg.id,
                self.dead_letter_stream(),
                error
            );

            redis::cmd("XADD")
                .arg(self.dead_letter_stream())
                .arg("*")
                .arg("payload")
                .arg(&msg.payload)
                .arg("error")
                .arg(error)
                .arg("retry_count")
                .arg(msg.retry_count.to_string())
                .arg("failed_at")
                .arg(chrono::Utc::now().to_rfc3339())
                .query_async::<String>(&mut *conn)
                .await?;
        }

        self.complete(&msg.id).await
    }

    /// Apply a worker's [`Disposition`] to the message it was working on.
    pub async fn settle(
        &self,
        msg: &StreamMessage,
        disposition: &Disposition,
        policy: RetryPolicy,
    ) -> AppResult<Settled> {
        match disposition {
            Disposition::Completed => {
                self.complete(&msg.id).await?;
                Ok(Settled::Completed)
            }
            Disposition::Retryable(reason) => match policy.next_delay(msg.retry_count) {
                Some(delay) => {
                    tracing::warn!(
                        "Retrying message {} on '{}' in {:?} (attempt {}/{}): {}",
                        msg.id,
                        self.stream,
                        delay,
                        msg.retry_count + 1,
                        policy.max_retries,
                        reason
                    );
                    self.schedule_retry(msg, delay).await?;
                    Ok(Settled::Retried(delay))
                }
                None => {
                    let error = format!("retries exhausted: {}", reason);
                    self.dead_letter(msg, &error).await?;
                    Ok(Settled::DeadLettered)
                }
            },
            Disposition::Fatal(reason) => {
                self.dead_letter(msg, reason).await?;
                Ok(Settled::DeadLettered)
            }
        }
    }
}

/// Whether a queue error means the consumer group has disappeared.
pub fn is_missing_group(e: &AppError) -> bool {
    e.to_string().contains("NOGROUP")
}

/// Exponential backoff: `base * 2^retry_count`, capped.
pub fn backoff_delay(base_ms: u64, retry_count: u32) -> Duration {
    let factor = 1u64.checked_shl(retry_count).unwrap_or(u64::MAX);
    let ms = base_ms.saturating_mul(factor);
    Duration::from_millis(ms).min(MAX_BACKOFF)
}

/// Parse an XREADGROUP reply: `[[stream, [[id, [field, value, ...]]]]]`.
fn parse_read_reply(result: &Value) -> AppResult<Option<StreamMessage>> {
    let streams = match result {
        Value::Nil => return Ok(None),
        Value::Array(streams) if streams.is_empty() => return Ok(None),
        Value::Array(streams) => streams,
        _ => return Err(AppError::QueueError("Invalid stream response format".into())),
    };

    let stream_data = match streams.first() {
        Some(Value::Array(data)) => data,
        _ => return Err(AppError::QueueError("Invalid stream response format".into())),
    };

    let messages = match stream_data.get(1) {
        Some(Value::Array(msgs)) => msgs,
        _ => return Err(AppError::QueueError("No messages in response".into())),
    };

    match messages.first() {
        Some(entry) => parse_entry(entry).map(Some),
        None => Ok(None),
    }
}

/// Parse one stream entry: `[id, [field, value, ...]]`.
fn parse_entry(entry: &Value) -> AppResult<StreamMessage> {
    let message = match entry {
        Value::Array(msg) => msg,
        _ => return Err(AppError::QueueError("No message data".into())),
    };

    let id = match message.first() {
        Some(Value::BulkString(id)) => String::from_utf8_lossy(id).to_string(),
        Some(Value::SimpleString(id)) => id.clone(),
        _ => return Err(AppError::QueueError("Invalid message ID".into())),
    };

    let fields = match message.get(1) {
        Some(Value::Array(f)) => f,
        _ => return Err(AppError::QueueError(format!("Message {} has no fields", id))),
    };

    let mut field_map = HashMap::new();
    for chunk in fields.chunks(2) {
        if let [Value::BulkString(key), Value::BulkString(value)] = chunk {
            field_map.insert(
                String::from_utf8_lossy(key).to_string(),
                String::from_utf8_lossy(value).to_string(),
            );
        }
    }

    let payload = field_map
        .remove("payload")
        .ok_or_else(|| AppError::QueueError(format!("Message {} missing payload", id)))?;

    let retry_count = field_map
        .get("retry_count")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);

    Ok(StreamMessage {
        id,
        payload,
        retry_count,
    })
}
