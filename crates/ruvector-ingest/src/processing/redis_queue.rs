//! Redis Streams backed work queue and heartbeat registry

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;

use crate::config::QueueConfig;
use crate::error::{Error, Result};
use crate::types::TaskMessage;

use super::heartbeat::{HeartbeatRecord, HeartbeatRegistry};
use super::queue::{GroupInfo, QueueMessage, WorkQueue};

/// Set holding every consumer name that ever reported
const EXECUTORS_KEY: &str = "TASKEXE";

/// Read timeout for new messages
const BLOCK_MS: u64 = 1000;

/// Stream queue with one consumer group shared by all workers
pub struct RedisStreamQueue {
    conn: MultiplexedConnection,
    queue_name: String,
    group: String,
    max_len: usize,
    retention_secs: u64,
}

impl RedisStreamQueue {
    /// Connect and make sure the stream and consumer group exist
    pub async fn connect(config: &QueueConfig) -> Result<Self> {
        let client = redis::Client::open(config.redis_url.as_str())
            .map_err(|e| Error::queue(format!("Failed to create Redis client: {}", e)))?;
        let mut conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| Error::queue(format!("Failed to connect to Redis: {}", e)))?;

        let created: redis::RedisResult<()> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&config.queue_name)
            .arg(&config.consumer_group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;
        if let Err(e) = created {
            // BUSYGROUP: the group already exists
            if !e.to_string().contains("BUSYGROUP") {
                return Err(Error::queue(format!("Failed to create consumer group: {}", e)));
            }
        }

        tracing::info!(
            queue = %config.queue_name,
            group = %config.consumer_group,
            "Connected to Redis stream"
        );
        Ok(Self {
            conn,
            queue_name: config.queue_name.clone(),
            group: config.consumer_group.clone(),
            max_len: config.max_len,
            retention_secs: config.retention_secs,
        })
    }

    /// Shared connection, for the heartbeat registry
    pub fn connection(&self) -> MultiplexedConnection {
        self.conn.clone()
    }

    async fn read(&self, consumer: &str, id: &str, block: bool) -> Result<Option<QueueMessage>> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("XREADGROUP");
        cmd.arg("GROUP").arg(&self.group).arg(consumer).arg("COUNT").arg(1);
        if block {
            cmd.arg("BLOCK").arg(BLOCK_MS);
        }
        cmd.arg("STREAMS").arg(&self.queue_name).arg(id);

        let response: redis::Value = cmd.query_async(&mut conn).await?;
        Ok(parse_stream_response(response).into_iter().next())
    }

    /// Drop entries older than the retention window
    async fn trim_expired(&self) -> Result<()> {
        let min_ms = chrono::Utc::now().timestamp_millis() - (self.retention_secs as i64) * 1000;
        if min_ms <= 0 {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("XTRIM")
            .arg(&self.queue_name)
            .arg("MINID")
            .arg("~")
            .arg(min_ms)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl WorkQueue for RedisStreamQueue {
    async fn enqueue(&self, message: &TaskMessage) -> Result<()> {
        let data = serde_json::to_string(message)?;
        let mut conn = self.conn.clone();
        let stream_id: String = redis::cmd("XADD")
            .arg(&self.queue_name)
            .arg("MAXLEN")
            .arg("~")
            .arg(self.max_len)
            .arg("*")
            .arg("data")
            .arg(&data)
            .query_async(&mut conn)
            .await
            .map_err(|e| Error::queue(format!("Failed to publish to Redis stream: {}", e)))?;

        tracing::debug!(task_id = %message.id, stream_id = %stream_id, "Task queued");
        if let Err(e) = self.trim_expired().await {
            tracing::warn!("Trimming {} failed: {}", self.queue_name, e);
        }
        Ok(())
    }

    async fn claim(&self, consumer: &str) -> Result<Option<QueueMessage>> {
        self.read(consumer, ">", true).await
    }

    async fn claim_pending(&self, consumer: &str) -> Result<Option<QueueMessage>> {
        self.read(consumer, "0", false).await
    }

    async fn ack(&self, message: &QueueMessage) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("XACK")
            .arg(&self.queue_name)
            .arg(&self.group)
            .arg(&message.message_id)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn group_info(&self) -> Result<GroupInfo> {
        let mut conn = self.conn.clone();
        let response: redis::Value = redis::cmd("XINFO")
            .arg("GROUPS")
            .arg(&self.queue_name)
            .query_async(&mut conn)
            .await?;

        let groups = match response {
            redis::Value::Array(groups) => groups,
            _ => return Ok(GroupInfo::default()),
        };
        for group in groups {
            let fields = field_pairs(&group);
            let is_ours = fields
                .iter()
                .any(|(k, v)| k == "name" && value_string(v).as_deref() == Some(self.group.as_str()));
            if !is_ours {
                continue;
            }
            let number = |key: &str| {
                fields
                    .iter()
                    .find(|(k, _)| k == key)
                    .and_then(|(_, v)| value_u64(v))
                    .unwrap_or(0)
            };
            return Ok(GroupInfo {
                pending: number("pending"),
                lag: number("lag"),
            });
        }
        Ok(GroupInfo::default())
    }

    fn name(&self) -> &str {
        "redis"
    }
}

/// Heartbeats in Redis: consumer names in `TASKEXE`, records in a sorted set per consumer
pub struct RedisHeartbeatRegistry {
    conn: MultiplexedConnection,
}

impl RedisHeartbeatRegistry {
    pub fn new(conn: MultiplexedConnection) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl HeartbeatRegistry for RedisHeartbeatRegistry {
    async fn register(&self, consumer: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("SADD")
            .arg(EXECUTORS_KEY)
            .arg(consumer)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn publish(&self, record: &HeartbeatRecord, timestamp: f64) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("ZADD")
            .arg(&record.name)
            .arg(timestamp)
            .arg(serde_json::to_string(record)?)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn expire(&self, consumer: &str, before: f64) -> Result<usize> {
        let mut conn = self.conn.clone();
        let stale: usize = redis::cmd("ZCOUNT")
            .arg(consumer)
            .arg(0)
            .arg(format!("({}", before))
            .query_async(&mut conn)
            .await?;
        if stale > 0 {
            let _: redis::Value = redis::cmd("ZPOPMIN")
                .arg(consumer)
                .arg(stale)
                .query_async(&mut conn)
                .await?;
        }
        Ok(stale)
    }
}

fn value_string(value: &redis::Value) -> Option<String> {
    match value {
        redis::Value::BulkString(bytes) => Some(String::from_utf8_lossy(bytes).to_string()),
        redis::Value::SimpleString(s) => Some(s.clone()),
        _ => None,
    }
}

fn value_u64(value: &redis::Value) -> Option<u64> {
    match value {
        redis::Value::Int(n) => u64::try_from(*n).ok(),
        other => value_string(other)?.parse().ok(),
    }
}

/// `[k1, v1, k2, v2, ...]` or a RESP3 map as key/value pairs
fn field_pairs(value: &redis::Value) -> Vec<(String, redis::Value)> {
    match value {
        redis::Value::Array(items) => items
            .chunks(2)
            .filter_map(|pair| match pair {
                [k, v] => Some((value_string(k)?, v.clone())),
                _ => None,
            })
            .collect(),
        redis::Value::Map(items) => items
            .iter()
            .filter_map(|(k, v)| Some((value_string(k)?, v.clone())))
            .collect(),
        _ => Vec::new(),
    }
}

/// Parse an XREADGROUP response: `[[stream, [[id, [field, value, ...]], ...]]]`
fn parse_stream_response(response: redis::Value) -> Vec<QueueMessage> {
    let mut messages = Vec::new();
    let streams = match response {
        redis::Value::Array(streams) => streams,
        _ => return messages,
    };

    for stream in streams {
        let redis::Value::Array(stream_data) = stream else { continue };
        let Some(redis::Value::Array(entries)) = stream_data.get(1) else { continue };

        for entry in entries {
            let redis::Value::Array(entry) = entry else { continue };
            let Some(message_id) = entry.first().and_then(value_string) else { continue };

            let data = entry
                .get(1)
                .map(field_pairs)
                .unwrap_or_default()
                .into_iter()
                .find(|(k, _)| k == "data")
                .and_then(|(_, v)| value_string(&v));
            let Some(data) = data else {
                // Pending entries whose payload was trimmed come back empty
                tracing::warn!(stream_id = %message_id, "Queue entry without payload");
                continue;
            };

            match serde_json::from_str::<TaskMessage>(&data) {
                Ok(payload) => messages.push(QueueMessage { message_id, payload }),
                Err(e) => tracing::warn!(stream_id = %message_id, error = %e, "Failed to deserialize task message"),
            }
        }
    }
    messages
}

#[cfg(test)]
mod tests {
    use super::*;
    use redis::Value;

    fn bulk(s: &str) -> Value {
        Value::BulkString(s.as_bytes().to_vec())
    }

    #[test]
    fn test_parse_stream_response() {
        let payload = r#"{"id":"t1","doc_id":"d1","task_type":"standard","from_page":0,"to_page":12}"#;
        let response = Value::Array(vec![Value::Array(vec![
            bulk("ruvector_ingest_svr_queue"),
            Value::Array(vec![Value::Array(vec![
                bulk("1700000000000-0"),
                Value::Array(vec![bulk("data"), bulk(payload)]),
            ])]),
        ])]);

        let messages = parse_stream_response(response);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].message_id, "1700000000000-0");
        assert_eq!(messages[0].payload.to_page, 12);
    }

    #[test]
    fn test_nil_and_trimmed_entries() {
        assert!(parse_stream_response(Value::Nil).is_empty());
        let response = Value::Array(vec![Value::Array(vec![
            bulk("q"),
            Value::Array(vec![Value::Array(vec![bulk("1-0"), Value::Nil])]),
        ])]);
        assert!(parse_stream_response(response).is_empty());
    }

    #[test]
    fn test_field_pairs() {
        let group = Value::Array(vec![bulk("name"), bulk("g"), bulk("pending"), Value::Int(2)]);
        let pairs = field_pairs(&group);
        assert_eq!(pairs.len(), 2);
        assert_eq!(value_u64(&pairs[1].1), Some(2));
    }
}
