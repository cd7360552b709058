//! Worker liveness records

use async_trait::async_trait;
use chrono::{DateTime, Local};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::error::Result;

use super::executor::SharedWorkerState;
use super::queue::WorkQueue;

/// Timestamp format used in heartbeat records
const ISO_MILLIS: &str = "%Y-%m-%dT%H:%M:%S%.3f";

/// One published heartbeat
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HeartbeatRecord {
    pub name: String,
    pub now: String,
    pub boot_at: String,
    pub pending: u64,
    pub lag: u64,
    pub done: u64,
    pub failed: u64,
    /// Task being executed, if any
    pub current_task_id: Option<String>,
}

/// Where heartbeats are kept
///
/// Implementations:
/// - `RedisHeartbeatRegistry`: `TASKEXE` set plus one sorted set per consumer
/// - `MemoryHeartbeatRegistry`: in-process, for tests
#[async_trait]
pub trait HeartbeatRegistry: Send + Sync {
    /// Announce a consumer name
    async fn register(&self, consumer: &str) -> Result<()>;

    /// Store a record scored by its unix timestamp
    async fn publish(&self, record: &HeartbeatRecord, timestamp: f64) -> Result<()>;

    /// Drop records of `consumer` scored before `before`; returns how many
    async fn expire(&self, consumer: &str, before: f64) -> Result<usize>;
}

/// In-process heartbeat registry
#[derive(Default)]
pub struct MemoryHeartbeatRegistry {
    consumers: Mutex<BTreeSet<String>>,
    records: Mutex<HashMap<String, Vec<(f64, HeartbeatRecord)>>>,
}

impl MemoryHeartbeatRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn consumers(&self) -> Vec<String> {
        self.consumers.lock().iter().cloned().collect()
    }

    /// Records of a consumer, oldest first
    pub fn records(&self, consumer: &str) -> Vec<HeartbeatRecord> {
        self.records
            .lock()
            .get(consumer)
            .map(|r| r.iter().map(|(_, rec)| rec.clone()).collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl HeartbeatRegistry for MemoryHeartbeatRegistry {
    async fn register(&self, consumer: &str) -> Result<()> {
        self.consumers.lock().insert(consumer.to_string());
        Ok(())
    }

    async fn publish(&self, record: &HeartbeatRecord, timestamp: f64) -> Result<()> {
        let mut records = self.records.lock();
        let entries = records.entry(record.name.clone()).or_default();
        entries.push((timestamp, record.clone()));
        entries.sort_by(|a, b| a.0.total_cmp(&b.0));
        Ok(())
    }

    async fn expire(&self, consumer: &str, before: f64) -> Result<usize> {
        let mut records = self.records.lock();
        let Some(entries) = records.get_mut(consumer) else {
            return Ok(0);
        };
        let stale = entries.iter().filter(|(ts, _)| *ts < before).count();
        entries.drain(..stale);
        Ok(stale)
    }
}

/// Publishes the worker's counters on a fixed interval
pub struct HeartbeatReporter {
    consumer: String,
    boot_at: DateTime<Local>,
    queue: Arc<dyn WorkQueue>,
    registry: Arc<dyn HeartbeatRegistry>,
    state: SharedWorkerState,
    interval: Duration,
    expiry: Duration,
}

impl HeartbeatReporter {
    pub fn new(
        consumer: impl Into<String>,
        queue: Arc<dyn WorkQueue>,
        registry: Arc<dyn HeartbeatRegistry>,
        state: SharedWorkerState,
        interval: Duration,
        expiry: Duration,
    ) -> Self {
        Self {
            consumer: consumer.into(),
            boot_at: Local::now(),
            queue,
            registry,
            state,
            interval,
            expiry,
        }
    }

    /// Refresh backlog counters, publish one record and expire old ones
    pub async fn beat(&self) -> Result<HeartbeatRecord> {
        match self.queue.group_info().await {
            Ok(info) => {
                let mut state = self.state.lock();
                state.pending = info.pending;
                state.lag = info.lag;
            }
            Err(e) => tracing::warn!("Queue info unavailable for heartbeat: {}", e),
        }

        let snapshot = self.state.lock().clone();
        let now = Local::now();
        let record = HeartbeatRecord {
            name: self.consumer.clone(),
            now: now.format(ISO_MILLIS).to_string(),
            boot_at: self.boot_at.format(ISO_MILLIS).to_string(),
            pending: snapshot.pending,
            lag: snapshot.lag,
            done: snapshot.done,
            failed: snapshot.failed,
            current_task_id: snapshot.current_task.map(|t| t.id),
        };

        let timestamp = now.timestamp_millis() as f64 / 1000.0;
        self.registry.publish(&record, timestamp).await?;

        let expired = self
            .registry
            .expire(&self.consumer, timestamp - self.expiry.as_secs_f64())
            .await?;
        if expired > 0 {
            tracing::debug!("Expired {} heartbeat(s) of {}", expired, self.consumer);
        }
        Ok(record)
    }

    /// Register and start beating on a background task
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            if let Err(e) = self.registry.register(&self.consumer).await {
                tracing::error!("Heartbeat registration of {} failed: {}", self.consumer, e);
            }
            let mut ticker = tokio::time::interval(self.interval);
            loop {
                ticker.tick().await;
                match self.beat().await {
                    Ok(record) => tracing::info!(
                        pending = record.pending,
                        lag = record.lag,
                        done = record.done,
                        failed = record.failed,
                        "{} reported heartbeat",
                        self.consumer
                    ),
                    Err(e) => tracing::error!("Heartbeat of {} failed: {}", self.consumer, e),
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processing::executor::WorkerState;
    use crate::processing::queue::MemoryQueue;
    use crate::types::{TaskMessage, TaskType};

    #[tokio::test]
    async fn test_beat_publishes_counters() {
        let queue = Arc::new(MemoryQueue::default());
        queue
            .enqueue(&TaskMessage {
                id: "t1".into(),
                doc_id: "d1".into(),
                task_type: TaskType::Standard,
                from_page: 0,
                to_page: 1,
            })
            .await
            .unwrap();

        let state: SharedWorkerState = Arc::new(Mutex::new(WorkerState {
            done: 3,
            failed: 1,
            ..Default::default()
        }));
        let registry = Arc::new(MemoryHeartbeatRegistry::new());
        let reporter = HeartbeatReporter::new(
            "task_consumer_0",
            queue,
            registry.clone(),
            state,
            Duration::from_secs(30),
            Duration::from_secs(1800),
        );

        let record = reporter.beat().await.unwrap();
        assert_eq!(record.lag, 1);
        assert_eq!(record.done, 3);
        assert_eq!(record.failed, 1);
        assert!(record.current_task_id.is_none());
        assert_eq!(registry.records("task_consumer_0").len(), 1);
    }

    #[test]
    fn test_record_field_names() {
        let record = HeartbeatRecord {
            name: "task_consumer_0".into(),
            now: "n".into(),
            boot_at: "b".into(),
            pending: 0,
            lag: 0,
            done: 0,
            failed: 0,
            current_task_id: Some("task-1".into()),
        };
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["current_task_id"], "task-1");
        assert!(value.get("current").is_none());
    }

    #[tokio::test]
    async fn test_expire_drops_old_records() {
        let registry = MemoryHeartbeatRegistry::new();
        let record = |now: &str| HeartbeatRecord {
            name: "c".into(),
            now: now.into(),
            boot_at: "b".into(),
            pending: 0,
            lag: 0,
            done: 0,
            failed: 0,
            current_task_id: None,
        };
        registry.register("c").await.unwrap();
        registry.publish(&record("1"), 100.0).await.unwrap();
        registry.publish(&record("2"), 200.0).await.unwrap();
        registry.publish(&record("3"), 300.0).await.unwrap();

        assert_eq!(registry.expire("c", 250.0).await.unwrap(), 2);
        assert_eq!(registry.records("c")[0].now, "3");
        assert_eq!(registry.consumers(), vec!["c".to_string()]);
    }
}
