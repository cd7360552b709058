//! Durable work queue contract and the in-process implementation

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::time::{Duration, Instant};

use crate::error::Result;
use crate::types::TaskMessage;

/// A delivered queue entry
#[derive(Debug, Clone, PartialEq)]
pub struct QueueMessage {
    /// Stream entry id, used to acknowledge
    pub message_id: String,
    pub payload: TaskMessage,
}

/// Consumer group backlog
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupInfo {
    /// Delivered but not yet acknowledged
    pub pending: u64,
    /// Not yet delivered to any consumer
    pub lag: u64,
}

/// Work queue with consumer-group delivery semantics
///
/// Implementations:
/// - `RedisStreamQueue`: Redis Streams, shared by every worker process
/// - `MemoryQueue`: single process, for tests and embedded use
#[async_trait]
pub trait WorkQueue: Send + Sync {
    async fn enqueue(&self, message: &TaskMessage) -> Result<()>;

    /// Next message never delivered to any consumer
    async fn claim(&self, consumer: &str) -> Result<Option<QueueMessage>>;

    /// Oldest message delivered to `consumer` and not acknowledged
    async fn claim_pending(&self, consumer: &str) -> Result<Option<QueueMessage>>;

    async fn ack(&self, message: &QueueMessage) -> Result<()>;

    async fn group_info(&self) -> Result<GroupInfo>;

    /// Get provider name for logging
    fn name(&self) -> &str;
}

struct StreamEntry {
    seq: u64,
    payload: TaskMessage,
    added: Instant,
}

#[derive(Default)]
struct MemoryState {
    stream: VecDeque<StreamEntry>,
    next_seq: u64,
    last_delivered: Option<u64>,
    /// seq → (consumer, payload)
    pending: BTreeMap<u64, (String, TaskMessage)>,
}

/// In-process queue mirroring the stream semantics
pub struct MemoryQueue {
    state: Mutex<MemoryState>,
    retention: Duration,
    max_len: usize,
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new(Duration::from_secs(3600), 1024)
    }
}

impl MemoryQueue {
    pub fn new(retention: Duration, max_len: usize) -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            retention,
            max_len: max_len.max(1),
        }
    }

    /// Entries still held in the stream
    pub fn len(&self) -> usize {
        self.state.lock().stream.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn message_id(seq: u64) -> String {
        format!("{}-0", seq)
    }

    fn parse_id(id: &str) -> Option<u64> {
        id.split('-').next()?.parse().ok()
    }
}

#[async_trait]
impl WorkQueue for MemoryQueue {
    async fn enqueue(&self, message: &TaskMessage) -> Result<()> {
        let mut state = self.state.lock();
        state.next_seq += 1;
        let seq = state.next_seq;
        state.stream.push_back(StreamEntry {
            seq,
            payload: message.clone(),
            added: Instant::now(),
        });

        while state.stream.len() > self.max_len
            || state
                .stream
                .front()
                .is_some_and(|e| e.added.elapsed() > self.retention)
        {
            if let Some(dropped) = state.stream.pop_front() {
                tracing::debug!("Trimmed queue entry {}", dropped.seq);
            }
        }
        Ok(())
    }

    async fn claim(&self, consumer: &str) -> Result<Option<QueueMessage>> {
        let mut state = self.state.lock();
        let after = state.last_delivered.unwrap_or(0);
        let Some(entry) = state.stream.iter().find(|e| e.seq > after) else {
            return Ok(None);
        };
        let (seq, payload) = (entry.seq, entry.payload.clone());
        state.last_delivered = Some(seq);
        state
            .pending
            .insert(seq, (consumer.to_string(), payload.clone()));
        Ok(Some(QueueMessage {
            message_id: Self::message_id(seq),
            payload,
        }))
    }

    async fn claim_pending(&self, consumer: &str) -> Result<Option<QueueMessage>> {
        let state = self.state.lock();
        Ok(state
            .pending
            .iter()
            .find(|(_, (owner, _))| owner == consumer)
            .map(|(seq, (_, payload))| QueueMessage {
                message_id: Self::message_id(*seq),
                payload: payload.clone(),
            }))
    }

    async fn ack(&self, message: &QueueMessage) -> Result<()> {
        if let Some(seq) = Self::parse_id(&message.message_id) {
            self.state.lock().pending.remove(&seq);
        }
        Ok(())
    }

    async fn group_info(&self) -> Result<GroupInfo> {
        let state = self.state.lock();
        let after = state.last_delivered.unwrap_or(0);
        Ok(GroupInfo {
            pending: state.pending.len() as u64,
            lag: state.stream.iter().filter(|e| e.seq > after).count() as u64,
        })
    }

    fn name(&self) -> &str {
        "memory"
    }
}
