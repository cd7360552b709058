//! Task decomposition, execution and progress tracking over the work queue

pub mod decomposer;
pub mod embedder;
pub mod executor;
pub mod heartbeat;
pub mod progress;
pub mod progress_sync;
pub mod queue;
#[cfg(feature = "redis")]
pub mod redis_queue;

pub use decomposer::TaskDecomposer;
pub use embedder::{embed_chunks, embedding_text};
pub use executor::{SharedWorkerState, TaskExecutor, TaskOutcome, WorkerState};
pub use heartbeat::{HeartbeatRecord, HeartbeatRegistry, HeartbeatReporter, MemoryHeartbeatRegistry};
pub use progress::ProgressReporter;
pub use progress_sync::{DocumentProgress, ProgressSync};
pub use queue::{GroupInfo, MemoryQueue, QueueMessage, WorkQueue};
#[cfg(feature = "redis")]
pub use redis_queue::{RedisHeartbeatRegistry, RedisStreamQueue};
