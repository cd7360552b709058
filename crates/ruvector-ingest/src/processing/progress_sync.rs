//! Rolls task progress up into document progress
//!
//! Runs periodically over documents still being processed. Once every
//! standard task of a document has finished cleanly the follow-up RAPTOR or
//! graph task is queued; the document is done when no follow-up remains.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::error::Result;
use crate::storage::MetadataDb;
use crate::types::{Document, RunStatus, TaskType};

use super::decomposer::TaskDecomposer;

/// What one pass decided for a document
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentProgress {
    pub progress: f32,
    pub run: RunStatus,
    /// Follow-up task queued by this pass
    pub followup: Option<TaskType>,
}

/// Periodic document progress aggregation
pub struct ProgressSync {
    db: MetadataDb,
    decomposer: Arc<TaskDecomposer>,
}

impl ProgressSync {
    pub fn new(db: MetadataDb, decomposer: Arc<TaskDecomposer>) -> Self {
        Self { db, decomposer }
    }

    /// One pass over all unfinished documents; returns how many were updated
    pub async fn sync_once(&self) -> Result<usize> {
        let mut updated = 0;
        for doc in self.db.list_unfinished_documents()? {
            match self.sync_document(&doc).await {
                Ok(Some(_)) => updated += 1,
                Ok(None) => {}
                Err(e) => tracing::error!("Progress sync of {} failed: {}", doc.id, e),
            }
        }
        Ok(updated)
    }

    /// Aggregate the tasks of one document; `None` when it has no tasks
    pub async fn sync_document(&self, doc: &Document) -> Result<Option<DocumentProgress>> {
        let tasks = self.db.get_tasks(&doc.id)?;
        if tasks.is_empty() {
            return Ok(None);
        }

        let mut finished = true;
        let mut failed = 0usize;
        let mut total = 0.0f32;
        let mut has_raptor = false;
        let mut has_graphrag = false;
        let mut messages: Vec<&str> = Vec::new();

        for task in &tasks {
            if (0.0..1.0).contains(&task.progress) {
                finished = false;
            }
            if task.progress < 0.0 {
                failed += 1;
            } else {
                total += task.progress;
            }
            let msg = task.progress_msg.trim();
            if !msg.is_empty() {
                messages.push(msg);
            }
            match task.task_type {
                TaskType::Raptor => has_raptor = true,
                TaskType::Graphrag => has_graphrag = true,
                TaskType::Standard => {}
            }
        }

        let n = tasks.len() as f32;
        let mut progress = total / n;
        let mut run = doc.run;
        let mut followup = None;

        if finished && failed > 0 {
            progress = -1.0;
            run = RunStatus::Failed;
        } else if finished {
            let config = &doc.parser_config;
            if config.raptor().use_raptor && !has_raptor {
                followup = Some(TaskType::Raptor);
            } else if config.use_graphrag() && !has_graphrag {
                followup = Some(TaskType::Graphrag);
            }

            match followup {
                Some(task_type) => {
                    self.decomposer.queue_followup(&doc.id, task_type).await?;
                    progress = 0.98 * n / (n + 1.0);
                }
                None => run = RunStatus::Done,
            }
        }

        messages.sort_unstable();
        let message = messages.join("\n");
        let duration = doc
            .process_begin_at
            .map(|begin| (Utc::now() - begin).num_milliseconds() as f64 / 1000.0)
            .unwrap_or(doc.process_duration);

        self.db.update_document_progress(
            &doc.id,
            (progress != 0.0).then_some(progress),
            (!message.is_empty()).then_some(message.as_str()),
            run,
            duration,
        )?;

        if run != doc.run {
            tracing::info!("Document {} is now {} ({:.2})", doc.name, run.as_str(), progress);
        }
        Ok(Some(DocumentProgress { progress, run, followup }))
    }

    /// Run `sync_once` every `interval` on a background task
    pub fn spawn(self, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                match self.sync_once().await {
                    Ok(0) => {}
                    Ok(n) => tracing::debug!("Progress synced for {} document(s)", n),
                    Err(e) => tracing::error!("Progress sync failed: {}", e),
                }
            }
        })
    }
}
