//! Per-task progress reporting with cooperative cancellation

use chrono::Local;

use crate::error::{Error, Result};
use crate::storage::MetadataDb;
use crate::types::task::page_label;

/// Upper bound on a task's stored progress log
pub const PROGRESS_MSG_LIMIT: usize = 3000;

/// Keep the newest whole lines of `text` that fit in `max_len` bytes
///
/// Text already within the limit is returned as is. When no line boundary
/// yields a short enough tail the text is left untouched.
pub fn trim_header_by_lines(text: &str, max_len: usize) -> String {
    let len = text.len();
    if len <= max_len {
        return text.to_string();
    }
    for (i, _) in text.match_indices('\n') {
        if len - i <= max_len {
            return text[i + 1..].to_string();
        }
    }
    text.to_string()
}

/// Writes progress for one task
///
/// Every write re-checks the owning document. Once cancellation is observed
/// the write is forced to `-1` and `Error::Canceled` is returned so callers
/// unwind with `?`.
#[derive(Clone)]
pub struct ProgressReporter {
    db: MetadataDb,
    task_id: String,
    from_page: u32,
    to_page: u32,
}

impl ProgressReporter {
    pub fn new(db: MetadataDb, task_id: impl Into<String>, from_page: u32, to_page: u32) -> Self {
        Self {
            db,
            task_id: task_id.into(),
            from_page,
            to_page,
        }
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// Append a message without touching the numeric progress
    pub fn message(&self, msg: &str) -> Result<()> {
        self.set(None, msg)
    }

    /// Record a failure
    pub fn fail(&self, msg: &str) -> Result<()> {
        self.set(Some(-1.0), msg)
    }

    /// Update progress and append a message
    pub fn set(&self, progress: Option<f32>, msg: &str) -> Result<()> {
        let mut progress = progress;
        let mut msg = msg.to_string();
        if progress.is_some_and(|p| p < 0.0) {
            msg = format!("[ERROR]{}", msg);
        }

        let canceled = match self.db.check_cancel(&self.task_id) {
            Ok(canceled) => canceled,
            Err(e) => {
                tracing::error!("Cancel check for task {} failed: {}", self.task_id, e);
                return Ok(());
            }
        };
        if canceled {
            msg.push_str(" [Canceled]");
            progress = Some(-1.0);
        }

        if !msg.is_empty() {
            if let Some(label) = page_label(self.from_page, self.to_page) {
                msg = format!("{}: {}", label, msg);
            }
            msg = format!("{} {}", Local::now().format("%H:%M:%S"), msg);
        }

        tracing::info!(
            task_id = %self.task_id,
            progress = ?progress,
            "set_progress: {}",
            msg
        );

        if let Err(e) = self.db.update_task_progress(&self.task_id, progress, &msg) {
            tracing::error!("Progress update for task {} failed: {}", self.task_id, e);
            return Ok(());
        }

        if canceled {
            return Err(Error::Canceled);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Document, DocumentType, Knowledgebase, ParserKind, RunStatus, Task, TaskType, Tenant};

    fn setup(from: u32, to: u32) -> (MetadataDb, Document, Task) {
        let db = MetadataDb::in_memory().unwrap();
        let tenant = Tenant { id: "t1".into(), ..Default::default() };
        let kb = Knowledgebase::new("t1", "kb", "embed");
        let doc = Document::new(&kb.id, "a.pdf", "a.pdf", DocumentType::Pdf, ParserKind::Naive, 10);
        let task = Task::new(&doc.id, from, to, TaskType::Standard);
        db.upsert_tenant(&tenant).unwrap();
        db.upsert_knowledgebase(&kb).unwrap();
        db.upsert_document(&doc).unwrap();
        db.insert_task(&task).unwrap();
        (db, doc, task)
    }

    #[test]
    fn test_trim_header_by_lines() {
        assert_eq!(trim_header_by_lines("short", 10), "short");
        assert_eq!(trim_header_by_lines("aaaa\nbbbb\ncc", 8), "bbbb\ncc");
        assert_eq!(trim_header_by_lines("aaaa\nbbbb\ncc", 3), "cc");
        assert_eq!(trim_header_by_lines("no-newline-here", 4), "no-newline-here");
    }

    #[test]
    fn test_message_gets_label_and_timestamp() {
        let (db, _, task) = setup(0, 12);
        let reporter = ProgressReporter::new(db.clone(), &task.id, 0, 12);

        reporter.set(Some(0.5), "Parsing").unwrap();
        let stored = db.get_task(&task.id).unwrap().unwrap();
        assert_eq!(stored.progress, 0.5);
        assert!(stored.progress_msg.contains("Page(1~13): Parsing"));
    }

    #[test]
    fn test_empty_message_only_sets_progress() {
        let (db, _, task) = setup(0, 12);
        let reporter = ProgressReporter::new(db.clone(), &task.id, 0, 12);

        reporter.set(Some(0.75), "").unwrap();
        let stored = db.get_task(&task.id).unwrap().unwrap();
        assert_eq!(stored.progress, 0.75);
        assert_eq!(stored.progress_msg, "");
    }

    #[test]
    fn test_failure_prefix() {
        let (db, _, task) = setup(0, crate::types::UNBOUNDED_PAGE);
        let reporter = ProgressReporter::new(db.clone(), &task.id, 0, crate::types::UNBOUNDED_PAGE);

        reporter.fail("boom").unwrap();
        let stored = db.get_task(&task.id).unwrap().unwrap();
        assert_eq!(stored.progress, -1.0);
        assert!(stored.progress_msg.contains("[ERROR]boom"));
        assert!(!stored.progress_msg.contains("Page("));
    }

    #[test]
    fn test_cancellation_forces_failure_and_signals() {
        let (db, doc, task) = setup(0, 12);
        let reporter = ProgressReporter::new(db.clone(), &task.id, 0, 12);
        db.set_document_run(&doc.id, RunStatus::Canceled).unwrap();

        let err = reporter.set(Some(0.4), "Still working").unwrap_err();
        assert!(err.is_canceled());
        let stored = db.get_task(&task.id).unwrap().unwrap();
        assert_eq!(stored.progress, -1.0);
        assert!(stored.progress_msg.ends_with("Still working [Canceled]"));
    }
}
