//! SQLite metadata store for tenants, knowledge bases, documents and tasks
//!
//! Every multi-row update runs in a single transaction so progress, chunk
//! counters and task replacement stay consistent across worker processes.

use chrono::{DateTime, Local, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::processing::progress::{trim_header_by_lines, PROGRESS_MSG_LIMIT};
use crate::types::{
    ChunkingConfig, Document, DocumentType, Knowledgebase, ParserConfig, ParserKind, RunStatus,
    Task, TaskContext, TaskType, Tenant,
};

/// SQLite-based metadata database
#[derive(Clone)]
pub struct MetadataDb {
    conn: Arc<Mutex<Connection>>,
}

impl MetadataDb {
    /// Create or open the database at the given path
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)
            .map_err(|e| Error::database(format!("Failed to open database: {}", e)))?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.migrate()?;
        Ok(db)
    }

    /// Create an in-memory database
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| Error::database(format!("Failed to open in-memory database: {}", e)))?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.migrate()?;
        Ok(db)
    }

    /// Run database migrations
    fn migrate(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute_batch(r#"
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;
            PRAGMA busy_timeout=5000;
        "#).map_err(|e| Error::database(format!("Failed to set pragmas: {}", e)))?;

        conn.execute_batch(r#"
            CREATE TABLE IF NOT EXISTS tenants (
                id TEXT PRIMARY KEY,
                llm_id TEXT NOT NULL DEFAULT '',
                embd_id TEXT NOT NULL DEFAULT '',
                img2txt_id TEXT NOT NULL DEFAULT '',
                asr_id TEXT NOT NULL DEFAULT ''
            );

            CREATE TABLE IF NOT EXISTS knowledgebases (
                id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                name TEXT NOT NULL,
                language TEXT NOT NULL,
                embd_id TEXT NOT NULL,
                pagerank INTEGER NOT NULL DEFAULT 0,
                parser_config TEXT NOT NULL DEFAULT '{}',
                token_num INTEGER NOT NULL DEFAULT 0,
                chunk_num INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS documents (
                id TEXT PRIMARY KEY,
                kb_id TEXT NOT NULL,
                parser_id TEXT NOT NULL,
                parser_config TEXT NOT NULL DEFAULT '{}',
                name TEXT NOT NULL,
                doc_type TEXT NOT NULL,
                location TEXT NOT NULL,
                size INTEGER NOT NULL DEFAULT 0,
                token_num INTEGER NOT NULL DEFAULT 0,
                chunk_num INTEGER NOT NULL DEFAULT 0,
                progress REAL NOT NULL DEFAULT 0,
                progress_msg TEXT NOT NULL DEFAULT '',
                run TEXT NOT NULL DEFAULT 'unstarted',
                process_begin_at TEXT,
                process_duration REAL NOT NULL DEFAULT 0,
                meta_fields TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_documents_kb_id ON documents(kb_id);
            CREATE INDEX IF NOT EXISTS idx_documents_progress ON documents(progress);

            CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                doc_id TEXT NOT NULL,
                from_page INTEGER NOT NULL,
                to_page INTEGER NOT NULL,
                task_type TEXT NOT NULL DEFAULT 'standard',
                digest TEXT NOT NULL DEFAULT '',
                progress REAL NOT NULL DEFAULT 0,
                progress_msg TEXT NOT NULL DEFAULT '',
                retry_count INTEGER NOT NULL DEFAULT 0,
                chunk_ids TEXT NOT NULL DEFAULT '',
                begin_at TEXT,
                process_duration REAL NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_tasks_doc_id ON tasks(doc_id);
        "#)
        .map_err(|e| Error::database(format!("Failed to run migrations: {}", e)))?;

        tracing::debug!("Metadata migrations complete");
        Ok(())
    }

    // ==================== Tenants & Knowledge Bases ====================

    /// Insert or replace a tenant
    pub fn upsert_tenant(&self, tenant: &Tenant) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            r#"
            INSERT INTO tenants (id, llm_id, embd_id, img2txt_id, asr_id)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(id) DO UPDATE SET
                llm_id = excluded.llm_id,
                embd_id = excluded.embd_id,
                img2txt_id = excluded.img2txt_id,
                asr_id = excluded.asr_id
            "#,
            params![tenant.id, tenant.llm_id, tenant.embd_id, tenant.img2txt_id, tenant.asr_id],
        )
        .map_err(|e| Error::database(format!("Failed to upsert tenant: {}", e)))?;
        Ok(())
    }

    /// Insert or replace a knowledge base
    pub fn upsert_knowledgebase(&self, kb: &Knowledgebase) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            r#"
            INSERT INTO knowledgebases (
                id, tenant_id, name, language, embd_id, pagerank, parser_config, token_num, chunk_num
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            ON CONFLICT(id) DO UPDATE SET
                tenant_id = excluded.tenant_id,
                name = excluded.name,
                language = excluded.language,
                embd_id = excluded.embd_id,
                pagerank = excluded.pagerank,
                parser_config = excluded.parser_config
            "#,
            params![
                kb.id,
                kb.tenant_id,
                kb.name,
                kb.language,
                kb.embd_id,
                kb.pagerank,
                serde_json::to_string(&kb.parser_config)?,
                kb.token_num as i64,
                kb.chunk_num as i64,
            ],
        )
        .map_err(|e| Error::database(format!("Failed to upsert knowledge base: {}", e)))?;
        Ok(())
    }

    pub fn get_tenant(&self, id: &str) -> Result<Option<Tenant>> {
        let conn = self.conn.lock();
        load_tenant(&conn, id).map_err(|e| Error::database(format!("Failed to get tenant: {}", e)))
    }

    pub fn get_knowledgebase(&self, id: &str) -> Result<Option<Knowledgebase>> {
        let conn = self.conn.lock();
        load_knowledgebase(&conn, id)
            .map_err(|e| Error::database(format!("Failed to get knowledge base: {}", e)))
    }

    // ==================== Documents ====================

    /// Insert or update a document
    pub fn upsert_document(&self, doc: &Document) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            r#"
            INSERT INTO documents (
                id, kb_id, parser_id, parser_config, name, doc_type, location, size,
                token_num, chunk_num, progress, progress_msg, run, process_begin_at,
                process_duration, meta_fields, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)
            ON CONFLICT(id) DO UPDATE SET
                kb_id = excluded.kb_id,
                parser_id = excluded.parser_id,
                parser_config = excluded.parser_config,
                name = excluded.name,
                doc_type = excluded.doc_type,
                location = excluded.location,
                size = excluded.size,
                progress = excluded.progress,
                progress_msg = excluded.progress_msg,
                run = excluded.run
            "#,
            params![
                doc.id,
                doc.kb_id,
                doc.parser_id.as_str(),
                serde_json::to_string(&doc.parser_config)?,
                doc.name,
                doc.doc_type.as_str(),
                doc.location,
                doc.size as i64,
                doc.token_num as i64,
                doc.chunk_num as i64,
                doc.progress as f64,
                doc.progress_msg,
                doc.run.as_str(),
                doc.process_begin_at,
                doc.process_duration,
                serde_json::to_string(&doc.meta_fields)?,
                doc.created_at,
            ],
        )
        .map_err(|e| Error::database(format!("Failed to upsert document: {}", e)))?;
        Ok(())
    }

    pub fn get_document(&self, id: &str) -> Result<Option<Document>> {
        let conn = self.conn.lock();
        load_document(&conn, id).map_err(|e| Error::database(format!("Failed to get document: {}", e)))
    }

    /// Documents whose processing is under way (`0 < progress < 1`)
    pub fn list_unfinished_documents(&self) -> Result<Vec<Document>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM documents WHERE progress > 0 AND progress < 1 AND doc_type != 'virtual'",
                DOCUMENT_COLUMNS
            ))
            .map_err(|e| Error::database(format!("Failed to prepare query: {}", e)))?;

        let docs = stmt
            .query_map([], row_to_document)
            .map_err(|e| Error::database(format!("Failed to list documents: {}", e)))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| Error::database(format!("Failed to read document: {}", e)))?;
        Ok(docs)
    }

    /// Joined configuration that determines chunk output; `None` if any part is missing
    pub fn get_chunking_config(&self, doc_id: &str) -> Result<Option<ChunkingConfig>> {
        let conn = self.conn.lock();
        let load = || -> rusqlite::Result<Option<ChunkingConfig>> {
            let Some(doc) = load_document(&conn, doc_id)? else { return Ok(None) };
            let Some(kb) = load_knowledgebase(&conn, &doc.kb_id)? else { return Ok(None) };
            let Some(tenant) = load_tenant(&conn, &kb.tenant_id)? else { return Ok(None) };
            Ok(Some(ChunkingConfig::from_parts(&doc, &kb, &tenant)))
        };
        load().map_err(|e| Error::database(format!("Failed to get chunking config: {}", e)))
    }

    /// Mark a document queued for parsing
    pub fn begin_to_parse(&self, doc_id: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            r#"
            UPDATE documents SET
                progress = ?1,
                progress_msg = 'Task is queued...',
                process_begin_at = ?2,
                run = 'running'
            WHERE id = ?3
            "#,
            params![rand::random::<f64>() / 100.0, Utc::now(), doc_id],
        )
        .map_err(|e| Error::database(format!("Failed to mark document queued: {}", e)))?;
        Ok(())
    }

    /// Set the run state of a document (cancel requests go through here)
    pub fn set_document_run(&self, doc_id: &str, run: RunStatus) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE documents SET run = ?1 WHERE id = ?2",
            params![run.as_str(), doc_id],
        )
        .map_err(|e| Error::database(format!("Failed to update document run: {}", e)))?;
        Ok(())
    }

    /// Aggregated progress written by the progress sync
    pub fn update_document_progress(
        &self,
        doc_id: &str,
        progress: Option<f32>,
        progress_msg: Option<&str>,
        run: RunStatus,
        process_duration: f64,
    ) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            r#"
            UPDATE documents SET
                progress = COALESCE(?1, progress),
                progress_msg = COALESCE(?2, progress_msg),
                run = ?3,
                process_duration = ?4
            WHERE id = ?5
            "#,
            params![progress.map(|p| p as f64), progress_msg, run.as_str(), process_duration, doc_id],
        )
        .map_err(|e| Error::database(format!("Failed to update document progress: {}", e)))?;
        Ok(())
    }

    /// Replace the extracted metadata of a document
    pub fn update_meta_fields(&self, doc_id: &str, meta: &serde_json::Value) -> Result<bool> {
        let conn = self.conn.lock();
        let count = conn
            .execute(
                "UPDATE documents SET meta_fields = ?1 WHERE id = ?2",
                params![serde_json::to_string(meta)?, doc_id],
            )
            .map_err(|e| Error::database(format!("Failed to update meta fields: {}", e)))?;
        Ok(count > 0)
    }

    /// Add to document and knowledge base counters in one transaction
    pub fn increment_chunk_num(
        &self,
        doc_id: &str,
        kb_id: &str,
        token_num: u64,
        chunk_num: u64,
        duration: f64,
    ) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction()
            .map_err(|e| Error::database(format!("Failed to begin transaction: {}", e)))?;

        let updated = tx
            .execute(
                r#"
                UPDATE documents SET
                    token_num = token_num + ?1,
                    chunk_num = chunk_num + ?2,
                    process_duration = process_duration + ?3
                WHERE id = ?4
                "#,
                params![token_num as i64, chunk_num as i64, duration, doc_id],
            )
            .map_err(|e| Error::database(format!("Failed to update document counters: {}", e)))?;
        if updated == 0 {
            return Err(Error::DocumentNotFound(doc_id.to_string()));
        }

        tx.execute(
            "UPDATE knowledgebases SET token_num = token_num + ?1, chunk_num = chunk_num + ?2 WHERE id = ?3",
            params![token_num as i64, chunk_num as i64, kb_id],
        )
        .map_err(|e| Error::database(format!("Failed to update knowledge base counters: {}", e)))?;

        tx.commit()
            .map_err(|e| Error::database(format!("Failed to commit counters: {}", e)))?;
        Ok(())
    }

    // ==================== Tasks ====================

    pub fn get_task(&self, id: &str) -> Result<Option<Task>> {
        let conn = self.conn.lock();
        load_task(&conn, id).map_err(|e| Error::database(format!("Failed to get task: {}", e)))
    }

    /// Tasks of a document, by `from_page` ascending then newest first
    pub fn get_tasks(&self, doc_id: &str) -> Result<Vec<Task>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM tasks WHERE doc_id = ?1 ORDER BY from_page ASC, created_at DESC",
                TASK_COLUMNS
            ))
            .map_err(|e| Error::database(format!("Failed to prepare query: {}", e)))?;

        let tasks = stmt
            .query_map(params![doc_id], row_to_task)
            .map_err(|e| Error::database(format!("Failed to list tasks: {}", e)))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| Error::database(format!("Failed to read task: {}", e)))?;
        Ok(tasks)
    }

    /// Whether a task of the given type exists for the document
    pub fn has_task_of_type(&self, doc_id: &str, task_type: TaskType) -> Result<bool> {
        let conn = self.conn.lock();
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM tasks WHERE doc_id = ?1 AND task_type = ?2",
                params![doc_id, task_type.as_str()],
                |row| row.get(0),
            )
            .map_err(|e| Error::database(format!("Failed to count tasks: {}", e)))?;
        Ok(count > 0)
    }

    /// Insert a task; an existing id is left untouched
    pub fn insert_task(&self, task: &Task) -> Result<()> {
        let conn = self.conn.lock();
        insert_task_row(&conn, task).map_err(|e| Error::database(format!("Failed to insert task: {}", e)))?;
        Ok(())
    }

    /// Swap a document's task set and reset its counters, atomically
    ///
    /// The document keeps `chunk_num` reused chunks and its token count
    /// starts over; the knowledge base gives up the removed chunks and the
    /// document's previous tokens.
    pub fn replace_tasks(&self, doc_id: &str, tasks: &[Task], chunk_num: u64) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction()
            .map_err(|e| Error::database(format!("Failed to begin transaction: {}", e)))?;

        let (kb_id, old_tokens, old_chunks): (String, i64, i64) = tx
            .query_row(
                "SELECT kb_id, token_num, chunk_num FROM documents WHERE id = ?1",
                params![doc_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()
            .map_err(|e| Error::database(format!("Failed to read document counters: {}", e)))?
            .ok_or_else(|| Error::DocumentNotFound(doc_id.to_string()))?;

        tx.execute("DELETE FROM tasks WHERE doc_id = ?1", params![doc_id])
            .map_err(|e| Error::database(format!("Failed to delete tasks: {}", e)))?;
        for task in tasks {
            insert_task_row(&tx, task).map_err(|e| Error::database(format!("Failed to insert task: {}", e)))?;
        }
        tx.execute(
            "UPDATE documents SET chunk_num = ?1, token_num = 0 WHERE id = ?2",
            params![chunk_num as i64, doc_id],
        )
        .map_err(|e| Error::database(format!("Failed to reset document counters: {}", e)))?;

        let removed_chunks = (old_chunks - chunk_num as i64).max(0);
        tx.execute(
            r#"
            UPDATE knowledgebases SET
                token_num = MAX(token_num - ?1, 0),
                chunk_num = MAX(chunk_num - ?2, 0)
            WHERE id = ?3
            "#,
            params![old_tokens, removed_chunks, kb_id],
        )
        .map_err(|e| Error::database(format!("Failed to update knowledge base counters: {}", e)))?;

        tx.commit()
            .map_err(|e| Error::database(format!("Failed to commit tasks: {}", e)))?;
        Ok(())
    }

    /// Claim-time lookup of a task that has not started yet
    ///
    /// Appends a "received" line and bumps `retry_count`. Once the retry
    /// ceiling is reached the task is marked abandoned and `None` is returned.
    pub fn get_pending_task(&self, task_id: &str, max_retries: u32) -> Result<Option<TaskContext>> {
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction()
            .map_err(|e| Error::database(format!("Failed to begin transaction: {}", e)))?;

        let load = || -> rusqlite::Result<Option<TaskContext>> {
            let Some(task) = load_task(&tx, task_id)? else { return Ok(None) };
            if task.begin_at.is_some() {
                return Ok(None);
            }
            let Some(doc) = load_document(&tx, &task.doc_id)? else { return Ok(None) };
            let Some(kb) = load_knowledgebase(&tx, &doc.kb_id)? else { return Ok(None) };
            let Some(tenant) = load_tenant(&tx, &kb.tenant_id)? else { return Ok(None) };
            Ok(Some(TaskContext { task, doc, kb, tenant }))
        };
        let Some(mut ctx) = load().map_err(|e| Error::database(format!("Failed to load task: {}", e)))?
        else {
            return Ok(None);
        };

        let abandoned = ctx.task.retry_count >= max_retries;
        let (msg, progress) = if abandoned {
            (
                format!("\nERROR: Task is abandoned after {} times attempts.", max_retries),
                -1.0f32,
            )
        } else {
            (
                format!("\n{} Task has been received.", Local::now().format("%H:%M:%S")),
                rand::random::<f32>() / 10.0,
            )
        };

        tx.execute(
            r#"
            UPDATE tasks SET
                progress_msg = progress_msg || ?1,
                progress = ?2,
                retry_count = retry_count + 1
            WHERE id = ?3
            "#,
            params![msg, progress as f64, task_id],
        )
        .map_err(|e| Error::database(format!("Failed to mark task received: {}", e)))?;
        tx.commit()
            .map_err(|e| Error::database(format!("Failed to commit task claim: {}", e)))?;

        if abandoned {
            tracing::warn!("Task {} abandoned after {} attempts", task_id, max_retries);
            return Ok(None);
        }

        ctx.task.progress_msg.push_str(&msg);
        ctx.task.progress = progress;
        ctx.task.retry_count += 1;
        Ok(Some(ctx))
    }

    /// True when the task is gone or its document was canceled or failed
    pub fn check_cancel(&self, task_id: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let row: Option<(String, f64)> = conn
            .query_row(
                r#"
                SELECT d.run, d.progress FROM tasks t
                JOIN documents d ON d.id = t.doc_id
                WHERE t.id = ?1
                "#,
                params![task_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(|e| Error::database(format!("Failed to check cancel: {}", e)))?;

        Ok(match row {
            None => true,
            Some((run, progress)) => RunStatus::parse(&run) == RunStatus::Canceled || progress < 0.0,
        })
    }

    /// Append a progress line and optionally set progress, in one transaction
    pub fn update_task_progress(&self, task_id: &str, progress: Option<f32>, message: &str) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction()
            .map_err(|e| Error::database(format!("Failed to begin transaction: {}", e)))?;

        if !message.is_empty() {
            let current: Option<String> = tx
                .query_row("SELECT progress_msg FROM tasks WHERE id = ?1", params![task_id], |row| row.get(0))
                .optional()
                .map_err(|e| Error::database(format!("Failed to read progress: {}", e)))?;
            if let Some(current) = current {
                let merged = trim_header_by_lines(&format!("{}\n{}", current, message), PROGRESS_MSG_LIMIT);
                tx.execute(
                    "UPDATE tasks SET progress_msg = ?1 WHERE id = ?2",
                    params![merged, task_id],
                )
                .map_err(|e| Error::database(format!("Failed to write progress message: {}", e)))?;
            }
        }

        if let Some(progress) = progress {
            tx.execute(
                "UPDATE tasks SET progress = ?1 WHERE id = ?2",
                params![progress as f64, task_id],
            )
            .map_err(|e| Error::database(format!("Failed to write progress: {}", e)))?;
        }

        tx.commit()
            .map_err(|e| Error::database(format!("Failed to commit progress: {}", e)))?;
        Ok(())
    }

    /// Stamp the start of execution
    pub fn set_task_begin(&self, task_id: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE tasks SET begin_at = ?1 WHERE id = ?2",
            params![Utc::now(), task_id],
        )
        .map_err(|e| Error::database(format!("Failed to set task begin: {}", e)))?;
        Ok(())
    }

    pub fn set_task_duration(&self, task_id: &str, duration: f64) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE tasks SET process_duration = ?1 WHERE id = ?2",
            params![duration, task_id],
        )
        .map_err(|e| Error::database(format!("Failed to set task duration: {}", e)))?;
        Ok(())
    }

    /// Persist the ids of chunks stored so far; `TaskNotFound` once the task is gone
    pub fn update_chunk_ids(&self, task_id: &str, chunk_ids: &str) -> Result<()> {
        let conn = self.conn.lock();
        let updated = conn
            .execute(
                "UPDATE tasks SET chunk_ids = ?1 WHERE id = ?2",
                params![chunk_ids, task_id],
            )
            .map_err(|e| Error::database(format!("Failed to update chunk ids: {}", e)))?;
        if updated == 0 {
            return Err(Error::TaskNotFound(task_id.to_string()));
        }
        Ok(())
    }
}

// ==================== Row mapping ====================

const DOCUMENT_COLUMNS: &str = "id, kb_id, parser_id, parser_config, name, doc_type, location, size, \
    token_num, chunk_num, progress, progress_msg, run, process_begin_at, process_duration, meta_fields, created_at";

const TASK_COLUMNS: &str = "id, doc_id, from_page, to_page, task_type, digest, progress, progress_msg, \
    retry_count, chunk_ids, begin_at, process_duration, created_at";

fn json_column(row: &Row, idx: usize) -> rusqlite::Result<serde_json::Value> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn row_to_document(row: &Row) -> rusqlite::Result<Document> {
    let parser_id: String = row.get(2)?;
    let parser_id = ParserKind::parse(&parser_id).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            2,
            rusqlite::types::Type::Text,
            format!("unknown parser id '{}'", parser_id).into(),
        )
    })?;

    Ok(Document {
        id: row.get(0)?,
        kb_id: row.get(1)?,
        parser_id,
        parser_config: ParserConfig::from_value(json_column(row, 3)?),
        name: row.get(4)?,
        doc_type: DocumentType::parse(&row.get::<_, String>(5)?),
        location: row.get(6)?,
        size: row.get::<_, i64>(7)? as u64,
        token_num: row.get::<_, i64>(8)? as u64,
        chunk_num: row.get::<_, i64>(9)? as u64,
        progress: row.get::<_, f64>(10)? as f32,
        progress_msg: row.get(11)?,
        run: RunStatus::parse(&row.get::<_, String>(12)?),
        process_begin_at: row.get::<_, Option<DateTime<Utc>>>(13)?,
        process_duration: row.get(14)?,
        meta_fields: json_column(row, 15)?,
        created_at: row.get(16)?,
    })
}

fn row_to_task(row: &Row) -> rusqlite::Result<Task> {
    Ok(Task {
        id: row.get(0)?,
        doc_id: row.get(1)?,
        from_page: row.get::<_, i64>(2)? as u32,
        to_page: row.get::<_, i64>(3)? as u32,
        task_type: TaskType::parse(&row.get::<_, String>(4)?),
        digest: row.get(5)?,
        progress: row.get::<_, f64>(6)? as f32,
        progress_msg: row.get(7)?,
        retry_count: row.get::<_, i64>(8)? as u32,
        chunk_ids: row.get(9)?,
        begin_at: row.get::<_, Option<DateTime<Utc>>>(10)?,
        process_duration: row.get(11)?,
        created_at: row.get(12)?,
    })
}

fn load_document(conn: &Connection, id: &str) -> rusqlite::Result<Option<Document>> {
    conn.query_row(
        &format!("SELECT {} FROM documents WHERE id = ?1", DOCUMENT_COLUMNS),
        params![id],
        row_to_document,
    )
    .optional()
}

fn load_task(conn: &Connection, id: &str) -> rusqlite::Result<Option<Task>> {
    conn.query_row(
        &format!("SELECT {} FROM tasks WHERE id = ?1", TASK_COLUMNS),
        params![id],
        row_to_task,
    )
    .optional()
}

fn load_knowledgebase(conn: &Connection, id: &str) -> rusqlite::Result<Option<Knowledgebase>> {
    conn.query_row(
        r#"
        SELECT id, tenant_id, name, language, embd_id, pagerank, parser_config, token_num, chunk_num
        FROM knowledgebases WHERE id = ?1
        "#,
        params![id],
        |row| {
            Ok(Knowledgebase {
                id: row.get(0)?,
                tenant_id: row.get(1)?,
                name: row.get(2)?,
                language: row.get(3)?,
                embd_id: row.get(4)?,
                pagerank: row.get(5)?,
                parser_config: ParserConfig::from_value(json_column(row, 6)?),
                token_num: row.get::<_, i64>(7)? as u64,
                chunk_num: row.get::<_, i64>(8)? as u64,
            })
        },
    )
    .optional()
}

fn load_tenant(conn: &Connection, id: &str) -> rusqlite::Result<Option<Tenant>> {
    conn.query_row(
        "SELECT id, llm_id, embd_id, img2txt_id, asr_id FROM tenants WHERE id = ?1",
        params![id],
        |row| {
            Ok(Tenant {
                id: row.get(0)?,
                llm_id: row.get(1)?,
                embd_id: row.get(2)?,
                img2txt_id: row.get(3)?,
                asr_id: row.get(4)?,
            })
        },
    )
    .optional()
}

fn insert_task_row(conn: &Connection, task: &Task) -> rusqlite::Result<usize> {
    conn.execute(
        r#"
        INSERT OR IGNORE INTO tasks (
            id, doc_id, from_page, to_page, task_type, digest, progress, progress_msg,
            retry_count, chunk_ids, begin_at, process_duration, created_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
        "#,
        params![
            task.id,
            task.doc_id,
            task.from_page as i64,
            task.to_page as i64,
            task.task_type.as_str(),
            task.digest,
            task.progress as f64,
            task.progress_msg,
            task.retry_count as i64,
            task.chunk_ids,
            task.begin_at,
            task.process_duration,
            task.created_at,
        ],
    )
}
