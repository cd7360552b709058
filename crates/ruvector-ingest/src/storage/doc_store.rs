//! SQLite document store with an FTS5 shadow index
//!
//! Chunks are kept as JSON documents keyed by `(index_name, id)`; the
//! searchable text columns are mirrored into `chunks_fts` by triggers.

use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::providers::doc_store::{ChunkFilter, DocStore};
use crate::types::{Chunk, ParserKind};

/// SQLite-backed chunk store
#[derive(Clone)]
pub struct SqliteDocStore {
    conn: Arc<Mutex<Connection>>,
    unsupported: HashSet<ParserKind>,
}

impl SqliteDocStore {
    /// Create or open the store at the given path
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)
            .map_err(|e| Error::doc_store(format!("Failed to open document store: {}", e)))?;
        Self::with_connection(conn)
    }

    /// Create an in-memory store
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| Error::doc_store(format!("Failed to open in-memory store: {}", e)))?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
            unsupported: HashSet::new(),
        };
        store.migrate()?;
        Ok(store)
    }

    /// Refuse chunks produced by the given parsers
    pub fn with_unsupported_parsers(mut self, parsers: impl IntoIterator<Item = ParserKind>) -> Self {
        self.unsupported.extend(parsers);
        self
    }

    fn migrate(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute_batch(r#"
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;
            PRAGMA busy_timeout=5000;

            CREATE TABLE IF NOT EXISTS indexes (
                index_name TEXT NOT NULL,
                kb_id TEXT NOT NULL,
                vector_size INTEGER NOT NULL,
                PRIMARY KEY (index_name, kb_id)
            );

            CREATE TABLE IF NOT EXISTS chunks (
                index_name TEXT NOT NULL,
                id TEXT NOT NULL,
                kb_id TEXT NOT NULL,
                doc_id TEXT NOT NULL,
                idx INTEGER NOT NULL,
                content TEXT NOT NULL,
                tokens TEXT NOT NULL,
                data TEXT NOT NULL,
                UNIQUE (index_name, id)
            );

            CREATE INDEX IF NOT EXISTS idx_chunks_doc ON chunks(index_name, doc_id, idx);
            CREATE INDEX IF NOT EXISTS idx_chunks_kb ON chunks(index_name, kb_id);

            CREATE VIRTUAL TABLE IF NOT EXISTS chunks_fts USING fts5(
                content,
                tokens,
                content='chunks',
                content_rowid='rowid'
            );

            CREATE TRIGGER IF NOT EXISTS chunks_ai AFTER INSERT ON chunks BEGIN
                INSERT INTO chunks_fts(rowid, content, tokens)
                VALUES (NEW.rowid, NEW.content, NEW.tokens);
            END;

            CREATE TRIGGER IF NOT EXISTS chunks_ad AFTER DELETE ON chunks BEGIN
                INSERT INTO chunks_fts(chunks_fts, rowid, content, tokens)
                VALUES ('delete', OLD.rowid, OLD.content, OLD.tokens);
            END;

            CREATE TRIGGER IF NOT EXISTS chunks_au AFTER UPDATE ON chunks BEGIN
                INSERT INTO chunks_fts(chunks_fts, rowid, content, tokens)
                VALUES ('delete', OLD.rowid, OLD.content, OLD.tokens);
                INSERT INTO chunks_fts(rowid, content, tokens)
                VALUES (NEW.rowid, NEW.content, NEW.tokens);
            END;
        "#)
        .map_err(|e| Error::doc_store(format!("Failed to run migrations: {}", e)))?;

        Ok(())
    }

    /// Number of chunks stored in an index for a knowledge base
    pub fn count(&self, index: &str, kb_id: &str) -> Result<usize> {
        let conn = self.conn.lock();
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM chunks WHERE index_name = ?1 AND kb_id = ?2",
                params![index, kb_id],
                |row| row.get(0),
            )
            .map_err(|e| Error::doc_store(format!("Failed to count chunks: {}", e)))?;
        Ok(count as usize)
    }

    /// Fetch one chunk by id
    pub fn get(&self, index: &str, id: &str) -> Result<Option<Chunk>> {
        let conn = self.conn.lock();
        let data: Option<String> = conn
            .query_row(
                "SELECT data FROM chunks WHERE index_name = ?1 AND id = ?2",
                params![index, id],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| Error::doc_store(format!("Failed to get chunk: {}", e)))?;
        data.map(|d| serde_json::from_str(&d).map_err(Error::from)).transpose()
    }

    /// Full-text match over content and token fields, best first
    pub fn search_text(&self, index: &str, query: &str, limit: usize) -> Result<Vec<Chunk>> {
        let conn = self.conn.lock();
        let fts_query = format!("\"{}\"", query.replace('"', "\"\""));
        let mut stmt = conn
            .prepare(
                r#"
                SELECT c.data FROM chunks_fts f
                JOIN chunks c ON c.rowid = f.rowid
                WHERE chunks_fts MATCH ?1 AND c.index_name = ?2
                ORDER BY bm25(chunks_fts)
                LIMIT ?3
                "#,
            )
            .map_err(|e| Error::doc_store(format!("Failed to prepare FTS query: {}", e)))?;

        let rows = stmt
            .query_map(params![fts_query, index, limit as i64], |row| row.get::<_, String>(0))
            .map_err(|e| Error::doc_store(format!("Failed to execute FTS query: {}", e)))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| Error::doc_store(format!("Failed to read FTS row: {}", e)))?;

        rows.iter()
            .map(|d| serde_json::from_str(d).map_err(Error::from))
            .collect()
    }

    fn selected_ids(conn: &Connection, filter: &ChunkFilter, index: &str, kb_id: &str) -> rusqlite::Result<Vec<String>> {
        let mut sql = String::from("SELECT id FROM chunks WHERE index_name = ? AND kb_id = ?");
        let mut args: Vec<String> = vec![index.to_string(), kb_id.to_string()];
        if let Some(doc_id) = &filter.doc_id {
            sql.push_str(" AND doc_id = ?");
            args.push(doc_id.clone());
        }
        if !filter.ids.is_empty() {
            sql.push_str(" AND id IN (");
            sql.push_str(&vec!["?"; filter.ids.len()].join(", "));
            sql.push(')');
            args.extend(filter.ids.iter().cloned());
        }
        let mut stmt = conn.prepare(&sql)?;
        let ids = stmt
            .query_map(params_from_iter(args.iter()), |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(ids)
    }
}

fn token_text(chunk: &Chunk) -> String {
    [
        chunk.content_ltks.as_str(),
        chunk.title_tks.as_str(),
        chunk.important_tks.as_str(),
        chunk.question_tks.as_str(),
    ]
    .iter()
    .filter(|s| !s.is_empty())
    .copied()
    .collect::<Vec<_>>()
    .join(" ")
}

#[async_trait]
impl DocStore for SqliteDocStore {
    async fn create_index(&self, index: &str, kb_id: &str, vector_size: usize) -> Result<()> {
        let conn = self.conn.lock();
        let created = conn
            .execute(
                "INSERT OR IGNORE INTO indexes (index_name, kb_id, vector_size) VALUES (?1, ?2, ?3)",
                params![index, kb_id, vector_size as i64],
            )
            .map_err(|e| Error::doc_store(format!("Failed to create index: {}", e)))?;
        if created > 0 {
            tracing::info!("Created index {} for kb {} (dim {})", index, kb_id, vector_size);
        }
        Ok(())
    }

    async fn index_exists(&self, index: &str, kb_id: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM indexes WHERE index_name = ?1 AND kb_id = ?2",
                params![index, kb_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| Error::doc_store(format!("Failed to check index: {}", e)))?;
        Ok(found.is_some())
    }

    async fn insert(&self, chunks: &[Chunk], index: &str, kb_id: &str) -> Result<()> {
        if chunks.is_empty() {
            return Ok(());
        }
        if !self.index_exists(index, kb_id).await? {
            return Err(Error::doc_store(format!("Index {} does not exist for kb {}", index, kb_id)));
        }

        let mut conn = self.conn.lock();
        let tx = conn
            .transaction()
            .map_err(|e| Error::doc_store(format!("Failed to begin transaction: {}", e)))?;
        {
            let mut stmt = tx
                .prepare(
                    r#"
                    INSERT INTO chunks (index_name, id, kb_id, doc_id, idx, content, tokens, data)
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                    ON CONFLICT(index_name, id) DO UPDATE SET
                        kb_id = excluded.kb_id,
                        doc_id = excluded.doc_id,
                        idx = excluded.idx,
                        content = excluded.content,
                        tokens = excluded.tokens,
                        data = excluded.data
                    "#,
                )
                .map_err(|e| Error::doc_store(format!("Failed to prepare statement: {}", e)))?;

            for chunk in chunks {
                stmt.execute(params![
                    index,
                    chunk.id,
                    kb_id,
                    chunk.doc_id,
                    chunk.idx,
                    chunk.content_with_weight,
                    token_text(chunk),
                    serde_json::to_string(chunk)?,
                ])
                .map_err(|e| Error::doc_store(format!("Failed to insert chunk {}: {}", chunk.id, e)))?;
            }
        }
        tx.commit()
            .map_err(|e| Error::doc_store(format!("Failed to commit chunks: {}", e)))?;
        Ok(())
    }

    async fn update(
        &self,
        filter: &ChunkFilter,
        patch: &serde_json::Value,
        index: &str,
        kb_id: &str,
    ) -> Result<usize> {
        let Some(fields) = patch.as_object() else {
            return Err(Error::doc_store("Update patch must be a JSON object"));
        };
        if filter.is_empty() {
            return Ok(0);
        }

        let mut conn = self.conn.lock();
        let tx = conn
            .transaction()
            .map_err(|e| Error::doc_store(format!("Failed to begin transaction: {}", e)))?;

        let ids = Self::selected_ids(&tx, filter, index, kb_id)
            .map_err(|e| Error::doc_store(format!("Failed to select chunks: {}", e)))?;
        for id in &ids {
            let data: String = tx
                .query_row(
                    "SELECT data FROM chunks WHERE index_name = ?1 AND id = ?2",
                    params![index, id],
                    |row| row.get(0),
                )
                .map_err(|e| Error::doc_store(format!("Failed to load chunk {}: {}", id, e)))?;

            let mut value: serde_json::Value = serde_json::from_str(&data)?;
            if let Some(obj) = value.as_object_mut() {
                for (k, v) in fields {
                    obj.insert(k.clone(), v.clone());
                }
            }
            let chunk: Chunk = serde_json::from_value(value)
                .map_err(|e| Error::doc_store(format!("Invalid patch for chunk {}: {}", id, e)))?;

            tx.execute(
                "UPDATE chunks SET content = ?1, tokens = ?2, data = ?3 WHERE index_name = ?4 AND id = ?5",
                params![
                    chunk.content_with_weight,
                    token_text(&chunk),
                    serde_json::to_string(&chunk)?,
                    index,
                    id
                ],
            )
            .map_err(|e| Error::doc_store(format!("Failed to update chunk {}: {}", id, e)))?;
        }

        tx.commit()
            .map_err(|e| Error::doc_store(format!("Failed to commit update: {}", e)))?;
        Ok(ids.len())
    }

    async fn delete(&self, filter: &ChunkFilter, index: &str, kb_id: &str) -> Result<usize> {
        if filter.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction()
            .map_err(|e| Error::doc_store(format!("Failed to begin transaction: {}", e)))?;

        let ids = Self::selected_ids(&tx, filter, index, kb_id)
            .map_err(|e| Error::doc_store(format!("Failed to select chunks: {}", e)))?;
        for id in &ids {
            tx.execute(
                "DELETE FROM chunks WHERE index_name = ?1 AND id = ?2",
                params![index, id],
            )
            .map_err(|e| Error::doc_store(format!("Failed to delete chunk {}: {}", id, e)))?;
        }

        tx.commit()
            .map_err(|e| Error::doc_store(format!("Failed to commit delete: {}", e)))?;
        if !ids.is_empty() {
            tracing::debug!("Deleted {} chunks from {}", ids.len(), index);
        }
        Ok(ids.len())
    }

    async fn chunk_list(&self, doc_id: &str, index: &str, kb_ids: &[String]) -> Result<Vec<Chunk>> {
        if kb_ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.conn.lock();
        let sql = format!(
            "SELECT data FROM chunks WHERE index_name = ? AND doc_id = ? AND kb_id IN ({}) ORDER BY idx ASC",
            vec!["?"; kb_ids.len()].join(", ")
        );
        let mut args = vec![index.to_string(), doc_id.to_string()];
        args.extend(kb_ids.iter().cloned());

        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| Error::doc_store(format!("Failed to prepare query: {}", e)))?;
        let rows = stmt
            .query_map(params_from_iter(args.iter()), |row| row.get::<_, String>(0))
            .map_err(|e| Error::doc_store(format!("Failed to list chunks: {}", e)))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| Error::doc_store(format!("Failed to read chunk: {}", e)))?;

        rows.iter()
            .map(|d| serde_json::from_str(d).map_err(Error::from))
            .collect()
    }

    async fn all_tags(&self, index: &str, kb_ids: &[String]) -> Result<BTreeMap<String, u64>> {
        if kb_ids.is_empty() {
            return Ok(BTreeMap::new());
        }
        let conn = self.conn.lock();
        let sql = format!(
            "SELECT data FROM chunks WHERE index_name = ? AND kb_id IN ({})",
            vec!["?"; kb_ids.len()].join(", ")
        );
        let mut args = vec![index.to_string()];
        args.extend(kb_ids.iter().cloned());

        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| Error::doc_store(format!("Failed to prepare query: {}", e)))?;
        let rows = stmt
            .query_map(params_from_iter(args.iter()), |row| row.get::<_, String>(0))
            .map_err(|e| Error::doc_store(format!("Failed to list tags: {}", e)))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| Error::doc_store(format!("Failed to read chunk: {}", e)))?;

        let mut tags = BTreeMap::new();
        for data in rows {
            let chunk: Chunk = serde_json::from_str(&data)?;
            for tag in chunk.tag_kwd {
                *tags.entry(tag).or_insert(0) += 1;
            }
        }
        Ok(tags)
    }

    fn supports_parser(&self, parser: ParserKind) -> bool {
        !self.unsupported.contains(&parser)
    }

    fn name(&self) -> &str {
        "sqlite"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn chunk(doc: &str, content: &str, idx: i64) -> Chunk {
        let mut c = Chunk::new(doc, "kb1", content);
        c.idx = idx;
        c.content_ltks = content.to_lowercase();
        c
    }

    async fn store() -> SqliteDocStore {
        let store = SqliteDocStore::in_memory().unwrap();
        store.create_index("ruvector_t1", "kb1", 4).await.unwrap();
        store
    }

    #[tokio::test]
    async fn test_create_index_is_idempotent() {
        let store = store().await;
        store.create_index("ruvector_t1", "kb1", 4).await.unwrap();
        assert!(store.index_exists("ruvector_t1", "kb1").await.unwrap());
        assert!(!store.index_exists("ruvector_t1", "kb2").await.unwrap());
    }

    #[tokio::test]
    async fn test_insert_is_upsert() {
        let store = store().await;
        let c = chunk("d1", "Hello world", 1);
        store.insert(&[c.clone()], "ruvector_t1", "kb1").await.unwrap();
        store.insert(&[c.clone()], "ruvector_t1", "kb1").await.unwrap();
        assert_eq!(store.count("ruvector_t1", "kb1").unwrap(), 1);

        let hits = store.search_text("ruvector_t1", "hello", 10).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, c.id);
    }

    #[tokio::test]
    async fn test_insert_requires_index() {
        let store = SqliteDocStore::in_memory().unwrap();
        let err = store.insert(&[chunk("d1", "x", 1)], "ruvector_t1", "kb1").await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn test_chunk_list_orders_by_idx() {
        let store = store().await;
        let chunks = vec![chunk("d1", "b", 2), chunk("d1", "a", 1), chunk("d2", "c", 1)];
        store.insert(&chunks, "ruvector_t1", "kb1").await.unwrap();

        let listed = store.chunk_list("d1", "ruvector_t1", &["kb1".to_string()]).await.unwrap();
        assert_eq!(listed.iter().map(|c| c.idx).collect::<Vec<_>>(), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_delete_and_update() {
        let store = store().await;
        let a = chunk("d1", "alpha", 1);
        let b = chunk("d1", "beta", 2);
        store.insert(&[a.clone(), b.clone()], "ruvector_t1", "kb1").await.unwrap();

        assert_eq!(store.delete(&ChunkFilter::default(), "ruvector_t1", "kb1").await.unwrap(), 0);

        let updated = store
            .update(&ChunkFilter::ids([a.id.clone()]), &json!({"important_kwd": ["greek"]}), "ruvector_t1", "kb1")
            .await
            .unwrap();
        assert_eq!(updated, 1);
        let loaded = store.get("ruvector_t1", &a.id).unwrap().unwrap();
        assert_eq!(loaded.important_kwd, vec!["greek".to_string()]);

        let deleted = store.delete(&ChunkFilter::ids([a.id.clone()]), "ruvector_t1", "kb1").await.unwrap();
        assert_eq!(deleted, 1);
        assert!(store.get("ruvector_t1", &a.id).unwrap().is_none());
        assert_eq!(store.delete(&ChunkFilter::doc("d1"), "ruvector_t1", "kb1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_all_tags_counts() {
        let store = store().await;
        let mut a = chunk("d1", "alpha", 1);
        a.tag_kwd = vec!["finance".into(), "tax".into()];
        let mut b = chunk("d1", "beta", 2);
        b.tag_kwd = vec!["finance".into()];
        store.insert(&[a, b], "ruvector_t1", "kb1").await.unwrap();

        let tags = store.all_tags("ruvector_t1", &["kb1".to_string()]).await.unwrap();
        assert_eq!(tags.get("finance"), Some(&2));
        assert_eq!(tags.get("tax"), Some(&1));
    }

    #[test]
    fn test_unsupported_parsers() {
        let store = SqliteDocStore::in_memory()
            .unwrap()
            .with_unsupported_parsers([ParserKind::Table]);
        assert!(!store.supports_parser(ParserKind::Table));
        assert!(store.supports_parser(ParserKind::Naive));
    }
}
