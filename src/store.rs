use rusqlite::{params, Connection};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::chunker::Chunk;
use crate::error::{HermesError, Result};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS chunks (
    chunk_id    INTEGER PRIMARY KEY,
    file_path   TEXT    NOT NULL,
    language    TEXT    NOT NULL,
    start_line  INTEGER NOT NULL,
    end_line    INTEGER NOT NULL,
    code_text   TEXT    NOT NULL,
    symbol_name TEXT    NOT NULL DEFAULT ''
);
CREATE INDEX IF NOT EXISTS idx_chunks_file ON chunks(file_path);
CREATE INDEX IF NOT EXISTS idx_chunks_lang ON chunks(language);
";

/// A chunk as persisted, with its store-assigned id.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkRecord {
    pub chunk_id: i64,
    pub file_path: String,
    pub language: String,
    pub start_line: u32,
    pub end_line: u32,
    pub code_text: String,
    pub symbol_name: String,
}

/// SQLite-backed store for chunk metadata.
///
/// Ids are assigned monotonically at insert time and define the row order of
/// the dense and sparse indices; `all_chunk_ids` in ascending order is the
/// row mapping.
pub struct MetadataStore {
    db_path: PathBuf,
    conn: Mutex<Option<Connection>>,
}

impl MetadataStore {
    pub fn open(db_path: &Path) -> Result<Self> {
        let conn = Connection::open(db_path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            db_path: db_path.to_path_buf(),
            conn: Mutex::new(Some(conn)),
        })
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let guard = self.conn.lock().expect("metadata store lock poisoned");
        match guard.as_ref() {
            Some(conn) => f(conn),
            None => Err(HermesError::Store(rusqlite::Error::InvalidQuery)),
        }
    }

    /// Insert a batch of chunks in one transaction; returns the assigned ids
    /// in input order (one contiguous ascending range).
    pub fn insert_chunks(&self, chunks: &[Chunk]) -> Result<Vec<i64>> {
        let mut guard = self.conn.lock().expect("metadata store lock poisoned");
        let conn = guard
            .as_mut()
            .ok_or(HermesError::Store(rusqlite::Error::InvalidQuery))?;

        let tx = conn.transaction()?;
        let mut ids = Vec::with_capacity(chunks.len());
        {
            let mut stmt = tx.prepare(
                "INSERT INTO chunks (file_path, language, start_line, end_line, code_text, symbol_name) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            for chunk in chunks {
                stmt.execute(params![
                    chunk.file_path,
                    chunk.language,
                    chunk.start_line,
                    chunk.end_line,
                    chunk.code_text,
                    chunk.symbol_name,
                ])?;
                ids.push(tx.last_insert_rowid());
            }
        }
        tx.commit()?;
        Ok(ids)
    }

    pub fn get_chunk(&self, chunk_id: i64) -> Result<Option<ChunkRecord>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT chunk_id, file_path, language, start_line, end_line, code_text, symbol_name \
                 FROM chunks WHERE chunk_id = ?1",
            )?;
            let mut rows = stmt.query_map(params![chunk_id], row_to_record)?;
            match rows.next() {
                Some(row) => Ok(Some(row?)),
                None => Ok(None),
            }
        })
    }

    /// Fetch records for `chunk_ids`, preserving the input order and
    /// skipping ids that are not present.
    pub fn get_chunks_by_ids(&self, chunk_ids: &[i64]) -> Result<Vec<ChunkRecord>> {
        if chunk_ids.is_empty() {
            return Ok(Vec::new());
        }
        self.with_conn(|conn| {
            let placeholders = vec!["?"; chunk_ids.len()].join(",");
            let sql = format!(
                "SELECT chunk_id, file_path, language, start_line, end_line, code_text, symbol_name \
                 FROM chunks WHERE chunk_id IN ({placeholders})"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(rusqlite::params_from_iter(chunk_ids.iter()), row_to_record)?;

            let mut by_id = std::collections::HashMap::with_capacity(chunk_ids.len());
            for row in rows {
                let record = row?;
                by_id.insert(record.chunk_id, record);
            }
            Ok(chunk_ids
                .iter()
                .filter_map(|id| by_id.remove(id))
                .collect())
        })
    }

    /// All chunk ids in ascending order; this sequence is the row mapping of
    /// the dense and sparse indices.
    pub fn all_chunk_ids(&self) -> Result<Vec<i64>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT chunk_id FROM chunks ORDER BY chunk_id")?;
            let rows = stmt.query_map([], |row| row.get::<_, i64>(0))?;
            let mut ids = Vec::new();
            for row in rows {
                ids.push(row?);
            }
            Ok(ids)
        })
    }

    /// `code_text` for every chunk, in ascending-id order.
    pub fn all_texts(&self) -> Result<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT code_text FROM chunks ORDER BY chunk_id")?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            let mut texts = Vec::new();
            for row in rows {
                texts.push(row?);
            }
            Ok(texts)
        })
    }

    pub fn count(&self) -> Result<usize> {
        self.with_conn(|conn| {
            let n: i64 = conn.query_row("SELECT COUNT(*) FROM chunks", [], |row| row.get(0))?;
            Ok(n as usize)
        })
    }

    /// Release the underlying connection. Idempotent; later calls on a
    /// closed store fail with a store error.
    pub fn close(&self) {
        let mut guard = self.conn.lock().expect("metadata store lock poisoned");
        guard.take();
    }
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<ChunkRecord> {
    Ok(ChunkRecord {
        chunk_id: row.get(0)?,
        file_path: row.get(1)?,
        language: row.get(2)?,
        start_line: row.get(3)?,
        end_line: row.get(4)?,
        code_text: row.get(5)?,
        symbol_name: row.get(6)?,
    })
}
