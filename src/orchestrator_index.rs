//! Global hash -> (topic, container) map for dedup and fast resolution.
//!
//! This single process-wide database also hosts audit-log and auth tables
//! in the wider system; `global_index` is the only table this crate reads
//! or writes.

use std::path::Path;

use rusqlite::{params, Connection, OptionalExtension};

use crate::error::SiloResult;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS global_index (
    digest          TEXT PRIMARY KEY,
    topic           TEXT NOT NULL,
    container_name  TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_global_index_topic ON global_index(topic);
"#;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    pub topic: String,
    pub container_name: String,
}

pub struct OrchestratorIndex {
    pub conn: Connection,
}

impl OrchestratorIndex {
    pub fn open(path: &Path, busy_timeout_ms: u32) -> SiloResult<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "cache_size", -2000i64)?;
        conn.busy_timeout(std::time::Duration::from_millis(busy_timeout_ms as u64))?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    pub fn lookup(&self, digest_hex: &str) -> SiloResult<Option<IndexEntry>> {
        self.conn
            .query_row(
                "SELECT topic, container_name FROM global_index WHERE digest = ?1",
                params![digest_hex],
                |row| {
                    Ok(IndexEntry {
                        topic: row.get(0)?,
                        container_name: row.get(1)?,
                    })
                },
            )
            .optional()
            .map_err(Into::into)
    }

    /// Inserts `(digest, topic, container)` if no row exists for `digest`
    /// yet. Returns whether a row was inserted.
    pub fn insert_if_absent(
        &self,
        digest_hex: &str,
        topic: &str,
        container_name: &str,
    ) -> SiloResult<bool> {
        let changed = self.conn.execute(
            "INSERT OR IGNORE INTO global_index (digest, topic, container_name) VALUES (?1, ?2, ?3)",
            params![digest_hex, topic, container_name],
        )?;
        Ok(changed > 0)
    }

    /// Purges every row belonging to `topic`. Returns the number of rows
    /// removed.
    pub fn delete_topic(&self, topic: &str) -> SiloResult<usize> {
        let n = self
            .conn
            .execute("DELETE FROM global_index WHERE topic = ?1", params![topic])?;
        Ok(n)
    }

    pub fn count_for_topic(&self, topic: &str) -> SiloResult<u64> {
        let n: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM global_index WHERE topic = ?1",
            params![topic],
            |row| row.get(0),
        )?;
        Ok(n as u64)
    }

    pub fn distinct_topics(&self) -> SiloResult<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT DISTINCT topic FROM global_index ORDER BY topic")?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }
}

/// Inserts `(digest, topic, container)` within an externally-managed
/// transaction/connection (used by the write pipeline via
/// `TopicDb::attach_global_index`, where this table is reached as
/// `global_idx.global_index`). A unique-constraint violation here signals a
/// race and the caller should let the transaction abort.
pub fn insert_attached(
    conn: &Connection,
    digest_hex: &str,
    topic: &str,
    container_name: &str,
) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO global_idx.global_index (digest, topic, container_name) VALUES (?1, ?2, ?3)",
        params![digest_hex, topic, container_name],
    )?;
    Ok(())
}
