//! Per-topic relational store: assets, metadata log, materialised
//! metadata, and DAT chain heads.

use std::path::Path;

use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{SiloError, SiloResult};

/// One row of the `assets` table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Asset {
    pub asset_id: String,
    pub size: u64,
    pub origin_name: Option<String>,
    pub parent_id: Option<String>,
    pub extension: String,
    pub container_name: String,
    pub byte_offset: u64,
    pub created_at: i64,
}

/// The stored running chain head for one container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainHead {
    pub container_name: String,
    pub chain_hash: String,
    pub entry_count: u64,
    pub updated_at: i64,
}

/// A single metadata log entry.
#[derive(Debug, Clone, PartialEq)]
pub struct MetadataLogEntry {
    pub id: i64,
    pub asset_id: String,
    pub op: MetadataOp,
    pub key: String,
    pub value_text: Option<String>,
    pub value_num: Option<f64>,
    pub processor: String,
    pub processor_version: String,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetadataOp {
    Set,
    Delete,
}

impl MetadataOp {
    fn as_str(self) -> &'static str {
        match self {
            MetadataOp::Set => "set",
            MetadataOp::Delete => "delete",
        }
    }

    fn from_str(s: &str) -> SiloResult<Self> {
        match s {
            "set" => Ok(MetadataOp::Set),
            "delete" => Ok(MetadataOp::Delete),
            other => Err(SiloError::Internal(format!("unknown metadata op {other}"))),
        }
    }
}

/// An open connection to one topic's SQLite database, schema applied.
pub struct TopicDb {
    pub conn: Connection,
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS assets (
    asset_id        TEXT PRIMARY KEY,
    size            INTEGER NOT NULL,
    origin_name     TEXT,
    parent_id       TEXT,
    extension       TEXT NOT NULL,
    container_name  TEXT NOT NULL,
    byte_offset     INTEGER NOT NULL,
    created_at      INTEGER NOT NULL,
    UNIQUE (container_name, byte_offset)
);
CREATE INDEX IF NOT EXISTS idx_assets_parent_id ON assets(parent_id);
CREATE INDEX IF NOT EXISTS idx_assets_created_at ON assets(created_at);
CREATE INDEX IF NOT EXISTS idx_assets_extension ON assets(extension);
CREATE INDEX IF NOT EXISTS idx_assets_origin_name ON assets(origin_name);

CREATE TABLE IF NOT EXISTS metadata_log (
    id                  INTEGER PRIMARY KEY AUTOINCREMENT,
    asset_id            TEXT NOT NULL REFERENCES assets(asset_id),
    op                  TEXT NOT NULL CHECK (op IN ('set', 'delete')),
    key                 TEXT NOT NULL,
    value_text          TEXT,
    value_num           REAL,
    processor           TEXT NOT NULL,
    processor_version   TEXT NOT NULL,
    timestamp           INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_metadata_log_asset_id ON metadata_log(asset_id);
CREATE INDEX IF NOT EXISTS idx_metadata_log_key ON metadata_log(key);
CREATE INDEX IF NOT EXISTS idx_metadata_log_processor ON metadata_log(processor);

CREATE TABLE IF NOT EXISTS metadata_computed (
    asset_id        TEXT PRIMARY KEY REFERENCES assets(asset_id),
    metadata_json   TEXT NOT NULL,
    updated_at      INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS chain_heads (
    container_name  TEXT PRIMARY KEY,
    chain_hash      TEXT NOT NULL,
    entry_count     INTEGER NOT NULL,
    updated_at      INTEGER NOT NULL
);
"#;

impl TopicDb {
    /// Opens (creating if absent) the topic database at `path`, enables WAL
    /// journaling and foreign key enforcement, applies a bounded busy
    /// timeout, and ensures the schema exists.
    pub fn open(path: &Path, busy_timeout_ms: u32) -> SiloResult<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", true)?;
        // A small per-connection page cache; each topic gets its own
        // connection so this stays modest rather than a shared pool setting.
        conn.pragma_update(None, "cache_size", -2000i64)?;
        conn.busy_timeout(std::time::Duration::from_millis(busy_timeout_ms as u64))?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    /// Attaches the orchestrator index database under the schema alias
    /// `global_idx`, so the write pipeline can update both the topic's
    /// tables and the global index inside one atomic SQLite transaction.
    pub fn attach_global_index(&self, path: &Path) -> SiloResult<()> {
        let path_str = path
            .to_str()
            .ok_or_else(|| SiloError::Internal("non-UTF8 orchestrator path".into()))?;
        self.conn
            .execute("ATTACH DATABASE ?1 AS global_idx", params![path_str])?;
        Ok(())
    }

    pub fn get_asset(&self, asset_id: &str) -> SiloResult<Option<Asset>> {
        self.conn
            .query_row(
                "SELECT asset_id, size, origin_name, parent_id, extension, container_name, byte_offset, created_at
                 FROM assets WHERE asset_id = ?1",
                params![asset_id],
                Self::row_to_asset,
            )
            .optional()
            .map_err(SiloError::from)
    }

    pub fn get_chain_head(&self, container_name: &str) -> SiloResult<Option<ChainHead>> {
        self.conn
            .query_row(
                "SELECT container_name, chain_hash, entry_count, updated_at FROM chain_heads WHERE container_name = ?1",
                params![container_name],
                |row| {
                    Ok(ChainHead {
                        container_name: row.get(0)?,
                        chain_hash: row.get(1)?,
                        entry_count: row.get::<_, i64>(2)? as u64,
                        updated_at: row.get(3)?,
                    })
                },
            )
            .optional()
            .map_err(SiloError::from)
    }

    pub fn list_chain_heads(&self) -> SiloResult<Vec<ChainHead>> {
        let mut stmt = self
            .conn
            .prepare("SELECT container_name, chain_hash, entry_count, updated_at FROM chain_heads")?;
        let rows = stmt.query_map([], |row| {
            Ok(ChainHead {
                container_name: row.get(0)?,
                chain_hash: row.get(1)?,
                entry_count: row.get::<_, i64>(2)? as u64,
                updated_at: row.get(3)?,
            })
        })?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    pub fn get_metadata_computed(&self, asset_id: &str) -> SiloResult<Option<serde_json::Value>> {
        let json: Option<String> = self
            .conn
            .query_row(
                "SELECT metadata_json FROM metadata_computed WHERE asset_id = ?1",
                params![asset_id],
                |row| row.get(0),
            )
            .optional()?;
        match json {
            None => Ok(None),
            Some(s) => Ok(Some(serde_json::from_str(&s).map_err(|e| {
                SiloError::Internal(format!("corrupt metadata_computed json: {e}"))
            })?)),
        }
    }

    pub fn list_metadata_log_for_asset(&self, asset_id: &str) -> SiloResult<Vec<MetadataLogEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, asset_id, op, key, value_text, value_num, processor, processor_version, timestamp
             FROM metadata_log WHERE asset_id = ?1 ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![asset_id], Self::row_to_log_entry)?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    fn row_to_asset(row: &rusqlite::Row) -> rusqlite::Result<Asset> {
        Ok(Asset {
            asset_id: row.get(0)?,
            size: row.get::<_, i64>(1)? as u64,
            origin_name: row.get(2)?,
            parent_id: row.get(3)?,
            extension: row.get(4)?,
            container_name: row.get(5)?,
            byte_offset: row.get::<_, i64>(6)? as u64,
            created_at: row.get(7)?,
        })
    }

    fn row_to_log_entry(row: &rusqlite::Row) -> rusqlite::Result<MetadataLogEntry> {
        let op_str: String = row.get(2)?;
        Ok(MetadataLogEntry {
            id: row.get(0)?,
            asset_id: row.get(1)?,
            op: MetadataOp::from_str(&op_str).unwrap_or(MetadataOp::Set),
            key: row.get(3)?,
            value_text: row.get(4)?,
            value_num: row.get(5)?,
            processor: row.get(6)?,
            processor_version: row.get(7)?,
            timestamp: row.get(8)?,
        })
    }
}

/// Inserts an asset row within an already-open transaction/connection.
pub fn insert_asset(conn: &Connection, asset: &Asset) -> SiloResult<()> {
    conn.execute(
        "INSERT INTO assets (asset_id, size, origin_name, parent_id, extension, container_name, byte_offset, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            asset.asset_id,
            asset.size as i64,
            asset.origin_name,
            asset.parent_id,
            asset.extension,
            asset.container_name,
            asset.byte_offset as i64,
            asset.created_at,
        ],
    )?;
    Ok(())
}

/// Upserts a container's chain head within an already-open
/// transaction/connection.
pub fn upsert_chain_head(
    conn: &Connection,
    container_name: &str,
    chain_hash: &str,
    entry_count: u64,
    updated_at: i64,
) -> SiloResult<()> {
    conn.execute(
        "INSERT INTO chain_heads (container_name, chain_hash, entry_count, updated_at)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(container_name) DO UPDATE SET
            chain_hash = excluded.chain_hash,
            entry_count = excluded.entry_count,
            updated_at = excluded.updated_at",
        params![container_name, chain_hash, entry_count as i64, updated_at],
    )?;
    Ok(())
}

/// Inserts one metadata log row. Returns the new row's autoincrement id.
pub fn insert_metadata_log(
    conn: &Connection,
    asset_id: &str,
    op: MetadataOp,
    key: &str,
    value_text: Option<&str>,
    value_num: Option<f64>,
    processor: &str,
    processor_version: &str,
    timestamp: i64,
) -> SiloResult<i64> {
    conn.execute(
        "INSERT INTO metadata_log (asset_id, op, key, value_text, value_num, processor, processor_version, timestamp)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![asset_id, op.as_str(), key, value_text, value_num, processor, processor_version, timestamp],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Replaces the materialised metadata row for `asset_id`.
pub fn upsert_metadata_computed(
    conn: &Connection,
    asset_id: &str,
    metadata_json: &serde_json::Value,
    updated_at: i64,
) -> SiloResult<()> {
    let json_text = serde_json::to_string(metadata_json)
        .map_err(|e| SiloError::Internal(format!("metadata serialisation failed: {e}")))?;
    conn.execute(
        "INSERT INTO metadata_computed (asset_id, metadata_json, updated_at)
         VALUES (?1, ?2, ?3)
         ON CONFLICT(asset_id) DO UPDATE SET
            metadata_json = excluded.metadata_json,
            updated_at = excluded.updated_at",
        params![asset_id, json_text, updated_at],
    )?;
    Ok(())
}
