//! Topic discovery, health classification, and global index reconciliation.
//!
//! Run on startup and on a periodic schedule. Discovery never writes to a
//! topic's own database; it only reads chain heads to classify health and
//! writes to the global index.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;
use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::error::SiloResult;
use crate::orchestrator_index::OrchestratorIndex;
use crate::topicdb::TopicDb;
use crate::verifier::{self, Control, VerifyMode};

pub const INTERNAL_DIR: &str = ".internal";

fn topic_name_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-z0-9_-]{1,64}$").expect("valid regex"))
}

pub fn is_valid_topic_name(name: &str) -> bool {
    topic_name_re().is_match(name)
}

/// The outcome of discovering and classifying one topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicStatus {
    pub name: String,
    pub healthy: bool,
    pub detail: Option<String>,
}

/// Enumerates immediate child directories of `working_dir` that look like
/// topics: a name matching the topic regex, not the reserved internal
/// directory, sorted by directory creation time (oldest first) so that
/// collision resolution in [`reconcile_global_index`] is deterministic and
/// favours whichever topic existed first.
fn candidate_topic_dirs(working_dir: &Path) -> SiloResult<Vec<PathBuf>> {
    let mut candidates = Vec::new();
    let entries = match std::fs::read_dir(working_dir) {
        Ok(it) => it,
        Err(_) => return Ok(Vec::new()),
    };
    for entry in entries {
        let entry = entry.map_err(|e| crate::error::SiloError::io(working_dir, e))?;
        if !entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
            continue;
        }
        let name = entry.file_name();
        let name = match name.to_str() {
            Some(s) => s,
            None => continue,
        };
        if name == INTERNAL_DIR || !is_valid_topic_name(name) {
            continue;
        }
        candidates.push(entry.path());
    }

    candidates.sort_by_key(|path| {
        std::fs::metadata(path)
            .and_then(|m| m.created().or_else(|_| m.modified()))
            .unwrap_or(std::time::SystemTime::UNIX_EPOCH)
    });
    Ok(candidates)
}

fn topic_name_of(dir: &Path) -> String {
    dir.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Opens and classifies one topic directory, replaying every recorded
/// chain head in light mode. A mismatch marks the topic unhealthy; the
/// topic is left exactly as found (no automatic repair).
pub fn classify_topic(topic_dir: &Path, config: &EngineConfig) -> SiloResult<(TopicStatus, Option<TopicDb>)> {
    let name = topic_name_of(topic_dir);
    let db_path = topic_dir.join(INTERNAL_DIR).join(format!("{name}.db"));
    if !db_path.exists() {
        return Ok((
            TopicStatus {
                name,
                healthy: false,
                detail: Some("missing topic database".into()),
            },
            None,
        ));
    }
    // A zero-container topic (a fresh database with nothing uploaded yet)
    // is legal; `list` only rejects malformed filenames, not emptiness.
    crate::datset::list(topic_dir)?;

    let db = TopicDb::open(&db_path, config.busy_timeout_ms)?;
    match verifier::verify_topic(topic_dir, &db, VerifyMode::Light, config.progress_interval, |_| {
        Control::Continue
    }) {
        Ok(()) => Ok((
            TopicStatus {
                name,
                healthy: true,
                detail: None,
            },
            Some(db),
        )),
        Err(e) => {
            warn!(topic = %name, error = %e, "topic marked unhealthy");
            Ok((
                TopicStatus {
                    name,
                    healthy: false,
                    detail: Some(e.to_string()),
                },
                Some(db),
            ))
        }
    }
}

/// Populates the global index from one healthy topic's asset table.
/// `insert_if_absent` is a no-op for digests already claimed, so calling
/// this over topics in creation order makes the earliest topic the
/// permanent owner of any collided digest.
fn index_topic_assets(orchestrator: &OrchestratorIndex, topic_name: &str, db: &TopicDb) -> SiloResult<u64> {
    let mut stmt = db
        .conn
        .prepare("SELECT asset_id, container_name FROM assets")?;
    let rows = stmt.query_map([], |row| {
        let digest: String = row.get(0)?;
        let container: String = row.get(1)?;
        Ok((digest, container))
    })?;

    let mut inserted = 0u64;
    for row in rows {
        let (digest, container) = row?;
        if orchestrator.insert_if_absent(&digest, topic_name, &container)? {
            inserted += 1;
        }
    }
    Ok(inserted)
}

/// Purges global-index rows whose topic directory no longer exists, and
/// logs an audit event for each reconciled topic.
pub fn reconcile_global_index(working_dir: &Path, orchestrator: &OrchestratorIndex) -> SiloResult<Vec<String>> {
    let mut reconciled = Vec::new();
    for topic in orchestrator.distinct_topics()? {
        if !working_dir.join(&topic).is_dir() {
            let purged = orchestrator.delete_topic(&topic)?;
            warn!(topic = %topic, purged_rows = purged, "reconciliation: topic directory gone, index purged");
            reconciled.push(topic);
        }
    }
    Ok(reconciled)
}

/// Runs a full discovery pass: enumerate candidate topics, classify their
/// health, index healthy topics' assets into the global index, then
/// reconcile stale entries. Returns the status of every topic considered.
pub fn run(working_dir: &Path, orchestrator: &OrchestratorIndex, config: &EngineConfig) -> SiloResult<Vec<TopicStatus>> {
    let mut statuses = Vec::new();

    for dir in candidate_topic_dirs(working_dir)? {
        let (status, db) = classify_topic(&dir, config)?;
        if status.healthy {
            if let Some(db) = &db {
                let added = index_topic_assets(orchestrator, &status.name, db)?;
                info!(topic = %status.name, new_index_rows = added, "topic discovered and indexed");
            }
        }
        statuses.push(status);
    }

    reconcile_global_index(working_dir, orchestrator)?;
    Ok(statuses)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{self, TopicHandle};
    use tempfile::tempdir;

    fn config() -> EngineConfig {
        EngineConfig::default()
    }

    #[test]
    fn discovers_and_indexes_healthy_topics() {
        let config = config();
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join(".internal")).unwrap();
        let orch_path = dir.path().join(".internal").join("orchestrator.db");
        let orch = OrchestratorIndex::open(&orch_path, config.busy_timeout_ms).unwrap();

        std::fs::create_dir_all(dir.path().join("t1").join(".internal")).unwrap();
        let mut topic = TopicHandle::open(dir.path(), "t1", &orch_path, &config).unwrap();
        pipeline::upload_to(&mut topic, &orch, b"hello", None, None, None, &config).unwrap();
        drop(topic);

        // Rebuild as if starting fresh against an empty global index.
        let fresh_orch = OrchestratorIndex::open(&orch_path, config.busy_timeout_ms).unwrap();
        fresh_orch.delete_topic("t1").unwrap();

        let statuses = run(dir.path(), &fresh_orch, &config).unwrap();
        assert_eq!(statuses.len(), 1);
        assert!(statuses[0].healthy);
        assert_eq!(fresh_orch.count_for_topic("t1").unwrap(), 1);
    }

    #[test]
    fn ignores_reserved_internal_directory_and_invalid_names() {
        let config = config();
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join(".internal")).unwrap();
        std::fs::create_dir_all(dir.path().join("Not_Valid_Name")).unwrap();
        let orch_path = dir.path().join(".internal").join("orchestrator.db");
        let orch = OrchestratorIndex::open(&orch_path, config.busy_timeout_ms).unwrap();

        let statuses = run(dir.path(), &orch, &config).unwrap();
        assert!(statuses.is_empty());
    }

    #[test]
    fn chain_mismatch_marks_topic_unhealthy_without_indexing() {
        let config = config();
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join(".internal")).unwrap();
        let orch_path = dir.path().join(".internal").join("orchestrator.db");
        let orch = OrchestratorIndex::open(&orch_path, config.busy_timeout_ms).unwrap();

        std::fs::create_dir_all(dir.path().join("t1").join(".internal")).unwrap();
        let mut topic = TopicHandle::open(dir.path(), "t1", &orch_path, &config).unwrap();
        pipeline::upload_to(&mut topic, &orch, b"hello", None, None, None, &config).unwrap();
        crate::topicdb::upsert_chain_head(&topic.db.conn, "000001.dat", "deliberately-wrong", 1, 0).unwrap();
        drop(topic);

        let statuses = run(dir.path(), &orch, &config).unwrap();
        assert_eq!(statuses.len(), 1);
        assert!(!statuses[0].healthy);
    }

    #[test]
    fn reconciliation_purges_index_rows_for_removed_topics() {
        let config = config();
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join(".internal")).unwrap();
        let orch_path = dir.path().join(".internal").join("orchestrator.db");
        let orch = OrchestratorIndex::open(&orch_path, config.busy_timeout_ms).unwrap();
        orch.insert_if_absent("deadbeef", "ghost-topic", "000001.dat").unwrap();

        let reconciled = reconcile_global_index(dir.path(), &orch).unwrap();
        assert_eq!(reconciled, vec!["ghost-topic".to_string()]);
        assert!(orch.lookup("deadbeef").unwrap().is_none());
    }
}
