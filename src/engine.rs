//! The facade that wires every component together into the operations an
//! external caller (the CLI, or an embedding HTTP layer) actually invokes.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::Value;
use tracing::info;

use crate::config::EngineConfig;
use crate::discovery::{self, TopicStatus};
use crate::error::{SiloError, SiloResult};
use crate::metadata;
use crate::orchestrator_index::OrchestratorIndex;
use crate::pipeline::{self, TopicHandle, UploadResult};
use crate::query::{self, Row};
use crate::verifier::{Control, ProgressEvent, VerifyMode};

const ORCHESTRATOR_DB: &str = "orchestrator.db";

/// One metadata mutation in a batch: `value = None` is a delete.
pub struct MetadataOperation {
    pub key: String,
    pub value: Option<String>,
}

/// Owns the working directory, the global index, and every topic opened so
/// far. Each topic is held behind its own mutex so writers to different
/// topics never block each other.
pub struct Engine {
    working_dir: PathBuf,
    config: EngineConfig,
    orchestrator_path: PathBuf,
    orchestrator: OrchestratorIndex,
    topics: Mutex<HashMap<String, Arc<Mutex<TopicHandle>>>>,
    /// Most recent health classification per topic, from the last
    /// `discover()` pass. Consulted when opening a `TopicHandle` so that a
    /// topic discovery found unhealthy stays read-only across the call that
    /// first opens it, and is pushed into already-open handles immediately.
    health: Mutex<HashMap<String, bool>>,
}

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

impl Engine {
    /// Opens (creating if absent) the working directory's orchestrator
    /// index and runs an initial discovery pass.
    pub fn open(working_dir: impl Into<PathBuf>, config: EngineConfig) -> SiloResult<Self> {
        let working_dir = working_dir.into();
        std::fs::create_dir_all(working_dir.join(discovery::INTERNAL_DIR))
            .map_err(|e| SiloError::io(&working_dir, e))?;
        let orchestrator_path = working_dir.join(discovery::INTERNAL_DIR).join(ORCHESTRATOR_DB);
        let orchestrator = OrchestratorIndex::open(&orchestrator_path, config.busy_timeout_ms)?;

        let engine = Self {
            working_dir,
            config,
            orchestrator_path,
            orchestrator,
            topics: Mutex::new(HashMap::new()),
            health: Mutex::new(HashMap::new()),
        };
        engine.discover()?;
        Ok(engine)
    }

    /// Re-runs discovery: classifies topic health and reconciles the
    /// global index. Safe to call periodically. Propagates the freshly
    /// computed health of each topic into both the cache `handle_for`
    /// consults for topics not yet opened, and any already-open
    /// `TopicHandle`, so an already-cached handle is immediately flipped
    /// read-only the next time discovery finds it unhealthy.
    pub fn discover(&self) -> SiloResult<Vec<TopicStatus>> {
        let statuses = discovery::run(&self.working_dir, &self.orchestrator, &self.config)?;

        let mut health = self.health.lock().expect("health cache mutex poisoned");
        let topics = self.topics.lock().expect("topic registry mutex poisoned");
        for status in &statuses {
            health.insert(status.name.clone(), status.healthy);
            if let Some(handle) = topics.get(&status.name) {
                handle.lock().expect("topic mutex poisoned").healthy = status.healthy;
            }
        }
        Ok(statuses)
    }

    pub fn list_topics(&self) -> SiloResult<Vec<TopicStatus>> {
        self.discover()
    }

    pub fn create_topic(&self, name: &str) -> SiloResult<()> {
        if !discovery::is_valid_topic_name(name) {
            return Err(SiloError::TopicNameInvalid(name.to_string()));
        }
        let topic_dir = self.working_dir.join(name);
        std::fs::create_dir_all(topic_dir.join(discovery::INTERNAL_DIR))
            .map_err(|e| SiloError::io(&topic_dir, e))?;
        self.health.lock().expect("health cache mutex poisoned").insert(name.to_string(), true);
        self.handle_for(name)?;
        info!(topic = %name, "topic created");
        Ok(())
    }

    fn handle_for(&self, name: &str) -> SiloResult<Arc<Mutex<TopicHandle>>> {
        let mut topics = self.topics.lock().expect("topic registry mutex poisoned");
        if let Some(existing) = topics.get(name) {
            return Ok(Arc::clone(existing));
        }
        let mut handle = TopicHandle::open(&self.working_dir, name, &self.orchestrator_path, &self.config)?;
        let known_healthy = self.health.lock().expect("health cache mutex poisoned").get(name).copied();
        if let Some(healthy) = known_healthy {
            handle.healthy = healthy;
        }
        let arc = Arc::new(Mutex::new(handle));
        topics.insert(name.to_string(), Arc::clone(&arc));
        Ok(arc)
    }

    fn total_disk_bytes(&self) -> u64 {
        let mut total = 0u64;
        let Ok(entries) = std::fs::read_dir(&self.working_dir) else {
            return 0;
        };
        for entry in entries.flatten() {
            if entry.file_name() == discovery::INTERNAL_DIR {
                continue;
            }
            let Ok(file_type) = entry.file_type() else { continue };
            if !file_type.is_dir() {
                continue;
            }
            let Ok(containers) = crate::datset::list(&entry.path()) else {
                continue;
            };
            for container in containers {
                if let Ok(meta) = std::fs::metadata(entry.path().join(container)) {
                    total += meta.len();
                }
            }
        }
        total
    }

    pub fn upload_to(
        &self,
        topic: &str,
        payload: &[u8],
        parent_digest: Option<&str>,
        filename: Option<&str>,
    ) -> SiloResult<UploadResult> {
        let handle = self.handle_for(topic)?;
        let mut guard = handle.lock().expect("topic mutex poisoned");
        let current_total = self.config.max_total_disk_bytes.map(|_| self.total_disk_bytes());
        pipeline::upload_to(
            &mut guard,
            &self.orchestrator,
            payload,
            parent_digest,
            filename,
            current_total,
            &self.config,
        )
    }

    pub fn read_asset(&self, digest_hex: &str) -> SiloResult<Vec<u8>> {
        pipeline::read_asset(&self.working_dir, &self.orchestrator, digest_hex, &self.config)
    }

    fn resolve_topic_db_path(&self, digest_hex: &str) -> SiloResult<(String, PathBuf)> {
        let entry = self
            .orchestrator
            .lookup(digest_hex)?
            .ok_or_else(|| SiloError::NotFound(digest_hex.to_string()))?;
        let db_path = self
            .working_dir
            .join(&entry.topic)
            .join(discovery::INTERNAL_DIR)
            .join(format!("{}.db", entry.topic));
        Ok((entry.topic, db_path))
    }

    pub fn get_metadata(&self, digest_hex: &str) -> SiloResult<Option<Value>> {
        let (_, db_path) = self.resolve_topic_db_path(digest_hex)?;
        let db = crate::topicdb::TopicDb::open(&db_path, self.config.busy_timeout_ms)?;
        db.get_metadata_computed(digest_hex)
    }

    pub fn set_metadata(
        &self,
        digest_hex: &str,
        key: &str,
        value: &str,
        processor: &str,
        processor_version: &str,
    ) -> SiloResult<()> {
        let (topic, _) = self.resolve_topic_db_path(digest_hex)?;
        let handle = self.handle_for(&topic)?;
        let guard = handle.lock().expect("topic mutex poisoned");
        if !guard.healthy {
            return Err(SiloError::TopicUnhealthy(topic));
        }
        metadata::set(
            &guard.db.conn,
            digest_hex,
            key,
            value,
            processor,
            processor_version,
            now_unix(),
            self.config.max_metadata_key_length,
            self.config.max_metadata_value_bytes,
        )
    }

    pub fn delete_metadata(&self, digest_hex: &str, key: &str, processor: &str, processor_version: &str) -> SiloResult<()> {
        let (topic, _) = self.resolve_topic_db_path(digest_hex)?;
        let handle = self.handle_for(&topic)?;
        let guard = handle.lock().expect("topic mutex poisoned");
        if !guard.healthy {
            return Err(SiloError::TopicUnhealthy(topic));
        }
        metadata::delete(&guard.db.conn, digest_hex, key, processor, processor_version, now_unix())
    }

    /// Applies a batch of metadata operations to one asset as a sequence of
    /// individual log entries under the same topic lock. Every operation is
    /// validated and applied independently (spec.md §4.7): a failing
    /// operation does not prevent the remaining ones from being attempted,
    /// and the result for each operation, in input order, is reported back
    /// to the caller.
    pub fn batch_metadata(
        &self,
        digest_hex: &str,
        operations: &[MetadataOperation],
        processor: &str,
        processor_version: &str,
    ) -> SiloResult<Vec<SiloResult<()>>> {
        if operations.len() > self.config.batch_metadata_max_operations {
            return Err(SiloError::InvalidArgument(format!(
                "batch of {} operations exceeds limit of {}",
                operations.len(),
                self.config.batch_metadata_max_operations
            )));
        }
        let (topic, _) = self.resolve_topic_db_path(digest_hex)?;
        let handle = self.handle_for(&topic)?;
        let guard = handle.lock().expect("topic mutex poisoned");
        if !guard.healthy {
            return Err(SiloError::TopicUnhealthy(topic));
        }
        let timestamp = now_unix();
        let results = operations
            .iter()
            .map(|op| match &op.value {
                Some(v) => metadata::set(
                    &guard.db.conn,
                    digest_hex,
                    &op.key,
                    v,
                    processor,
                    processor_version,
                    timestamp,
                    self.config.max_metadata_key_length,
                    self.config.max_metadata_value_bytes,
                ),
                None => metadata::delete(&guard.db.conn, digest_hex, &op.key, processor, processor_version, timestamp),
            })
            .collect();
        Ok(results)
    }

    /// Verifies the named topics (or every discovered topic if `topics` is
    /// `None`), in `full` mode if requested. Returns one result per topic
    /// attempted. A failing result also marks that topic unhealthy for
    /// subsequent writes, same as a failing discovery pass would (`full`
    /// verification catches corruption — payload re-hash mismatches — that
    /// a routine light discovery pass structurally cannot see, so this is
    /// the only place such corruption gets fed back into write eligibility
    /// before the next full restart).
    pub fn verify(
        &self,
        topics: Option<&[String]>,
        full: bool,
        mut on_progress: impl FnMut(&str, ProgressEvent) -> Control,
    ) -> SiloResult<Vec<(String, SiloResult<()>)>> {
        let names = match topics {
            Some(ts) => ts.to_vec(),
            None => self.list_topics()?.into_iter().map(|s| s.name).collect(),
        };
        let mode = if full { VerifyMode::Full } else { VerifyMode::Light };

        let mut out = Vec::new();
        for name in names {
            let topic_dir = self.working_dir.join(&name);
            let db_path = topic_dir.join(discovery::INTERNAL_DIR).join(format!("{name}.db"));
            let result = match crate::topicdb::TopicDb::open(&db_path, self.config.busy_timeout_ms) {
                Ok(db) => crate::verifier::verify_topic(&topic_dir, &db, mode, self.config.progress_interval, |ev| {
                    on_progress(&name, ev)
                }),
                Err(e) => Err(e),
            };
            if result.is_err() {
                self.mark_unhealthy(&name);
            }
            out.push((name, result));
        }
        Ok(out)
    }

    /// Flips a topic's cached health (and any already-open handle) to
    /// unhealthy, without waiting for the next discovery pass.
    fn mark_unhealthy(&self, name: &str) {
        self.health.lock().expect("health cache mutex poisoned").insert(name.to_string(), false);
        if let Some(handle) = self.topics.lock().expect("topic registry mutex poisoned").get(name) {
            handle.lock().expect("topic mutex poisoned").healthy = false;
        }
    }

    pub fn run_query(
        &self,
        template: &str,
        params: &HashMap<String, rusqlite::types::Value>,
        topics: Option<&[String]>,
    ) -> SiloResult<Vec<Row>> {
        let names = match topics {
            Some(ts) => ts.to_vec(),
            None => self.orchestrator.distinct_topics()?,
        };
        let opened = query::open_topics(&self.working_dir, &names, &self.config);
        let refs: Vec<(&str, &crate::topicdb::TopicDb)> = opened.iter().map(|(n, db)| (n.as_str(), db)).collect();
        query::run_query(template, params, &refs, self.config.query_result_limit)
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn create_topic_then_upload_then_read() {
        let dir = tempdir().unwrap();
        let engine = Engine::open(dir.path(), EngineConfig::default()).unwrap();
        engine.create_topic("t1").unwrap();

        let result = engine.upload_to("t1", b"hello", None, Some("greet.txt")).unwrap();
        assert!(!result.skipped);

        let bytes = engine.read_asset(&result.digest).unwrap();
        assert_eq!(bytes, b"hello");
    }

    #[test]
    fn rejects_invalid_topic_names() {
        let dir = tempdir().unwrap();
        let engine = Engine::open(dir.path(), EngineConfig::default()).unwrap();
        let err = engine.create_topic("Not Valid!").unwrap_err();
        assert!(matches!(err, SiloError::TopicNameInvalid(_)));
    }

    #[test]
    fn metadata_set_get_delete_round_trips() {
        let dir = tempdir().unwrap();
        let engine = Engine::open(dir.path(), EngineConfig::default()).unwrap();
        engine.create_topic("t1").unwrap();
        let result = engine.upload_to("t1", b"payload", None, None).unwrap();

        engine.set_metadata(&result.digest, "count", "42", "tester", "1").unwrap();
        let computed = engine.get_metadata(&result.digest).unwrap().unwrap();
        assert_eq!(computed.get("count").unwrap(), 42.0);

        engine.delete_metadata(&result.digest, "count", "tester", "1").unwrap();
        let computed = engine.get_metadata(&result.digest).unwrap().unwrap();
        assert!(computed.get("count").is_none());
    }

    #[test]
    fn batch_metadata_applies_operations_in_order() {
        let dir = tempdir().unwrap();
        let engine = Engine::open(dir.path(), EngineConfig::default()).unwrap();
        engine.create_topic("t1").unwrap();
        let result = engine.upload_to("t1", b"payload", None, None).unwrap();

        let ops = vec![
            MetadataOperation {
                key: "a".into(),
                value: Some("1".into()),
            },
            MetadataOperation {
                key: "b".into(),
                value: Some("2".into()),
            },
            MetadataOperation {
                key: "a".into(),
                value: None,
            },
        ];
        let results = engine
            .batch_metadata(&result.digest, &ops, "tester", "1")
            .unwrap();
        assert!(results.iter().all(|r| r.is_ok()));
        let computed = engine.get_metadata(&result.digest).unwrap().unwrap();
        assert!(computed.get("a").is_none());
        assert_eq!(computed.get("b").unwrap(), "2");
    }

    #[test]
    fn batch_metadata_reports_per_operation_failure_without_aborting_batch() {
        let dir = tempdir().unwrap();
        let engine = Engine::open(dir.path(), EngineConfig::default()).unwrap();
        engine.create_topic("t1").unwrap();
        let result = engine.upload_to("t1", b"payload", None, None).unwrap();

        let oversized_key = "k".repeat(engine.config.max_metadata_key_length + 1);
        let ops = vec![
            MetadataOperation {
                key: "good".into(),
                value: Some("1".into()),
            },
            MetadataOperation {
                key: oversized_key,
                value: Some("2".into()),
            },
            MetadataOperation {
                key: "also_good".into(),
                value: Some("3".into()),
            },
        ];
        let results = engine
            .batch_metadata(&result.digest, &ops, "tester", "1")
            .unwrap();
        assert!(results[0].is_ok());
        assert!(results[1].is_err());
        assert!(results[2].is_ok());

        let computed = engine.get_metadata(&result.digest).unwrap().unwrap();
        assert_eq!(computed.get("good").unwrap(), "1");
        assert_eq!(computed.get("also_good").unwrap(), "3");
    }

    #[test]
    fn verify_reports_healthy_for_untouched_topic() {
        let dir = tempdir().unwrap();
        let engine = Engine::open(dir.path(), EngineConfig::default()).unwrap();
        engine.create_topic("t1").unwrap();
        engine.upload_to("t1", b"payload", None, None).unwrap();

        let results = engine.verify(None, true, |_, _| Control::Continue).unwrap();
        assert_eq!(results.len(), 1);
        assert!(results[0].1.is_ok());
    }

    #[test]
    fn full_verify_failure_marks_topic_unhealthy_for_subsequent_writes() {
        let dir = tempdir().unwrap();
        let engine = Engine::open(dir.path(), EngineConfig::default()).unwrap();
        engine.create_topic("t1").unwrap();
        let asset = engine.upload_to("t1", b"payload-bytes", None, None).unwrap();

        let container_path = dir.path().join("t1").join(&asset.container);
        let mut bytes = std::fs::read(&container_path).unwrap();
        let payload_start = bytes.len() - b"payload-bytes".len();
        bytes[payload_start] ^= 0xFF;
        std::fs::write(&container_path, bytes).unwrap();

        let results = engine.verify(None, true, |_, _| Control::Continue).unwrap();
        assert!(results[0].1.is_err());

        let err = engine.upload_to("t1", b"more", None, None).unwrap_err();
        assert!(matches!(err, SiloError::TopicUnhealthy(_)));

        let meta_err = engine.set_metadata(&asset.digest, "k", "v", "tester", "1").unwrap_err();
        assert!(matches!(meta_err, SiloError::TopicUnhealthy(_)));
    }

    #[test]
    fn verify_with_no_assets_yet_still_considers_the_empty_topic() {
        let dir = tempdir().unwrap();
        let engine = Engine::open(dir.path(), EngineConfig::default()).unwrap();
        engine.create_topic("empty-topic").unwrap();

        let results = engine.verify(None, false, |_, _| Control::Continue).unwrap();
        assert_eq!(results.len(), 1);
        assert!(results[0].1.is_ok());
    }
}
