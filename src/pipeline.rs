//! Single-writer upload path: hash, dedup-check, append, index,
//! chain-update — atomic per asset.

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{info, instrument, warn};

use crate::config::EngineConfig;
use crate::container;
use crate::datset;
use crate::error::{SiloError, SiloResult};
use crate::hasher::{self, Digest};
use crate::orchestrator_index::{self, OrchestratorIndex};
use crate::sanitize;
use crate::topicdb::{self, Asset, TopicDb};

/// An open topic: its directory, database connection, and health flag.
/// Callers are responsible for holding this behind a per-topic mutex to
/// enforce single-writer-per-topic discipline.
pub struct TopicHandle {
    pub name: String,
    pub dir: PathBuf,
    pub db: TopicDb,
    pub healthy: bool,
}

impl TopicHandle {
    pub fn open(working_dir: &Path, name: &str, orchestrator_path: &Path, config: &EngineConfig) -> SiloResult<Self> {
        let dir = working_dir.join(name);
        let db_path = dir.join(".internal").join(format!("{name}.db"));
        let db = TopicDb::open(&db_path, config.busy_timeout_ms)?;
        db.attach_global_index(orchestrator_path)?;
        Ok(Self {
            name: name.to_string(),
            dir,
            db,
            healthy: true,
        })
    }
}

/// Result of a single `upload_to` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadResult {
    pub digest: String,
    pub size: u64,
    pub container: String,
    pub skipped: bool,
    pub existing_topic: Option<String>,
}

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

/// Runs the canonical upload sequence against an already-open,
/// exclusively-held topic handle: sanitise, hash, dedup-check, append,
/// chain-update, index, commit.
#[instrument(skip(topic, orchestrator, payload, config), fields(topic = %topic.name))]
#[allow(clippy::too_many_arguments)]
pub fn upload_to(
    topic: &mut TopicHandle,
    orchestrator: &OrchestratorIndex,
    payload: &[u8],
    parent_digest: Option<&str>,
    filename: Option<&str>,
    current_total_disk_bytes: Option<u64>,
    config: &EngineConfig,
) -> SiloResult<UploadResult> {
    if !topic.healthy {
        return Err(SiloError::TopicUnhealthy(topic.name.clone()));
    }

    // 1. Sanitise filename, reject oversized payloads up front.
    let (origin_name, extension) = match filename {
        Some(raw) => {
            let (name, ext) =
                sanitize::split_name_and_extension(raw, config.max_filename_length, config.max_extension_length);
            (Some(name), ext)
        }
        None => (None, String::new()),
    };
    let max_payload = config.max_container_size.saturating_sub(container::HEADER_LEN);
    if payload.len() as u64 > max_payload {
        return Err(SiloError::PayloadTooLarge {
            size: payload.len() as u64,
            limit: max_payload,
        });
    }

    // 2. Digest.
    let digest: Digest = hasher::digest(payload);
    let digest_hex = hasher::hex(&digest);

    // 3. Dedup check.
    if let Some(existing) = orchestrator.lookup(&digest_hex)? {
        info!(digest = %digest_hex, existing_topic = %existing.topic, "upload deduplicated");
        return Ok(UploadResult {
            digest: digest_hex,
            size: payload.len() as u64,
            container: existing.container_name,
            skipped: true,
            existing_topic: Some(existing.topic),
        });
    }

    // 4. Optional disk-limit check.
    if let (Some(limit), Some(used)) = (config.max_total_disk_bytes, current_total_disk_bytes) {
        let prospective = used + payload.len() as u64;
        if prospective > limit {
            return Err(SiloError::DiskLimitExceeded {
                used: prospective,
                limit,
            });
        }
    }

    // 5. Parent validation: parents must already be committed in the
    // global index, checked before the child's transaction opens, never
    // inside it, so a dangling parent can never be raced into existence.
    if let Some(parent) = parent_digest {
        if orchestrator.lookup(parent)?.is_none() {
            return Err(SiloError::ParentNotFound(parent.to_string()));
        }
    }

    // 6. Choose target container.
    let target = datset::choose_target(&topic.dir, payload.len() as u64, config.max_container_size)?;
    let container_path = datset::container_path(&topic.dir, &target.container_name);

    // 7. Begin the topic database transaction (spans the attached global
    // index via ATTACH DATABASE; see topicdb::TopicDb::attach_global_index).
    let tx = topic.db.conn.transaction()?;

    // 8. Read the current chain head within the transaction.
    let prev_head = {
        let existing = tx.query_row(
            "SELECT chain_hash, entry_count FROM chain_heads WHERE container_name = ?1",
            [&target.container_name],
            |row| {
                let hash_hex: String = row.get(0)?;
                let count: i64 = row.get(1)?;
                Ok((hash_hex, count as u64))
            },
        );
        match existing {
            Ok((hash_hex, count)) => {
                let mut bytes = [0u8; 32];
                let decoded = hasher::from_hex(&hash_hex).ok_or_else(|| {
                    SiloError::Internal(format!("corrupt chain_hash for {}", target.container_name))
                })?;
                bytes.copy_from_slice(&decoded);
                (bytes, count)
            }
            Err(rusqlite::Error::QueryReturnedNoRows) => (hasher::genesis(&target.container_name), 0),
            Err(e) => return Err(e.into()),
        }
    };

    // 9. Append to the container file. This happens outside the database
    // transaction boundary; a crash between here and commit leaves an
    // orphaned tail that a later truncate-to-last-good-offset recovers.
    let offset = container::append_entry(&container_path, &digest_hex, payload)?;

    // 10. Compute the new chain head.
    let new_head = hasher::chain_step(&prev_head.0, &digest, offset, payload.len() as u64);
    let new_head_hex = hasher::hex(&new_head);
    let now = now_unix();

    // 11. Insert asset row.
    let asset = Asset {
        asset_id: digest_hex.clone(),
        size: payload.len() as u64,
        origin_name,
        parent_id: parent_digest.map(str::to_string),
        extension,
        container_name: target.container_name.clone(),
        byte_offset: offset,
        created_at: now,
    };
    topicdb::insert_asset(&tx, &asset)?;

    // 12. Upsert chain head.
    topicdb::upsert_chain_head(&tx, &target.container_name, &new_head_hex, prev_head.1 + 1, now)?;

    // 13. Insert global index entry. A unique-constraint violation here
    // signals a race: the other writer committed first, so we roll back and
    // report a skipped dedup instead of a hard error.
    if let Err(e) = orchestrator_index::insert_attached(&tx, &digest_hex, &topic.name, &target.container_name) {
        drop(tx); // rolls back
        warn!(digest = %digest_hex, "lost global-index race, falling back to dedup");
        let existing = orchestrator.lookup(&digest_hex)?.ok_or(e)?;
        return Ok(UploadResult {
            digest: digest_hex,
            size: payload.len() as u64,
            container: existing.container_name,
            skipped: true,
            existing_topic: Some(existing.topic),
        });
    }

    // 14. Commit.
    tx.commit()?;

    info!(digest = %digest_hex, container = %target.container_name, offset, "upload committed");

    Ok(UploadResult {
        digest: digest_hex,
        size: payload.len() as u64,
        container: target.container_name,
        skipped: false,
        existing_topic: None,
    })
}

/// Resolves a digest to its bytes via the global index, then reads the
/// entry from the owning container.
pub fn read_asset(
    working_dir: &Path,
    orchestrator: &OrchestratorIndex,
    digest_hex: &str,
    config: &EngineConfig,
) -> SiloResult<Vec<u8>> {
    let entry = orchestrator
        .lookup(digest_hex)?
        .ok_or_else(|| SiloError::NotFound(digest_hex.to_string()))?;

    let db_path = working_dir
        .join(&entry.topic)
        .join(".internal")
        .join(format!("{}.db", entry.topic));
    let db = TopicDb::open(&db_path, config.busy_timeout_ms)?;
    let asset = db
        .get_asset(digest_hex)?
        .ok_or_else(|| SiloError::NotFound(digest_hex.to_string()))?;

    let container_path = working_dir.join(&entry.topic).join(&asset.container_name);
    container::read_entry(&container_path, asset.byte_offset, asset.size)
}
