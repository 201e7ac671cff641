//! Chain replay and payload re-hashing, with progress and cancellation.
//!
//! Two modes: light (replay the declared chain only) and full (light, plus
//! re-hashing every payload and comparing it to its header digest).

use std::path::Path;

use tracing::{info, warn};

use crate::container::{self, EntryHeader};
use crate::error::{SiloError, SiloResult};
use crate::hasher::{self, Digest};
use crate::topicdb::TopicDb;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyMode {
    Light,
    Full,
}

/// Emitted every `progress_interval` entries and at every container boundary.
#[derive(Debug, Clone)]
pub struct ProgressEvent<'a> {
    pub container: &'a str,
    pub entries_done: u64,
    pub container_complete: bool,
}

/// Returned by the progress callback: whether to keep going.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    Continue,
    Cancel,
}

/// The verification result for one container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerReport {
    pub container: String,
    pub entry_count: u64,
    pub chain_head: String,
}

/// Replays a single container's chain (and, in [`VerifyMode::Full`],
/// re-hashes every payload), invoking `on_progress` along the way.
///
/// Returns the computed chain head and entry count. Does not consult the
/// database; callers compare the result to the stored `chain_heads` row.
pub fn verify_container(
    path: &Path,
    container_name: &str,
    mode: VerifyMode,
    progress_interval: u64,
    mut on_progress: impl FnMut(ProgressEvent) -> Control,
) -> SiloResult<ContainerReport> {
    let mut chain = hasher::genesis(container_name);
    let mut count: u64 = 0;
    let mut cancelled = false;

    container::scan(path, |header: &EntryHeader| {
        if cancelled {
            return Ok(());
        }

        if mode == VerifyMode::Full {
            let ok = container::verify_payload_digest(path, header)?;
            if !ok {
                return Err(SiloError::PayloadCorrupt {
                    container: container_name.to_string(),
                    offset: header.offset,
                });
            }
        }

        let entry_digest = hasher::from_hex(header.digest_hex_str()).ok_or_else(|| {
            SiloError::CorruptHeader {
                container: container_name.to_string(),
                offset: header.offset,
                reason: "digest field did not decode as a digest".into(),
            }
        })?;
        chain = hasher::chain_step(&chain, &entry_digest, header.offset, header.payload_length);
        count += 1;

        if count % progress_interval == 0 {
            let ctrl = on_progress(ProgressEvent {
                container: container_name,
                entries_done: count,
                container_complete: false,
            });
            if ctrl == Control::Cancel {
                cancelled = true;
            }
        }
        Ok(())
    })?;

    if cancelled {
        return Err(SiloError::Cancelled);
    }

    on_progress(ProgressEvent {
        container: container_name,
        entries_done: count,
        container_complete: true,
    });

    Ok(ContainerReport {
        container: container_name.to_string(),
        entry_count: count,
        chain_head: hasher::hex(&chain),
    })
}

/// Verifies every container a topic's database has a recorded chain head
/// for, comparing each replay to its stored row. Returns the first mismatch
/// encountered, or `Ok(())` if every container matches.
pub fn verify_topic(
    topic_dir: &Path,
    db: &TopicDb,
    mode: VerifyMode,
    progress_interval: u64,
    mut on_progress: impl FnMut(ProgressEvent) -> Control,
) -> SiloResult<()> {
    for head in db.list_chain_heads()? {
        let container_path = topic_dir.join(&head.container_name);
        let report = verify_container(&container_path, &head.container_name, mode, progress_interval, &mut on_progress)?;

        if report.chain_head != head.chain_hash || report.entry_count != head.entry_count {
            warn!(
                container = %head.container_name,
                expected = %head.chain_hash,
                computed = %report.chain_head,
                "chain mismatch"
            );
            return Err(SiloError::ChainMismatch {
                container: head.container_name,
                expected: head.chain_hash,
                computed: report.chain_head,
            });
        }
        info!(container = %head.container_name, entries = report.entry_count, "container verified");
    }
    Ok(())
}

/// Computes the byte length a container should be truncated to so that it
/// contains exactly `good_entry_count` entries, by replaying and stopping
/// early. Used to recover from an orphaned append after a crash.
pub fn recovery_length(path: &Path, good_entry_count: u64) -> SiloResult<u64> {
    let mut seen = 0u64;
    let mut end = 0u64;
    container::scan(path, |header| {
        if seen < good_entry_count {
            end = header
                .offset
                .checked_add(container::HEADER_LEN)
                .and_then(|v| v.checked_add(header.payload_length))
                .ok_or_else(|| SiloError::Internal("offset overflow computing recovery length".into()))?;
            seen += 1;
        }
        Ok(())
    })?;
    Ok(end)
}

/// Checks a digest against a 32-byte binary representation, for tests that
/// want to assert on a specific chain head without round-tripping hex.
#[cfg(test)]
fn digest_eq(a: &Digest, hex: &str) -> bool {
    hasher::hex(a) == hex
}
