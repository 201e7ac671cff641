//! DAT set manager: enumerates, orders, and rolls over container files
//! within one topic.

use std::fs;
use std::path::{Path, PathBuf};

use regex::Regex;
use std::sync::OnceLock;

use crate::container::HEADER_LEN;
use crate::error::{SiloError, SiloResult};

fn dat_name_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(\d{3,})\.dat$").unwrap())
}

/// Parses a container filename's numeric stem, if it matches the DAT
/// pattern `^\d{3,}\.dat$` (legacy 3-digit names accepted).
pub fn parse_container_number(file_name: &str) -> Option<u64> {
    let caps = dat_name_re().captures(file_name)?;
    caps.get(1)?.as_str().parse::<u64>().ok()
}

/// Renders the canonical six-digit container name for `n`.
pub fn canonical_name(n: u64) -> String {
    format!("{n:06}.dat")
}

/// Lists container file names in a topic directory, sorted numerically on
/// the integer parsed from the stem (not lexicographically), so
/// `000002.dat < 000010.dat < 000100.dat` and mixed 3-/6-digit legacy names
/// sort correctly.
pub fn list(topic_dir: &Path) -> SiloResult<Vec<String>> {
    let mut entries: Vec<(u64, String)> = Vec::new();
    let read_dir = match fs::read_dir(topic_dir) {
        Ok(rd) => rd,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(SiloError::io(topic_dir, e)),
    };
    for entry in read_dir {
        let entry = entry.map_err(|e| SiloError::io(topic_dir, e))?;
        if !entry.file_type().map_err(|e| SiloError::io(topic_dir, e))?.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if let Some(n) = parse_container_number(&name) {
            entries.push((n, name));
        }
    }
    entries.sort_by_key(|(n, _)| *n);
    Ok(entries.into_iter().map(|(_, name)| name).collect())
}

/// Returns the canonical next container name: `000001.dat` if no containers
/// exist yet, otherwise the six-digit form of `(max_number + 1)`.
pub fn next_name(topic_dir: &Path) -> SiloResult<String> {
    let existing = list(topic_dir)?;
    let max = existing
        .iter()
        .filter_map(|n| parse_container_number(n))
        .max();
    match max {
        None => Ok(canonical_name(1)),
        Some(m) => Ok(canonical_name(m + 1)),
    }
}

/// Result of choosing a write target.
pub struct Target {
    pub container_name: String,
    pub is_new: bool,
}

/// Returns the current (highest-numbered) container if it has room for
/// `incoming_size` more bytes (header included) without exceeding
/// `max_size`; otherwise returns the next container name. Rejects payloads
/// that could never fit any container with `PayloadTooLarge`.
pub fn choose_target(topic_dir: &Path, incoming_size: u64, max_size: u64) -> SiloResult<Target> {
    let max_payload = max_size.saturating_sub(HEADER_LEN);
    if incoming_size > max_payload {
        return Err(SiloError::PayloadTooLarge {
            size: incoming_size,
            limit: max_payload,
        });
    }

    let existing = list(topic_dir)?;
    match existing.last() {
        None => Ok(Target {
            container_name: canonical_name(1),
            is_new: true,
        }),
        Some(current) => {
            let current_path = topic_dir.join(current);
            let current_size = fs::metadata(&current_path)
                .map(|m| m.len())
                .unwrap_or(0);
            if current_size + HEADER_LEN + incoming_size <= max_size {
                Ok(Target {
                    container_name: current.clone(),
                    is_new: false,
                })
            } else {
                let n = parse_container_number(current).ok_or_else(|| {
                    SiloError::Internal(format!("unparseable container name {current}"))
                })?;
                Ok(Target {
                    container_name: canonical_name(n + 1),
                    is_new: true,
                })
            }
        }
    }
}

/// Full path to a container inside a topic directory.
pub fn container_path(topic_dir: &Path, container_name: &str) -> PathBuf {
    topic_dir.join(container_name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn numeric_sort_beats_lexicographic() {
        let dir = tempdir().unwrap();
        for name in ["000100.dat", "000002.dat", "000010.dat", "003.dat"] {
            std::fs::write(dir.path().join(name), b"").unwrap();
        }
        let listed = list(dir.path()).unwrap();
        assert_eq!(listed, vec!["003.dat", "000002.dat", "000010.dat", "000100.dat"]);
    }

    #[test]
    fn next_name_on_empty_topic_is_canonical_first() {
        let dir = tempdir().unwrap();
        assert_eq!(next_name(dir.path()).unwrap(), "000001.dat");
    }

    #[test]
    fn next_name_increments_from_max() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("000002.dat"), b"").unwrap();
        std::fs::write(dir.path().join("000005.dat"), b"").unwrap();
        assert_eq!(next_name(dir.path()).unwrap(), "000006.dat");
    }

    #[test]
    fn choose_target_rolls_over_when_full() {
        let dir = tempdir().unwrap();
        let max_size = 1024u64;
        // First container holds two 400-byte entries: 110+400 = 510 each -> 1020 <= 1024.
        let t1 = choose_target(dir.path(), 400, max_size).unwrap();
        assert!(t1.is_new);
        assert_eq!(t1.container_name, "000001.dat");
        std::fs::write(
            dir.path().join(&t1.container_name),
            vec![0u8; (110 + 400) as usize],
        )
        .unwrap();

        let t2 = choose_target(dir.path(), 400, max_size).unwrap();
        assert!(!t2.is_new);
        assert_eq!(t2.container_name, "000001.dat");
        std::fs::write(
            dir.path().join(&t2.container_name),
            vec![0u8; (2 * (110 + 400)) as usize],
        )
        .unwrap();

        // Third 400-byte entry would need 1530 > 1024: rolls to 000002.dat.
        let t3 = choose_target(dir.path(), 400, max_size).unwrap();
        assert!(t3.is_new);
        assert_eq!(t3.container_name, "000002.dat");
    }

    #[test]
    fn choose_target_rejects_oversized_payload_before_any_write() {
        let dir = tempdir().unwrap();
        let max_size = 1024u64;
        let err = choose_target(dir.path(), max_size, max_size).unwrap_err();
        assert!(matches!(err, SiloError::PayloadTooLarge { .. }));
        assert!(list(dir.path()).unwrap().is_empty());
    }

    #[test]
    fn boundary_payload_fills_container_exactly() {
        let dir = tempdir().unwrap();
        let max_size = 1024u64;
        let exact = max_size - HEADER_LEN;
        let t = choose_target(dir.path(), exact, max_size).unwrap();
        assert_eq!(t.container_name, "000001.dat");
        std::fs::write(dir.path().join(&t.container_name), vec![0u8; max_size as usize]).unwrap();

        let next = choose_target(dir.path(), 1, max_size).unwrap();
        assert_eq!(next.container_name, "000002.dat");
        assert!(next.is_new);
    }
}
