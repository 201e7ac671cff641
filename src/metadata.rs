//! Append log + materialised current-value projection, with value type
//! inference.
//!
//! Both `set` and `delete` are a single transaction that (a) inserts a
//! `metadata_log` row and (b) recomputes the `metadata_computed` row for
//! that asset by replaying every log entry for the asset in `id` order.

use rusqlite::Connection;
use serde_json::{Map, Value};

use crate::error::{SiloError, SiloResult};
use crate::topicdb::{self, MetadataLogEntry, MetadataOp};

/// The two forms a valid, non-empty metadata value takes once inferred.
#[derive(Debug, Clone, PartialEq)]
pub struct InferredValue {
    pub value_text: String,
    pub value_num: Option<f64>,
}

/// Classifies a raw string value as numeric-and-textual or text-only:
///
/// 1. Empty string is rejected.
/// 2. Literal `true`/`false` is text only.
/// 3. Parse as a 64-bit float; on failure, text only. On success:
///    a. a leading zero followed by a non-`.` character (e.g. `00123`)
///       disqualifies it as numeric,
///    b. an exponent (`e`/`E`) disqualifies it as numeric,
///    c. if it contains `.`, the shortest round-trip form must equal the
///       input exactly (this rejects `1.0`, `1.00`).
/// 4. Otherwise both `value_text` and `value_num` are stored.
pub fn infer_value(raw: &str) -> SiloResult<InferredValue> {
    if raw.is_empty() {
        return Err(SiloError::InvalidArgument(
            "metadata value must not be empty".into(),
        ));
    }

    if raw == "true" || raw == "false" {
        return Ok(InferredValue {
            value_text: raw.to_string(),
            value_num: None,
        });
    }

    let parsed: f64 = match raw.parse() {
        Ok(f) if f.is_finite() => f,
        _ => {
            return Ok(InferredValue {
                value_text: raw.to_string(),
                value_num: None,
            });
        }
    };

    let has_leading_zero = {
        let digits_start = raw.strip_prefix('-').unwrap_or(raw);
        let mut chars = digits_start.chars();
        match (chars.next(), chars.next()) {
            (Some('0'), Some(next)) => next != '.',
            _ => false,
        }
    };
    if has_leading_zero {
        return Ok(InferredValue {
            value_text: raw.to_string(),
            value_num: None,
        });
    }

    if raw.contains(['e', 'E']) {
        return Ok(InferredValue {
            value_text: raw.to_string(),
            value_num: None,
        });
    }

    if raw.contains('.') {
        let round_tripped = format_shortest(parsed);
        if round_tripped != raw {
            return Ok(InferredValue {
                value_text: raw.to_string(),
                value_num: None,
            });
        }
    }

    Ok(InferredValue {
        value_text: raw.to_string(),
        value_num: Some(parsed),
    })
}

fn format_shortest(f: f64) -> String {
    // Rust's default f64 Display already produces the shortest
    // round-trippable form (e.g. 1.0 -> "1", 1.5 -> "1.5").
    format!("{f}")
}

/// Renders an inferred numeric value as a JSON number, preferring an
/// integer form when `n` is integral and fits in an `i64` (so `"42"`
/// materialises as `42`, not `42.0`); falls back to a JSON float, and to the
/// original text if `n` is somehow non-finite.
fn number_to_json(n: f64, text: &str) -> Value {
    if n.fract() == 0.0 && n >= i64::MIN as f64 && n <= i64::MAX as f64 {
        return Value::Number(serde_json::Number::from(n as i64));
    }
    serde_json::Number::from_f64(n)
        .map(Value::Number)
        .unwrap_or_else(|| Value::String(text.to_string()))
}

/// Replays a full metadata log prefix (already sorted by `id` ascending)
/// into a JSON object: `set` assigns the key to its numeric form when one
/// was recorded, otherwise its textual form; `delete` removes the key.
pub fn replay(entries: &[MetadataLogEntry]) -> Value {
    let mut map = Map::new();
    for entry in entries {
        match entry.op {
            MetadataOp::Delete => {
                map.remove(&entry.key);
            }
            MetadataOp::Set => {
                let text = entry.value_text.clone().unwrap_or_default();
                let value = match entry.value_num {
                    Some(n) => number_to_json(n, &text),
                    None => Value::String(text),
                };
                map.insert(entry.key.clone(), value);
            }
        }
    }
    Value::Object(map)
}

/// Appends a `set` log entry for `asset_id` and recomputes
/// `metadata_computed` from the full replayed log, as a single transaction
/// over `conn` so the log row and its projection never observe a crash
/// between them (spec.md §4.7, I4/P5).
#[allow(clippy::too_many_arguments)]
pub fn set(
    conn: &Connection,
    asset_id: &str,
    key: &str,
    raw_value: &str,
    processor: &str,
    processor_version: &str,
    timestamp: i64,
    max_key_len: usize,
    max_value_bytes: usize,
) -> SiloResult<()> {
    if key.len() > max_key_len {
        return Err(SiloError::InvalidArgument(format!(
            "metadata key exceeds {max_key_len} bytes"
        )));
    }
    if raw_value.len() > max_value_bytes {
        return Err(SiloError::InvalidArgument(format!(
            "metadata value exceeds {max_value_bytes} bytes"
        )));
    }
    let inferred = infer_value(raw_value)?;

    let tx = conn.unchecked_transaction()?;

    topicdb::insert_metadata_log(
        &tx,
        asset_id,
        MetadataOp::Set,
        key,
        Some(&inferred.value_text),
        inferred.value_num,
        processor,
        processor_version,
        timestamp,
    )?;
    recompute(&tx, asset_id, timestamp)?;

    tx.commit()?;
    Ok(())
}

/// Appends a `delete` log entry for `asset_id` and recomputes
/// `metadata_computed`, as a single transaction (see [`set`]).
pub fn delete(
    conn: &Connection,
    asset_id: &str,
    key: &str,
    processor: &str,
    processor_version: &str,
    timestamp: i64,
) -> SiloResult<()> {
    let tx = conn.unchecked_transaction()?;

    topicdb::insert_metadata_log(
        &tx,
        asset_id,
        MetadataOp::Delete,
        key,
        None,
        None,
        processor,
        processor_version,
        timestamp,
    )?;
    recompute(&tx, asset_id, timestamp)?;

    tx.commit()?;
    Ok(())
}

fn recompute(conn: &Connection, asset_id: &str, timestamp: i64) -> SiloResult<()> {
    let mut stmt = conn.prepare(
        "SELECT id, asset_id, op, key, value_text, value_num, processor, processor_version, timestamp
         FROM metadata_log WHERE asset_id = ?1 ORDER BY id ASC",
    )?;
    let rows = stmt.query_map([asset_id], |row| {
        let op_str: String = row.get(2)?;
        Ok(MetadataLogEntry {
            id: row.get(0)?,
            asset_id: row.get(1)?,
            op: if op_str == "delete" {
                MetadataOp::Delete
            } else {
                MetadataOp::Set
            },
            key: row.get(3)?,
            value_text: row.get(4)?,
            value_num: row.get(5)?,
            processor: row.get(6)?,
            processor_version: row.get(7)?,
            timestamp: row.get(8)?,
        })
    })?;
    let mut entries = Vec::new();
    for r in rows {
        entries.push(r?);
    }
    drop(stmt);

    let json = replay(&entries);
    topicdb::upsert_metadata_computed(conn, asset_id, &json, timestamp)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_value() {
        assert!(infer_value("").is_err());
    }

    #[test]
    fn boolean_literals_are_text_only() {
        assert_eq!(infer_value("true").unwrap().value_num, None);
        assert_eq!(infer_value("false").unwrap().value_num, None);
    }

    #[test]
    fn plain_integer_is_numeric() {
        let v = infer_value("42").unwrap();
        assert_eq!(v.value_num, Some(42.0));
        assert_eq!(v.value_text, "42");
    }

    #[test]
    fn leading_zero_is_text_only() {
        assert_eq!(infer_value("00123").unwrap().value_num, None);
    }

    #[test]
    fn exponent_is_text_only() {
        assert_eq!(infer_value("1e10").unwrap().value_num, None);
        assert_eq!(infer_value("1E10").unwrap().value_num, None);
    }

    #[test]
    fn lossy_decimal_round_trip_is_text_only() {
        assert_eq!(infer_value("1.0").unwrap().value_num, None);
        assert_eq!(infer_value("1.00").unwrap().value_num, None);
    }

    #[test]
    fn exact_decimal_round_trip_is_numeric() {
        let v = infer_value("1.5").unwrap();
        assert_eq!(v.value_num, Some(1.5));
    }

    #[test]
    fn non_numeric_text_is_text_only() {
        assert_eq!(infer_value("hello").unwrap().value_num, None);
    }

    #[test]
    fn replay_applies_set_and_delete_in_order() {
        let entries = vec![
            MetadataLogEntry {
                id: 1,
                asset_id: "a".into(),
                op: MetadataOp::Set,
                key: "count".into(),
                value_text: Some("42".into()),
                value_num: Some(42.0),
                processor: "p".into(),
                processor_version: "1".into(),
                timestamp: 1,
            },
            MetadataLogEntry {
                id: 2,
                asset_id: "a".into(),
                op: MetadataOp::Set,
                key: "code".into(),
                value_text: Some("00123".into()),
                value_num: None,
                processor: "p".into(),
                processor_version: "1".into(),
                timestamp: 2,
            },
            MetadataLogEntry {
                id: 3,
                asset_id: "a".into(),
                op: MetadataOp::Delete,
                key: "count".into(),
                value_text: None,
                value_num: None,
                processor: "p".into(),
                processor_version: "1".into(),
                timestamp: 3,
            },
        ];
        let json = replay(&entries);
        let obj = json.as_object().unwrap();
        assert!(!obj.contains_key("count"));
        assert_eq!(obj.get("code").unwrap(), "00123");
    }

    #[test]
    fn replay_of_all_deletes_yields_empty_object() {
        let entries = vec![
            MetadataLogEntry {
                id: 1,
                asset_id: "a".into(),
                op: MetadataOp::Set,
                key: "k".into(),
                value_text: Some("v".into()),
                value_num: None,
                processor: "p".into(),
                processor_version: "1".into(),
                timestamp: 1,
            },
            MetadataLogEntry {
                id: 2,
                asset_id: "a".into(),
                op: MetadataOp::Delete,
                key: "k".into(),
                value_text: None,
                value_num: None,
                processor: "p".into(),
                processor_version: "1".into(),
                timestamp: 2,
            },
        ];
        let json = replay(&entries);
        assert_eq!(json.as_object().unwrap().len(), 0);
    }
}
