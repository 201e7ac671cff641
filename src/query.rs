//! Named-parameter SQL execution fanned out across topic databases.
//!
//! A preset template uses `:name` placeholders; each distinct name is
//! bound once and reused at every occurrence. Results from every selected
//! topic are concatenated with a synthetic `_topic` column appended.

use std::collections::HashMap;
use std::path::Path;

use rusqlite::types::Value as SqlValue;
use tracing::warn;

use crate::config::EngineConfig;
use crate::error::{SiloError, SiloResult};
use crate::topicdb::TopicDb;

/// One row of a query result: column name to rendered JSON-ish value, plus
/// the synthetic topic column.
pub type Row = HashMap<String, SqlValue>;

/// A parsed template: the rewritten SQL with `?N` placeholders and the
/// ordered list of distinct parameter names, in the order their first
/// occurrence appears.
#[derive(Debug, Clone)]
pub struct BoundTemplate {
    pub sql: String,
    pub param_names: Vec<String>,
}

/// Rewrites `:name` placeholders in `template` into positional `?N`
/// parameters, deduplicating repeated names so each is bound once.
pub fn bind_template(template: &str) -> BoundTemplate {
    let mut sql = String::with_capacity(template.len());
    let mut param_names: Vec<String> = Vec::new();
    let chars: Vec<char> = template.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        if chars[i] == ':' && i + 1 < chars.len() && (chars[i + 1].is_ascii_alphabetic() || chars[i + 1] == '_') {
            let start = i + 1;
            let mut j = start;
            while j < chars.len() && (chars[j].is_ascii_alphanumeric() || chars[j] == '_') {
                j += 1;
            }
            let name: String = chars[start..j].iter().collect();
            let position = match param_names.iter().position(|n| n == &name) {
                Some(p) => p,
                None => {
                    param_names.push(name.clone());
                    param_names.len() - 1
                }
            };
            sql.push('?');
            sql.push_str(&(position + 1).to_string());
            i = j;
        } else {
            sql.push(chars[i]);
            i += 1;
        }
    }
    BoundTemplate { sql, param_names }
}

/// Executes `template` with `params` against every database in `topic_dbs`,
/// appending a `_topic` column to each row. A per-topic execution error is
/// logged and that topic is skipped; the call still succeeds with whatever
/// the other topics returned, bounded by `limit`.
pub fn run_query(
    template: &str,
    params: &HashMap<String, SqlValue>,
    topic_dbs: &[(&str, &TopicDb)],
    limit: usize,
) -> SiloResult<Vec<Row>> {
    let bound = bind_template(template);
    let mut positional: Vec<SqlValue> = Vec::with_capacity(bound.param_names.len());
    for name in &bound.param_names {
        let value = params
            .get(name)
            .ok_or_else(|| SiloError::InvalidArgument(format!("missing query parameter :{name}")))?;
        positional.push(value.clone());
    }

    let mut results = Vec::new();
    for (topic_name, db) in topic_dbs {
        if results.len() >= limit {
            break;
        }
        match run_one(db, &bound.sql, &positional, topic_name, limit - results.len()) {
            Ok(mut rows) => results.append(&mut rows),
            Err(e) => {
                warn!(topic = %topic_name, error = %e, "query failed on topic, skipping");
            }
        }
    }
    Ok(results)
}

fn run_one(
    db: &TopicDb,
    sql: &str,
    positional: &[SqlValue],
    topic_name: &str,
    remaining: usize,
) -> SiloResult<Vec<Row>> {
    let mut stmt = db.conn.prepare(sql)?;
    let column_names: Vec<String> = stmt.column_names().iter().map(|s| s.to_string()).collect();
    let param_refs: Vec<&dyn rusqlite::ToSql> = positional.iter().map(|v| v as &dyn rusqlite::ToSql).collect();

    let mut rows_iter = stmt.query(param_refs.as_slice())?;
    let mut out = Vec::new();
    while let Some(row) = rows_iter.next()? {
        if out.len() >= remaining {
            break;
        }
        let mut row_map: Row = HashMap::with_capacity(column_names.len() + 1);
        for (idx, col) in column_names.iter().enumerate() {
            let value: SqlValue = row.get(idx)?;
            row_map.insert(col.clone(), value);
        }
        row_map.insert("_topic".to_string(), SqlValue::Text(topic_name.to_string()));
        out.push(row_map);
    }
    Ok(out)
}

/// Opens every named topic's database read-only-in-practice (no writes are
/// issued by this module) under `working_dir`, skipping any that fail to
/// open. Used by callers that only have topic names, not open handles.
pub fn open_topics(working_dir: &Path, topic_names: &[String], config: &EngineConfig) -> Vec<(String, TopicDb)> {
    let mut out = Vec::new();
    for name in topic_names {
        let db_path = working_dir.join(name).join(".internal").join(format!("{name}.db"));
        match TopicDb::open(&db_path, config.busy_timeout_ms) {
            Ok(db) => out.push((name.clone(), db)),
            Err(e) => warn!(topic = %name, error = %e, "could not open topic database for query"),
        }
    }
    out
}
