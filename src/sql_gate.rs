use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use once_cell::sync::Lazy;
use regex::Regex;
use rusqlite::types::ValueRef;
use rusqlite::Connection;
use serde_json::{Map, Value};

use crate::chunk_store::{self, token_content_id, CHUNK_REF_PREFIX};

const ALLOWED_PREFIXES: [&str; 12] = [
    "select",
    "with",
    "pragma",
    "explain",
    "create temporary table",
    "create temp table",
    "create view",
    "create temporary view",
    "create temp view",
    "drop view",
    "drop temporary table",
    "drop temp table",
];

struct BlockedRule {
    pattern: Regex,
    /// When set, a match whose `target` capture names a temp object is
    /// exempt from the block.
    temp_target_exempt: bool,
    message: &'static str,
}

static BLOCKED_RULES: Lazy<Vec<BlockedRule>> = Lazy::new(|| {
    vec![
        BlockedRule {
            pattern: Regex::new(r"\bdrop\s+table\s+(?:if\s+exists\s+)?(?P<target>[^\s;]+)")
                .expect("drop rule"),
            temp_target_exempt: true,
            message: "DROP TABLE",
        },
        BlockedRule {
            pattern: Regex::new(r"\bdelete\s+from\b").expect("delete rule"),
            temp_target_exempt: false,
            message: "DELETE FROM",
        },
        BlockedRule {
            pattern: Regex::new(r"\bupdate\s+\S+\s+set\b").expect("update rule"),
            temp_target_exempt: false,
            message: "UPDATE ... SET",
        },
        BlockedRule {
            pattern: Regex::new(r"\binsert\s+into\s+(?P<target>[^\s;(]+)").expect("insert rule"),
            temp_target_exempt: true,
            message: "INSERT INTO",
        },
        BlockedRule {
            pattern: Regex::new(r"\balter\s+table\b").expect("alter rule"),
            temp_target_exempt: false,
            message: "ALTER TABLE",
        },
        BlockedRule {
            pattern: Regex::new(r"\bcreate\s+table\s+(?:if\s+not\s+exists\s+)?(?P<target>[^\s;(]+)")
                .expect("create rule"),
            temp_target_exempt: true,
            message: "CREATE TABLE",
        },
        BlockedRule {
            pattern: Regex::new(r"\battach\s+database\b").expect("attach rule"),
            temp_target_exempt: false,
            message: "ATTACH DATABASE",
        },
        BlockedRule {
            pattern: Regex::new(r"\bdetach\s+database\b").expect("detach rule"),
            temp_target_exempt: false,
            message: "DETACH DATABASE",
        },
    ]
});

#[derive(Debug)]
pub enum GateError {
    NotAllowed(String),
    Execution(String),
}

impl std::fmt::Display for GateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GateError::NotAllowed(reason) => write!(f, "{reason}"),
            GateError::Execution(reason) => write!(f, "{reason}"),
        }
    }
}

/// Admits only the analytic dialect. Returns the query-type label used in
/// response metadata. Validation never rewrites the statement, so it is
/// idempotent by construction.
pub fn validate(sql: &str) -> Result<&'static str, GateError> {
    let trimmed = sql.trim();
    if trimmed.is_empty() {
        return Err(GateError::NotAllowed("Empty SQL statement".to_string()));
    }

    let normalised = trimmed
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");

    for rule in BLOCKED_RULES.iter() {
        for captures in rule.pattern.captures_iter(&normalised) {
            if rule.temp_target_exempt {
                if let Some(target) = captures.name("target") {
                    if target.as_str().starts_with("temp") {
                        continue;
                    }
                }
            }
            return Err(GateError::NotAllowed(format!(
                "Blocked pattern: {}",
                rule.message
            )));
        }
    }

    if !ALLOWED_PREFIXES
        .iter()
        .any(|prefix| normalised.starts_with(prefix))
    {
        return Err(GateError::NotAllowed(
            "Only SELECT, WITH, PRAGMA, EXPLAIN and temporary table/view statements are allowed"
                .to_string(),
        ));
    }

    Ok(query_type_label(&normalised))
}

fn query_type_label(normalised: &str) -> &'static str {
    if normalised.starts_with("with") {
        "cte"
    } else if normalised.starts_with("pragma") {
        "pragma"
    } else if normalised.starts_with("explain") {
        "explain"
    } else if normalised.starts_with("create") {
        "create_temp"
    } else {
        "select"
    }
}

#[derive(Debug)]
pub struct GatedResult {
    pub rows: Vec<Map<String, Value>>,
    pub column_names: Vec<String>,
    pub query_type: &'static str,
    pub chunked_content_resolved: bool,
}

/// Validates, executes and reconstitutes one analytic statement.
pub fn execute_gated(conn: &Connection, sql: &str) -> Result<GatedResult, GateError> {
    let query_type = validate(sql)?;

    let mut stmt = conn
        .prepare(sql)
        .map_err(|err| GateError::Execution(err.to_string()))?;
    let column_names: Vec<String> = stmt
        .column_names()
        .iter()
        .map(|name| name.to_string())
        .collect();
    let column_count = column_names.len();

    let mut rows = stmt
        .query([])
        .map_err(|err| GateError::Execution(err.to_string()))?;
    let mut collected = Vec::new();
    loop {
        let row = match rows.next() {
            Ok(Some(row)) => row,
            Ok(None) => break,
            Err(err) => return Err(GateError::Execution(err.to_string())),
        };
        let mut map = Map::new();
        for idx in 0..column_count {
            let value = row
                .get_ref(idx)
                .map(value_ref_to_json)
                .map_err(|err| GateError::Execution(err.to_string()))?;
            map.insert(column_names[idx].clone(), value);
        }
        collected.push(map);
    }
    drop(rows);
    drop(stmt);

    let resolved = reconstitute_rows(conn, &mut collected);

    Ok(GatedResult {
        rows: collected,
        column_names,
        query_type,
        chunked_content_resolved: resolved,
    })
}

pub(crate) fn value_ref_to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(v) => Value::from(v),
        ValueRef::Real(v) => serde_json::Number::from_f64(v)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        ValueRef::Text(bytes) => Value::String(String::from_utf8_lossy(bytes).to_string()),
        ValueRef::Blob(bytes) => Value::String(BASE64.encode(bytes)),
    }
}

/// Rewrites chunk-reference tokens in result cells with the reconstituted
/// content. Only text cells with the exact prefix are touched, and a
/// resolved value that is itself a reference is left as-is rather than
/// resolved again.
pub fn reconstitute_rows(conn: &Connection, rows: &mut [Map<String, Value>]) -> bool {
    let mut rewritten = false;

    for row in rows.iter_mut() {
        for cell in row.values_mut() {
            let Value::String(text) = cell else {
                continue;
            };
            let Some(content_id) = token_content_id(text) else {
                continue;
            };

            let replacement = match chunk_store::retrieve(conn, content_id) {
                Ok(Some(content)) => {
                    if content.starts_with(CHUNK_REF_PREFIX) {
                        Value::String(content)
                    } else {
                        serde_json::from_str(&content).unwrap_or(Value::String(content))
                    }
                }
                Ok(None) => Value::String(format!("[CHUNKED_CONTENT_NOT_FOUND:{content_id}]")),
                Err(err) => Value::String(format!("[CHUNKED_CONTENT_ERROR:{err}]")),
            };

            *cell = replacement;
            rewritten = true;
        }
    }

    rewritten
}
