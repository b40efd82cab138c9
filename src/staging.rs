use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use anyhow::{Context, Result};
use rusqlite::Connection;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::chunk_store;
use crate::descriptor::TypeGraph;
use crate::insert::{create_tables, insert_payload};
use crate::introspect;
use crate::models::{PaginationInfo, QueryResponse, QuerySuccess, StageResponse, TableSummary};
use crate::schema_infer::{infer_schema, SchemaPlan};
use crate::sql_gate::{execute_gated, GateError};

/// One staging compartment: an isolated SQLite database keyed by the
/// caller-supplied access identifier. The connection lives as long as the
/// compartment, so temporary tables and views survive across queries.
/// Callers serialise operations through `lock_compartment`.
#[derive(Debug)]
pub struct Compartment {
    pub access_id: String,
    pub db_path: PathBuf,
    conn: Connection,
}

pub fn lock_compartment(handle: &Mutex<Compartment>) -> MutexGuard<'_, Compartment> {
    handle.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Compartment {
    pub fn open_at(data_root: &Path, access_id: &str) -> Result<Compartment> {
        let safe_name: String = access_id
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        let db_path = data_root.join(format!("{safe_name}.sqlite"));

        let conn = Connection::open(&db_path)
            .with_context(|| format!("Failed opening {}", db_path.display()))?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;",
        )?;
        chunk_store::ensure_chunk_tables(&conn)?;

        Ok(Compartment {
            access_id: access_id.to_string(),
            db_path,
            conn,
        })
    }

    pub fn stage(
        &self,
        payload: &Value,
        descriptor: Option<&str>,
        compress: bool,
    ) -> StageResponse {
        match self.stage_inner(payload, descriptor, compress) {
            Ok(response) => response,
            Err(err) => {
                warn!(access_id = %self.access_id, "Staging failed: {err:#}");
                StageResponse::failure(format!("Staging failed: {err:#}"))
            }
        }
    }

    fn stage_inner(
        &self,
        payload: &Value,
        descriptor: Option<&str>,
        compress: bool,
    ) -> Result<StageResponse> {
        let payload = unwrap_data_envelope(payload);
        let pagination = lift_pagination(payload);

        let graph = descriptor.map(TypeGraph::parse);
        let graph = graph.as_ref().filter(|g| !g.is_empty());

        let plan = infer_schema(payload, graph);
        let degraded = create_tables(&self.conn, &plan)?;
        let outcome = insert_payload(&self.conn, payload, &plan, &degraded, graph, compress)?;

        let schemas = summarise_plan(&self.conn, &plan)?;
        let total_rows: i64 = schemas.values().map(|t| t.row_count).sum();
        let table_count = schemas.len();

        info!(
            access_id = %self.access_id,
            tables = table_count,
            rows = outcome.rows_inserted,
            junction_rows = outcome.junction_rows,
            "Payload staged"
        );

        Ok(StageResponse {
            success: true,
            message: format!("Staged {table_count} table(s) with {total_rows} row(s)"),
            schemas,
            table_count,
            total_rows,
            pagination,
        })
    }

    pub fn query(&self, sql: &str) -> QueryResponse {
        match execute_gated(&self.conn, sql) {
            Ok(result) => QueryResponse::Success(QuerySuccess {
                success: true,
                row_count: result.rows.len(),
                results: result.rows,
                column_names: result.column_names,
                query_type: result.query_type.to_string(),
                chunked_content_resolved: result.chunked_content_resolved,
            }),
            Err(GateError::NotAllowed(reason)) => QueryResponse::failure(reason, sql),
            Err(GateError::Execution(reason)) => QueryResponse::failure(reason, sql),
        }
    }

    pub fn introspect(&self) -> Result<Value> {
        let schema_info = introspect::summarise(&self.conn)?;
        Ok(json!({ "success": true, "schema_info": schema_info }))
    }

    pub fn table_columns(&self, table: &str) -> Result<Value> {
        let mut columns = introspect::table_columns(&self.conn, table)?;
        if let Some(map) = columns.as_object_mut() {
            map.insert("success".to_string(), json!(true));
        }
        Ok(columns)
    }

    pub fn chunking_stats(&self) -> Result<Value> {
        chunk_store::stats(&self.conn)
    }

    /// Tears the compartment down: the database file and its WAL side
    /// files are removed. The open connection holds only unlinked inodes
    /// afterwards and is released when the compartment is dropped.
    pub fn delete(&self) -> Result<()> {
        for suffix in ["", "-wal", "-shm"] {
            let mut path = self.db_path.clone().into_os_string();
            path.push(suffix);
            match std::fs::remove_file(PathBuf::from(path)) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => {
                    return Err(err).with_context(|| {
                        format!("Failed to delete {}{suffix}", self.db_path.display())
                    });
                }
            }
        }
        info!(access_id = %self.access_id, "Compartment deleted");
        Ok(())
    }
}

/// Graph-query responses wrap everything in a single `data` key; unwrap it
/// once before inference.
fn unwrap_data_envelope(payload: &Value) -> &Value {
    if let Value::Object(map) = payload {
        if map.len() == 1 {
            if let Some(inner) = map.get("data") {
                return inner;
            }
        }
    }
    payload
}

fn summarise_plan(
    conn: &Connection,
    plan: &SchemaPlan,
) -> Result<BTreeMap<String, TableSummary>> {
    let mut schemas = BTreeMap::new();

    for table in plan.tables.values() {
        let row_count = count_rows(conn, &table.name).unwrap_or(0);
        let mut columns = BTreeMap::new();
        columns.insert("id".to_string(), table.id_mode.storage().as_sql().to_string());
        for column in &table.columns {
            columns.insert(column.name.clone(), column.storage.as_sql().to_string());
        }
        schemas.insert(
            table.name.clone(),
            TableSummary {
                columns,
                row_count,
                sample_data: table
                    .sample_rows
                    .iter()
                    .map(|row| Value::Object(row.clone()))
                    .collect(),
            },
        );
    }

    for junction in plan.junctions.values() {
        let row_count = count_rows(conn, &junction.name).unwrap_or(0);
        let mut columns = BTreeMap::new();
        columns.insert("id".to_string(), "INTEGER".to_string());
        for endpoint in [&junction.left, &junction.right] {
            let storage = plan
                .tables
                .get(endpoint.as_str())
                .map(|t| t.id_mode.storage().as_sql())
                .unwrap_or("TEXT");
            columns.insert(format!("{endpoint}_id"), storage.to_string());
        }
        schemas.insert(
            junction.name.clone(),
            TableSummary {
                columns,
                row_count,
                sample_data: Vec::new(),
            },
        );
    }

    Ok(schemas)
}

fn count_rows(conn: &Connection, table: &str) -> Result<i64> {
    conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))
        .with_context(|| format!("counting rows of {table}"))
}

/// Finds a page-info block anywhere in the payload and lifts it into the
/// stage response when more pages are available upstream.
fn lift_pagination(payload: &Value) -> Option<PaginationInfo> {
    let (carrier, page_info) = find_page_info(payload)?;

    let has_next_page = page_info.get("hasNextPage")?.as_bool()?;
    if !has_next_page {
        return None;
    }

    let current_count = ["rows", "edges", "nodes"]
        .iter()
        .find_map(|key| carrier.get(*key))
        .and_then(Value::as_array)
        .map(|items| items.len() as i64)
        .unwrap_or(0);
    let total_count = ["totalCount", "count", "total"]
        .iter()
        .find_map(|key| carrier.get(*key))
        .and_then(Value::as_i64);

    Some(PaginationInfo {
        has_next_page,
        has_previous_page: page_info
            .get("hasPreviousPage")
            .and_then(Value::as_bool)
            .unwrap_or(false),
        current_count,
        total_count,
        end_cursor: page_info
            .get("endCursor")
            .and_then(Value::as_str)
            .map(ToString::to_string),
        start_cursor: page_info
            .get("startCursor")
            .and_then(Value::as_str)
            .map(ToString::to_string),
        suggestion: Some(
            "More results are available upstream; re-run the source query with the end cursor to fetch the next page."
                .to_string(),
        ),
    })
}

fn find_page_info(
    value: &Value,
) -> Option<(&serde_json::Map<String, Value>, &serde_json::Map<String, Value>)> {
    match value {
        Value::Object(map) => {
            if let Some(Value::Object(page_info)) = map.get("pageInfo") {
                return Some((map, page_info));
            }
            map.values().find_map(find_page_info)
        }
        Value::Array(items) => items.iter().find_map(find_page_info),
        _ => None,
    }
}
