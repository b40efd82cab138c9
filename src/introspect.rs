use anyhow::{bail, Result};
use rusqlite::Connection;
use serde_json::{json, Map, Value};
use tracing::warn;

use crate::sql_gate::value_ref_to_json;

const SAMPLE_ROW_LIMIT: usize = 3;

fn list_relations(conn: &Connection) -> Result<Vec<(String, String)>> {
    let mut stmt = conn.prepare(
        "SELECT name, type FROM sqlite_master
         WHERE type IN ('table', 'view') AND name NOT LIKE 'sqlite_%'
         ORDER BY name",
    )?;
    let relations = stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(relations)
}

/// Full staging summary. Failures on individual tables are logged and
/// skipped so one broken table cannot take down the overview.
pub fn summarise(conn: &Connection) -> Result<Value> {
    let relations = list_relations(conn)?;
    let table_names: Vec<String> = relations
        .iter()
        .filter(|(_, kind)| kind == "table")
        .map(|(name, _)| name.clone())
        .collect();

    let mut tables = Map::new();
    for (name, kind) in &relations {
        match describe_relation(conn, name, kind, &table_names) {
            Ok(description) => {
                tables.insert(name.clone(), description);
            }
            Err(err) => {
                warn!(table = %name, "Skipping table in summary: {err}");
            }
        }
    }

    let table_count = relations.iter().filter(|(_, k)| k == "table").count();
    let view_count = relations.len() - table_count;

    Ok(json!({
        "database_summary": format!("{table_count} tables, {view_count} views"),
        "tables": tables,
    }))
}

fn describe_relation(
    conn: &Connection,
    name: &str,
    kind: &str,
    table_names: &[String],
) -> Result<Value> {
    let row_count: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM {name}"), [], |row| {
        row.get(0)
    })?;

    Ok(json!({
        "type": kind,
        "row_count": row_count,
        "columns": columns_of(conn, name, table_names)?,
        "foreign_keys": foreign_keys_of(conn, name)?,
        "indexes": indexes_of(conn, name)?,
        "sample_data": sample_rows(conn, name)?,
    }))
}

pub fn columns_of(conn: &Connection, name: &str, table_names: &[String]) -> Result<Value> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({name})"))?;
    let mut columns = Vec::new();
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let column_name: String = row.get(1)?;
        let declared: String = row.get(2)?;
        let not_null: i64 = row.get(3)?;
        let default: Option<String> = row.get(4)?;
        let primary_key: i64 = row.get(5)?;

        let references = column_name
            .strip_suffix("_id")
            .filter(|stem| table_names.iter().any(|t| t == stem))
            .map(ToString::to_string);

        columns.push(json!({
            "name": column_name,
            "type": declared,
            "not_null": not_null != 0,
            "default": default,
            "primary_key": primary_key != 0,
            "references": references,
        }));
    }
    Ok(Value::Array(columns))
}

fn foreign_keys_of(conn: &Connection, name: &str) -> Result<Value> {
    let mut stmt = conn.prepare(&format!("PRAGMA foreign_key_list({name})"))?;
    let mut keys = Vec::new();
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let table: String = row.get(2)?;
        let from: String = row.get(3)?;
        let to: Option<String> = row.get(4)?;
        keys.push(json!({ "from": from, "table": table, "to": to }));
    }
    Ok(Value::Array(keys))
}

fn indexes_of(conn: &Connection, name: &str) -> Result<Value> {
    let mut stmt = conn.prepare(&format!("PRAGMA index_list({name})"))?;
    let mut indexes = Vec::new();
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let index_name: String = row.get(1)?;
        let unique: i64 = row.get(2)?;
        indexes.push(json!({ "name": index_name, "unique": unique != 0 }));
    }
    Ok(Value::Array(indexes))
}

fn sample_rows(conn: &Connection, name: &str) -> Result<Value> {
    let mut stmt = conn.prepare(&format!("SELECT * FROM {name} LIMIT {SAMPLE_ROW_LIMIT}"))?;
    let column_names: Vec<String> = stmt
        .column_names()
        .iter()
        .map(|n| n.to_string())
        .collect();

    let mut samples = Vec::new();
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let mut sample = Map::new();
        for (idx, column) in column_names.iter().enumerate() {
            sample.insert(column.clone(), value_ref_to_json(row.get_ref(idx)?));
        }
        samples.push(Value::Object(sample));
    }
    Ok(Value::Array(samples))
}

/// Column listing for one table, with naming-convention foreign-key links.
/// The name is checked against the catalogue before it is interpolated.
pub fn table_columns(conn: &Connection, table: &str) -> Result<Value> {
    let relations = list_relations(conn)?;
    if !relations.iter().any(|(name, _)| name == table) {
        bail!("Unknown table: {table}");
    }

    let table_names: Vec<String> = relations.into_iter().map(|(name, _)| name).collect();
    Ok(json!({
        "table": table,
        "columns": columns_of(conn, table, &table_names)?,
    }))
}

#[cfg(test)]
mod tests {
    use rusqlite::Connection;
    use serde_json::json;

    use crate::chunk_store::ensure_chunk_tables;
    use crate::insert::{create_tables, insert_payload};
    use crate::schema_infer::infer_schema;

    use super::{summarise, table_columns};

    fn staged_conn() -> Connection {
        let conn = Connection::open_in_memory().expect("in-memory db");
        ensure_chunk_tables(&conn).expect("chunk tables");
        let payload = json!({
            "target": {
                "id": "T1",
                "approvedSymbol": "AR",
                "associatedDiseases": {
                    "rows": [
                        { "disease": { "id": "D1", "name": "a" }, "score": 0.9 },
                        { "disease": { "id": "D2", "name": "b" }, "score": 0.7 }
                    ]
                }
            }
        });
        let plan = infer_schema(&payload, None);
        let degraded = create_tables(&conn, &plan).expect("ddl");
        insert_payload(&conn, &payload, &plan, &degraded, None, true).expect("insert");
        conn
    }

    #[test]
    fn summary_lists_all_staged_tables_with_rows() {
        let conn = staged_conn();
        let info = summarise(&conn).expect("summary");
        let tables = info["tables"].as_object().expect("tables map");

        for name in ["target", "disease", "disease_target"] {
            let table = &tables[name];
            assert!(
                table["row_count"].as_i64().unwrap() > 0,
                "{name} should have rows"
            );
            assert!(table["sample_data"].as_array().unwrap().len() <= 3);
        }
    }

    #[test]
    fn junction_columns_link_back_to_endpoint_tables() {
        let conn = staged_conn();
        let columns = table_columns(&conn, "disease_target").expect("columns");
        let refs: Vec<(String, Option<String>)> = columns["columns"]
            .as_array()
            .unwrap()
            .iter()
            .map(|c| {
                (
                    c["name"].as_str().unwrap().to_string(),
                    c["references"].as_str().map(ToString::to_string),
                )
            })
            .collect();

        assert!(refs.contains(&("disease_id".to_string(), Some("disease".to_string()))));
        assert!(refs.contains(&("target_id".to_string(), Some("target".to_string()))));
    }

    #[test]
    fn unknown_tables_are_rejected() {
        let conn = staged_conn();
        assert!(table_columns(&conn, "nope").is_err());
        assert!(table_columns(&conn, "target; DROP TABLE target").is_err());
    }

    #[test]
    fn summary_survives_a_broken_view() {
        let conn = staged_conn();
        conn.execute_batch("CREATE VIEW broken AS SELECT * FROM vanished").unwrap();

        let info = summarise(&conn).expect("summary");
        assert!(info["tables"].get("target").is_some());
        assert!(info["tables"].get("broken").is_none());
    }
}
