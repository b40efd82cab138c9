use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use anyhow::{Context, Result};
use rusqlite::{types::Value as SqlValue, Connection};
use serde_json::{Map, Value};
use tracing::warn;

use crate::chunk_store::{self, ChunkContentType};
use crate::descriptor::TypeGraph;
use crate::identifiers::is_identifier_key;
use crate::schema_infer::{
    classify_value, entity_type_name, is_entity, materialise_row, supplied_id, wrapper_elements,
    CellKind, FallbackKind, FieldShape, RowCell, SchemaPlan, SynthNamer,
};

/// Surrogate identity of an inserted entity, usable as a junction endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SurrogateId {
    Int(i64),
    Text(String),
}

impl SurrogateId {
    fn from_value(value: &Value) -> SurrogateId {
        match value {
            Value::Number(n) if n.is_i64() => SurrogateId::Int(n.as_i64().unwrap_or_default()),
            Value::String(s) => SurrogateId::Text(s.clone()),
            other => SurrogateId::Text(other.to_string()),
        }
    }

    fn to_sql(&self) -> SqlValue {
        match self {
            SurrogateId::Int(v) => SqlValue::Integer(*v),
            SurrogateId::Text(v) => SqlValue::Text(v.clone()),
        }
    }
}

#[derive(Debug, Default)]
pub struct InsertOutcome {
    pub rows_inserted: u64,
    pub junction_rows: u64,
}

/// Emits DDL for every planned table and junction. A table whose creation
/// fails is retried with a minimal `(id, data_json)` shape so staging can
/// proceed; the degraded names are returned.
pub fn create_tables(conn: &Connection, plan: &SchemaPlan) -> Result<HashSet<String>> {
    let mut degraded = HashSet::new();

    for table in plan.tables.values() {
        let mut parts = vec![table.id_mode.ddl().to_string()];
        for column in &table.columns {
            parts.push(format!("{} {}", column.name, column.storage.as_sql()));
        }
        let ddl = format!(
            "CREATE TABLE IF NOT EXISTS {} ({})",
            table.name,
            parts.join(", ")
        );

        if let Err(err) = conn.execute_batch(&ddl) {
            warn!(table = %table.name, "Table creation failed, using minimal shape: {err}");
            conn.execute_batch(&format!(
                "CREATE TABLE IF NOT EXISTS {} (id INTEGER PRIMARY KEY AUTOINCREMENT, data_json TEXT)",
                table.name
            ))
            .with_context(|| format!("minimal table shape for {} failed", table.name))?;
            degraded.insert(table.name.clone());
        }
    }

    for junction in plan.junctions.values() {
        let left_type = plan
            .tables
            .get(&junction.left)
            .map(|t| t.id_mode.storage().as_sql())
            .unwrap_or("TEXT");
        let right_type = plan
            .tables
            .get(&junction.right)
            .map(|t| t.id_mode.storage().as_sql())
            .unwrap_or("TEXT");
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {name} (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                {left}_id {left_type},
                {right}_id {right_type},
                UNIQUE({left}_id, {right}_id)
            )",
            name = junction.name,
            left = junction.left,
            right = junction.right,
        ))
        .with_context(|| format!("junction table {} failed", junction.name))?;
    }

    Ok(degraded)
}

pub fn insert_payload(
    conn: &Connection,
    payload: &Value,
    plan: &SchemaPlan,
    degraded: &HashSet<String>,
    graph: Option<&TypeGraph>,
    compress: bool,
) -> Result<InsertOutcome> {
    match plan.fallback {
        Some(kind) => insert_fallback(conn, payload, plan, kind, graph, compress),
        None => {
            let mut inserter = Inserter {
                conn,
                plan,
                degraded,
                graph,
                compress,
                memo: HashMap::new(),
                pairs: BTreeMap::new(),
                synth: SynthNamer::default(),
                rows_inserted: 0,
            };
            inserter.walk(payload, None, None);
            let junction_rows = inserter.insert_junctions()?;
            Ok(InsertOutcome {
                rows_inserted: inserter.rows_inserted,
                junction_rows,
            })
        }
    }
}

struct Inserter<'a> {
    conn: &'a Connection,
    plan: &'a SchemaPlan,
    degraded: &'a HashSet<String>,
    graph: Option<&'a TypeGraph>,
    compress: bool,
    /// type -> payload node address -> surrogate id
    memo: HashMap<String, HashMap<usize, SurrogateId>>,
    /// junction name -> de-duplicated (left_id, right_id) pairs
    pairs: BTreeMap<String, BTreeSet<(SurrogateId, SurrogateId)>>,
    synth: SynthNamer,
    rows_inserted: u64,
}

impl<'a> Inserter<'a> {
    // Mirrors the inference walk so the synthesised type-name sequence
    // lines up with the plan.
    fn walk(&mut self, value: &Value, segment: Option<&str>, parent_segment: Option<&str>) {
        match value {
            Value::Array(items) => {
                for item in items {
                    self.walk(item, segment, parent_segment);
                }
            }
            Value::Object(map) => {
                if let Some(elements) = wrapper_elements(map) {
                    for element in elements {
                        self.walk(element, segment, parent_segment);
                    }
                } else if is_entity(map) {
                    let type_name = entity_type_name(map, segment, parent_segment, &mut self.synth);
                    self.insert_entity(map, &type_name, segment);
                } else {
                    for (field, child) in map {
                        self.walk(child, Some(field), segment);
                    }
                }
            }
            _ => {}
        }
    }

    fn insert_entity(
        &mut self,
        map: &Map<String, Value>,
        type_name: &str,
        segment: Option<&str>,
    ) -> Option<SurrogateId> {
        let address = map as *const Map<String, Value> as usize;
        if let Some(existing) = self
            .memo
            .get(type_name)
            .and_then(|bucket| bucket.get(&address))
        {
            return Some(existing.clone());
        }

        let row_id = self.insert_row(map, type_name);
        if let Some(id) = &row_id {
            self.memo
                .entry(type_name.to_string())
                .or_default()
                .insert(address, id.clone());
        }

        for (field, child) in map {
            if field == "__typename" {
                continue;
            }
            match classify_value(child) {
                FieldShape::Scalar(_) => {}
                FieldShape::EntityRef(nested) => {
                    let child_type =
                        entity_type_name(nested, Some(field), segment, &mut self.synth);
                    self.insert_entity(nested, &child_type, Some(field));
                }
                FieldShape::EntityArray(elements) => {
                    let child_type =
                        entity_type_name(elements[0], Some(field), segment, &mut self.synth);
                    let junction = (child_type != type_name).then(|| {
                        crate::schema_infer::junction_name(type_name, &child_type)
                    });
                    for element in elements {
                        let child_id = self.insert_entity(element, &child_type, Some(field));
                        let (Some(junction), Some(parent_id), Some(child_id)) =
                            (&junction, &row_id, child_id)
                        else {
                            continue;
                        };
                        if !self.plan.junctions.contains_key(&junction.name) {
                            continue;
                        }
                        let pair = if junction.left == *type_name {
                            (parent_id.clone(), child_id)
                        } else {
                            (child_id, parent_id.clone())
                        };
                        self.pairs.entry(junction.name.clone()).or_default().insert(pair);
                    }
                }
                FieldShape::FlattenMap(nested) => {
                    for (sub, sub_child) in nested {
                        self.walk(sub_child, Some(sub), Some(field));
                    }
                }
                FieldShape::Complex(value) => {
                    self.walk_complex(value, field);
                }
            }
        }

        row_id
    }

    fn walk_complex(&mut self, value: &Value, field: &str) {
        match value {
            Value::Array(items) => {
                for item in items {
                    self.walk(item, Some(field), None);
                }
            }
            Value::Object(map) => {
                if let Some(elements) = wrapper_elements(map) {
                    for element in elements {
                        self.walk(element, Some(field), None);
                    }
                } else {
                    for (sub, child) in map {
                        self.walk(child, Some(sub), Some(field));
                    }
                }
            }
            _ => {}
        }
    }

    fn insert_row(&mut self, map: &Map<String, Value>, type_name: &str) -> Option<SurrogateId> {
        let table = self.plan.tables.get(type_name)?;

        if self.degraded.contains(type_name) {
            let document = Value::Object(map.clone()).to_string();
            match self.conn.execute(
                &format!("INSERT INTO {type_name} (data_json) VALUES (?1)"),
                [&document],
            ) {
                Ok(_) => {
                    self.rows_inserted += 1;
                    return Some(SurrogateId::Int(self.conn.last_insert_rowid()));
                }
                Err(err) => {
                    warn!(table = %type_name, "Row insertion failed: {err}");
                    return None;
                }
            }
        }

        let cells = materialise_row(map, self.graph, type_name);
        let mut columns: Vec<String> = Vec::new();
        let mut params: Vec<SqlValue> = Vec::new();
        let mut seen = HashSet::new();

        for cell in &cells {
            let known = cell.column == "id"
                || table.columns.iter().any(|c| c.name == cell.column);
            if !known || !seen.insert(cell.column.clone()) {
                continue;
            }
            columns.push(cell.column.clone());
            params.push(self.bind_value(cell));
        }

        let supplied = supplied_id(map).map(SurrogateId::from_value);
        let result = if columns.is_empty() {
            self.conn
                .execute(&format!("INSERT OR IGNORE INTO {type_name} DEFAULT VALUES"), [])
        } else {
            let placeholders: Vec<String> =
                (1..=columns.len()).map(|i| format!("?{i}")).collect();
            self.conn.execute(
                &format!(
                    "INSERT OR IGNORE INTO {type_name} ({}) VALUES ({})",
                    columns.join(", "),
                    placeholders.join(", ")
                ),
                rusqlite::params_from_iter(params),
            )
        };

        match result {
            Ok(changed) => {
                self.rows_inserted += changed as u64;
                Some(supplied.unwrap_or_else(|| SurrogateId::Int(self.conn.last_insert_rowid())))
            }
            Err(err) => {
                warn!(table = %type_name, "Row insertion failed: {err}");
                None
            }
        }
    }

    /// Converts one cell to a bind parameter, diverting oversized text and
    /// JSON through the chunk store.
    fn bind_value(&self, cell: &RowCell) -> SqlValue {
        match &cell.value {
            Value::Null => SqlValue::Null,
            Value::Bool(b) => SqlValue::Integer(*b as i64),
            Value::Number(n) => {
                if let Some(v) = n.as_i64() {
                    SqlValue::Integer(v)
                } else if let Some(v) = n.as_f64() {
                    SqlValue::Real(v)
                } else {
                    SqlValue::Text(n.to_string())
                }
            }
            Value::String(s) => {
                let chunkable = cell.kind != CellKind::ForeignKey
                    && cell.column != "id"
                    && !is_identifier_key(&cell.field);
                let rule = self.graph.and_then(|g| g.chunk_rule(&cell.field));
                if chunkable && chunk_store::should_chunk(s.len(), rule.as_ref()) {
                    let content_type = if cell.kind == CellKind::Json {
                        ChunkContentType::Json
                    } else {
                        ChunkContentType::Text
                    };
                    match chunk_store::store(self.conn, s, content_type, self.compress) {
                        Ok(token) => return SqlValue::Text(token),
                        Err(err) => {
                            warn!(column = %cell.column, "Chunking failed, storing inline: {err}");
                        }
                    }
                }
                SqlValue::Text(s.clone())
            }
            other => SqlValue::Text(other.to_string()),
        }
    }

    fn insert_junctions(&self) -> Result<u64> {
        let mut inserted = 0u64;

        for (name, pairs) in &self.pairs {
            let Some(junction) = self.plan.junctions.get(name) else {
                continue;
            };
            let sql = format!(
                "INSERT OR IGNORE INTO {name} ({}_id, {}_id) VALUES (?1, ?2)",
                junction.left, junction.right
            );
            let mut stmt = self.conn.prepare(&sql)?;
            for (left, right) in pairs {
                match stmt.execute(rusqlite::params![left.to_sql(), right.to_sql()]) {
                    Ok(changed) => inserted += changed as u64,
                    Err(err) => warn!(junction = %name, "Junction insertion failed: {err}"),
                }
            }
        }

        Ok(inserted)
    }
}

fn insert_fallback(
    conn: &Connection,
    payload: &Value,
    plan: &SchemaPlan,
    kind: FallbackKind,
    graph: Option<&TypeGraph>,
    compress: bool,
) -> Result<InsertOutcome> {
    let mut outcome = InsertOutcome::default();

    match kind {
        FallbackKind::Scalar => {
            conn.execute(
                "INSERT INTO scalar_data (value) VALUES (?1)",
                [scalar_param(payload)],
            )?;
            outcome.rows_inserted = 1;
        }
        FallbackKind::Array => {
            let Value::Array(items) = payload else {
                return Ok(outcome);
            };
            let mut stmt = conn.prepare("INSERT INTO array_data (value) VALUES (?1)")?;
            for item in items {
                let param = match item {
                    Value::Array(_) | Value::Object(_) => {
                        let document = item.to_string();
                        if chunk_store::should_chunk(document.len(), None) {
                            SqlValue::Text(chunk_store::store(
                                conn,
                                &document,
                                ChunkContentType::Json,
                                compress,
                            )?)
                        } else {
                            SqlValue::Text(document)
                        }
                    }
                    scalar => scalar_param(scalar),
                };
                match stmt.execute([param]) {
                    Ok(_) => outcome.rows_inserted += 1,
                    Err(err) => warn!("Array row insertion failed: {err}"),
                }
            }
        }
        FallbackKind::RootObject => {
            let Value::Object(map) = payload else {
                return Ok(outcome);
            };
            let table = plan
                .tables
                .get("root_object")
                .context("root_object plan missing")?;
            let cells = materialise_row(map, graph, "root_object");
            let mut columns = Vec::new();
            let mut params: Vec<SqlValue> = Vec::new();
            for cell in &cells {
                if !table.columns.iter().any(|c| c.name == cell.column) {
                    continue;
                }
                columns.push(cell.column.clone());
                let param = match &cell.value {
                    Value::String(s)
                        if cell.kind == CellKind::Json
                            && chunk_store::should_chunk(s.len(), None) =>
                    {
                        SqlValue::Text(chunk_store::store(
                            conn,
                            s,
                            ChunkContentType::Json,
                            compress,
                        )?)
                    }
                    value => scalar_param(value),
                };
                params.push(param);
            }

            if columns.is_empty() {
                conn.execute("INSERT INTO root_object DEFAULT VALUES", [])?;
            } else {
                let placeholders: Vec<String> =
                    (1..=columns.len()).map(|i| format!("?{i}")).collect();
                conn.execute(
                    &format!(
                        "INSERT INTO root_object ({}) VALUES ({})",
                        columns.join(", "),
                        placeholders.join(", ")
                    ),
                    rusqlite::params_from_iter(params),
                )?;
            }
            outcome.rows_inserted = 1;
        }
    }

    Ok(outcome)
}

fn scalar_param(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(*b as i64),
        Value::Number(n) => {
            if let Some(v) = n.as_i64() {
                SqlValue::Integer(v)
            } else if let Some(v) = n.as_f64() {
                SqlValue::Real(v)
            } else {
                SqlValue::Text(n.to_string())
            }
        }
        Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use rusqlite::Connection;
    use serde_json::{json, Value};

    use crate::chunk_store::{ensure_chunk_tables, CHUNK_REF_PREFIX};
    use crate::schema_infer::infer_schema;

    use super::{create_tables, insert_payload};

    fn stage(payload: &Value) -> Connection {
        let conn = Connection::open_in_memory().expect("in-memory db");
        ensure_chunk_tables(&conn).expect("chunk tables");
        let plan = infer_schema(payload, None);
        let degraded = create_tables(&conn, &plan).expect("ddl");
        insert_payload(&conn, payload, &plan, &degraded, None, true).expect("insert");
        conn
    }

    fn count(conn: &Connection, table: &str) -> i64 {
        conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))
            .unwrap()
    }

    #[test]
    fn single_entity_round_trips() {
        let conn = stage(&json!({
            "target": {
                "id": "ENSG00000169083",
                "approvedSymbol": "AR",
                "biotype": "protein_coding"
            }
        }));

        assert_eq!(count(&conn, "target"), 1);
        let symbol: String = conn
            .query_row("SELECT approved_symbol FROM target", [], |row| row.get(0))
            .unwrap();
        assert_eq!(symbol, "AR");
    }

    #[test]
    fn association_rows_fill_the_junction() {
        let conn = stage(&json!({
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
        }));

        assert_eq!(count(&conn, "target"), 1);
        assert_eq!(count(&conn, "disease"), 4);
        assert_eq!(count(&conn, "disease_target"), 2);

        let target_ids: Vec<String> = conn
            .prepare("SELECT DISTINCT target_id FROM disease_target")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(target_ids, vec!["T1".to_string()]);
    }

    #[test]
    fn duplicate_children_deduplicate_pairs() {
        let conn = stage(&json!({
            "target": {
                "id": "T1",
                "approvedSymbol": "AR",
                "diseases": [
                    { "id": "D1", "name": "a" },
                    { "id": "D1", "name": "a" }
                ]
            }
        }));

        assert_eq!(count(&conn, "disease"), 1);
        assert_eq!(count(&conn, "disease_target"), 1);
    }

    #[test]
    fn oversized_fields_store_chunk_references() {
        let description = "long description ".repeat(2_560); // 43_520 bytes
        let conn = stage(&json!({
            "target": {
                "id": "T1",
                "approvedSymbol": "AR",
                "description": description
            }
        }));

        let stored: String = conn
            .query_row("SELECT description FROM target", [], |row| row.get(0))
            .unwrap();
        assert!(stored.starts_with(CHUNK_REF_PREFIX));

        let original_size: i64 = conn
            .query_row("SELECT original_size FROM chunk_metadata", [], |row| row.get(0))
            .unwrap();
        assert_eq!(original_size, 43_520);
    }

    #[test]
    fn identifier_fields_are_never_chunked() {
        let huge_id = "i".repeat(50_000);
        let conn = stage(&json!({ "thing": { "id": huge_id, "name": "n" } }));

        let id: String = conn
            .query_row("SELECT id FROM thing", [], |row| row.get(0))
            .unwrap();
        assert!(!id.starts_with(CHUNK_REF_PREFIX));
        assert_eq!(id.len(), 50_000);
    }

    #[test]
    fn scalar_array_inserts_one_row_per_item() {
        let conn = stage(&json!([1, 2, "x"]));

        assert_eq!(count(&conn, "array_data"), 3);
        let values: Vec<String> = conn
            .prepare("SELECT CAST(value AS TEXT) FROM array_data ORDER BY id")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(values, vec!["1", "2", "x"]);
    }

    #[test]
    fn null_payload_lands_in_scalar_data() {
        let conn = stage(&json!(null));
        assert_eq!(count(&conn, "scalar_data"), 1);
        let value: Option<String> = conn
            .query_row("SELECT value FROM scalar_data", [], |row| row.get(0))
            .unwrap();
        assert!(value.is_none());
    }

    #[test]
    fn empty_object_lands_in_root_object() {
        let conn = stage(&json!({}));
        assert_eq!(count(&conn, "root_object"), 1);
    }

    #[test]
    fn staging_same_payload_twice_is_shape_stable() {
        let payload = json!({
            "target": {
                "id": "T1",
                "approvedSymbol": "AR",
                "diseases": [ { "id": "D1", "name": "a" } ]
            }
        });

        let shapes: Vec<Vec<String>> = (0..2)
            .map(|_| {
                let conn = stage(&payload);
                let mut stmt = conn
                    .prepare(
                        "SELECT name FROM sqlite_master WHERE type = 'table' \
                         AND name NOT LIKE 'sqlite_%' ORDER BY name",
                    )
                    .unwrap();
                stmt.query_map([], |row| row.get(0))
                    .unwrap()
                    .collect::<Result<_, _>>()
                    .unwrap()
            })
            .collect();

        assert_eq!(shapes[0], shapes[1]);
    }

    #[test]
    fn degraded_tables_accept_raw_documents() {
        let payload = json!({ "thing": { "id": "X1", "name": "n" } });
        let conn = Connection::open_in_memory().unwrap();
        ensure_chunk_tables(&conn).unwrap();
        let plan = infer_schema(&payload, None);

        // Pre-create a conflicting shape so the planned DDL degrades.
        let mut degraded = HashSet::new();
        degraded.insert("thing".to_string());
        conn.execute_batch(
            "CREATE TABLE thing (id INTEGER PRIMARY KEY AUTOINCREMENT, data_json TEXT)",
        )
        .unwrap();

        insert_payload(&conn, &payload, &plan, &degraded, None, true).unwrap();
        let doc: String = conn
            .query_row("SELECT data_json FROM thing", [], |row| row.get(0))
            .unwrap();
        assert!(doc.contains("\"name\""));
    }
}
