use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde_json::{Map, Value};

use crate::descriptor::{Cardinality, TypeGraph};
use crate::identifiers::{
    is_identifier_key, normalise_column, normalise_table, singularise, ID_KEYS,
};
use crate::storage_class::{ColumnType, StorageClass};

pub const GRAPH_WRAPPER_KEYS: [&str; 3] = ["edges", "nodes", "rows"];

const MEANINGFUL_FIELDS: [&str; 5] = ["name", "symbol", "description", "type", "score"];

pub fn is_meaningful_field(field: &str) -> bool {
    let name = normalise_column(field);
    MEANINGFUL_FIELDS
        .iter()
        .any(|m| name == *m || name.ends_with(&format!("_{m}")))
}

/// A map node is an entity when it carries an identifier key, or when it
/// has at least two fields of which one is human-meaningful.
pub fn is_entity(map: &Map<String, Value>) -> bool {
    if map.is_empty() {
        return false;
    }
    if map.keys().any(|k| crate::identifiers::is_identifier_key(k)) {
        return true;
    }
    map.len() >= 2 && map.keys().any(|k| is_meaningful_field(k))
}

fn is_scalar(value: &Value) -> bool {
    matches!(
        value,
        Value::Null | Value::Bool(_) | Value::Number(_) | Value::String(_)
    )
}

/// Inner elements of a graph-wrapper map (`{edges: [{node: …}]}`,
/// `{rows: […]}`, `{nodes: […]}`), or None when the map is not a wrapper.
pub fn wrapper_elements(map: &Map<String, Value>) -> Option<Vec<&Value>> {
    for key in GRAPH_WRAPPER_KEYS {
        let Some(Value::Array(items)) = map.get(key) else {
            continue;
        };
        let elements = items
            .iter()
            .map(|item| {
                if key == "edges" {
                    if let Value::Object(edge) = item {
                        if let Some(node @ Value::Object(_)) = edge.get("node") {
                            return node;
                        }
                    }
                }
                item
            })
            .collect();
        return Some(elements);
    }
    None
}

#[derive(Debug)]
pub enum FieldShape<'a> {
    Scalar(&'a Value),
    EntityRef(&'a Map<String, Value>),
    FlattenMap(&'a Map<String, Value>),
    EntityArray(Vec<&'a Map<String, Value>>),
    Complex(&'a Value),
}

pub fn classify_value(value: &Value) -> FieldShape<'_> {
    match value {
        Value::Null | Value::Bool(_) | Value::Number(_) | Value::String(_) => {
            FieldShape::Scalar(value)
        }
        Value::Object(map) => {
            if let Some(elements) = wrapper_elements(map) {
                let entities: Vec<&Map<String, Value>> = elements
                    .into_iter()
                    .filter_map(Value::as_object)
                    .filter(|m| is_entity(m))
                    .collect();
                if entities.is_empty() {
                    FieldShape::Complex(value)
                } else {
                    FieldShape::EntityArray(entities)
                }
            } else if is_entity(map) {
                FieldShape::EntityRef(map)
            } else if map.values().any(is_scalar) {
                FieldShape::FlattenMap(map)
            } else {
                FieldShape::Complex(value)
            }
        }
        Value::Array(items) => {
            let entities: Vec<&Map<String, Value>> = items
                .iter()
                .filter_map(Value::as_object)
                .filter(|m| is_entity(m))
                .collect();
            if entities.is_empty() {
                FieldShape::Complex(value)
            } else {
                FieldShape::EntityArray(entities)
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct SynthNamer {
    counter: u32,
}

impl SynthNamer {
    fn next_name(&mut self) -> String {
        self.counter += 1;
        format!("entity_{}", self.counter)
    }
}

/// Stable type name for an entity node. Priority: discriminator field,
/// known identifier key, singularised path segment, synthesised name.
/// Wrapper segments are transparent; the parent segment names the type.
pub fn entity_type_name(
    map: &Map<String, Value>,
    segment: Option<&str>,
    parent_segment: Option<&str>,
    synth: &mut SynthNamer,
) -> String {
    if let Some(Value::String(discriminator)) = map.get("__typename") {
        return normalise_table(discriminator);
    }

    for (key, canonical) in ID_KEYS {
        if map.contains_key(*key) {
            return (*canonical).to_string();
        }
    }

    let effective = match segment {
        Some(seg) if GRAPH_WRAPPER_KEYS.contains(&seg) => parent_segment,
        other => other,
    };
    match effective {
        Some(seg) => normalise_table(&singularise(seg)),
        None => synth.next_name(),
    }
}

/// The identifier an entity supplied, if any. A generic `id` wins over a
/// domain identifier key when both are present.
pub fn supplied_id(map: &Map<String, Value>) -> Option<&Value> {
    if let Some(value) = map.get("id") {
        if is_scalar(value) && !value.is_null() {
            return Some(value);
        }
    }
    for (key, _) in ID_KEYS {
        if let Some(value) = map.get(*key) {
            if is_scalar(value) && !value.is_null() {
                return Some(value);
            }
        }
    }
    None
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellKind {
    Scalar,
    ForeignKey,
    Flattened,
    Json,
}

#[derive(Debug, Clone)]
pub struct RowCell {
    pub column: String,
    /// Raw payload field the cell came from, for chunking-rule lookup.
    pub field: String,
    pub kind: CellKind,
    pub value: Value,
}

/// Flat row shape for one map node. Shared between inference (column
/// typing, samples) and insertion (parameter binding), so the two passes
/// cannot drift apart. Descriptor extraction rules rename payload fields
/// to their declared columns; identifier keys are never renamed.
pub fn materialise_row(
    map: &Map<String, Value>,
    graph: Option<&TypeGraph>,
    type_name: &str,
) -> Vec<RowCell> {
    let column_base = |field: &str| -> String {
        if !is_identifier_key(field) {
            if let Some(mapped) = graph.and_then(|g| g.remapped_column(type_name, field)) {
                return mapped;
            }
        }
        normalise_column(field)
    };

    let mut cells = Vec::new();

    let id = supplied_id(map);
    if let Some(id) = id {
        cells.push(RowCell {
            column: "id".to_string(),
            field: "id".to_string(),
            kind: CellKind::Scalar,
            value: id.clone(),
        });
    }

    for (field, value) in map {
        if field == "__typename" || (field == "id" && id.is_some()) {
            continue;
        }

        match classify_value(value) {
            FieldShape::Scalar(v) => cells.push(RowCell {
                column: column_base(field),
                field: field.clone(),
                kind: CellKind::Scalar,
                value: v.clone(),
            }),
            FieldShape::EntityRef(child) => cells.push(RowCell {
                column: format!("{}_id", column_base(field)),
                field: field.clone(),
                kind: CellKind::ForeignKey,
                value: supplied_id(child).cloned().unwrap_or(Value::Null),
            }),
            FieldShape::FlattenMap(child) => {
                let prefix = column_base(field);
                for (sub, sub_value) in child {
                    if is_scalar(sub_value) {
                        cells.push(RowCell {
                            column: format!("{prefix}_{}", normalise_column(sub)),
                            field: field.clone(),
                            kind: CellKind::Flattened,
                            value: sub_value.clone(),
                        });
                    }
                }
            }
            FieldShape::EntityArray(_) => {}
            FieldShape::Complex(v) => cells.push(RowCell {
                column: format!("{}_json", column_base(field)),
                field: field.clone(),
                kind: CellKind::Json,
                value: Value::String(v.to_string()),
            }),
        }
    }

    cells
}

pub fn cells_to_map(cells: &[RowCell]) -> Map<String, Value> {
    let mut map = Map::new();
    for cell in cells {
        map.insert(cell.column.clone(), cell.value.clone());
    }
    map
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdMode {
    Autoincrement,
    SuppliedInteger,
    SuppliedText,
}

impl IdMode {
    pub fn ddl(self) -> &'static str {
        match self {
            IdMode::Autoincrement => "id INTEGER PRIMARY KEY AUTOINCREMENT",
            IdMode::SuppliedInteger => "id INTEGER PRIMARY KEY",
            IdMode::SuppliedText => "id TEXT PRIMARY KEY",
        }
    }

    pub fn storage(self) -> StorageClass {
        match self {
            IdMode::SuppliedText => StorageClass::Text,
            _ => StorageClass::Integer,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ColumnPlan {
    pub name: String,
    pub storage: StorageClass,
}

#[derive(Debug, Clone)]
pub struct TablePlan {
    pub name: String,
    pub id_mode: IdMode,
    /// Columns beyond `id`, in first-observed order.
    pub columns: Vec<ColumnPlan>,
    pub sample_rows: Vec<Map<String, Value>>,
    pub entity_count: usize,
}

#[derive(Debug, Clone)]
pub struct JunctionPlan {
    pub name: String,
    pub left: String,
    pub right: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackKind {
    Scalar,
    Array,
    RootObject,
}

#[derive(Debug, Clone, Default)]
pub struct SchemaPlan {
    pub tables: BTreeMap<String, TablePlan>,
    pub junctions: BTreeMap<String, JunctionPlan>,
    pub fallback: Option<FallbackKind>,
}

/// Canonical junction identity for a pair of types: alphabetical order, so
/// the (A,B) and (B,A) paths land on one table.
pub fn junction_name(a: &str, b: &str) -> JunctionPlan {
    let (left, right) = if a <= b { (a, b) } else { (b, a) };
    JunctionPlan {
        name: format!("{left}_{right}"),
        left: left.to_string(),
        right: right.to_string(),
    }
}

#[derive(Default)]
struct TypeAccumulator {
    columns: Vec<(String, ColumnType)>,
    index: HashMap<String, usize>,
    /// Descriptor-declared storage classes, which win over observations.
    declared: HashMap<String, StorageClass>,
    samples: Vec<Map<String, Value>>,
    entity_count: usize,
    supplied_ids: usize,
    non_integer_id: bool,
}

impl TypeAccumulator {
    fn observe(&mut self, column: &str, value: &Value) {
        let idx = match self.index.get(column) {
            Some(&idx) => idx,
            None => {
                self.index.insert(column.to_string(), self.columns.len());
                self.columns.push((column.to_string(), ColumnType::default()));
                self.columns.len() - 1
            }
        };
        self.columns[idx].1.observe(value);
    }

    fn id_mode(&self) -> IdMode {
        if self.supplied_ids == 0 {
            IdMode::Autoincrement
        } else if self.non_integer_id {
            IdMode::SuppliedText
        } else if self.supplied_ids == self.entity_count {
            IdMode::SuppliedInteger
        } else {
            IdMode::Autoincrement
        }
    }
}

struct Inference<'g> {
    graph: Option<&'g TypeGraph>,
    buckets: BTreeMap<String, TypeAccumulator>,
    relations: BTreeSet<(String, String)>,
    synth: SynthNamer,
}

impl Inference<'_> {
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
                    self.record_entity(map, &type_name, segment);
                } else {
                    for (field, child) in map {
                        self.walk(child, Some(field), segment);
                    }
                }
            }
            _ => {}
        }
    }

    fn record_entity(&mut self, map: &Map<String, Value>, type_name: &str, segment: Option<&str>) {
        let cells = materialise_row(map, self.graph, type_name);

        let acc = self.buckets.entry(type_name.to_string()).or_default();
        acc.entity_count += 1;
        if let Some(id) = supplied_id(map) {
            acc.supplied_ids += 1;
            if !matches!(id, Value::Number(n) if n.is_i64() || n.is_u64()) {
                acc.non_integer_id = true;
            }
        }
        for cell in &cells {
            if cell.column == "id" {
                continue;
            }
            acc.observe(&cell.column, &cell.value);
            if let Some(declared) = self
                .graph
                .and_then(|g| g.declared_storage(type_name, &cell.field))
            {
                acc.declared.insert(cell.column.clone(), declared);
            }
        }
        if acc.samples.len() < 3 {
            acc.samples.push(cells_to_map(&cells));
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
                    self.record_entity(nested, &child_type, Some(field));
                }
                FieldShape::EntityArray(elements) => {
                    // first-wins: the array's type comes from its first
                    // entity-shaped element
                    let child_type =
                        entity_type_name(elements[0], Some(field), segment, &mut self.synth);
                    if child_type != type_name {
                        self.relations
                            .insert((type_name.to_string(), child_type.clone()));
                    }
                    for element in elements {
                        self.record_entity(element, &child_type, Some(field));
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

    fn into_plan(self) -> SchemaPlan {
        let mut plan = SchemaPlan::default();

        for (name, acc) in self.buckets {
            let columns = acc
                .columns
                .iter()
                .map(|(column, ty)| ColumnPlan {
                    name: column.clone(),
                    storage: acc
                        .declared
                        .get(column)
                        .copied()
                        .unwrap_or_else(|| ty.resolve()),
                })
                .collect();
            plan.tables.insert(
                name.clone(),
                TablePlan {
                    name,
                    id_mode: acc.id_mode(),
                    columns,
                    sample_rows: acc.samples,
                    entity_count: acc.entity_count,
                },
            );
        }

        for (parent, child) in self.relations {
            let junction = junction_name(&parent, &child);
            plan.junctions.insert(junction.name.clone(), junction);
        }

        plan
    }
}

pub fn infer_schema(payload: &Value, graph: Option<&TypeGraph>) -> SchemaPlan {
    let mut inference = Inference {
        graph,
        buckets: BTreeMap::new(),
        relations: BTreeSet::new(),
        synth: SynthNamer::default(),
    };
    inference.walk(payload, None, None);

    // Declared one-to-many relationships between discovered types seed
    // their junction even when this page of results carried no pairs.
    if let Some(graph) = graph {
        for relationship in &graph.relationships {
            if relationship.cardinality != Cardinality::OneToMany {
                continue;
            }
            let from = normalise_table(&relationship.from_type);
            let to = normalise_table(&relationship.to_type);
            if from != to
                && inference.buckets.contains_key(&from)
                && inference.buckets.contains_key(&to)
            {
                inference.relations.insert((from, to));
            }
        }
    }

    if inference.buckets.is_empty() {
        return fallback_plan(payload, graph);
    }
    inference.into_plan()
}

fn fallback_plan(payload: &Value, graph: Option<&TypeGraph>) -> SchemaPlan {
    let mut plan = SchemaPlan::default();

    match payload {
        Value::Array(items) => {
            let mut column = ColumnType::default();
            let mut samples = Vec::new();
            for item in items {
                if is_scalar(item) {
                    column.observe(item);
                } else {
                    column.observe_class(StorageClass::Text);
                }
                if samples.len() < 3 {
                    let mut row = Map::new();
                    row.insert("value".to_string(), sample_value(item));
                    samples.push(row);
                }
            }
            plan.tables.insert(
                "array_data".to_string(),
                TablePlan {
                    name: "array_data".to_string(),
                    id_mode: IdMode::Autoincrement,
                    columns: vec![ColumnPlan {
                        name: "value".to_string(),
                        storage: column.resolve(),
                    }],
                    sample_rows: samples,
                    entity_count: items.len(),
                },
            );
            plan.fallback = Some(FallbackKind::Array);
        }
        Value::Object(map) => {
            let cells = materialise_row(map, graph, "root_object");
            let mut acc = TypeAccumulator::default();
            for cell in &cells {
                acc.observe(&cell.column, &cell.value);
            }
            plan.tables.insert(
                "root_object".to_string(),
                TablePlan {
                    name: "root_object".to_string(),
                    id_mode: IdMode::Autoincrement,
                    columns: acc
                        .columns
                        .iter()
                        .map(|(column, ty)| ColumnPlan {
                            name: column.clone(),
                            storage: ty.resolve(),
                        })
                        .collect(),
                    sample_rows: vec![cells_to_map(&cells)],
                    entity_count: 1,
                },
            );
            plan.fallback = Some(FallbackKind::RootObject);
        }
        scalar => {
            let mut column = ColumnType::default();
            column.observe(scalar);
            let mut row = Map::new();
            row.insert("value".to_string(), scalar.clone());
            plan.tables.insert(
                "scalar_data".to_string(),
                TablePlan {
                    name: "scalar_data".to_string(),
                    id_mode: IdMode::Autoincrement,
                    columns: vec![ColumnPlan {
                        name: "value".to_string(),
                        storage: column.resolve(),
                    }],
                    sample_rows: vec![row],
                    entity_count: 1,
                },
            );
            plan.fallback = Some(FallbackKind::Scalar);
        }
    }

    plan
}

pub fn sample_value(item: &Value) -> Value {
    if is_scalar(item) {
        item.clone()
    } else {
        Value::String(item.to_string())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use crate::descriptor::TypeGraph;
    use crate::storage_class::StorageClass;

    use super::{infer_schema, FallbackKind, IdMode};

    fn storage_of(plan: &super::SchemaPlan, table: &str, column: &str) -> StorageClass {
        plan.tables[table]
            .columns
            .iter()
            .find(|c| c.name == column)
            .unwrap_or_else(|| panic!("no column {column} on {table}"))
            .storage
    }

    #[test]
    fn single_entity_becomes_one_table() {
        let payload = json!({
            "target": {
                "id": "ENSG00000169083",
                "approvedSymbol": "AR",
                "biotype": "protein_coding"
            }
        });
        let plan = infer_schema(&payload, None);

        assert_eq!(plan.tables.len(), 1);
        let target = &plan.tables["target"];
        assert_eq!(target.id_mode, IdMode::SuppliedText);
        assert_eq!(storage_of(&plan, "target", "approved_symbol"), StorageClass::Text);
        assert_eq!(storage_of(&plan, "target", "biotype"), StorageClass::Text);
        assert_eq!(target.sample_rows.len(), 1);
        assert_eq!(target.sample_rows[0]["approved_symbol"], json!("AR"));
    }

    #[test]
    fn association_rows_produce_junction_and_carrier_columns() {
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

        assert!(plan.tables.contains_key("target"));
        assert!(plan.tables.contains_key("disease"));
        assert!(plan.junctions.contains_key("disease_target"));

        let junction = &plan.junctions["disease_target"];
        assert_eq!(junction.left, "disease");
        assert_eq!(junction.right, "target");

        // carrier rows keep score and the nested disease foreign key
        assert_eq!(storage_of(&plan, "disease", "score"), StorageClass::Real);
        assert!(plan.tables["disease"].columns.iter().any(|c| c.name == "disease_id"));
        // four disease rows observed: two carriers plus two nested entities
        assert_eq!(plan.tables["disease"].entity_count, 4);
    }

    #[test]
    fn edges_node_wrappers_are_transparent() {
        let payload = json!({
            "target": {
                "id": "T1",
                "symbol": "AR",
                "interactions": {
                    "edges": [
                        { "node": { "id": "T2", "symbol": "ESR1" } },
                        { "node": { "id": "T3", "symbol": "PGR" } }
                    ]
                }
            }
        });
        let plan = infer_schema(&payload, None);

        // elements type from the parent segment, singularised
        assert!(plan.tables.contains_key("interaction"));
        assert!(plan.junctions.contains_key("interaction_target"));
    }

    #[test]
    fn conflicting_observations_widen_to_text() {
        let payload = json!({ "xs": [ {"v": 1}, {"v": 1.5}, {"v": "a"} ] });
        let plan = infer_schema(&payload, None);

        assert!(plan.tables.contains_key("x"));
        assert_eq!(storage_of(&plan, "x", "v"), StorageClass::Text);
    }

    #[test]
    fn one_level_of_non_entity_maps_flattens() {
        let payload = json!({
            "target": {
                "id": "T1",
                "genomicLocation": {
                    "chromosome": "X",
                    "start": 67544021,
                    "assembly": { "name": "GRCh38", "patch": 14 }
                }
            }
        });
        let plan = infer_schema(&payload, None);
        let columns: Vec<&str> = plan.tables["target"]
            .columns
            .iter()
            .map(|c| c.name.as_str())
            .collect();

        assert!(columns.contains(&"genomic_location_chromosome"));
        assert!(columns.contains(&"genomic_location_start"));
        // deeper structure is not flattened
        assert!(!columns.iter().any(|c| c.starts_with("genomic_location_assembly")));
    }

    #[test]
    fn complex_fields_become_json_columns() {
        let payload = json!({
            "target": { "id": "T1", "synonymScores": [1, 2, 3] }
        });
        let plan = infer_schema(&payload, None);

        assert_eq!(
            storage_of(&plan, "target", "synonym_scores_json"),
            StorageClass::Text
        );
    }

    #[test]
    fn self_relations_are_suppressed() {
        let payload = json!({
            "disease": {
                "id": "D1",
                "name": "a",
                "children": [ { "efoId": "D2", "name": "b" } ]
            }
        });
        let plan = infer_schema(&payload, None);
        assert!(plan.junctions.is_empty());
    }

    #[test]
    fn declared_types_override_observations() {
        let graph = TypeGraph::parse(
            "
            scalar Long

            type Measurement {
              id: String!
              value: Float
              reading: Long
            }
            ",
        );
        let payload = json!({
            "measurements": [
                { "id": "M1", "value": 1, "reading": 2 },
                { "id": "M2", "value": 3, "reading": 4 }
            ]
        });
        let plan = infer_schema(&payload, Some(&graph));

        // integer observations, but the descriptor declares Float
        assert_eq!(storage_of(&plan, "measurement", "value"), StorageClass::Real);
        // unknown declared scalar degrades to TEXT
        assert_eq!(storage_of(&plan, "measurement", "reading"), StorageClass::Text);
    }

    #[test]
    fn extraction_paths_rename_payload_fields() {
        let graph = TypeGraph::parse(
            "
            type Target {
              id: String!
              approvedSymbol(path: \"symbol\"): String
            }
            ",
        );
        let payload = json!({ "target": { "id": "T1", "symbol": "AR" } });
        let plan = infer_schema(&payload, Some(&graph));

        let columns: Vec<&str> = plan.tables["target"]
            .columns
            .iter()
            .map(|c| c.name.as_str())
            .collect();
        assert!(columns.contains(&"approved_symbol"));
        assert!(!columns.contains(&"symbol"));
        assert_eq!(
            plan.tables["target"].sample_rows[0]["approved_symbol"],
            json!("AR")
        );
    }

    #[test]
    fn declared_relationships_seed_junctions_between_discovered_types() {
        let graph = TypeGraph::parse(
            "
            type Target {
              id: String!
              diseases: [Disease!]
            }

            type Disease {
              id: String!
              name: String
            }
            ",
        );
        // both types present, but no array link in this page of results
        let payload = json!({
            "target": { "id": "T1", "approvedSymbol": "AR" },
            "disease": { "id": "D1", "name": "a" }
        });
        let plan = infer_schema(&payload, Some(&graph));

        assert!(plan.junctions.contains_key("disease_target"));

        // without the descriptor, no junction is planned
        let bare = infer_schema(&payload, None);
        assert!(bare.junctions.is_empty());
    }

    #[test]
    fn scalar_payload_falls_back_to_scalar_data() {
        let plan = infer_schema(&json!(null), None);
        assert_eq!(plan.fallback, Some(FallbackKind::Scalar));
        assert!(plan.tables.contains_key("scalar_data"));
    }

    #[test]
    fn scalar_array_falls_back_to_array_data_widened() {
        let plan = infer_schema(&json!([1, 2, "x"]), None);
        assert_eq!(plan.fallback, Some(FallbackKind::Array));
        assert_eq!(storage_of(&plan, "array_data", "value"), StorageClass::Text);
        assert_eq!(plan.tables["array_data"].entity_count, 3);
    }

    #[test]
    fn empty_object_falls_back_to_root_object() {
        let plan = infer_schema(&json!({}), None);
        assert_eq!(plan.fallback, Some(FallbackKind::RootObject));
        assert!(plan.tables["root_object"].columns.is_empty());
    }

    #[test]
    fn same_payload_infers_identical_plans() {
        let payload = json!({
            "target": {
                "id": "T1",
                "approvedSymbol": "AR",
                "associatedDiseases": {
                    "rows": [ { "disease": { "id": "D1", "name": "a" }, "score": 0.9 } ]
                }
            }
        });
        let a = infer_schema(&payload, None);
        let b = infer_schema(&payload, None);

        let names = |plan: &super::SchemaPlan| -> Vec<String> {
            plan.tables
                .values()
                .flat_map(|t| {
                    std::iter::once(t.name.clone())
                        .chain(t.columns.iter().map(|c| format!("{}.{}", t.name, c.name)))
                })
                .chain(plan.junctions.keys().cloned())
                .collect()
        };
        assert_eq!(names(&a), names(&b));
    }
}
