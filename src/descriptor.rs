use std::collections::{BTreeMap, HashMap, HashSet};

use once_cell::sync::Lazy;
use serde::Serialize;
use tracing::debug;

use crate::chunk_store::{ChunkPriority, FieldChunkRule, CHUNK_THRESHOLD, COMPRESS_MIN};
use crate::identifiers::{is_identifier_key, normalise_column, normalise_table};
use crate::storage_class::StorageClass;

const BUILTIN_SCALARS: [&str; 5] = ["String", "Int", "Float", "Boolean", "ID"];

// Free-text fields chunk aggressively: anything past the compression floor
// is already large for a result cell.
static PROSE_FIELDS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "description",
        "summary",
        "abstract",
        "text",
        "content",
        "sentences",
        "literatureOcurrences",
    ]
    .into_iter()
    .collect()
});

#[derive(Debug, Clone, Serialize)]
pub struct FieldDescriptor {
    pub base_type: String,
    pub is_list: bool,
    pub is_nullable: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Cardinality {
    OneToOne,
    OneToMany,
}

#[derive(Debug, Clone, Serialize)]
pub struct RelationshipDescriptor {
    pub from_type: String,
    pub to_type: String,
    pub field_name: String,
    pub cardinality: Cardinality,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExtractionRule {
    pub type_name: String,
    pub field_name: String,
    pub source_path: String,
}

#[derive(Debug, Default)]
pub struct TypeGraph {
    pub types: BTreeMap<String, BTreeMap<String, FieldDescriptor>>,
    pub relationships: Vec<RelationshipDescriptor>,
    pub extraction_rules: Vec<ExtractionRule>,
    chunk_rules: HashMap<String, FieldChunkRule>,
    scalars: HashSet<String>,
}

impl TypeGraph {
    /// Parses a type-graph description. The parser is total: unreadable
    /// lines are skipped, and an empty graph degrades the engine to pure
    /// structural inference.
    pub fn parse(text: &str) -> TypeGraph {
        let mut graph = TypeGraph::default();
        let mut scalars: HashSet<String> = BUILTIN_SCALARS.iter().map(|s| s.to_string()).collect();
        let mut current: Option<String> = None;
        let mut skipping_block = false;

        for raw_line in text.lines() {
            let line = strip_comment(raw_line).trim().to_string();
            if line.is_empty() {
                continue;
            }

            if skipping_block {
                if line.ends_with('}') {
                    skipping_block = false;
                }
                continue;
            }

            if let Some(rest) = line.strip_prefix("scalar ") {
                scalars.insert(rest.trim().trim_end_matches('{').trim().to_string());
                continue;
            }

            if line.starts_with("enum ")
                || line.starts_with("input ")
                || line.starts_with("interface ")
                || line.starts_with("union ")
            {
                skipping_block = line.contains('{') && !line.ends_with('}');
                continue;
            }

            if let Some(rest) = line.strip_prefix("type ") {
                let name = rest
                    .split(|c: char| c.is_whitespace() || c == '{')
                    .next()
                    .unwrap_or("")
                    .to_string();

                if is_wrapper_type(&name) {
                    skipping_block = !line.ends_with('}');
                    current = None;
                    debug!(type_name = %name, "Skipping wrapper type in descriptor");
                } else {
                    current = Some(name.clone());
                    graph.types.entry(name).or_default();
                }
                continue;
            }

            if line.starts_with('}') {
                current = None;
                continue;
            }

            let Some(type_name) = current.clone() else {
                continue;
            };
            let Some((field_name, args, type_expr)) = parse_field_line(&line) else {
                continue;
            };

            let descriptor = parse_type_expr(&type_expr);
            let source_path = args
                .as_deref()
                .and_then(extract_path_argument)
                .unwrap_or_else(|| field_name.clone());

            graph.extraction_rules.push(ExtractionRule {
                type_name: type_name.clone(),
                field_name: field_name.clone(),
                source_path,
            });

            if let Some(rule) = derive_chunk_rule(&field_name, &descriptor, &scalars) {
                graph.chunk_rules.insert(field_name.clone(), rule);
            }

            graph
                .types
                .entry(type_name)
                .or_default()
                .insert(field_name, descriptor);
        }

        graph.scalars = scalars;
        graph.resolve_relationships();
        graph
    }

    fn resolve_relationships(&mut self) {
        let known: HashSet<&String> = self.types.keys().collect();
        for (type_name, fields) in &self.types {
            for (field_name, descriptor) in fields {
                if self.scalars.contains(&descriptor.base_type)
                    || !known.contains(&descriptor.base_type)
                {
                    continue;
                }
                if descriptor.base_type == *type_name {
                    continue;
                }
                self.relationships.push(RelationshipDescriptor {
                    from_type: type_name.clone(),
                    to_type: descriptor.base_type.clone(),
                    field_name: field_name.clone(),
                    cardinality: if descriptor.is_list {
                        Cardinality::OneToMany
                    } else {
                        Cardinality::OneToOne
                    },
                });
            }
        }
    }

    /// Per-field chunking override. Identifier-carrying fields are pinned
    /// to `never` no matter what the descriptor says.
    pub fn chunk_rule(&self, field: &str) -> Option<FieldChunkRule> {
        if is_identifier_key(field) {
            return Some(FieldChunkRule {
                priority: ChunkPriority::Never,
                threshold: 0,
            });
        }
        self.chunk_rules.get(field).cloned()
    }

    /// Normalised column name a payload field should land under, when an
    /// extraction rule renames it (`declaredField(path: "payloadField")`).
    /// `table` is the normalised table name of the owning type.
    pub fn remapped_column(&self, table: &str, payload_field: &str) -> Option<String> {
        self.extraction_rules.iter().find_map(|rule| {
            (rule.source_path == payload_field
                && rule.field_name != rule.source_path
                && normalise_table(&rule.type_name) == table)
                .then(|| normalise_column(&rule.field_name))
        })
    }

    /// Declared storage class for a scalar field of the type backing
    /// `table`. List fields and object-valued fields carry no declared
    /// storage; unknown scalars degrade inside `from_declared`.
    pub fn declared_storage(&self, table: &str, payload_field: &str) -> Option<StorageClass> {
        let (type_name, fields) = self
            .types
            .iter()
            .find(|(name, _)| normalise_table(name) == table)?;

        let descriptor = fields.get(payload_field).or_else(|| {
            self.extraction_rules
                .iter()
                .find(|rule| rule.type_name == *type_name && rule.source_path == payload_field)
                .and_then(|rule| fields.get(&rule.field_name))
        })?;

        if descriptor.is_list || !self.scalars.contains(&descriptor.base_type) {
            return None;
        }
        Some(StorageClass::from_declared(&descriptor.base_type))
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}

fn is_wrapper_type(name: &str) -> bool {
    name.starts_with("__")
        || name.ends_with("Connection")
        || name.ends_with("Edge")
        || name.ends_with("Payload")
        || name == "PageInfo"
        || name == "Query"
        || name == "Mutation"
}

fn strip_comment(line: &str) -> &str {
    match line.find('#') {
        Some(pos) => &line[..pos],
        None => line,
    }
}

fn parse_field_line(line: &str) -> Option<(String, Option<String>, String)> {
    let line = line.trim().trim_end_matches(',');

    let name_end = line.find(|c| c == '(' || c == ':')?;
    let name = line[..name_end].trim();
    if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return None;
    }

    let rest = &line[name_end..];
    let (args, rest) = if let Some(inner) = rest.strip_prefix('(') {
        let close = matching_paren(inner)?;
        (Some(inner[..close].to_string()), inner[close + 1..].trim())
    } else {
        (None, rest)
    };

    let type_expr = rest.strip_prefix(':')?.trim();
    if type_expr.is_empty() {
        return None;
    }

    Some((name.to_string(), args, type_expr.to_string()))
}

fn matching_paren(after_open: &str) -> Option<usize> {
    let mut depth = 1usize;
    for (idx, c) in after_open.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth == 0 {
                    return Some(idx);
                }
            }
            _ => {}
        }
    }
    None
}

fn parse_type_expr(expr: &str) -> FieldDescriptor {
    let trimmed = expr.trim();
    let is_nullable = !trimmed.ends_with('!');
    let trimmed = trimmed.trim_end_matches('!');

    if let Some(inner) = trimmed.strip_prefix('[') {
        let inner = inner.trim_end_matches(']').trim_end_matches('!');
        FieldDescriptor {
            base_type: inner.trim().to_string(),
            is_list: true,
            is_nullable,
        }
    } else {
        FieldDescriptor {
            base_type: trimmed.to_string(),
            is_list: false,
            is_nullable,
        }
    }
}

fn extract_path_argument(args: &str) -> Option<String> {
    for part in args.split(',') {
        let mut halves = part.splitn(2, ':');
        let key = halves.next()?.trim();
        if key != "path" {
            continue;
        }
        let value = halves.next()?.trim().trim_matches('"');
        if !value.is_empty() {
            return Some(value.to_string());
        }
    }
    None
}

fn derive_chunk_rule(
    field_name: &str,
    descriptor: &FieldDescriptor,
    scalars: &HashSet<String>,
) -> Option<FieldChunkRule> {
    if is_identifier_key(field_name) {
        return Some(FieldChunkRule {
            priority: ChunkPriority::Never,
            threshold: 0,
        });
    }

    if PROSE_FIELDS.contains(field_name) && descriptor.base_type == "String" {
        return Some(FieldChunkRule {
            priority: ChunkPriority::Always,
            threshold: COMPRESS_MIN,
        });
    }

    if descriptor.is_list && scalars.contains(&descriptor.base_type) {
        return Some(FieldChunkRule {
            priority: ChunkPriority::SizeBased,
            threshold: CHUNK_THRESHOLD,
        });
    }

    None
}
