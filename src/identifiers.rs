use std::collections::{HashMap, HashSet};

use once_cell::sync::Lazy;

pub static RESERVED_WORDS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "table",
        "index",
        "view",
        "column",
        "primary",
        "key",
        "foreign",
        "constraint",
        "order",
        "group",
        "select",
        "from",
        "where",
        "insert",
        "update",
        "delete",
        "create",
        "drop",
        "alter",
        "join",
        "inner",
        "outer",
        "left",
        "right",
        "union",
        "all",
        "distinct",
        "having",
        "limit",
        "offset",
        "as",
        "on",
        "by",
        "set",
        "into",
        "values",
        "exists",
    ]
    .into_iter()
    .collect()
});

// Compound/identifier aliases collapse to one canonical column name so the
// same identifier fetched under different spellings lands in one column.
static COLUMN_SYNONYMS: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    [
        ("chembl", "chembl_id"),
        ("chembl_compound_id", "chembl_id"),
        ("ensembl", "ensembl_id"),
        ("ensembl_gene_id", "ensembl_id"),
        ("efo", "efo_id"),
        ("rsid", "rs_id"),
    ]
    .into_iter()
    .collect()
});

// Association wrappers name the canonical entity they point at, so the
// carrier rows land in that entity's table instead of a parallel one.
static TABLE_SYNONYMS: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    [
        ("associated_disease", "disease"),
        ("associated_target", "target"),
        ("known_drug", "drug"),
        ("interacting_target", "target"),
    ]
    .into_iter()
    .collect()
});

// Domain identifier keys, as they appear in raw payloads, mapped to the
// canonical entity type they identify. A generic "id" identifies whatever
// entity carries it and maps to no type of its own. Order is priority
// order when a node carries more than one.
pub const ID_KEYS: &[(&str, &str)] = &[
    ("ensemblId", "target"),
    ("efoId", "disease"),
    ("chemblId", "drug"),
    ("rsId", "variant"),
    ("studyId", "study"),
    ("pmid", "publication"),
];

pub fn id_key_type(field: &str) -> Option<&'static str> {
    ID_KEYS.iter().find(|(key, _)| *key == field).map(|(_, ty)| *ty)
}

pub fn is_identifier_key(field: &str) -> bool {
    field == "id" || id_key_type(field).is_some()
}

pub fn camel_to_snake(input: &str) -> String {
    let chars: Vec<char> = input.chars().collect();
    let mut out = String::with_capacity(input.len() + 4);

    for (i, &c) in chars.iter().enumerate() {
        if c.is_ascii_uppercase() {
            let prev_breaks = i > 0
                && (chars[i - 1].is_ascii_lowercase()
                    || chars[i - 1].is_ascii_digit()
                    || (chars[i - 1].is_ascii_uppercase()
                        && chars.get(i + 1).map(char::is_ascii_lowercase).unwrap_or(false)));
            if prev_breaks {
                out.push('_');
            }
            out.push(c.to_ascii_lowercase());
        } else {
            out.push(c);
        }
    }

    out
}

fn sanitise(raw: &str, split_camel: bool) -> String {
    let lowered = if split_camel {
        camel_to_snake(raw)
    } else {
        raw.to_ascii_lowercase()
    };

    let mut out = String::with_capacity(lowered.len());
    let mut last_was_underscore = false;
    for c in lowered.chars() {
        let mapped = if c.is_ascii_lowercase() || c.is_ascii_digit() {
            c
        } else {
            '_'
        };
        if mapped == '_' {
            if !last_was_underscore {
                out.push('_');
            }
            last_was_underscore = true;
        } else {
            out.push(mapped);
            last_was_underscore = false;
        }
    }

    out.trim_matches('_').to_string()
}

pub fn normalise_table(name: &str) -> String {
    let mut result = sanitise(name, true);

    if let Some(canonical) = TABLE_SYNONYMS.get(result.as_str()) {
        result = (*canonical).to_string();
    }

    if result.is_empty() || result.starts_with(|c: char| c.is_ascii_digit()) {
        result = format!("table_{result}");
    }

    if RESERVED_WORDS.contains(result.as_str()) {
        result.push_str("_tbl");
    }

    result
}

/// Singular form of a path segment, used when a segment names the entities
/// it contains (`diseases` -> `disease`, `therapies` -> `therapy`).
pub fn singularise(segment: &str) -> String {
    if let Some(stem) = segment.strip_suffix("ies") {
        format!("{stem}y")
    } else if segment.ends_with("ss") {
        segment.to_string()
    } else if let Some(stem) = segment.strip_suffix('s') {
        stem.to_string()
    } else {
        segment.to_string()
    }
}

pub fn normalise_column(name: &str) -> String {
    let mut result = sanitise(name, true);

    if let Some(canonical) = COLUMN_SYNONYMS.get(result.as_str()) {
        result = (*canonical).to_string();
    }

    if result.is_empty() || result.starts_with(|c: char| c.is_ascii_digit()) {
        result = format!("col_{result}");
    }

    if RESERVED_WORDS.contains(result.as_str()) {
        result.push_str("_col");
    }

    result
}

#[cfg(test)]
mod tests {
    use super::{camel_to_snake, normalise_column, normalise_table};

    #[test]
    fn camel_case_splits() {
        assert_eq!(camel_to_snake("approvedSymbol"), "approved_symbol");
        assert_eq!(camel_to_snake("hasNextPage"), "has_next_page");
        assert_eq!(camel_to_snake("EFOTerm"), "efo_term");
        assert_eq!(camel_to_snake("already_snake"), "already_snake");
    }

    #[test]
    fn tables_are_lowercased_and_cleaned() {
        assert_eq!(normalise_table("Associated Diseases!"), "associated_diseases");
        assert_eq!(normalise_table("123targets"), "table_123targets");
        assert_eq!(normalise_table(""), "table_");
        assert_eq!(normalise_table("select"), "select_tbl");
    }

    #[test]
    fn columns_split_camel_and_dodge_reserved_words() {
        assert_eq!(normalise_column("approvedSymbol"), "approved_symbol");
        assert_eq!(normalise_column("order"), "order_col");
        assert_eq!(normalise_column("2fold"), "col_2fold");
        assert_eq!(normalise_column("score--%"), "score");
    }

    #[test]
    fn synonyms_collapse_to_canonical_forms() {
        assert_eq!(normalise_column("chembl"), "chembl_id");
        assert_eq!(normalise_column("chemblId"), "chembl_id");
        assert_eq!(normalise_column("ensemblGeneId"), "ensembl_id");
        assert_eq!(normalise_table("associatedDisease"), "disease");
        assert_eq!(normalise_table("knownDrug"), "drug");
    }

    #[test]
    fn path_segments_singularise() {
        use super::singularise;
        assert_eq!(singularise("diseases"), "disease");
        assert_eq!(singularise("therapies"), "therapy");
        assert_eq!(singularise("class"), "class");
        assert_eq!(singularise("target"), "target");
    }

    #[test]
    fn normalisation_is_idempotent() {
        for raw in ["approvedSymbol", "order", "2fold", "chembl", "Weird Name#"] {
            let once = normalise_column(raw);
            assert_eq!(normalise_column(&once), once);
            let once = normalise_table(raw);
            assert_eq!(normalise_table(&once), once);
        }
    }
}
