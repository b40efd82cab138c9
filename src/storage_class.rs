use std::collections::HashSet;

use serde_json::Value;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StorageClass {
    Integer,
    Real,
    Text,
    Blob,
    Numeric,
}

impl StorageClass {
    pub fn as_sql(self) -> &'static str {
        match self {
            StorageClass::Integer => "INTEGER",
            StorageClass::Real => "REAL",
            StorageClass::Text => "TEXT",
            StorageClass::Blob => "BLOB",
            StorageClass::Numeric => "NUMERIC",
        }
    }

    pub fn from_declared(declared: &str) -> StorageClass {
        match declared.trim().to_ascii_uppercase().as_str() {
            "INTEGER" | "INT" | "BIGINT" | "SMALLINT" | "TINYINT" | "BOOLEAN" | "BOOL" => {
                StorageClass::Integer
            }
            "REAL" | "FLOAT" | "DOUBLE" => StorageClass::Real,
            "TEXT" | "VARCHAR" | "CHAR" | "STRING" | "ID" | "DATE" | "DATETIME" | "TIMESTAMP" => {
                StorageClass::Text
            }
            "BLOB" => StorageClass::Blob,
            "DECIMAL" | "NUMERIC" => StorageClass::Numeric,
            other => {
                warn!(declared = other, "Unrecognised storage class, defaulting to TEXT");
                StorageClass::Text
            }
        }
    }

    pub fn observe(value: &Value) -> StorageClass {
        match value {
            Value::Null => StorageClass::Text,
            Value::Bool(_) => StorageClass::Integer,
            Value::Number(n) => {
                if n.is_i64() || n.is_u64() {
                    StorageClass::Integer
                } else {
                    StorageClass::Real
                }
            }
            Value::String(_) => StorageClass::Text,
            Value::Array(_) | Value::Object(_) => StorageClass::Text,
        }
    }
}

/// Accumulates per-column observations and widens to one storage class.
#[derive(Debug, Clone, Default)]
pub struct ColumnType {
    observed: HashSet<StorageClass>,
    saw_non_null: bool,
}

impl ColumnType {
    pub fn observe(&mut self, value: &Value) {
        if !value.is_null() {
            self.saw_non_null = true;
            self.observed.insert(StorageClass::observe(value));
        }
    }

    pub fn observe_class(&mut self, class: StorageClass) {
        self.saw_non_null = true;
        self.observed.insert(class);
    }

    pub fn resolve(&self) -> StorageClass {
        if !self.saw_non_null || self.observed.contains(&StorageClass::Text) {
            StorageClass::Text
        } else if self.observed.contains(&StorageClass::Real) {
            StorageClass::Real
        } else if self.observed.contains(&StorageClass::Integer) {
            StorageClass::Integer
        } else if self.observed.contains(&StorageClass::Numeric) {
            StorageClass::Numeric
        } else {
            StorageClass::Text
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{ColumnType, StorageClass};

    #[test]
    fn observations_map_to_storage_classes() {
        assert_eq!(StorageClass::observe(&json!(null)), StorageClass::Text);
        assert_eq!(StorageClass::observe(&json!(true)), StorageClass::Integer);
        assert_eq!(StorageClass::observe(&json!(3)), StorageClass::Integer);
        assert_eq!(StorageClass::observe(&json!(0.5)), StorageClass::Real);
        assert_eq!(StorageClass::observe(&json!("x")), StorageClass::Text);
    }

    #[test]
    fn widening_prefers_text_then_real() {
        let mut col = ColumnType::default();
        col.observe(&json!(1));
        assert_eq!(col.resolve(), StorageClass::Integer);
        col.observe(&json!(1.5));
        assert_eq!(col.resolve(), StorageClass::Real);
        col.observe(&json!("a"));
        assert_eq!(col.resolve(), StorageClass::Text);
    }

    #[test]
    fn null_only_columns_stay_text() {
        let mut col = ColumnType::default();
        col.observe(&json!(null));
        assert_eq!(col.resolve(), StorageClass::Text);
    }

    #[test]
    fn declared_aliases_pass_through() {
        assert_eq!(StorageClass::from_declared("varchar"), StorageClass::Text);
        assert_eq!(StorageClass::from_declared("BIGINT"), StorageClass::Integer);
        assert_eq!(StorageClass::from_declared("boolean"), StorageClass::Integer);
        assert_eq!(StorageClass::from_declared("double"), StorageClass::Real);
        assert_eq!(StorageClass::from_declared("decimal"), StorageClass::Numeric);
        assert_eq!(StorageClass::from_declared("timestamp"), StorageClass::Text);
        assert_eq!(StorageClass::from_declared("geometry"), StorageClass::Text);
    }
}
