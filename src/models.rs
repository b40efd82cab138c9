use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageRequest {
    pub payload: Value,
    /// Optional type-graph description refining per-field chunking and
    /// extraction behaviour.
    #[serde(default)]
    pub schema_descriptor: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueryRequest {
    pub sql: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct TableSummary {
    pub columns: BTreeMap<String, String>,
    pub row_count: i64,
    pub sample_data: Vec<Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StageResponse {
    pub success: bool,
    pub message: String,
    pub schemas: BTreeMap<String, TableSummary>,
    pub table_count: usize,
    pub total_rows: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pagination: Option<PaginationInfo>,
}

impl StageResponse {
    pub fn failure(message: impl Into<String>) -> StageResponse {
        StageResponse {
            success: false,
            message: message.into(),
            schemas: BTreeMap::new(),
            table_count: 0,
            total_rows: 0,
            pagination: None,
        }
    }
}

// Page-info keys are lifted verbatim from the upstream graph response, so
// this struct keeps the upstream camelCase spelling on the wire.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PaginationInfo {
    pub has_next_page: bool,
    pub has_previous_page: bool,
    pub current_count: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_count: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_cursor: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_cursor: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum QueryResponse {
    Success(QuerySuccess),
    Failure(QueryFailure),
}

#[derive(Debug, Clone, Serialize)]
pub struct QuerySuccess {
    pub success: bool,
    pub results: Vec<Map<String, Value>>,
    pub row_count: usize,
    pub column_names: Vec<String>,
    pub query_type: String,
    pub chunked_content_resolved: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueryFailure {
    pub success: bool,
    pub error: String,
    pub query: String,
}

impl QueryResponse {
    pub fn failure(error: impl Into<String>, query: impl Into<String>) -> QueryResponse {
        QueryResponse::Failure(QueryFailure {
            success: false,
            error: error.into(),
            query: query.into(),
        })
    }
}
