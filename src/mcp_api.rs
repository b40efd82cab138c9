use std::time::Instant;

use axum::{
    extract::State,
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;
use uuid::Uuid;

use crate::{auth::extract_bearer_token, rate_limit::RateLimitHeaders, AppState};

pub const MCP_SCHEMA_VERSION: &str = "biograph.staging.mcp.v1";

#[derive(Debug, Deserialize)]
pub struct JsonRpcRequest {
    jsonrpc: String,
    id: Option<Value>,
    method: String,
    params: Option<Value>,
}

#[derive(Debug, Serialize)]
struct JsonRpcSuccess {
    jsonrpc: &'static str,
    id: Value,
    result: Value,
}

#[derive(Debug, Serialize)]
struct JsonRpcFailure {
    jsonrpc: &'static str,
    id: Value,
    error: JsonRpcError,
}

#[derive(Debug, Serialize)]
struct JsonRpcError {
    code: i64,
    message: String,
    data: Value,
}

#[derive(Debug, Deserialize)]
struct ToolCallParams {
    name: String,
    #[serde(default)]
    arguments: Value,
}

#[derive(Debug, Clone)]
struct ToolError {
    code: &'static str,
    message: String,
    retryable: bool,
    http_status: StatusCode,
}

impl ToolError {
    fn invalid_argument(message: impl Into<String>) -> Self {
        Self {
            code: "INVALID_ARGUMENT",
            message: message.into(),
            retryable: false,
            http_status: StatusCode::BAD_REQUEST,
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self {
            code: "NOT_FOUND",
            message: message.into(),
            retryable: false,
            http_status: StatusCode::NOT_FOUND,
        }
    }

    fn truncated(message: impl Into<String>) -> Self {
        Self {
            code: "RESULT_TRUNCATED",
            message: message.into(),
            retryable: true,
            http_status: StatusCode::PAYLOAD_TOO_LARGE,
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            code: "INTERNAL",
            message: message.into(),
            retryable: true,
            http_status: StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn rpc_code(&self) -> i64 {
        match self.code {
            "INVALID_ARGUMENT" => -32602,
            "NOT_FOUND" => -32004,
            "RESULT_TRUNCATED" => -32010,
            "RATE_LIMITED" => -32029,
            _ => -32603,
        }
    }

    fn to_data(&self, trace_id: &str) -> Value {
        json!({
            "code": self.code,
            "retryable": self.retryable,
            "traceId": trace_id,
        })
    }
}

pub async fn mcp(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<JsonRpcRequest>,
) -> impl IntoResponse {
    let request_id = request.id.clone().unwrap_or(Value::Null);

    if request.jsonrpc != "2.0" {
        return jsonrpc_error(
            request_id,
            -32600,
            "jsonrpc must be 2.0",
            json!({"code": "INVALID_ARGUMENT", "retryable": false}),
            StatusCode::BAD_REQUEST,
            None,
        );
    }

    let token = match extract_bearer_token(&headers) {
        Ok(token) => token,
        Err((status, payload)) => return (status, payload).into_response(),
    };
    if token.trim() != state.config.api_key {
        return jsonrpc_error(
            request_id,
            -32001,
            "Invalid API key",
            json!({"code": "UNAUTHORIZED", "retryable": false}),
            StatusCode::UNAUTHORIZED,
            None,
        );
    }

    let rate = state.rate_limiter.check(token.trim()).await;
    if !rate.allowed {
        return jsonrpc_error(
            request_id,
            -32029,
            "Rate limit exceeded",
            json!({"code": "RATE_LIMITED", "retryable": true}),
            StatusCode::TOO_MANY_REQUESTS,
            Some(rate.headers),
        );
    }

    match request.method.as_str() {
        "ping" => jsonrpc_ok(
            request_id,
            json!({ "schemaVersion": MCP_SCHEMA_VERSION, "ok": true }),
            Some(rate.headers.clone()),
        ),
        "initialize" => jsonrpc_ok(
            request_id,
            json!({
                "schemaVersion": MCP_SCHEMA_VERSION,
                "server": {
                    "name": "biograph-staging-api",
                    "version": env!("CARGO_PKG_VERSION"),
                },
                "capabilities": {
                    "tools": true,
                    "streaming": false,
                }
            }),
            Some(rate.headers.clone()),
        ),
        "tools/list" => jsonrpc_ok(
            request_id,
            json!({
                "schemaVersion": MCP_SCHEMA_VERSION,
                "tools": tool_definitions(),
            }),
            Some(rate.headers.clone()),
        ),
        "tools/call" => {
            let params = request
                .params
                .as_ref()
                .and_then(|value| serde_json::from_value::<ToolCallParams>(value.clone()).ok());
            let Some(params) = params else {
                return jsonrpc_error(
                    request_id,
                    -32602,
                    "Invalid tool call parameters",
                    json!({"code": "INVALID_ARGUMENT", "retryable": false}),
                    StatusCode::BAD_REQUEST,
                    Some(rate.headers.clone()),
                );
            };

            let trace_id = Uuid::new_v4().to_string();
            let start = Instant::now();

            match run_tool(&state, &params.name, &params.arguments).await {
                Ok(result) => {
                    let envelope = json!({
                        "schemaVersion": MCP_SCHEMA_VERSION,
                        "traceId": trace_id,
                        "tool": params.name,
                        "result": result,
                        "timingMs": start.elapsed().as_millis() as u64,
                    });

                    let bytes = serde_json::to_vec(&envelope).map(|v| v.len()).unwrap_or(0);
                    if bytes > state.config.response_budget_bytes {
                        let err = ToolError::truncated(format!(
                            "Response size {} bytes exceeds budget {} bytes. Query a narrower slice instead.",
                            bytes, state.config.response_budget_bytes
                        ));
                        jsonrpc_error(
                            request_id,
                            err.rpc_code(),
                            err.message.clone(),
                            err.to_data(&trace_id),
                            err.http_status,
                            Some(rate.headers.clone()),
                        )
                    } else {
                        debug!(
                            trace_id = %trace_id,
                            tool = %params.name,
                            response_bytes = bytes,
                            "MCP tool handled"
                        );
                        jsonrpc_ok(request_id, envelope, Some(rate.headers.clone()))
                    }
                }
                Err(err) => jsonrpc_error(
                    request_id,
                    err.rpc_code(),
                    err.message.clone(),
                    err.to_data(&trace_id),
                    err.http_status,
                    Some(rate.headers.clone()),
                ),
            }
        }
        _ => jsonrpc_error(
            request_id,
            -32601,
            "Method not found",
            json!({"code": "INVALID_ARGUMENT", "retryable": false}),
            StatusCode::NOT_FOUND,
            Some(rate.headers.clone()),
        ),
    }
}

async fn run_tool(state: &AppState, tool: &str, args: &Value) -> Result<Value, ToolError> {
    let access_id = require_str(args, "accessId")?;

    match tool {
        "stage_payload" => {
            let payload = args
                .get("payload")
                .cloned()
                .ok_or_else(|| ToolError::invalid_argument("Missing required field: payload"))?;
            let descriptor = args
                .get("schemaDescriptor")
                .and_then(Value::as_str)
                .map(ToString::to_string);
            let response = state.stage(&access_id, payload, descriptor).await;
            serde_json::to_value(response)
                .map_err(|err| ToolError::internal(format!("Encoding stage response: {err}")))
        }
        "query_staged" => {
            let sql = require_str(args, "sql")?;
            let response = state.query(&access_id, sql).await;
            serde_json::to_value(response)
                .map_err(|err| ToolError::internal(format!("Encoding query response: {err}")))
        }
        "inspect_schema" => state
            .introspect(&access_id)
            .await
            .map_err(|err| ToolError::internal(format!("{err:#}"))),
        "table_columns" => {
            let table = require_str(args, "table")?;
            state.table_columns(&access_id, table).await.map_err(|err| {
                let message = format!("{err:#}");
                if message.starts_with("Unknown table") {
                    ToolError::not_found(message)
                } else {
                    ToolError::internal(message)
                }
            })
        }
        "chunking_stats" => state
            .chunking_stats(&access_id)
            .await
            .map_err(|err| ToolError::internal(format!("{err:#}"))),
        "delete_staging" => state
            .delete(&access_id)
            .await
            .map(|()| json!({ "success": true }))
            .map_err(|err| ToolError::internal(format!("{err:#}"))),
        _ => Err(ToolError::invalid_argument(format!(
            "Unsupported tool: {tool}"
        ))),
    }
}

fn require_str(args: &Value, field: &str) -> Result<String, ToolError> {
    args.get(field)
        .and_then(Value::as_str)
        .filter(|v| !v.trim().is_empty())
        .map(ToString::to_string)
        .ok_or_else(|| ToolError::invalid_argument(format!("Missing required field: {field}")))
}

fn tool_definitions() -> Vec<Value> {
    vec![
        tool_def(
            "stage_payload",
            "Stage a fetched graph-query payload into the compartment's private SQL database and report the inferred tables",
            json!({
                "type": "object",
                "properties": {
                    "accessId": { "type": "string" },
                    "payload": {},
                    "schemaDescriptor": { "type": "string" }
                },
                "required": ["accessId", "payload"]
            }),
        ),
        tool_def(
            "query_staged",
            "Run read-only analytic SQL (SELECT, WITH, PRAGMA, EXPLAIN, temp tables/views) over a staged payload",
            json!({
                "type": "object",
                "properties": {
                    "accessId": { "type": "string" },
                    "sql": { "type": "string" }
                },
                "required": ["accessId", "sql"]
            }),
        ),
        tool_def(
            "inspect_schema",
            "Summarise the staged database: tables, columns, row counts, indexes and sample rows",
            json!({
                "type": "object",
                "properties": { "accessId": { "type": "string" } },
                "required": ["accessId"]
            }),
        ),
        tool_def(
            "table_columns",
            "List one staged table's columns with foreign-key links where known",
            json!({
                "type": "object",
                "properties": {
                    "accessId": { "type": "string" },
                    "table": { "type": "string" }
                },
                "required": ["accessId", "table"]
            }),
        ),
        tool_def(
            "chunking_stats",
            "Report chunk-store statistics for the compartment",
            json!({
                "type": "object",
                "properties": { "accessId": { "type": "string" } },
                "required": ["accessId"]
            }),
        ),
        tool_def(
            "delete_staging",
            "Tear down the compartment and delete its staged data",
            json!({
                "type": "object",
                "properties": { "accessId": { "type": "string" } },
                "required": ["accessId"]
            }),
        ),
    ]
}

fn tool_def(name: &str, description: &str, input_schema: Value) -> Value {
    json!({
        "name": name,
        "description": description,
        "inputSchema": input_schema,
    })
}

fn jsonrpc_ok(id: Value, result: Value, rate: Option<RateLimitHeaders>) -> Response {
    let body = JsonRpcSuccess {
        jsonrpc: "2.0",
        id,
        result,
    };
    attach_rate_headers((StatusCode::OK, Json(body)).into_response(), rate)
}

fn jsonrpc_error(
    id: Value,
    code: i64,
    message: impl Into<String>,
    data: Value,
    status: StatusCode,
    rate: Option<RateLimitHeaders>,
) -> Response {
    let body = JsonRpcFailure {
        jsonrpc: "2.0",
        id,
        error: JsonRpcError {
            code,
            message: message.into(),
            data,
        },
    };
    attach_rate_headers((status, Json(body)).into_response(), rate)
}

fn attach_rate_headers(mut response: Response, rate: Option<RateLimitHeaders>) -> Response {
    let Some(rate) = rate else {
        return response;
    };
    let headers = response.headers_mut();
    for (name, value) in [
        ("X-RateLimit-Limit", rate.limit.to_string()),
        ("X-RateLimit-Remaining", rate.remaining.to_string()),
        ("X-RateLimit-Reset", rate.reset_seconds.to_string()),
    ] {
        headers.insert(
            name,
            HeaderValue::from_str(&value).unwrap_or_else(|_| HeaderValue::from_static("0")),
        );
    }
    response
}
