use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use chrono::Utc;
use serde_json::json;
use tracing::warn;

use crate::{
    auth::verify_bearer,
    models::{QueryRequest, QueryResponse, StageRequest},
    AppState,
};

pub async fn healthz() -> impl IntoResponse {
    Json(json!({ "ok": true, "timestamp": Utc::now() }))
}

pub async fn stage_payload(
    State(state): State<AppState>,
    Path(access_id): Path<String>,
    headers: HeaderMap,
    Json(request): Json<StageRequest>,
) -> impl IntoResponse {
    if let Err(err) = verify_bearer(&headers, &state.config.api_key) {
        return err.into_response();
    }

    let response = state
        .stage(&access_id, request.payload, request.schema_descriptor)
        .await;
    let status = if response.success {
        StatusCode::OK
    } else {
        StatusCode::UNPROCESSABLE_ENTITY
    };
    (status, Json(response)).into_response()
}

pub async fn query_staged(
    State(state): State<AppState>,
    Path(access_id): Path<String>,
    headers: HeaderMap,
    Json(request): Json<QueryRequest>,
) -> impl IntoResponse {
    if let Err(err) = verify_bearer(&headers, &state.config.api_key) {
        return err.into_response();
    }

    let response = state.query(&access_id, request.sql).await;
    let status = match &response {
        QueryResponse::Success(_) => StatusCode::OK,
        QueryResponse::Failure(_) => StatusCode::BAD_REQUEST,
    };
    (status, Json(response)).into_response()
}

pub async fn get_schema(
    State(state): State<AppState>,
    Path(access_id): Path<String>,
    headers: HeaderMap,
) -> impl IntoResponse {
    if let Err(err) = verify_bearer(&headers, &state.config.api_key) {
        return err.into_response();
    }

    match state.introspect(&access_id).await {
        Ok(info) => (StatusCode::OK, Json(info)).into_response(),
        Err(err) => introspection_error(&access_id, err),
    }
}

pub async fn get_table_columns(
    State(state): State<AppState>,
    Path((access_id, table)): Path<(String, String)>,
    headers: HeaderMap,
) -> impl IntoResponse {
    if let Err(err) = verify_bearer(&headers, &state.config.api_key) {
        return err.into_response();
    }

    match state.table_columns(&access_id, table).await {
        Ok(columns) => (StatusCode::OK, Json(columns)).into_response(),
        Err(err) if err.to_string().starts_with("Unknown table") => (
            StatusCode::NOT_FOUND,
            Json(json!({ "success": false, "error": err.to_string() })),
        )
            .into_response(),
        Err(err) => introspection_error(&access_id, err),
    }
}

pub async fn get_chunking_stats(
    State(state): State<AppState>,
    Path(access_id): Path<String>,
    headers: HeaderMap,
) -> impl IntoResponse {
    if let Err(err) = verify_bearer(&headers, &state.config.api_key) {
        return err.into_response();
    }

    match state.chunking_stats(&access_id).await {
        Ok(stats) => (StatusCode::OK, Json(stats)).into_response(),
        Err(err) => introspection_error(&access_id, err),
    }
}

pub async fn delete_staging(
    State(state): State<AppState>,
    Path(access_id): Path<String>,
    headers: HeaderMap,
) -> impl IntoResponse {
    if let Err(err) = verify_bearer(&headers, &state.config.api_key) {
        return err.into_response();
    }

    match state.delete(&access_id).await {
        Ok(()) => (StatusCode::OK, Json(json!({ "success": true }))).into_response(),
        Err(err) => introspection_error(&access_id, err),
    }
}

fn introspection_error(access_id: &str, err: anyhow::Error) -> axum::response::Response {
    warn!(access_id = %access_id, "Staging operation failed: {err:#}");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "success": false, "error": format!("{err:#}") })),
    )
        .into_response()
}
