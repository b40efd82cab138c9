use axum::{
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    Json,
};
use serde_json::json;

pub type AuthRejection = (StatusCode, Json<serde_json::Value>);

pub fn verify_bearer(headers: &HeaderMap, expected_key: &str) -> Result<(), AuthRejection> {
    let token = extract_bearer_token(headers)?;
    if token.trim() != expected_key {
        return Err(unauthorized("Invalid API key"));
    }
    Ok(())
}

pub fn extract_bearer_token(headers: &HeaderMap) -> Result<String, AuthRejection> {
    let raw = headers
        .get(AUTHORIZATION)
        .ok_or_else(|| unauthorized("Missing Authorization header"))?;
    let value = raw
        .to_str()
        .map_err(|_| unauthorized("Invalid Authorization header"))?;
    let token = value
        .strip_prefix("Bearer ")
        .ok_or_else(|| unauthorized("Authorization must use Bearer token"))?;
    Ok(token.to_string())
}

fn unauthorized(message: &str) -> AuthRejection {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({
            "error": {
                "code": "UNAUTHORIZED",
                "message": message
            }
        })),
    )
}
