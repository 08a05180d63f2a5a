pub mod error;

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::{header, Method};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tower_http::cors::{Any, CorsLayer};

use talkwire_core::AppState;

use error::ApiError;

const VERSION: &str = env!("CARGO_PKG_VERSION");

pub fn build_router() -> Router<AppState> {
    Router::new()
        .route("/", get(welcome))
        .route("/health", get(health))
        .route("/api/presence/status", post(bulk_presence_status))
        .layer(build_cors_layer())
}

fn build_cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
}

async fn welcome() -> impl IntoResponse {
    format!("Welcome to Talkwire {VERSION}")
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok", "version": VERSION }))
}

/// `POST /api/presence/status` — bulk online/offline query.
async fn bulk_presence_status(
    State(state): State<AppState>,
    body: Result<Json<Value>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let Json(body) = body.map_err(|err| ApiError::BadRequest(err.body_text()))?;
    let user_ids = parse_user_ids(&body)?;
    let users = state
        .presence
        .bulk_status(&user_ids)
        .await
        .map_err(|err| ApiError::Internal(anyhow::anyhow!("presence query failed: {err}")))?;
    Ok(Json(json!({
        "success": true,
        "users": users,
        "timestamp": chrono::Utc::now().timestamp_millis(),
    })))
}

fn parse_user_ids(body: &Value) -> Result<Vec<String>, ApiError> {
    let ids = body
        .get("userIds")
        .and_then(Value::as_array)
        .ok_or_else(|| ApiError::BadRequest("userIds must be an array".to_string()))?;
    ids.iter()
        .map(|entry| match entry.as_str() {
            Some(id) if !id.trim().is_empty() => Ok(id.to_string()),
            _ => Err(ApiError::BadRequest(
                "userIds entries must be non-empty strings".to_string(),
            )),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_id_arrays_parse() {
        let body = json!({ "userIds": ["A", "B", "Z"] });
        assert_eq!(parse_user_ids(&body).expect("parse"), vec!["A", "B", "Z"]);
    }

    #[test]
    fn empty_arrays_are_allowed() {
        let body = json!({ "userIds": [] });
        assert!(parse_user_ids(&body).expect("parse").is_empty());
    }

    #[test]
    fn missing_field_is_a_bad_request() {
        assert!(matches!(
            parse_user_ids(&json!({})),
            Err(ApiError::BadRequest(_))
        ));
    }

    #[test]
    fn non_array_input_is_a_bad_request() {
        assert!(matches!(
            parse_user_ids(&json!({ "userIds": "A" })),
            Err(ApiError::BadRequest(_))
        ));
    }

    #[test]
    fn non_string_entries_are_a_bad_request() {
        assert!(matches!(
            parse_user_ids(&json!({ "userIds": ["A", 7] })),
            Err(ApiError::BadRequest(_))
        ));
    }
}
