// src/handlers/upload.rs

use axum::{
    Json,
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode, header},
    response::IntoResponse,
};
use serde_json::json;

use crate::{
    config::SUPPORTED_CONTENT_TYPES,
    error::AppError,
    state::AppState,
    store::new_id,
};

/// Stores an uploaded document under a fresh key.
///
/// The body is the raw file; its `Content-Type` must be PDF or Word.
pub async fn upload_file(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, AppError> {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(';').next().unwrap_or(v).trim().to_ascii_lowercase())
        .unwrap_or_default();

    if !SUPPORTED_CONTENT_TYPES.contains(&content_type.as_str()) {
        return Err(AppError::BadRequest("Document type is not supported".to_string()));
    }
    if body.is_empty() {
        return Err(AppError::BadRequest("The uploaded file is empty".to_string()));
    }

    let key = new_id();
    state
        .storage
        .put(&key, &content_type, &body)
        .await
        .map_err(|e| {
            tracing::error!("Failed to store upload {}: {}", key, e);
            AppError::from(e)
        })?;

    tracing::info!("Stored upload {} ({} bytes, {})", key, body.len(), content_type);

    Ok((StatusCode::CREATED, Json(json!({ "key": key }))))
}
