// src/handlers/auth.rs

use axum::{
    Json,
    extract::State,
    http::header,
    response::IntoResponse,
};
use serde_json::json;
use validator::Validate;

use crate::{
    error::AppError,
    models::user::CreateSessionRequest,
    state::AppState,
    utils::jwt::{clear_session_cookie, session_cookie, sign_jwt},
};

/// Exchanges an identity-provider sign-in token for a session.
///
/// The sign-in must be recent (within the last hour). The local user is found or
/// created by email. The session token is returned in the body and also set as an
/// HttpOnly `session` cookie.
pub async fn create_session(
    State(state): State<AppState>,
    Json(payload): Json<CreateSessionRequest>,
) -> Result<impl IntoResponse, AppError> {
    payload
        .validate()
        .map_err(|e| AppError::BadRequest(e.to_string()))?;

    let identity = state
        .identity
        .verify_sign_in_token(&payload.id_token)
        .await
        .map_err(|e| {
            tracing::warn!("Rejected sign-in token: {}", e);
            AppError::from(e)
        })?;

    let user = state
        .repo
        .find_or_create_user_by_email(&identity.email)
        .await
        .map_err(|e| {
            tracing::error!("Failed to upsert user {}: {:?}", identity.email, e);
            AppError::from(e)
        })?;

    let expires_in = state.config.jwt_expiration;
    let token = sign_jwt(&user.id, &user.email, &state.config.jwt_secret, expires_in)?;

    tracing::info!(user_id = %user.id, "Session created");

    Ok((
        [(header::SET_COOKIE, session_cookie(&token, expires_in))],
        Json(json!({
            "token": token,
            "type": "Bearer",
            "expiresIn": expires_in
        })),
    ))
}

/// Clears the session cookie.
pub async fn logout() -> impl IntoResponse {
    (
        [(header::SET_COOKIE, clear_session_cookie())],
        Json(json!({ "success": true })),
    )
}
