// src/routes.rs

use axum::{
    Router,
    extract::DefaultBodyLimit,
    http::{Method, header},
    routing::{get, post},
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::{
    handlers::{auth, billing, card_set, upload, webhooks},
    state::AppState,
};

/// Assembles the main application router.
///
/// * Merges all sub-routers (auth, uploads, card sets, billing, webhooks).
/// * Applies global middleware (Trace, CORS).
/// * Injects global state (repository, adapters, config).
pub fn create_router(state: AppState) -> Router {
    let origins = [
        "http://localhost:3000".parse().unwrap(),
        "http://127.0.0.1:3000".parse().unwrap(),
    ];

    let cors = CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE])
        .allow_credentials(true);

    let auth_routes = Router::new()
        .route("/session", post(auth::create_session))
        .route("/logout", post(auth::logout));

    let upload_routes = Router::new()
        .route("/", post(upload::upload_file))
        .layer(DefaultBodyLimit::max(state.config.max_upload_bytes));

    let card_set_routes = Router::new()
        .route("/", get(card_set::find_all).post(card_set::create))
        .route("/{id}", get(card_set::find_one))
        .route("/{id}/recreate", post(card_set::recreate))
        .route("/{id}/prepare", post(card_set::prepare))
        .route("/{id}/unlock", post(card_set::unlock))
        .route("/{id}/submissions", post(card_set::create_submission));

    let billing_routes = Router::new()
        .route("/checkout", post(billing::create_checkout))
        .route("/checkout/{rid}", get(billing::checkout_status))
        .route("/payments", get(billing::list_payments))
        .route("/payments/{id}/refund", post(billing::refund_payment))
        .route("/tokens", get(billing::available_tokens));

    // Webhook callers authenticate with signatures, not sessions.
    let webhook_routes = Router::new()
        .route("/question-builder", post(webhooks::question_builder))
        .route("/payments", post(webhooks::payments))
        .route("/ocr", post(webhooks::ocr));

    Router::new()
        .nest("/api/auth", auth_routes)
        .nest("/api/uploads", upload_routes)
        .nest("/api/card-sets", card_set_routes)
        .nest("/api/billing", billing_routes)
        .nest("/api/webhooks", webhook_routes)
        // Global Middleware (applied from outside in)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
