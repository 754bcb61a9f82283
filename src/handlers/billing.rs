// src/handlers/billing.rs

use axum::{
    Json,
    extract::{Path, State},
    response::IntoResponse,
};
use chrono::Utc;
use serde_json::json;
use validator::Validate;

use crate::{
    error::AppError,
    models::billing::{CheckoutStatus, CreateCheckoutRequest, PaymentView},
    ports::CheckoutRequest,
    services::ledger::{self, RefundDenied, can_refund, refund_eligibility},
    state::AppState,
    store::new_id,
    utils::jwt::MaybeUser,
};

/// Starts a hosted checkout for `quantity` tokens.
///
/// A reconciliation id is generated here and appended to the success URL so the
/// client can poll `checkout_status` until the payment webhook has landed.
pub async fn create_checkout(
    State(state): State<AppState>,
    user: MaybeUser,
    Json(payload): Json<CreateCheckoutRequest>,
) -> Result<impl IntoResponse, AppError> {
    payload
        .validate()
        .map_err(|e| AppError::BadRequest(e.to_string()))?;

    let reconciliation_id = new_id();

    let mut success_url = url::Url::parse(&payload.next_url)
        .map_err(|e| AppError::BadRequest(format!("Invalid nextUrl: {}", e)))?;
    success_url
        .query_pairs_mut()
        .append_pair("success", "1")
        .append_pair("rid", &reconciliation_id);

    let url = state
        .payments
        .create_checkout(CheckoutRequest {
            price: payload.price,
            quantity: payload.quantity,
            success_url: success_url.to_string(),
            cancel_url: payload.cancel_url,
            customer_email: user.0.map(|claims| claims.email),
            reconciliation_id,
            costless_refund: false,
        })
        .await
        .map_err(|e| {
            tracing::error!("Failed to create checkout: {}", e);
            AppError::from(e)
        })?;

    Ok(Json(json!({ "url": url })))
}

/// Reports whether the checkout with reconciliation id `rid` has been paid.
///
/// When it has and the caller is anonymous, `requireLogin` carries the email the
/// payment was recorded under.
pub async fn checkout_status(
    State(state): State<AppState>,
    user: MaybeUser,
    Path(rid): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let payment = state.repo.find_payment_by_reconciliation(&rid).await?;

    let status = if payment.is_some() {
        CheckoutStatus::Paid
    } else {
        CheckoutStatus::Unpaid
    };

    let require_login = match (&payment, user.id()) {
        (Some(payment), None) => state
            .repo
            .find_user(&payment.user_id)
            .await?
            .map(|u| json!({ "email": u.email })),
        _ => None,
    };

    Ok(Json(json!({
        "status": status,
        "requireLogin": require_login
    })))
}

/// The caller's payments, newest first.
pub async fn list_payments(
    State(state): State<AppState>,
    user: MaybeUser,
) -> Result<impl IntoResponse, AppError> {
    let Some(user_id) = user.id() else {
        return Ok(Json(Vec::<PaymentView>::new()));
    };

    let now = Utc::now();
    let window = state.config.refund_window_hours;

    let payments = state
        .repo
        .list_payments(user_id)
        .await?
        .into_iter()
        .map(|p| PaymentView {
            can_refund: can_refund(&p.payment, now, window),
            id: p.payment.id,
            amount: p.payment.amount,
            created_at: p.payment.created_at,
            refunded_at: p.payment.refunded_at,
            tokens: p.tokens,
        })
        .collect::<Vec<_>>();

    Ok(Json(payments))
}

/// Number of tokens the caller can still spend.
pub async fn available_tokens(
    State(state): State<AppState>,
    user: MaybeUser,
) -> Result<impl IntoResponse, AppError> {
    let count = match user.id() {
        Some(user_id) => state.repo.available_token_count(user_id).await?,
        None => 0,
    };

    Ok(Json(json!({ "availableCount": count })))
}

/// Refunds one of the caller's payments and returns its tokens' card sets to the
/// refunded state.
pub async fn refund_payment(
    State(state): State<AppState>,
    user: MaybeUser,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let forbidden =
        || AppError::Forbidden("You don't have the permissions to refund this transaction".to_string());

    let payment = state.repo.find_payment(&id).await?.ok_or_else(forbidden)?;

    match refund_eligibility(&payment, user.id(), Utc::now(), state.config.refund_window_hours) {
        Err(RefundDenied::NotOwner) => return Err(forbidden()),
        Err(RefundDenied::WindowClosed) => {
            return Err(AppError::BadRequest(format!(
                "The refunds can be processed within the first {} hours",
                state.config.refund_window_hours
            )));
        }
        Ok(false) => return Ok(Json(json!({ "success": true }))),
        Ok(true) => {}
    }

    ledger::refund(state.repo.as_ref(), state.payments.as_ref(), &payment).await?;

    Ok(Json(json!({ "success": true })))
}
