// src/handlers/webhooks.rs

//! Inbound notifications from the scheduler, the payment processor and the OCR
//! service.

use axum::{
    Json,
    extract::State,
    http::HeaderMap,
    response::IntoResponse,
};
use serde::Deserialize;
use serde_json::json;

use crate::{
    error::AppError,
    ports::{PaymentError, PaymentEvent},
    services::{
        chunking::calculate_required_tokens,
        ledger::{self, PurchaseOutcome},
        pipeline::{ChunkJob, ChunkOutcome},
    },
    state::AppState,
    utils::signature::verify_qstash,
};

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// One question builder job, delivered by the scheduler.
///
/// A failure inside the pipeline is recorded on the card set and acknowledged with
/// `success: false`, so the scheduler does not redeliver it.
pub async fn question_builder(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> Result<impl IntoResponse, AppError> {
    // 1. Authenticate the delivery
    let signature = header_str(&headers, "upstash-signature")
        .ok_or_else(|| AppError::BadRequest("Missing signature".to_string()))?;

    verify_qstash(
        signature,
        body.as_bytes(),
        &state.config.qstash_current_signing_key,
        &state.config.qstash_next_signing_key,
    )
    .map_err(|e| {
        tracing::warn!("Rejected question builder delivery: {}", e);
        AppError::BadRequest("Signature verification failed".to_string())
    })?;

    // 2. Parse and run
    let job: ChunkJob = serde_json::from_str(&body)?;
    let outcome = state.pipeline()?.process_chunk(&job).await?;

    let response = match outcome {
        ChunkOutcome::Retrying => json!({ "success": true, "delayed": true }),
        ChunkOutcome::Failed(message) => json!({ "success": false, "error": message }),
        ChunkOutcome::Continued(_) | ChunkOutcome::Ready | ChunkOutcome::Duplicate => {
            json!({ "success": true })
        }
    };

    Ok(Json(response))
}

/// Signed payment processor events.
pub async fn payments(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> Result<impl IntoResponse, AppError> {
    let signature = header_str(&headers, "stripe-signature").ok_or_else(|| {
        tracing::error!("Payment event is not signed");
        AppError::BadRequest("Request is not signed".to_string())
    })?;

    let event = state
        .payments
        .parse_event(&body, signature)
        .await
        .map_err(|e| match e {
            PaymentError::InvalidSignature(_) | PaymentError::InvalidPayload(_) => {
                tracing::warn!("Rejected payment event: {}", e);
                AppError::BadRequest("Request is invalid".to_string())
            }
            other => {
                tracing::error!("Failed to resolve payment event: {}", other);
                AppError::InternalServerError(other.to_string())
            }
        })?;

    match event {
        PaymentEvent::CheckoutCompleted(checkout) => {
            if let PurchaseOutcome::Ignored(reason) =
                ledger::purchase(state.repo.as_ref(), checkout).await?
            {
                tracing::warn!("Ignored completed checkout: {}", reason);
            }
        }
        PaymentEvent::ChargeRefunded {
            payment_id,
            refunded_amount,
            refunded_at,
        } => {
            ledger::apply_refund(state.repo.as_ref(), &payment_id, refunded_at, refunded_amount)
                .await?;
        }
        PaymentEvent::Ignored(kind) => {
            tracing::debug!("Ignoring payment event {}", kind);
        }
    }

    Ok(Json(json!({ "success": true })))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OcrStatus {
    InProgress,
    Succeeded,
    Failed,
    PartialSuccess,
}

/// Completion notice of a text detection job.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct OcrNotification {
    pub job_id: String,
    pub status: OcrStatus,
}

/// Attaches OCR output to the card set that started the job.
pub async fn ocr(
    State(state): State<AppState>,
    Json(notification): Json<OcrNotification>,
) -> Result<impl IntoResponse, AppError> {
    let ocr = state.ocr.as_ref().ok_or_else(|| {
        AppError::InternalServerError("Text recognition is not configured".to_string())
    })?;

    // The job may finish before the card set row is committed; a 5xx makes the
    // notifier try again.
    let card_set = state
        .repo
        .find_card_set_by_ocr_job(&notification.job_id)
        .await?
        .ok_or_else(|| AppError::InternalServerError("Not ready to process this request".to_string()))?;

    if notification.status != OcrStatus::Succeeded {
        let page = ocr.text_page(&notification.job_id, None).await?;
        let message = format!(
            "Error processing PDF file: {}",
            page.status_message.unwrap_or_else(|| format!("{:?}", notification.status))
        );
        tracing::error!(card_set_id = %card_set.id, "{}", message);
        state.repo.fail_card_set(&card_set.id, &message).await?;
        return Ok(Json(json!({ "success": true })));
    }

    let mut source_text = String::new();
    let mut next_token: Option<String> = None;
    loop {
        let page = ocr
            .text_page(&notification.job_id, next_token.as_deref())
            .await?;
        for line in page.lines {
            source_text.push_str(&line);
            source_text.push('\n');
        }
        match page.next_token {
            Some(token) => next_token = Some(token),
            None => break,
        }
    }

    if source_text.trim().is_empty() {
        state
            .repo
            .fail_card_set(&card_set.id, "Error processing PDF file: no text was found")
            .await?;
        return Ok(Json(json!({ "success": true })));
    }

    let required_tokens = calculate_required_tokens(source_text.chars().count());
    let attached = state
        .repo
        .attach_source_text(&card_set.id, &source_text, required_tokens)
        .await?;

    tracing::info!(
        card_set_id = %card_set.id,
        attached,
        required_tokens,
        "OCR text received"
    );

    Ok(Json(json!({ "success": true })))
}
