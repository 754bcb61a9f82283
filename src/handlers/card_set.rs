// src/handlers/card_set.rs

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use chrono::{Duration, Utc};
use validator::Validate;

use crate::{
    error::AppError,
    models::{
        card_set::{CardSet, CreateCardSetRequest, FindCardSetParams, NewCardSet, TokenUseResponse},
        submission::{CreateSubmissionRequest, SubmissionLookup},
    },
    services::{
        chunking::calculate_required_tokens,
        extraction::extract_text,
        ledger,
        pipeline::SCHEDULING_FAILED,
        resolver::{CardSetView, load_card_set_view},
        scoring,
    },
    state::AppState,
    store::new_id,
    utils::jwt::MaybeUser,
};

/// Loads a card set that clients may still see (exists and not refunded).
async fn find_visible(state: &AppState, id: &str) -> Result<CardSet, AppError> {
    state
        .repo
        .find_card_set(id)
        .await?
        .filter(|c| c.refunded_at.is_none())
        .ok_or_else(|| AppError::NotFound("Card set not found".to_string()))
}

/// Lists the caller's card sets that are neither refunded nor failed, newest first,
/// each with the caller's latest submission. Anonymous callers get an empty list.
pub async fn find_all(
    State(state): State<AppState>,
    user: MaybeUser,
) -> Result<impl IntoResponse, AppError> {
    let Some(user_id) = user.id() else {
        return Ok(Json(Vec::<CardSetView>::new()));
    };

    let card_sets = state.repo.list_active_card_sets(user_id).await.map_err(|e| {
        tracing::error!("Failed to list card sets: {:?}", e);
        AppError::from(e)
    })?;

    let policy = state.lock_policy();
    let mut views = Vec::with_capacity(card_sets.len());
    for card_set in &card_sets {
        let submission = state
            .repo
            .find_submission(&card_set.id, SubmissionLookup::LatestForUser(user_id))
            .await?;
        views.push(load_card_set_view(state.repo.as_ref(), card_set, submission.as_ref(), policy).await?);
    }

    Ok(Json(views))
}

/// Returns one card set. The submission shown is `submissionId` when given,
/// otherwise the caller's latest one.
pub async fn find_one(
    State(state): State<AppState>,
    user: MaybeUser,
    Path(id): Path<String>,
    Query(params): Query<FindCardSetParams>,
) -> Result<impl IntoResponse, AppError> {
    let card_set = find_visible(&state, &id).await?;

    let lookup = match (params.submission_id.as_deref(), user.id()) {
        (Some(submission_id), _) => Some(SubmissionLookup::ById(submission_id)),
        (None, Some(user_id)) => Some(SubmissionLookup::LatestForUser(user_id)),
        (None, None) => None,
    };
    let submission = match lookup {
        Some(lookup) => state.repo.find_submission(&card_set.id, lookup).await?,
        None => None,
    };

    let view = load_card_set_view(
        state.repo.as_ref(),
        &card_set,
        submission.as_ref(),
        state.lock_policy(),
    )
    .await?;

    Ok(Json(view))
}

/// Creates a card set from an uploaded file.
///
/// Text-bearing documents are extracted right away. A PDF without a text layer
/// starts an OCR job instead (subject to the hourly OCR limit) and its text arrives
/// later through the OCR webhook.
pub async fn create(
    State(state): State<AppState>,
    user: MaybeUser,
    Json(payload): Json<CreateCardSetRequest>,
) -> Result<impl IntoResponse, AppError> {
    payload
        .validate()
        .map_err(|e| AppError::BadRequest(e.to_string()))?;

    // 1. Read the upload back
    let content_type = state.storage.head(&payload.file_key).await?;
    let bytes = state.storage.get(&payload.file_key).await?;

    // 2. Extract
    let source_text = extract_text(&content_type, bytes).await.map_err(|e| {
        tracing::error!("Extraction of {} failed: {}", payload.file_key, e);
        AppError::from(e)
    })?;

    let mut new = NewCardSet {
        id: new_id(),
        title: payload.title.trim().to_string(),
        source_text: None,
        required_tokens: 1,
        ocr_job_id: None,
        created_by_user_id: user.id().map(str::to_string),
    };

    if source_text.is_empty() {
        if content_type != "application/pdf" {
            return Err(AppError::InternalServerError(
                "Couldn't extract text from a Word document".to_string(),
            ));
        }

        // 3a. Scanned PDF: hand it to OCR
        let ocr = state.ocr.as_ref().ok_or_else(|| {
            AppError::InternalServerError("Text recognition is not configured".to_string())
        })?;

        let started = state
            .repo
            .count_ocr_jobs_since(Utc::now() - Duration::hours(1))
            .await?;
        if started >= state.config.ocr_jobs_per_hour {
            tracing::warn!("OCR limit reached ({} jobs in the last hour)", started);
            return Err(AppError::TooManyRequests(
                "We are processing too many requests at the moment. Try again soon.".to_string(),
            ));
        }

        tracing::info!("Trying to extract PDF text of {} with OCR", payload.file_key);
        let job_id = ocr
            .start_text_detection(&state.config.upload_bucket, &payload.file_key)
            .await?;
        new.ocr_job_id = Some(job_id);
    } else {
        // 3b. Text is known, so is the price
        new.required_tokens = calculate_required_tokens(source_text.chars().count());
        new.source_text = Some(source_text);
    }

    let card_set = state.repo.insert_card_set(new).await.map_err(|e| {
        tracing::error!("Failed to create card set: {:?}", e);
        AppError::from(e)
    })?;

    let view = load_card_set_view(state.repo.as_ref(), &card_set, None, state.lock_policy()).await?;

    Ok((StatusCode::CREATED, Json(view)))
}

/// Starts a fresh card set from the text of an existing one.
pub async fn recreate(
    State(state): State<AppState>,
    user: MaybeUser,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let original = state
        .repo
        .find_card_set(&id)
        .await?
        .ok_or_else(|| AppError::NotFound("Card set not found".to_string()))?;

    if !original.is_owned_by(user.id()) {
        return Err(AppError::Forbidden(
            "You don't have the permissions to recreate this card set".to_string(),
        ));
    }
    let Some(source_text) = original.source_text else {
        return Err(AppError::BadRequest(
            "This card set has no text to recreate from".to_string(),
        ));
    };

    let card_set = state
        .repo
        .insert_card_set(NewCardSet {
            id: new_id(),
            title: original.title,
            source_text: Some(source_text),
            required_tokens: original.required_tokens,
            ocr_job_id: None,
            created_by_user_id: user.id().map(str::to_string),
        })
        .await?;

    let view = load_card_set_view(state.repo.as_ref(), &card_set, None, state.lock_policy()).await?;

    Ok((StatusCode::CREATED, Json(view)))
}

/// Moves a waiting card set into preparation and schedules its first chunk.
///
/// Tokens are redeemed when the caller has enough of them; otherwise preparation
/// still starts and the set can be unlocked later.
pub async fn prepare(
    State(state): State<AppState>,
    user: MaybeUser,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let card_set = state
        .repo
        .find_card_set(&id)
        .await?
        .filter(|c| c.source_text.is_some() && c.prepare_started_at.is_none() && !c.is_terminal())
        .ok_or_else(|| AppError::BadRequest("This card set cannot be prepared".to_string()))?;

    let pipeline = state.pipeline()?;

    let used = ledger::prepare(
        state.repo.as_ref(),
        &card_set,
        user.id(),
        state.config.tx_budget(),
    )
    .await?;

    if let Err(e) = pipeline.start(&card_set.id).await {
        tracing::error!("Failed to schedule first chunk of {}: {}", card_set.id, e);
        state.repo.fail_card_set(&card_set.id, SCHEDULING_FAILED).await?;
        return Err(AppError::InternalServerError(e.to_string()));
    }

    tracing::info!(card_set_id = %card_set.id, used_tokens = used, "Preparation started");

    Ok(Json(TokenUseResponse::used(used)))
}

/// Redeems the tokens a card set is still missing.
pub async fn unlock(
    State(state): State<AppState>,
    user: MaybeUser,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let card_set = find_visible(&state, &id).await?;

    let response = ledger::unlock(
        state.repo.as_ref(),
        &card_set,
        user.id(),
        state.config.tx_budget(),
    )
    .await?;

    Ok(Json(response))
}

/// Records answers and returns the card set scored against them.
pub async fn create_submission(
    State(state): State<AppState>,
    user: MaybeUser,
    Path(id): Path<String>,
    Json(payload): Json<CreateSubmissionRequest>,
) -> Result<impl IntoResponse, AppError> {
    payload
        .validate()
        .map_err(|e| AppError::BadRequest(e.to_string()))?;

    let card_set = find_visible(&state, &id).await?;

    let submission =
        scoring::create_submission(state.repo.as_ref(), &card_set, user.id(), &payload.answers)
            .await?;

    let view = load_card_set_view(
        state.repo.as_ref(),
        &card_set,
        Some(&submission),
        state.lock_policy(),
    )
    .await?;

    Ok((StatusCode::CREATED, Json(view)))
}
