// src/models/card_set.rs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use validator::Validate;

/// Represents the 'card_sets' table: one quiz built from one uploaded document.
#[derive(Debug, Clone, FromRow, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CardSet {
    pub id: String,
    pub title: String,

    /// Extracted document text. Never sent to clients.
    #[serde(skip)]
    pub source_text: Option<String>,

    /// Fixed once `source_text` is known.
    pub required_tokens: i32,

    /// Set while an OCR job is extracting the text of a scanned PDF.
    pub ocr_job_id: Option<String>,

    pub prepare_started_at: Option<DateTime<Utc>>,
    pub ready_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub refunded_at: Option<DateTime<Utc>>,
    pub created_by_user_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl CardSet {
    /// True once the pipeline has concluded or the set was refunded.
    pub fn is_terminal(&self) -> bool {
        self.ready_at.is_some() || self.error.is_some() || self.refunded_at.is_some()
    }

    /// Whether `user_id` may act on this set as its owner.
    /// Sets without an owner are open to anyone.
    pub fn is_owned_by(&self, user_id: Option<&str>) -> bool {
        match self.created_by_user_id.as_deref() {
            None => true,
            Some(owner) => Some(owner) == user_id,
        }
    }
}

/// Values for inserting a new card set.
#[derive(Debug, Clone)]
pub struct NewCardSet {
    pub id: String,
    pub title: String,
    pub source_text: Option<String>,
    pub required_tokens: i32,
    pub ocr_job_id: Option<String>,
    pub created_by_user_id: Option<String>,
}

/// Lifecycle status derived from which fields of a `CardSet` are present.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CardSetStatus {
    Starting,
    Analyzing,
    Waiting,
    Preparing,
    Ready,
    Error,
}

/// DTO for creating a card set from an uploaded file.
#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CreateCardSetRequest {
    #[validate(length(min = 1, max = 64))]
    pub file_key: String,
    #[validate(length(min = 1, max = 200))]
    pub title: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FindCardSetParams {
    pub submission_id: Option<String>,
}

/// Result of `prepare` and `unlock`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUseResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub used_tokens: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub required_tokens: Option<i64>,
}

impl TokenUseResponse {
    pub fn used(count: i64) -> Self {
        Self {
            success: true,
            used_tokens: Some(count),
            required_tokens: None,
        }
    }

    pub fn short(required: i64) -> Self {
        Self {
            success: false,
            used_tokens: None,
            required_tokens: Some(required),
        }
    }
}
