// src/models/submission.rs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use validator::Validate;

/// Represents the 'submissions' table. Immutable once created; a retake is a new row.
#[derive(Debug, Clone, FromRow, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Submission {
    pub id: String,
    pub card_set_id: String,
    pub user_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A submission plus the option ids it chose.
#[derive(Debug, Clone)]
pub struct SubmissionWithAnswers {
    pub submission: Submission,
    pub option_ids: Vec<String>,
}

/// How to pick "the" submission shown alongside a card set.
#[derive(Debug, Clone, Copy)]
pub enum SubmissionLookup<'a> {
    ById(&'a str),
    LatestForUser(&'a str),
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnswerInput {
    pub option_id: String,
}

/// DTO for submitting answers to a card set.
#[derive(Debug, Deserialize, Validate)]
pub struct CreateSubmissionRequest {
    #[validate(length(max = 1000))]
    pub answers: Vec<AnswerInput>,
}
