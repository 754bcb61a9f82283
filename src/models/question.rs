// src/models/question.rs

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::FromRow;

/// Represents the 'questions' table. Rows are only written by the generation pipeline.
#[derive(Debug, Clone, FromRow, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Question {
    pub id: String,
    pub card_set_id: String,
    pub text: String,

    /// Position inside the batch produced for one chunk.
    #[sqlx(rename = "position")]
    pub index: i32,

    /// First character of the chunk the question was generated from.
    pub chunk_start: i32,

    pub created_at: DateTime<Utc>,
}

/// Represents the 'options' table.
#[derive(Debug, Clone, FromRow, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnswerOption {
    pub id: String,
    pub question_id: String,
    pub text: String,
    pub is_correct: bool,
    #[sqlx(rename = "position")]
    pub index: i32,
}

/// A question with its options in display order.
#[derive(Debug, Clone)]
pub struct QuestionWithOptions {
    pub question: Question,
    pub options: Vec<AnswerOption>,
}

/// One validated item of a generation response, ready to persist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedQuestion {
    pub text: String,
    pub options: Vec<String>,
    pub correct_index: usize,
}
