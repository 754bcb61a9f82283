// src/services/scoring.rs

use std::collections::HashSet;

use serde::Serialize;

use crate::{
    error::AppError,
    models::{
        card_set::CardSet,
        submission::{AnswerInput, SubmissionWithAnswers},
    },
    services::resolver::QuestionView,
    store::Repository,
};

/// Correct answers out of the questions shown. Never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Score {
    pub correct: usize,
    pub total: usize,
}

/// Counts questions whose chosen option is the correct one.
pub fn score(questions: &[QuestionView]) -> Score {
    let correct = questions
        .iter()
        .filter_map(|q| q.answer.as_ref())
        .filter(|a| a.user_choice.is_some() && a.user_choice == a.correct_choice)
        .count();

    Score {
        correct,
        total: questions.len(),
    }
}

/// Checks that every answer picks an option of the card set.
/// Returns the first unknown option id on failure.
pub fn validate_answers(answers: &[AnswerInput], known: &HashSet<String>) -> Result<Vec<String>, String> {
    answers
        .iter()
        .map(|a| {
            if known.contains(&a.option_id) {
                Ok(a.option_id.clone())
            } else {
                Err(a.option_id.clone())
            }
        })
        .collect()
}

/// Records a new submission for `card_set`. Retakes always create a new row.
pub async fn create_submission(
    repo: &dyn Repository,
    card_set: &CardSet,
    user_id: Option<&str>,
    answers: &[AnswerInput],
) -> Result<SubmissionWithAnswers, AppError> {
    let known = repo.option_ids(&card_set.id).await?;

    let option_ids = validate_answers(answers, &known)
        .map_err(|id| AppError::BadRequest(format!("Invalid options id provided: {}", id)))?;

    let submission = repo
        .insert_submission(&card_set.id, user_id, &option_ids)
        .await
        .map_err(|e| {
            tracing::error!("Failed to store submission for {}: {:?}", card_set.id, e);
            AppError::from(e)
        })?;

    tracing::info!(
        card_set_id = %card_set.id,
        submission_id = %submission.submission.id,
        answers = option_ids.len(),
        "Submission created"
    );
    Ok(submission)
}
