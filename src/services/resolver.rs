// src/services/resolver.rs

//! Read-side projection of a card set. `resolve_card_set` is pure: it only looks at
//! the rows it is given. `load_card_set_view` fetches those rows.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::{
    config::Config,
    models::{
        card_set::{CardSet, CardSetStatus},
        question::{AnswerOption, QuestionWithOptions},
        submission::SubmissionWithAnswers,
    },
    services::scoring::{Score, score},
    store::{RepoResult, Repository},
};

/// Placeholder shown instead of locked question and option text.
pub const LOCKED_TEXT: &str = "[LOCKED]";

/// Whether questions past a free preview are hidden until the set is paid for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockPolicy {
    pub enabled: bool,
    pub free_preview: usize,
}

impl LockPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            enabled: config.lock_preview_questions,
            free_preview: config.free_preview_questions,
        }
    }

    /// A set is locked when the policy is on and none of its tokens are paid for.
    pub fn is_locked(&self, redeemed_tokens: i64) -> bool {
        self.enabled && redeemed_tokens == 0
    }

    pub fn hides(&self, locked: bool, position: usize) -> bool {
        locked && position >= self.free_preview
    }
}

impl Default for LockPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            free_preview: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CardSetView {
    pub id: String,
    pub status: CardSetStatus,
    pub created_at: DateTime<Utc>,
    pub title: String,
    pub required_tokens: i32,
    pub is_locked: bool,
    pub error: Option<String>,
    pub submission_id: Option<String>,
    pub questions: Vec<QuestionView>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<Score>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuestionView {
    pub id: String,
    pub text: String,
    pub is_locked: bool,
    pub options: Vec<OptionView>,
    pub answer: Option<AnswerView>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OptionView {
    pub id: String,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnswerView {
    pub user_choice: Option<String>,
    pub correct_choice: Option<String>,
}

/// Status from field presence, checked from the most advanced state down.
pub fn derive_status(card_set: &CardSet) -> CardSetStatus {
    if card_set.ready_at.is_some() {
        CardSetStatus::Ready
    } else if card_set.error.is_some() {
        CardSetStatus::Error
    } else if card_set.prepare_started_at.is_some() {
        CardSetStatus::Preparing
    } else if card_set.source_text.is_some() {
        CardSetStatus::Waiting
    } else if card_set.ocr_job_id.is_some() {
        CardSetStatus::Analyzing
    } else {
        CardSetStatus::Starting
    }
}

/// Recovery rule for generated questions: the option flagged correct, or the first
/// option when the generator flagged none.
pub fn correct_choice(options: &[AnswerOption]) -> Option<&AnswerOption> {
    options.iter().find(|o| o.is_correct).or_else(|| options.first())
}

/// Builds the client view. `questions` is ignored unless the set is ready.
pub fn resolve_card_set(
    card_set: &CardSet,
    questions: &[QuestionWithOptions],
    submission: Option<&SubmissionWithAnswers>,
    redeemed_tokens: i64,
    policy: LockPolicy,
) -> CardSetView {
    let status = derive_status(card_set);
    let is_locked = policy.is_locked(redeemed_tokens);

    let chosen: HashSet<&str> = submission
        .map(|s| s.option_ids.iter().map(String::as_str).collect())
        .unwrap_or_default();

    let questions: Vec<QuestionView> = if status == CardSetStatus::Ready {
        questions
            .iter()
            .enumerate()
            .map(|(position, item)| {
                let hidden = policy.hides(is_locked, position);
                let text = |t: &str| if hidden { LOCKED_TEXT.to_string() } else { t.to_string() };

                let answer = submission.map(|_| AnswerView {
                    user_choice: item
                        .options
                        .iter()
                        .find(|o| chosen.contains(o.id.as_str()))
                        .map(|o| o.id.clone()),
                    correct_choice: correct_choice(&item.options).map(|o| o.id.clone()),
                });

                QuestionView {
                    id: item.question.id.clone(),
                    text: text(&item.question.text),
                    is_locked: hidden,
                    options: item
                        .options
                        .iter()
                        .map(|o| OptionView {
                            id: o.id.clone(),
                            text: text(&o.text),
                        })
                        .collect(),
                    answer,
                }
            })
            .collect()
    } else {
        Vec::new()
    };

    let score = submission.map(|_| score(&questions));

    CardSetView {
        id: card_set.id.clone(),
        status,
        created_at: card_set.created_at,
        title: card_set.title.clone(),
        required_tokens: card_set.required_tokens,
        is_locked,
        error: card_set.error.clone(),
        submission_id: submission.map(|s| s.submission.id.clone()),
        questions,
        score,
    }
}

/// Fetches what `resolve_card_set` needs and resolves the view.
pub async fn load_card_set_view(
    repo: &dyn Repository,
    card_set: &CardSet,
    submission: Option<&SubmissionWithAnswers>,
    policy: LockPolicy,
) -> RepoResult<CardSetView> {
    let questions = if derive_status(card_set) == CardSetStatus::Ready {
        repo.list_questions(&card_set.id).await?
    } else {
        Vec::new()
    };

    let redeemed = if policy.enabled {
        repo.redeemed_token_count(&card_set.id).await?
    } else {
        0
    };

    Ok(resolve_card_set(card_set, &questions, submission, redeemed, policy))
}
