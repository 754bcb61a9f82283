//! src/store/mod.rs
//!
//! Persistence port. Every method is atomic on its own: multi-row effects such as
//! "record the error and hand the tokens back" happen in one transaction or not at
//! all.

pub mod memory;
pub mod postgres;

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{
    config::TxBudget,
    models::{
        billing::{NewPayment, Payment, PaymentWithTokens, Reservation},
        card_set::{CardSet, NewCardSet},
        question::{GeneratedQuestion, QuestionWithOptions},
        submission::{SubmissionLookup, SubmissionWithAnswers},
        user::User,
    },
};

pub use memory::MemoryRepository;
pub use postgres::PgRepository;

#[derive(Debug, thiserror::Error)]
pub enum RepoError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("transaction did not finish within {0:?}")]
    Timeout(std::time::Duration),
}

pub type RepoResult<T> = Result<T, RepoError>;

/// A chunk the pipeline has already committed, keyed by its start position.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct ProcessedChunk {
    pub card_set_id: String,
    pub chunk_start: i32,
    /// Tail context to hand to the following chunk, if there is one.
    pub next_context: Option<String>,
}

#[async_trait]
pub trait Repository: Send + Sync {
    // --- Users ---
    async fn find_or_create_user_by_email(&self, email: &str) -> RepoResult<User>;

    async fn find_user(&self, id: &str) -> RepoResult<Option<User>>;

    // --- Card sets ---
    async fn insert_card_set(&self, new: NewCardSet) -> RepoResult<CardSet>;

    async fn find_card_set(&self, id: &str) -> RepoResult<Option<CardSet>>;

    async fn find_card_set_by_ocr_job(&self, job_id: &str) -> RepoResult<Option<CardSet>>;

    /// The user's card sets that are neither refunded nor errored, newest first.
    async fn list_active_card_sets(&self, user_id: &str) -> RepoResult<Vec<CardSet>>;

    /// Number of card sets that started an OCR job at or after `since`.
    async fn count_ocr_jobs_since(&self, since: DateTime<Utc>) -> RepoResult<i64>;

    /// Stores extracted text once. Returns false if the set already had text.
    async fn attach_source_text(
        &self,
        id: &str,
        source_text: &str,
        required_tokens: i32,
    ) -> RepoResult<bool>;

    /// Sets `ready_at` unless the set already concluded. Returns whether it changed.
    async fn mark_ready(&self, id: &str) -> RepoResult<bool>;

    /// Records `message` as the set's error and releases every token it redeemed,
    /// in one step. A set that is already ready keeps its outcome.
    /// Returns the number of released tokens.
    async fn fail_card_set(&self, id: &str, message: &str) -> RepoResult<u64>;

    // --- Token ledger ---

    /// Guarded `WAITING -> PREPARING` transition. Inside one bounded transaction:
    /// checks the set has text and was never started, stamps `prepare_started_at`,
    /// attaches `user_id` as owner, and reserves `required` of the user's tokens
    /// when enough are available. `None` means the set cannot be prepared.
    async fn begin_preparation(
        &self,
        card_set_id: &str,
        user_id: Option<&str>,
        required: i64,
        budget: TxBudget,
    ) -> RepoResult<Option<Reservation>>;

    /// Reserves `count` unredeemed tokens from the user's non-refunded payments
    /// for the card set, all or nothing, and makes the user its owner on success.
    async fn reserve_tokens(
        &self,
        card_set_id: &str,
        user_id: &str,
        count: i64,
        budget: TxBudget,
    ) -> RepoResult<Reservation>;

    /// Returns every token redeemed by the card set to its owner's balance.
    async fn release_tokens(&self, card_set_id: &str) -> RepoResult<u64>;

    /// Tokens redeemed by the card set whose payment was not refunded.
    async fn redeemed_token_count(&self, card_set_id: &str) -> RepoResult<i64>;

    async fn available_token_count(&self, user_id: &str) -> RepoResult<i64>;

    /// Creates the payment and its tokens. Returns false when the payment id is
    /// already known.
    async fn record_purchase(&self, payment: NewPayment) -> RepoResult<bool>;

    /// Marks the payment refunded, marks every card set that redeemed one of its
    /// tokens refunded and releases those sets' tokens. Returns false when the
    /// payment is unknown or was already refunded.
    async fn record_refund(
        &self,
        payment_id: &str,
        refunded_at: DateTime<Utc>,
        refunded_amount: i64,
    ) -> RepoResult<bool>;

    async fn find_payment(&self, id: &str) -> RepoResult<Option<Payment>>;

    async fn find_payment_by_reconciliation(&self, reconciliation_id: &str)
    -> RepoResult<Option<Payment>>;

    async fn list_payments(&self, user_id: &str) -> RepoResult<Vec<PaymentWithTokens>>;

    // --- Questions ---
    async fn find_processed_chunk(
        &self,
        card_set_id: &str,
        chunk_start: i32,
    ) -> RepoResult<Option<ProcessedChunk>>;

    /// Persists one chunk's questions together with its `processed_chunks` marker.
    /// Returns false, writing nothing, when the marker already exists.
    async fn persist_chunk(
        &self,
        chunk: ProcessedChunk,
        questions: &[GeneratedQuestion],
    ) -> RepoResult<bool>;

    /// Questions in arrival order (chunk, then position) with ordered options.
    async fn list_questions(&self, card_set_id: &str) -> RepoResult<Vec<QuestionWithOptions>>;

    async fn option_ids(&self, card_set_id: &str) -> RepoResult<HashSet<String>>;

    // --- Submissions ---
    async fn insert_submission(
        &self,
        card_set_id: &str,
        user_id: Option<&str>,
        option_ids: &[String],
    ) -> RepoResult<SubmissionWithAnswers>;

    async fn find_submission(
        &self,
        card_set_id: &str,
        lookup: SubmissionLookup<'_>,
    ) -> RepoResult<Option<SubmissionWithAnswers>>;
}

/// Short random identifier used for every primary key we generate.
pub fn new_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..21].to_string()
}
