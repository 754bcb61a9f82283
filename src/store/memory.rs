// src/store/memory.rs

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use super::{ProcessedChunk, RepoResult, Repository, new_id};
use crate::{
    config::TxBudget,
    models::{
        billing::{NewPayment, Payment, PaymentWithTokens, Reservation, Token},
        card_set::{CardSet, NewCardSet},
        question::{AnswerOption, GeneratedQuestion, Question, QuestionWithOptions},
        submission::{Submission, SubmissionLookup, SubmissionWithAnswers},
        user::User,
    },
};

/// `Repository` kept in process memory. A single lock around all tables gives every
/// method the same all-or-nothing behaviour as the Postgres transactions.
#[derive(Default)]
pub struct MemoryRepository {
    inner: Mutex<Tables>,
}

#[derive(Default)]
struct Tables {
    users: Vec<User>,
    card_sets: Vec<CardSet>,
    questions: Vec<Question>,
    options: Vec<AnswerOption>,
    processed_chunks: Vec<ProcessedChunk>,
    payments: Vec<Payment>,
    tokens: Vec<Token>,
    submissions: Vec<SubmissionWithAnswers>,
}

impl Tables {
    fn card_set_mut(&mut self, id: &str) -> Option<&mut CardSet> {
        self.card_sets.iter_mut().find(|c| c.id == id)
    }

    fn payment_refunded(&self, payment_id: &str) -> bool {
        self.payments
            .iter()
            .find(|p| p.id == payment_id)
            .is_none_or(|p| p.refunded_at.is_some())
    }

    fn spendable_token_ids(&self, user_id: &str, limit: usize) -> Vec<String> {
        let owned: HashSet<&str> = self
            .payments
            .iter()
            .filter(|p| p.user_id == user_id && p.refunded_at.is_none())
            .map(|p| p.id.as_str())
            .collect();

        let mut ids: Vec<String> = self
            .tokens
            .iter()
            .filter(|t| t.redeemed_at.is_none() && owned.contains(t.payment_id.as_str()))
            .map(|t| t.id.clone())
            .collect();
        ids.sort();
        ids.truncate(limit);
        ids
    }

    fn reserve(&mut self, card_set_id: &str, user_id: &str, count: i64) -> Reservation {
        if count <= 0 {
            return Reservation::default();
        }

        let ids: HashSet<String> = self
            .spendable_token_ids(user_id, count as usize)
            .into_iter()
            .collect();
        let available = ids.len() as i64;
        if available < count {
            return Reservation {
                available,
                reserved: 0,
            };
        }

        let now = Utc::now();
        for token in self.tokens.iter_mut().filter(|t| ids.contains(&t.id)) {
            token.redeemed_at = Some(now);
            token.redeemed_by_card_set_id = Some(card_set_id.to_string());
        }

        Reservation {
            available,
            reserved: available,
        }
    }

    fn release(&mut self, card_set_ids: &HashSet<String>) -> u64 {
        let mut released = 0;
        for token in self.tokens.iter_mut() {
            let tied = token
                .redeemed_by_card_set_id
                .as_ref()
                .is_some_and(|id| card_set_ids.contains(id));
            if tied {
                token.redeemed_at = None;
                token.redeemed_by_card_set_id = None;
                released += 1;
            }
        }
        released
    }
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every token row, for assertions in tests.
    pub async fn tokens(&self) -> Vec<Token> {
        self.inner.lock().await.tokens.clone()
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn find_or_create_user_by_email(&self, email: &str) -> RepoResult<User> {
        let mut tables = self.inner.lock().await;
        if let Some(user) = tables.users.iter().find(|u| u.email == email) {
            return Ok(user.clone());
        }

        let user = User {
            id: new_id(),
            email: email.to_string(),
            created_at: Utc::now(),
        };
        tables.users.push(user.clone());
        Ok(user)
    }

    async fn find_user(&self, id: &str) -> RepoResult<Option<User>> {
        let tables = self.inner.lock().await;
        Ok(tables.users.iter().find(|u| u.id == id).cloned())
    }

    async fn insert_card_set(&self, new: NewCardSet) -> RepoResult<CardSet> {
        let card_set = CardSet {
            id: new.id,
            title: new.title,
            source_text: new.source_text,
            required_tokens: new.required_tokens,
            ocr_job_id: new.ocr_job_id,
            prepare_started_at: None,
            ready_at: None,
            error: None,
            refunded_at: None,
            created_by_user_id: new.created_by_user_id,
            created_at: Utc::now(),
        };

        self.inner.lock().await.card_sets.push(card_set.clone());
        Ok(card_set)
    }

    async fn find_card_set(&self, id: &str) -> RepoResult<Option<CardSet>> {
        let tables = self.inner.lock().await;
        Ok(tables.card_sets.iter().find(|c| c.id == id).cloned())
    }

    async fn find_card_set_by_ocr_job(&self, job_id: &str) -> RepoResult<Option<CardSet>> {
        let tables = self.inner.lock().await;
        Ok(tables
            .card_sets
            .iter()
            .find(|c| c.ocr_job_id.as_deref() == Some(job_id))
            .cloned())
    }

    async fn list_active_card_sets(&self, user_id: &str) -> RepoResult<Vec<CardSet>> {
        let tables = self.inner.lock().await;
        let mut card_sets: Vec<CardSet> = tables
            .card_sets
            .iter()
            .filter(|c| {
                c.created_by_user_id.as_deref() == Some(user_id)
                    && c.refunded_at.is_none()
                    && c.error.is_none()
            })
            .cloned()
            .collect();
        card_sets.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(card_sets)
    }

    async fn count_ocr_jobs_since(&self, since: DateTime<Utc>) -> RepoResult<i64> {
        let tables = self.inner.lock().await;
        Ok(tables
            .card_sets
            .iter()
            .filter(|c| c.ocr_job_id.is_some() && c.created_at >= since)
            .count() as i64)
    }

    async fn attach_source_text(
        &self,
        id: &str,
        source_text: &str,
        required_tokens: i32,
    ) -> RepoResult<bool> {
        let mut tables = self.inner.lock().await;
        match tables.card_set_mut(id) {
            Some(card_set) if card_set.source_text.is_none() => {
                card_set.source_text = Some(source_text.to_string());
                card_set.required_tokens = required_tokens;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn mark_ready(&self, id: &str) -> RepoResult<bool> {
        let mut tables = self.inner.lock().await;
        match tables.card_set_mut(id) {
            Some(card_set) if card_set.ready_at.is_none() && card_set.error.is_none() => {
                card_set.ready_at = Some(Utc::now());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn fail_card_set(&self, id: &str, message: &str) -> RepoResult<u64> {
        let mut tables = self.inner.lock().await;
        match tables.card_set_mut(id) {
            Some(card_set) if card_set.ready_at.is_none() => {
                card_set.error = Some(message.to_string());
            }
            _ => return Ok(0),
        }

        Ok(tables.release(&HashSet::from([id.to_string()])))
    }

    async fn begin_preparation(
        &self,
        card_set_id: &str,
        user_id: Option<&str>,
        required: i64,
        _budget: TxBudget,
    ) -> RepoResult<Option<Reservation>> {
        let mut tables = self.inner.lock().await;

        let Some(card_set) = tables.card_set_mut(card_set_id) else {
            return Ok(None);
        };
        if card_set.source_text.is_none()
            || card_set.prepare_started_at.is_some()
            || card_set.is_terminal()
        {
            return Ok(None);
        }

        card_set.prepare_started_at = Some(Utc::now());
        if let Some(user_id) = user_id {
            card_set.created_by_user_id = Some(user_id.to_string());
        }

        let reservation = match user_id {
            Some(user_id) => tables.reserve(card_set_id, user_id, required),
            None => Reservation::default(),
        };
        Ok(Some(reservation))
    }

    async fn reserve_tokens(
        &self,
        card_set_id: &str,
        user_id: &str,
        count: i64,
        _budget: TxBudget,
    ) -> RepoResult<Reservation> {
        let mut tables = self.inner.lock().await;

        let open = tables
            .card_set_mut(card_set_id)
            .is_some_and(|c| c.error.is_none() && c.refunded_at.is_none());
        if !open {
            return Ok(Reservation::default());
        }

        let reservation = tables.reserve(card_set_id, user_id, count);
        if reservation.reserved > 0 {
            if let Some(card_set) = tables.card_set_mut(card_set_id) {
                card_set.created_by_user_id = Some(user_id.to_string());
            }
        }
        Ok(reservation)
    }

    async fn release_tokens(&self, card_set_id: &str) -> RepoResult<u64> {
        let mut tables = self.inner.lock().await;
        Ok(tables.release(&HashSet::from([card_set_id.to_string()])))
    }

    async fn redeemed_token_count(&self, card_set_id: &str) -> RepoResult<i64> {
        let tables = self.inner.lock().await;
        Ok(tables
            .tokens
            .iter()
            .filter(|t| t.redeemed_by_card_set_id.as_deref() == Some(card_set_id))
            .filter(|t| !tables.payment_refunded(&t.payment_id))
            .count() as i64)
    }

    async fn available_token_count(&self, user_id: &str) -> RepoResult<i64> {
        let tables = self.inner.lock().await;
        Ok(tables.spendable_token_ids(user_id, usize::MAX).len() as i64)
    }

    async fn record_purchase(&self, payment: NewPayment) -> RepoResult<bool> {
        let mut tables = self.inner.lock().await;
        if tables.payments.iter().any(|p| p.id == payment.id) {
            return Ok(false);
        }

        tables.payments.push(Payment {
            id: payment.id.clone(),
            amount: payment.amount,
            user_id: payment.user_id,
            reconciliation_id: payment.reconciliation_id,
            is_costless_refund_applied: payment.is_costless_refund_applied,
            refunded_at: None,
            refunded_amount: None,
            created_at: Utc::now(),
        });
        for _ in 0..payment.quantity {
            tables.tokens.push(Token {
                id: new_id(),
                payment_id: payment.id.clone(),
                redeemed_at: None,
                redeemed_by_card_set_id: None,
            });
        }
        Ok(true)
    }

    async fn record_refund(
        &self,
        payment_id: &str,
        refunded_at: DateTime<Utc>,
        refunded_amount: i64,
    ) -> RepoResult<bool> {
        let mut tables = self.inner.lock().await;

        match tables.payments.iter_mut().find(|p| p.id == payment_id) {
            Some(payment) if payment.refunded_at.is_none() => {
                payment.refunded_at = Some(refunded_at);
                payment.refunded_amount = Some(refunded_amount);
            }
            _ => return Ok(false),
        }

        let funded: HashSet<String> = tables
            .tokens
            .iter()
            .filter(|t| t.payment_id == payment_id)
            .filter_map(|t| t.redeemed_by_card_set_id.clone())
            .collect();

        for card_set in tables.card_sets.iter_mut().filter(|c| funded.contains(&c.id)) {
            card_set.refunded_at = Some(refunded_at);
        }
        tables.release(&funded);
        Ok(true)
    }

    async fn find_payment(&self, id: &str) -> RepoResult<Option<Payment>> {
        let tables = self.inner.lock().await;
        Ok(tables.payments.iter().find(|p| p.id == id).cloned())
    }

    async fn find_payment_by_reconciliation(
        &self,
        reconciliation_id: &str,
    ) -> RepoResult<Option<Payment>> {
        let tables = self.inner.lock().await;
        Ok(tables
            .payments
            .iter()
            .find(|p| p.reconciliation_id == reconciliation_id)
            .cloned())
    }

    async fn list_payments(&self, user_id: &str) -> RepoResult<Vec<PaymentWithTokens>> {
        let tables = self.inner.lock().await;
        let mut payments: Vec<PaymentWithTokens> = tables
            .payments
            .iter()
            .filter(|p| p.user_id == user_id)
            .map(|p| PaymentWithTokens {
                payment: p.clone(),
                tokens: tables.tokens.iter().filter(|t| t.payment_id == p.id).count() as i64,
            })
            .collect();
        payments.sort_by(|a, b| b.payment.created_at.cmp(&a.payment.created_at));
        Ok(payments)
    }

    async fn find_processed_chunk(
        &self,
        card_set_id: &str,
        chunk_start: i32,
    ) -> RepoResult<Option<ProcessedChunk>> {
        let tables = self.inner.lock().await;
        Ok(tables
            .processed_chunks
            .iter()
            .find(|c| c.card_set_id == card_set_id && c.chunk_start == chunk_start)
            .cloned())
    }

    async fn persist_chunk(
        &self,
        chunk: ProcessedChunk,
        questions: &[GeneratedQuestion],
    ) -> RepoResult<bool> {
        let mut tables = self.inner.lock().await;
        let duplicate = tables
            .processed_chunks
            .iter()
            .any(|c| c.card_set_id == chunk.card_set_id && c.chunk_start == chunk.chunk_start);
        if duplicate {
            return Ok(false);
        }

        let now = Utc::now();
        for (position, generated) in questions.iter().enumerate() {
            let question_id = new_id();
            tables.questions.push(Question {
                id: question_id.clone(),
                card_set_id: chunk.card_set_id.clone(),
                text: generated.text.clone(),
                index: position as i32,
                chunk_start: chunk.chunk_start,
                created_at: now,
            });
            for (index, text) in generated.options.iter().enumerate() {
                tables.options.push(AnswerOption {
                    id: new_id(),
                    question_id: question_id.clone(),
                    text: text.clone(),
                    is_correct: index == generated.correct_index,
                    index: index as i32,
                });
            }
        }
        tables.processed_chunks.push(chunk);
        Ok(true)
    }

    async fn list_questions(&self, card_set_id: &str) -> RepoResult<Vec<QuestionWithOptions>> {
        let tables = self.inner.lock().await;

        let mut questions: Vec<&Question> = tables
            .questions
            .iter()
            .filter(|q| q.card_set_id == card_set_id)
            .collect();
        questions.sort_by_key(|q| (q.created_at, q.chunk_start, q.index));

        Ok(questions
            .into_iter()
            .map(|question| {
                let mut options: Vec<AnswerOption> = tables
                    .options
                    .iter()
                    .filter(|o| o.question_id == question.id)
                    .cloned()
                    .collect();
                options.sort_by_key(|o| o.index);
                QuestionWithOptions {
                    question: question.clone(),
                    options,
                }
            })
            .collect())
    }

    async fn option_ids(&self, card_set_id: &str) -> RepoResult<HashSet<String>> {
        let tables = self.inner.lock().await;
        let question_ids: HashSet<&str> = tables
            .questions
            .iter()
            .filter(|q| q.card_set_id == card_set_id)
            .map(|q| q.id.as_str())
            .collect();

        Ok(tables
            .options
            .iter()
            .filter(|o| question_ids.contains(o.question_id.as_str()))
            .map(|o| o.id.clone())
            .collect())
    }

    async fn insert_submission(
        &self,
        card_set_id: &str,
        user_id: Option<&str>,
        option_ids: &[String],
    ) -> RepoResult<SubmissionWithAnswers> {
        let record = SubmissionWithAnswers {
            submission: Submission {
                id: new_id(),
                card_set_id: card_set_id.to_string(),
                user_id: user_id.map(str::to_string),
                created_at: Utc::now(),
            },
            option_ids: option_ids.to_vec(),
        };

        self.inner.lock().await.submissions.push(record.clone());
        Ok(record)
    }

    async fn find_submission(
        &self,
        card_set_id: &str,
        lookup: SubmissionLookup<'_>,
    ) -> RepoResult<Option<SubmissionWithAnswers>> {
        let tables = self.inner.lock().await;
        let for_set = tables
            .submissions
            .iter()
            .filter(|s| s.submission.card_set_id == card_set_id);

        let found = match lookup {
            SubmissionLookup::ById(id) => for_set.filter(|s| s.submission.id == id).last(),
            SubmissionLookup::LatestForUser(user_id) => for_set
                .filter(|s| s.submission.user_id.as_deref() == Some(user_id))
                .max_by_key(|s| s.submission.created_at),
        };
        Ok(found.cloned())
    }
}
