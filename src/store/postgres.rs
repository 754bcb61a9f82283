// src/store/postgres.rs

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgConnection, PgPool, Postgres, QueryBuilder, Transaction};

use super::{ProcessedChunk, RepoError, RepoResult, Repository, new_id};
use crate::{
    config::TxBudget,
    models::{
        billing::{NewPayment, Payment, PaymentWithTokens, Reservation},
        card_set::{CardSet, NewCardSet},
        question::{AnswerOption, GeneratedQuestion, Question, QuestionWithOptions},
        submission::{Submission, SubmissionLookup, SubmissionWithAnswers},
        user::User,
    },
};

const CARD_SET_COLUMNS: &str = "id, title, source_text, required_tokens, ocr_job_id, \
    prepare_started_at, ready_at, error, refunded_at, created_by_user_id, created_at";

const PAYMENT_COLUMNS: &str = "id, amount, user_id, reconciliation_id, \
    is_costless_refund_applied, refunded_at, refunded_amount, created_at";

/// `Repository` backed by PostgreSQL.
#[derive(Clone)]
pub struct PgRepository {
    pool: PgPool,
}

impl PgRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Opens a transaction whose lock waits and statements are capped by `budget`.
    async fn begin_bounded(&self, budget: TxBudget) -> RepoResult<Transaction<'static, Postgres>> {
        let mut tx = self.pool.begin().await?;

        // SET LOCAL does not take bind parameters.
        sqlx::query(&format!(
            "SET LOCAL lock_timeout = '{}ms'",
            budget.max_wait.as_millis()
        ))
        .execute(&mut *tx)
        .await?;
        sqlx::query(&format!(
            "SET LOCAL statement_timeout = '{}ms'",
            budget.timeout.as_millis()
        ))
        .execute(&mut *tx)
        .await?;

        Ok(tx)
    }

    async fn begin_preparation_tx(
        &self,
        card_set_id: &str,
        user_id: Option<&str>,
        required: i64,
        budget: TxBudget,
    ) -> RepoResult<Option<Reservation>> {
        let mut tx = self.begin_bounded(budget).await?;

        let sql = format!("SELECT {CARD_SET_COLUMNS} FROM card_sets WHERE id = $1 FOR UPDATE");
        let card_set = sqlx::query_as::<_, CardSet>(&sql)
            .bind(card_set_id)
            .fetch_optional(&mut *tx)
            .await?;

        let Some(card_set) = card_set else {
            return Ok(None);
        };
        if card_set.source_text.is_none()
            || card_set.prepare_started_at.is_some()
            || card_set.is_terminal()
        {
            return Ok(None);
        }

        sqlx::query(
            r#"
            UPDATE card_sets
            SET prepare_started_at = NOW(),
                created_by_user_id = COALESCE($2, created_by_user_id)
            WHERE id = $1
            "#,
        )
        .bind(card_set_id)
        .bind(user_id)
        .execute(&mut *tx)
        .await?;

        let reservation = match user_id {
            Some(user_id) => reserve_in_tx(&mut tx, card_set_id, user_id, required).await?,
            None => Reservation::default(),
        };

        tx.commit().await?;
        Ok(Some(reservation))
    }

    async fn reserve_tokens_tx(
        &self,
        card_set_id: &str,
        user_id: &str,
        count: i64,
        budget: TxBudget,
    ) -> RepoResult<Reservation> {
        let mut tx = self.begin_bounded(budget).await?;

        // Row lock serializes with fail_card_set and record_refund
        let open: Option<bool> = sqlx::query_scalar(
            "SELECT error IS NULL AND refunded_at IS NULL FROM card_sets WHERE id = $1 FOR UPDATE",
        )
        .bind(card_set_id)
        .fetch_optional(&mut *tx)
        .await?;
        if open != Some(true) {
            return Ok(Reservation::default());
        }

        let reservation = reserve_in_tx(&mut tx, card_set_id, user_id, count).await?;
        if reservation.reserved > 0 {
            sqlx::query("UPDATE card_sets SET created_by_user_id = $2 WHERE id = $1")
                .bind(card_set_id)
                .bind(user_id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(reservation)
    }

    async fn answers_for(&self, submission: Submission) -> RepoResult<SubmissionWithAnswers> {
        let option_ids: Vec<String> =
            sqlx::query_scalar("SELECT option_id FROM answers WHERE submission_id = $1 ORDER BY id")
                .bind(&submission.id)
                .fetch_all(&self.pool)
                .await?;

        Ok(SubmissionWithAnswers {
            submission,
            option_ids,
        })
    }
}

/// Claims `count` spendable tokens of `user_id` for the card set, or none at all.
/// Rows locked by a concurrent reservation are skipped, so two callers can never
/// redeem the same token.
async fn reserve_in_tx(
    conn: &mut PgConnection,
    card_set_id: &str,
    user_id: &str,
    count: i64,
) -> RepoResult<Reservation> {
    if count <= 0 {
        return Ok(Reservation::default());
    }

    let ids: Vec<String> = sqlx::query_scalar(
        r#"
        SELECT t.id
        FROM tokens t
        JOIN payments p ON p.id = t.payment_id
        WHERE t.redeemed_at IS NULL
          AND p.refunded_at IS NULL
          AND p.user_id = $1
        ORDER BY t.id
        LIMIT $2
        FOR UPDATE OF t SKIP LOCKED
        "#,
    )
    .bind(user_id)
    .bind(count)
    .fetch_all(&mut *conn)
    .await?;

    let available = ids.len() as i64;
    if available < count {
        return Ok(Reservation {
            available,
            reserved: 0,
        });
    }

    sqlx::query(
        "UPDATE tokens SET redeemed_at = NOW(), redeemed_by_card_set_id = $1 WHERE id = ANY($2)",
    )
    .bind(card_set_id)
    .bind(&ids)
    .execute(&mut *conn)
    .await?;

    Ok(Reservation {
        available,
        reserved: available,
    })
}

async fn release_in_tx(conn: &mut PgConnection, card_set_ids: &[String]) -> RepoResult<u64> {
    let result = sqlx::query(
        r#"
        UPDATE tokens
        SET redeemed_at = NULL, redeemed_by_card_set_id = NULL
        WHERE redeemed_by_card_set_id = ANY($1)
        "#,
    )
    .bind(card_set_ids)
    .execute(&mut *conn)
    .await?;

    Ok(result.rows_affected())
}

async fn with_timeout<T>(
    budget: TxBudget,
    work: impl Future<Output = RepoResult<T>>,
) -> RepoResult<T> {
    tokio::time::timeout(budget.timeout, work)
        .await
        .map_err(|_| RepoError::Timeout(budget.timeout))?
}

#[async_trait]
impl Repository for PgRepository {
    async fn find_or_create_user_by_email(&self, email: &str) -> RepoResult<User> {
        let user = sqlx::query_as::<_, User>(
            r#"
            INSERT INTO users (id, email)
            VALUES ($1, $2)
            ON CONFLICT (email) DO UPDATE SET email = EXCLUDED.email
            RETURNING id, email, created_at
            "#,
        )
        .bind(new_id())
        .bind(email)
        .fetch_one(&self.pool)
        .await?;

        Ok(user)
    }

    async fn find_user(&self, id: &str) -> RepoResult<Option<User>> {
        let user = sqlx::query_as::<_, User>("SELECT id, email, created_at FROM users WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(user)
    }

    async fn insert_card_set(&self, new: NewCardSet) -> RepoResult<CardSet> {
        let sql = format!(
            r#"
            INSERT INTO card_sets (id, title, source_text, required_tokens, ocr_job_id, created_by_user_id)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING {CARD_SET_COLUMNS}
            "#
        );

        let card_set = sqlx::query_as::<_, CardSet>(&sql)
            .bind(&new.id)
            .bind(&new.title)
            .bind(&new.source_text)
            .bind(new.required_tokens)
            .bind(&new.ocr_job_id)
            .bind(&new.created_by_user_id)
            .fetch_one(&self.pool)
            .await?;

        Ok(card_set)
    }

    async fn find_card_set(&self, id: &str) -> RepoResult<Option<CardSet>> {
        let sql = format!("SELECT {CARD_SET_COLUMNS} FROM card_sets WHERE id = $1");
        let card_set = sqlx::query_as::<_, CardSet>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(card_set)
    }

    async fn find_card_set_by_ocr_job(&self, job_id: &str) -> RepoResult<Option<CardSet>> {
        let sql = format!("SELECT {CARD_SET_COLUMNS} FROM card_sets WHERE ocr_job_id = $1");
        let card_set = sqlx::query_as::<_, CardSet>(&sql)
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(card_set)
    }

    async fn list_active_card_sets(&self, user_id: &str) -> RepoResult<Vec<CardSet>> {
        let sql = format!(
            r#"
            SELECT {CARD_SET_COLUMNS}
            FROM card_sets
            WHERE created_by_user_id = $1 AND refunded_at IS NULL AND error IS NULL
            ORDER BY created_at DESC
            "#
        );
        let card_sets = sqlx::query_as::<_, CardSet>(&sql)
            .bind(user_id)
            .fetch_all(&self.pool)
            .await?;

        Ok(card_sets)
    }

    async fn count_ocr_jobs_since(&self, since: DateTime<Utc>) -> RepoResult<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM card_sets WHERE ocr_job_id IS NOT NULL AND created_at >= $1",
        )
        .bind(since)
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }

    async fn attach_source_text(
        &self,
        id: &str,
        source_text: &str,
        required_tokens: i32,
    ) -> RepoResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE card_sets
            SET source_text = $2, required_tokens = $3
            WHERE id = $1 AND source_text IS NULL
            "#,
        )
        .bind(id)
        .bind(source_text)
        .bind(required_tokens)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn mark_ready(&self, id: &str) -> RepoResult<bool> {
        let result = sqlx::query(
            "UPDATE card_sets SET ready_at = NOW() WHERE id = $1 AND ready_at IS NULL AND error IS NULL",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn fail_card_set(&self, id: &str, message: &str) -> RepoResult<u64> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query("UPDATE card_sets SET error = $2 WHERE id = $1 AND ready_at IS NULL")
            .bind(id)
            .bind(message)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        let released = if updated == 1 {
            release_in_tx(&mut tx, &[id.to_string()]).await?
        } else {
            0
        };

        tx.commit().await?;
        Ok(released)
    }

    async fn begin_preparation(
        &self,
        card_set_id: &str,
        user_id: Option<&str>,
        required: i64,
        budget: TxBudget,
    ) -> RepoResult<Option<Reservation>> {
        with_timeout(
            budget,
            self.begin_preparation_tx(card_set_id, user_id, required, budget),
        )
        .await
    }

    async fn reserve_tokens(
        &self,
        card_set_id: &str,
        user_id: &str,
        count: i64,
        budget: TxBudget,
    ) -> RepoResult<Reservation> {
        with_timeout(budget, self.reserve_tokens_tx(card_set_id, user_id, count, budget)).await
    }

    async fn release_tokens(&self, card_set_id: &str) -> RepoResult<u64> {
        let mut conn = self.pool.acquire().await?;
        release_in_tx(&mut conn, &[card_set_id.to_string()]).await
    }

    async fn redeemed_token_count(&self, card_set_id: &str) -> RepoResult<i64> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*)
            FROM tokens t
            JOIN payments p ON p.id = t.payment_id
            WHERE t.redeemed_by_card_set_id = $1 AND p.refunded_at IS NULL
            "#,
        )
        .bind(card_set_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }

    async fn available_token_count(&self, user_id: &str) -> RepoResult<i64> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*)
            FROM tokens t
            JOIN payments p ON p.id = t.payment_id
            WHERE t.redeemed_at IS NULL AND p.refunded_at IS NULL AND p.user_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }

    async fn record_purchase(&self, payment: NewPayment) -> RepoResult<bool> {
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO payments (id, amount, user_id, reconciliation_id, is_costless_refund_applied)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(&payment.id)
        .bind(payment.amount)
        .bind(&payment.user_id)
        .bind(&payment.reconciliation_id)
        .bind(payment.is_costless_refund_applied)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if inserted == 0 {
            return Ok(false);
        }

        if payment.quantity > 0 {
            let mut query_builder = QueryBuilder::<Postgres>::new("INSERT INTO tokens (id, payment_id) ");
            query_builder.push_values(0..payment.quantity, |mut row, _| {
                row.push_bind(new_id()).push_bind(payment.id.clone());
            });
            query_builder.build().execute(&mut *tx).await?;
        }

        tx.commit().await?;
        Ok(true)
    }

    async fn record_refund(
        &self,
        payment_id: &str,
        refunded_at: DateTime<Utc>,
        refunded_amount: i64,
    ) -> RepoResult<bool> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            r#"
            UPDATE payments
            SET refunded_at = $2, refunded_amount = $3
            WHERE id = $1 AND refunded_at IS NULL
            "#,
        )
        .bind(payment_id)
        .bind(refunded_at)
        .bind(refunded_amount)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if updated == 0 {
            return Ok(false);
        }

        let card_set_ids: Vec<String> = sqlx::query_scalar(
            r#"
            UPDATE card_sets
            SET refunded_at = $2
            WHERE id IN (
                SELECT DISTINCT redeemed_by_card_set_id
                FROM tokens
                WHERE payment_id = $1 AND redeemed_by_card_set_id IS NOT NULL
            )
            RETURNING id
            "#,
        )
        .bind(payment_id)
        .bind(refunded_at)
        .fetch_all(&mut *tx)
        .await?;

        let released = release_in_tx(&mut tx, &card_set_ids).await?;

        tx.commit().await?;
        tracing::info!(
            "Refunded payment {}: {} card sets invalidated, {} tokens released",
            payment_id,
            card_set_ids.len(),
            released
        );
        Ok(true)
    }

    async fn find_payment(&self, id: &str) -> RepoResult<Option<Payment>> {
        let sql = format!("SELECT {PAYMENT_COLUMNS} FROM payments WHERE id = $1");
        let payment = sqlx::query_as::<_, Payment>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(payment)
    }

    async fn find_payment_by_reconciliation(
        &self,
        reconciliation_id: &str,
    ) -> RepoResult<Option<Payment>> {
        let sql = format!("SELECT {PAYMENT_COLUMNS} FROM payments WHERE reconciliation_id = $1 LIMIT 1");
        let payment = sqlx::query_as::<_, Payment>(&sql)
            .bind(reconciliation_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(payment)
    }

    async fn list_payments(&self, user_id: &str) -> RepoResult<Vec<PaymentWithTokens>> {
        let payments = sqlx::query_as::<_, PaymentWithTokens>(
            r#"
            SELECT
                p.id, p.amount, p.user_id, p.reconciliation_id, p.is_costless_refund_applied,
                p.refunded_at, p.refunded_amount, p.created_at,
                COUNT(t.id) AS tokens
            FROM payments p
            LEFT JOIN tokens t ON t.payment_id = p.id
            WHERE p.user_id = $1
            GROUP BY p.id
            ORDER BY p.created_at DESC
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(payments)
    }

    async fn find_processed_chunk(
        &self,
        card_set_id: &str,
        chunk_start: i32,
    ) -> RepoResult<Option<ProcessedChunk>> {
        let chunk = sqlx::query_as::<_, ProcessedChunk>(
            r#"
            SELECT card_set_id, chunk_start, next_context
            FROM processed_chunks
            WHERE card_set_id = $1 AND chunk_start = $2
            "#,
        )
        .bind(card_set_id)
        .bind(chunk_start)
        .fetch_optional(&self.pool)
        .await?;

        Ok(chunk)
    }

    async fn persist_chunk(
        &self,
        chunk: ProcessedChunk,
        questions: &[GeneratedQuestion],
    ) -> RepoResult<bool> {
        let mut tx = self.pool.begin().await?;

        let claimed = sqlx::query(
            r#"
            INSERT INTO processed_chunks (card_set_id, chunk_start, next_context)
            VALUES ($1, $2, $3)
            ON CONFLICT (card_set_id, chunk_start) DO NOTHING
            "#,
        )
        .bind(&chunk.card_set_id)
        .bind(chunk.chunk_start)
        .bind(&chunk.next_context)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if claimed == 0 {
            return Ok(false);
        }

        for (position, question) in questions.iter().enumerate() {
            let question_id = new_id();

            sqlx::query(
                r#"
                INSERT INTO questions (id, card_set_id, text, position, chunk_start)
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(&question_id)
            .bind(&chunk.card_set_id)
            .bind(&question.text)
            .bind(position as i32)
            .bind(chunk.chunk_start)
            .execute(&mut *tx)
            .await?;

            if question.options.is_empty() {
                continue;
            }

            let mut query_builder = QueryBuilder::<Postgres>::new(
                "INSERT INTO options (id, question_id, text, is_correct, position) ",
            );
            query_builder.push_values(question.options.iter().enumerate(), |mut row, (index, text)| {
                row.push_bind(new_id())
                    .push_bind(question_id.clone())
                    .push_bind(text.clone())
                    .push_bind(index == question.correct_index)
                    .push_bind(index as i32);
            });
            query_builder.build().execute(&mut *tx).await?;
        }

        tx.commit().await?;
        Ok(true)
    }

    async fn list_questions(&self, card_set_id: &str) -> RepoResult<Vec<QuestionWithOptions>> {
        let questions = sqlx::query_as::<_, Question>(
            r#"
            SELECT id, card_set_id, text, position, chunk_start, created_at
            FROM questions
            WHERE card_set_id = $1
            ORDER BY created_at, chunk_start, position
            "#,
        )
        .bind(card_set_id)
        .fetch_all(&self.pool)
        .await?;

        let options = sqlx::query_as::<_, AnswerOption>(
            r#"
            SELECT o.id, o.question_id, o.text, o.is_correct, o.position
            FROM options o
            JOIN questions q ON q.id = o.question_id
            WHERE q.card_set_id = $1
            ORDER BY o.question_id, o.position
            "#,
        )
        .bind(card_set_id)
        .fetch_all(&self.pool)
        .await?;

        let mut by_question: HashMap<String, Vec<AnswerOption>> = HashMap::new();
        for option in options {
            by_question
                .entry(option.question_id.clone())
                .or_default()
                .push(option);
        }

        Ok(questions
            .into_iter()
            .map(|question| {
                let options = by_question.remove(&question.id).unwrap_or_default();
                QuestionWithOptions { question, options }
            })
            .collect())
    }

    async fn option_ids(&self, card_set_id: &str) -> RepoResult<HashSet<String>> {
        let ids: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT o.id
            FROM options o
            JOIN questions q ON q.id = o.question_id
            WHERE q.card_set_id = $1
            "#,
        )
        .bind(card_set_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(ids.into_iter().collect())
    }

    async fn insert_submission(
        &self,
        card_set_id: &str,
        user_id: Option<&str>,
        option_ids: &[String],
    ) -> RepoResult<SubmissionWithAnswers> {
        let mut tx = self.pool.begin().await?;

        let submission = sqlx::query_as::<_, Submission>(
            r#"
            INSERT INTO submissions (id, card_set_id, user_id)
            VALUES ($1, $2, $3)
            RETURNING id, card_set_id, user_id, created_at
            "#,
        )
        .bind(new_id())
        .bind(card_set_id)
        .bind(user_id)
        .fetch_one(&mut *tx)
        .await?;

        if !option_ids.is_empty() {
            let mut query_builder =
                QueryBuilder::<Postgres>::new("INSERT INTO answers (submission_id, option_id) ");
            query_builder.push_values(option_ids, |mut row, option_id| {
                row.push_bind(submission.id.clone()).push_bind(option_id.clone());
            });
            query_builder.build().execute(&mut *tx).await?;
        }

        tx.commit().await?;

        Ok(SubmissionWithAnswers {
            submission,
            option_ids: option_ids.to_vec(),
        })
    }

    async fn find_submission(
        &self,
        card_set_id: &str,
        lookup: SubmissionLookup<'_>,
    ) -> RepoResult<Option<SubmissionWithAnswers>> {
        let submission = match lookup {
            SubmissionLookup::ById(id) => {
                sqlx::query_as::<_, Submission>(
                    r#"
                    SELECT id, card_set_id, user_id, created_at
                    FROM submissions
                    WHERE id = $1 AND card_set_id = $2
                    "#,
                )
                .bind(id)
                .bind(card_set_id)
                .fetch_optional(&self.pool)
                .await?
            }
            SubmissionLookup::LatestForUser(user_id) => {
                sqlx::query_as::<_, Submission>(
                    r#"
                    SELECT id, card_set_id, user_id, created_at
                    FROM submissions
                    WHERE card_set_id = $1 AND user_id = $2
                    ORDER BY created_at DESC
                    LIMIT 1
                    "#,
                )
                .bind(card_set_id)
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?
            }
        };

        match submission {
            Some(submission) => Ok(Some(self.answers_for(submission).await?)),
            None => Ok(None),
        }
    }
}
