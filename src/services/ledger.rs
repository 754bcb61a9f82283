// src/services/ledger.rs

//! Token bookkeeping on top of the repository: purchases, refunds, and the two ways
//! a card set gets paid for (`prepare` and `unlock`).

use chrono::{DateTime, Duration, Utc};

use crate::{
    config::TxBudget,
    error::AppError,
    models::{
        billing::{NewPayment, Payment},
        card_set::{CardSet, TokenUseResponse},
    },
    ports::{CompletedCheckout, PaymentProcessor},
    store::{RepoResult, Repository},
};

/// Why a refund request was turned down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefundDenied {
    NotOwner,
    WindowClosed,
}

/// Decides whether `user_id` may refund `payment` at `now`.
/// `Ok(false)` means the payment is already refunded and nothing needs doing.
pub fn refund_eligibility(
    payment: &Payment,
    user_id: Option<&str>,
    now: DateTime<Utc>,
    window_hours: i64,
) -> Result<bool, RefundDenied> {
    if user_id != Some(payment.user_id.as_str()) {
        return Err(RefundDenied::NotOwner);
    }
    if payment.refunded_at.is_some() {
        return Ok(false);
    }
    if !within_window(payment, now, window_hours) {
        return Err(RefundDenied::WindowClosed);
    }
    Ok(true)
}

/// Shown next to each payment in the listing.
pub fn can_refund(payment: &Payment, now: DateTime<Utc>, window_hours: i64) -> bool {
    payment.refunded_at.is_none() && within_window(payment, now, window_hours)
}

fn within_window(payment: &Payment, now: DateTime<Utc>, window_hours: i64) -> bool {
    now - payment.created_at < Duration::hours(window_hours)
}

/// Starts preparation of a card set: the guarded `WAITING -> PREPARING` step plus
/// the reservation of its tokens. Returns how many tokens were redeemed, which is
/// zero when the caller is anonymous or short on balance.
pub async fn prepare(
    repo: &dyn Repository,
    card_set: &CardSet,
    user_id: Option<&str>,
    budget: TxBudget,
) -> Result<i64, AppError> {
    let reservation = repo
        .begin_preparation(
            &card_set.id,
            user_id,
            i64::from(card_set.required_tokens),
            budget,
        )
        .await
        .map_err(|e| {
            tracing::error!("Failed to start preparation of {}: {:?}", card_set.id, e);
            AppError::from(e)
        })?
        .ok_or_else(|| AppError::BadRequest("This card set cannot be prepared".to_string()))?;

    Ok(reservation.reserved)
}

/// Pays for a card set that was generated without (enough) tokens.
/// Anonymous callers and callers without enough balance get the number of tokens
/// still missing and nothing changes.
pub async fn unlock(
    repo: &dyn Repository,
    card_set: &CardSet,
    user_id: Option<&str>,
    budget: TxBudget,
) -> Result<TokenUseResponse, AppError> {
    if card_set.refunded_at.is_some() {
        return Err(AppError::NotFound("Card set not found".to_string()));
    }
    if card_set.error.is_some() {
        return Err(AppError::BadRequest(
            "This card set cannot be unlocked".to_string(),
        ));
    }
    if !card_set.is_owned_by(user_id) {
        return Err(AppError::Forbidden(
            "You don't have the permissions to unlock this card set".to_string(),
        ));
    }

    let required = i64::from(card_set.required_tokens);
    let shortfall = required - repo.redeemed_token_count(&card_set.id).await?;
    if shortfall <= 0 {
        return Ok(TokenUseResponse::used(0));
    }

    let Some(user_id) = user_id else {
        return Ok(TokenUseResponse::short(required));
    };

    let reservation = repo
        .reserve_tokens(&card_set.id, user_id, shortfall, budget)
        .await?;

    if reservation.reserved < shortfall {
        return Ok(TokenUseResponse::short(shortfall - reservation.available));
    }

    tracing::info!(
        card_set_id = %card_set.id,
        user_id,
        tokens = reservation.reserved,
        "Unlocked card set"
    );
    Ok(TokenUseResponse::used(reservation.reserved))
}

/// Outcome of a completed checkout notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PurchaseOutcome {
    Recorded { payment_id: String, tokens: u32 },
    AlreadyRecorded,
    Ignored(&'static str),
}

/// Turns a completed checkout into a payment with its tokens. Idempotent on the
/// processor's payment id.
pub async fn purchase(
    repo: &dyn Repository,
    checkout: CompletedCheckout,
) -> Result<PurchaseOutcome, AppError> {
    let Some(payment_id) = checkout.payment_id else {
        tracing::warn!("Checkout completed without a payment reference");
        return Ok(PurchaseOutcome::Ignored("missing payment reference"));
    };
    let Some(reconciliation_id) = checkout.reconciliation_id else {
        tracing::warn!("Payment is missing reconciliation id: {}", payment_id);
        return Ok(PurchaseOutcome::Ignored("missing reconciliation id"));
    };
    let Some(quantity) = checkout
        .quantity
        .filter(|q| *q > 0)
        .and_then(|q| u32::try_from(q).ok())
    else {
        tracing::warn!("Payment is missing line item information: {}", payment_id);
        return Ok(PurchaseOutcome::Ignored("missing line item quantity"));
    };
    let email = checkout.email.ok_or_else(|| {
        tracing::error!("Checkout {} has no customer email", payment_id);
        AppError::InternalServerError(format!("No customer email for payment {}", payment_id))
    })?;
    let costless_refund = checkout.costless_refund.ok_or_else(|| {
        AppError::InternalServerError(format!("Incorrect metadata for payment {}", payment_id))
    })?;

    // Sessions are keyed by the lowercased email the identity provider returns.
    let user = repo
        .find_or_create_user_by_email(&email.to_lowercase())
        .await?;

    let created = repo
        .record_purchase(NewPayment {
            id: payment_id.clone(),
            amount: checkout.amount_total,
            user_id: user.id,
            reconciliation_id,
            is_costless_refund_applied: costless_refund,
            quantity,
        })
        .await?;

    if !created {
        tracing::warn!("Already handled payment: {}", payment_id);
        return Ok(PurchaseOutcome::AlreadyRecorded);
    }

    tracing::info!("Recorded payment {} with {} tokens", payment_id, quantity);
    Ok(PurchaseOutcome::Recorded {
        payment_id,
        tokens: quantity,
    })
}

/// Refunds `payment` through the processor and then applies the refund cascade.
/// The gross amount is returned when the purchase carried the costless-refund flag.
pub async fn refund(
    repo: &dyn Repository,
    processor: &dyn PaymentProcessor,
    payment: &Payment,
) -> Result<(), AppError> {
    let receipt = processor
        .refund(&payment.id, payment.is_costless_refund_applied)
        .await
        .map_err(|e| {
            tracing::error!("Refund of {} failed at the processor: {}", payment.id, e);
            AppError::InternalServerError("Error communicating with the payment processor".into())
        })?;

    apply_refund(repo, &payment.id, receipt.refunded_at, receipt.amount).await?;
    Ok(())
}

/// Ledger side of a refund. No-op for unknown or already refunded payments.
pub async fn apply_refund(
    repo: &dyn Repository,
    payment_id: &str,
    refunded_at: DateTime<Utc>,
    refunded_amount: i64,
) -> RepoResult<bool> {
    let applied = repo
        .record_refund(payment_id, refunded_at, refunded_amount)
        .await?;
    if applied {
        tracing::info!("Refunded all tokens with payment ID {}", payment_id);
    }
    Ok(applied)
}
