// src/models/billing.rs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use validator::Validate;

/// Represents the 'payments' table. The id is the processor's payment reference.
#[derive(Debug, Clone, FromRow, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Payment {
    pub id: String,
    pub amount: i64,
    pub user_id: String,
    pub reconciliation_id: String,
    pub is_costless_refund_applied: bool,
    pub refunded_at: Option<DateTime<Utc>>,
    pub refunded_amount: Option<i64>,
    pub created_at: DateTime<Utc>,
}

/// Represents the 'tokens' table: one redeemable generation credit.
#[derive(Debug, Clone, FromRow, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Token {
    pub id: String,
    pub payment_id: String,
    pub redeemed_at: Option<DateTime<Utc>>,
    pub redeemed_by_card_set_id: Option<String>,
}

/// Values recorded when a checkout completes.
#[derive(Debug, Clone)]
pub struct NewPayment {
    pub id: String,
    pub amount: i64,
    pub user_id: String,
    pub reconciliation_id: String,
    pub is_costless_refund_applied: bool,
    pub quantity: u32,
}

/// A payment together with the number of tokens it bought.
#[derive(Debug, Clone, FromRow)]
pub struct PaymentWithTokens {
    #[sqlx(flatten)]
    pub payment: Payment,
    pub tokens: i64,
}

/// Outcome of a token reservation. Reservations are all-or-nothing:
/// `reserved` is either the requested count or zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Reservation {
    pub available: i64,
    pub reserved: i64,
}

/// DTO returned by the payments listing.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentView {
    pub id: String,
    pub amount: i64,
    pub created_at: DateTime<Utc>,
    pub refunded_at: Option<DateTime<Utc>>,
    pub tokens: i64,
    pub can_refund: bool,
}

/// DTO for starting a checkout.
#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CreateCheckoutRequest {
    #[validate(length(min = 1, max = 200))]
    pub price: String,
    #[validate(range(min = 5, max = 1000))]
    pub quantity: u32,
    #[validate(url)]
    pub next_url: String,
    #[validate(url)]
    pub cancel_url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CheckoutStatus {
    Paid,
    Unpaid,
}
