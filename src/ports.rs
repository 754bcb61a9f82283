//! src/ports.rs
//!
//! Contracts for the external collaborators the service talks to. Handlers and
//! services only ever see these traits; concrete clients live in `adapters/` and
//! are constructed once in `main` and injected through `AppState`.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;

//=========================================================================================
// Completion (language model)
//=========================================================================================

#[derive(Debug, thiserror::Error)]
pub enum CompletionError {
    /// The service asked us to come back later. Never terminal.
    #[error("completion service is overloaded")]
    Overloaded,
    #[error("completion request failed: {0}")]
    Failed(String),
}

#[async_trait]
pub trait CompletionService: Send + Sync {
    /// Sends one prompt and returns the raw completion text.
    async fn complete(&self, prompt: &str) -> Result<String, CompletionError>;
}

//=========================================================================================
// Scheduled messages
//=========================================================================================

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("failed to publish job: {0}")]
    Publish(String),
}

#[async_trait]
pub trait JobScheduler: Send + Sync {
    /// Publishes a JSON body for at-least-once delivery to `url`.
    async fn publish(
        &self,
        url: &str,
        body: serde_json::Value,
        delay: Option<Duration>,
    ) -> Result<(), SchedulerError>;
}

//=========================================================================================
// Object storage
//=========================================================================================

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("object not found: {0}")]
    NotFound(String),
    #[error("storage io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid object key: {0}")]
    InvalidKey(String),
}

#[async_trait]
pub trait ObjectStorage: Send + Sync {
    async fn put(&self, key: &str, content_type: &str, bytes: &[u8]) -> Result<(), StorageError>;

    /// Returns the content type recorded at upload time.
    async fn head(&self, key: &str) -> Result<String, StorageError>;

    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError>;
}

//=========================================================================================
// Document analysis (OCR)
//=========================================================================================

#[derive(Debug, thiserror::Error)]
pub enum OcrError {
    #[error("document analysis request failed: {0}")]
    Request(String),
}

/// One page of detected text for a finished job.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OcrPage {
    #[serde(default)]
    pub status_message: Option<String>,
    /// Text of the LINE blocks on this page, in reading order.
    #[serde(default)]
    pub lines: Vec<String>,
    #[serde(default)]
    pub next_token: Option<String>,
}

#[async_trait]
pub trait DocumentAnalysis: Send + Sync {
    /// Starts an asynchronous text detection job and returns its id.
    async fn start_text_detection(&self, bucket: &str, key: &str) -> Result<String, OcrError>;

    async fn text_page(&self, job_id: &str, next_token: Option<&str>) -> Result<OcrPage, OcrError>;
}

//=========================================================================================
// Payments
//=========================================================================================

#[derive(Debug, thiserror::Error)]
pub enum PaymentError {
    #[error("invalid signature: {0}")]
    InvalidSignature(String),
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
    #[error("payment processor error: {0}")]
    Upstream(String),
}

#[derive(Debug, Clone)]
pub struct CheckoutRequest {
    pub price: String,
    pub quantity: u32,
    pub success_url: String,
    pub cancel_url: String,
    pub customer_email: Option<String>,
    pub reconciliation_id: String,
    pub costless_refund: bool,
}

#[derive(Debug, Clone)]
pub struct CompletedCheckout {
    pub payment_id: Option<String>,
    pub reconciliation_id: Option<String>,
    pub email: Option<String>,
    pub amount_total: i64,
    pub quantity: Option<i64>,
    /// `None` when the session metadata could not be read.
    pub costless_refund: Option<bool>,
}

#[derive(Debug, Clone)]
pub enum PaymentEvent {
    CheckoutCompleted(CompletedCheckout),
    ChargeRefunded {
        payment_id: String,
        refunded_amount: i64,
        refunded_at: DateTime<Utc>,
    },
    Ignored(String),
}

#[derive(Debug, Clone, Copy)]
pub struct RefundReceipt {
    pub amount: i64,
    pub refunded_at: DateTime<Utc>,
}

#[async_trait]
pub trait PaymentProcessor: Send + Sync {
    /// Creates a hosted checkout and returns the URL to redirect to.
    async fn create_checkout(&self, req: CheckoutRequest) -> Result<String, PaymentError>;

    /// Verifies a signed webhook delivery and resolves it into a domain event.
    async fn parse_event(&self, payload: &str, signature: &str) -> Result<PaymentEvent, PaymentError>;

    /// Refunds the gross amount when `costless` is set, the net amount otherwise.
    async fn refund(&self, payment_id: &str, costless: bool) -> Result<RefundReceipt, PaymentError>;
}

//=========================================================================================
// Identity
//=========================================================================================

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("invalid sign-in token: {0}")]
    InvalidToken(String),
    #[error("sign-in is too old")]
    Stale,
}

#[derive(Debug, Clone)]
pub struct VerifiedIdentity {
    pub email: String,
    pub auth_time: DateTime<Utc>,
}

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn verify_sign_in_token(&self, token: &str) -> Result<VerifiedIdentity, IdentityError>;
}
