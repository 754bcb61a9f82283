// src/config.rs

use std::env;
use std::str::FromStr;
use std::time::Duration;

use dotenvy::dotenv;

/// Characters covered by the first generation pass.
pub const FIRST_CHUNK_CHARS: usize = 6 * 1024;

/// Characters covered by every later generation pass.
pub const NEXT_CHUNK_CHARS: usize = 5 * 1024;

/// Generation passes bought by a single token.
pub const PASSES_PER_TOKEN: usize = 8;

/// Content types accepted by the upload endpoint.
pub const SUPPORTED_CONTENT_TYPES: [&str; 3] = [
    "application/pdf",
    "application/msword",
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
];

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub jwt_secret: String,
    /// Session lifetime in seconds.
    pub jwt_expiration: u64,
    pub rust_log: String,
    pub port: u16,

    /// Absolute base URL the scheduled-message service calls back into.
    pub public_base_url: String,

    pub openai_api_key: String,
    pub openai_base_url: String,
    pub openai_model: String,

    pub qstash_url: String,
    pub qstash_token: String,
    pub qstash_current_signing_key: String,
    pub qstash_next_signing_key: String,

    pub stripe_secret_key: String,
    pub stripe_webhook_secret: String,
    pub stripe_api_base: String,

    pub identity_secret: String,
    pub identity_issuer: Option<String>,

    pub upload_dir: String,
    pub upload_bucket: String,
    pub max_upload_bytes: usize,
    pub ocr_service_url: Option<String>,
    pub ocr_jobs_per_hour: i64,

    pub lock_preview_questions: bool,
    pub free_preview_questions: usize,
    pub refund_window_hours: i64,

    pub tx_max_wait_ms: u64,
    pub tx_timeout_ms: u64,
    pub retry_delay_secs: u64,
}

impl Config {
    pub fn from_env() -> Self {
        dotenv().ok();

        Self {
            database_url: required("DATABASE_URL"),
            jwt_secret: required("JWT_SECRET"),
            jwt_expiration: parsed("JWT_EXPIRATION", 60 * 60 * 24 * 14),
            rust_log: env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
            port: parsed("PORT", 3000),

            public_base_url: required("PUBLIC_BASE_URL"),

            openai_api_key: required("OPENAI_API_KEY"),
            openai_base_url: or_default("OPENAI_BASE_URL", "https://api.openai.com"),
            openai_model: or_default("OPENAI_MODEL", "gpt-3.5-turbo"),

            qstash_url: or_default("QSTASH_URL", "https://qstash.upstash.io"),
            qstash_token: required("QSTASH_TOKEN"),
            qstash_current_signing_key: required("QSTASH_CURRENT_SIGNING_KEY"),
            qstash_next_signing_key: required("QSTASH_NEXT_SIGNING_KEY"),

            stripe_secret_key: required("STRIPE_SECRET_KEY"),
            stripe_webhook_secret: required("STRIPE_WEBHOOK_SECRET"),
            stripe_api_base: or_default("STRIPE_API_BASE", "https://api.stripe.com"),

            identity_secret: required("IDENTITY_SECRET"),
            identity_issuer: env::var("IDENTITY_ISSUER").ok(),

            upload_dir: or_default("UPLOAD_DIR", "uploads"),
            upload_bucket: or_default("UPLOAD_BUCKET", "uploads"),
            max_upload_bytes: parsed("MAX_UPLOAD_BYTES", 20 * 1024 * 1024),
            ocr_service_url: env::var("OCR_SERVICE_URL").ok(),
            ocr_jobs_per_hour: parsed("OCR_JOBS_PER_HOUR", 200),

            lock_preview_questions: parsed("LOCK_PREVIEW_QUESTIONS", false),
            free_preview_questions: parsed("FREE_PREVIEW_QUESTIONS", 3),
            refund_window_hours: parsed("REFUND_WINDOW_HOURS", 24),

            tx_max_wait_ms: parsed("TX_MAX_WAIT_MS", 4000),
            tx_timeout_ms: parsed("TX_TIMEOUT_MS", 10000),
            retry_delay_secs: parsed("RETRY_DELAY_SECS", 5),
        }
    }

    /// Wait-for-lock and absolute limits applied to ledger transactions.
    pub fn tx_budget(&self) -> TxBudget {
        TxBudget {
            max_wait: Duration::from_millis(self.tx_max_wait_ms),
            timeout: Duration::from_millis(self.tx_timeout_ms),
        }
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }

    /// Endpoint the question builder jobs are delivered to.
    pub fn question_builder_url(&self) -> Result<url::Url, url::ParseError> {
        url::Url::parse(&self.public_base_url)?.join("/api/webhooks/question-builder")
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TxBudget {
    pub max_wait: Duration,
    pub timeout: Duration,
}

fn required(key: &str) -> String {
    env::var(key).unwrap_or_else(|_| panic!("{} must be set", key))
}

fn or_default(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parsed<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
