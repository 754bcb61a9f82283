// tests/common/mod.rs

//! Test harness: the real router over an in-memory repository, with recording
//! fakes for every external service.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use jsonwebtoken::{EncodingKey, Header, encode};
use quizforge::{
    adapters::{identity::JwtIdentityProvider, storage::FsObjectStorage},
    config::Config,
    models::{billing::NewPayment, card_set::NewCardSet, user::User},
    ports::{
        CheckoutRequest, CompletionError, CompletionService, DocumentAnalysis, JobScheduler,
        OcrError, OcrPage, PaymentError, PaymentEvent, PaymentProcessor, RefundReceipt,
        SchedulerError,
    },
    routes,
    services::pipeline::ChunkJob,
    state::AppState,
    store::{MemoryRepository, Repository, new_id},
    utils::signature::{body_hash, stripe_signature, verify_stripe},
};
use serde_json::{Value, json};
use tokio::sync::Mutex;

pub const JWT_SECRET: &str = "test_secret_for_integration_tests";
pub const IDENTITY_SECRET: &str = "identity_secret_for_tests";
pub const QSTASH_CURRENT_KEY: &str = "qstash_current_key";
pub const QSTASH_NEXT_KEY: &str = "qstash_next_key";
pub const STRIPE_WEBHOOK_SECRET: &str = "whsec_test";

/// A completion with `count` questions whose first option is correct.
pub fn generation(count: usize, incomplete_chunk: Option<&str>) -> String {
    let questions: Vec<Value> = (0..count)
        .map(|i| json!({ "q": format!("Question {}", i + 1), "o": ["right", "wrong", "also wrong"], "a": 0 }))
        .collect();

    let mut body = json!({ "d": questions });
    if let Some(ic) = incomplete_chunk {
        body["ic"] = json!(ic);
    }
    body.to_string()
}

//=========================================================================================
// Fakes
//=========================================================================================

/// Replays queued responses in order, then keeps answering with two questions.
#[derive(Default)]
pub struct ScriptedCompletion {
    responses: Mutex<VecDeque<Result<String, CompletionError>>>,
    pub prompts: Mutex<Vec<String>>,
}

impl ScriptedCompletion {
    pub async fn push(&self, response: Result<String, CompletionError>) {
        self.responses.lock().await.push_back(response);
    }
}

#[async_trait]
impl CompletionService for ScriptedCompletion {
    async fn complete(&self, prompt: &str) -> Result<String, CompletionError> {
        self.prompts.lock().await.push(prompt.to_string());
        self.responses
            .lock()
            .await
            .pop_front()
            .unwrap_or_else(|| Ok(generation(2, Some("tail"))))
    }
}

#[derive(Debug, Clone)]
pub struct Published {
    pub url: String,
    pub body: Value,
    pub delay: Option<Duration>,
}

/// Keeps every published job instead of sending it.
#[derive(Default)]
pub struct RecordingScheduler {
    pub published: Mutex<Vec<Published>>,
    pub fail: AtomicBool,
}

impl RecordingScheduler {
    pub async fn take(&self) -> Vec<Published> {
        std::mem::take(&mut *self.published.lock().await)
    }
}

#[async_trait]
impl JobScheduler for RecordingScheduler {
    async fn publish(
        &self,
        url: &str,
        body: Value,
        delay: Option<Duration>,
    ) -> Result<(), SchedulerError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(SchedulerError::Publish("scheduler unavailable".to_string()));
        }
        self.published.lock().await.push(Published {
            url: url.to_string(),
            body,
            delay,
        });
        Ok(())
    }
}

/// OCR jobs whose pages are set up by the test.
#[derive(Default)]
pub struct FakeOcr {
    pub started: Mutex<Vec<(String, String)>>,
    pub pages: Mutex<HashMap<Option<String>, OcrPage>>,
    counter: AtomicUsize,
}

#[async_trait]
impl DocumentAnalysis for FakeOcr {
    async fn start_text_detection(&self, bucket: &str, key: &str) -> Result<String, OcrError> {
        self.started
            .lock()
            .await
            .push((bucket.to_string(), key.to_string()));
        Ok(format!("job-{}", self.counter.fetch_add(1, Ordering::SeqCst)))
    }

    async fn text_page(&self, _job_id: &str, next_token: Option<&str>) -> Result<OcrPage, OcrError> {
        Ok(self
            .pages
            .lock()
            .await
            .get(&next_token.map(str::to_string))
            .cloned()
            .unwrap_or_default())
    }
}

/// Verifies webhook signatures for real, then hands out the queued event.
#[derive(Default)]
pub struct FakePayments {
    pub events: Mutex<VecDeque<PaymentEvent>>,
    pub checkouts: Mutex<Vec<CheckoutRequest>>,
    pub refunds: Mutex<Vec<(String, bool)>>,
}

#[async_trait]
impl PaymentProcessor for FakePayments {
    async fn create_checkout(&self, req: CheckoutRequest) -> Result<String, PaymentError> {
        let url = format!("https://checkout.test/{}", req.reconciliation_id);
        self.checkouts.lock().await.push(req);
        Ok(url)
    }

    async fn parse_event(&self, payload: &str, signature: &str) -> Result<PaymentEvent, PaymentError> {
        verify_stripe(payload, signature, STRIPE_WEBHOOK_SECRET, Utc::now().timestamp())
            .map_err(|e| PaymentError::InvalidSignature(e.to_string()))?;
        Ok(self
            .events
            .lock()
            .await
            .pop_front()
            .unwrap_or_else(|| PaymentEvent::Ignored("unknown".to_string())))
    }

    async fn refund(&self, payment_id: &str, costless: bool) -> Result<RefundReceipt, PaymentError> {
        self.refunds
            .lock()
            .await
            .push((payment_id.to_string(), costless));
        Ok(RefundReceipt {
            amount: 900,
            refunded_at: Utc::now(),
        })
    }
}

//=========================================================================================
// App
//=========================================================================================

pub struct TestApp {
    pub address: String,
    pub client: reqwest::Client,
    pub config: Config,
    pub repo: Arc<MemoryRepository>,
    pub completion: Arc<ScriptedCompletion>,
    pub scheduler: Arc<RecordingScheduler>,
    pub ocr: Arc<FakeOcr>,
    pub payments: Arc<FakePayments>,
    _uploads: tempfile::TempDir,
}

pub fn test_config() -> Config {
    Config {
        database_url: "postgres://unused".to_string(),
        jwt_secret: JWT_SECRET.to_string(),
        jwt_expiration: 600, // 10 minutes for tests
        rust_log: "error".to_string(),
        port: 0,
        public_base_url: "http://quiz.test".to_string(),
        openai_api_key: "sk-test".to_string(),
        openai_base_url: "http://openai.test".to_string(),
        openai_model: "test-model".to_string(),
        qstash_url: "http://qstash.test".to_string(),
        qstash_token: "qstash-token".to_string(),
        qstash_current_signing_key: QSTASH_CURRENT_KEY.to_string(),
        qstash_next_signing_key: QSTASH_NEXT_KEY.to_string(),
        stripe_secret_key: "sk_test".to_string(),
        stripe_webhook_secret: STRIPE_WEBHOOK_SECRET.to_string(),
        stripe_api_base: "http://stripe.test".to_string(),
        identity_secret: IDENTITY_SECRET.to_string(),
        identity_issuer: None,
        upload_dir: "unused".to_string(),
        upload_bucket: "uploads".to_string(),
        max_upload_bytes: 1024 * 1024,
        ocr_service_url: Some("http://ocr.test".to_string()),
        ocr_jobs_per_hour: 2,
        lock_preview_questions: false,
        free_preview_questions: 3,
        refund_window_hours: 24,
        tx_max_wait_ms: 1000,
        tx_timeout_ms: 2000,
        retry_delay_secs: 5,
    }
}

/// Spawns the app on a random port.
pub async fn spawn_app() -> TestApp {
    spawn_app_with(test_config()).await
}

pub async fn spawn_app_with(config: Config) -> TestApp {
    let uploads = tempfile::tempdir().expect("Failed to create upload dir");

    let repo = Arc::new(MemoryRepository::new());
    let completion = Arc::new(ScriptedCompletion::default());
    let scheduler = Arc::new(RecordingScheduler::default());
    let ocr = Arc::new(FakeOcr::default());
    let payments = Arc::new(FakePayments::default());

    let state = AppState {
        config: config.clone(),
        repo: repo.clone(),
        completion: completion.clone(),
        scheduler: scheduler.clone(),
        storage: Arc::new(FsObjectStorage::new(uploads.path()).expect("Failed to open storage")),
        ocr: Some(ocr.clone()),
        payments: payments.clone(),
        identity: Arc::new(JwtIdentityProvider::new(IDENTITY_SECRET.to_string(), None)),
    };

    let app = routes::create_router(state);

    // Bind to port 0 to get a random available port
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind random port");
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    TestApp {
        address: format!("http://127.0.0.1:{}", port),
        client: reqwest::Client::new(),
        config,
        repo,
        completion,
        scheduler,
        ocr,
        payments,
        _uploads: uploads,
    }
}

impl TestApp {
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.address, path)
    }

    /// Opens a session for `email` and returns the bearer token.
    pub async fn sign_in(&self, email: &str) -> String {
        let now = Utc::now().timestamp();
        let id_token = encode(
            &Header::default(),
            &json!({ "email": email, "auth_time": now, "exp": now + 600 }),
            &EncodingKey::from_secret(IDENTITY_SECRET.as_bytes()),
        )
        .unwrap();

        let response = self
            .client
            .post(self.url("/api/auth/session"))
            .json(&json!({ "idToken": id_token }))
            .send()
            .await
            .expect("Failed to execute request");
        assert_eq!(response.status().as_u16(), 200);

        let body: Value = response.json().await.unwrap();
        body["token"].as_str().unwrap().to_string()
    }

    pub async fn user(&self, email: &str) -> User {
        self.repo.find_or_create_user_by_email(email).await.unwrap()
    }

    /// Records a paid checkout of `quantity` tokens for `email`; returns the payment id.
    pub async fn buy_tokens(&self, email: &str, quantity: u32) -> String {
        let user = self.user(email).await;
        let payment_id = format!("pi_{}", new_id());
        self.repo
            .record_purchase(NewPayment {
                id: payment_id.clone(),
                amount: 1000,
                user_id: user.id,
                reconciliation_id: new_id(),
                is_costless_refund_applied: false,
                quantity,
            })
            .await
            .unwrap();
        payment_id
    }

    /// Inserts a card set whose text is already known.
    pub async fn seed_card_set(&self, source_text: &str, owner: Option<&str>) -> String {
        let owner_id = match owner {
            Some(email) => Some(self.user(email).await.id),
            None => None,
        };
        let card_set = self
            .repo
            .insert_card_set(NewCardSet {
                id: new_id(),
                title: "Biology".to_string(),
                source_text: Some(source_text.to_string()),
                required_tokens: quizforge::services::chunking::calculate_required_tokens(
                    source_text.chars().count(),
                ),
                ocr_job_id: None,
                created_by_user_id: owner_id,
            })
            .await
            .unwrap();
        card_set.id
    }

    pub async fn prepare(&self, card_set_id: &str, token: Option<&str>) -> reqwest::Response {
        let mut request = self
            .client
            .post(self.url(&format!("/api/card-sets/{}/prepare", card_set_id)));
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }
        request.send().await.expect("Failed to execute request")
    }

    pub async fn get_card_set(&self, card_set_id: &str, token: Option<&str>) -> Value {
        let mut request = self
            .client
            .get(self.url(&format!("/api/card-sets/{}", card_set_id)));
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }
        let response = request.send().await.expect("Failed to execute request");
        assert_eq!(response.status().as_u16(), 200);
        response.json().await.unwrap()
    }

    /// Delivers a raw job body to the question builder with a valid signature.
    pub async fn deliver_body(&self, body: &str) -> reqwest::Response {
        self.client
            .post(self.url("/api/webhooks/question-builder"))
            .header("Upstash-Signature", qstash_signature(body, QSTASH_CURRENT_KEY))
            .header("Content-Type", "application/json")
            .body(body.to_string())
            .send()
            .await
            .expect("Failed to execute request")
    }

    pub async fn deliver(&self, job: &ChunkJob) -> reqwest::Response {
        self.deliver_body(&serde_json::to_string(job).unwrap()).await
    }

    /// Delivers every scheduled job, including the ones scheduled along the way,
    /// until the queue is empty. Returns the number of deliveries.
    pub async fn drain_jobs(&self) -> usize {
        let mut delivered = 0;
        loop {
            let pending = self.scheduler.take().await;
            if pending.is_empty() {
                return delivered;
            }
            for job in pending {
                let response = self.deliver_body(&job.body.to_string()).await;
                assert_eq!(response.status().as_u16(), 200);
                delivered += 1;
            }
        }
    }

    /// Sends a signed payment webhook; the fake processor yields `event`.
    pub async fn send_payment_event(&self, event: PaymentEvent) -> reqwest::Response {
        self.payments.events.lock().await.push_back(event);
        let payload = json!({ "type": "test" }).to_string();
        let t = Utc::now().timestamp();
        let header = format!("t={},v1={}", t, stripe_signature(&payload, STRIPE_WEBHOOK_SECRET, t));

        self.client
            .post(self.url("/api/webhooks/payments"))
            .header("Stripe-Signature", header)
            .body(payload)
            .send()
            .await
            .expect("Failed to execute request")
    }
}

/// An `Upstash-Signature` token for `body`, signed with `key`.
pub fn qstash_signature(body: &str, key: &str) -> String {
    let now = Utc::now().timestamp();
    encode(
        &Header::default(),
        &json!({
            "iss": "Upstash",
            "sub": "http://quiz.test/api/webhooks/question-builder",
            "exp": now + 300,
            "nbf": now,
            "iat": now,
            "jti": new_id(),
            "body": body_hash(body.as_bytes()),
        }),
        &EncodingKey::from_secret(key.as_bytes()),
    )
    .unwrap()
}
