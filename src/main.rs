// src/main.rs

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use dotenvy::dotenv;
use quizforge::adapters::{
    identity::JwtIdentityProvider, ocr::HttpDocumentAnalysis, openai::OpenAiCompletion,
    qstash::QstashScheduler, storage::FsObjectStorage, stripe::StripePayments,
};
use quizforge::config::Config;
use quizforge::ports::DocumentAnalysis;
use quizforge::routes;
use quizforge::state::AppState;
use quizforge::store::postgres::PgRepository;
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    // Load .env file (if present)
    dotenv().ok();

    // Load configuration from environment
    let config = Config::from_env();

    let file_appender = tracing_appender::rolling::daily("logs", "app.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
    let env_filter = EnvFilter::new(&config.rust_log);
    let stdout_layer = fmt::layer().with_writer(std::io::stdout).with_target(false);
    let file_layer = fmt::layer().with_writer(non_blocking).with_ansi(false);

    // Initialize Tracing (Logging)
    tracing_subscriber::registry()
        .with(env_filter)
        .with(stdout_layer)
        .with(file_layer)
        .init();

    // Initialize Database Pool with Retry
    let mut retry_count = 0;
    let pool = loop {
        match PgPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(Duration::from_secs(3))
            .connect(&config.database_url)
            .await
        {
            Ok(pool) => break pool,
            Err(e) => {
                retry_count += 1;
                if retry_count > 5 {
                    panic!("Failed to connect to database after 5 retries: {}", e);
                }
                tracing::warn!("Database not ready, retrying in 2s... (Attempt {})", retry_count);
                tokio::time::sleep(Duration::from_secs(2)).await;
            }
        }
    };

    tracing::info!("Database connected...");

    // Run Migrations Automatically
    tracing::info!("Running migrations...");
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("Failed to run database migrations");
    tracing::info!("Migrations applied successfully.");

    // External collaborators
    let storage = FsObjectStorage::new(&config.upload_dir).expect("Failed to open upload directory");

    let ocr = config.ocr_service_url.clone().map(|url| {
        Arc::new(HttpDocumentAnalysis::new(url)) as Arc<dyn DocumentAnalysis>
    });
    if ocr.is_none() {
        tracing::warn!("OCR_SERVICE_URL is not set, scanned PDFs will be rejected");
    }

    let state = AppState {
        repo: Arc::new(PgRepository::new(pool)),
        completion: Arc::new(OpenAiCompletion::new(
            config.openai_api_key.clone(),
            config.openai_base_url.clone(),
            config.openai_model.clone(),
        )),
        scheduler: Arc::new(QstashScheduler::new(
            config.qstash_url.clone(),
            config.qstash_token.clone(),
        )),
        storage: Arc::new(storage),
        ocr,
        payments: Arc::new(StripePayments::new(
            config.stripe_api_base.clone(),
            config.stripe_secret_key.clone(),
            config.stripe_webhook_secret.clone(),
        )),
        identity: Arc::new(JwtIdentityProvider::new(
            config.identity_secret.clone(),
            config.identity_issuer.clone(),
        )),
        config: config.clone(),
    };

    // Create the Axum application router
    let app = routes::create_router(state);

    // Bind to the listening address
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await.unwrap();

    // Start the server
    axum::serve(listener, app).await.unwrap();
}
