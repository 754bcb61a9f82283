// src/state.rs

use std::sync::Arc;

use axum::extract::FromRef;

use crate::{
    config::Config,
    error::AppError,
    ports::{
        CompletionService, DocumentAnalysis, IdentityProvider, JobScheduler, ObjectStorage,
        PaymentProcessor,
    },
    services::{pipeline::Pipeline, resolver::LockPolicy},
    store::Repository,
};

/// Shared handles, built once in `main` (or by the test harness).
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub repo: Arc<dyn Repository>,
    pub completion: Arc<dyn CompletionService>,
    pub scheduler: Arc<dyn JobScheduler>,
    pub storage: Arc<dyn ObjectStorage>,
    /// `None` when no OCR service is configured.
    pub ocr: Option<Arc<dyn DocumentAnalysis>>,
    pub payments: Arc<dyn PaymentProcessor>,
    pub identity: Arc<dyn IdentityProvider>,
}

impl AppState {
    pub fn pipeline(&self) -> Result<Pipeline, AppError> {
        let target_url = self.config.question_builder_url().map_err(|e| {
            tracing::error!("Invalid PUBLIC_BASE_URL: {}", e);
            AppError::InternalServerError(e.to_string())
        })?;

        Ok(Pipeline {
            repo: self.repo.clone(),
            completion: self.completion.clone(),
            scheduler: self.scheduler.clone(),
            target_url: target_url.to_string(),
            retry_delay: self.config.retry_delay(),
        })
    }

    pub fn lock_policy(&self) -> LockPolicy {
        LockPolicy::from_config(&self.config)
    }
}

impl FromRef<AppState> for Config {
    fn from_ref(state: &AppState) -> Self {
        state.config.clone()
    }
}

impl FromRef<AppState> for Arc<dyn Repository> {
    fn from_ref(state: &AppState) -> Self {
        state.repo.clone()
    }
}
