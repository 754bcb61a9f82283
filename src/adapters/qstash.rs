// src/adapters/qstash.rs

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;

use crate::ports::{JobScheduler, SchedulerError};

/// Publishes jobs through the QStash HTTP API.
pub struct QstashScheduler {
    client: Client,
    base_url: String,
    token: String,
}

impl QstashScheduler {
    pub fn new(base_url: String, token: String) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("Failed to create HTTP client");

        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        }
    }
}

#[async_trait]
impl JobScheduler for QstashScheduler {
    async fn publish(
        &self,
        url: &str,
        body: serde_json::Value,
        delay: Option<Duration>,
    ) -> Result<(), SchedulerError> {
        let mut request = self
            .client
            .post(format!("{}/v2/publish/{}", self.base_url, url))
            .bearer_auth(&self.token)
            .json(&body);

        if let Some(delay) = delay {
            request = request.header("Upstash-Delay", format!("{}s", delay.as_secs()));
        }

        let response = request
            .send()
            .await
            .map_err(|e| SchedulerError::Publish(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(SchedulerError::Publish(format!("{}: {}", status, text)));
        }

        tracing::debug!("Published job to {}", url);
        Ok(())
    }
}
