// src/adapters/ocr.rs

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::ports::{DocumentAnalysis, OcrError, OcrPage};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StartRequest<'a> {
    bucket: &'a str,
    key: &'a str,
    /// Makes repeated starts for the same upload return the same job.
    client_request_token: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartResponse {
    job_id: String,
}

/// Client for the document-analysis gateway. The gateway starts text detection
/// jobs and serves their results one page of LINE blocks at a time.
pub struct HttpDocumentAnalysis {
    client: Client,
    base_url: String,
}

impl HttpDocumentAnalysis {
    pub fn new(base_url: String) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .expect("Failed to create HTTP client");

        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    async fn read<T: serde::de::DeserializeOwned>(response: reqwest::Response) -> Result<T, OcrError> {
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(OcrError::Request(format!("{}: {}", status, text)));
        }
        response
            .json()
            .await
            .map_err(|e| OcrError::Request(e.to_string()))
    }
}

#[async_trait]
impl DocumentAnalysis for HttpDocumentAnalysis {
    async fn start_text_detection(&self, bucket: &str, key: &str) -> Result<String, OcrError> {
        let response = self
            .client
            .post(format!("{}/jobs", self.base_url))
            .json(&StartRequest {
                bucket,
                key,
                client_request_token: key,
            })
            .send()
            .await
            .map_err(|e| OcrError::Request(e.to_string()))?;

        let started: StartResponse = Self::read(response).await?;
        tracing::info!("Started text detection job {} for {}", started.job_id, key);
        Ok(started.job_id)
    }

    async fn text_page(&self, job_id: &str, next_token: Option<&str>) -> Result<OcrPage, OcrError> {
        let mut request = self
            .client
            .get(format!("{}/jobs/{}/lines", self.base_url, job_id))
            .query(&[("maxResults", "1000")]);
        if let Some(token) = next_token {
            request = request.query(&[("nextToken", token)]);
        }

        let response = request
            .send()
            .await
            .map_err(|e| OcrError::Request(e.to_string()))?;

        Self::read(response).await
    }
}
