//! Fine-tuning client for OpenAI-compatible endpoints.
//!
//! Endpoints used:
//! - `POST /files` (multipart, purpose `fine-tune`) to upload training data
//! - `POST /fine_tuning/jobs` to start a job
//! - `GET /fine_tuning/jobs` and `GET /fine_tuning/jobs/{id}` to follow it

use super::finetune::{Finetunable, FinetuneJob, FinetuneRequest};
use crate::models::{DistilleryError, ProviderError, Result};
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::RequestBuilder;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

/// File upload response.
#[derive(Debug, Deserialize)]
struct UploadedFile {
    id: String,
}

/// Job creation payload.
#[derive(Debug, Serialize)]
struct CreateJobRequest<'a> {
    training_file: &'a str,
    model: &'a str,
    suffix: &'a str,
}

/// Paginated job listing.
#[derive(Debug, Deserialize)]
struct JobList {
    data: Vec<FinetuneJob>,
}

/// API error response (OpenAI-compatible).
#[derive(Debug, Deserialize)]
struct ApiErrorResponse {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
}

/// Fine-tuning client for any OpenAI-compatible endpoint.
///
/// Features:
/// - Bearer authentication
/// - Retry with exponential backoff on network and server errors
/// - `retry-after` handling on 429
/// - No retries on authentication or not-found errors
pub struct OpenAiClient {
    client: reqwest::Client,
    /// Name of this provider (for logging)
    name: String,
    api_key: Option<String>,
    base_url: String,
    timeout: Duration,
    max_retries: u32,
}

impl OpenAiClient {
    /// Create a new client.
    pub fn new(
        name: impl Into<String>,
        api_key: Option<String>,
        base_url: impl Into<String>,
        timeout_secs: u64,
        max_retries: u32,
    ) -> Result<Self> {
        let timeout = Duration::from_secs(timeout_secs);
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(DistilleryError::Network)?;

        Ok(Self {
            client,
            name: name.into(),
            api_key,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            timeout,
            max_retries: max_retries.max(1),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn authorized(&self, builder: RequestBuilder) -> RequestBuilder {
        match &self.api_key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }

    /// Send a request, retrying transient failures, and decode the JSON body.
    ///
    /// `build` is called once per attempt since request bodies are consumed.
    async fn execute<T, F>(&self, what: &str, build: F) -> Result<T>
    where
        T: DeserializeOwned,
        F: Fn() -> RequestBuilder + Send + Sync,
    {
        let mut last_error: Option<DistilleryError> = None;

        for attempt in 0..self.max_retries {
            let is_last = attempt + 1 >= self.max_retries;
            let response = match self.authorized(build()).send().await {
                Ok(r) => r,
                Err(e) => {
                    last_error = Some(if e.is_timeout() {
                        DistilleryError::Timeout(self.timeout)
                    } else {
                        DistilleryError::Network(e)
                    });
                    if !is_last {
                        let backoff = Duration::from_secs(2u64.pow(attempt));
                        debug!(
                            provider = %self.name,
                            attempt = attempt,
                            backoff_secs = backoff.as_secs(),
                            "Retrying after network error"
                        );
                        tokio::time::sleep(backoff).await;
                    }
                    continue;
                }
            };

            let status = response.status().as_u16();

            if status == 429 {
                let retry_after = response
                    .headers()
                    .get("retry-after")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|s| s.parse::<f64>().ok())
                    .unwrap_or(1.0);
                let message = response.text().await.unwrap_or_default();

                let error = DistilleryError::Provider(ProviderError::RateLimited {
                    message,
                    retry_after_secs: Some(retry_after),
                });

                if !is_last {
                    let wait = error.retry_after().unwrap_or(1.0);
                    debug!(
                        provider = %self.name,
                        attempt = attempt,
                        retry_after_secs = wait,
                        "Rate limited, waiting"
                    );
                    tokio::time::sleep(Duration::from_secs_f64(wait)).await;
                }
                last_error = Some(error);
                continue;
            }

            if !response.status().is_success() {
                let error_body = response.text().await.unwrap_or_default();
                let message = serde_json::from_str::<ApiErrorResponse>(&error_body)
                    .map(|api_error| api_error.error.message)
                    .unwrap_or(error_body);
                let error = match status {
                    401 => ProviderError::AuthenticationFailed,
                    404 => ProviderError::NotFound(format!("{what}: {message}")),
                    _ => ProviderError::ApiError { status, message },
                };
                last_error = Some(DistilleryError::Provider(error));

                // Don't retry auth errors or not found
                if status == 401 || status == 404 {
                    break;
                }

                if !is_last {
                    tokio::time::sleep(Duration::from_secs(2u64.pow(attempt))).await;
                }
                continue;
            }

            return response.json::<T>().await.map_err(|e| {
                DistilleryError::Provider(ProviderError::InvalidResponse(format!("{what}: {e}")))
            });
        }

        Err(last_error.unwrap_or_else(|| {
            DistilleryError::Provider(ProviderError::MaxRetriesExceeded {
                attempts: self.max_retries,
                last_error: "Unknown error".to_string(),
            })
        }))
    }

    /// Upload a JSONL training file and return its id.
    async fn upload_training_file(&self, jsonl: String) -> Result<String> {
        let url = format!("{}/files", self.base_url);
        let bytes = jsonl.into_bytes();
        let uploaded: UploadedFile = self
            .execute("uploading training file", || {
                let part = Part::bytes(bytes.clone()).file_name("training.jsonl");
                let form = Form::new().text("purpose", "fine-tune").part("file", part);
                self.client.post(&url).multipart(form)
            })
            .await?;
        Ok(uploaded.id)
    }
}

#[async_trait]
impl Finetunable for OpenAiClient {
    async fn list_finetuned(&self, limit: usize) -> Result<Vec<FinetuneJob>> {
        let url = format!("{}/fine_tuning/jobs", self.base_url);
        let list: JobList = self
            .execute("listing fine-tune jobs", || {
                self.client.get(&url).query(&[("limit", limit)])
            })
            .await?;
        Ok(list.data)
    }

    async fn get_finetuned(&self, job_id: &str) -> Result<FinetuneJob> {
        let url = format!("{}/fine_tuning/jobs/{}", self.base_url, job_id);
        self.execute("fetching fine-tune job", || self.client.get(&url))
            .await
    }

    async fn finetune(&self, request: FinetuneRequest) -> Result<FinetuneJob> {
        let file_id = self.upload_training_file(request.to_jsonl()).await?;
        let url = format!("{}/fine_tuning/jobs", self.base_url);
        let body = CreateJobRequest {
            training_file: &file_id,
            model: &request.base_model,
            suffix: &request.suffix,
        };
        let job: FinetuneJob = self
            .execute("creating fine-tune job", || self.client.post(&url).json(&body))
            .await?;

        info!(
            provider = %self.name,
            job_id = %job.id,
            base_model = %request.base_model,
            records = request.records.len(),
            "Fine-tune job created"
        );
        Ok(job)
    }
}
