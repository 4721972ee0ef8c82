//! Video generator client
//!
//! Thin async submit/poll wrapper over the external text/image-to-video
//! service. Hides transport and response-shape quirks behind a trait so
//! the coordinator (and its tests) only see submissions and decoded
//! statuses. Submissions carry an idempotency key of (clip_id, attempt);
//! the provider-side job id is persisted before polling starts, so a
//! restarted worker resumes polling instead of resubmitting.

use crate::config::ServiceEndpoint;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Minimum spacing between generator API calls
const RATE_LIMIT_MS: u64 = 250;

/// Generator client errors
#[derive(Debug, Error)]
pub enum GeneratorError {
    /// Network, 5xx, rate limit: retriable with backoff
    #[error("generator transient failure: {0}")]
    Transient(String),

    /// Bad prompt, moderation block, invalid credentials: fatal
    #[error("generator rejected request: {0}")]
    Permanent(String),

    /// Unknown provider job id (e.g. expired server side)
    #[error("generator job not found: {0}")]
    NotFound(String),
}

/// One clip generation request
#[derive(Debug, Clone, Serialize)]
pub struct GenerationRequest {
    pub prompt: String,
    pub frames: i64,
    pub fps: i64,
    pub seed: Option<i64>,
    pub reference_image_url: Option<String>,
    /// (clip_id, attempt) pair keying the submission for at-most-once
    /// semantics on the provider side
    pub idempotency_key: String,
}

impl GenerationRequest {
    pub fn idempotency_key(clip_id: Uuid, attempt: i64) -> String {
        format!("clip:{clip_id}:{attempt}")
    }
}

/// Decoded generation status
#[derive(Debug, Clone, PartialEq)]
pub enum GenerationStatus {
    Starting,
    Processing,
    Succeeded {
        result_url: String,
        width: Option<i64>,
        height: Option<i64>,
        fps: Option<f64>,
    },
    Failed {
        message: String,
        retriable: bool,
    },
}

/// The generator seam the coordinator depends on
#[async_trait]
pub trait VideoGenerator: Send + Sync {
    /// Submit a generation; returns the provider-side job id
    async fn submit(&self, request: &GenerationRequest) -> Result<String, GeneratorError>;

    /// Poll a previously submitted generation
    async fn poll(&self, external_job_id: &str) -> Result<GenerationStatus, GeneratorError>;
}

/// Shared handle
pub type DynVideoGenerator = Arc<dyn VideoGenerator>;

/// Spacing limiter between outbound calls
struct RateLimiter {
    last_request: Mutex<Option<Instant>>,
    min_interval: Duration,
}

impl RateLimiter {
    fn new(min_interval_ms: u64) -> Self {
        Self {
            last_request: Mutex::new(None),
            min_interval: Duration::from_millis(min_interval_ms),
        }
    }

    async fn wait(&self) {
        let mut last = self.last_request.lock().await;

        if let Some(last_time) = *last {
            let elapsed = last_time.elapsed();
            if elapsed < self.min_interval {
                tokio::time::sleep(self.min_interval - elapsed).await;
            }
        }

        *last = Some(Instant::now());
    }
}

/// HTTP implementation against the configured provider
pub struct HttpVideoGenerator {
    http: reqwest::Client,
    endpoint: ServiceEndpoint,
    rate_limiter: RateLimiter,
}

#[derive(Debug, Deserialize)]
struct SubmitResponse {
    job_id: String,
}

#[derive(Debug, Deserialize)]
struct PollResponse {
    status: String,
    #[serde(default)]
    result_url: Option<String>,
    #[serde(default)]
    width: Option<i64>,
    #[serde(default)]
    height: Option<i64>,
    #[serde(default)]
    fps: Option<f64>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    error_code: Option<String>,
}

impl HttpVideoGenerator {
    pub fn new(endpoint: ServiceEndpoint) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("muvid/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            http,
            endpoint,
            rate_limiter: RateLimiter::new(RATE_LIMIT_MS),
        })
    }

    fn authed(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.endpoint.api_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    fn classify_status(status: reqwest::StatusCode, body: String) -> GeneratorError {
        if status.is_server_error() || status.as_u16() == 429 {
            GeneratorError::Transient(format!("HTTP {status}: {body}"))
        } else if status.as_u16() == 404 {
            GeneratorError::NotFound(body)
        } else {
            GeneratorError::Permanent(format!("HTTP {status}: {body}"))
        }
    }
}

#[async_trait]
impl VideoGenerator for HttpVideoGenerator {
    async fn submit(&self, request: &GenerationRequest) -> Result<String, GeneratorError> {
        self.rate_limiter.wait().await;

        let response = self
            .authed(
                self.http
                    .post(format!("{}/v1/generations", self.endpoint.base_url))
                    .header("Idempotency-Key", &request.idempotency_key)
                    .json(request),
            )
            .send()
            .await
            .map_err(|e| GeneratorError::Transient(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Self::classify_status(status, body));
        }

        let body: SubmitResponse = response
            .json()
            .await
            .map_err(|e| GeneratorError::Permanent(format!("malformed submit response: {e}")))?;

        tracing::debug!(
            external_job_id = %body.job_id,
            idempotency_key = %request.idempotency_key,
            "Generation submitted"
        );

        Ok(body.job_id)
    }

    async fn poll(&self, external_job_id: &str) -> Result<GenerationStatus, GeneratorError> {
        self.rate_limiter.wait().await;

        let response = self
            .authed(self.http.get(format!(
                "{}/v1/generations/{external_job_id}",
                self.endpoint.base_url
            )))
            .send()
            .await
            .map_err(|e| GeneratorError::Transient(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Self::classify_status(status, body));
        }

        let body: PollResponse = response
            .json()
            .await
            .map_err(|e| GeneratorError::Permanent(format!("malformed poll response: {e}")))?;

        Ok(decode_poll(body))
    }
}

/// Map provider status strings onto the coordinator's status model
fn decode_poll(body: PollResponse) -> GenerationStatus {
    match body.status.as_str() {
        "starting" | "queued" | "pending" => GenerationStatus::Starting,
        "processing" | "running" | "in_progress" => GenerationStatus::Processing,
        "succeeded" | "completed" => match body.result_url {
            Some(result_url) => GenerationStatus::Succeeded {
                result_url,
                width: body.width,
                height: body.height,
                fps: body.fps,
            },
            // Succeeded without a result is a provider bug; retrying may
            // produce a usable run
            None => GenerationStatus::Failed {
                message: "provider reported success without a result URL".to_string(),
                retriable: true,
            },
        },
        "failed" | "error" | "canceled" => {
            let message = body
                .error
                .unwrap_or_else(|| "generation failed without detail".to_string());
            let retriable = !matches!(
                body.error_code.as_deref(),
                Some("moderation_blocked") | Some("invalid_prompt") | Some("invalid_credentials")
            );
            GenerationStatus::Failed { message, retriable }
        }
        other => GenerationStatus::Failed {
            message: format!("unknown provider status: {other}"),
            retriable: true,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn poll_body(status: &str) -> PollResponse {
        PollResponse {
            status: status.to_string(),
            result_url: None,
            width: None,
            height: None,
            fps: None,
            error: None,
            error_code: None,
        }
    }

    #[test]
    fn test_decode_progress_states() {
        assert_eq!(decode_poll(poll_body("queued")), GenerationStatus::Starting);
        assert_eq!(
            decode_poll(poll_body("running")),
            GenerationStatus::Processing
        );
    }

    #[test]
    fn test_decode_success_requires_result_url() {
        let mut body = poll_body("succeeded");
        body.result_url = Some("https://cdn/clip.mp4".to_string());
        body.width = Some(1920);
        assert!(matches!(
            decode_poll(body),
            GenerationStatus::Succeeded { ref result_url, width: Some(1920), .. }
                if result_url == "https://cdn/clip.mp4"
        ));

        // Success without a URL is a retriable failure
        assert!(matches!(
            decode_poll(poll_body("succeeded")),
            GenerationStatus::Failed { retriable: true, .. }
        ));
    }

    #[test]
    fn test_moderation_block_is_permanent() {
        let mut body = poll_body("failed");
        body.error = Some("content policy".to_string());
        body.error_code = Some("moderation_blocked".to_string());
        assert!(matches!(
            decode_poll(body),
            GenerationStatus::Failed { retriable: false, .. }
        ));
    }

    #[test]
    fn test_unclassified_failure_is_retriable() {
        let mut body = poll_body("failed");
        body.error = Some("gpu fell over".to_string());
        assert!(matches!(
            decode_poll(body),
            GenerationStatus::Failed { retriable: true, .. }
        ));
    }

    #[test]
    fn test_idempotency_key_shape() {
        let id = Uuid::new_v4();
        assert_eq!(
            GenerationRequest::idempotency_key(id, 2),
            format!("clip:{id}:2")
        );
    }
}
