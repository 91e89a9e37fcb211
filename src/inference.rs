use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::error::WorkerError;
use crate::types::{InferenceOutcome, InferenceRequest};

/// The external model server. One call per attempt.
#[async_trait]
pub trait InferenceProvider: Send + Sync {
    async fn infer(&self, request: &InferenceRequest) -> Result<InferenceOutcome, WorkerError>;
}

#[derive(Serialize)]
struct WireRequest<'a> {
    findings: &'a str,
    k_samples: u32,
    max_new_tokens: u32,
    use_int8: bool,
    use_flash_attention: bool,
}

pub struct HttpInferenceProvider {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl HttpInferenceProvider {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, WorkerError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| WorkerError::Transport(e.to_string()))?;
        Ok(Self { client, base_url: base_url.into().trim_end_matches('/').to_string(), timeout })
    }

    /// Report models have dedicated routes on the inference server.
    pub fn endpoint_for(&self, model: &str) -> String {
        let route = if model.contains("spine") {
            "spine-report"
        } else if model.contains("chest") {
            "chest-report"
        } else {
            "inference"
        };
        format!("{}/{}", self.base_url, route)
    }

    fn map_reqwest(&self, e: reqwest::Error) -> WorkerError {
        if e.is_timeout() {
            WorkerError::Timeout(self.timeout)
        } else {
            WorkerError::Transport(e.to_string())
        }
    }
}

/// `confidence.score_0_100`, accepting a bare number too. Missing means 0.
pub fn extract_confidence(result: &Value) -> u8 {
    let score = match result.get("confidence") {
        Some(Value::Object(obj)) => obj.get("score_0_100").and_then(Value::as_f64),
        Some(v) => v.as_f64(),
        None => None,
    };
    score.map(|s| s.clamp(0.0, 100.0).round() as u8).unwrap_or(0)
}

#[async_trait]
impl InferenceProvider for HttpInferenceProvider {
    async fn infer(&self, request: &InferenceRequest) -> Result<InferenceOutcome, WorkerError> {
        let url = self.endpoint_for(&request.model);
        let body = WireRequest {
            findings: &request.findings,
            k_samples: request.k_samples,
            max_new_tokens: request.max_new_tokens,
            use_int8: request.use_int8,
            use_flash_attention: request.use_flash_attention,
        };

        let t0 = Instant::now();
        let resp = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| self.map_reqwest(e))?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(WorkerError::Transport(format!("{url} returned {status}: {text}")));
        }
        let output: Value = resp.json().await.map_err(|e| self.map_reqwest(e))?;
        let latency_ms = t0.elapsed().as_millis() as u64;

        let confidence = extract_confidence(&output);
        debug!(url = %url, k_samples = request.k_samples, latency_ms, confidence, "inference returned");
        Ok(InferenceOutcome { confidence, output, latency_ms })
    }
}
