use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use tokio::sync::Mutex;

use crate::error::WorkerError;
use crate::types::{JobDescriptor, ReviewRequest};

pub fn pending_queue_name(prefix: &str, model: &str) -> String {
    format!("{prefix}:{model}:pending")
}

/// Per-model FIFO of pending jobs. An empty queue is `Ok(None)`, not an error.
#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn pop(&self, model: &str) -> Result<Option<JobDescriptor>, WorkerError>;
    async fn push(&self, model: &str, job: JobDescriptor) -> Result<(), WorkerError>;
}

/// Destination for low-confidence results that need a human look.
#[async_trait]
pub trait ReviewSink: Send + Sync {
    async fn submit(&self, request: ReviewRequest) -> Result<(), WorkerError>;
}

/// In-process queue, used for local runs and tests.
#[derive(Debug, Default)]
pub struct MemoryQueue {
    pending: Mutex<HashMap<String, VecDeque<JobDescriptor>>>,
    review: Mutex<Vec<ReviewRequest>>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self, model: &str) -> usize {
        self.pending.lock().await.get(model).map_or(0, VecDeque::len)
    }

    pub async fn reviews(&self) -> Vec<ReviewRequest> {
        self.review.lock().await.clone()
    }
}

#[async_trait]
impl JobQueue for MemoryQueue {
    async fn pop(&self, model: &str) -> Result<Option<JobDescriptor>, WorkerError> {
        Ok(self.pending.lock().await.get_mut(model).and_then(VecDeque::pop_front))
    }

    async fn push(&self, model: &str, job: JobDescriptor) -> Result<(), WorkerError> {
        self.pending
            .lock()
            .await
            .entry(model.to_string())
            .or_default()
            .push_back(job);
        Ok(())
    }
}

#[async_trait]
impl ReviewSink for MemoryQueue {
    async fn submit(&self, request: ReviewRequest) -> Result<(), WorkerError> {
        self.review.lock().await.push(request);
        Ok(())
    }
}

/// Queue service reached over HTTP:
/// `POST {base}/queues/{name}/pop` answers 200 with a job or 204 when empty;
/// `POST {base}/queues/{name}/push` appends a JSON body.
pub struct HttpJobQueue {
    client: reqwest::Client,
    base_url: String,
    prefix: String,
    review_queue: String,
}

impl HttpJobQueue {
    pub fn new(
        base_url: impl Into<String>,
        prefix: impl Into<String>,
        review_queue: impl Into<String>,
    ) -> Result<Self, WorkerError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| WorkerError::Queue(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            prefix: prefix.into(),
            review_queue: review_queue.into(),
        })
    }

    fn url(&self, queue: &str, op: &str) -> String {
        format!("{}/queues/{}/{}", self.base_url, queue, op)
    }

    async fn push_json<T: serde::Serialize + Sync>(&self, queue: &str, body: &T) -> Result<(), WorkerError> {
        let resp = self
            .client
            .post(self.url(queue, "push"))
            .json(body)
            .send()
            .await
            .map_err(|e| WorkerError::Queue(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(WorkerError::Queue(format!("push to {queue} returned {}", resp.status())));
        }
        Ok(())
    }
}

#[async_trait]
impl JobQueue for HttpJobQueue {
    async fn pop(&self, model: &str) -> Result<Option<JobDescriptor>, WorkerError> {
        let queue = pending_queue_name(&self.prefix, model);
        let resp = self
            .client
            .post(self.url(&queue, "pop"))
            .send()
            .await
            .map_err(|e| WorkerError::Queue(e.to_string()))?;
        match resp.status() {
            StatusCode::NO_CONTENT | StatusCode::NOT_FOUND => Ok(None),
            s if s.is_success() => resp
                .json::<JobDescriptor>()
                .await
                .map(Some)
                .map_err(|e| WorkerError::Queue(format!("bad job from {queue}: {e}"))),
            s => Err(WorkerError::Queue(format!("pop from {queue} returned {s}"))),
        }
    }

    async fn push(&self, model: &str, job: JobDescriptor) -> Result<(), WorkerError> {
        self.push_json(&pending_queue_name(&self.prefix, model), &job).await
    }
}

#[async_trait]
impl ReviewSink for HttpJobQueue {
    async fn submit(&self, request: ReviewRequest) -> Result<(), WorkerError> {
        self.push_json(&self.review_queue, &request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn job(id: &str) -> JobDescriptor {
        JobDescriptor { job_id: id.into(), model: None, findings: "f".into(), timestamp: None }
    }

    #[tokio::test]
    async fn memory_queue_is_fifo_per_model() {
        let q = MemoryQueue::new();
        q.push("spine", job("a")).await.unwrap();
        q.push("spine", job("b")).await.unwrap();
        q.push("chest", job("c")).await.unwrap();

        assert_eq!(q.pop("spine").await.unwrap().unwrap().job_id, "a");
        assert_eq!(q.pop("chest").await.unwrap().unwrap().job_id, "c");
        assert_eq!(q.pop("spine").await.unwrap().unwrap().job_id, "b");
        assert!(q.pop("spine").await.unwrap().is_none());
        assert!(q.pop("unknown").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn http_pop_handles_empty_and_job() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/queues/jobs:queenbee-spine:pending/pop"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "job_id": "job-7", "findings": "C5-C6", "timestamp": "2025-01-01T00:00:00Z"
            })))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/queues/jobs:queenbee-spine:pending/pop"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;

        let q = HttpJobQueue::new(server.uri(), "jobs", "jobs:human_review:pending").unwrap();
        let first = q.pop("queenbee-spine").await.unwrap().unwrap();
        assert_eq!(first.job_id, "job-7");
        assert_eq!(first.findings, "C5-C6");
        assert!(q.pop("queenbee-spine").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn http_review_push_posts_request() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/queues/jobs:human_review:pending/push"))
            .and(body_partial_json(json!({"job_id": "job-1", "confidence": 40})))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let q = HttpJobQueue::new(server.uri(), "jobs", "jobs:human_review:pending").unwrap();
        q.submit(ReviewRequest {
            job_id: "job-1".into(),
            model: "queenbee-chest".into(),
            confidence: 40,
            report_reference: "/out/job-1_report.json".into(),
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn http_queue_error_status_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;
        let q = HttpJobQueue::new(server.uri(), "jobs", "review").unwrap();
        assert!(matches!(q.pop("m").await, Err(WorkerError::Queue(_))));
        assert!(matches!(q.push("m", job("x")).await, Err(WorkerError::Queue(_))));
    }
}
