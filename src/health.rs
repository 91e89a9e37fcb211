use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::dispatcher::{JobDispatcher, JobHandle, SubmitError};
use crate::error::WorkerError;
use crate::metrics::{HealthStatus, MetricsCollector};
use crate::prometheus_metrics::PrometheusMetrics;
use crate::slots::SlotView;
use crate::store::validate_job_id;
use crate::types::{InclusionProof, JobDescriptor, SlotId};

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub worker_identity: String,
    pub uptime_seconds: u64,
    pub version: String,
    pub timestamp: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MetricsResponse {
    pub metrics: crate::metrics::Metrics,
    pub health_status: String,
}

pub struct HealthChecker {
    metrics: Arc<MetricsCollector>,
    prometheus: Option<Arc<PrometheusMetrics>>,
    dispatcher: Arc<JobDispatcher>,
    config_summary: ConfigSummary,
    start_time: Instant,
}

impl HealthChecker {
    pub fn new(metrics: Arc<MetricsCollector>, dispatcher: Arc<JobDispatcher>, config: &Config) -> Self {
        Self {
            metrics,
            prometheus: None,
            dispatcher,
            config_summary: ConfigSummary::from(config),
            start_time: Instant::now(),
        }
    }

    pub fn with_prometheus(mut self, prometheus: Arc<PrometheusMetrics>) -> Self {
        self.prometheus = Some(prometheus);
        self
    }

    pub fn get_health(&self) -> HealthResponse {
        HealthResponse {
            status: self.metrics.get_health_status().to_string(),
            worker_identity: self.config_summary.worker_identity.clone(),
            uptime_seconds: self.start_time.elapsed().as_secs(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn get_metrics(&self) -> MetricsResponse {
        MetricsResponse {
            metrics: self.metrics.get_metrics(),
            health_status: self.metrics.get_health_status().to_string(),
        }
    }

    /// Prometheus text exposition, when an exporter is attached.
    pub fn export_prometheus(&self) -> Option<Result<String, std::fmt::Error>> {
        self.prometheus.as_ref().map(|p| p.export_metrics())
    }

    pub fn is_healthy(&self) -> bool {
        matches!(self.metrics.get_health_status(), HealthStatus::Healthy)
    }

    pub fn get_detailed_status(&self) -> DetailedStatus {
        let sealer = self.dispatcher.sealer();
        let metrics = self.metrics.get_metrics();
        let finished = metrics.jobs_completed + metrics.jobs_failed;

        DetailedStatus {
            health: self.metrics.get_health_status().to_string(),
            uptime_seconds: metrics.uptime_seconds,
            jobs_started: metrics.jobs_started,
            jobs_completed: metrics.jobs_completed,
            jobs_failed: metrics.jobs_failed,
            success_rate: if finished > 0 {
                metrics.jobs_completed as f64 / finished as f64
            } else {
                0.0
            },
            escalations: metrics.escalations,
            routed_to_review: metrics.routed_to_review,
            average_inference_ms: metrics.average_inference_ms,
            consecutive_failures: metrics.consecutive_failures,
            low_confidence_streak: metrics.low_confidence_streak,
            slots: self.dispatcher.slots().snapshot(),
            pending_receipts: sealer.pending_len(),
            batches_sealed: sealer.batch_counter(),
            error_counts: ErrorCounts {
                transport_errors: metrics.transport_errors,
                timeout_errors: metrics.timeout_errors,
                persistence_errors: metrics.persistence_errors,
                other_errors: metrics.other_errors,
                seal_failures: metrics.seal_failures,
            },
            config_summary: self.config_summary.clone(),
        }
    }

    pub async fn get_proof(&self, job_id: &str) -> Result<InclusionProof, WorkerError> {
        validate_job_id(job_id)?;
        self.dispatcher.sealer().get_proof(job_id).await
    }

    pub fn submit(&self, model: &str, job: JobDescriptor) -> Result<(SlotId, JobHandle), SubmitError> {
        self.dispatcher.submit(model, job)
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DetailedStatus {
    pub health: String,
    pub uptime_seconds: u64,
    pub jobs_started: u64,
    pub jobs_completed: u64,
    pub jobs_failed: u64,
    pub success_rate: f64,
    pub escalations: u64,
    pub routed_to_review: u64,
    pub average_inference_ms: f64,
    pub consecutive_failures: u32,
    pub low_confidence_streak: u32,
    pub slots: Vec<SlotView>,
    pub pending_receipts: usize,
    /// Batches sealed in the current epoch, including ones from before a restart.
    pub batches_sealed: u64,
    pub error_counts: ErrorCounts,
    pub config_summary: ConfigSummary,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorCounts {
    pub transport_errors: u64,
    pub timeout_errors: u64,
    pub persistence_errors: u64,
    pub other_errors: u64,
    pub seal_failures: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigSummary {
    pub worker_identity: String,
    pub epoch: u64,
    pub queue_url: String,
    pub inference_url: String,
    pub merkle_batch_size: usize,
    pub dynamic_k_enabled: bool,
    pub default_k: u32,
    pub min_k: u32,
    pub max_k: u32,
    pub low_confidence_threshold: u8,
    pub sign_receipts: bool,
    pub signing_key_configured: bool,
}

impl From<&Config> for ConfigSummary {
    fn from(c: &Config) -> Self {
        Self {
            worker_identity: c.worker_identity.clone(),
            epoch: c.epoch,
            queue_url: c.queue_url.clone(),
            inference_url: c.inference_url.clone(),
            merkle_batch_size: c.merkle_batch_size,
            dynamic_k_enabled: c.sampling.dynamic_k_enabled,
            default_k: c.sampling.default_k,
            min_k: c.sampling.min_k,
            max_k: c.sampling.max_k,
            low_confidence_threshold: c.sampling.low_confidence_threshold,
            sign_receipts: c.sign_receipts,
            signing_key_configured: c.worker_sk_hex.is_some(),
        }
    }
}
