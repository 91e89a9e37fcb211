use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::error::ErrorKind;
use crate::types::SlotId;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobCompletion {
    pub confidence: u8,
    pub k_samples: u32,
    pub inference_latency_ms: u64,
    pub duration_ms: u64,
    pub escalated: bool,
    pub routed_to_review: bool,
}

/// Lifecycle events emitted by the dispatcher. Telemetry, alerting and
/// exporters subscribe by implementing this.
pub trait JobObserver: Send + Sync {
    fn job_started(&self, _model: &str, _slot: SlotId) {}
    fn job_completed(&self, _model: &str, _completion: &JobCompletion) {}
    fn job_failed(&self, _model: &str, _kind: ErrorKind) {}
    /// A durable receipt filled its batch but the batch could not be sealed.
    fn seal_deferred(&self, _kind: ErrorKind) {}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metrics {
    pub jobs_started: u64,
    pub jobs_completed: u64,
    pub jobs_failed: u64,
    pub jobs_in_progress: u64,
    pub escalations: u64,
    pub routed_to_review: u64,

    pub average_inference_ms: f64,
    pub min_inference_ms: u64,
    pub max_inference_ms: u64,
    pub total_inference_ms: u64,

    pub transport_errors: u64,
    pub timeout_errors: u64,
    pub persistence_errors: u64,
    pub other_errors: u64,
    pub seal_failures: u64,

    pub uptime_seconds: u64,
    pub last_successful_job: Option<u64>,
    pub consecutive_failures: u32,
    pub low_confidence_streak: u32,
    pub jobs_per_second: f64,
}

#[derive(Debug)]
pub struct MetricsCollector {
    low_confidence_threshold: u8,

    jobs_started: AtomicU64,
    jobs_completed: AtomicU64,
    jobs_failed: AtomicU64,
    escalations: AtomicU64,
    routed_to_review: AtomicU64,

    transport_errors: AtomicU64,
    timeout_errors: AtomicU64,
    persistence_errors: AtomicU64,
    other_errors: AtomicU64,
    seal_failures: AtomicU64,

    consecutive_failures: AtomicU32,
    low_confidence_streak: AtomicU32,

    start_time: Instant,
    last_success_time: Arc<Mutex<Option<Instant>>>,

    total_inference_ms: AtomicU64,
    min_inference_ms: AtomicU64,
    max_inference_ms: AtomicU64,
}

impl MetricsCollector {
    pub fn new(low_confidence_threshold: u8) -> Self {
        Self {
            low_confidence_threshold,
            jobs_started: AtomicU64::new(0),
            jobs_completed: AtomicU64::new(0),
            jobs_failed: AtomicU64::new(0),
            escalations: AtomicU64::new(0),
            routed_to_review: AtomicU64::new(0),
            transport_errors: AtomicU64::new(0),
            timeout_errors: AtomicU64::new(0),
            persistence_errors: AtomicU64::new(0),
            other_errors: AtomicU64::new(0),
            seal_failures: AtomicU64::new(0),
            consecutive_failures: AtomicU32::new(0),
            low_confidence_streak: AtomicU32::new(0),
            start_time: Instant::now(),
            last_success_time: Arc::new(Mutex::new(None)),
            total_inference_ms: AtomicU64::new(0),
            min_inference_ms: AtomicU64::new(u64::MAX),
            max_inference_ms: AtomicU64::new(0),
        }
    }

    pub fn low_confidence_streak(&self) -> u32 {
        self.low_confidence_streak.load(Ordering::Relaxed)
    }

    pub fn get_metrics(&self) -> Metrics {
        let jobs_started = self.jobs_started.load(Ordering::Relaxed);
        let jobs_completed = self.jobs_completed.load(Ordering::Relaxed);
        let jobs_failed = self.jobs_failed.load(Ordering::Relaxed);
        let total_inference_ms = self.total_inference_ms.load(Ordering::Relaxed);
        let min_inference_ms = self.min_inference_ms.load(Ordering::Relaxed);

        let average_inference_ms = if jobs_completed > 0 {
            total_inference_ms as f64 / jobs_completed as f64
        } else {
            0.0
        };

        let uptime_seconds = self.start_time.elapsed().as_secs();
        let last_successful_job = self
            .last_success_time
            .lock()
            .ok()
            .and_then(|t| t.map(|time| time.duration_since(self.start_time).as_secs()));

        let jobs_per_second = if uptime_seconds > 0 {
            jobs_completed as f64 / uptime_seconds as f64
        } else {
            0.0
        };

        Metrics {
            jobs_started,
            jobs_completed,
            jobs_failed,
            jobs_in_progress: jobs_started.saturating_sub(jobs_completed + jobs_failed),
            escalations: self.escalations.load(Ordering::Relaxed),
            routed_to_review: self.routed_to_review.load(Ordering::Relaxed),
            average_inference_ms,
            min_inference_ms: if min_inference_ms == u64::MAX { 0 } else { min_inference_ms },
            max_inference_ms: self.max_inference_ms.load(Ordering::Relaxed),
            total_inference_ms,
            transport_errors: self.transport_errors.load(Ordering::Relaxed),
            timeout_errors: self.timeout_errors.load(Ordering::Relaxed),
            persistence_errors: self.persistence_errors.load(Ordering::Relaxed),
            other_errors: self.other_errors.load(Ordering::Relaxed),
            seal_failures: self.seal_failures.load(Ordering::Relaxed),
            uptime_seconds,
            last_successful_job,
            consecutive_failures: self.consecutive_failures.load(Ordering::Relaxed),
            low_confidence_streak: self.low_confidence_streak(),
            jobs_per_second,
        }
    }

    pub fn get_health_status(&self) -> HealthStatus {
        let consecutive_failures = self.consecutive_failures.load(Ordering::Relaxed);
        let finished = self.jobs_completed.load(Ordering::Relaxed) + self.jobs_failed.load(Ordering::Relaxed);
        let failed = self.jobs_failed.load(Ordering::Relaxed);

        let failure_rate = if finished > 0 { failed as f64 / finished as f64 } else { 0.0 };

        if consecutive_failures >= 10 {
            HealthStatus::Critical
        } else if consecutive_failures >= 5 || failure_rate > 0.5 {
            HealthStatus::Unhealthy
        } else if consecutive_failures >= 2 || failure_rate > 0.1 {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }
}

impl JobObserver for MetricsCollector {
    fn job_started(&self, _model: &str, _slot: SlotId) {
        self.jobs_started.fetch_add(1, Ordering::Relaxed);
    }

    fn job_completed(&self, _model: &str, c: &JobCompletion) {
        self.jobs_completed.fetch_add(1, Ordering::Relaxed);
        self.consecutive_failures.store(0, Ordering::Relaxed);
        if c.escalated {
            self.escalations.fetch_add(1, Ordering::Relaxed);
        }
        if c.routed_to_review {
            self.routed_to_review.fetch_add(1, Ordering::Relaxed);
        }
        if c.confidence < self.low_confidence_threshold {
            self.low_confidence_streak.fetch_add(1, Ordering::Relaxed);
        } else {
            self.low_confidence_streak.store(0, Ordering::Relaxed);
        }
        if let Ok(mut last_success) = self.last_success_time.lock() {
            *last_success = Some(Instant::now());
        }

        let ms = c.inference_latency_ms;
        self.total_inference_ms.fetch_add(ms, Ordering::Relaxed);
        self.min_inference_ms.fetch_min(ms, Ordering::Relaxed);
        self.max_inference_ms.fetch_max(ms, Ordering::Relaxed);
    }

    fn job_failed(&self, _model: &str, kind: ErrorKind) {
        self.jobs_failed.fetch_add(1, Ordering::Relaxed);
        self.consecutive_failures.fetch_add(1, Ordering::Relaxed);
        let counter = match kind {
            ErrorKind::Transport => &self.transport_errors,
            ErrorKind::Timeout => &self.timeout_errors,
            ErrorKind::Persistence => &self.persistence_errors,
            _ => &self.other_errors,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn seal_deferred(&self, _kind: ErrorKind) {
        self.seal_failures.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
    Critical,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Degraded => write!(f, "degraded"),
            HealthStatus::Unhealthy => write!(f, "unhealthy"),
            HealthStatus::Critical => write!(f, "critical"),
        }
    }
}
