use prometheus_client::{
    encoding::text::encode,
    metrics::{counter::Counter, family::Family, gauge::Gauge, histogram::Histogram},
    registry::Registry,
};

use crate::error::ErrorKind;
use crate::metrics::{JobCompletion, JobObserver};
use crate::types::SlotId;

type Labels = Vec<(String, String)>;

fn model_label(model: &str) -> Labels {
    vec![("model".to_string(), model.to_string())]
}

pub struct PrometheusMetrics {
    registry: Registry,

    jobs_started: Family<Labels, Counter>,
    jobs_completed: Family<Labels, Counter>,
    jobs_failed: Family<Labels, Counter>,
    escalations: Family<Labels, Counter>,
    routed_to_review: Family<Labels, Counter>,
    seal_failures: Family<Labels, Counter>,

    jobs_in_progress: Family<Labels, Gauge>,

    inference_duration_ms: Family<Labels, Histogram>,
    job_duration_ms: Family<Labels, Histogram>,
    confidence_score: Family<Labels, Histogram>,
    k_samples: Family<Labels, Histogram>,
}

impl PrometheusMetrics {
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let jobs_started = Family::<Labels, Counter>::default();
        let jobs_completed = Family::<Labels, Counter>::default();
        let jobs_failed = Family::<Labels, Counter>::default();
        let escalations = Family::<Labels, Counter>::default();
        let routed_to_review = Family::<Labels, Counter>::default();
        let seal_failures = Family::<Labels, Counter>::default();
        let jobs_in_progress = Family::<Labels, Gauge>::default();

        let inference_duration_ms = Family::<Labels, Histogram>::new_with_constructor(|| {
            Histogram::new([5_000.0, 15_000.0, 30_000.0, 60_000.0, 90_000.0, 120_000.0, 180_000.0].into_iter())
        });
        let job_duration_ms = Family::<Labels, Histogram>::new_with_constructor(|| {
            Histogram::new(
                [10_000.0, 30_000.0, 60_000.0, 120_000.0, 180_000.0, 300_000.0, 600_000.0].into_iter(),
            )
        });
        let confidence_score = Family::<Labels, Histogram>::new_with_constructor(|| {
            Histogram::new([30.0, 40.0, 50.0, 55.0, 60.0, 65.0, 70.0, 75.0, 80.0, 85.0, 90.0, 95.0, 100.0].into_iter())
        });
        let k_samples = Family::<Labels, Histogram>::new_with_constructor(|| {
            Histogram::new([1.0, 3.0, 5.0, 7.0, 9.0].into_iter())
        });

        registry.register("swarm_worker_jobs_started", "Jobs claimed by a slot", jobs_started.clone());
        registry.register("swarm_worker_jobs_completed", "Jobs that produced a receipt", jobs_completed.clone());
        registry.register("swarm_worker_jobs_failed", "Jobs that ended without a receipt", jobs_failed.clone());
        registry.register("swarm_worker_escalations", "Jobs re-run at max K after low confidence", escalations.clone());
        registry.register("swarm_worker_routed_to_review", "Jobs forwarded to human review", routed_to_review.clone());
        registry.register("swarm_worker_seal_failures", "Batch seals deferred after a failure", seal_failures.clone());
        registry.register("swarm_worker_jobs_in_progress", "Jobs currently holding a slot", jobs_in_progress.clone());
        registry.register("swarm_worker_inference_duration_ms", "Inference call latency in milliseconds", inference_duration_ms.clone());
        registry.register("swarm_worker_job_duration_ms", "End-to-end job duration in milliseconds", job_duration_ms.clone());
        registry.register("swarm_worker_confidence_score", "Confidence score distribution (0-100)", confidence_score.clone());
        registry.register("swarm_worker_k_samples", "K samples used per completed job", k_samples.clone());

        Self {
            registry,
            jobs_started,
            jobs_completed,
            jobs_failed,
            escalations,
            routed_to_review,
            seal_failures,
            jobs_in_progress,
            inference_duration_ms,
            job_duration_ms,
            confidence_score,
            k_samples,
        }
    }

    pub fn export_metrics(&self) -> Result<String, std::fmt::Error> {
        let mut buffer = String::new();
        encode(&mut buffer, &self.registry)?;
        Ok(buffer)
    }
}

impl Default for PrometheusMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl JobObserver for PrometheusMetrics {
    fn job_started(&self, model: &str, _slot: SlotId) {
        let labels = model_label(model);
        self.jobs_started.get_or_create(&labels).inc();
        self.jobs_in_progress.get_or_create(&labels).inc();
    }

    fn job_completed(&self, model: &str, c: &JobCompletion) {
        let labels = model_label(model);
        self.jobs_completed.get_or_create(&labels).inc();
        self.jobs_in_progress.get_or_create(&labels).dec();
        if c.escalated {
            self.escalations.get_or_create(&labels).inc();
        }
        if c.routed_to_review {
            self.routed_to_review.get_or_create(&labels).inc();
        }
        self.inference_duration_ms.get_or_create(&labels).observe(c.inference_latency_ms as f64);
        self.job_duration_ms.get_or_create(&labels).observe(c.duration_ms as f64);
        self.confidence_score.get_or_create(&labels).observe(c.confidence as f64);
        self.k_samples.get_or_create(&labels).observe(c.k_samples as f64);
    }

    fn job_failed(&self, model: &str, kind: ErrorKind) {
        let mut labels = model_label(model);
        self.jobs_in_progress.get_or_create(&labels).dec();
        labels.push(("kind".to_string(), kind.to_string()));
        self.jobs_failed.get_or_create(&labels).inc();
    }

    fn seal_deferred(&self, kind: ErrorKind) {
        self.seal_failures.get_or_create(&vec![("kind".to_string(), kind.to_string())]).inc();
    }
}
