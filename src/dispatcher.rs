use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::batch::{BatchSealer, SealOutcome};
use crate::config::{Config, SlotAssignment};
use crate::error::WorkerError;
use crate::hashing::{Digest, canonicalize};
use crate::inference::InferenceProvider;
use crate::metrics::{JobCompletion, JobObserver};
use crate::queue::{JobQueue, ReviewSink};
use crate::receipt::{ExecutionFacts, ReceiptFactory};
use crate::report::{self, ReportInput};
use crate::sampler::AdaptiveSampler;
use crate::slots::{SlotError, SlotGuard, SlotTable};
use crate::store::validate_job_id;
use crate::types::{
    BatchManifest, InferenceOutcome, InferenceRequest, JobAttempt, JobDescriptor, Receipt, ReviewRequest, SlotId,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Claimed,
    Sampling,
    Inferring,
    MaybeEscalating,
    Completing,
    Done,
    Failed,
}

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub epoch: u64,
    pub poll_interval: Duration,
    /// Applied to each inference call, not to the whole job.
    pub job_timeout: Duration,
    pub max_new_tokens: u32,
    pub use_int8: bool,
    pub use_flash_attention: bool,
    pub output_dir: PathBuf,
    pub sign_receipts: bool,
}

impl From<&Config> for DispatcherConfig {
    fn from(c: &Config) -> Self {
        Self {
            epoch: c.epoch,
            poll_interval: c.poll_interval(),
            job_timeout: c.job_timeout(),
            max_new_tokens: c.max_new_tokens,
            use_int8: c.use_int8,
            use_flash_attention: c.use_flash_attention,
            output_dir: c.output_dir.clone(),
            sign_receipts: c.sign_receipts,
        }
    }
}

/// External services the dispatcher talks to.
pub struct Collaborators {
    pub inference: Arc<dyn InferenceProvider>,
    pub queue: Arc<dyn JobQueue>,
    pub review: Arc<dyn ReviewSink>,
}

/// What a finished job leaves behind.
#[derive(Debug, Clone)]
pub struct Completion {
    pub receipt: Receipt,
    pub receipt_hash: Digest,
    pub escalated: bool,
    pub routed_to_review: bool,
    /// Set when this job's receipt filled and sealed a batch.
    pub sealed: Option<BatchManifest>,
    /// The receipt filled the batch but the seal failed; it stays pending.
    pub seal_deferred: bool,
}

/// Why a directly submitted job was not started.
#[derive(Error, Debug)]
pub enum SubmitError {
    #[error("no slot serves model {0}")]
    UnknownModel(String),
    #[error(transparent)]
    Busy(#[from] SlotError),
    #[error(transparent)]
    Rejected(#[from] WorkerError),
    #[error("worker is shutting down")]
    ShuttingDown,
}

pub type JobHandle = JoinHandle<Result<Completion, WorkerError>>;

pub struct JobDispatcher {
    config: DispatcherConfig,
    assignments: Vec<SlotAssignment>,
    slots: Arc<SlotTable>,
    sampler: AdaptiveSampler,
    receipts: ReceiptFactory,
    sealer: Arc<BatchSealer>,
    inference: Arc<dyn InferenceProvider>,
    queue: Arc<dyn JobQueue>,
    review: Arc<dyn ReviewSink>,
    observers: Vec<Arc<dyn JobObserver>>,
    accepting: AtomicBool,
    /// Last confidence seen per model, used to size K for that model's next job.
    priors: Mutex<HashMap<String, f64>>,
}

impl JobDispatcher {
    pub fn new(
        config: DispatcherConfig,
        assignments: Vec<SlotAssignment>,
        sampler: AdaptiveSampler,
        receipts: ReceiptFactory,
        sealer: Arc<BatchSealer>,
        collaborators: Collaborators,
    ) -> Self {
        let slots = SlotTable::new(assignments.iter().map(|a| a.slot_id));
        Self {
            config,
            assignments,
            slots,
            sampler,
            receipts,
            sealer,
            inference: collaborators.inference,
            queue: collaborators.queue,
            review: collaborators.review,
            observers: Vec::new(),
            accepting: AtomicBool::new(true),
            priors: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn JobObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn slots(&self) -> &Arc<SlotTable> {
        &self.slots
    }

    pub fn sealer(&self) -> &Arc<BatchSealer> {
        &self.sealer
    }

    pub fn assignments(&self) -> &[SlotAssignment] {
        &self.assignments
    }

    /// Poll until `shutdown` flips to true, then wait for in-flight jobs to finish.
    ///
    /// Jobs run on their own tasks; the loop never waits on one.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(slots = self.assignments.len(), "dispatcher started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            self.poll_once().await;
            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        self.accepting.store(false, Ordering::SeqCst);
        let busy = self.slots.busy_count();
        if busy > 0 {
            info!(busy, "waiting for in-flight jobs");
        }
        self.slots.wait_idle().await;
        info!("dispatcher stopped");
    }

    /// One pass over the slots: every free slot with a pending job gets a task.
    pub async fn poll_once(self: &Arc<Self>) -> Vec<JobHandle> {
        let mut spawned = Vec::new();
        for assignment in &self.assignments {
            let slot = assignment.slot_id;
            let model = assignment.model.as_str();
            if !self.slots.is_free(slot) {
                continue;
            }

            let job = match self.queue.pop(model).await {
                Ok(Some(job)) => job,
                Ok(None) => continue,
                Err(e) => {
                    warn!(model, error = %e, "queue poll failed");
                    continue;
                }
            };

            if let Err(e) = self.admit(&job) {
                error!(model, job_id = %job.job_id, error = %e, "dropping job");
                continue;
            }

            let guard = match self.slots.try_claim(slot, &job.job_id) {
                Ok(guard) => guard,
                Err(e) => {
                    warn!(model, job_id = %job.job_id, error = %e, "claim failed, returning job to queue");
                    if let Err(e) = self.queue.push(model, job).await {
                        error!(model, error = %e, "could not return job to queue");
                    }
                    continue;
                }
            };

            spawned.push(self.spawn_job(guard, model, job));
        }
        spawned
    }

    /// Start `job` on a free slot serving `model`, bypassing the queue.
    pub fn submit(self: &Arc<Self>, model: &str, job: JobDescriptor) -> Result<(SlotId, JobHandle), SubmitError> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(SubmitError::ShuttingDown);
        }
        self.admit(&job)?;

        let mut busy = None;
        for assignment in self.assignments.iter().filter(|a| a.model == model) {
            match self.slots.try_claim(assignment.slot_id, &job.job_id) {
                Ok(guard) => {
                    let slot = guard.slot();
                    info!(model, job_id = %job.job_id, slot, "job submitted directly");
                    return Ok((slot, self.spawn_job(guard, model, job)));
                }
                Err(e) => busy = Some(e),
            }
        }
        Err(match busy {
            Some(e) => SubmitError::Busy(e),
            None => SubmitError::UnknownModel(model.to_string()),
        })
    }

    /// Jobs must have a usable id and no receipt yet.
    fn admit(&self, job: &JobDescriptor) -> Result<(), WorkerError> {
        validate_job_id(&job.job_id)?;
        if self.sealer.contains(&job.job_id) {
            return Err(WorkerError::DuplicateJob(job.job_id.clone()));
        }
        Ok(())
    }

    fn spawn_job(self: &Arc<Self>, guard: SlotGuard, model: &str, job: JobDescriptor) -> JobHandle {
        let span = info_span!("job", job_id = %job.job_id, model, slot = guard.slot());
        let this = Arc::clone(self);
        let model = model.to_string();
        tokio::spawn(async move { this.execute(guard, &model, job).await }.instrument(span))
    }

    /// Run one claimed job to a terminal state. The slot is released when
    /// this returns, on every path.
    pub async fn execute(
        &self,
        guard: SlotGuard,
        model: &str,
        job: JobDescriptor,
    ) -> Result<Completion, WorkerError> {
        let started = Instant::now();
        let mut attempt = JobAttempt {
            job_id: job.job_id,
            model: model.to_string(),
            input_payload: job.findings,
            slot_id: guard.slot(),
            k_samples: 0,
            attempt_number: 0,
        };
        enter(&attempt, JobState::Claimed);
        for o in &self.observers {
            o.job_started(model, attempt.slot_id);
        }

        let result = self.drive(&mut attempt).await;
        drop(guard);

        let duration_ms = started.elapsed().as_millis() as u64;
        match &result {
            Ok(done) => {
                enter(&attempt, JobState::Done);
                info!(
                    job_id = %attempt.job_id,
                    confidence = done.receipt.confidence_score,
                    k_samples = done.receipt.k_samples_used,
                    escalated = done.escalated,
                    receipt = %done.receipt_hash.short(),
                    duration_ms,
                    "job completed"
                );
                let completion = JobCompletion {
                    confidence: done.receipt.confidence_score,
                    k_samples: done.receipt.k_samples_used,
                    inference_latency_ms: done.receipt.inference_latency_ms,
                    duration_ms,
                    escalated: done.escalated,
                    routed_to_review: done.routed_to_review,
                };
                for o in &self.observers {
                    o.job_completed(model, &completion);
                }
            }
            Err(e) => {
                enter(&attempt, JobState::Failed);
                warn!(job_id = %attempt.job_id, kind = %e.kind(), error = %e, duration_ms, "job failed");
                for o in &self.observers {
                    o.job_failed(model, e.kind());
                }
            }
        }
        result
    }

    async fn drive(&self, attempt: &mut JobAttempt) -> Result<Completion, WorkerError> {
        if self.sealer.contains(&attempt.job_id) {
            return Err(WorkerError::DuplicateJob(attempt.job_id.clone()));
        }

        enter(attempt, JobState::Sampling);
        attempt.k_samples = self.sampler.initial_k(self.prior_for(&attempt.model));

        let mut outcome = self.infer(attempt).await?;

        enter(attempt, JobState::MaybeEscalating);
        let max_k = self.sampler.max_k();
        let escalated = self.sampler.should_escalate(outcome.confidence, attempt.k_samples, max_k);
        if escalated {
            info!(
                job_id = %attempt.job_id,
                confidence = outcome.confidence,
                from_k = attempt.k_samples,
                to_k = max_k,
                "low confidence, escalating"
            );
            attempt.k_samples = max_k;
            outcome = self.infer(attempt).await?;
        }
        self.record_prior(&attempt.model, outcome.confidence);

        enter(attempt, JobState::Completing);
        self.complete(attempt, outcome, escalated).await
    }

    async fn infer(&self, attempt: &mut JobAttempt) -> Result<InferenceOutcome, WorkerError> {
        attempt.attempt_number += 1;
        enter(attempt, JobState::Inferring);
        let request = InferenceRequest {
            model: attempt.model.clone(),
            findings: attempt.input_payload.clone(),
            k_samples: attempt.k_samples,
            max_new_tokens: self.config.max_new_tokens,
            use_int8: self.config.use_int8,
            use_flash_attention: self.config.use_flash_attention,
        };
        tokio::time::timeout(self.config.job_timeout, self.inference.infer(&request))
            .await
            .map_err(|_| WorkerError::Timeout(self.config.job_timeout))?
    }

    async fn complete(
        &self,
        attempt: &JobAttempt,
        outcome: InferenceOutcome,
        escalated: bool,
    ) -> Result<Completion, WorkerError> {
        let output_bytes = canonicalize(&outcome.output)?;
        let report = report::write(
            &self.config.output_dir,
            &ReportInput {
                job_id: &attempt.job_id,
                model: &attempt.model,
                worker_identity: self.receipts.worker_identity(),
                confidence: outcome.confidence,
                k_samples: attempt.k_samples,
                result: &outcome.output,
            },
        )
        .await?;

        let receipt = self.receipts.create(ExecutionFacts {
            job_id: &attempt.job_id,
            model: &attempt.model,
            input_payload: attempt.input_payload.as_bytes(),
            output_payload: &output_bytes,
            report_payload: &report.bytes,
            latency_ms: outcome.latency_ms,
            confidence: outcome.confidence,
            k_samples: attempt.k_samples,
            epoch: self.config.epoch,
        });
        let receipt_hash = receipt.compute_hash()?;

        // From here on the receipt is durable, so the job completes even if its batch cannot seal yet.
        let (sealed, seal_deferred) = match self.sealer.append(receipt.clone()).await? {
            SealOutcome::Pending => (None, false),
            SealOutcome::Sealed(manifest) => (Some(manifest), false),
            SealOutcome::Deferred(e) => {
                warn!(job_id = %receipt.job_id, error = %e, "receipt kept pending, batch seal deferred");
                for o in &self.observers {
                    o.seal_deferred(e.kind());
                }
                (None, true)
            }
        };

        if self.config.sign_receipts {
            match self.receipts.sign(&receipt_hash).await {
                Ok(sig) => {
                    if let Err(e) = self.sealer.store().write_receipt_signature(&receipt.job_id, &sig).await {
                        warn!(job_id = %receipt.job_id, error = %e, "receipt signature not persisted");
                    }
                }
                Err(e) => warn!(job_id = %receipt.job_id, error = %e, "receipt left unsigned"),
            }
        }

        let mut routed_to_review = false;
        if outcome.confidence < self.sampler.low_confidence_threshold() {
            let request = ReviewRequest {
                job_id: attempt.job_id.clone(),
                model: attempt.model.clone(),
                confidence: outcome.confidence,
                report_reference: report.path.display().to_string(),
            };
            match self.review.submit(request).await {
                Ok(()) => {
                    info!(job_id = %attempt.job_id, confidence = outcome.confidence, "routed to human review");
                    routed_to_review = true;
                }
                Err(e) => warn!(job_id = %attempt.job_id, error = %e, "human review submission failed"),
            }
        }

        Ok(Completion { receipt, receipt_hash, escalated, routed_to_review, sealed, seal_deferred })
    }

    fn priors(&self) -> std::sync::MutexGuard<'_, HashMap<String, f64>> {
        self.priors.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn prior_for(&self, model: &str) -> Option<f64> {
        self.priors().get(model).copied()
    }

    fn record_prior(&self, model: &str, confidence: u8) {
        self.priors().insert(model.to_string(), f64::from(confidence));
    }
}

fn enter(attempt: &JobAttempt, state: JobState) {
    debug!(
        job_id = %attempt.job_id,
        slot = attempt.slot_id,
        attempt = attempt.attempt_number,
        k_samples = attempt.k_samples,
        state = ?state,
        "job state"
    );
}
