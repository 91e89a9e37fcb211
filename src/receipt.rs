use std::sync::Arc;

use chrono::Utc;

use crate::hashing::{Digest, hash_bytes};
use crate::signing::{Signer, SigningNamespace, SigningUnavailable};
use crate::types::Receipt;

/// Facts about one finished job, as handed to the factory.
#[derive(Debug, Clone)]
pub struct ExecutionFacts<'a> {
    pub job_id: &'a str,
    pub model: &'a str,
    pub input_payload: &'a [u8],
    pub output_payload: &'a [u8],
    pub report_payload: &'a [u8],
    pub latency_ms: u64,
    pub confidence: u8,
    pub k_samples: u32,
    pub epoch: u64,
}

pub struct ReceiptFactory {
    worker_identity: String,
    signer: Option<Arc<dyn Signer>>,
}

impl ReceiptFactory {
    pub fn new(worker_identity: impl Into<String>, signer: Option<Arc<dyn Signer>>) -> Self {
        Self { worker_identity: worker_identity.into(), signer }
    }

    pub fn worker_identity(&self) -> &str {
        &self.worker_identity
    }

    pub fn create(&self, facts: ExecutionFacts<'_>) -> Receipt {
        Receipt {
            job_id: facts.job_id.to_string(),
            worker_identity: self.worker_identity.clone(),
            model: facts.model.to_string(),
            input_hash: hash_bytes(facts.input_payload),
            output_hash: hash_bytes(facts.output_payload),
            report_hash: hash_bytes(facts.report_payload),
            inference_latency_ms: facts.latency_ms,
            confidence_score: facts.confidence.min(100),
            k_samples_used: facts.k_samples,
            timestamp: Utc::now(),
            epoch: facts.epoch,
            external_reference: None,
        }
    }

    /// Ask the external signer for a signature over a receipt hash
    /// (see [`Receipt::compute_hash`]).
    ///
    /// The receipt is valid evidence without a signature; an absent or
    /// unreachable signer surfaces as `SigningUnavailable` for the caller to log.
    pub async fn sign(&self, receipt_hash: &Digest) -> Result<String, SigningUnavailable> {
        let Some(signer) = &self.signer else {
            return Err(SigningUnavailable("no signer configured".into()));
        };
        signer.sign(SigningNamespace::Receipt, receipt_hash).await
    }
}
