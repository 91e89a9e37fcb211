use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::hashing::{Digest, HashError, hash_canonical};
use crate::merkle::ProofStep;

pub type SlotId = u32;

/// Job descriptor as popped from a per-model queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDescriptor {
    pub job_id: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub findings: String,
    #[serde(default)]
    pub timestamp: Option<String>,
}

/// One job's execution context, owned by its dispatch task.
#[derive(Debug, Clone)]
pub struct JobAttempt {
    pub job_id: String,
    pub model: String,
    pub input_payload: String,
    pub slot_id: SlotId,
    pub k_samples: u32,
    pub attempt_number: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct InferenceRequest {
    pub model: String,
    pub findings: String,
    pub k_samples: u32,
    pub max_new_tokens: u32,
    pub use_int8: bool,
    pub use_flash_attention: bool,
}

#[derive(Debug, Clone)]
pub struct InferenceOutcome {
    /// 0..=100
    pub confidence: u8,
    pub output: serde_json::Value,
    pub latency_ms: u64,
}

/// Immutable evidence that one job ran with a given input, output and confidence.
///
/// Sub-hashes are computed independently so any single artifact can be checked
/// on its own; the receipt hash covers every field below.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    pub job_id: String,
    pub worker_identity: String,
    pub model: String,
    pub input_hash: Digest,
    pub output_hash: Digest,
    pub report_hash: Digest,
    pub inference_latency_ms: u64,
    pub confidence_score: u8,
    pub k_samples_used: u32,
    pub timestamp: DateTime<Utc>,
    pub epoch: u64,
    pub external_reference: Option<String>,
}

impl Receipt {
    pub fn compute_hash(&self) -> Result<Digest, HashError> {
        hash_canonical(self)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchManifest {
    pub batch_id: String,
    pub epoch: u64,
    pub worker_identity: String,
    pub created_at: DateTime<Utc>,
    pub receipt_count: usize,
    pub merkle_root: Digest,
    pub job_ids: Vec<String>,
    pub signature: Option<String>,
}

/// What a verifier needs to check one receipt against a sealed batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InclusionProof {
    pub job_id: String,
    pub receipt_hash: Digest,
    pub merkle_root: Digest,
    pub batch_id: String,
    pub proof: Vec<ProofStep>,
}

impl InclusionProof {
    pub fn verify(&self) -> bool {
        crate::merkle::verify_proof(&self.receipt_hash, &self.proof, &self.merkle_root)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewRequest {
    pub job_id: String,
    pub model: String,
    pub confidence: u8,
    pub report_reference: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hashing::hash_bytes;
    use chrono::TimeZone;

    fn receipt() -> Receipt {
        Receipt {
            job_id: "job-1".into(),
            worker_identity: "bee.test".into(),
            model: "queenbee-spine".into(),
            input_hash: hash_bytes(b"in"),
            output_hash: hash_bytes(b"out"),
            report_hash: hash_bytes(b"report"),
            inference_latency_ms: 1234,
            confidence_score: 80,
            k_samples_used: 5,
            timestamp: Utc.with_ymd_and_hms(2025, 1, 2, 3, 4, 5).unwrap(),
            epoch: 7,
            external_reference: None,
        }
    }

    #[test]
    fn receipt_hash_is_deterministic() {
        assert_eq!(receipt().compute_hash().unwrap(), receipt().compute_hash().unwrap());
    }

    #[test]
    fn any_field_change_changes_hash() {
        let base = receipt().compute_hash().unwrap();

        let mut r = receipt();
        r.confidence_score += 1;
        assert_ne!(r.compute_hash().unwrap(), base);

        let mut r = receipt();
        r.timestamp += chrono::Duration::nanoseconds(1);
        assert_ne!(r.compute_hash().unwrap(), base);

        let mut r = receipt();
        r.external_reference = Some("bafy".into());
        assert_ne!(r.compute_hash().unwrap(), base);
    }

    #[test]
    fn hash_survives_json_round_trip() {
        let r = receipt();
        let json = serde_json::to_string_pretty(&r).unwrap();
        let back: Receipt = serde_json::from_str(&json).unwrap();
        assert_eq!(back.compute_hash().unwrap(), r.compute_hash().unwrap());
    }

    #[test]
    fn job_descriptor_tolerates_missing_fields() {
        let job: JobDescriptor = serde_json::from_str(r#"{"job_id":"j9"}"#).unwrap();
        assert_eq!(job.job_id, "j9");
        assert!(job.findings.is_empty());
        assert!(job.model.is_none());
    }
}
