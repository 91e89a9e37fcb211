use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::error::{RetryConfig, WorkerError};
use crate::hashing::Digest;
use crate::merkle::MerkleTree;
use crate::signing::{Signer, SigningNamespace};
use crate::store::ReceiptStore;
use crate::types::{BatchManifest, InclusionProof, Receipt};

#[derive(Debug, Clone)]
pub struct BatchConfig {
    pub worker_identity: String,
    pub epoch: u64,
    pub batch_size: usize,
    pub retry: RetryConfig,
}

/// What happened to the batch after a receipt was accepted. The receipt is
/// durable in every case.
#[derive(Debug)]
pub enum SealOutcome {
    Pending,
    Sealed(BatchManifest),
    /// The batch filled but could not be sealed. It stays open and the next
    /// append or flush retries the seal.
    Deferred(WorkerError),
}

impl SealOutcome {
    pub fn manifest(&self) -> Option<&BatchManifest> {
        match self {
            SealOutcome::Sealed(m) => Some(m),
            _ => None,
        }
    }

    pub fn into_manifest(self) -> Option<BatchManifest> {
        match self {
            SealOutcome::Sealed(m) => Some(m),
            _ => None,
        }
    }
}

#[derive(Debug, Default)]
struct BatchState {
    current: Vec<Receipt>,
    batch_counter: u64,
}

/// Accumulates receipts and commits them in fixed-size batches under a
/// signed Merkle root.
///
/// All appends and seals go through one async mutex, so concurrent job
/// completions can never both observe a "not yet full" batch and race a seal.
/// Counters and the job index live outside that mutex so status and proof
/// reads never wait behind a seal that is retrying.
pub struct BatchSealer {
    config: BatchConfig,
    store: ReceiptStore,
    signer: Option<Arc<dyn Signer>>,
    state: Mutex<BatchState>,
    pending: AtomicUsize,
    sealed_batches: AtomicU64,
    /// `job_id -> batch_id`, `None` while the receipt waits in the open batch.
    members: RwLock<HashMap<String, Option<String>>>,
}

impl BatchSealer {
    /// Resumes batch numbering after the highest manifest already on disk
    /// for this epoch and indexes every sealed job.
    pub async fn open(
        config: BatchConfig,
        store: ReceiptStore,
        signer: Option<Arc<dyn Signer>>,
    ) -> Result<Self, WorkerError> {
        if config.batch_size == 0 {
            return Err(WorkerError::ContractViolation("batch_size must be at least 1".into()));
        }
        let prefix = format!("batch_{}_", config.epoch);
        let mut batch_counter = 0;
        let mut members = HashMap::new();
        for manifest in store.manifests().await? {
            if let Some(n) = manifest.batch_id.strip_prefix(&prefix).and_then(|n| n.parse::<u64>().ok()) {
                batch_counter = batch_counter.max(n);
            }
            for job_id in manifest.job_ids {
                members.insert(job_id, Some(manifest.batch_id.clone()));
            }
        }
        if batch_counter > 0 {
            info!(epoch = config.epoch, batch_counter, sealed_jobs = members.len(), "resuming batch numbering");
        }
        Ok(Self {
            config,
            store,
            signer,
            state: Mutex::new(BatchState { current: Vec::new(), batch_counter }),
            pending: AtomicUsize::new(0),
            sealed_batches: AtomicU64::new(batch_counter),
            members: RwLock::new(members),
        })
    }

    pub fn store(&self) -> &ReceiptStore {
        &self.store
    }

    pub fn pending_len(&self) -> usize {
        self.pending.load(Ordering::Relaxed)
    }

    pub fn batch_counter(&self) -> u64 {
        self.sealed_batches.load(Ordering::Relaxed)
    }

    /// Whether `job_id` already has a receipt in the open batch or a sealed one.
    pub fn contains(&self, job_id: &str) -> bool {
        self.members().contains_key(job_id)
    }

    fn members(&self) -> RwLockReadGuard<'_, HashMap<String, Option<String>>> {
        self.members.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn members_mut(&self) -> RwLockWriteGuard<'_, HashMap<String, Option<String>>> {
        self.members.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Persist `receipt`, add it to the open batch and seal if the batch is full.
    ///
    /// Errors mean the receipt was not accepted: its file could not be written,
    /// or the job already has a receipt. A receipt is never overwritten once
    /// accepted. A failed seal is reported as [`SealOutcome::Deferred`].
    pub async fn append(&self, receipt: Receipt) -> Result<SealOutcome, WorkerError> {
        let mut state = self.state.lock().await;
        if self.contains(&receipt.job_id) {
            return Err(WorkerError::DuplicateJob(receipt.job_id));
        }
        self.store.write_receipt(&receipt).await?;
        self.members_mut().insert(receipt.job_id.clone(), None);
        debug!(job_id = %receipt.job_id, pending = state.current.len() + 1, "receipt appended");
        state.current.push(receipt);
        self.pending.store(state.current.len(), Ordering::Relaxed);

        if state.current.len() < self.config.batch_size {
            return Ok(SealOutcome::Pending);
        }
        match self.seal_locked(&mut state).await {
            Ok(manifest) => Ok(SealOutcome::Sealed(manifest)),
            Err(e) => {
                error!(pending = state.current.len(), error = %e, "seal failed, batch left open");
                Ok(SealOutcome::Deferred(e))
            }
        }
    }

    /// Seal a partial batch, e.g. at shutdown. No-op when nothing is pending.
    pub async fn flush(&self) -> Result<Option<BatchManifest>, WorkerError> {
        let mut state = self.state.lock().await;
        if state.current.is_empty() {
            return Ok(None);
        }
        self.seal_locked(&mut state).await.map(Some)
    }

    async fn seal_locked(&self, state: &mut BatchState) -> Result<BatchManifest, WorkerError> {
        let hashes = state
            .current
            .iter()
            .map(Receipt::compute_hash)
            .collect::<Result<Vec<Digest>, _>>()?;
        let tree = MerkleTree::build(&hashes);
        let merkle_root = tree
            .root_hash()
            .ok_or_else(|| WorkerError::ContractViolation("sealing an empty batch".into()))?;

        let next_counter = state.batch_counter + 1;
        let batch_id = format!("batch_{}_{:06}", self.config.epoch, next_counter);

        let signature = match &self.signer {
            Some(signer) => match signer.sign(SigningNamespace::MerkleRoot, &merkle_root).await {
                Ok(sig) => Some(sig),
                Err(e) => {
                    warn!(batch_id = %batch_id, error = %e, "batch root left unsigned");
                    None
                }
            },
            None => None,
        };

        let manifest = BatchManifest {
            batch_id: batch_id.clone(),
            epoch: self.config.epoch,
            worker_identity: self.config.worker_identity.clone(),
            created_at: Utc::now(),
            receipt_count: state.current.len(),
            merkle_root,
            job_ids: state.current.iter().map(|r| r.job_id.clone()).collect(),
            signature,
        };

        // A root that never reached disk proves nothing; keep the batch open on failure.
        self.config
            .retry
            .run("write batch manifest", || self.store.write_manifest(&manifest))
            .await?;

        {
            let mut members = self.members_mut();
            for job_id in &manifest.job_ids {
                members.insert(job_id.clone(), Some(batch_id.clone()));
            }
        }
        state.current.clear();
        state.batch_counter = next_counter;
        self.pending.store(0, Ordering::Relaxed);
        self.sealed_batches.store(next_counter, Ordering::Relaxed);
        info!(
            batch_id = %batch_id,
            receipt_count = manifest.receipt_count,
            merkle_root = %merkle_root.short(),
            signed = manifest.signature.is_some(),
            "sealed batch"
        );
        Ok(manifest)
    }

    /// Inclusion proof for a sealed job, rebuilt from the member receipts on disk.
    pub async fn get_proof(&self, job_id: &str) -> Result<InclusionProof, WorkerError> {
        let batch_id = self
            .members()
            .get(job_id)
            .cloned()
            .flatten()
            .ok_or_else(|| WorkerError::NotFound(format!("job {job_id} is not in any sealed batch")))?;
        let manifest = self
            .store
            .read_manifest(&batch_id)
            .await?
            .ok_or_else(|| WorkerError::NotFound(format!("manifest {batch_id} is missing")))?;

        let mut hashes = Vec::with_capacity(manifest.job_ids.len());
        let mut target = None;
        for member in &manifest.job_ids {
            let receipt = self.store.read_receipt(member).await?.ok_or_else(|| {
                WorkerError::NotFound(format!("receipt {member} of {} is missing", manifest.batch_id))
            })?;
            let hash = receipt.compute_hash()?;
            if member == job_id {
                target = Some(hash);
            }
            hashes.push(hash);
        }
        let receipt_hash =
            target.ok_or_else(|| WorkerError::NotFound(format!("job {job_id} not listed")))?;

        let tree = MerkleTree::build(&hashes);
        if tree.root_hash() != Some(manifest.merkle_root) {
            return Err(WorkerError::Integrity(format!(
                "receipts of {} no longer hash to the sealed root",
                manifest.batch_id
            )));
        }
        let proof = tree
            .prove(&receipt_hash)
            .ok_or_else(|| WorkerError::NotFound(format!("job {job_id} not in rebuilt tree")))?;

        Ok(InclusionProof {
            job_id: job_id.to_string(),
            receipt_hash,
            merkle_root: manifest.merkle_root,
            batch_id: manifest.batch_id,
            proof,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hashing::hash_bytes;
    use crate::signing::{Secp, SigningUnavailable};
    use async_trait::async_trait;
    use std::time::Duration;

    struct DownSigner;

    #[async_trait]
    impl Signer for DownSigner {
        async fn sign(&self, _: SigningNamespace, _: &Digest) -> Result<String, SigningUnavailable> {
            Err(SigningUnavailable("offline".into()))
        }
        fn key_ref(&self) -> String {
            "down".into()
        }
    }

    fn config(batch_size: usize) -> BatchConfig {
        BatchConfig {
            worker_identity: "bee.test".into(),
            epoch: 1,
            batch_size,
            retry: RetryConfig::new(0, Duration::from_millis(1)),
        }
    }

    fn receipt(job_id: &str) -> Receipt {
        Receipt {
            job_id: job_id.into(),
            worker_identity: "bee.test".into(),
            model: "m".into(),
            input_hash: hash_bytes(job_id.as_bytes()),
            output_hash: hash_bytes(b"o"),
            report_hash: hash_bytes(b"r"),
            inference_latency_ms: 5,
            confidence_score: 80,
            k_samples_used: 5,
            timestamp: Utc::now(),
            epoch: 1,
            external_reference: None,
        }
    }

    async fn sealer(dir: &std::path::Path, batch_size: usize, signer: Option<Arc<dyn Signer>>) -> BatchSealer {
        let store = ReceiptStore::open(dir).await.unwrap();
        BatchSealer::open(config(batch_size), store, signer).await.unwrap()
    }

    #[tokio::test]
    async fn full_batch_seals_exactly_once() {
        let dir = tempfile::tempdir().expect("tempdir");
        let s = sealer(dir.path(), 3, None).await;

        assert!(matches!(s.append(receipt("a")).await.unwrap(), SealOutcome::Pending));
        assert!(matches!(s.append(receipt("b")).await.unwrap(), SealOutcome::Pending));
        let manifest = s.append(receipt("c")).await.unwrap().into_manifest().expect("sealed");
        assert_eq!(manifest.receipt_count, 3);
        assert_eq!(manifest.batch_id, "batch_1_000001");
        assert_eq!(manifest.job_ids, vec!["a", "b", "c"]);
        assert!(manifest.signature.is_none());

        assert!(s.append(receipt("d")).await.unwrap().manifest().is_none());
        assert_eq!(s.pending_len(), 1);
        assert_eq!(s.batch_counter(), 1);
        assert_eq!(s.store().manifests().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn flush_seals_partial_and_is_noop_when_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let s = sealer(dir.path(), 10, None).await;
        assert!(s.flush().await.unwrap().is_none());

        s.append(receipt("a")).await.unwrap();
        let m = s.flush().await.unwrap().unwrap();
        assert_eq!(m.receipt_count, 1);
        assert_eq!(s.pending_len(), 0);
        assert!(s.flush().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn signer_outage_leaves_manifest_unsigned() {
        let dir = tempfile::tempdir().expect("tempdir");
        let s = sealer(dir.path(), 1, Some(Arc::new(DownSigner))).await;
        let m = s.append(receipt("a")).await.unwrap().into_manifest().unwrap();
        assert!(m.signature.is_none());
        assert!(s.store().read_manifest(&m.batch_id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn root_signature_verifies() {
        let dir = tempfile::tempdir().expect("tempdir");
        let secp = Secp::from_hex("4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318").unwrap();
        let pk = secp.key_ref();
        let s = sealer(dir.path(), 2, Some(Arc::new(secp))).await;
        s.append(receipt("a")).await.unwrap();
        let m = s.append(receipt("b")).await.unwrap().into_manifest().unwrap();
        let sig = m.signature.expect("signed");
        assert!(Secp::verify(&pk, SigningNamespace::MerkleRoot, &m.merkle_root, &sig));
    }

    #[tokio::test]
    async fn proofs_verify_for_every_member() {
        let dir = tempfile::tempdir().expect("tempdir");
        let s = sealer(dir.path(), 5, None).await;
        for id in ["a", "b", "c", "d", "e"] {
            s.append(receipt(id)).await.unwrap();
        }
        for id in ["a", "b", "c", "d", "e"] {
            let p = s.get_proof(id).await.unwrap();
            assert_eq!(p.batch_id, "batch_1_000001");
            assert!(p.verify(), "{id}");
        }
    }

    #[tokio::test]
    async fn proof_lookup_failures() {
        let dir = tempfile::tempdir().expect("tempdir");
        let s = sealer(dir.path(), 2, None).await;
        s.append(receipt("a")).await.unwrap();
        // pending, not sealed
        assert!(matches!(s.get_proof("a").await, Err(WorkerError::NotFound(_))));
        assert!(matches!(s.get_proof("ghost").await, Err(WorkerError::NotFound(_))));

        s.append(receipt("b")).await.unwrap();
        std::fs::remove_file(s.store().receipt_path("b")).unwrap();
        assert!(matches!(s.get_proof("a").await, Err(WorkerError::NotFound(_))));
    }

    #[tokio::test]
    async fn tampered_receipt_fails_integrity() {
        let dir = tempfile::tempdir().expect("tempdir");
        let s = sealer(dir.path(), 2, None).await;
        s.append(receipt("a")).await.unwrap();
        s.append(receipt("b")).await.unwrap();

        let mut forged = receipt("b");
        forged.confidence_score = 99;
        s.store().write_receipt(&forged).await.unwrap();
        assert!(matches!(s.get_proof("a").await, Err(WorkerError::Integrity(_))));
    }

    #[tokio::test]
    async fn manifest_write_failure_keeps_batch_open() {
        let dir = tempfile::tempdir().expect("tempdir");
        let s = sealer(dir.path(), 2, None).await;
        s.append(receipt("a")).await.unwrap();

        // Replace the batches directory with a file so the manifest write fails.
        let batches = dir.path().join("batches");
        std::fs::remove_dir_all(&batches).unwrap();
        std::fs::write(&batches, b"").unwrap();

        // The receipt itself is accepted; only the seal is deferred.
        let outcome = s.append(receipt("b")).await.unwrap();
        assert!(matches!(outcome, SealOutcome::Deferred(WorkerError::Persistence { .. })));
        assert!(s.store().read_receipt("b").await.unwrap().is_some());
        assert!(s.contains("b"));
        assert_eq!(s.pending_len(), 2);
        assert_eq!(s.batch_counter(), 0);

        std::fs::remove_file(&batches).unwrap();
        std::fs::create_dir(&batches).unwrap();
        let m = s.flush().await.unwrap().unwrap();
        assert_eq!(m.batch_id, "batch_1_000001");
        assert_eq!(m.receipt_count, 2);
    }

    #[tokio::test]
    async fn numbering_resumes_after_restart() {
        let dir = tempfile::tempdir().expect("tempdir");
        {
            let s = sealer(dir.path(), 1, None).await;
            s.append(receipt("a")).await.unwrap();
            s.append(receipt("b")).await.unwrap();
        }
        let s = sealer(dir.path(), 1, None).await;
        assert_eq!(s.batch_counter(), 2);
        let m = s.append(receipt("c")).await.unwrap().into_manifest().unwrap();
        assert_eq!(m.batch_id, "batch_1_000003");
    }

    #[tokio::test]
    async fn concurrent_appends_lose_nothing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let s = Arc::new(sealer(dir.path(), 4, None).await);
        let mut handles = Vec::new();
        for i in 0..10 {
            let s = Arc::clone(&s);
            handles.push(tokio::spawn(async move { s.append(receipt(&format!("job-{i}"))).await }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }
        s.flush().await.unwrap();

        let manifests = s.store().manifests().await.unwrap();
        assert_eq!(manifests.len(), 3);
        let mut all: Vec<String> = manifests.iter().flat_map(|m| m.job_ids.clone()).collect();
        all.sort();
        all.dedup();
        assert_eq!(all.len(), 10);
        assert_eq!(manifests.iter().map(|m| m.receipt_count).sum::<usize>(), 10);
    }

    #[tokio::test]
    async fn redelivered_job_cannot_overwrite_sealed_receipt() {
        let dir = tempfile::tempdir().expect("tempdir");
        let s = sealer(dir.path(), 2, None).await;
        s.append(receipt("job-a")).await.unwrap();
        s.append(receipt("job-b")).await.unwrap();
        let before = std::fs::read(s.store().receipt_path("job-a")).unwrap();

        let mut again = receipt("job-a");
        again.confidence_score = 12;
        let err = s.append(again).await.unwrap_err();
        assert!(matches!(err, WorkerError::DuplicateJob(ref id) if id == "job-a"));

        assert_eq!(std::fs::read(s.store().receipt_path("job-a")).unwrap(), before);
        assert_eq!(s.pending_len(), 0);
        assert!(s.get_proof("job-b").await.unwrap().verify());
    }

    #[tokio::test]
    async fn duplicate_in_open_batch_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let s = sealer(dir.path(), 5, None).await;
        s.append(receipt("a")).await.unwrap();
        assert!(matches!(s.append(receipt("a")).await, Err(WorkerError::DuplicateJob(_))));
        assert_eq!(s.pending_len(), 1);
    }

    #[tokio::test]
    async fn sealed_jobs_stay_indexed_after_restart() {
        let dir = tempfile::tempdir().expect("tempdir");
        {
            let s = sealer(dir.path(), 2, None).await;
            s.append(receipt("a")).await.unwrap();
            s.append(receipt("b")).await.unwrap();
        }
        let s = sealer(dir.path(), 2, None).await;
        assert!(s.contains("a"));
        assert!(!s.contains("c"));
        assert!(matches!(s.append(receipt("b")).await, Err(WorkerError::DuplicateJob(_))));
        assert_eq!(s.get_proof("a").await.unwrap().batch_id, "batch_1_000001");
    }

    #[tokio::test]
    async fn counters_do_not_wait_on_the_batch_lock() {
        let dir = tempfile::tempdir().expect("tempdir");
        let s = sealer(dir.path(), 5, None).await;
        s.append(receipt("a")).await.unwrap();

        let _sealing = s.state.lock().await;
        assert_eq!(s.pending_len(), 1);
        assert_eq!(s.batch_counter(), 0);
        assert!(s.contains("a"));
    }
}
