use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::fs;
use tracing::warn;

use crate::error::WorkerError;
use crate::hashing::canonicalize;
use crate::types::{BatchManifest, Receipt};

const MANIFEST_SUFFIX: &str = "_manifest.json";

/// File layout for receipts and sealed batches:
///
/// ```text
/// <root>/<job_id>_receipt.json
/// <root>/<job_id>_receipt.sig
/// <root>/batches/<batch_id>_manifest.json
/// ```
///
/// Files are written to a temporary name and renamed into place, so a reader
/// never observes a partially written receipt or manifest.
#[derive(Debug, Clone)]
pub struct ReceiptStore {
    root: PathBuf,
}

/// Job ids become file names, so only a conservative character set is allowed.
pub fn validate_job_id(job_id: &str) -> Result<(), WorkerError> {
    let ok = !job_id.is_empty()
        && job_id.len() <= 128
        && !job_id.starts_with('.')
        && job_id.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if ok {
        Ok(())
    } else {
        Err(WorkerError::InvalidJob(format!("unusable job id {job_id:?}")))
    }
}

impl ReceiptStore {
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, WorkerError> {
        let root = root.into();
        let batches = root.join("batches");
        fs::create_dir_all(&batches)
            .await
            .map_err(|e| WorkerError::persistence(&batches, e))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn batches_dir(&self) -> PathBuf {
        self.root.join("batches")
    }

    pub fn receipt_path(&self, job_id: &str) -> PathBuf {
        self.root.join(format!("{job_id}_receipt.json"))
    }

    pub fn manifest_path(&self, batch_id: &str) -> PathBuf {
        self.batches_dir().join(format!("{batch_id}{MANIFEST_SUFFIX}"))
    }

    pub async fn write_receipt(&self, receipt: &Receipt) -> Result<PathBuf, WorkerError> {
        validate_job_id(&receipt.job_id)?;
        let path = self.receipt_path(&receipt.job_id);
        write_canonical(&path, receipt).await?;
        Ok(path)
    }

    pub async fn read_receipt(&self, job_id: &str) -> Result<Option<Receipt>, WorkerError> {
        validate_job_id(job_id)?;
        read_json(&self.receipt_path(job_id)).await
    }

    pub async fn write_receipt_signature(&self, job_id: &str, signature: &str) -> Result<(), WorkerError> {
        validate_job_id(job_id)?;
        let path = self.root.join(format!("{job_id}_receipt.sig"));
        write_atomic(&path, signature.as_bytes()).await
    }

    pub async fn write_manifest(&self, manifest: &BatchManifest) -> Result<PathBuf, WorkerError> {
        let path = self.manifest_path(&manifest.batch_id);
        write_canonical(&path, manifest).await?;
        Ok(path)
    }

    pub async fn read_manifest(&self, batch_id: &str) -> Result<Option<BatchManifest>, WorkerError> {
        read_json(&self.manifest_path(batch_id)).await
    }

    /// All readable manifests, ordered by batch id. Unreadable files are skipped.
    pub async fn manifests(&self) -> Result<Vec<BatchManifest>, WorkerError> {
        let dir = self.batches_dir();
        let mut entries = fs::read_dir(&dir)
            .await
            .map_err(|e| WorkerError::persistence(&dir, e))?;

        let mut out = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| WorkerError::persistence(&dir, e))?
        {
            let path = entry.path();
            let is_manifest = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with(MANIFEST_SUFFIX));
            if !is_manifest {
                continue;
            }
            match read_json::<BatchManifest>(&path).await {
                Ok(Some(m)) => out.push(m),
                Ok(None) => {}
                Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable manifest"),
            }
        }
        out.sort_by(|a, b| a.batch_id.cmp(&b.batch_id));
        Ok(out)
    }
}

async fn write_canonical<T: Serialize>(path: &Path, value: &T) -> Result<(), WorkerError> {
    let bytes = canonicalize(value)?;
    write_atomic(path, &bytes).await
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), WorkerError> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    fs::write(&tmp, bytes)
        .await
        .map_err(|e| WorkerError::persistence(&tmp, e))?;
    fs::rename(&tmp, path)
        .await
        .map_err(|e| WorkerError::persistence(path, e))
}

async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, WorkerError> {
    let bytes = match fs::read(path).await {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(WorkerError::persistence(path, e)),
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|e| WorkerError::Integrity(format!("{}: {e}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hashing::{hash_bytes, Digest};
    use chrono::Utc;

    fn receipt(job_id: &str) -> Receipt {
        Receipt {
            job_id: job_id.into(),
            worker_identity: "bee.test".into(),
            model: "m".into(),
            input_hash: hash_bytes(b"i"),
            output_hash: hash_bytes(b"o"),
            report_hash: hash_bytes(b"r"),
            inference_latency_ms: 10,
            confidence_score: 90,
            k_samples_used: 3,
            timestamp: Utc::now(),
            epoch: 0,
            external_reference: None,
        }
    }

    #[tokio::test]
    async fn receipt_file_is_canonical_json() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ReceiptStore::open(dir.path()).await.unwrap();
        let r = receipt("job-a");
        let path = store.write_receipt(&r).await.unwrap();

        let on_disk = std::fs::read(&path).unwrap();
        assert_eq!(on_disk, canonicalize(&r).unwrap());
        assert_eq!(store.read_receipt("job-a").await.unwrap(), Some(r));
        assert_eq!(store.read_receipt("job-b").await.unwrap(), None);
    }

    #[tokio::test]
    async fn manifests_are_listed_in_batch_order() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ReceiptStore::open(dir.path()).await.unwrap();
        for (id, job) in [("batch_0_000002", "j2"), ("batch_0_000001", "j1")] {
            let m = BatchManifest {
                batch_id: id.into(),
                epoch: 0,
                worker_identity: "bee.test".into(),
                created_at: Utc::now(),
                receipt_count: 1,
                merkle_root: Digest([7; 32]),
                job_ids: vec![job.into()],
                signature: None,
            };
            store.write_manifest(&m).await.unwrap();
        }
        std::fs::write(dir.path().join("batches/garbage_manifest.json"), b"{not json").unwrap();

        let ids: Vec<_> = store.manifests().await.unwrap().into_iter().map(|m| m.batch_id).collect();
        assert_eq!(ids, vec!["batch_0_000001", "batch_0_000002"]);
        assert_eq!(store.read_manifest("batch_0_000002").await.unwrap().unwrap().job_ids, vec!["j2"]);
        assert!(store.read_manifest("batch_0_000009").await.unwrap().is_none());
    }

    #[test]
    fn job_ids_that_escape_the_directory_are_rejected() {
        assert!(validate_job_id("job_123-abc").is_ok());
        assert!(validate_job_id("../etc/passwd").is_err());
        assert!(validate_job_id("a/b").is_err());
        assert!(validate_job_id("").is_err());
        assert!(validate_job_id(".hidden").is_err());
    }
}
