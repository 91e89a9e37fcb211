use std::path::{Path, PathBuf};

use chrono::Utc;
use serde_json::{Value, json};

use crate::error::WorkerError;
use crate::hashing::canonicalize;

/// A rendered job report: the canonical bytes that get hashed into the
/// receipt, and where they were written.
#[derive(Debug, Clone)]
pub struct Report {
    pub path: PathBuf,
    pub bytes: Vec<u8>,
}

pub struct ReportInput<'a> {
    pub job_id: &'a str,
    pub model: &'a str,
    pub worker_identity: &'a str,
    pub confidence: u8,
    pub k_samples: u32,
    pub result: &'a Value,
}

pub fn render(input: &ReportInput<'_>) -> Value {
    json!({
        "job_id": input.job_id,
        "model": input.model,
        "worker": input.worker_identity,
        "generated_at": Utc::now(),
        "confidence": input.confidence,
        "k_samples": input.k_samples,
        "result": input.result,
    })
}

pub async fn write(output_dir: &Path, input: &ReportInput<'_>) -> Result<Report, WorkerError> {
    let bytes = canonicalize(&render(input))?;
    tokio::fs::create_dir_all(output_dir)
        .await
        .map_err(|e| WorkerError::persistence(output_dir, e))?;
    let path = output_dir.join(format!("{}_report.json", input.job_id));
    tokio::fs::write(&path, &bytes)
        .await
        .map_err(|e| WorkerError::persistence(&path, e))?;
    Ok(Report { path, bytes })
}
