use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tracing::warn;

use crate::hashing::HashError;

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("inference transport failed: {0}")]
    Transport(String),
    #[error("inference timed out after {0:?}")]
    Timeout(Duration),
    #[error("persistence failed for {path}: {source}")]
    Persistence {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("not found: {0}")]
    NotFound(String),
    #[error("contract violation: {0}")]
    ContractViolation(String),
    #[error("invalid job: {0}")]
    InvalidJob(String),
    #[error("job {0} already has a receipt")]
    DuplicateJob(String),
    #[error("queue error: {0}")]
    Queue(String),
    #[error("integrity check failed: {0}")]
    Integrity(String),
}

impl WorkerError {
    pub fn persistence(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        WorkerError::Persistence { path: path.into(), source }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            WorkerError::Transport(_) => ErrorKind::Transport,
            WorkerError::Timeout(_) => ErrorKind::Timeout,
            WorkerError::Persistence { .. } => ErrorKind::Persistence,
            WorkerError::NotFound(_) => ErrorKind::NotFound,
            WorkerError::ContractViolation(_) => ErrorKind::ContractViolation,
            WorkerError::InvalidJob(_) => ErrorKind::InvalidJob,
            WorkerError::DuplicateJob(_) => ErrorKind::DuplicateJob,
            WorkerError::Queue(_) => ErrorKind::Queue,
            WorkerError::Integrity(_) => ErrorKind::Integrity,
        }
    }
}

impl From<HashError> for WorkerError {
    fn from(err: HashError) -> Self {
        // Only reachable through a bug in what we hash; make it loud in debug builds.
        debug_assert!(false, "canonical encoding failed: {err}");
        WorkerError::ContractViolation(err.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Transport,
    Timeout,
    Persistence,
    NotFound,
    ContractViolation,
    InvalidJob,
    DuplicateJob,
    Queue,
    Integrity,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::Transport => "transport",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Persistence => "persistence",
            ErrorKind::NotFound => "not_found",
            ErrorKind::ContractViolation => "contract_violation",
            ErrorKind::InvalidJob => "invalid_job",
            ErrorKind::DuplicateJob => "duplicate_job",
            ErrorKind::Queue => "queue",
            ErrorKind::Integrity => "integrity",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub backoff_multiplier: f64,
    pub max_retry_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay: Duration::from_millis(1000),
            backoff_multiplier: 2.0,
            max_retry_delay: Duration::from_secs(30),
        }
    }
}

impl RetryConfig {
    pub fn new(max_retries: u32, retry_delay: Duration) -> Self {
        Self { max_retries, retry_delay, ..Self::default() }
    }

    /// Run `operation` until it succeeds or `max_retries` extra attempts are spent,
    /// sleeping with exponential backoff in between. Returns the last error.
    pub async fn run<F, Fut, T, E>(&self, what: &str, mut operation: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let mut delay = self.retry_delay;
        let mut attempt = 0;
        loop {
            match operation().await {
                Ok(result) => return Ok(result),
                Err(error) if attempt < self.max_retries => {
                    attempt += 1;
                    warn!(what, attempt, error = %error, "retrying after failure");
                    tokio::time::sleep(delay).await;
                    delay = Duration::from_secs_f64(
                        (delay.as_secs_f64() * self.backoff_multiplier)
                            .min(self.max_retry_delay.as_secs_f64()),
                    );
                }
                Err(error) => return Err(error),
            }
        }
    }
}
