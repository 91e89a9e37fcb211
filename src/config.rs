use std::collections::HashSet;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::RetryConfig;
use crate::sampler::SamplingConfig;
use crate::types::SlotId;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid environment variable {0}: {1}")]
    InvalidEnvVar(String, String),
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotAssignment {
    pub slot_id: SlotId,
    pub model: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Pretty,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    // Identity
    pub worker_identity: String,
    #[serde(skip_serializing)]
    pub worker_sk_hex: Option<String>,
    pub sign_receipts: bool,
    pub epoch: u64,

    // Slots and queues
    pub slots: Vec<SlotAssignment>,
    pub queue_url: String,
    pub queue_prefix: String,
    pub human_review_queue: String,
    pub poll_interval_ms: u64,

    // Inference
    pub inference_url: String,
    pub job_timeout_ms: u64,
    pub max_new_tokens: u32,
    pub use_int8: bool,
    pub use_flash_attention: bool,
    pub sampling: SamplingConfig,

    // Receipts
    pub receipts_dir: PathBuf,
    pub output_dir: PathBuf,
    pub merkle_batch_size: usize,
    pub max_retries: u32,
    pub retry_delay_ms: u64,

    // Monitoring and logging
    pub log_level: String,
    pub log_format: LogFormat,
    pub health_port: u16,
    pub metrics_enabled: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            worker_identity: "bumble70b.swarmbee.eth".to_string(),
            worker_sk_hex: None,
            sign_receipts: false,
            epoch: 0,

            slots: vec![
                SlotAssignment { slot_id: 0, model: "queenbee-spine".to_string() },
                SlotAssignment { slot_id: 1, model: "queenbee-chest".to_string() },
            ],
            queue_url: "http://localhost:8001".to_string(),
            queue_prefix: "jobs".to_string(),
            human_review_queue: "jobs:human_review:pending".to_string(),
            poll_interval_ms: 500,

            inference_url: "http://localhost:8000".to_string(),
            job_timeout_ms: 300_000,
            max_new_tokens: 512,
            use_int8: true,
            use_flash_attention: true,
            sampling: SamplingConfig::default(),

            receipts_dir: PathBuf::from("./data/receipts"),
            output_dir: PathBuf::from("./data/outputs"),
            merkle_batch_size: 100,
            max_retries: 3,
            retry_delay_ms: 1000,

            log_level: "info".to_string(),
            log_format: LogFormat::Json,
            health_port: 9090,
            metrics_enabled: true,
        }
    }
}

fn parse<T: FromStr>(key: &str, val: String) -> Result<T, ConfigError> {
    val.parse().map_err(|_| ConfigError::InvalidEnvVar(key.to_string(), val))
}

fn parse_flag(val: &str) -> bool {
    matches!(val, "1" | "true" | "yes")
}

/// `0=queenbee-spine;1=queenbee-chest`
fn parse_slots(key: &str, val: &str) -> Result<Vec<SlotAssignment>, ConfigError> {
    val.split(';')
        .filter(|s| !s.trim().is_empty())
        .map(|entry| {
            let (id, model) = entry
                .split_once('=')
                .ok_or_else(|| ConfigError::InvalidEnvVar(key.to_string(), entry.to_string()))?;
            Ok(SlotAssignment { slot_id: parse(key, id.trim().to_string())?, model: model.trim().to_string() })
        })
        .collect()
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from any key lookup; unset keys keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Config::default();

        if let Some(val) = lookup("WORKER_IDENTITY") {
            config.worker_identity = val;
        }
        config.worker_sk_hex = lookup("WORKER_SK_HEX").filter(|v| !v.is_empty());
        if let Some(val) = lookup("SIGN_RECEIPTS") {
            config.sign_receipts = parse_flag(&val);
        }
        if let Some(val) = lookup("EPOCH") {
            config.epoch = parse("EPOCH", val)?;
        }

        if let Some(val) = lookup("SLOT_MODELS") {
            config.slots = parse_slots("SLOT_MODELS", &val)?;
        }
        if let Some(val) = lookup("QUEUE_URL") {
            config.queue_url = val;
        }
        if let Some(val) = lookup("QUEUE_PREFIX") {
            config.queue_prefix = val;
        }
        if let Some(val) = lookup("HUMAN_REVIEW_QUEUE") {
            config.human_review_queue = val;
        }
        if let Some(val) = lookup("POLL_INTERVAL_MS") {
            config.poll_interval_ms = parse("POLL_INTERVAL_MS", val)?;
        }

        if let Some(val) = lookup("INFERENCE_URL") {
            config.inference_url = val;
        }
        if let Some(val) = lookup("JOB_TIMEOUT_MS") {
            config.job_timeout_ms = parse("JOB_TIMEOUT_MS", val)?;
        }
        if let Some(val) = lookup("MAX_NEW_TOKENS") {
            config.max_new_tokens = parse("MAX_NEW_TOKENS", val)?;
        }
        if let Some(val) = lookup("USE_INT8") {
            config.use_int8 = parse_flag(&val);
        }
        if let Some(val) = lookup("USE_FLASH_ATTENTION") {
            config.use_flash_attention = parse_flag(&val);
        }

        let s = &mut config.sampling;
        if let Some(val) = lookup("DYNAMIC_K_ENABLED") {
            s.dynamic_k_enabled = parse_flag(&val);
        }
        if let Some(val) = lookup("DEFAULT_K_SAMPLES") {
            s.default_k = parse("DEFAULT_K_SAMPLES", val)?;
        }
        if let Some(val) = lookup("MIN_K") {
            s.min_k = parse("MIN_K", val)?;
        }
        if let Some(val) = lookup("MAX_K") {
            s.max_k = parse("MAX_K", val)?;
        }
        if let Some(val) = lookup("CONFIDENCE_THRESHOLD_HIGH") {
            s.confidence_threshold_high = parse("CONFIDENCE_THRESHOLD_HIGH", val)?;
        }
        if let Some(val) = lookup("CONFIDENCE_THRESHOLD_LOW") {
            s.confidence_threshold_low = parse("CONFIDENCE_THRESHOLD_LOW", val)?;
        }
        if let Some(val) = lookup("LOW_CONFIDENCE_THRESHOLD") {
            s.low_confidence_threshold = parse("LOW_CONFIDENCE_THRESHOLD", val)?;
        }

        if let Some(val) = lookup("RECEIPTS_DIR") {
            config.receipts_dir = PathBuf::from(val);
        }
        if let Some(val) = lookup("OUTPUT_DIR") {
            config.output_dir = PathBuf::from(val);
        }
        if let Some(val) = lookup("MERKLE_BATCH_SIZE") {
            config.merkle_batch_size = parse("MERKLE_BATCH_SIZE", val)?;
        }
        if let Some(val) = lookup("MAX_RETRIES") {
            config.max_retries = parse("MAX_RETRIES", val)?;
        }
        if let Some(val) = lookup("RETRY_DELAY_MS") {
            config.retry_delay_ms = parse("RETRY_DELAY_MS", val)?;
        }

        if let Some(val) = lookup("LOG_LEVEL") {
            config.log_level = val;
        }
        if let Some(val) = lookup("LOG_FORMAT") {
            config.log_format = match val.as_str() {
                "json" => LogFormat::Json,
                "pretty" => LogFormat::Pretty,
                _ => return Err(ConfigError::InvalidEnvVar("LOG_FORMAT".to_string(), val)),
            };
        }
        if let Some(val) = lookup("HEALTH_PORT") {
            config.health_port = parse("HEALTH_PORT", val)?;
        }
        if let Some(val) = lookup("METRICS_ENABLED") {
            config.metrics_enabled = parse_flag(&val);
        }

        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let fail = |msg: &str| Err(ConfigError::ValidationError(msg.to_string()));

        if let Some(sk) = &self.worker_sk_hex {
            if sk.len() != 64 || !sk.chars().all(|c| c.is_ascii_hexdigit()) {
                return fail("WORKER_SK_HEX must be 64 hex characters");
            }
        }
        if self.sign_receipts && self.worker_sk_hex.is_none() {
            return fail("SIGN_RECEIPTS requires WORKER_SK_HEX");
        }

        if self.slots.is_empty() {
            return fail("at least one slot must be assigned a model");
        }
        let mut seen = HashSet::new();
        for slot in &self.slots {
            if !seen.insert(slot.slot_id) {
                return fail("slot ids must be unique");
            }
            if slot.model.is_empty() {
                return fail("slot model names must not be empty");
            }
        }

        if !self.queue_url.starts_with("http") {
            return fail("QUEUE_URL must be a valid HTTP URL");
        }
        if !self.inference_url.starts_with("http") {
            return fail("INFERENCE_URL must be a valid HTTP URL");
        }
        if self.poll_interval_ms == 0 || self.job_timeout_ms == 0 {
            return fail("POLL_INTERVAL_MS and JOB_TIMEOUT_MS must be greater than 0");
        }

        let s = &self.sampling;
        if s.min_k == 0 || s.min_k > s.default_k || s.default_k > s.max_k {
            return fail("K samples must satisfy 1 <= MIN_K <= DEFAULT_K_SAMPLES <= MAX_K");
        }
        let in_range = |v: f64| (0.0..=100.0).contains(&v);
        if !in_range(s.confidence_threshold_low)
            || !in_range(s.confidence_threshold_high)
            || s.confidence_threshold_low >= s.confidence_threshold_high
        {
            return fail("confidence thresholds must satisfy 0 <= LOW < HIGH <= 100");
        }
        if s.low_confidence_threshold > 100 {
            return fail("LOW_CONFIDENCE_THRESHOLD must be within 0..=100");
        }

        if self.merkle_batch_size == 0 {
            return fail("MERKLE_BATCH_SIZE must be greater than 0");
        }

        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_millis(self.job_timeout_ms)
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig::new(self.max_retries, Duration::from_millis(self.retry_delay_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> =
            pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn defaults_are_valid() {
        let config = Config::from_lookup(lookup(&[])).unwrap();
        config.validate().unwrap();
        assert_eq!(config.sampling.default_k, 5);
        assert_eq!(config.slots.len(), 2);
    }

    #[test]
    fn reads_overrides() {
        let config = Config::from_lookup(lookup(&[
            ("SLOT_MODELS", "0=queenbee-spine; 2=other"),
            ("MERKLE_BATCH_SIZE", "8"),
            ("MIN_K", "2"),
            ("DYNAMIC_K_ENABLED", "0"),
            ("LOG_FORMAT", "pretty"),
        ]))
        .unwrap();
        assert_eq!(config.slots[1], SlotAssignment { slot_id: 2, model: "other".into() });
        assert_eq!(config.merkle_batch_size, 8);
        assert_eq!(config.sampling.min_k, 2);
        assert!(!config.sampling.dynamic_k_enabled);
        assert_eq!(config.log_format, LogFormat::Pretty);
    }

    #[test]
    fn bad_numbers_are_reported_by_key() {
        let err = Config::from_lookup(lookup(&[("MAX_K", "seven")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEnvVar(k, v) if k == "MAX_K" && v == "seven"));
        assert!(Config::from_lookup(lookup(&[("SLOT_MODELS", "nonsense")])).is_err());
    }

    #[test]
    fn validation_rejects_inconsistent_values() {
        let bad_k = Config::from_lookup(lookup(&[("MIN_K", "6")])).unwrap();
        assert!(bad_k.validate().is_err());

        let bad_thresholds = Config::from_lookup(lookup(&[("CONFIDENCE_THRESHOLD_LOW", "80")])).unwrap();
        assert!(bad_thresholds.validate().is_err());

        let dup = Config::from_lookup(lookup(&[("SLOT_MODELS", "0=a;0=b")])).unwrap();
        assert!(dup.validate().is_err());

        let short_key = Config::from_lookup(lookup(&[("WORKER_SK_HEX", "abcd")])).unwrap();
        assert!(short_key.validate().is_err());

        let sign_without_key = Config::from_lookup(lookup(&[("SIGN_RECEIPTS", "1")])).unwrap();
        assert!(sign_without_key.validate().is_err());
    }
}
