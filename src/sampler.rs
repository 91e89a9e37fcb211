use serde::{Deserialize, Serialize};

/// K-sample sizing. Thresholds are on the same 0–100 scale as inference confidence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplingConfig {
    pub dynamic_k_enabled: bool,
    pub default_k: u32,
    pub min_k: u32,
    pub max_k: u32,
    pub confidence_threshold_high: f64,
    pub confidence_threshold_low: f64,
    /// Below this a job escalates once (and is routed to human review).
    pub low_confidence_threshold: u8,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            dynamic_k_enabled: true,
            default_k: 5,
            min_k: 3,
            max_k: 7,
            confidence_threshold_high: 75.0,
            confidence_threshold_low: 55.0,
            low_confidence_threshold: 55,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AdaptiveSampler {
    config: SamplingConfig,
}

impl AdaptiveSampler {
    pub fn new(config: SamplingConfig) -> Self {
        Self { config }
    }

    pub fn max_k(&self) -> u32 {
        self.config.max_k
    }

    pub fn low_confidence_threshold(&self) -> u8 {
        self.config.low_confidence_threshold
    }

    /// Higher prior confidence means fewer samples.
    pub fn initial_k(&self, prior_confidence: Option<f64>) -> u32 {
        let c = &self.config;
        if !c.dynamic_k_enabled {
            return c.default_k;
        }
        let Some(conf) = prior_confidence else {
            return c.default_k;
        };

        if conf >= c.confidence_threshold_high {
            c.min_k
        } else if conf <= c.confidence_threshold_low {
            c.max_k
        } else {
            let ratio = (conf - c.confidence_threshold_low)
                / (c.confidence_threshold_high - c.confidence_threshold_low);
            let k = c.max_k as f64 - ratio * (c.max_k - c.min_k) as f64;
            (k.floor() as u32).clamp(c.min_k, c.max_k)
        }
    }

    /// Whether an attempt that used `k_used` samples should be rerun at `max_k`.
    /// Callers apply this at most once per job.
    pub fn should_escalate(&self, confidence: u8, k_used: u32, max_k: u32) -> bool {
        confidence < self.config.low_confidence_threshold && k_used < max_k
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sampler() -> AdaptiveSampler {
        AdaptiveSampler::new(SamplingConfig::default())
    }

    #[test]
    fn thresholds_map_to_bounds() {
        let s = sampler();
        assert_eq!(s.initial_k(Some(75.0)), 3);
        assert_eq!(s.initial_k(Some(99.0)), 3);
        assert_eq!(s.initial_k(Some(55.0)), 7);
        assert_eq!(s.initial_k(Some(10.0)), 7);
    }

    #[test]
    fn midpoint_interpolates() {
        let s = sampler();
        assert_eq!(s.initial_k(Some(65.0)), 5);
        // 60 -> ratio .25 -> 7 - 1 = 6
        assert_eq!(s.initial_k(Some(60.0)), 6);
        // 74 -> 7 - 3.8 = 3.2 -> 3
        assert_eq!(s.initial_k(Some(74.0)), 3);
    }

    #[test]
    fn default_without_prior_or_when_disabled() {
        let s = sampler();
        assert_eq!(s.initial_k(None), 5);

        let fixed = AdaptiveSampler::new(SamplingConfig { dynamic_k_enabled: false, ..SamplingConfig::default() });
        assert_eq!(fixed.initial_k(Some(99.0)), 5);
    }

    #[test]
    fn escalation_requires_low_confidence_and_headroom() {
        let s = sampler();
        assert!(s.should_escalate(54, 5, 7));
        assert!(!s.should_escalate(55, 5, 7));
        assert!(!s.should_escalate(10, 7, 7));
    }
}
