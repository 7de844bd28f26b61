//! Tail sampling
//!
//! Decides per complete trace. Errors and slow calls are always kept, the
//! rest is kept with the configured base probability.

use rand::Rng;
use std::time::Duration;

use crate::config::SamplerConfig;
use crate::model::StorageSpan;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplingDecision {
    KeepError,
    KeepSlow,
    KeepSampled,
    Drop,
}

impl SamplingDecision {
    pub fn is_keep(self) -> bool {
        !matches!(self, SamplingDecision::Drop)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SamplingDecision::KeepError => "error",
            SamplingDecision::KeepSlow => "slow",
            SamplingDecision::KeepSampled => "sampled",
            SamplingDecision::Drop => "dropped",
        }
    }
}

/// Stateless tail sampler, safe to share between storage threads
#[derive(Debug, Clone)]
pub struct TailSampler {
    sample_rate: f64,
    slow_threshold_us: i64,
}

impl TailSampler {
    pub fn new(sample_rate: f64, slow_threshold: Duration) -> Self {
        Self {
            sample_rate: sample_rate.clamp(0.0, 1.0),
            slow_threshold_us: i64::try_from(slow_threshold.as_micros()).unwrap_or(i64::MAX),
        }
    }

    pub fn from_config(config: &SamplerConfig) -> Self {
        Self::new(config.sample_rate, config.slow_threshold())
    }

    pub fn decide(&self, spans: &[StorageSpan]) -> SamplingDecision {
        self.decide_with(spans, &mut rand::thread_rng())
    }

    /// Same as `decide` with a caller-supplied random source
    pub fn decide_with<R: Rng>(&self, spans: &[StorageSpan], rng: &mut R) -> SamplingDecision {
        if spans.is_empty() {
            return SamplingDecision::Drop;
        }
        if spans.iter().any(StorageSpan::is_error) {
            return SamplingDecision::KeepError;
        }
        if spans.iter().any(|s| s.duration_us > self.slow_threshold_us) {
            return SamplingDecision::KeepSlow;
        }
        if rng.gen::<f64>() < self.sample_rate {
            SamplingDecision::KeepSampled
        } else {
            SamplingDecision::Drop
        }
    }

    pub fn is_sampled(&self, spans: &[StorageSpan]) -> bool {
        self.decide(spans).is_keep()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{STATUS_ERROR, STATUS_OK};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn span(duration_us: i64, status: &str) -> StorageSpan {
        StorageSpan {
            trace_id: "t".into(),
            duration_us,
            status_code: status.into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_error_trace_always_kept() {
        let sampler = TailSampler::new(0.0, Duration::from_secs(2));
        let trace = vec![span(10, STATUS_OK), span(20, STATUS_ERROR), span(5, STATUS_OK)];
        for _ in 0..1000 {
            assert!(sampler.is_sampled(&trace));
        }
        assert_eq!(sampler.decide(&trace), SamplingDecision::KeepError);
    }

    #[test]
    fn test_slow_trace_always_kept() {
        let sampler = TailSampler::new(0.0, Duration::from_millis(100));
        let trace = vec![span(10, STATUS_OK), span(100_001, STATUS_OK)];
        for _ in 0..1000 {
            assert_eq!(sampler.decide(&trace), SamplingDecision::KeepSlow);
        }
    }

    #[test]
    fn test_threshold_is_exclusive() {
        let sampler = TailSampler::new(0.0, Duration::from_millis(100));
        let trace = vec![span(100_000, STATUS_OK)];
        assert_eq!(sampler.decide(&trace), SamplingDecision::Drop);
    }

    #[test]
    fn test_base_rate_is_respected() {
        let sampler = TailSampler::new(0.3, Duration::from_secs(2));
        let trace = vec![span(10, STATUS_OK)];
        let mut rng = StdRng::seed_from_u64(7);

        let trials = 20_000;
        let kept = (0..trials)
            .filter(|_| sampler.decide_with(&trace, &mut rng).is_keep())
            .count();
        let ratio = kept as f64 / trials as f64;
        assert!((ratio - 0.3).abs() < 0.02, "kept ratio {}", ratio);
    }

    #[test]
    fn test_rate_extremes() {
        let trace = vec![span(10, STATUS_OK)];
        let keep_all = TailSampler::new(1.0, Duration::from_secs(2));
        let keep_none = TailSampler::new(0.0, Duration::from_secs(2));
        for _ in 0..1000 {
            assert!(keep_all.is_sampled(&trace));
            assert!(!keep_none.is_sampled(&trace));
        }
    }

    #[test]
    fn test_empty_trace_dropped() {
        let sampler = TailSampler::new(1.0, Duration::from_secs(2));
        assert!(!sampler.is_sampled(&[]));
    }
}
