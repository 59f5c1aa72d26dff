//! Duration estimation for acceptance responses.

use std::collections::HashMap;
use std::sync::RwLock;

/// Default estimate before any observation exists for a topic.
const DEFAULT_ESTIMATE_MS: u64 = 15_000;

/// Smoothing factor for the rolling average.
const ALPHA: f64 = 0.3;

/// Per-topic rolling estimate of generation time.
///
/// Fed from `processing_time_ms` on completed jobs; read when intake accepts
/// a new job so the client knows roughly how long to wait before polling.
pub struct DurationEstimator {
    estimates: RwLock<HashMap<String, f64>>,
}

impl DurationEstimator {
    pub fn new() -> Self {
        Self {
            estimates: RwLock::new(HashMap::new()),
        }
    }

    /// Current estimate for a topic.
    pub fn estimate_ms(&self, topic_id: &str) -> u64 {
        self.estimates
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(topic_id)
            .map(|ms| *ms as u64)
            .unwrap_or(DEFAULT_ESTIMATE_MS)
    }

    /// Fold an observed processing time into the estimate.
    pub fn record(&self, topic_id: &str, observed_ms: u64) {
        let mut estimates = self.estimates.write().unwrap_or_else(|e| e.into_inner());
        let entry = estimates
            .entry(topic_id.to_string())
            .or_insert(observed_ms as f64);
        *entry = *entry * (1.0 - ALPHA) + observed_ms as f64 * ALPHA;
    }
}

impl Default for DurationEstimator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_topic_uses_default() {
        let estimator = DurationEstimator::new();
        assert_eq!(estimator.estimate_ms("goal-setting"), DEFAULT_ESTIMATE_MS);
    }

    #[test]
    fn estimate_tracks_observations() {
        let estimator = DurationEstimator::new();
        estimator.record("goal-setting", 4_000);
        assert_eq!(estimator.estimate_ms("goal-setting"), 4_000);

        estimator.record("goal-setting", 8_000);
        let blended = estimator.estimate_ms("goal-setting");
        assert!(blended > 4_000 && blended < 8_000);
    }
}
