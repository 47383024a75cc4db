/*!
 * Anomaly detectors.
 *
 * A detector is attached to one (device, metric) series and sees every
 * sample of it in arrival order.
 */
use std::collections::VecDeque;
use std::sync::Mutex;

use iotflow_core::telemetry::TelemetryMetric;
use iotflow_core::types::Value;
use serde_json::json;

/// Decides whether a sample is anomalous
pub trait AnomalyDetector: Send + Sync {
    /// Inspect the next sample of the series
    fn check(&self, metric: &TelemetryMetric) -> bool;

    /// Threshold description reported with detections
    fn threshold(&self) -> Value;
}

/// Flags samples outside fixed bounds
#[derive(Debug, Clone, Default)]
pub struct ThresholdDetector {
    min: Option<f64>,
    max: Option<f64>,
}

impl ThresholdDetector {
    /// Create a detector; either bound may be open
    pub fn new(min: Option<f64>, max: Option<f64>) -> Self {
        Self { min, max }
    }
}

impl AnomalyDetector for ThresholdDetector {
    fn check(&self, metric: &TelemetryMetric) -> bool {
        self.min.map_or(false, |min| metric.value < min)
            || self.max.map_or(false, |max| metric.value > max)
    }

    fn threshold(&self) -> Value {
        json!({ "min": self.min, "max": self.max })
    }
}

/// Flags samples far from the recent mean in standard deviations.
///
/// The score is computed against the samples seen before the current one.
/// Nothing is flagged until `min_samples` samples (the current one
/// included) have been seen, nor while the baseline has no spread.
#[derive(Debug)]
pub struct ZScoreDetector {
    threshold: f64,
    window: usize,
    min_samples: usize,
    history: Mutex<VecDeque<f64>>,
}

impl ZScoreDetector {
    /// Default score above which a sample is anomalous
    pub const DEFAULT_THRESHOLD: f64 = 3.0;
    /// Default number of samples in the baseline
    pub const DEFAULT_WINDOW: usize = 100;
    /// Samples required before anything is flagged
    pub const MIN_SAMPLES: usize = 10;

    /// Create a detector flagging scores above `threshold` over a rolling
    /// baseline of `window` samples
    pub fn new(threshold: f64, window: usize) -> Self {
        Self {
            threshold,
            window: window.max(2),
            min_samples: Self::MIN_SAMPLES,
            history: Mutex::new(VecDeque::new()),
        }
    }

    fn score(baseline: &VecDeque<f64>, value: f64) -> Option<f64> {
        let n = baseline.len();
        if n < 2 {
            return None;
        }
        let mean = baseline.iter().sum::<f64>() / n as f64;
        let var = baseline.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1) as f64;
        let stddev = var.sqrt();
        if stddev == 0.0 || !stddev.is_finite() {
            return None;
        }
        Some(((value - mean) / stddev).abs())
    }
}

impl Default for ZScoreDetector {
    fn default() -> Self {
        Self::new(Self::DEFAULT_THRESHOLD, Self::DEFAULT_WINDOW)
    }
}

impl AnomalyDetector for ZScoreDetector {
    fn check(&self, metric: &TelemetryMetric) -> bool {
        let Ok(mut history) = self.history.lock() else {
            return false;
        };
        let anomalous = history.len() + 1 >= self.min_samples
            && Self::score(&history, metric.value).map_or(false, |z| z > self.threshold);
        if history.len() == self.window {
            history.pop_front();
        }
        history.push_back(metric.value);
        anomalous
    }

    fn threshold(&self) -> Value {
        json!(self.threshold)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use iotflow_core::types::Params;

    fn reading(value: f64) -> TelemetryMetric {
        TelemetryMetric {
            device_id: "d".into(),
            metric_name: "temperature".into(),
            value,
            unit: None,
            timestamp: Utc::now(),
            metadata: Params::new(),
        }
    }

    #[test]
    fn test_threshold_bounds() {
        let detector = ThresholdDetector::new(Some(0.0), Some(40.0));
        assert!(detector.check(&reading(-0.1)));
        assert!(detector.check(&reading(40.5)));
        assert!(!detector.check(&reading(40.0)));
        assert!(!ThresholdDetector::new(None, Some(10.0)).check(&reading(-100.0)));
        assert_eq!(detector.threshold(), json!({"min": 0.0, "max": 40.0}));
    }

    #[test]
    fn test_zscore_flags_outlier_after_baseline() {
        let detector = ZScoreDetector::default();
        for i in 0..20 {
            let v = if i % 2 == 0 { 20.0 } else { 20.2 };
            assert!(!detector.check(&reading(v)));
        }
        assert!(detector.check(&reading(25.0)));
        assert!(!detector.check(&reading(20.1)));
    }

    #[test]
    fn test_zscore_needs_minimum_samples() {
        let detector = ZScoreDetector::default();
        for v in [20.0, 20.2, 20.0, 20.2, 20.0, 20.2, 20.0, 20.2] {
            assert!(!detector.check(&reading(v)));
        }
        // ninth sample: still below the minimum
        assert!(!detector.check(&reading(90.0)));
    }

    #[test]
    fn test_zscore_flags_tenth_sample() {
        let detector = ZScoreDetector::default();
        for v in [20.0, 20.2, 20.0, 20.2, 20.0, 20.2, 20.0, 20.2, 20.0] {
            assert!(!detector.check(&reading(v)));
        }
        // nine samples of baseline make the tenth eligible
        assert!(detector.check(&reading(90.0)));
    }

    #[test]
    fn test_zscore_silent_without_spread() {
        let detector = ZScoreDetector::default();
        for _ in 0..20 {
            assert!(!detector.check(&reading(21.0)));
        }
        assert!(!detector.check(&reading(21.0)));
    }

    #[test]
    fn test_zscore_window_rolls() {
        let detector = ZScoreDetector::new(3.0, 10);
        for i in 0..50 {
            detector.check(&reading(if i % 2 == 0 { 1.0 } else { 2.0 }));
        }
        assert_eq!(detector.history.lock().unwrap().len(), 10);
    }
}
