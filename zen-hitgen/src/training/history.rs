//! Per-epoch training history
//!
//! Serialized as a flat `{metric: [value per epoch]}` object, the same shape
//! Keras writes for `history.history`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub const LOSS: &str = "loss";
pub const RECONSTRUCTION_LOSS: &str = "reconstruction_loss";
pub const KL_LOSS: &str = "kl_loss";
pub const KL_WEIGHT: &str = "kl_weight";
pub const NOISE_SCALE: &str = "noise_scale";
pub const LEARNING_RATE: &str = "learning_rate";

/// Epoch means plus the schedule values the epoch ran with.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EpochMetrics {
    pub loss: f32,
    pub reconstruction_loss: f32,
    pub kl_loss: f32,
    pub kl_weight: f32,
    pub noise_scale: f32,
    pub learning_rate: f32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TrainingHistory {
    metrics: BTreeMap<String, Vec<f64>>,
}

impl TrainingHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, metric: &str, value: f64) {
        self.metrics.entry(metric.to_string()).or_default().push(value);
    }

    pub fn record(&mut self, epoch: &EpochMetrics) {
        self.push(LOSS, epoch.loss as f64);
        self.push(RECONSTRUCTION_LOSS, epoch.reconstruction_loss as f64);
        self.push(KL_LOSS, epoch.kl_loss as f64);
        self.push(KL_WEIGHT, epoch.kl_weight as f64);
        self.push(NOISE_SCALE, epoch.noise_scale as f64);
        self.push(LEARNING_RATE, epoch.learning_rate as f64);
    }

    pub fn get(&self, metric: &str) -> Option<&[f64]> {
        self.metrics.get(metric).map(Vec::as_slice)
    }

    pub fn metric_names(&self) -> impl Iterator<Item = &str> {
        self.metrics.keys().map(String::as_str)
    }

    /// Number of recorded epochs.
    pub fn len(&self) -> usize {
        self.get(LOSS).map_or(0, <[f64]>::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `(epoch, value)` of the lowest finite total loss.
    pub fn best_loss(&self) -> Option<(usize, f64)> {
        self.get(LOSS)?
            .iter()
            .copied()
            .enumerate()
            .filter(|(_, v)| v.is_finite())
            .min_by(|a, b| a.1.total_cmp(&b.1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn epoch(loss: f32) -> EpochMetrics {
        EpochMetrics {
            loss,
            reconstruction_loss: loss * 0.9,
            kl_loss: loss,
            kl_weight: 0.1,
            noise_scale: 0.01,
            learning_rate: 1e-3,
        }
    }

    #[test]
    fn test_best_loss_and_len() {
        let mut history = TrainingHistory::new();
        assert!(history.is_empty());
        assert_eq!(history.best_loss(), None);
        for loss in [0.5, 0.25, 0.375] {
            history.record(&epoch(loss));
        }
        assert_eq!(history.len(), 3);
        assert_eq!(history.best_loss(), Some((1, 0.25)));
        assert_eq!(history.metric_names().count(), 6);
    }

    #[test]
    fn test_serializes_as_flat_metric_map() {
        let mut history = TrainingHistory::new();
        history.record(&epoch(0.5));
        let json = serde_json::to_value(&history).unwrap();
        assert_eq!(json["loss"], serde_json::json!([0.5]));
        let back: TrainingHistory = serde_json::from_value(json).unwrap();
        assert_eq!(back, history);
    }
}
