//! KL-weight and noise-scale annealing
//!
//! Both scalars move linearly from their initial to their final value over
//! `annealing_epochs` and then hold. The schedule is evaluated once at the
//! start of every epoch; the resulting [`AnnealingState`] is copied into the
//! loss and the encoder's sampling step.

use serde::{Deserialize, Serialize};

use crate::config::CvaeConfig;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AnnealingState {
    pub epoch: usize,
    pub kl_weight: f32,
    pub noise_scale: f32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AnnealingSchedule {
    enabled: bool,
    kl_weight: (f32, f32),
    noise_scale: (f32, f32),
    epochs: usize,
}

impl AnnealingSchedule {
    pub fn new(enabled: bool, kl_weight: (f32, f32), noise_scale: (f32, f32), epochs: usize) -> Self {
        Self { enabled, kl_weight, noise_scale, epochs }
    }

    pub fn from_config(config: &CvaeConfig) -> Self {
        Self::new(
            config.annealing,
            (config.kl_weight_initial, config.kl_weight_final),
            (config.noise_scale_initial, config.noise_scale_final),
            config.annealing_epochs,
        )
    }

    /// `min((epoch + 1) / epochs, 1)`; an empty ramp is complete immediately.
    pub fn progress(&self, epoch: usize) -> f32 {
        if self.epochs == 0 {
            return 1.0;
        }
        ((epoch + 1) as f32 / self.epochs as f32).min(1.0)
    }

    pub fn at(&self, epoch: usize) -> AnnealingState {
        if !self.enabled {
            return AnnealingState { epoch, kl_weight: self.kl_weight.0, noise_scale: self.noise_scale.0 };
        }
        let progress = self.progress(epoch);
        AnnealingState {
            epoch,
            kl_weight: lerp(self.kl_weight, progress),
            noise_scale: lerp(self.noise_scale, progress),
        }
    }
}

fn lerp((initial, final_value): (f32, f32), progress: f32) -> f32 {
    if progress >= 1.0 {
        final_value
    } else {
        initial + (final_value - initial) * progress
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_ramp_is_monotonic_and_lands_exactly() {
        let schedule = AnnealingSchedule::new(true, (0.05, 0.1), (0.1, 0.01), 7);
        let states: Vec<_> = (0..12).map(|e| schedule.at(e)).collect();
        for pair in states.windows(2) {
            assert!(pair[1].kl_weight >= pair[0].kl_weight);
            assert!(pair[1].noise_scale <= pair[0].noise_scale);
        }
        for state in &states[6..] {
            assert_eq!(state.kl_weight, 0.1);
            assert_eq!(state.noise_scale, 0.01);
        }
        assert!(states[5].kl_weight < 0.1);
        assert_relative_eq!(states[0].kl_weight, 0.05 + 0.05 / 7.0, epsilon = 1e-7);
    }

    #[test]
    fn test_disabled_schedule_holds_initial_values() {
        let schedule = AnnealingSchedule::new(false, (0.05, 0.1), (0.1, 0.01), 10);
        for epoch in [0, 9, 50] {
            let state = schedule.at(epoch);
            assert_eq!((state.kl_weight, state.noise_scale), (0.05, 0.1));
        }
    }

    #[test]
    fn test_zero_length_ramp_uses_final_values() {
        let schedule = AnnealingSchedule::new(true, (0.0, 1.0), (1.0, 0.0), 0);
        let state = schedule.at(0);
        assert_eq!((state.kl_weight, state.noise_scale), (1.0, 0.0));
    }
}
