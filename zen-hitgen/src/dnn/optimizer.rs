/**
 * @file zen-hitgen/src/dnn/optimizer.rs
 * @brief Parameter updates and learning-rate control
 *
 * - **AdamOptimizer**: bias-corrected Adam over every tensor in a `ParamStore`
 * - **clip_gradients**: global-norm clipping
 * - **ReduceLrOnPlateau**: multiplicative decay after a stalled monitor, with
 *   cooldown and a floor
 */

use log::debug;

#[cfg(feature = "parallel")]
use rayon::prelude::*;

use super::params::ParamStore;
use super::Matrix;
use crate::errors::{HitGenError, HitGenResult};

// === ADAM ===

#[derive(Debug, Clone)]
pub struct AdamOptimizer {
    learning_rate: f32,
    beta1: f32,
    beta2: f32,
    epsilon: f32,
    t: u32,          // Time step
    m: Vec<Matrix>, // First moment
    v: Vec<Matrix>, // Second moment
}

impl AdamOptimizer {
    pub fn new(learning_rate: f32) -> Self {
        Self::with_betas(learning_rate, 0.9, 0.999, 1e-7)
    }

    pub fn with_betas(learning_rate: f32, beta1: f32, beta2: f32, epsilon: f32) -> Self {
        Self {
            learning_rate,
            beta1,
            beta2,
            epsilon,
            t: 0,
            m: Vec::new(),
            v: Vec::new(),
        }
    }

    pub fn learning_rate(&self) -> f32 {
        self.learning_rate
    }

    pub fn set_learning_rate(&mut self, learning_rate: f32) {
        self.learning_rate = learning_rate;
    }

    pub fn steps(&self) -> u32 {
        self.t
    }

    pub fn reset(&mut self) {
        self.t = 0;
        self.m.clear();
        self.v.clear();
    }

    /// Apply one update; `gradients` are aligned with `store` order.
    pub fn update(&mut self, store: &mut ParamStore, gradients: &[Matrix]) -> HitGenResult<()> {
        if gradients.len() != store.len() {
            return Err(HitGenError::shape(format!(
                "{} gradients for {} parameters",
                gradients.len(),
                store.len()
            )));
        }
        if self.m.len() != store.len() {
            self.m = store.values().map(|p| Matrix::zeros(p.raw_dim())).collect();
            self.v = store.values().map(|p| Matrix::zeros(p.raw_dim())).collect();
        }

        self.t += 1;
        let (beta1, beta2, eps) = (self.beta1, self.beta2, self.epsilon);
        // Bias correction factors
        let bias_correction1 = 1.0 - beta1.powi(self.t as i32);
        let bias_correction2 = 1.0 - beta2.powi(self.t as i32);
        let step = self.learning_rate * bias_correction2.sqrt() / bias_correction1;

        let apply = |((param, grad), (m, v)): ((&mut Matrix, &Matrix), (&mut Matrix, &mut Matrix))| {
            ndarray::Zip::from(param)
                .and(grad)
                .and(m)
                .and(v)
                .for_each(|p, &g, m, v| {
                    *m = beta1 * *m + (1.0 - beta1) * g;
                    *v = beta2 * *v + (1.0 - beta2) * g * g;
                    *p -= step * *m / (v.sqrt() + eps);
                });
        };

        let params: Vec<&mut Matrix> = store.values_mut().collect();
        #[cfg(feature = "parallel")]
        params
            .into_par_iter()
            .zip(gradients.par_iter())
            .zip(self.m.par_iter_mut().zip(self.v.par_iter_mut()))
            .for_each(apply);
        #[cfg(not(feature = "parallel"))]
        params
            .into_iter()
            .zip(gradients.iter())
            .zip(self.m.iter_mut().zip(self.v.iter_mut()))
            .for_each(apply);

        Ok(())
    }
}

// === GRADIENT CLIPPING ===

/// Rescale all gradients so their joint L2 norm is at most `max_norm`.
pub fn clip_gradients(gradients: &mut [Matrix], max_norm: f32) -> f32 {
    let total_norm = gradients
        .iter()
        .map(|g| g.iter().map(|&x| x * x).sum::<f32>())
        .sum::<f32>()
        .sqrt();
    if total_norm > max_norm && total_norm > 0.0 {
        let scale = max_norm / total_norm;
        for grad in gradients.iter_mut() {
            *grad *= scale;
        }
    }
    total_norm
}

// === LEARNING RATE SCHEDULE ===

/// Reduce the learning rate when the monitored loss stops improving.
#[derive(Debug, Clone)]
pub struct ReduceLrOnPlateau {
    current_lr: f32,
    factor: f32,
    patience: usize,
    cooldown: usize,
    min_lr: f32,
    threshold: f32,
    wait_count: usize,
    cooldown_counter: usize,
    best_metric: f32,
}

impl ReduceLrOnPlateau {
    pub fn new(initial_lr: f32, factor: f32, patience: usize, cooldown: usize, min_lr: f32) -> Self {
        Self {
            current_lr: initial_lr,
            factor,
            patience,
            cooldown,
            min_lr,
            threshold: 1e-4,
            wait_count: 0,
            cooldown_counter: 0,
            best_metric: f32::INFINITY,
        }
    }

    /// Record one epoch's metric; returns the (possibly reduced) learning rate.
    pub fn step(&mut self, metric: f32) -> f32 {
        if self.cooldown_counter > 0 {
            self.cooldown_counter -= 1;
            self.wait_count = 0;
        }

        if metric < self.best_metric - self.threshold {
            self.best_metric = metric;
            self.wait_count = 0;
        } else if self.cooldown_counter == 0 {
            self.wait_count += 1;
            if self.wait_count >= self.patience && self.current_lr > self.min_lr {
                let reduced = (self.current_lr * self.factor).max(self.min_lr);
                debug!("Plateau after {} epochs: learning rate {} -> {}", self.wait_count, self.current_lr, reduced);
                self.current_lr = reduced;
                self.cooldown_counter = self.cooldown;
                self.wait_count = 0;
            }
        }
        self.current_lr
    }

    pub fn learning_rate(&self) -> f32 {
        self.current_lr
    }

    pub fn reset(&mut self) {
        self.wait_count = 0;
        self.cooldown_counter = 0;
        self.best_metric = f32::INFINITY;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::array;

    #[test]
    fn test_adam_first_step_moves_by_learning_rate() {
        let mut store = ParamStore::new();
        let id = store.register("w", array![[1.0, -1.0]]);
        let mut adam = AdamOptimizer::new(0.1);
        adam.update(&mut store, &[array![[2.0, -0.5]]]).unwrap();
        // bias-corrected first step is lr * sign(g)
        assert_relative_eq!(store.value(id)[[0, 0]], 0.9, epsilon = 1e-4);
        assert_relative_eq!(store.value(id)[[0, 1]], -0.9, epsilon = 1e-4);
        assert_eq!(adam.steps(), 1);
    }

    #[test]
    fn test_adam_minimizes_quadratic() {
        let mut store = ParamStore::new();
        let id = store.register("x", array![[5.0]]);
        let mut adam = AdamOptimizer::new(0.1);
        for _ in 0..500 {
            let grad = store.value(id) * 2.0;
            adam.update(&mut store, &[grad]).unwrap();
        }
        assert!(store.value(id)[[0, 0]].abs() < 0.05);
    }

    #[test]
    fn test_adam_rejects_misaligned_gradients() {
        let mut store = ParamStore::new();
        store.register("x", array![[5.0]]);
        let mut adam = AdamOptimizer::new(0.1);
        assert!(adam.update(&mut store, &[]).is_err());
    }

    #[test]
    fn test_clip_gradients_global_norm() {
        let mut grads = vec![array![[3.0]], array![[4.0]]];
        let norm = clip_gradients(&mut grads, 1.0);
        assert_relative_eq!(norm, 5.0);
        assert_relative_eq!(grads[0][[0, 0]], 0.6, epsilon = 1e-6);
        assert_relative_eq!(grads[1][[0, 0]], 0.8, epsilon = 1e-6);
    }

    #[test]
    fn test_plateau_halves_after_patience() {
        let mut sched = ReduceLrOnPlateau::new(1e-3, 0.5, 2, 0, 1e-6);
        assert_relative_eq!(sched.step(1.0), 1e-3);
        assert_relative_eq!(sched.step(1.0), 1e-3);
        assert_relative_eq!(sched.step(1.0), 5e-4);
        // improvement resets the wait
        assert_relative_eq!(sched.step(0.5), 5e-4);
        assert_relative_eq!(sched.step(0.5), 5e-4);
    }

    #[test]
    fn test_plateau_cooldown_and_floor() {
        let mut sched = ReduceLrOnPlateau::new(4e-6, 0.5, 1, 2, 1e-6);
        assert_relative_eq!(sched.step(1.0), 4e-6);
        assert_relative_eq!(sched.step(1.0), 2e-6);
        // cooldown blocks the next reduction
        assert_relative_eq!(sched.step(1.0), 2e-6);
        assert_relative_eq!(sched.step(1.0), 1e-6);
        sched.step(1.0);
        sched.step(1.0);
        assert_relative_eq!(sched.step(1.0), 1e-6);
    }
}
