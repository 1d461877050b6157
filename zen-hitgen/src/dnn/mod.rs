/**
 * @file zen-hitgen/src/dnn/mod.rs
 * @brief Numeric core for the hierarchical CVAE
 *
 * Dense/recurrent building blocks over `ndarray::Array2<f32>` with a small
 * reverse-mode gradient tape. Every batch is laid out as a 2-D matrix of
 * `batch * window` rows by channel columns, so a time-distributed dense
 * layer is an ordinary matrix product and per-window operators (pooling,
 * recurrence) only need to know the window length.
 *
 * ## Modules:
 * - **tape**: operation recording and reverse-mode gradients
 * - **params**: named, serializable parameter tensors
 * - **layers**: dense, GRU and bidirectional GRU layers
 * - **optimizer**: Adam, gradient clipping, plateau learning-rate schedule
 */

use std::fmt;

use ndarray::Array2;
use ndarray_rand::rand_distr::{Normal, Uniform};
use ndarray_rand::RandomExt;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use crate::errors::{HitGenError, HitGenResult};

pub mod layers;
pub mod optimizer;
pub mod params;
pub mod tape;

pub use layers::{BidirectionalGru, DenseLayer, GruLayer};
pub use optimizer::{clip_gradients, AdamOptimizer, ReduceLrOnPlateau};
pub use params::{ParamId, ParamStore};
pub use tape::{Gradients, Tape, UnaryOp, Var};

/// Dense matrix used throughout the numeric core.
pub type Matrix = Array2<f32>;

/// Negative slope used by every leaky activation in the model.
pub const LEAKY_RELU_SLOPE: f32 = 0.01;

// === CORE TYPES ===

/// Activation applied after a dense projection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActivationType {
    Linear,
    ReLU,
    LeakyReLU,
    Sigmoid,
    Tanh,
    /// `min(max(x, 0), 1)`
    Saturating,
}

impl ActivationType {
    /// Tape operation implementing this activation (`None` for identity).
    pub fn unary_op(self) -> Option<UnaryOp> {
        match self {
            ActivationType::Linear => None,
            ActivationType::ReLU => Some(UnaryOp::Relu),
            ActivationType::LeakyReLU => Some(UnaryOp::LeakyRelu(LEAKY_RELU_SLOPE)),
            ActivationType::Sigmoid => Some(UnaryOp::Sigmoid),
            ActivationType::Tanh => Some(UnaryOp::Tanh),
            ActivationType::Saturating => Some(UnaryOp::Saturate),
        }
    }
}

impl fmt::Display for ActivationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ActivationType::Linear => "linear",
            ActivationType::ReLU => "relu",
            ActivationType::LeakyReLU => "leaky_relu",
            ActivationType::Sigmoid => "sigmoid",
            ActivationType::Tanh => "tanh",
            ActivationType::Saturating => "saturating_relu",
        };
        write!(f, "{}", name)
    }
}

/// Weight initialization strategies
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum WeightInitialization {
    /// He normal, suited to ReLU stacks
    He,
    /// Glorot uniform
    Xavier,
    Normal { mean: f32, std: f32 },
    Uniform { min: f32, max: f32 },
}

impl WeightInitialization {
    /// Draw a `(fan_in, fan_out)` weight matrix.
    pub fn sample<R: Rng + ?Sized>(self, fan_in: usize, fan_out: usize, rng: &mut R) -> HitGenResult<Matrix> {
        let shape = (fan_in, fan_out);
        let weights = match self {
            WeightInitialization::He => {
                let std = (2.0 / fan_in.max(1) as f32).sqrt();
                Array2::random_using(shape, normal(0.0, std)?, rng)
            }
            WeightInitialization::Xavier => {
                let limit = (6.0 / (fan_in + fan_out).max(1) as f32).sqrt();
                Array2::random_using(shape, Uniform::new_inclusive(-limit, limit), rng)
            }
            WeightInitialization::Normal { mean, std } => Array2::random_using(shape, normal(mean, std)?, rng),
            WeightInitialization::Uniform { min, max } => {
                if !(max > min) {
                    return Err(HitGenError::config(format!(
                        "uniform initialization needs min < max, got [{}, {})",
                        min, max
                    )));
                }
                Array2::random_using(shape, Uniform::new(min, max), rng)
            }
        };
        Ok(weights)
    }
}

fn normal(mean: f32, std: f32) -> HitGenResult<Normal<f32>> {
    Normal::new(mean, std)
        .map_err(|e| HitGenError::config(format!("normal initialization N({}, {}): {}", mean, std, e)))
}

/// Whether stochastic regularization is active for a forward pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardMode {
    Training,
    Inference,
}

/// Seeded stream when `seed` is set, entropy-seeded otherwise.
pub fn seeded_rng(seed: Option<u64>) -> ChaCha8Rng {
    match seed {
        Some(seed) => ChaCha8Rng::seed_from_u64(seed),
        None => ChaCha8Rng::from_entropy(),
    }
}
