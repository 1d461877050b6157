//! Hyperparameters and run configuration
//!
//! `CvaeConfig` is the flat hyperparameter set a trial is made of: it is what the
//! outer search proposes, what a checkpoint records, and what the best-score ledger
//! stores next to each score. `SamplingConfig` governs inference-time augmentation.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::data::window::DetemporalizeMode;
use crate::dnn::WeightInitialization;
use crate::errors::{HitGenError, HitGenResult};

/// Downsampling operator used at the head of every MRHI block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolingMode {
    Max,
    Average,
}

impl FromStr for PoolingMode {
    type Err = HitGenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "max" => Ok(PoolingMode::Max),
            "average" | "avg" | "mean" => Ok(PoolingMode::Average),
            other => Err(HitGenError::UnsupportedConfiguration(format!(
                "pooling mode '{}' (expected 'max' or 'average')",
                other
            ))),
        }
    }
}

impl fmt::Display for PoolingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolingMode::Max => write!(f, "max"),
            PoolingMode::Average => write!(f, "average"),
        }
    }
}

/// Complete hyperparameter set for one CVAE fit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CvaeConfig {
    // === WINDOWING ===
    pub window_size: usize,
    pub stride: usize,
    pub batch_size: usize,
    pub shuffle: bool,

    // === ARCHITECTURE ===
    pub latent_dim: usize,
    pub n_blocks_encoder: usize,
    pub n_blocks_decoder: usize,
    pub n_hidden: usize,
    pub n_layers: usize,
    pub kernel_size: usize,
    pub pooling_mode: PoolingMode,
    /// Bidirectional GRU refinement after the MRHI stacks.
    pub bi_rnn: bool,
    /// Input dropout on the recurrent refinement, training mode only.
    pub rnn_dropout: f32,
    pub weight_init: WeightInitialization,

    // === ANNEALING ===
    pub annealing: bool,
    pub kl_weight_initial: f32,
    pub kl_weight_final: f32,
    pub noise_scale_initial: f32,
    pub noise_scale_final: f32,
    pub annealing_epochs: usize,

    // === OPTIMIZATION ===
    pub epochs: usize,
    pub learning_rate: f32,
    pub patience: usize,
    /// Learning-rate multiplier applied on a plateau. Defaults to 0.5; the
    /// tuning scripts this model came from used the harsher 0.2, which
    /// `lr_plateau(0.2, 10, 3, 1e-6)` restores.
    pub lr_reduce_factor: f32,
    pub lr_patience: usize,
    pub lr_cooldown: usize,
    pub min_learning_rate: f32,
    pub gradient_clip_norm: Option<f32>,
    pub seed: Option<u64>,
}

impl Default for CvaeConfig {
    fn default() -> Self {
        Self {
            window_size: 12,
            stride: 1,
            batch_size: 8,
            shuffle: true,
            latent_dim: 32,
            n_blocks_encoder: 3,
            n_blocks_decoder: 3,
            n_hidden: 16,
            n_layers: 3,
            kernel_size: 2,
            pooling_mode: PoolingMode::Max,
            bi_rnn: true,
            rnn_dropout: 0.3,
            weight_init: WeightInitialization::Xavier, // Keras dense default
            annealing: true,
            kl_weight_initial: 0.05,
            kl_weight_final: 0.1,
            noise_scale_initial: 0.1,
            noise_scale_final: 0.01,
            annealing_epochs: 100,
            epochs: 750,
            learning_rate: 0.001,                      // Adam default
            patience: 30,
            lr_reduce_factor: 0.5,
            lr_patience: 10,
            lr_cooldown: 3,
            min_learning_rate: 1e-6,
            gradient_clip_norm: None,
            seed: None,
        }
    }
}

impl CvaeConfig {
    /// Create a builder for fluent configuration
    pub fn builder() -> CvaeConfigBuilder {
        CvaeConfigBuilder::default()
    }

    /// Reject hyperparameters no model can be built from.
    pub fn validate(&self) -> HitGenResult<()> {
        let positive = [
            ("window_size", self.window_size),
            ("stride", self.stride),
            ("batch_size", self.batch_size),
            ("latent_dim", self.latent_dim),
            ("n_blocks_encoder", self.n_blocks_encoder),
            ("n_blocks_decoder", self.n_blocks_decoder),
            ("n_hidden", self.n_hidden),
            ("kernel_size", self.kernel_size),
            ("epochs", self.epochs),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(HitGenError::config(format!("{} must be at least 1", name)));
            }
        }

        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return Err(HitGenError::config(format!(
                "learning_rate must be positive, got {}",
                self.learning_rate
            )));
        }
        if !(0.0..1.0).contains(&self.rnn_dropout) {
            return Err(HitGenError::config(format!(
                "rnn_dropout must lie in [0, 1), got {}",
                self.rnn_dropout
            )));
        }
        if !(self.lr_reduce_factor > 0.0 && self.lr_reduce_factor < 1.0) {
            return Err(HitGenError::config(format!(
                "lr_reduce_factor must lie in (0, 1), got {}",
                self.lr_reduce_factor
            )));
        }
        if self.min_learning_rate < 0.0 {
            return Err(HitGenError::config("min_learning_rate must be non-negative"));
        }
        if let Some(norm) = self.gradient_clip_norm {
            if norm <= 0.0 {
                return Err(HitGenError::config("gradient_clip_norm must be positive"));
            }
        }
        for (name, value) in [
            ("kl_weight_initial", self.kl_weight_initial),
            ("kl_weight_final", self.kl_weight_final),
            ("noise_scale_initial", self.noise_scale_initial),
            ("noise_scale_final", self.noise_scale_final),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(HitGenError::config(format!(
                    "{} must be a finite non-negative number, got {}",
                    name, value
                )));
            }
        }
        Ok(())
    }
}

/// Fluent builder for [`CvaeConfig`].
#[derive(Debug, Clone, Default)]
pub struct CvaeConfigBuilder {
    config: CvaeConfig,
}

impl CvaeConfigBuilder {
    pub fn window_size(mut self, window_size: usize) -> Self {
        self.config.window_size = window_size;
        self
    }

    pub fn stride(mut self, stride: usize) -> Self {
        self.config.stride = stride;
        self
    }

    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.config.batch_size = batch_size;
        self
    }

    pub fn shuffle(mut self, shuffle: bool) -> Self {
        self.config.shuffle = shuffle;
        self
    }

    pub fn latent_dim(mut self, latent_dim: usize) -> Self {
        self.config.latent_dim = latent_dim;
        self
    }

    /// Number of MRHI blocks in encoder and decoder
    pub fn blocks(mut self, encoder: usize, decoder: usize) -> Self {
        self.config.n_blocks_encoder = encoder;
        self.config.n_blocks_decoder = decoder;
        self
    }

    /// Width and depth of the feed-forward stack inside each block
    pub fn hidden(mut self, n_hidden: usize, n_layers: usize) -> Self {
        self.config.n_hidden = n_hidden;
        self.config.n_layers = n_layers;
        self
    }

    pub fn pooling(mut self, mode: PoolingMode, kernel_size: usize) -> Self {
        self.config.pooling_mode = mode;
        self.config.kernel_size = kernel_size;
        self
    }

    pub fn bi_rnn(mut self, enabled: bool) -> Self {
        self.config.bi_rnn = enabled;
        self
    }

    pub fn rnn_dropout(mut self, rate: f32) -> Self {
        self.config.rnn_dropout = rate;
        self
    }

    pub fn weight_init(mut self, init: WeightInitialization) -> Self {
        self.config.weight_init = init;
        self
    }

    pub fn kl_weight(mut self, initial: f32, final_value: f32) -> Self {
        self.config.kl_weight_initial = initial;
        self.config.kl_weight_final = final_value;
        self
    }

    pub fn noise_scale(mut self, initial: f32, final_value: f32) -> Self {
        self.config.noise_scale_initial = initial;
        self.config.noise_scale_final = final_value;
        self
    }

    pub fn annealing(mut self, enabled: bool, epochs: usize) -> Self {
        self.config.annealing = enabled;
        self.config.annealing_epochs = epochs;
        self
    }

    pub fn epochs(mut self, epochs: usize) -> Self {
        self.config.epochs = epochs;
        self
    }

    pub fn learning_rate(mut self, learning_rate: f32) -> Self {
        self.config.learning_rate = learning_rate;
        self
    }

    pub fn patience(mut self, patience: usize) -> Self {
        self.config.patience = patience;
        self
    }

    /// Plateau schedule: multiplicative factor, patience and cooldown in epochs, floor
    pub fn lr_plateau(mut self, factor: f32, patience: usize, cooldown: usize, min_lr: f32) -> Self {
        self.config.lr_reduce_factor = factor;
        self.config.lr_patience = patience;
        self.config.lr_cooldown = cooldown;
        self.config.min_learning_rate = min_lr;
        self
    }

    pub fn gradient_clip_norm(mut self, norm: Option<f32>) -> Self {
        self.config.gradient_clip_norm = norm;
        self
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.config.seed = Some(seed);
        self
    }

    pub fn build(self) -> HitGenResult<CvaeConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Inference-time augmentation settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingConfig {
    /// Posterior standard deviation inflation factor.
    pub alpha: f32,
    /// Standard deviation of the extra noise draw.
    pub epsilon_std: f32,
    pub detemporalize: DetemporalizeMode,
    pub seed: Option<u64>,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            alpha: 5.0,
            epsilon_std: 0.1,
            detemporalize: DetemporalizeMode::Average,
            seed: None,
        }
    }
}

impl SamplingConfig {
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn validate(&self) -> HitGenResult<()> {
        if !self.alpha.is_finite() || self.alpha < 0.0 {
            return Err(HitGenError::config(format!("alpha must be non-negative, got {}", self.alpha)));
        }
        if !self.epsilon_std.is_finite() || self.epsilon_std < 0.0 {
            return Err(HitGenError::config(format!(
                "epsilon_std must be non-negative, got {}",
                self.epsilon_std
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(CvaeConfig::default().validate().is_ok());
        assert!(SamplingConfig::default().validate().is_ok());
    }

    #[test]
    fn test_builder_rejects_zero_window() {
        let err = CvaeConfig::builder().window_size(0).build().unwrap_err();
        assert!(err.to_string().contains("window_size"));
    }

    #[test]
    fn test_builder_rejects_bad_plateau_factor() {
        assert!(CvaeConfig::builder().lr_plateau(1.5, 10, 3, 1e-6).build().is_err());
    }

    #[test]
    fn test_plateau_factor_defaults_to_halving_and_accepts_tuner_value() {
        assert_eq!(CvaeConfig::default().lr_reduce_factor, 0.5);
        let config = CvaeConfig::builder().lr_plateau(0.2, 10, 3, 1e-6).build().unwrap();
        assert_eq!(config.lr_reduce_factor, 0.2);
        assert_eq!((config.lr_patience, config.lr_cooldown), (10, 3));
    }

    #[test]
    fn test_pooling_mode_parsing() {
        assert_eq!("max".parse::<PoolingMode>().unwrap(), PoolingMode::Max);
        assert_eq!("Average".parse::<PoolingMode>().unwrap(), PoolingMode::Average);
        assert!(matches!(
            "median".parse::<PoolingMode>(),
            Err(HitGenError::UnsupportedConfiguration(_))
        ));
    }

    #[test]
    fn test_config_json_fills_missing_fields_from_default() {
        let config: CvaeConfig = serde_json::from_str(r#"{"latent_dim": 8, "pooling_mode": "average"}"#).unwrap();
        assert_eq!(config.latent_dim, 8);
        assert_eq!(config.pooling_mode, PoolingMode::Average);
        assert_eq!(config.window_size, CvaeConfig::default().window_size);
    }
}
