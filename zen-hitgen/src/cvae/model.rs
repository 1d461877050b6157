//! The assembled CVAE
//!
//! [`Cvae`] owns the [`ParamStore`] shared by encoder and decoder. Layers only
//! hold parameter ids, so swapping weights (best-epoch restore, checkpoint
//! load) is a store copy and never rebuilds the network.

use log::info;
use rand::Rng;

use super::decoder::Decoder;
use super::encoder::{Encoder, EncoderOutput};
use super::BatchInputs;
use crate::artifacts::{Checkpoint, CHECKPOINT_SCHEMA_VERSION};
use crate::config::CvaeConfig;
use crate::data::WindowBatch;
use crate::dnn::{seeded_rng, ForwardMode, ParamStore, Tape, Var};
use crate::errors::{HitGenError, HitGenResult};

/// Tape handles produced by [`Cvae::forward`].
#[derive(Debug, Clone, Copy)]
pub struct CvaeOutput {
    pub inputs: BatchInputs,
    pub z_mean: Var,
    pub z_log_var: Var,
    pub z: Var,
    pub reconstruction: Var,
}

#[derive(Debug, Clone)]
pub struct Cvae {
    config: CvaeConfig,
    n_series: usize,
    n_features: usize,
    params: ParamStore,
    encoder: Encoder,
    decoder: Decoder,
}

impl Cvae {
    /// Build a freshly initialized model; `config.seed` fixes the initial weights.
    pub fn new(config: CvaeConfig, n_series: usize, n_features: usize) -> HitGenResult<Self> {
        config.validate()?;
        if n_series == 0 {
            return Err(HitGenError::shape("a CVAE needs at least one series"));
        }
        let mut rng = seeded_rng(config.seed);
        let mut params = ParamStore::new();
        let encoder = Encoder::new(&mut params, &config, n_series, n_features, &mut rng)?;
        let decoder = Decoder::new(&mut params, &config, n_series, n_features, &mut rng)?;
        info!(
            "Built CVAE: {} series, {} exogenous features, latent {}, {} parameters",
            n_series,
            n_features,
            config.latent_dim,
            params.parameter_count()
        );
        Ok(Self { config, n_series, n_features, params, encoder, decoder })
    }

    pub fn from_checkpoint(checkpoint: Checkpoint) -> HitGenResult<Self> {
        let mut model = Self::new(checkpoint.config, checkpoint.n_series, checkpoint.n_features)?;
        model.params.copy_from(&checkpoint.params)?;
        Ok(model)
    }

    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            schema_version: CHECKPOINT_SCHEMA_VERSION,
            config: self.config.clone(),
            n_series: self.n_series,
            n_features: self.n_features,
            params: self.params.clone(),
        }
    }

    pub fn config(&self) -> &CvaeConfig {
        &self.config
    }

    pub fn n_series(&self) -> usize {
        self.n_series
    }

    pub fn n_features(&self) -> usize {
        self.n_features
    }

    pub fn latent_dim(&self) -> usize {
        self.encoder.latent_dim()
    }

    pub fn params(&self) -> &ParamStore {
        &self.params
    }

    pub fn params_mut(&mut self) -> &mut ParamStore {
        &mut self.params
    }

    pub fn parameter_count(&self) -> usize {
        self.params.parameter_count()
    }

    /// Replace every weight; names and shapes must match.
    pub fn load_params(&mut self, params: &ParamStore) -> HitGenResult<()> {
        self.params.copy_from(params)
    }

    fn check_batch(&self, batch: &WindowBatch) -> HitGenResult<()> {
        if batch.is_empty() {
            return Err(HitGenError::InvalidInput("empty window batch".to_string()));
        }
        if batch.window_size != self.config.window_size {
            return Err(HitGenError::shape(format!(
                "model expects windows of {}, batch has {}",
                self.config.window_size, batch.window_size
            )));
        }
        if batch.values.ncols() != self.n_series || batch.exogenous.ncols() != self.n_features {
            return Err(HitGenError::shape(format!(
                "model expects {} series and {} features, batch has {} and {}",
                self.n_series,
                self.n_features,
                batch.values.ncols(),
                batch.exogenous.ncols()
            )));
        }
        Ok(())
    }

    /// Full encode/sample/decode pass recorded on `tape`.
    pub fn forward<R: Rng + ?Sized>(
        &self,
        tape: &mut Tape,
        batch: &WindowBatch,
        noise_scale: f32,
        mode: ForwardMode,
        rng: &mut R,
    ) -> HitGenResult<CvaeOutput> {
        self.check_batch(batch)?;
        let inputs = BatchInputs::record(tape, batch);
        let EncoderOutput { z_mean, z_log_var, z } =
            self.encoder.forward(tape, &self.params, &inputs, noise_scale, mode, rng)?;
        let reconstruction = self.decoder.forward(tape, &self.params, z, &inputs, mode, rng)?;
        Ok(CvaeOutput { inputs, z_mean, z_log_var, z, reconstruction })
    }

    /// Posterior `(mean, log_var)` in inference mode.
    pub fn encode_moments<R: Rng + ?Sized>(
        &self,
        tape: &mut Tape,
        batch: &WindowBatch,
        rng: &mut R,
    ) -> HitGenResult<(BatchInputs, Var, Var)> {
        self.check_batch(batch)?;
        let inputs = BatchInputs::record(tape, batch);
        let (mean, log_var) = self.encoder.moments(tape, &self.params, &inputs, ForwardMode::Inference, rng)?;
        Ok((inputs, mean, log_var))
    }

    pub fn decode<R: Rng + ?Sized>(
        &self,
        tape: &mut Tape,
        z: Var,
        inputs: &BatchInputs,
        mode: ForwardMode,
        rng: &mut R,
    ) -> HitGenResult<Var> {
        self.decoder.forward(tape, &self.params, z, inputs, mode, rng)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cvae::loss::cvae_loss;
    use crate::data::{Panel, WindowGenerator};
    use ndarray::Array2;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn config() -> CvaeConfig {
        CvaeConfig::builder()
            .window_size(4)
            .latent_dim(2)
            .blocks(1, 1)
            .hidden(4, 1)
            .seed(17)
            .build()
            .unwrap()
    }

    fn generator() -> WindowGenerator {
        let values = Array2::from_shape_fn((8, 2), |(t, s)| (t + s) as f32 / 10.0);
        let exogenous = Array2::from_shape_fn((8, 2), |(t, f)| ((t * (f + 1)) as f32).cos());
        let panel = Panel::fully_observed(values, exogenous).unwrap();
        WindowGenerator::new(&panel, 4, 1, 2, false).unwrap()
    }

    #[test]
    fn test_seed_fixes_initial_weights() {
        let a = Cvae::new(config(), 2, 2).unwrap();
        let b = Cvae::new(config(), 2, 2).unwrap();
        assert_eq!(a.params(), b.params());
        assert!(a.parameter_count() > 0);
    }

    #[test]
    fn test_every_parameter_receives_a_gradient() {
        let model = Cvae::new(config(), 2, 2).unwrap();
        let batch = generator().batch(0).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let mut tape = Tape::new();
        let out = model.forward(&mut tape, &batch, 0.1, ForwardMode::Training, &mut rng).unwrap();
        let loss = cvae_loss(&mut tape, &out, 0.1).unwrap();
        let grads = tape.backward(loss.total).unwrap();
        for id in model.params().ids() {
            assert!(grads.param(id).is_some(), "no gradient for {}", model.params().name(id));
        }
    }

    #[test]
    fn test_checkpoint_restores_identical_model() {
        let mut original = Cvae::new(config(), 2, 2).unwrap();
        for value in original.params_mut().values_mut() {
            value.mapv_inplace(|v| v * 0.5 + 0.01);
        }
        let restored = Cvae::from_checkpoint(original.checkpoint()).unwrap();
        assert_eq!(restored.params(), original.params());
    }

    #[test]
    fn test_rejects_batches_of_the_wrong_shape() {
        let model = Cvae::new(config(), 3, 2).unwrap();
        let batch = generator().batch(0).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let mut tape = Tape::new();
        let err = model.forward(&mut tape, &batch, 0.1, ForwardMode::Training, &mut rng).unwrap_err();
        assert!(matches!(err, HitGenError::ShapeMismatch(_)));
    }
}
