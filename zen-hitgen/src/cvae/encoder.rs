//! Encoder: masked window + exogenous context to latent moments

use ndarray_rand::rand_distr::StandardNormal;
use ndarray_rand::RandomExt;
use rand::Rng;

use super::mrhi::MrhiStack;
use super::BatchInputs;
use crate::config::CvaeConfig;
use crate::dnn::{
    ActivationType, BidirectionalGru, DenseLayer, ForwardMode, Matrix, ParamStore, Tape, UnaryOp, Var,
};
use crate::errors::HitGenResult;

/// Latent moments are clipped to this range before sampling.
pub const LATENT_CLIP: f32 = 5.0;

/// Bidirectional GRU over the residual, projected back to the stream width.
#[derive(Debug, Clone)]
pub struct RecurrentRefinement {
    rnn: BidirectionalGru,
    projection: DenseLayer,
}

impl RecurrentRefinement {
    pub fn new<R: Rng + ?Sized>(
        store: &mut ParamStore,
        name: &str,
        width: usize,
        config: &CvaeConfig,
        rng: &mut R,
    ) -> HitGenResult<Self> {
        let rnn = BidirectionalGru::new(
            store,
            &format!("{}/bigru", name),
            width,
            width,
            config.rnn_dropout,
            config.weight_init,
            rng,
        )?;
        let projection = DenseLayer::new(
            store,
            &format!("{}/bigru_projection", name),
            rnn.output_dim(),
            width,
            ActivationType::LeakyReLU,
            config.weight_init,
            rng,
        )?;
        Ok(Self { rnn, projection })
    }

    pub fn forward<R: Rng + ?Sized>(
        &self,
        tape: &mut Tape,
        store: &ParamStore,
        residual: Var,
        window: usize,
        mode: ForwardMode,
        rng: &mut R,
    ) -> HitGenResult<Var> {
        let states = self.rnn.forward(tape, store, residual, window, mode, rng)?;
        self.projection.forward(tape, store, states)
    }
}

/// `mean + exp(0.5 * log_var) * scale * eps`.
pub fn reparameterize(tape: &mut Tape, mean: Var, log_var: Var, scale: f32, eps: Matrix) -> HitGenResult<Var> {
    let half = tape.scale(log_var, 0.5);
    let std = tape.unary(half, UnaryOp::Exp);
    let eps = tape.constant(eps);
    let noise = tape.mul(std, eps)?;
    let noise = tape.scale(noise, scale);
    tape.add(mean, noise)
}

#[derive(Debug, Clone, Copy)]
pub struct EncoderOutput {
    pub z_mean: Var,
    pub z_log_var: Var,
    pub z: Var,
}

#[derive(Debug, Clone)]
pub struct Encoder {
    input_projection: DenseLayer,
    stack: MrhiStack,
    refinement: Option<RecurrentRefinement>,
    latent_projection: DenseLayer,
    latent_dim: usize,
}

impl Encoder {
    pub fn new<R: Rng + ?Sized>(
        store: &mut ParamStore,
        config: &CvaeConfig,
        n_series: usize,
        n_features: usize,
        rng: &mut R,
    ) -> HitGenResult<Self> {
        let input_projection = DenseLayer::new(
            store,
            "encoder/input_projection",
            n_features + n_series,
            n_series,
            ActivationType::LeakyReLU,
            config.weight_init,
            rng,
        )?;
        let stack = MrhiStack::new(
            store,
            "encoder/mrhi",
            config.n_blocks_encoder,
            n_series,
            config.n_hidden,
            config.n_layers,
            config.kernel_size,
            config.pooling_mode,
            config.weight_init,
            rng,
        )?;
        let refinement = if config.bi_rnn {
            Some(RecurrentRefinement::new(store, "encoder", n_series, config, rng)?)
        } else {
            None
        };
        let latent_projection = DenseLayer::new(
            store,
            "encoder/latent_projection",
            n_series,
            2 * config.latent_dim,
            ActivationType::LeakyReLU,
            config.weight_init,
            rng,
        )?;
        Ok(Self {
            input_projection,
            stack,
            refinement,
            latent_projection,
            latent_dim: config.latent_dim,
        })
    }

    pub fn latent_dim(&self) -> usize {
        self.latent_dim
    }

    /// Clipped `(z_mean, z_log_var)`, each `(rows, latent_dim)`.
    pub fn moments<R: Rng + ?Sized>(
        &self,
        tape: &mut Tape,
        store: &ParamStore,
        inputs: &BatchInputs,
        mode: ForwardMode,
        rng: &mut R,
    ) -> HitGenResult<(Var, Var)> {
        let masked = tape.mul(inputs.values, inputs.mask)?;
        let context = tape.concat_cols(&[inputs.exogenous, masked])?;
        let x = self.input_projection.forward(tape, store, context)?;

        let (residual, mut total) = self.stack.decompose(tape, store, x, inputs.window_size)?;
        if let Some(refinement) = &self.refinement {
            let refined = refinement.forward(tape, store, residual, inputs.window_size, mode, rng)?;
            total = tape.add(total, refined)?;
        }

        let moments = self.latent_projection.forward(tape, store, total)?;
        let clip = UnaryOp::Clip { min: -LATENT_CLIP, max: LATENT_CLIP };
        let log_var = tape.slice_cols(moments, 0, self.latent_dim)?;
        let log_var = tape.unary(log_var, clip);
        let mean = tape.slice_cols(moments, self.latent_dim, 2 * self.latent_dim)?;
        let mean = tape.unary(mean, clip);
        Ok((mean, log_var))
    }

    /// Moments plus a reparameterized sample with standard normal noise scaled by `noise_scale`.
    pub fn forward<R: Rng + ?Sized>(
        &self,
        tape: &mut Tape,
        store: &ParamStore,
        inputs: &BatchInputs,
        noise_scale: f32,
        mode: ForwardMode,
        rng: &mut R,
    ) -> HitGenResult<EncoderOutput> {
        let (z_mean, z_log_var) = self.moments(tape, store, inputs, mode, rng)?;
        let eps = Matrix::random_using(tape.value(z_mean).dim(), StandardNormal, rng);
        let z = reparameterize(tape, z_mean, z_log_var, noise_scale, eps)?;
        Ok(EncoderOutput { z_mean, z_log_var, z })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{Panel, WindowGenerator};
    use ndarray::Array2;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn config(bi_rnn: bool) -> CvaeConfig {
        CvaeConfig::builder()
            .window_size(4)
            .latent_dim(3)
            .blocks(2, 2)
            .hidden(6, 2)
            .bi_rnn(bi_rnn)
            .build()
            .unwrap()
    }

    fn batch() -> crate::data::WindowBatch {
        let values = Array2::from_shape_fn((10, 2), |(t, s)| ((t + s) as f32 / 12.0).min(1.0));
        let exogenous = Array2::from_shape_fn((10, 1), |(t, _)| (t as f32).sin());
        let panel = Panel::fully_observed(values, exogenous).unwrap();
        WindowGenerator::new(&panel, 4, 1, 3, false).unwrap().batch(0).unwrap()
    }

    #[test]
    fn test_moments_are_clipped_and_shaped() {
        for bi_rnn in [true, false] {
            let mut store = ParamStore::new();
            let mut rng = ChaCha8Rng::seed_from_u64(3);
            let encoder = Encoder::new(&mut store, &config(bi_rnn), 2, 1, &mut rng).unwrap();
            let mut tape = Tape::new();
            let inputs = BatchInputs::record(&mut tape, &batch());
            let out = encoder.forward(&mut tape, &store, &inputs, 1.0, ForwardMode::Training, &mut rng).unwrap();
            for var in [out.z_mean, out.z_log_var, out.z] {
                assert_eq!(tape.value(var).dim(), (12, 3));
            }
            assert!(tape.value(out.z_mean).iter().all(|v| v.abs() <= LATENT_CLIP));
            assert!(tape.value(out.z_log_var).iter().all(|v| v.abs() <= LATENT_CLIP));
        }
    }

    #[test]
    fn test_zero_noise_sample_equals_mean() {
        let mut store = ParamStore::new();
        let mut rng = ChaCha8Rng::seed_from_u64(9);
        let encoder = Encoder::new(&mut store, &config(true), 2, 1, &mut rng).unwrap();
        let mut tape = Tape::new();
        let inputs = BatchInputs::record(&mut tape, &batch());
        let out = encoder.forward(&mut tape, &store, &inputs, 0.0, ForwardMode::Inference, &mut rng).unwrap();
        assert_eq!(tape.value(out.z), tape.value(out.z_mean));
    }

    #[test]
    fn test_masked_cells_do_not_reach_the_encoder() {
        let mut store = ParamStore::new();
        let mut rng = ChaCha8Rng::seed_from_u64(11);
        let encoder = Encoder::new(&mut store, &config(true), 2, 1, &mut rng).unwrap();

        let mut first = batch();
        first.mask[[1, 0]] = 0.0;
        let mut second = first.clone();
        second.values[[1, 0]] = 42.0;

        let run = |batch: &crate::data::WindowBatch| {
            let mut tape = Tape::new();
            let inputs = BatchInputs::record(&mut tape, batch);
            let mut rng = ChaCha8Rng::seed_from_u64(0);
            let (mean, _) = encoder.moments(&mut tape, &store, &inputs, ForwardMode::Inference, &mut rng).unwrap();
            tape.value(mean).clone()
        };
        assert_eq!(run(&first), run(&second));
    }
}
