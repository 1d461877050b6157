//! Decoder: latent code + exogenous context to a reconstruction in `[0, 1]`

use rand::Rng;

use super::encoder::RecurrentRefinement;
use super::mrhi::MrhiStack;
use super::BatchInputs;
use crate::config::CvaeConfig;
use crate::dnn::{ActivationType, DenseLayer, ForwardMode, ParamStore, Tape, UnaryOp, Var};
use crate::errors::{HitGenError, HitGenResult};

#[derive(Debug, Clone)]
pub struct Decoder {
    latent_projection: DenseLayer,
    context_projection: DenseLayer,
    stack: MrhiStack,
    refinement: Option<RecurrentRefinement>,
    /// Mixes all timesteps of a window: `window * series -> window * series`.
    output: DenseLayer,
    window_size: usize,
    n_series: usize,
}

impl Decoder {
    pub fn new<R: Rng + ?Sized>(
        store: &mut ParamStore,
        config: &CvaeConfig,
        n_series: usize,
        n_features: usize,
        rng: &mut R,
    ) -> HitGenResult<Self> {
        let latent_projection = DenseLayer::new(
            store,
            "decoder/latent_projection",
            config.latent_dim,
            n_series,
            ActivationType::LeakyReLU,
            config.weight_init,
            rng,
        )?;
        let context_projection = DenseLayer::new(
            store,
            "decoder/context_projection",
            n_features + n_series,
            n_series,
            ActivationType::LeakyReLU,
            config.weight_init,
            rng,
        )?;
        let stack = MrhiStack::new(
            store,
            "decoder/mrhi",
            config.n_blocks_decoder,
            n_series,
            config.n_hidden,
            config.n_layers,
            config.kernel_size,
            config.pooling_mode,
            config.weight_init,
            rng,
        )?;
        let refinement = if config.bi_rnn {
            Some(RecurrentRefinement::new(store, "decoder", n_series, config, rng)?)
        } else {
            None
        };
        let flat = config.window_size * n_series;
        let output = DenseLayer::new(
            store,
            "decoder/output",
            flat,
            flat,
            ActivationType::LeakyReLU,
            config.weight_init,
            rng,
        )?;
        Ok(Self {
            latent_projection,
            context_projection,
            stack,
            refinement,
            output,
            window_size: config.window_size,
            n_series,
        })
    }

    pub fn forward<R: Rng + ?Sized>(
        &self,
        tape: &mut Tape,
        store: &ParamStore,
        z: Var,
        inputs: &BatchInputs,
        mode: ForwardMode,
        rng: &mut R,
    ) -> HitGenResult<Var> {
        if inputs.window_size != self.window_size {
            return Err(HitGenError::shape(format!(
                "decoder built for windows of {}, got {}",
                self.window_size, inputs.window_size
            )));
        }
        let x = self.latent_projection.forward(tape, store, z)?;
        let context = tape.concat_cols(&[inputs.exogenous, x])?;
        let x = self.context_projection.forward(tape, store, context)?;

        let (residual, mut total) = self.stack.decompose(tape, store, x, self.window_size)?;
        if let Some(refinement) = &self.refinement {
            let refined = refinement.forward(tape, store, residual, self.window_size, mode, rng)?;
            total = tape.add(total, refined)?;
        }

        let flat = self.window_size * self.n_series;
        let x = tape.reshape(total, inputs.n_windows, flat)?;
        let x = self.output.forward(tape, store, x)?;
        let x = tape.reshape(x, inputs.n_windows * self.window_size, self.n_series)?;
        let x = tape.mul(x, inputs.mask)?;
        Ok(tape.unary(x, UnaryOp::Saturate))
    }
}
