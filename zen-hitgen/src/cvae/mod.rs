/**
 * @file zen-hitgen/src/cvae/mod.rs
 * @brief Hierarchical conditional VAE over masked window batches
 *
 * The encoder and decoder share one structure: a context projection, a stack
 * of MRHI blocks on a residual stream, and an optional bidirectional GRU that
 * refines whatever the blocks left in the residual. All tensors use the
 * `(windows * window_size, channels)` layout of [`WindowBatch`].
 *
 * ## Modules:
 * - **mrhi**: pooled residual blocks
 * - **encoder**: masked values + exogenous context to latent moments
 * - **decoder**: latent code + context to a masked, saturated reconstruction
 * - **loss**: masked reconstruction error and KL divergence
 * - **model**: the assembled [`Cvae`] with its parameter store
 */

use crate::data::WindowBatch;
use crate::dnn::{Tape, Var};

pub mod decoder;
pub mod encoder;
pub mod loss;
pub mod model;
pub mod mrhi;

pub use decoder::Decoder;
pub use encoder::{Encoder, EncoderOutput};
pub use loss::{cvae_loss, kl_divergence, masked_mse, LossTerms, LossValues};
pub use model::{Cvae, CvaeOutput};
pub use mrhi::{MrhiBlock, MrhiStack};

/// A window batch recorded on a tape as constants.
#[derive(Debug, Clone, Copy)]
pub struct BatchInputs {
    pub values: Var,
    pub mask: Var,
    pub exogenous: Var,
    pub window_size: usize,
    pub n_windows: usize,
}

impl BatchInputs {
    pub fn record(tape: &mut Tape, batch: &WindowBatch) -> Self {
        Self {
            values: tape.constant(batch.values.clone()),
            mask: tape.constant(batch.mask.clone()),
            exogenous: tape.constant(batch.exogenous.clone()),
            window_size: batch.window_size,
            n_windows: batch.len(),
        }
    }
}
