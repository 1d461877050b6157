//! Training objective
//!
//! Reconstruction is scored only where the mask is 1: both target and
//! reconstruction are multiplied by the mask before differencing, and the
//! squared error is averaged over every cell of the batch, so padded cells
//! contribute exactly zero.

use serde::{Deserialize, Serialize};

use super::model::CvaeOutput;
use crate::dnn::{Tape, UnaryOp, Var};
use crate::errors::HitGenResult;

/// `mean((x * m - x_hat * m)^2)` over all cells.
pub fn masked_mse(tape: &mut Tape, target: Var, reconstruction: Var, mask: Var) -> HitGenResult<Var> {
    let target = tape.mul(target, mask)?;
    let reconstruction = tape.mul(reconstruction, mask)?;
    let diff = tape.sub(target, reconstruction)?;
    let squared = tape.unary(diff, UnaryOp::Square);
    Ok(tape.mean_all(squared))
}

/// `-0.5 * mean(1 + log_var - mean^2 - exp(log_var))`.
pub fn kl_divergence(tape: &mut Tape, mean: Var, log_var: Var) -> HitGenResult<Var> {
    let mean_sq = tape.unary(mean, UnaryOp::Square);
    let var = tape.unary(log_var, UnaryOp::Exp);
    let inner = tape.add_scalar(log_var, 1.0);
    let inner = tape.sub(inner, mean_sq)?;
    let inner = tape.sub(inner, var)?;
    let avg = tape.mean_all(inner);
    Ok(tape.scale(avg, -0.5))
}

/// Loss nodes of one forward pass.
#[derive(Debug, Clone, Copy)]
pub struct LossTerms {
    pub total: Var,
    pub reconstruction: Var,
    pub kl: Var,
}

impl LossTerms {
    pub fn values(&self, tape: &Tape) -> LossValues {
        LossValues {
            total: tape.scalar(self.total),
            reconstruction: tape.scalar(self.reconstruction),
            kl: tape.scalar(self.kl),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LossValues {
    pub total: f32,
    pub reconstruction: f32,
    pub kl: f32,
}

impl LossValues {
    pub fn is_finite(&self) -> bool {
        self.total.is_finite() && self.reconstruction.is_finite() && self.kl.is_finite()
    }
}

pub fn cvae_loss(tape: &mut Tape, output: &CvaeOutput, kl_weight: f32) -> HitGenResult<LossTerms> {
    let reconstruction = masked_mse(tape, output.inputs.values, output.reconstruction, output.inputs.mask)?;
    let kl = kl_divergence(tape, output.z_mean, output.z_log_var)?;
    let weighted = tape.scale(kl, kl_weight);
    let total = tape.add(reconstruction, weighted)?;
    Ok(LossTerms { total, reconstruction, kl })
}
