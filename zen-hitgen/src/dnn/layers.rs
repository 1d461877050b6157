/**
 * @file zen-hitgen/src/dnn/layers.rs
 * @brief Dense and recurrent layers recorded on the gradient tape
 *
 * Inputs are `(batch * window, channels)` matrices. A dense layer applied to
 * such a matrix is time-distributed by construction. Recurrent layers walk the
 * window axis explicitly and need the window length to find each step's rows.
 *
 * ## Layer Types:
 * - **DenseLayer**: `activation(x · W + b)`
 * - **GruLayer**: gated recurrent unit, forward or reversed in time
 * - **BidirectionalGru**: both directions concatenated along channels
 */

use rand::Rng;

use super::params::{ParamId, ParamStore};
use super::tape::{Tape, UnaryOp, Var};
use super::{ActivationType, ForwardMode, Matrix, WeightInitialization};
use crate::errors::{HitGenError, HitGenResult};

// === DENSE LAYER ===

/// Fully connected layer with bias.
#[derive(Debug, Clone)]
pub struct DenseLayer {
    weight: ParamId,
    bias: ParamId,
    input_dim: usize,
    output_dim: usize,
    activation: ActivationType,
}

impl DenseLayer {
    pub fn new<R: Rng + ?Sized>(
        store: &mut ParamStore,
        name: &str,
        input_dim: usize,
        output_dim: usize,
        activation: ActivationType,
        init: WeightInitialization,
        rng: &mut R,
    ) -> HitGenResult<Self> {
        if input_dim == 0 || output_dim == 0 {
            return Err(HitGenError::config(format!(
                "dense layer '{}' needs non-zero dimensions, got {} -> {}",
                name, input_dim, output_dim
            )));
        }
        let weight = store.register(format!("{}/kernel", name), init.sample(input_dim, output_dim, rng)?);
        let bias = store.register(format!("{}/bias", name), Matrix::zeros((1, output_dim)));
        Ok(Self { weight, bias, input_dim, output_dim, activation })
    }

    pub fn forward(&self, tape: &mut Tape, store: &ParamStore, input: Var) -> HitGenResult<Var> {
        let cols = tape.value(input).ncols();
        if cols != self.input_dim {
            return Err(HitGenError::shape(format!(
                "dense layer expects {} input channels, got {}",
                self.input_dim, cols
            )));
        }
        let w = tape.param(store, self.weight);
        let b = tape.param(store, self.bias);
        let z = tape.matmul(input, w)?;
        let z = tape.add_row(z, b)?;
        Ok(match self.activation.unary_op() {
            Some(op) => tape.unary(z, op),
            None => z,
        })
    }

    pub fn input_dim(&self) -> usize {
        self.input_dim
    }

    pub fn output_dim(&self) -> usize {
        self.output_dim
    }

    pub fn activation(&self) -> ActivationType {
        self.activation
    }

    pub fn parameter_count(&self) -> usize {
        self.input_dim * self.output_dim + self.output_dim
    }
}

// === RECURRENT LAYERS ===

/// GRU cell unrolled over each window.
///
/// Gate layout in the fused kernels is `[update | reset | candidate]`:
/// `z = σ(x·Wz + h·Uz + bz)`, `r = σ(x·Wr + h·Ur + br)`,
/// `n = tanh(x·Wn + bn + r ⊙ (h·Un))`, `h' = (1 − z) ⊙ n + z ⊙ h`.
#[derive(Debug, Clone)]
pub struct GruLayer {
    kernel: ParamId,
    recurrent: ParamId,
    bias: ParamId,
    input_dim: usize,
    units: usize,
    reverse: bool,
}

impl GruLayer {
    pub fn new<R: Rng + ?Sized>(
        store: &mut ParamStore,
        name: &str,
        input_dim: usize,
        units: usize,
        reverse: bool,
        init: WeightInitialization,
        rng: &mut R,
    ) -> HitGenResult<Self> {
        if input_dim == 0 || units == 0 {
            return Err(HitGenError::config(format!(
                "GRU '{}' needs non-zero dimensions, got {} -> {}",
                name, input_dim, units
            )));
        }
        let kernel = store.register(format!("{}/kernel", name), init.sample(input_dim, 3 * units, rng)?);
        let recurrent = store.register(format!("{}/recurrent_kernel", name), init.sample(units, 3 * units, rng)?);
        let bias = store.register(format!("{}/bias", name), Matrix::zeros((1, 3 * units)));
        Ok(Self { kernel, recurrent, bias, input_dim, units, reverse })
    }

    /// Returns the hidden state at every step, aligned with the input rows.
    pub fn forward(&self, tape: &mut Tape, store: &ParamStore, input: Var, window: usize) -> HitGenResult<Var> {
        let (rows, cols) = tape.value(input).dim();
        if cols != self.input_dim {
            return Err(HitGenError::shape(format!(
                "GRU expects {} input channels, got {}",
                self.input_dim, cols
            )));
        }
        if window == 0 || rows % window != 0 {
            return Err(HitGenError::shape(format!(
                "GRU input has {} rows, not a multiple of window {}",
                rows, window
            )));
        }
        let batch = rows / window;
        let u = self.units;

        let w = tape.param(store, self.kernel);
        let rec = tape.param(store, self.recurrent);
        let b = tape.param(store, self.bias);
        let projected = tape.matmul(input, w)?;
        let projected = tape.add_row(projected, b)?;

        let mut hidden = tape.constant(Matrix::zeros((batch, u)));
        let mut states: Vec<Option<Var>> = vec![None; window];
        let steps: Vec<usize> = if self.reverse {
            (0..window).rev().collect()
        } else {
            (0..window).collect()
        };

        for t in steps {
            let rows_t: Vec<usize> = (0..batch).map(|i| i * window + t).collect();
            let x_t = tape.select_rows(projected, rows_t)?;
            let h_proj = tape.matmul(hidden, rec)?;

            let xz = tape.slice_cols(x_t, 0, u)?;
            let xr = tape.slice_cols(x_t, u, 2 * u)?;
            let xn = tape.slice_cols(x_t, 2 * u, 3 * u)?;
            let hz = tape.slice_cols(h_proj, 0, u)?;
            let hr = tape.slice_cols(h_proj, u, 2 * u)?;
            let hn = tape.slice_cols(h_proj, 2 * u, 3 * u)?;

            let z = tape.add(xz, hz)?;
            let z = tape.unary(z, UnaryOp::Sigmoid);
            let r = tape.add(xr, hr)?;
            let r = tape.unary(r, UnaryOp::Sigmoid);
            let gated = tape.mul(r, hn)?;
            let n = tape.add(xn, gated)?;
            let n = tape.unary(n, UnaryOp::Tanh);

            // h' = n + z ⊙ (h − n)
            let delta = tape.sub(hidden, n)?;
            let carried = tape.mul(z, delta)?;
            hidden = tape.add(n, carried)?;
            states[t] = Some(hidden);
        }

        // time-major (t * batch + i) back to window-major (i * window + t)
        let ordered: Vec<Var> = states.into_iter().flatten().collect();
        let stacked = tape.concat_rows(&ordered)?;
        let order: Vec<usize> = (0..batch)
            .flat_map(|i| (0..window).map(move |t| t * batch + i))
            .collect();
        tape.select_rows(stacked, order)
    }

    pub fn units(&self) -> usize {
        self.units
    }

    pub fn parameter_count(&self) -> usize {
        3 * self.units * (self.input_dim + self.units + 1)
    }
}

/// Forward and reversed GRUs over the same input, outputs concatenated as `[fwd | bwd]`.
#[derive(Debug, Clone)]
pub struct BidirectionalGru {
    forward: GruLayer,
    backward: GruLayer,
    dropout: f32,
}

impl BidirectionalGru {
    pub fn new<R: Rng + ?Sized>(
        store: &mut ParamStore,
        name: &str,
        input_dim: usize,
        units: usize,
        dropout: f32,
        init: WeightInitialization,
        rng: &mut R,
    ) -> HitGenResult<Self> {
        Ok(Self {
            forward: GruLayer::new(store, &format!("{}/forward", name), input_dim, units, false, init, rng)?,
            backward: GruLayer::new(store, &format!("{}/backward", name), input_dim, units, true, init, rng)?,
            dropout,
        })
    }

    pub fn forward<R: Rng + ?Sized>(
        &self,
        tape: &mut Tape,
        store: &ParamStore,
        input: Var,
        window: usize,
        mode: ForwardMode,
        rng: &mut R,
    ) -> HitGenResult<Var> {
        let input = if mode == ForwardMode::Training && self.dropout > 0.0 {
            let keep = 1.0 - self.dropout;
            let mask = tape
                .value(input)
                .mapv(|_| if rng.gen::<f32>() < keep { 1.0 / keep } else { 0.0 });
            let mask = tape.constant(mask);
            tape.mul(input, mask)?
        } else {
            input
        };
        let fwd = self.forward.forward(tape, store, input, window)?;
        let bwd = self.backward.forward(tape, store, input, window)?;
        tape.concat_cols(&[fwd, bwd])
    }

    /// Channels produced per step.
    pub fn output_dim(&self) -> usize {
        2 * self.forward.units()
    }

    pub fn parameter_count(&self) -> usize {
        self.forward.parameter_count() + self.backward.parameter_count()
    }
}
