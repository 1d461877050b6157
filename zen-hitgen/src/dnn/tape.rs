/**
 * @file zen-hitgen/src/dnn/tape.rs
 * @brief Reverse-mode gradient tape over 2-D tensors
 *
 * Operations are appended to the tape in execution order, so the node list is
 * already a topological order of the computation. `backward` walks it in
 * reverse, applying each operation's vector-Jacobian product and accumulating
 * into its inputs. Nodes consumed more than once (shared recurrent weights,
 * residual streams) simply receive several contributions.
 *
 * Parameters enter a tape at most once: repeated `param` calls for the same
 * `ParamId` return the same `Var`, so the gradient of a weight used at every
 * timestep is the sum over timesteps.
 */

use std::collections::HashMap;

use ndarray::{concatenate, s, Array2, ArrayView2, Axis, Zip};

use super::params::{ParamId, ParamStore};
use super::Matrix;
use crate::config::PoolingMode;
use crate::errors::{HitGenError, HitGenResult};

/// Handle to a value recorded on a [`Tape`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Var(usize);

impl Var {
    pub fn index(self) -> usize {
        self.0
    }
}

/// Elementwise maps with a closed-form derivative.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum UnaryOp {
    Exp,
    Relu,
    LeakyRelu(f32),
    Sigmoid,
    Tanh,
    Clip { min: f32, max: f32 },
    /// `min(max(x, 0), 1)`
    Saturate,
    Square,
}

impl UnaryOp {
    pub fn apply(self, x: f32) -> f32 {
        match self {
            UnaryOp::Exp => x.exp(),
            UnaryOp::Relu => {
                if x > 0.0 || x.is_nan() {
                    x
                } else {
                    0.0
                }
            }
            UnaryOp::LeakyRelu(slope) => {
                if x > 0.0 {
                    x
                } else {
                    slope * x
                }
            }
            UnaryOp::Sigmoid => 1.0 / (1.0 + (-x).exp()),
            UnaryOp::Tanh => x.tanh(),
            // NaN passes through
            UnaryOp::Clip { min, max } => x.clamp(min, max),
            UnaryOp::Saturate => x.clamp(0.0, 1.0),
            UnaryOp::Square => x * x,
        }
    }

    /// d(apply)/dx given the input `x` and the cached output `y`.
    fn derivative(self, x: f32, y: f32) -> f32 {
        match self {
            UnaryOp::Exp => y,
            UnaryOp::Relu => {
                if x > 0.0 {
                    1.0
                } else {
                    0.0
                }
            }
            UnaryOp::LeakyRelu(slope) => {
                if x > 0.0 {
                    1.0
                } else {
                    slope
                }
            }
            UnaryOp::Sigmoid => y * (1.0 - y),
            UnaryOp::Tanh => 1.0 - y * y,
            UnaryOp::Clip { min, max } => {
                if x >= min && x <= max {
                    1.0
                } else {
                    0.0
                }
            }
            UnaryOp::Saturate => {
                if x > 0.0 && x < 1.0 {
                    1.0
                } else {
                    0.0
                }
            }
            UnaryOp::Square => 2.0 * x,
        }
    }
}

/// Per-element routing recorded by a pooling node.
#[derive(Debug)]
enum PoolRouting {
    /// Source row of each output element.
    Max(Array2<usize>),
    /// Inclusive source row range of each output row.
    Average(Vec<(usize, usize)>),
}

#[derive(Debug)]
enum Op {
    Leaf,
    Param,
    MatMul(Var, Var),
    AddRow(Var, Var),
    Add(Var, Var),
    Sub(Var, Var),
    Mul(Var, Var),
    Scale(Var, f32),
    AddScalar(Var),
    Unary(Var, UnaryOp),
    ConcatCols(Vec<Var>),
    SliceCols(Var, usize),
    ConcatRows(Vec<Var>),
    SelectRows(Var, Vec<usize>),
    Reshape(Var),
    Pool(Var, PoolRouting),
    MeanAll(Var),
}

#[derive(Debug)]
struct Node {
    value: Matrix,
    op: Op,
}

/// Record of one forward computation.
#[derive(Debug, Default)]
pub struct Tape {
    nodes: Vec<Node>,
    params: HashMap<ParamId, Var>,
}

impl Tape {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn value(&self, var: Var) -> &Matrix {
        &self.nodes[var.0].value
    }

    /// First element of a `(1, 1)` node, e.g. a loss.
    pub fn scalar(&self, var: Var) -> f32 {
        self.nodes[var.0].value.iter().next().copied().unwrap_or(f32::NAN)
    }

    fn push(&mut self, value: Matrix, op: Op) -> Var {
        self.nodes.push(Node { value, op });
        Var(self.nodes.len() - 1)
    }

    fn shape(&self, var: Var) -> (usize, usize) {
        self.nodes[var.0].value.dim()
    }

    fn same_shape(&self, a: Var, b: Var, op: &str) -> HitGenResult<()> {
        if self.shape(a) != self.shape(b) {
            return Err(HitGenError::shape(format!(
                "{}: operands {:?} and {:?} differ",
                op,
                self.shape(a),
                self.shape(b)
            )));
        }
        Ok(())
    }

    // === LEAVES ===

    /// Input that receives gradients but is not a trainable parameter.
    pub fn constant(&mut self, value: Matrix) -> Var {
        self.push(value, Op::Leaf)
    }

    pub fn param(&mut self, store: &ParamStore, id: ParamId) -> Var {
        if let Some(&var) = self.params.get(&id) {
            return var;
        }
        let var = self.push(store.value(id).clone(), Op::Param);
        self.params.insert(id, var);
        var
    }

    // === LINEAR ALGEBRA ===

    pub fn matmul(&mut self, a: Var, b: Var) -> HitGenResult<Var> {
        let (_, inner) = self.shape(a);
        let (rows_b, _) = self.shape(b);
        if inner != rows_b {
            return Err(HitGenError::shape(format!(
                "matmul: {:?} x {:?}",
                self.shape(a),
                self.shape(b)
            )));
        }
        let value = self.value(a).dot(self.value(b));
        Ok(self.push(value, Op::MatMul(a, b)))
    }

    /// Adds a `(1, c)` row vector to every row of `x`.
    pub fn add_row(&mut self, x: Var, row: Var) -> HitGenResult<Var> {
        let (_, cols) = self.shape(x);
        if self.shape(row) != (1, cols) {
            return Err(HitGenError::shape(format!(
                "add_row: bias {:?} does not broadcast over {:?}",
                self.shape(row),
                self.shape(x)
            )));
        }
        let value = self.value(x) + self.value(row);
        Ok(self.push(value, Op::AddRow(x, row)))
    }

    pub fn add(&mut self, a: Var, b: Var) -> HitGenResult<Var> {
        self.same_shape(a, b, "add")?;
        let value = self.value(a) + self.value(b);
        Ok(self.push(value, Op::Add(a, b)))
    }

    pub fn sub(&mut self, a: Var, b: Var) -> HitGenResult<Var> {
        self.same_shape(a, b, "sub")?;
        let value = self.value(a) - self.value(b);
        Ok(self.push(value, Op::Sub(a, b)))
    }

    pub fn mul(&mut self, a: Var, b: Var) -> HitGenResult<Var> {
        self.same_shape(a, b, "mul")?;
        let value = self.value(a) * self.value(b);
        Ok(self.push(value, Op::Mul(a, b)))
    }

    pub fn scale(&mut self, x: Var, factor: f32) -> Var {
        let value = self.value(x) * factor;
        self.push(value, Op::Scale(x, factor))
    }

    pub fn add_scalar(&mut self, x: Var, offset: f32) -> Var {
        let value = self.value(x) + offset;
        self.push(value, Op::AddScalar(x))
    }

    pub fn unary(&mut self, x: Var, op: UnaryOp) -> Var {
        let value = self.value(x).mapv(|v| op.apply(v));
        self.push(value, Op::Unary(x, op))
    }

    // === LAYOUT ===

    pub fn concat_cols(&mut self, parts: &[Var]) -> HitGenResult<Var> {
        let views: Vec<ArrayView2<f32>> = parts.iter().map(|&p| self.value(p).view()).collect();
        let value = concatenate(Axis(1), &views)
            .map_err(|e| HitGenError::shape(format!("concat_cols: {}", e)))?;
        Ok(self.push(value, Op::ConcatCols(parts.to_vec())))
    }

    /// Columns `start..end` of `x`.
    pub fn slice_cols(&mut self, x: Var, start: usize, end: usize) -> HitGenResult<Var> {
        let (_, cols) = self.shape(x);
        if start >= end || end > cols {
            return Err(HitGenError::shape(format!(
                "slice_cols: {}..{} out of {} columns",
                start, end, cols
            )));
        }
        let value = self.value(x).slice(s![.., start..end]).to_owned();
        Ok(self.push(value, Op::SliceCols(x, start)))
    }

    pub fn concat_rows(&mut self, parts: &[Var]) -> HitGenResult<Var> {
        let views: Vec<ArrayView2<f32>> = parts.iter().map(|&p| self.value(p).view()).collect();
        let value = concatenate(Axis(0), &views)
            .map_err(|e| HitGenError::shape(format!("concat_rows: {}", e)))?;
        Ok(self.push(value, Op::ConcatRows(parts.to_vec())))
    }

    /// Output row `i` is input row `indices[i]`.
    pub fn select_rows(&mut self, x: Var, indices: Vec<usize>) -> HitGenResult<Var> {
        let (rows, _) = self.shape(x);
        if let Some(&bad) = indices.iter().find(|&&i| i >= rows) {
            return Err(HitGenError::shape(format!("select_rows: row {} of {}", bad, rows)));
        }
        let value = self.value(x).select(Axis(0), &indices);
        Ok(self.push(value, Op::SelectRows(x, indices)))
    }

    /// Row-major reshape.
    pub fn reshape(&mut self, x: Var, rows: usize, cols: usize) -> HitGenResult<Var> {
        let data: Vec<f32> = self.value(x).iter().copied().collect();
        let value = Array2::from_shape_vec((rows, cols), data)?;
        Ok(self.push(value, Op::Reshape(x)))
    }

    /// Stride-1 "same" pooling along the row axis, confined to blocks of
    /// `window` consecutive rows.
    pub fn pool_time(
        &mut self,
        x: Var,
        window: usize,
        kernel: usize,
        mode: PoolingMode,
    ) -> HitGenResult<Var> {
        let (rows, cols) = self.shape(x);
        if window == 0 || rows % window != 0 {
            return Err(HitGenError::shape(format!(
                "pool_time: {} rows is not a whole number of windows of {}",
                rows, window
            )));
        }
        if kernel == 0 {
            return Err(HitGenError::config("pool_time: kernel_size must be at least 1"));
        }

        let pad_before = (kernel - 1) / 2;
        let pad_after = kernel - 1 - pad_before;
        let ranges: Vec<(usize, usize)> = (0..rows)
            .map(|r| {
                let base = r - r % window;
                let t = r % window;
                let lo = t.saturating_sub(pad_before);
                let hi = (t + pad_after).min(window - 1);
                (base + lo, base + hi)
            })
            .collect();

        let input = self.value(x);
        let mut value = Matrix::zeros((rows, cols));
        let routing = match mode {
            PoolingMode::Max => {
                let mut argmax = Array2::<usize>::zeros((rows, cols));
                for (r, &(lo, hi)) in ranges.iter().enumerate() {
                    for c in 0..cols {
                        let mut best = lo;
                        for j in lo + 1..=hi {
                            // a NaN in the window wins so it reaches the loss
                            if input[[best, c]].is_nan() {
                                break;
                            }
                            if input[[j, c]].is_nan() || input[[j, c]] > input[[best, c]] {
                                best = j;
                            }
                        }
                        argmax[[r, c]] = best;
                        value[[r, c]] = input[[best, c]];
                    }
                }
                PoolRouting::Max(argmax)
            }
            PoolingMode::Average => {
                for (r, &(lo, hi)) in ranges.iter().enumerate() {
                    let count = (hi - lo + 1) as f32;
                    let mean = input.slice(s![lo..=hi, ..]).sum_axis(Axis(0)) / count;
                    value.row_mut(r).assign(&mean);
                }
                PoolRouting::Average(ranges)
            }
        };
        Ok(self.push(value, Op::Pool(x, routing)))
    }

    // === REDUCTIONS ===

    pub fn mean_all(&mut self, x: Var) -> Var {
        let value = self.value(x).mean().unwrap_or(0.0);
        self.push(Array2::from_elem((1, 1), value), Op::MeanAll(x))
    }

    // === BACKWARD ===

    /// Gradients of the scalar node `loss` with respect to every node on the tape.
    pub fn backward(&self, loss: Var) -> HitGenResult<Gradients> {
        if self.shape(loss) != (1, 1) {
            return Err(HitGenError::shape(format!(
                "backward needs a scalar loss, got {:?}",
                self.shape(loss)
            )));
        }

        let mut grads: Vec<Option<Matrix>> = vec![None; self.nodes.len()];
        grads[loss.0] = Some(Array2::ones((1, 1)));

        for index in (0..=loss.0).rev() {
            let grad = match grads[index].take() {
                Some(g) => g,
                None => continue,
            };
            let node = &self.nodes[index];

            match &node.op {
                Op::Leaf | Op::Param => {}
                Op::MatMul(a, b) => {
                    let ga = grad.dot(&self.value(*b).t());
                    let gb = self.value(*a).t().dot(&grad);
                    accumulate(&mut grads, *a, ga);
                    accumulate(&mut grads, *b, gb);
                }
                Op::AddRow(x, row) => {
                    let gr = grad.sum_axis(Axis(0)).insert_axis(Axis(0));
                    accumulate(&mut grads, *x, grad.clone());
                    accumulate(&mut grads, *row, gr);
                }
                Op::Add(a, b) => {
                    accumulate(&mut grads, *a, grad.clone());
                    accumulate(&mut grads, *b, grad.clone());
                }
                Op::Sub(a, b) => {
                    accumulate(&mut grads, *a, grad.clone());
                    accumulate(&mut grads, *b, -&grad);
                }
                Op::Mul(a, b) => {
                    accumulate(&mut grads, *a, &grad * self.value(*b));
                    accumulate(&mut grads, *b, &grad * self.value(*a));
                }
                Op::Scale(x, factor) => accumulate(&mut grads, *x, &grad * *factor),
                Op::AddScalar(x) => accumulate(&mut grads, *x, grad.clone()),
                Op::Unary(x, op) => {
                    let gx = Zip::from(&grad)
                        .and(self.value(*x))
                        .and(&node.value)
                        .map_collect(|&g, &xv, &yv| g * op.derivative(xv, yv));
                    accumulate(&mut grads, *x, gx);
                }
                Op::ConcatCols(parts) => {
                    let mut offset = 0;
                    for &part in parts {
                        let width = self.shape(part).1;
                        let gp = grad.slice(s![.., offset..offset + width]).to_owned();
                        accumulate(&mut grads, part, gp);
                        offset += width;
                    }
                }
                Op::SliceCols(x, start) => {
                    let width = grad.ncols();
                    let mut gx = Matrix::zeros(self.shape(*x));
                    gx.slice_mut(s![.., *start..*start + width]).assign(&grad);
                    accumulate(&mut grads, *x, gx);
                }
                Op::ConcatRows(parts) => {
                    let mut offset = 0;
                    for &part in parts {
                        let height = self.shape(part).0;
                        let gp = grad.slice(s![offset..offset + height, ..]).to_owned();
                        accumulate(&mut grads, part, gp);
                        offset += height;
                    }
                }
                Op::SelectRows(x, indices) => {
                    let mut gx = Matrix::zeros(self.shape(*x));
                    for (out_row, &in_row) in indices.iter().enumerate() {
                        let mut target = gx.row_mut(in_row);
                        target += &grad.row(out_row);
                    }
                    accumulate(&mut grads, *x, gx);
                }
                Op::Reshape(x) => {
                    let data: Vec<f32> = grad.iter().copied().collect();
                    let gx = Array2::from_shape_vec(self.shape(*x), data)?;
                    accumulate(&mut grads, *x, gx);
                }
                Op::Pool(x, routing) => {
                    let mut gx = Matrix::zeros(self.shape(*x));
                    match routing {
                        PoolRouting::Max(argmax) => {
                            for ((r, c), &source) in argmax.indexed_iter() {
                                gx[[source, c]] += grad[[r, c]];
                            }
                        }
                        PoolRouting::Average(ranges) => {
                            for (r, &(lo, hi)) in ranges.iter().enumerate() {
                                let share = grad.row(r).to_owned() / (hi - lo + 1) as f32;
                                for j in lo..=hi {
                                    let mut target = gx.row_mut(j);
                                    target += &share;
                                }
                            }
                        }
                    }
                    accumulate(&mut grads, *x, gx);
                }
                Op::MeanAll(x) => {
                    let (rows, cols) = self.shape(*x);
                    let count = (rows * cols).max(1) as f32;
                    let g = grad[[0, 0]] / count;
                    accumulate(&mut grads, *x, Array2::from_elem((rows, cols), g));
                }
            }

            grads[index] = Some(grad);
        }

        Ok(Gradients { grads, params: self.params.clone() })
    }
}

fn accumulate(grads: &mut [Option<Matrix>], var: Var, contribution: Matrix) {
    match &mut grads[var.0] {
        Some(existing) => *existing += &contribution,
        slot @ None => *slot = Some(contribution),
    }
}

/// Result of [`Tape::backward`].
#[derive(Debug)]
pub struct Gradients {
    grads: Vec<Option<Matrix>>,
    params: HashMap<ParamId, Var>,
}

impl Gradients {
    /// Gradient with respect to any recorded node; `None` if the loss does not depend on it.
    pub fn of(&self, var: Var) -> Option<&Matrix> {
        self.grads.get(var.0).and_then(Option::as_ref)
    }

    pub fn param(&self, id: ParamId) -> Option<&Matrix> {
        self.params.get(&id).and_then(|&var| self.of(var))
    }

    /// One gradient per store entry, in store order; zeros for unused parameters.
    pub fn for_store(&self, store: &ParamStore) -> Vec<Matrix> {
        store
            .ids()
            .map(|id| {
                self.param(id)
                    .cloned()
                    .unwrap_or_else(|| Matrix::zeros(store.value(id).raw_dim()))
            })
            .collect()
    }
}
