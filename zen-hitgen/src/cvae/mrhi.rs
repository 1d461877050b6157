//! Multi-resolution hierarchical interpolation (MRHI) blocks
//!
//! A block looks at its input at a coarser resolution (stride-1 pooling),
//! transforms it with a small ReLU stack and projects it back to the input
//! width. The projection is the block's *backcast*: the part of the signal the
//! block claims. Stacking blocks on the running residual peels the window
//! apart one resolution at a time.

use rand::Rng;

use crate::config::PoolingMode;
use crate::dnn::{ActivationType, DenseLayer, ParamStore, Tape, Var, WeightInitialization};
use crate::errors::{HitGenError, HitGenResult};

#[derive(Debug, Clone)]
pub struct MrhiBlock {
    pooling: PoolingMode,
    kernel_size: usize,
    hidden: Vec<DenseLayer>,
    backcast: DenseLayer,
}

impl MrhiBlock {
    #[allow(clippy::too_many_arguments)]
    pub fn new<R: Rng + ?Sized>(
        store: &mut ParamStore,
        name: &str,
        width: usize,
        n_hidden: usize,
        n_layers: usize,
        kernel_size: usize,
        pooling: PoolingMode,
        init: WeightInitialization,
        rng: &mut R,
    ) -> HitGenResult<Self> {
        if kernel_size == 0 {
            return Err(HitGenError::config("MRHI kernel_size must be at least 1"));
        }
        let mut hidden = Vec::with_capacity(n_layers);
        let mut input_dim = width;
        for layer in 0..n_layers {
            hidden.push(DenseLayer::new(
                store,
                &format!("{}/hidden_{}", name, layer),
                input_dim,
                n_hidden,
                ActivationType::ReLU,
                init,
                rng,
            )?);
            input_dim = n_hidden;
        }
        let backcast = DenseLayer::new(
            store,
            &format!("{}/backcast", name),
            input_dim,
            width,
            ActivationType::Linear,
            init,
            rng,
        )?;
        Ok(Self { pooling, kernel_size, hidden, backcast })
    }

    /// Backcast of `input`, same shape as `input`.
    pub fn forward(&self, tape: &mut Tape, store: &ParamStore, input: Var, window: usize) -> HitGenResult<Var> {
        let mut x = tape.pool_time(input, window, self.kernel_size, self.pooling)?;
        for layer in &self.hidden {
            x = layer.forward(tape, store, x)?;
        }
        self.backcast.forward(tape, store, x)
    }
}

/// Ordered blocks applied to a shared residual stream.
#[derive(Debug, Clone)]
pub struct MrhiStack {
    blocks: Vec<MrhiBlock>,
}

impl MrhiStack {
    #[allow(clippy::too_many_arguments)]
    pub fn new<R: Rng + ?Sized>(
        store: &mut ParamStore,
        name: &str,
        n_blocks: usize,
        width: usize,
        n_hidden: usize,
        n_layers: usize,
        kernel_size: usize,
        pooling: PoolingMode,
        init: WeightInitialization,
        rng: &mut R,
    ) -> HitGenResult<Self> {
        let blocks = (0..n_blocks)
            .map(|i| {
                MrhiBlock::new(
                    store,
                    &format!("{}/block_{}", name, i),
                    width,
                    n_hidden,
                    n_layers,
                    kernel_size,
                    pooling,
                    init,
                    rng,
                )
            })
            .collect::<HitGenResult<Vec<_>>>()?;
        Ok(Self { blocks })
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Returns `(residual, accumulated backcasts)`.
    ///
    /// Every block reads the current residual; its backcast is subtracted from
    /// the residual and added to the accumulator, so
    /// `residual + accumulated == input` at all times.
    pub fn decompose(&self, tape: &mut Tape, store: &ParamStore, input: Var, window: usize) -> HitGenResult<(Var, Var)> {
        let mut residual = input;
        let mut total: Option<Var> = None;
        for block in &self.blocks {
            let backcast = block.forward(tape, store, residual, window)?;
            residual = tape.sub(residual, backcast)?;
            total = Some(match total {
                Some(acc) => tape.add(acc, backcast)?,
                None => backcast,
            });
        }
        let total = match total {
            Some(total) => total,
            None => {
                let zeros = tape.value(input).mapv(|_| 0.0);
                tape.constant(zeros)
            }
        };
        Ok((residual, total))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::Array2;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn stack(store: &mut ParamStore, n_blocks: usize, pooling: PoolingMode) -> MrhiStack {
        let mut rng = ChaCha8Rng::seed_from_u64(42);
        MrhiStack::new(store, "enc", n_blocks, 3, 8, 2, 2, pooling, WeightInitialization::Xavier, &mut rng).unwrap()
    }

    #[test]
    fn test_block_preserves_shape() {
        let mut store = ParamStore::new();
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let block =
            MrhiBlock::new(&mut store, "b", 3, 5, 3, 3, PoolingMode::Average, WeightInitialization::He, &mut rng).unwrap();
        let mut tape = Tape::new();
        let x = tape.constant(Array2::from_shape_fn((8, 3), |(r, c)| (r * 3 + c) as f32 / 24.0));
        let y = block.forward(&mut tape, &store, x, 4).unwrap();
        assert_eq!(tape.value(y).dim(), (8, 3));
    }

    #[test]
    fn test_residual_plus_total_reconstructs_input() {
        for pooling in [PoolingMode::Max, PoolingMode::Average] {
            let mut store = ParamStore::new();
            let stack = stack(&mut store, 3, pooling);
            assert_eq!(stack.len(), 3);

            let input = Array2::from_shape_fn((12, 3), |(r, c)| ((r + 2 * c) as f32).sin());
            let mut tape = Tape::new();
            let x = tape.constant(input.clone());
            let (residual, total) = stack.decompose(&mut tape, &store, x, 6).unwrap();
            let sum = tape.value(residual) + tape.value(total);
            for (a, b) in sum.iter().zip(input.iter()) {
                assert_relative_eq!(*a, *b, epsilon = 1e-5);
            }
        }
    }

    #[test]
    fn test_windows_do_not_leak_through_pooling() {
        let mut store = ParamStore::new();
        let stack = stack(&mut store, 2, PoolingMode::Max);
        let base = Array2::from_shape_fn((8, 3), |(r, c)| (r as f32 - c as f32) / 8.0);
        let mut altered = base.clone();
        altered[[6, 1]] = 5.0; // second window only

        let run = |input: Array2<f32>| {
            let mut tape = Tape::new();
            let x = tape.constant(input);
            let (_, total) = stack.decompose(&mut tape, &store, x, 4).unwrap();
            tape.value(total).clone()
        };
        let (a, b) = (run(base), run(altered));
        for r in 0..4 {
            for c in 0..3 {
                assert_eq!(a[[r, c]], b[[r, c]]);
            }
        }
    }
}
