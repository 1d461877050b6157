//! Windowing generator
//!
//! Slices a [`Panel`] into overlapping fixed-length windows and serves them in
//! batches. Values, mask and exogenous windows are stored as 3-D tensors
//! `(n_windows, window, channels)` built once; every epoch boundary applies a
//! single permutation to all three (and to the start indices) so they stay
//! aligned. Batches are flattened to `(batch * window, channels)` matrices,
//! the layout the numeric core expects.

use log::debug;
use ndarray::{s, Array2, Array3, Axis};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};

use super::panel::Panel;
use crate::dnn::Matrix;
use crate::errors::{HitGenError, HitGenResult};

/// How overlapping window predictions are folded back onto the time axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetemporalizeMode {
    /// Mean over every window covering a timestep.
    Average,
    /// Value from the latest-starting window covering a timestep.
    Last,
}

/// One batch of windows, flattened to `(len * window_size, channels)`.
#[derive(Debug, Clone)]
pub struct WindowBatch {
    pub values: Matrix,
    pub mask: Matrix,
    pub exogenous: Matrix,
    /// Start timestep of each window in the batch.
    pub starts: Vec<usize>,
    pub window_size: usize,
}

impl WindowBatch {
    /// Number of windows.
    pub fn len(&self) -> usize {
        self.starts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.starts.is_empty()
    }
}

/// Number of windows of length `window_size` at `stride` over `n_timesteps`.
pub fn window_count(n_timesteps: usize, window_size: usize, stride: usize) -> usize {
    if window_size == 0 || stride == 0 || n_timesteps < window_size {
        0
    } else {
        (n_timesteps - window_size) / stride + 1
    }
}

/// Start timesteps of the strided windows; with `cover_tail`, one more window
/// ending at the last timestep when the stride leaves a remainder.
pub fn window_starts(n_timesteps: usize, window_size: usize, stride: usize, cover_tail: bool) -> Vec<usize> {
    let mut starts: Vec<usize> = (0..window_count(n_timesteps, window_size, stride))
        .map(|i| i * stride)
        .collect();
    if cover_tail {
        if let Some(&last) = starts.last() {
            let tail = n_timesteps - window_size;
            if last < tail {
                starts.push(tail);
            }
        }
    }
    starts
}

/// Stack every window of `data` along a new leading axis.
pub fn temporalize(data: &Matrix, window_size: usize, stride: usize) -> HitGenResult<Array3<f32>> {
    gather_windows(data, window_size, &window_starts(data.nrows(), window_size, stride, false))
}

fn gather_windows(data: &Matrix, window_size: usize, starts: &[usize]) -> HitGenResult<Array3<f32>> {
    if starts.is_empty() {
        return Err(HitGenError::shape(format!(
            "cannot cut windows of {} from {} timesteps",
            window_size,
            data.nrows()
        )));
    }
    let mut windows = Array3::zeros((starts.len(), window_size, data.ncols()));
    for (mut window, &start) in windows.axis_iter_mut(Axis(0)).zip(starts) {
        window.assign(&data.slice(s![start..start + window_size, ..]));
    }
    Ok(windows)
}

/// Reassemble window predictions onto a `(n_timesteps, channels)` grid.
///
/// `windows` is `(n_windows * window_size, channels)` in window-major order and
/// `starts[i]` is the first timestep of window `i`; window order is irrelevant.
/// Every timestep must be covered by at least one window, otherwise
/// `UnsupportedConfiguration`; [`WindowGenerator::covering`] guarantees this.
pub fn detemporalize(
    windows: &Matrix,
    starts: &[usize],
    window_size: usize,
    n_timesteps: usize,
    mode: DetemporalizeMode,
) -> HitGenResult<Matrix> {
    if windows.nrows() != starts.len() * window_size {
        return Err(HitGenError::shape(format!(
            "{} rows cannot hold {} windows of {}",
            windows.nrows(),
            starts.len(),
            window_size
        )));
    }
    if let Some(&bad) = starts.iter().find(|&&st| st + window_size > n_timesteps) {
        return Err(HitGenError::shape(format!(
            "window starting at {} overruns {} timesteps",
            bad, n_timesteps
        )));
    }

    let mut counts = vec![0usize; n_timesteps];
    for &start in starts {
        for count in &mut counts[start..start + window_size] {
            *count += 1;
        }
    }
    if let Some(uncovered) = counts.iter().position(|&c| c == 0) {
        return Err(HitGenError::UnsupportedConfiguration(format!(
            "timestep {} of {} is covered by no window of {}; stride leaves the tail unwindowed",
            uncovered, n_timesteps, window_size
        )));
    }

    let channels = windows.ncols();
    let mut out = Matrix::zeros((n_timesteps, channels));
    match mode {
        DetemporalizeMode::Average => {
            for (i, &start) in starts.iter().enumerate() {
                let block = windows.slice(s![i * window_size..(i + 1) * window_size, ..]);
                let mut target = out.slice_mut(s![start..start + window_size, ..]);
                target += &block;
            }
            for (mut row, &count) in out.axis_iter_mut(Axis(0)).zip(&counts) {
                if count > 1 {
                    row /= count as f32;
                }
            }
        }
        DetemporalizeMode::Last => {
            let mut order: Vec<usize> = (0..starts.len()).collect();
            order.sort_by_key(|&i| starts[i]);
            for i in order {
                let start = starts[i];
                out.slice_mut(s![start..start + window_size, ..])
                    .assign(&windows.slice(s![i * window_size..(i + 1) * window_size, ..]));
            }
        }
    }
    Ok(out)
}

/// Batched, reshuffling window stream over a panel.
#[derive(Debug, Clone)]
pub struct WindowGenerator {
    values: Array3<f32>,
    mask: Array3<f32>,
    exogenous: Array3<f32>,
    starts: Vec<usize>,
    n_timesteps: usize,
    window_size: usize,
    stride: usize,
    batch_size: usize,
    shuffle: bool,
    epoch: usize,
}

impl WindowGenerator {
    /// Training stream: `floor((T - W) / stride) + 1` windows, window `i`
    /// starting at `i * stride`.
    pub fn new(
        panel: &Panel,
        window_size: usize,
        stride: usize,
        batch_size: usize,
        shuffle: bool,
    ) -> HitGenResult<Self> {
        Self::build(panel, window_size, stride, batch_size, shuffle, false)
    }

    /// Unshuffled stream whose windows cover every timestep, for generation.
    /// Identical to [`WindowGenerator::new`] unless the stride leaves a
    /// remainder, in which case a final window starts at `T - W`.
    pub fn covering(panel: &Panel, window_size: usize, stride: usize, batch_size: usize) -> HitGenResult<Self> {
        Self::build(panel, window_size, stride, batch_size, false, true)
    }

    fn build(
        panel: &Panel,
        window_size: usize,
        stride: usize,
        batch_size: usize,
        shuffle: bool,
        cover_tail: bool,
    ) -> HitGenResult<Self> {
        if window_size == 0 || stride == 0 || batch_size == 0 {
            return Err(HitGenError::config(format!(
                "window_size ({}), stride ({}) and batch_size ({}) must be positive",
                window_size, stride, batch_size
            )));
        }
        if panel.n_timesteps() < window_size {
            return Err(HitGenError::shape(format!(
                "panel has {} timesteps, fewer than window_size {}",
                panel.n_timesteps(),
                window_size
            )));
        }

        let starts = window_starts(panel.n_timesteps(), window_size, stride, cover_tail);
        let values = gather_windows(panel.values(), window_size, &starts)?;
        let mask = gather_windows(panel.mask(), window_size, &starts)?;
        let exogenous = gather_windows(panel.exogenous(), window_size, &starts)?;
        debug!(
            "Temporalized {} timesteps into {} windows of {} (stride {})",
            panel.n_timesteps(),
            values.len_of(Axis(0)),
            window_size,
            stride
        );

        Ok(Self {
            values,
            mask,
            exogenous,
            starts,
            n_timesteps: panel.n_timesteps(),
            window_size,
            stride,
            batch_size,
            shuffle,
            epoch: 0,
        })
    }

    /// Batches per epoch.
    pub fn len(&self) -> usize {
        self.window_count().div_ceil(self.batch_size)
    }

    pub fn is_empty(&self) -> bool {
        self.window_count() == 0
    }

    pub fn window_count(&self) -> usize {
        self.starts.len()
    }

    pub fn window_size(&self) -> usize {
        self.window_size
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    pub fn n_timesteps(&self) -> usize {
        self.n_timesteps
    }

    pub fn n_series(&self) -> usize {
        self.values.len_of(Axis(2))
    }

    pub fn n_features(&self) -> usize {
        self.exogenous.len_of(Axis(2))
    }

    pub fn epoch(&self) -> usize {
        self.epoch
    }

    /// Start timestep of each window in the current order.
    pub fn window_starts(&self) -> &[usize] {
        &self.starts
    }

    /// Raw windows `(n_windows, window, series)` in the current order.
    pub fn value_windows(&self) -> &Array3<f32> {
        &self.values
    }

    /// Batch `index` of the current epoch; the last batch may be short.
    pub fn batch(&self, index: usize) -> HitGenResult<WindowBatch> {
        if index >= self.len() {
            return Err(HitGenError::InvalidInput(format!(
                "batch {} requested, generator has {}",
                index,
                self.len()
            )));
        }
        let lo = index * self.batch_size;
        let hi = (lo + self.batch_size).min(self.window_count());
        self.slice(lo, hi)
    }

    /// Every window in the current order as a single batch.
    pub fn all_windows(&self) -> HitGenResult<WindowBatch> {
        self.slice(0, self.window_count())
    }

    fn slice(&self, lo: usize, hi: usize) -> HitGenResult<WindowBatch> {
        let rows = (hi - lo) * self.window_size;
        Ok(WindowBatch {
            values: flatten(&self.values, lo, hi, rows)?,
            mask: flatten(&self.mask, lo, hi, rows)?,
            exogenous: flatten(&self.exogenous, lo, hi, rows)?,
            starts: self.starts[lo..hi].to_vec(),
            window_size: self.window_size,
        })
    }

    /// Epoch boundary: reshuffle window order (if enabled) and advance the epoch counter.
    pub fn on_epoch_end<R: Rng + ?Sized>(&mut self, rng: &mut R) {
        if self.shuffle {
            let mut order: Vec<usize> = (0..self.window_count()).collect();
            order.shuffle(rng);
            self.values = self.values.select(Axis(0), &order);
            self.mask = self.mask.select(Axis(0), &order);
            self.exogenous = self.exogenous.select(Axis(0), &order);
            self.starts = order.iter().map(|&i| self.starts[i]).collect();
        }
        self.epoch += 1;
    }
}

fn flatten(windows: &Array3<f32>, lo: usize, hi: usize, rows: usize) -> HitGenResult<Array2<f32>> {
    let channels = windows.len_of(Axis(2));
    let data: Vec<f32> = windows.slice(s![lo..hi, .., ..]).iter().copied().collect();
    Ok(Array2::from_shape_vec((rows, channels), data)?)
}
