//! Per-series scaling of wide panels
//!
//! Each column is scaled independently as `(x - center) / scale`. Statistics
//! are computed over observed cells only when a mask is supplied, and padded
//! cells are written back as zero after transforming so the panel invariant
//! (unobserved means zero) survives scaling.

use std::str::FromStr;

use ndarray::Axis;
use num_traits::Float;
use serde::{Deserialize, Serialize};

use crate::dnn::Matrix;
use crate::errors::{HitGenError, HitGenResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScalerKind {
    /// Observed range mapped onto `[0, 1]`.
    MinMax,
    /// Zero mean, unit (population) variance.
    Standard,
}

impl FromStr for ScalerKind {
    type Err = HitGenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "minmax" | "min_max" => Ok(ScalerKind::MinMax),
            "standard" | "zscore" => Ok(ScalerKind::Standard),
            other => Err(HitGenError::UnsupportedConfiguration(format!("scaler '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
struct SeriesScale {
    center: f32,
    scale: f32,
}

/// Summary statistics of a non-empty sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SampleStats<F> {
    pub min: F,
    pub max: F,
    pub mean: F,
    pub std: F,
}

/// Min, max, mean and population standard deviation; `None` when empty.
pub fn sample_stats<F: Float>(values: &[F]) -> Option<SampleStats<F>> {
    let first = *values.first()?;
    let n = F::from(values.len())?;
    let (min, max, sum) = values
        .iter()
        .fold((first, first, F::zero()), |(lo, hi, acc), &x| (lo.min(x), hi.max(x), acc + x));
    let mean = sum / n;
    let var = values.iter().fold(F::zero(), |acc, &x| acc + (x - mean) * (x - mean)) / n;
    Some(SampleStats { min, max, mean, std: var.sqrt() })
}

/// Column-wise scaler with fit/transform/inverse_transform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PanelScaler {
    kind: ScalerKind,
    params: Option<Vec<SeriesScale>>,
}

impl PanelScaler {
    pub fn new(kind: ScalerKind) -> Self {
        Self { kind, params: None }
    }

    pub fn kind(&self) -> ScalerKind {
        self.kind
    }

    pub fn is_fitted(&self) -> bool {
        self.params.is_some()
    }

    pub fn n_series(&self) -> Option<usize> {
        self.params.as_ref().map(Vec::len)
    }

    /// Fit per-column statistics, restricted to `mask == 1` cells when given.
    pub fn fit(&mut self, values: &Matrix, mask: Option<&Matrix>) -> HitGenResult<()> {
        if values.nrows() == 0 {
            return Err(HitGenError::InvalidInput("Cannot fit scaler on empty data".to_string()));
        }
        if let Some(mask) = mask {
            if mask.dim() != values.dim() {
                return Err(HitGenError::shape(format!(
                    "scaler mask {:?} does not match values {:?}",
                    mask.dim(),
                    values.dim()
                )));
            }
        }

        let params = values
            .axis_iter(Axis(1))
            .enumerate()
            .map(|(s, column)| {
                let observed: Vec<f32> = match mask {
                    Some(mask) => column
                        .iter()
                        .zip(mask.column(s).iter())
                        .filter(|(_, m)| **m == 1.0)
                        .map(|(v, _)| *v)
                        .collect(),
                    None => column.to_vec(),
                };
                match sample_stats(&observed) {
                    Some(stats) => {
                        let (center, spread) = match self.kind {
                            ScalerKind::MinMax => (stats.min, stats.max - stats.min),
                            ScalerKind::Standard => (stats.mean, stats.std),
                        };
                        // constant series keep unit scale
                        let scale = if spread > f32::EPSILON { spread } else { 1.0 };
                        SeriesScale { center, scale }
                    }
                    None => SeriesScale { center: 0.0, scale: 1.0 },
                }
            })
            .collect();
        self.params = Some(params);
        Ok(())
    }

    fn fitted(&self, values: &Matrix) -> HitGenResult<&[SeriesScale]> {
        let params = self.params.as_deref().ok_or(HitGenError::ScalerNotFitted)?;
        if params.len() != values.ncols() {
            return Err(HitGenError::shape(format!(
                "scaler fitted on {} series, got {}",
                params.len(),
                values.ncols()
            )));
        }
        Ok(params)
    }

    /// Scale `values`; cells with `mask == 0` come out as zero.
    pub fn transform(&self, values: &Matrix, mask: Option<&Matrix>) -> HitGenResult<Matrix> {
        let params = self.fitted(values)?;
        let mut out = values.clone();
        for (mut column, p) in out.axis_iter_mut(Axis(1)).zip(params) {
            column.mapv_inplace(|x| (x - p.center) / p.scale);
        }
        if let Some(mask) = mask {
            if mask.dim() != values.dim() {
                return Err(HitGenError::shape("transform mask does not match values"));
            }
            out.zip_mut_with(mask, |x, &m| {
                if m == 0.0 {
                    *x = 0.0
                }
            });
        }
        Ok(out)
    }

    pub fn inverse_transform(&self, values: &Matrix) -> HitGenResult<Matrix> {
        let params = self.fitted(values)?;
        let mut out = values.clone();
        for (mut column, p) in out.axis_iter_mut(Axis(1)).zip(params) {
            column.mapv_inplace(|x| x * p.scale + p.center);
        }
        Ok(out)
    }

    pub fn fit_transform(&mut self, values: &Matrix, mask: Option<&Matrix>) -> HitGenResult<Matrix> {
        self.fit(values, mask)?;
        self.transform(values, mask)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::array;

    #[test]
    fn test_sample_stats() {
        let stats = sample_stats(&[1.0f64, 2.0, 3.0, 4.0]).unwrap();
        assert_relative_eq!(stats.mean, 2.5);
        assert_relative_eq!(stats.std, 1.25f64.sqrt());
        assert_eq!((stats.min, stats.max), (1.0, 4.0));
        assert!(sample_stats::<f32>(&[]).is_none());
    }

    #[test]
    fn test_minmax_round_trip_with_mask() {
        let values = array![[10.0, 0.0], [20.0, 3.0], [30.0, 5.0]];
        let mask = array![[1.0, 0.0], [1.0, 1.0], [1.0, 1.0]];
        let mut scaler = PanelScaler::new(ScalerKind::MinMax);
        let scaled = scaler.fit_transform(&values, Some(&mask)).unwrap();
        // padding is excluded from the fit and re-zeroed
        assert_eq!(scaled, array![[0.0, 0.0], [0.5, 0.0], [1.0, 1.0]]);

        let restored = scaler.inverse_transform(&scaled).unwrap();
        for t in 0..3 {
            for s in 0..2 {
                if mask[[t, s]] == 1.0 {
                    assert_relative_eq!(restored[[t, s]], values[[t, s]], epsilon = 1e-4);
                }
            }
        }
    }

    #[test]
    fn test_standard_round_trip() {
        let values = array![[1.0, -4.0], [2.0, 0.5], [6.0, 9.0], [3.5, 2.0]];
        let mut scaler = PanelScaler::new(ScalerKind::Standard);
        let scaled = scaler.fit_transform(&values, None).unwrap();
        let mean: f32 = scaled.column(0).sum() / 4.0;
        assert_relative_eq!(mean, 0.0, epsilon = 1e-6);
        let restored = scaler.inverse_transform(&scaled).unwrap();
        for (a, b) in restored.iter().zip(values.iter()) {
            assert_relative_eq!(*a, *b, epsilon = 1e-4);
        }
    }

    #[test]
    fn test_constant_series_keeps_its_level() {
        let values = array![[7.0], [7.0], [7.0]];
        let mut scaler = PanelScaler::new(ScalerKind::Standard);
        let scaled = scaler.fit_transform(&values, None).unwrap();
        assert!(scaled.iter().all(|&x| x == 0.0));
        assert_eq!(scaler.inverse_transform(&scaled).unwrap(), values);
    }

    #[test]
    fn test_unfitted_and_mismatched() {
        let scaler = PanelScaler::new(ScalerKind::MinMax);
        assert!(matches!(scaler.transform(&array![[1.0]], None), Err(HitGenError::ScalerNotFitted)));

        let mut scaler = PanelScaler::new(ScalerKind::MinMax);
        scaler.fit(&array![[1.0, 2.0]], None).unwrap();
        assert!(matches!(
            scaler.inverse_transform(&array![[1.0]]),
            Err(HitGenError::ShapeMismatch(_))
        ));
        assert!("robust".parse::<ScalerKind>().is_err());
    }
}
