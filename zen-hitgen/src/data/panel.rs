//! Wide panels with observation masks
//!
//! A [`Panel`] is what the model consumes: a dense `(T, S)` value matrix, an
//! equal-shaped {0, 1} mask and a `(T, F)` exogenous matrix on the same time
//! axis. [`WidePanel`] is the labelled form built from long records, keeping the
//! series ids and timestamps needed to turn synthetic output back into records.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::NaiveDate;
use ndarray::{Array2, Axis, Zip};
use serde::{Deserialize, Serialize};

use crate::dnn::Matrix;
use crate::errors::{HitGenError, HitGenResult};

/// One observation in long form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeriesRecord {
    pub unique_id: String,
    pub ds: NaiveDate,
    pub y: f64,
}

impl SeriesRecord {
    pub fn new(unique_id: impl Into<String>, ds: NaiveDate, y: f64) -> Self {
        Self { unique_id: unique_id.into(), ds, y }
    }
}

/// Model input: values, mask and exogenous features on a shared time axis.
#[derive(Debug, Clone, PartialEq)]
pub struct Panel {
    values: Matrix,
    mask: Matrix,
    exogenous: Matrix,
}

impl Panel {
    /// Validates shapes and mask, then zero-fills every unobserved cell.
    pub fn new(values: Matrix, mask: Matrix, exogenous: Matrix) -> HitGenResult<Self> {
        if values.dim() != mask.dim() {
            return Err(HitGenError::shape(format!(
                "mask {:?} does not match values {:?}",
                mask.dim(),
                values.dim()
            )));
        }
        if exogenous.nrows() != values.nrows() {
            return Err(HitGenError::shape(format!(
                "exogenous features cover {} timesteps, values cover {}",
                exogenous.nrows(),
                values.nrows()
            )));
        }
        if values.ncols() == 0 {
            return Err(HitGenError::shape("panel has no series"));
        }
        if mask.iter().any(|&m| m != 0.0 && m != 1.0) {
            return Err(HitGenError::InvalidInput("mask must contain only 0 and 1".to_string()));
        }
        if exogenous.iter().any(|x| !x.is_finite()) {
            return Err(HitGenError::InvalidInput("exogenous features must be finite".to_string()));
        }
        let observed_ok = Zip::from(&values)
            .and(&mask)
            .fold(true, |ok, &v, &m| ok && (m == 0.0 || v.is_finite()));
        if !observed_ok {
            return Err(HitGenError::InvalidInput("observed values must be finite".to_string()));
        }

        let values = Zip::from(&values)
            .and(&mask)
            .map_collect(|&v, &m| if m == 1.0 { v } else { 0.0 });
        Ok(Self { values, mask, exogenous })
    }

    /// Panel with every cell observed.
    pub fn fully_observed(values: Matrix, exogenous: Matrix) -> HitGenResult<Self> {
        let mask = Matrix::ones(values.raw_dim());
        Self::new(values, mask, exogenous)
    }

    pub fn values(&self) -> &Matrix {
        &self.values
    }

    pub fn mask(&self) -> &Matrix {
        &self.mask
    }

    pub fn exogenous(&self) -> &Matrix {
        &self.exogenous
    }

    pub fn n_timesteps(&self) -> usize {
        self.values.nrows()
    }

    pub fn n_series(&self) -> usize {
        self.values.ncols()
    }

    pub fn n_features(&self) -> usize {
        self.exogenous.ncols()
    }

    /// Same mask and features, new values.
    pub fn with_values(&self, values: Matrix) -> HitGenResult<Self> {
        Self::new(values, self.mask.clone(), self.exogenous.clone())
    }

    /// Sub-panel restricted to the given series columns.
    pub fn select_series(&self, columns: &[usize]) -> HitGenResult<Self> {
        if let Some(&bad) = columns.iter().find(|&&c| c >= self.n_series()) {
            return Err(HitGenError::shape(format!("series column {} of {}", bad, self.n_series())));
        }
        Self::new(
            self.values.select(Axis(1), columns),
            self.mask.select(Axis(1), columns),
            self.exogenous.clone(),
        )
    }
}

/// Labelled wide form of a set of long records.
#[derive(Debug, Clone, PartialEq)]
pub struct WidePanel {
    pub series_ids: Vec<String>,
    pub timestamps: Vec<NaiveDate>,
    /// `(T, S)`, zero where unobserved.
    pub values: Matrix,
    pub mask: Matrix,
}

impl WidePanel {
    /// Pivot records onto the sorted union of their ids and dates.
    pub fn from_records(records: &[SeriesRecord]) -> HitGenResult<Self> {
        if records.is_empty() {
            return Err(HitGenError::InvalidInput("no records to pivot".to_string()));
        }
        let series_ids: Vec<String> = records
            .iter()
            .map(|r| r.unique_id.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let timestamps: Vec<NaiveDate> = records.iter().map(|r| r.ds).collect::<BTreeSet<_>>().into_iter().collect();

        let col: HashMap<&str, usize> = series_ids.iter().enumerate().map(|(i, id)| (id.as_str(), i)).collect();
        let row: HashMap<NaiveDate, usize> = timestamps.iter().enumerate().map(|(i, &d)| (d, i)).collect();

        let mut values = Matrix::zeros((timestamps.len(), series_ids.len()));
        let mut mask = Matrix::zeros((timestamps.len(), series_ids.len()));
        for record in records {
            let (t, s) = (row[&record.ds], col[record.unique_id.as_str()]);
            if mask[[t, s]] == 1.0 {
                return Err(HitGenError::InvalidInput(format!(
                    "duplicate observation for '{}' at {}",
                    record.unique_id, record.ds
                )));
            }
            if record.y.is_finite() {
                values[[t, s]] = record.y as f32;
                mask[[t, s]] = 1.0;
            }
        }

        Ok(Self { series_ids, timestamps, values, mask })
    }

    pub fn n_series(&self) -> usize {
        self.series_ids.len()
    }

    pub fn n_timesteps(&self) -> usize {
        self.timestamps.len()
    }

    /// Column position of each id, in the order given.
    pub fn column_indices(&self, ids: &[String]) -> HitGenResult<Vec<usize>> {
        let lookup: HashMap<&str, usize> = self.series_ids.iter().enumerate().map(|(i, id)| (id.as_str(), i)).collect();
        ids.iter()
            .map(|id| {
                lookup
                    .get(id.as_str())
                    .copied()
                    .ok_or_else(|| HitGenError::InvalidInput(format!("unknown series id '{}'", id)))
            })
            .collect()
    }

    /// Sub-panel holding `ids` (in that order) on the full time axis.
    pub fn select_series(&self, ids: &[String]) -> HitGenResult<Self> {
        let columns = self.column_indices(ids)?;
        Ok(Self {
            series_ids: ids.to_vec(),
            timestamps: self.timestamps.clone(),
            values: self.values.select(Axis(1), &columns),
            mask: self.mask.select(Axis(1), &columns),
        })
    }

    /// Ids of the series observed at timestep `t`.
    pub fn observed_at(&self, t: usize) -> Vec<&str> {
        self.mask
            .row(t)
            .iter()
            .zip(&self.series_ids)
            .filter(|(m, _)| **m == 1.0)
            .map(|(_, id)| id.as_str())
            .collect()
    }

    /// Long records for `values` (same grid as this panel), keeping observed cells only.
    pub fn to_records(&self, values: &Array2<f32>) -> HitGenResult<Vec<SeriesRecord>> {
        if values.dim() != self.mask.dim() {
            return Err(HitGenError::shape(format!(
                "values {:?} are not on the panel grid {:?}",
                values.dim(),
                self.mask.dim()
            )));
        }
        let mut by_series: BTreeMap<&str, Vec<SeriesRecord>> = BTreeMap::new();
        for ((t, s), &m) in self.mask.indexed_iter() {
            if m == 1.0 {
                by_series.entry(self.series_ids[s].as_str()).or_default().push(SeriesRecord::new(
                    self.series_ids[s].clone(),
                    self.timestamps[t],
                    values[[t, s]] as f64,
                ));
            }
        }
        Ok(by_series.into_values().flatten().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_panel_zero_fills_unobserved() {
        let panel = Panel::new(
            array![[1.0, 7.0], [2.0, 8.0]],
            array![[1.0, 0.0], [1.0, 1.0]],
            Matrix::zeros((2, 0)),
        )
        .unwrap();
        assert_eq!(panel.values(), &array![[1.0, 0.0], [2.0, 8.0]]);
    }

    #[test]
    fn test_panel_rejects_bad_inputs() {
        let values = Matrix::zeros((3, 2));
        assert!(matches!(
            Panel::new(values.clone(), Matrix::zeros((3, 1)), Matrix::zeros((3, 1))),
            Err(HitGenError::ShapeMismatch(_))
        ));
        assert!(matches!(
            Panel::new(values.clone(), Matrix::zeros((3, 2)), Matrix::zeros((2, 1))),
            Err(HitGenError::ShapeMismatch(_))
        ));
        assert!(Panel::new(values.clone(), Matrix::from_elem((3, 2), 0.5), Matrix::zeros((3, 1))).is_err());
        // NaN is allowed where unobserved
        let mut with_nan = values;
        with_nan[[0, 0]] = f32::NAN;
        assert!(Panel::new(with_nan, array![[0.0, 1.0], [1.0, 1.0], [1.0, 1.0]], Matrix::zeros((3, 1))).is_ok());
    }

    #[test]
    fn test_ragged_records_to_wide_and_back() {
        let records = vec![
            SeriesRecord::new("b", date(2020, 2, 1), 5.0),
            SeriesRecord::new("a", date(2020, 1, 1), 1.0),
            SeriesRecord::new("a", date(2020, 2, 1), 2.0),
            SeriesRecord::new("a", date(2020, 3, 1), 3.0),
            SeriesRecord::new("b", date(2020, 3, 1), 6.0),
        ];
        let wide = WidePanel::from_records(&records).unwrap();
        assert_eq!(wide.series_ids, vec!["a", "b"]);
        assert_eq!(wide.n_timesteps(), 3);
        assert_eq!(wide.mask, array![[1.0, 0.0], [1.0, 1.0], [1.0, 1.0]]);
        assert_eq!(wide.values, array![[1.0, 0.0], [2.0, 5.0], [3.0, 6.0]]);
        assert_eq!(wide.observed_at(0), vec!["a"]);

        let back = wide.to_records(&wide.values).unwrap();
        assert_eq!(back.len(), records.len());
        assert_eq!(back[0], SeriesRecord::new("a", date(2020, 1, 1), 1.0));
        assert_eq!(back[3], SeriesRecord::new("b", date(2020, 2, 1), 5.0));
    }

    #[test]
    fn test_duplicate_records_rejected() {
        let records = vec![
            SeriesRecord::new("a", date(2020, 1, 1), 1.0),
            SeriesRecord::new("a", date(2020, 1, 1), 2.0),
        ];
        assert!(WidePanel::from_records(&records).is_err());
    }

    #[test]
    fn test_select_series() {
        let panel = Panel::fully_observed(array![[1.0, 2.0, 3.0]], array![[0.5]]).unwrap();
        let sub = panel.select_series(&[2, 0]).unwrap();
        assert_eq!(sub.values(), &array![[3.0, 1.0]]);
        assert!(panel.select_series(&[3]).is_err());
    }
}
