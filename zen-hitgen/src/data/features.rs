//! Calendar frequency handling and Fourier exogenous features

use std::f64::consts::PI;
use std::fmt;
use std::str::FromStr;

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::dnn::Matrix;
use crate::errors::{HitGenError, HitGenResult};

/// Harmonic order used when no other is configured.
pub const DEFAULT_FOURIER_ORDER: usize = 3;

/// Sampling frequency of a panel.
///
/// Parsed from pandas-style aliases: `D`, `W`/`W-<day>`, `M`/`MS`,
/// `Q`/`QS`, `Y`/`YS` (and `A`/`AS`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Frequency {
    Daily,
    Weekly,
    Monthly,
    Quarterly,
    Yearly,
}

impl Frequency {
    /// Seasonal period in steps of this frequency.
    pub fn period(self) -> f64 {
        match self {
            Frequency::Daily => 365.25,
            Frequency::Weekly => 52.18,
            Frequency::Monthly => 12.0,
            Frequency::Quarterly => 4.0,
            Frequency::Yearly => 1.0,
        }
    }

    /// Elapsed steps since `origin`. Weekly steps are fractional.
    pub fn steps_since(self, origin: NaiveDate, date: NaiveDate) -> f64 {
        let months = |d: NaiveDate| d.year() as i64 * 12 + d.month0() as i64;
        let quarters = |d: NaiveDate| d.year() as i64 * 4 + (d.month0() / 3) as i64;
        match self {
            Frequency::Daily => (date - origin).num_days() as f64,
            Frequency::Weekly => (date - origin).num_days() as f64 / 7.0,
            Frequency::Monthly => (months(date) - months(origin)) as f64,
            Frequency::Quarterly => (quarters(date) - quarters(origin)) as f64,
            Frequency::Yearly => (date.year() - origin.year()) as f64,
        }
    }

    /// Step index of every date relative to the first one.
    pub fn time_index(self, dates: &[NaiveDate]) -> Vec<f64> {
        match dates.first() {
            Some(&origin) => dates.iter().map(|&d| self.steps_since(origin, d)).collect(),
            None => Vec::new(),
        }
    }
}

impl FromStr for Frequency {
    type Err = HitGenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let alias = s.trim().to_ascii_uppercase();
        let base = alias.split('-').next().unwrap_or("");
        match base {
            "D" if alias == "D" => Ok(Frequency::Daily),
            "W" => Ok(Frequency::Weekly),
            "M" | "MS" | "ME" if alias == base => Ok(Frequency::Monthly),
            "Q" | "QS" | "QE" => Ok(Frequency::Quarterly),
            "Y" | "YS" | "YE" | "A" | "AS" => Ok(Frequency::Yearly),
            _ => Err(HitGenError::InvalidFrequency(s.to_string())),
        }
    }
}

impl fmt::Display for Frequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let alias = match self {
            Frequency::Daily => "D",
            Frequency::Weekly => "W",
            Frequency::Monthly => "M",
            Frequency::Quarterly => "Q",
            Frequency::Yearly => "Y",
        };
        write!(f, "{}", alias)
    }
}

/// Sine/cosine terms of the seasonal period at harmonics `1..=order`.
///
/// Returns a `(dates.len(), 2 * order)` matrix with columns
/// `sin_1, cos_1, sin_2, cos_2, ...`.
pub fn fourier_features(dates: &[NaiveDate], frequency: Frequency, order: usize) -> Matrix {
    let t = frequency.time_index(dates);
    let period = frequency.period();
    let mut features = Matrix::zeros((dates.len(), 2 * order));
    for (row, &step) in t.iter().enumerate() {
        for k in 1..=order {
            let arg = 2.0 * PI * k as f64 * step / period;
            features[[row, 2 * (k - 1)]] = arg.sin() as f32;
            features[[row, 2 * (k - 1) + 1]] = arg.cos() as f32;
        }
    }
    features
}

/// Column names matching [`fourier_features`].
pub fn fourier_feature_names(frequency: Frequency, order: usize) -> Vec<String> {
    (1..=order)
        .flat_map(|k| [format!("sin_{}_{}", frequency, k), format!("cos_{}_{}", frequency, k)])
        .collect()
}
