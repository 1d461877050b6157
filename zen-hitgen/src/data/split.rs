//! Train/test split over series ids
//!
//! The split is made once per dataset group and persisted so every later run
//! (and every trial of a search) sees the same training series.

use std::path::Path;

use log::info;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

use super::panel::WidePanel;
use crate::artifacts::{read_json, write_json_atomic};
use crate::dnn::seeded_rng;
use crate::errors::{HitGenError, HitGenResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeriesSplit {
    pub train_ids: Vec<String>,
    pub test_ids: Vec<String>,
}

impl SeriesSplit {
    /// Shuffle ids and cut at `train_fraction` (or take `train_size` ids).
    ///
    /// Afterwards, if no training series is observed at the first or last
    /// timestep, one test series observed there is moved to train. Both id lists
    /// come back sorted.
    pub fn create(
        wide: &WidePanel,
        train_fraction: f64,
        train_size: Option<usize>,
        seed: Option<u64>,
    ) -> HitGenResult<Self> {
        if !(0.0..=1.0).contains(&train_fraction) {
            return Err(HitGenError::config(format!(
                "train fraction must lie in [0, 1], got {}",
                train_fraction
            )));
        }
        let mut ids = wide.series_ids.clone();
        let mut rng = seeded_rng(seed);
        ids.shuffle(&mut rng);

        let cut = train_size
            .unwrap_or((ids.len() as f64 * train_fraction) as usize)
            .min(ids.len());
        let test_ids = ids.split_off(cut);
        let mut split = Self { train_ids: ids, test_ids };

        if wide.n_timesteps() > 0 {
            split.ensure_covered(wide.observed_at(0));
            split.ensure_covered(wide.observed_at(wide.n_timesteps() - 1));
        }
        split.train_ids.sort();
        split.test_ids.sort();
        Ok(split)
    }

    fn ensure_covered(&mut self, observed: Vec<&str>) {
        if observed.iter().any(|id| self.train_ids.iter().any(|t| t.as_str() == *id)) {
            return;
        }
        if let Some(pos) = self.test_ids.iter().position(|t| observed.contains(&t.as_str())) {
            let moved = self.test_ids.remove(pos);
            self.train_ids.push(moved);
        }
    }

    /// Load the persisted split, or create and persist a new one.
    pub fn load_or_create(
        path: &Path,
        wide: &WidePanel,
        train_fraction: f64,
        train_size: Option<usize>,
        seed: Option<u64>,
    ) -> HitGenResult<Self> {
        if path.exists() {
            let split: SeriesSplit = read_json(path)?;
            info!("Loaded series split from {}", path.display());
            return Ok(split);
        }
        let split = Self::create(wide, train_fraction, train_size, seed)?;
        write_json_atomic(path, &split)?;
        info!(
            "Created series split ({} train / {} test) at {}",
            split.train_ids.len(),
            split.test_ids.len(),
            path.display()
        );
        Ok(split)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::panel::SeriesRecord;
    use chrono::NaiveDate;

    fn date(m: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2021, m, 1).unwrap()
    }

    /// Ten series; only "late" reaches the last month, only "early" the first.
    fn wide() -> WidePanel {
        let mut records = Vec::new();
        for i in 0..8 {
            for m in 2..=5 {
                records.push(SeriesRecord::new(format!("s{}", i), date(m), m as f64));
            }
        }
        for m in 1..=3 {
            records.push(SeriesRecord::new("early", date(m), 1.0));
        }
        for m in 4..=6 {
            records.push(SeriesRecord::new("late", date(m), 1.0));
        }
        WidePanel::from_records(&records).unwrap()
    }

    #[test]
    fn test_split_partitions_ids_and_covers_edges() {
        let wide = wide();
        for seed in 0..20 {
            let split = SeriesSplit::create(&wide, 0.3, None, Some(seed)).unwrap();
            let mut all: Vec<String> = split.train_ids.iter().chain(&split.test_ids).cloned().collect();
            all.sort();
            assert_eq!(all, wide.series_ids);
            assert!(split.train_ids.contains(&"early".to_string()));
            assert!(split.train_ids.contains(&"late".to_string()));
        }
    }

    #[test]
    fn test_absolute_train_size() {
        let split = SeriesSplit::create(&wide(), 0.5, Some(4), Some(1)).unwrap();
        assert!(split.train_ids.len() >= 4);
        assert_eq!(split.train_ids.len() + split.test_ids.len(), 10);
    }

    #[test]
    fn test_split_is_persisted_and_reloaded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data_split").join("ds_grp_data_split.json");
        let wide = wide();
        let first = SeriesSplit::load_or_create(&path, &wide, 0.7, None, Some(5)).unwrap();
        assert!(path.exists());
        // a different seed must not matter once the file exists
        let second = SeriesSplit::load_or_create(&path, &wide, 0.7, None, Some(99)).unwrap();
        assert_eq!(first, second);
    }
}
