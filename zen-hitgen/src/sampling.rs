//! Augmented sampling
//!
//! Generation reuses the encoder's posterior instead of the prior: every
//! window is encoded in inference mode, the posterior spread is inflated by
//! `alpha` and perturbed with `N(0, epsilon_std^2)` noise, and the decoded
//! windows are folded back onto the time axis by their recorded start
//! indices before inverse scaling.

use log::{debug, info};
use ndarray::{concatenate, Axis};
use ndarray_rand::RandomExt;
use rand::Rng;
use rand_distr::Normal;

use crate::config::SamplingConfig;
use crate::cvae::encoder::reparameterize;
use crate::cvae::Cvae;
use crate::data::{detemporalize, PanelScaler, SeriesRecord, SeriesSplit, WidePanel, WindowGenerator};
use crate::dnn::{seeded_rng, ForwardMode, Matrix, Tape};
use crate::errors::{HitGenError, HitGenResult};

/// Generated values on the grid of a source panel.
#[derive(Debug, Clone, PartialEq)]
pub struct SyntheticPanel {
    grid: WidePanel,
}

impl SyntheticPanel {
    /// Attach `values` to the ids, timestamps and mask of `template`.
    pub fn new(template: &WidePanel, values: Matrix) -> HitGenResult<Self> {
        if values.dim() != template.mask.dim() {
            return Err(HitGenError::shape(format!(
                "synthetic values {:?} do not match the source grid {:?}",
                values.dim(),
                template.mask.dim()
            )));
        }
        Ok(Self {
            grid: WidePanel {
                series_ids: template.series_ids.clone(),
                timestamps: template.timestamps.clone(),
                values,
                mask: template.mask.clone(),
            },
        })
    }

    pub fn values(&self) -> &Matrix {
        &self.grid.values
    }

    pub fn mask(&self) -> &Matrix {
        &self.grid.mask
    }

    pub fn series_ids(&self) -> &[String] {
        &self.grid.series_ids
    }

    pub fn n_timesteps(&self) -> usize {
        self.grid.n_timesteps()
    }

    pub fn n_series(&self) -> usize {
        self.grid.n_series()
    }

    /// Long records for the cells observed in the source panel.
    pub fn to_long(&self) -> HitGenResult<Vec<SeriesRecord>> {
        self.grid.to_records(&self.grid.values)
    }

    /// [`to_long`](Self::to_long) partitioned into the split's training and
    /// test series; ids in neither list are dropped.
    pub fn split_long(&self, split: &SeriesSplit) -> HitGenResult<(Vec<SeriesRecord>, Vec<SeriesRecord>)> {
        let mut train = Vec::new();
        let mut test = Vec::new();
        for record in self.to_long()? {
            if split.train_ids.contains(&record.unique_id) {
                train.push(record);
            } else if split.test_ids.contains(&record.unique_id) {
                test.push(record);
            }
        }
        Ok((train, test))
    }

    pub fn into_wide(self) -> WidePanel {
        self.grid
    }
}

pub struct Sampler<'a> {
    model: &'a Cvae,
    config: SamplingConfig,
}

impl<'a> Sampler<'a> {
    pub fn new(model: &'a Cvae, config: SamplingConfig) -> HitGenResult<Self> {
        config.validate()?;
        Ok(Self { model, config })
    }

    pub fn config(&self) -> &SamplingConfig {
        &self.config
    }

    /// Decoded windows in generator order with their start indices.
    pub fn sample_windows<R: Rng + ?Sized>(
        &self,
        generator: &WindowGenerator,
        rng: &mut R,
    ) -> HitGenResult<(Matrix, Vec<usize>)> {
        let noise = Normal::new(0.0f32, self.config.epsilon_std)
            .map_err(|e| HitGenError::config(format!("epsilon_std {}: {}", self.config.epsilon_std, e)))?;
        let mut decoded = Vec::with_capacity(generator.len());
        let mut starts = Vec::with_capacity(generator.window_count());
        for index in 0..generator.len() {
            let batch = generator.batch(index)?;
            let mut tape = Tape::new();
            let (inputs, mean, log_var) = self.model.encode_moments(&mut tape, &batch, rng)?;
            let eps = Matrix::random_using(tape.value(mean).dim(), noise, rng);
            let z = reparameterize(&mut tape, mean, log_var, self.config.alpha, eps)?;
            let reconstruction = self.model.decode(&mut tape, z, &inputs, ForwardMode::Inference, rng)?;
            decoded.push(tape.value(reconstruction).clone());
            starts.extend_from_slice(&batch.starts);
            debug!("Sampled batch {}/{}", index + 1, generator.len());
        }
        let views: Vec<_> = decoded.iter().map(|m| m.view()).collect();
        Ok((concatenate(Axis(0), &views)?, starts))
    }

    /// `(T, S)` synthetic panel in scaled space. The generator's windows must
    /// cover every timestep; build it with [`WindowGenerator::covering`].
    pub fn sample_scaled(&self, generator: &WindowGenerator) -> HitGenResult<Matrix> {
        let mut rng = seeded_rng(self.config.seed);
        let (windows, starts) = self.sample_windows(generator, &mut rng)?;
        detemporalize(
            &windows,
            &starts,
            generator.window_size(),
            generator.n_timesteps(),
            self.config.detemporalize,
        )
    }

    /// `(T, S)` synthetic panel in the original units of `scaler`.
    pub fn sample(&self, generator: &WindowGenerator, scaler: &PanelScaler) -> HitGenResult<Matrix> {
        let scaled = self.sample_scaled(generator)?;
        let values = scaler.inverse_transform(&scaled)?;
        info!(
            "Generated {} x {} synthetic panel (alpha {}, epsilon_std {})",
            values.nrows(),
            values.ncols(),
            self.config.alpha,
            self.config.epsilon_std
        );
        Ok(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CvaeConfig;
    use crate::data::Panel;
    use chrono::NaiveDate;
    use ndarray::Array2;

    fn model() -> Cvae {
        let config = CvaeConfig::builder()
            .window_size(3)
            .latent_dim(2)
            .blocks(1, 1)
            .hidden(4, 1)
            .seed(8)
            .build()
            .unwrap();
        Cvae::new(config, 2, 1).unwrap()
    }

    fn generator(shuffle_seed: Option<u64>) -> WindowGenerator {
        let values = Array2::from_shape_fn((7, 2), |(t, s)| (t + s) as f32 / 8.0);
        let exogenous = Array2::from_shape_fn((7, 1), |(t, _)| t as f32 / 7.0);
        let panel = Panel::fully_observed(values, exogenous).unwrap();
        let mut generator = WindowGenerator::new(&panel, 3, 1, 2, shuffle_seed.is_some()).unwrap();
        if let Some(seed) = shuffle_seed {
            generator.on_epoch_end(&mut seeded_rng(Some(seed)));
        }
        generator
    }

    #[test]
    fn test_zero_noise_output_ignores_window_order() {
        let model = model();
        let config = SamplingConfig { epsilon_std: 0.0, ..SamplingConfig::default() };
        let sampler = Sampler::new(&model, config).unwrap();
        let ordered = sampler.sample_scaled(&generator(None)).unwrap();
        let shuffled = sampler.sample_scaled(&generator(Some(3))).unwrap();
        assert_eq!(ordered.dim(), (7, 2));
        for (a, b) in ordered.iter().zip(shuffled.iter()) {
            approx::assert_relative_eq!(*a, *b, epsilon = 1e-5);
        }
    }

    #[test]
    fn test_synthetic_panel_to_long_keeps_observed_cells() {
        let date = |d| NaiveDate::from_ymd_opt(2020, 1, d).unwrap();
        let records = vec![
            SeriesRecord::new("a", date(1), 1.0),
            SeriesRecord::new("a", date(2), 2.0),
            SeriesRecord::new("b", date(2), 3.0),
        ];
        let wide = WidePanel::from_records(&records).unwrap();
        let synthetic = SyntheticPanel::new(&wide, Array2::from_elem((2, 2), 9.0)).unwrap();
        let long = synthetic.to_long().unwrap();
        assert_eq!(long.len(), 3);
        assert!(long.iter().all(|r| r.y == 9.0));
        assert!(SyntheticPanel::new(&wide, Array2::zeros((3, 2))).is_err());
    }

    #[test]
    fn test_split_long_partitions_by_series_id() {
        let date = |d| NaiveDate::from_ymd_opt(2021, 3, d).unwrap();
        let records: Vec<_> = ["a", "b", "c"]
            .iter()
            .flat_map(|id| (1..=4).map(move |d| SeriesRecord::new(*id, date(d), d as f64)))
            .collect();
        let wide = WidePanel::from_records(&records).unwrap();
        let synthetic = SyntheticPanel::new(&wide, Array2::from_elem((4, 3), 1.5)).unwrap();
        let split = SeriesSplit { train_ids: vec!["a".into(), "c".into()], test_ids: vec!["b".into()] };

        let (train, test) = synthetic.split_long(&split).unwrap();
        assert_eq!(train.len(), 8);
        assert_eq!(test.len(), 4);
        assert!(train.iter().all(|r| r.unique_id != "b"));
        assert!(test.iter().all(|r| r.unique_id == "b" && r.y == 1.5));
    }

    #[test]
    fn test_strided_sampling_needs_a_covering_generator() {
        let model = model();
        let values = Array2::from_elem((8, 2), 0.5);
        let panel = Panel::fully_observed(values, Array2::zeros((8, 1))).unwrap();
        let sampler = Sampler::new(&model, SamplingConfig::default().with_seed(2)).unwrap();

        // stride 3 over 8 steps leaves t = 6, 7 outside every window
        let strided = WindowGenerator::new(&panel, 3, 3, 4, false).unwrap();
        assert!(matches!(
            sampler.sample_scaled(&strided),
            Err(HitGenError::UnsupportedConfiguration(_))
        ));

        let covering = WindowGenerator::covering(&panel, 3, 3, 4).unwrap();
        let out = sampler.sample_scaled(&covering).unwrap();
        assert_eq!(out.dim(), (8, 2));
        assert!(out.iter().all(|v| v.is_finite()));
    }
}
