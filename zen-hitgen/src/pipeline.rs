/**
 * @file zen-hitgen/src/pipeline.rs
 * @brief End-to-end generation context for one dataset group
 *
 * [`HitGenPipeline`] turns long records into two prepared panels (every
 * series, and the training series of the persisted split), each with its own
 * scaler and Fourier exogenous features. It trains or reloads the CVAE for
 * the full panel, generates synthetic panels, and runs single search trials
 * on the training panel, recording completed ones in the best-scores ledger.
 */

use std::path::PathBuf;
use std::str::FromStr;

use log::{info, warn};

use crate::artifacts::ledger::DEFAULT_LEDGER_CAPACITY;
use crate::artifacts::{ArtifactStore, BestScoresLedger, ScoreEntry};
use crate::config::{CvaeConfig, SamplingConfig};
use crate::cvae::Cvae;
use crate::data::{
    fourier_features, Frequency, Panel, PanelScaler, ScalerKind, SeriesRecord, SeriesSplit, WidePanel,
    WindowGenerator, DEFAULT_FOURIER_ORDER,
};
use crate::dnn::Matrix;
use crate::errors::{HitGenError, HitGenResult};
use crate::sampling::{Sampler, SyntheticPanel};
use crate::training::{CvaeTrainer, TrainingHistory};

/// Offset between the weight-initialization seed and a trial's sampling seed.
const SAMPLING_STREAM_OFFSET: u64 = 2;

/// Preparation and bookkeeping knobs that are not model hyperparameters.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineOptions {
    pub scaler: ScalerKind,
    pub fourier_order: usize,
    /// Share of series assigned to training when the split is first created.
    pub train_fraction: f64,
    /// Absolute number of training series; overrides `train_fraction`.
    pub train_size: Option<usize>,
    pub split_seed: Option<u64>,
    pub ledger_capacity: usize,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            scaler: ScalerKind::MinMax,
            fourier_order: DEFAULT_FOURIER_ORDER,
            train_fraction: 0.7,
            train_size: None,
            split_seed: None,
            ledger_capacity: DEFAULT_LEDGER_CAPACITY,
        }
    }
}

/// A labelled grid, its scaled model panel and the scaler between them.
#[derive(Debug, Clone)]
pub struct PreparedPanel {
    grid: WidePanel,
    panel: Panel,
    scaler: PanelScaler,
}

impl PreparedPanel {
    fn new(grid: WidePanel, exogenous: Matrix, kind: ScalerKind) -> HitGenResult<Self> {
        let mut scaler = PanelScaler::new(kind);
        let scaled = scaler.fit_transform(&grid.values, Some(&grid.mask))?;
        let panel = Panel::new(scaled, grid.mask.clone(), exogenous)?;
        Ok(Self { grid, panel, scaler })
    }

    pub fn grid(&self) -> &WidePanel {
        &self.grid
    }

    pub fn panel(&self) -> &Panel {
        &self.panel
    }

    pub fn scaler(&self) -> &PanelScaler {
        &self.scaler
    }

    fn generator(&self, config: &CvaeConfig, shuffle: bool) -> HitGenResult<WindowGenerator> {
        WindowGenerator::new(&self.panel, config.window_size, config.stride, config.batch_size, shuffle)
    }

    fn synthesize(&self, model: &Cvae, sampling: SamplingConfig) -> HitGenResult<SyntheticPanel> {
        if model.n_series() != self.panel.n_series() || model.n_features() != self.panel.n_features() {
            return Err(HitGenError::shape(format!(
                "model built for {} series / {} features, panel has {} / {}",
                model.n_series(),
                model.n_features(),
                self.panel.n_series(),
                self.panel.n_features()
            )));
        }
        let config = model.config();
        let generator = WindowGenerator::covering(&self.panel, config.window_size, config.stride, config.batch_size)?;
        let values = Sampler::new(model, sampling)?.sample(&generator, &self.scaler)?;
        SyntheticPanel::new(&self.grid, values)
    }
}

/// Trained (or reloaded) model with its history.
#[derive(Debug, Clone)]
pub struct FittedModel {
    pub model: Cvae,
    pub history: TrainingHistory,
    pub from_checkpoint: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TrialOutcome {
    Completed { trial: usize, score: f64, loss: f64, admitted: bool },
    /// Diverged or unscorable; the ledger was not touched.
    Pruned { trial: usize, config: CvaeConfig, reason: String },
}

impl TrialOutcome {
    pub fn is_pruned(&self) -> bool {
        matches!(self, TrialOutcome::Pruned { .. })
    }
}

#[derive(Debug, Clone)]
pub struct HitGenPipeline {
    dataset_name: String,
    dataset_group: String,
    frequency: Frequency,
    options: PipelineOptions,
    split: SeriesSplit,
    full: PreparedPanel,
    train: PreparedPanel,
    artifacts: ArtifactStore,
}

impl HitGenPipeline {
    pub fn new(
        dataset_name: &str,
        dataset_group: &str,
        frequency: &str,
        records: &[SeriesRecord],
        artifact_root: impl Into<PathBuf>,
        options: PipelineOptions,
    ) -> HitGenResult<Self> {
        let frequency = Frequency::from_str(frequency)?;
        let artifacts = ArtifactStore::new(artifact_root, dataset_name, dataset_group);
        let wide = WidePanel::from_records(records)?;
        let exogenous = fourier_features(&wide.timestamps, frequency, options.fourier_order);

        let split = SeriesSplit::load_or_create(
            &artifacts.split_path(),
            &wide,
            options.train_fraction,
            options.train_size,
            options.split_seed,
        )?;
        if split.train_ids.is_empty() {
            return Err(HitGenError::config("series split assigns no series to training"));
        }
        let train_grid = wide.select_series(&split.train_ids)?;

        let full = PreparedPanel::new(wide, exogenous.clone(), options.scaler)?;
        let train = PreparedPanel::new(train_grid, exogenous, options.scaler)?;
        info!(
            "Prepared {}_{} ({}): {} timesteps, {} series ({} for training), {} exogenous features",
            dataset_name,
            dataset_group,
            frequency,
            full.panel.n_timesteps(),
            full.panel.n_series(),
            train.panel.n_series(),
            full.panel.n_features()
        );

        Ok(Self {
            dataset_name: dataset_name.to_string(),
            dataset_group: dataset_group.to_string(),
            frequency,
            options,
            split,
            full,
            train,
            artifacts,
        })
    }

    pub fn dataset_name(&self) -> &str {
        &self.dataset_name
    }

    pub fn dataset_group(&self) -> &str {
        &self.dataset_group
    }

    pub fn frequency(&self) -> Frequency {
        self.frequency
    }

    pub fn options(&self) -> &PipelineOptions {
        &self.options
    }

    pub fn split(&self) -> &SeriesSplit {
        &self.split
    }

    pub fn full(&self) -> &PreparedPanel {
        &self.full
    }

    pub fn train(&self) -> &PreparedPanel {
        &self.train
    }

    pub fn artifacts(&self) -> &ArtifactStore {
        &self.artifacts
    }

    pub fn ledger(&self) -> HitGenResult<BestScoresLedger> {
        BestScoresLedger::open(
            self.artifacts.ledger_path(),
            self.artifacts.ledger_meta_path(),
            self.options.ledger_capacity,
        )
    }

    /// Model for the full panel: reloaded when `load_weights` and a checkpoint
    /// exists, trained (with checkpointing) otherwise.
    pub fn fit(&self, config: &CvaeConfig, load_weights: bool) -> HitGenResult<FittedModel> {
        if load_weights {
            match self.artifacts.load_checkpoint() {
                Ok(checkpoint) => return self.restore(checkpoint, config),
                Err(HitGenError::MissingArtifact(path)) => {
                    warn!("No checkpoint at {}, training from scratch", path.display());
                }
                Err(err) => return Err(err),
            }
        }

        let mut model = Cvae::new(config.clone(), self.full.panel.n_series(), self.full.panel.n_features())?;
        let mut generator = self.full.generator(config, config.shuffle)?;
        let report = CvaeTrainer::new(config)?
            .with_checkpointing(self.artifacts.clone())
            .fit(&mut model, &mut generator)?;
        Ok(FittedModel { model, history: report.history, from_checkpoint: false })
    }

    fn restore(&self, checkpoint: crate::artifacts::Checkpoint, requested: &CvaeConfig) -> HitGenResult<FittedModel> {
        if checkpoint.n_series != self.full.panel.n_series() || checkpoint.n_features != self.full.panel.n_features() {
            return Err(HitGenError::shape(format!(
                "checkpoint holds {} series / {} features, panel has {} / {}",
                checkpoint.n_series,
                checkpoint.n_features,
                self.full.panel.n_series(),
                self.full.panel.n_features()
            )));
        }
        if &checkpoint.config != requested {
            warn!("Checkpoint hyperparameters differ from the requested ones; using the checkpoint's");
        }
        let model = Cvae::from_checkpoint(checkpoint)?;
        let history = match self.artifacts.load_history() {
            Ok(history) => history,
            Err(HitGenError::MissingArtifact(path)) => {
                warn!("No training history at {}", path.display());
                TrainingHistory::new()
            }
            Err(err) => return Err(err),
        };
        info!("Loaded weights from {}", self.artifacts.weights_path().display());
        Ok(FittedModel { model, history, from_checkpoint: true })
    }

    /// Model for the training series only, without checkpointing.
    pub fn fit_train(&self, config: &CvaeConfig) -> HitGenResult<FittedModel> {
        let mut model = Cvae::new(config.clone(), self.train.panel.n_series(), self.train.panel.n_features())?;
        let mut generator = self.train.generator(config, config.shuffle)?;
        let report = CvaeTrainer::new(config)?.fit(&mut model, &mut generator)?;
        Ok(FittedModel { model, history: report.history, from_checkpoint: false })
    }

    /// Synthetic version of the full panel.
    pub fn predict(&self, model: &Cvae, sampling: SamplingConfig) -> HitGenResult<SyntheticPanel> {
        self.full.synthesize(model, sampling)
    }

    /// Synthetic version of the training panel, inverse-scaled with the
    /// training scaler. `model` must be built for the training series, e.g.
    /// by [`HitGenPipeline::fit_train`].
    pub fn predict_train(&self, model: &Cvae, sampling: SamplingConfig) -> HitGenResult<SyntheticPanel> {
        self.train.synthesize(model, sampling)
    }

    /// Train on the training series, generate, score with `scorer` and record
    /// the result.
    ///
    /// `scorer` receives the original training grid and its synthetic
    /// counterpart; lower scores are better. Numeric divergence and a missing
    /// or non-finite score prune the trial. Other errors propagate.
    ///
    /// Without a `sampling.seed`, generation is seeded from `config.seed`, so
    /// a seeded trial scores the same on every run.
    pub fn run_trial<F>(
        &self,
        trial: usize,
        config: &CvaeConfig,
        sampling: SamplingConfig,
        scorer: F,
    ) -> HitGenResult<TrialOutcome>
    where
        F: FnOnce(&WidePanel, &SyntheticPanel) -> Option<f64>,
    {
        let pruned = |reason: String| -> HitGenResult<TrialOutcome> {
            warn!("Pruning trial {}: {}", trial, reason);
            Ok(TrialOutcome::Pruned { trial, config: config.clone(), reason })
        };

        let fitted = match self.fit_train(config) {
            Ok(fitted) => fitted,
            Err(err @ HitGenError::NumericDivergence { .. }) => return pruned(err.to_string()),
            Err(err) => return Err(err),
        };
        let loss = fitted.history.best_loss().map_or(f64::NAN, |(_, loss)| loss);

        let sampling = SamplingConfig {
            seed: sampling.seed.or(config.seed.map(|s| s.wrapping_add(SAMPLING_STREAM_OFFSET))),
            ..sampling
        };
        let synthetic = self.predict_train(&fitted.model, sampling)?;
        let score = match scorer(&self.train.grid, &synthetic) {
            Some(score) if score.is_finite() => score,
            Some(score) => return pruned(format!("non-finite score {}", score)),
            None => return pruned("no valid score".to_string()),
        };

        let mut ledger = self.ledger()?;
        let admitted = ledger.record(ScoreEntry { trial, score, loss, config: config.clone() })?;
        info!("Trial {} completed: score {:.6}, loss {:.6}", trial, score, loss);
        Ok(TrialOutcome::Completed { trial, score, loss, admitted })
    }
}
