/**
 * CVAE training loop.
 *
 * One epoch walks every batch of the window generator: forward pass in
 * training mode with the epoch's annealed noise scale, masked reconstruction
 * loss plus weighted KL, reverse pass over the tape, optional global-norm
 * clipping and a joint Adam step over encoder and decoder weights.
 *
 * Epoch boundaries evaluate early stopping on the window-weighted mean total
 * loss, feed the plateau scheduler, checkpoint improved weights when an
 * artifact store is attached and reshuffle the generator.
 */

use std::time::Instant;

use log::{debug, info, warn};
use rand::Rng;
use rand_chacha::ChaCha8Rng;

use super::annealing::{AnnealingSchedule, AnnealingState};
use super::history::{EpochMetrics, TrainingHistory};
use crate::artifacts::ArtifactStore;
use crate::config::CvaeConfig;
use crate::cvae::{cvae_loss, Cvae, LossValues};
use crate::data::WindowGenerator;
use crate::dnn::{clip_gradients, seeded_rng, AdamOptimizer, ForwardMode, ParamStore, ReduceLrOnPlateau, Tape};
use crate::errors::{HitGenError, HitGenResult};

/// Offset between the weight-initialization seed and the training stream seed.
const TRAINING_STREAM_OFFSET: u64 = 1;

/// Outcome of [`CvaeTrainer::fit`].
#[derive(Debug, Clone)]
pub struct TrainingReport {
    pub history: TrainingHistory,
    pub epochs_run: usize,
    /// Epoch whose weights the model holds after training.
    pub best_epoch: Option<usize>,
    pub best_loss: f32,
    pub stopped_early: bool,
    pub final_learning_rate: f32,
}

#[derive(Debug, Clone)]
struct EarlyStoppingState {
    best_loss: f32,
    best_epoch: Option<usize>,
    wait_count: usize,
    best_params: Option<ParamStore>,
}

impl EarlyStoppingState {
    fn new() -> Self {
        Self { best_loss: f32::INFINITY, best_epoch: None, wait_count: 0, best_params: None }
    }

    /// Returns whether `loss` improved on the best epoch so far.
    fn update(&mut self, epoch: usize, loss: f32, params: &ParamStore) -> bool {
        if loss < self.best_loss {
            self.best_loss = loss;
            self.best_epoch = Some(epoch);
            self.wait_count = 0;
            self.best_params = Some(params.clone());
            true
        } else {
            self.wait_count += 1;
            false
        }
    }

    fn should_stop(&self, patience: usize) -> bool {
        self.wait_count >= patience
    }
}

pub struct CvaeTrainer {
    config: CvaeConfig,
    optimizer: AdamOptimizer,
    scheduler: ReduceLrOnPlateau,
    annealing: AnnealingSchedule,
    history: TrainingHistory,
    early_stopping: EarlyStoppingState,
    artifacts: Option<ArtifactStore>,
    rng: ChaCha8Rng,
}

impl CvaeTrainer {
    pub fn new(config: &CvaeConfig) -> HitGenResult<Self> {
        config.validate()?;
        Ok(Self {
            config: config.clone(),
            optimizer: AdamOptimizer::new(config.learning_rate),
            scheduler: plateau_schedule(config),
            annealing: AnnealingSchedule::from_config(config),
            history: TrainingHistory::new(),
            early_stopping: EarlyStoppingState::new(),
            artifacts: None,
            rng: seeded_rng(config.seed.map(|s| s.wrapping_add(TRAINING_STREAM_OFFSET))),
        })
    }

    /// Save best weights and the final history through `store`.
    pub fn with_checkpointing(mut self, store: ArtifactStore) -> Self {
        self.artifacts = Some(store);
        self
    }

    pub fn history(&self) -> &TrainingHistory {
        &self.history
    }

    pub fn annealing(&self) -> &AnnealingSchedule {
        &self.annealing
    }

    /// Train `model` from the current weights. Every call starts a fresh run:
    /// history, best-loss tracking, optimizer moments and the learning rate are
    /// reset, so a reused trainer never carries state across models.
    pub fn fit(&mut self, model: &mut Cvae, generator: &mut WindowGenerator) -> HitGenResult<TrainingReport> {
        self.reset();
        if generator.is_empty() {
            return Err(HitGenError::InvalidInput("no windows to train on".to_string()));
        }
        if generator.window_size() != model.config().window_size {
            return Err(HitGenError::shape(format!(
                "generator yields windows of {}, model expects {}",
                generator.window_size(),
                model.config().window_size
            )));
        }
        info!(
            "Training CVAE for up to {} epochs on {} windows ({} batches per epoch)",
            self.config.epochs,
            generator.window_count(),
            generator.len()
        );

        let mut epochs_run = 0;
        let mut stopped_early = false;
        for epoch in 0..self.config.epochs {
            let started = Instant::now();
            let annealing = self.annealing.at(epoch);
            let metrics = self.train_epoch(model, generator, annealing)?;
            self.history.record(&metrics);
            epochs_run += 1;

            if self.early_stopping.update(epoch, metrics.loss, model.params()) {
                if let Some(store) = &self.artifacts {
                    store.save_checkpoint(&model.checkpoint())?;
                    debug!("Epoch {}: loss improved to {:.6}, checkpoint saved", epoch + 1, metrics.loss);
                }
            }

            let previous_lr = self.optimizer.learning_rate();
            let lr = self.scheduler.step(metrics.loss);
            if lr != previous_lr {
                self.optimizer.set_learning_rate(lr);
                info!("Epoch {}: reducing learning rate to {:.3e}", epoch + 1, lr);
            }

            info!(
                "Epoch {}/{}: loss {:.6} (reconstruction {:.6}, kl {:.6}) - kl_weight {:.4}, noise_scale {:.4}, lr {:.3e} - {:.2}s",
                epoch + 1,
                self.config.epochs,
                metrics.loss,
                metrics.reconstruction_loss,
                metrics.kl_loss,
                metrics.kl_weight,
                metrics.noise_scale,
                metrics.learning_rate,
                started.elapsed().as_secs_f32()
            );

            generator.on_epoch_end(&mut self.rng);

            if self.early_stopping.should_stop(self.config.patience) {
                info!(
                    "Early stopping at epoch {}: no improvement for {} epochs",
                    epoch + 1,
                    self.config.patience
                );
                stopped_early = true;
                break;
            }
        }

        if let Some(best) = self.early_stopping.best_params.take() {
            model.load_params(&best)?;
            if let Some(epoch) = self.early_stopping.best_epoch {
                info!("Restored weights from epoch {} (loss {:.6})", epoch + 1, self.early_stopping.best_loss);
            }
        }
        if let Some(store) = &self.artifacts {
            store.save_history(&self.history)?;
            info!("Training history written to {}", store.history_path().display());
        }

        Ok(TrainingReport {
            history: self.history.clone(),
            epochs_run,
            best_epoch: self.early_stopping.best_epoch,
            best_loss: self.early_stopping.best_loss,
            stopped_early,
            final_learning_rate: self.optimizer.learning_rate(),
        })
    }

    fn reset(&mut self) {
        self.history = TrainingHistory::new();
        self.early_stopping = EarlyStoppingState::new();
        self.optimizer.reset();
        self.optimizer.set_learning_rate(self.config.learning_rate);
        self.scheduler = plateau_schedule(&self.config);
    }

    fn train_epoch(
        &mut self,
        model: &mut Cvae,
        generator: &WindowGenerator,
        annealing: AnnealingState,
    ) -> HitGenResult<EpochMetrics> {
        let mut sums = LossValues::default();
        let mut windows = 0usize;

        for index in 0..generator.len() {
            let batch = generator.batch(index)?;
            let mut tape = Tape::new();
            let output = model.forward(&mut tape, &batch, annealing.noise_scale, ForwardMode::Training, &mut self.rng)?;
            let terms = cvae_loss(&mut tape, &output, annealing.kl_weight)?;
            let values = terms.values(&tape);
            if !values.is_finite() {
                let value = [values.total, values.reconstruction, values.kl]
                    .into_iter()
                    .find(|v| !v.is_finite())
                    .unwrap_or(values.total);
                warn!("Non-finite loss {} at epoch {} batch {}", value, annealing.epoch + 1, index);
                return Err(HitGenError::NumericDivergence { epoch: annealing.epoch, batch: index, value });
            }

            let gradients = tape.backward(terms.total)?;
            let mut grads = gradients.for_store(model.params());
            if let Some(max_norm) = self.config.gradient_clip_norm {
                let norm = clip_gradients(&mut grads, max_norm);
                if norm > max_norm {
                    debug!("Clipped gradient norm {:.4} to {}", norm, max_norm);
                }
            }
            self.optimizer.update(model.params_mut(), &grads)?;

            debug!(
                "Epoch {} batch {}/{}: loss {:.6} (reconstruction {:.6}, kl {:.6})",
                annealing.epoch + 1,
                index + 1,
                generator.len(),
                values.total,
                values.reconstruction,
                values.kl
            );

            let weight = batch.len() as f32;
            sums.total += values.total * weight;
            sums.reconstruction += values.reconstruction * weight;
            sums.kl += values.kl * weight;
            windows += batch.len();
        }

        let n = windows.max(1) as f32;
        Ok(EpochMetrics {
            loss: sums.total / n,
            reconstruction_loss: sums.reconstruction / n,
            kl_loss: sums.kl / n,
            kl_weight: annealing.kl_weight,
            noise_scale: annealing.noise_scale,
            learning_rate: self.optimizer.learning_rate(),
        })
    }
}

/// Window-weighted mean loss over every batch, inference mode, no updates.
pub fn evaluate<R: Rng + ?Sized>(
    model: &Cvae,
    generator: &WindowGenerator,
    annealing: AnnealingState,
    rng: &mut R,
) -> HitGenResult<LossValues> {
    let mut sums = LossValues::default();
    let mut windows = 0usize;
    for index in 0..generator.len() {
        let batch = generator.batch(index)?;
        let mut tape = Tape::new();
        let output = model.forward(&mut tape, &batch, annealing.noise_scale, ForwardMode::Inference, rng)?;
        let values = cvae_loss(&mut tape, &output, annealing.kl_weight)?.values(&tape);
        let weight = batch.len() as f32;
        sums.total += values.total * weight;
        sums.reconstruction += values.reconstruction * weight;
        sums.kl += values.kl * weight;
        windows += batch.len();
    }
    let n = windows.max(1) as f32;
    Ok(LossValues { total: sums.total / n, reconstruction: sums.reconstruction / n, kl: sums.kl / n })
}

fn plateau_schedule(config: &CvaeConfig) -> ReduceLrOnPlateau {
    ReduceLrOnPlateau::new(
        config.learning_rate,
        config.lr_reduce_factor,
        config.lr_patience,
        config.lr_cooldown,
        config.min_learning_rate,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Panel;
    use crate::training::history::LOSS;
    use ndarray::Array2;

    fn init_logging() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn config(epochs: usize) -> CvaeConfig {
        CvaeConfig::builder()
            .window_size(4)
            .batch_size(4)
            .latent_dim(2)
            .blocks(1, 1)
            .hidden(6, 1)
            .bi_rnn(false)
            .epochs(epochs)
            .patience(epochs)
            .learning_rate(0.01)
            .seed(5)
            .build()
            .unwrap()
    }

    fn generator() -> WindowGenerator {
        let values = Array2::from_shape_fn((12, 2), |(t, s)| 0.5 + 0.4 * ((t as f32) * 0.6 + s as f32).sin());
        let exogenous = Array2::from_shape_fn((12, 2), |(t, f)| ((t as f32) * (f as f32 + 1.0) * 0.5).cos());
        let panel = Panel::fully_observed(values, exogenous).unwrap();
        WindowGenerator::new(&panel, 4, 1, 4, true).unwrap()
    }

    #[test]
    fn test_early_stopping_tracks_best_epoch() {
        let params = ParamStore::new();
        let mut state = EarlyStoppingState::new();
        assert!(state.update(0, 1.0, &params));
        assert!(state.update(1, 0.5, &params));
        assert!(!state.update(2, 0.5, &params));
        assert!(!state.update(3, 0.7, &params));
        assert!(state.should_stop(2));
        assert!(!state.should_stop(3));
        assert_eq!(state.best_epoch, Some(1));
    }

    #[test]
    fn test_fit_records_history_and_restores_best_weights() {
        init_logging();
        let config = config(6);
        let mut model = Cvae::new(config.clone(), 2, 2).unwrap();
        let mut generator = generator();
        let mut trainer = CvaeTrainer::new(&config).unwrap();
        let report = trainer.fit(&mut model, &mut generator).unwrap();

        assert_eq!(report.epochs_run, 6);
        assert_eq!(report.history.len(), 6);
        assert_eq!(generator.epoch(), 6);
        let losses = report.history.get(LOSS).unwrap();
        let (best_epoch, best_loss) = report.history.best_loss().unwrap();
        assert_eq!(report.best_epoch, Some(best_epoch));
        assert_eq!(report.best_loss as f64, best_loss);
        assert!(losses.iter().all(|l| l.is_finite()));
    }

    #[test]
    fn test_reused_trainer_starts_each_fit_fresh() {
        let config = config(3);
        let mut trainer = CvaeTrainer::new(&config).unwrap();

        let mut first = Cvae::new(config.clone(), 2, 2).unwrap();
        trainer.fit(&mut first, &mut generator()).unwrap();

        // a model whose loss can never beat the previous run's best
        let mut second = Cvae::new(config.clone(), 2, 2).unwrap();
        for value in second.params_mut().values_mut() {
            value.fill(0.3);
        }
        let report = trainer.fit(&mut second, &mut generator()).unwrap();

        assert_eq!(report.history.len(), 3);
        assert_eq!(trainer.history().len(), 3);
        let (best_epoch, best_loss) = report.history.best_loss().unwrap();
        assert_eq!(report.best_epoch, Some(best_epoch));
        assert_eq!(report.best_loss as f64, best_loss);
        assert_eq!(report.final_learning_rate, config.learning_rate);
    }

    #[test]
    fn test_non_finite_loss_aborts_with_location() {
        let config = config(3);
        let mut model = Cvae::new(config.clone(), 2, 2).unwrap();
        for value in model.params_mut().values_mut() {
            value.fill(f32::NAN);
        }
        let mut generator = generator();
        let err = CvaeTrainer::new(&config).unwrap().fit(&mut model, &mut generator).unwrap_err();
        match err {
            HitGenError::NumericDivergence { epoch, batch, value } => {
                assert_eq!((epoch, batch), (0, 0));
                assert!(!value.is_finite());
            }
            other => panic!("expected NumericDivergence, got {:?}", other),
        }
    }

    #[test]
    fn test_checkpointing_saves_best_weights_and_history() {
        init_logging();
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path(), "unit", "test");
        let config = config(3);
        let mut model = Cvae::new(config.clone(), 2, 2).unwrap();
        let mut generator = generator();
        let mut trainer = CvaeTrainer::new(&config).unwrap().with_checkpointing(store.clone());
        trainer.fit(&mut model, &mut generator).unwrap();

        let checkpoint = store.load_checkpoint().unwrap();
        assert_eq!(&checkpoint.params, model.params());
        assert_eq!(store.load_history().unwrap().len(), 3);
    }
}
