//! Hierarchical conditional VAE for synthesizing ragged multivariate time-series panels
//!
//! Series of different lengths are pivoted onto a shared time axis with a
//! binary mask marking observed cells. A conditional VAE built from
//! multi-resolution hierarchical interpolation (MRHI) blocks learns from
//! overlapping windows of the masked panel, conditioned on Fourier features of
//! the calendar. At inference the posterior is inflated to produce new
//! series that follow the same seasonal structure.
//!
//! ### Quick start
//!
//! ```rust,no_run
//! use zen_hitgen::prelude::*;
//!
//! # fn example(records: Vec<SeriesRecord>) -> HitGenResult<()> {
//! let pipeline = HitGenPipeline::new(
//!     "tourism",
//!     "Monthly",
//!     "MS",
//!     &records,
//!     "assets/model_weights",
//!     PipelineOptions::default(),
//! )?;
//!
//! let config = CvaeConfig::builder()
//!     .window_size(12)
//!     .latent_dim(16)
//!     .epochs(200)
//!     .build()?;
//! let fitted = pipeline.fit(&config, true)?;
//!
//! let synthetic = pipeline.predict(&fitted.model, SamplingConfig::default().with_seed(1))?;
//! let long = synthetic.to_long()?;
//! # let _ = long;
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//! - [`dnn`]: tape-based dense and recurrent layers, Adam, plateau schedule
//! - [`data`]: panel preparation, scaling, splitting and windowing
//! - [`cvae`]: MRHI encoder/decoder and the training objective
//! - [`training`]: annealing, the training loop and its history
//! - [`sampling`]: augmented generation back onto the source grid
//! - [`artifacts`]: atomic checkpoint, history and ledger files
//! - [`pipeline`]: the per-dataset context tying everything together

pub mod artifacts;
pub mod config;
pub mod cvae;
pub mod data;
pub mod dnn;
pub mod errors;
pub mod pipeline;
pub mod sampling;
pub mod training;

pub use config::{CvaeConfig, CvaeConfigBuilder, PoolingMode, SamplingConfig};
pub use cvae::Cvae;
pub use errors::{HitGenError, HitGenResult};
pub use pipeline::{FittedModel, HitGenPipeline, PipelineOptions, TrialOutcome};
pub use sampling::{Sampler, SyntheticPanel};
pub use training::{CvaeTrainer, TrainingHistory, TrainingReport};

/// Everything needed for the common fit / predict workflow.
pub mod prelude {
    pub use crate::artifacts::{ArtifactStore, BestScoresLedger, ScoreEntry};
    pub use crate::config::{CvaeConfig, PoolingMode, SamplingConfig};
    pub use crate::cvae::Cvae;
    pub use crate::data::{
        DetemporalizeMode, Frequency, Panel, PanelScaler, ScalerKind, SeriesRecord, WidePanel, WindowBatch,
        WindowGenerator,
    };
    pub use crate::dnn::WeightInitialization;
    pub use crate::errors::{HitGenError, HitGenResult};
    pub use crate::pipeline::{FittedModel, HitGenPipeline, PipelineOptions, TrialOutcome};
    pub use crate::sampling::{Sampler, SyntheticPanel};
    pub use crate::training::{evaluate, AnnealingSchedule, AnnealingState, CvaeTrainer, TrainingHistory};
}
