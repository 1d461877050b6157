//! Training: annealing schedule, loop and history

pub mod annealing;
pub mod history;
pub mod trainer;

pub use annealing::{AnnealingSchedule, AnnealingState};
pub use history::{EpochMetrics, TrainingHistory};
pub use trainer::{evaluate, CvaeTrainer, TrainingReport};
