//! Error types for zen-hitgen

use std::path::PathBuf;

use thiserror::Error;

/// Crate-wide result alias.
pub type HitGenResult<T> = Result<T, HitGenError>;

#[derive(Debug, Error)]
pub enum HitGenError {
    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("Numeric divergence at epoch {epoch}, batch {batch}: loss is {value}")]
    NumericDivergence { epoch: usize, batch: usize, value: f32 },

    #[error("Missing artifact: {}", .0.display())]
    MissingArtifact(PathBuf),

    #[error("Invalid frequency: {0}")]
    InvalidFrequency(String),

    #[error("Unsupported configuration: {0}")]
    UnsupportedConfiguration(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Scaler has not been fitted")]
    ScalerNotFitted,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Array shape error: {0}")]
    Shape(#[from] ndarray::ShapeError),
}

impl HitGenError {
    pub fn shape(message: impl Into<String>) -> Self {
        HitGenError::ShapeMismatch(message.into())
    }

    pub fn config(message: impl Into<String>) -> Self {
        HitGenError::InvalidConfiguration(message.into())
    }

    /// Determine if the caller can carry on after this error
    ///
    /// # Returns
    ///
    /// - `true` for a missing checkpoint (train from scratch) or a diverged trial (prune it)
    /// - `false` for malformed inputs, configuration and infrastructure failures
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            HitGenError::MissingArtifact(_) | HitGenError::NumericDivergence { .. }
        )
    }
}
