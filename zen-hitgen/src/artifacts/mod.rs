//! Persisted artifacts
//!
//! Every file keyed by `{dataset_name}_{dataset_group}` lives under one root
//! directory. Writes go to a uniquely named temporary sibling that is synced
//! and then renamed over the target, so an interrupted run never leaves a
//! truncated checkpoint, history or ledger behind.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process;
use std::time::{SystemTime, UNIX_EPOCH};

use log::info;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::config::CvaeConfig;
use crate::dnn::ParamStore;
use crate::errors::{HitGenError, HitGenResult};
use crate::training::history::TrainingHistory;

pub mod ledger;

pub use ledger::{BestScoresLedger, ScoreEntry};

/// Bumped whenever the checkpoint layout changes.
pub const CHECKPOINT_SCHEMA_VERSION: u32 = 1;

// === FILE HELPERS ===

/// Replace `path` with `bytes` via a synced temporary file and a rename.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> HitGenResult<()> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .filter(|n| !n.is_empty())
        .ok_or_else(|| HitGenError::InvalidInput(format!("'{}' has no file name", path.display())))?;
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent)?;

    let suffix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_nanos())
        .unwrap_or_default();
    let temp_path = parent.join(format!(".{}.tmp-{}-{}", file_name, process::id(), suffix));

    let result = (|| -> std::io::Result<()> {
        let mut file = OpenOptions::new().create_new(true).write(true).open(&temp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        fs::rename(&temp_path, path)
    })();
    if let Err(err) = result {
        let _ = fs::remove_file(&temp_path);
        return Err(err.into());
    }
    Ok(())
}

pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> HitGenResult<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    write_atomic(path, &bytes)
}

/// Read JSON; a missing file is reported as [`HitGenError::MissingArtifact`].
pub fn read_json<T: DeserializeOwned>(path: &Path) -> HitGenResult<T> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Err(HitGenError::MissingArtifact(path.to_path_buf()))
        }
        Err(err) => return Err(err.into()),
    };
    Ok(serde_json::from_slice(&bytes)?)
}

// === CHECKPOINTS ===

/// Weights plus the hyperparameters that shaped them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub schema_version: u32,
    pub config: CvaeConfig,
    pub n_series: usize,
    pub n_features: usize,
    pub params: ParamStore,
}

/// Artifact paths for one `{dataset_name}_{dataset_group}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactStore {
    root: PathBuf,
    dataset_name: String,
    dataset_group: String,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>, dataset_name: impl Into<String>, dataset_group: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            dataset_name: dataset_name.into(),
            dataset_group: dataset_group.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn key(&self) -> String {
        format!("{}_{}", self.dataset_name, self.dataset_group)
    }

    pub fn weights_path(&self) -> PathBuf {
        self.root.join(format!("{}__vae.weights.json", self.key()))
    }

    pub fn history_path(&self) -> PathBuf {
        self.root.join(format!("{}_training_history.json", self.key()))
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.root.join(format!("{}_best_hyperparameters.jsonl", self.key()))
    }

    pub fn ledger_meta_path(&self) -> PathBuf {
        self.root.join(format!("{}_best_hyperparameters_opt.json", self.key()))
    }

    pub fn split_path(&self) -> PathBuf {
        self.root.join("data_split").join(format!("{}_data_split.json", self.key()))
    }

    pub fn save_checkpoint(&self, checkpoint: &Checkpoint) -> HitGenResult<()> {
        write_json_atomic(&self.weights_path(), checkpoint)
    }

    pub fn load_checkpoint(&self) -> HitGenResult<Checkpoint> {
        let path = self.weights_path();
        let checkpoint: Checkpoint = read_json(&path)?;
        if checkpoint.schema_version != CHECKPOINT_SCHEMA_VERSION {
            return Err(HitGenError::UnsupportedConfiguration(format!(
                "checkpoint {} has schema version {}, expected {}",
                path.display(),
                checkpoint.schema_version,
                CHECKPOINT_SCHEMA_VERSION
            )));
        }
        info!("Loaded checkpoint from {}", path.display());
        Ok(checkpoint)
    }

    pub fn save_history(&self, history: &TrainingHistory) -> HitGenResult<()> {
        write_json_atomic(&self.history_path(), history)
    }

    pub fn load_history(&self) -> HitGenResult<TrainingHistory> {
        read_json(&self.history_path())
    }

    pub fn ledger(&self, capacity: usize) -> BestScoresLedger {
        BestScoresLedger::new(self.ledger_path(), self.ledger_meta_path(), capacity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_paths_are_keyed_by_dataset() {
        let store = ArtifactStore::new("/tmp/weights", "tourism", "Monthly");
        assert_eq!(store.weights_path(), PathBuf::from("/tmp/weights/tourism_Monthly__vae.weights.json"));
        assert_eq!(
            store.history_path(),
            PathBuf::from("/tmp/weights/tourism_Monthly_training_history.json")
        );
        assert!(store.split_path().ends_with("data_split/tourism_Monthly_data_split.json"));
    }

    #[test]
    fn test_atomic_write_replaces_and_leaves_no_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("file.json");
        write_atomic(&path, b"first").unwrap();
        write_atomic(&path, b"second").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"second");
        let entries: Vec<_> = fs::read_dir(path.parent().unwrap()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn test_missing_file_is_missing_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path(), "d", "g");
        let err = store.load_checkpoint().unwrap_err();
        assert!(matches!(err, HitGenError::MissingArtifact(_)));
        assert!(err.is_recoverable());
        assert!(matches!(store.load_history(), Err(HitGenError::MissingArtifact(_))));
    }

    #[test]
    fn test_checkpoint_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path(), "d", "g");
        let mut params = ParamStore::new();
        params.register("w", array![[1.0, 2.0]]);
        let checkpoint = Checkpoint {
            schema_version: CHECKPOINT_SCHEMA_VERSION,
            config: CvaeConfig::default(),
            n_series: 2,
            n_features: 6,
            params,
        };
        store.save_checkpoint(&checkpoint).unwrap();
        assert_eq!(store.load_checkpoint().unwrap(), checkpoint);
    }
}
