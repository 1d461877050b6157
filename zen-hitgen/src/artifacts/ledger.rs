//! Bounded top-K record of the best hyperparameter trials
//!
//! Stored as one JSON object per line, sorted ascending by score (lower is
//! better), plus a small JSON file with the latest trial number and the best
//! score so a resumed search knows where it stopped.

use std::fs;
use std::path::PathBuf;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use super::{read_json, write_atomic, write_json_atomic};
use crate::config::CvaeConfig;
use crate::errors::{HitGenError, HitGenResult};

pub const DEFAULT_LEDGER_CAPACITY: usize = 20;

/// One completed trial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreEntry {
    pub trial: usize,
    pub score: f64,
    /// Best epoch loss reached while training.
    pub loss: f64,
    #[serde(flatten)]
    pub config: CvaeConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerMeta {
    pub current_trial: usize,
    pub best_score: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct BestScoresLedger {
    path: PathBuf,
    meta_path: PathBuf,
    capacity: usize,
    entries: Vec<ScoreEntry>,
}

impl BestScoresLedger {
    pub fn new(path: PathBuf, meta_path: PathBuf, capacity: usize) -> Self {
        Self { path, meta_path, capacity: capacity.max(1), entries: Vec::new() }
    }

    /// Ledger with entries read from disk (empty when the file does not exist yet).
    pub fn open(path: PathBuf, meta_path: PathBuf, capacity: usize) -> HitGenResult<Self> {
        let mut ledger = Self::new(path, meta_path, capacity);
        ledger.reload()?;
        Ok(ledger)
    }

    pub fn reload(&mut self) -> HitGenResult<()> {
        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                self.entries.clear();
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };
        let mut entries = text
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(serde_json::from_str)
            .collect::<Result<Vec<ScoreEntry>, _>>()?;
        entries.sort_by(|a, b| a.score.total_cmp(&b.score));
        entries.truncate(self.capacity);
        debug!("Loaded {} ledger entries from {}", entries.len(), self.path.display());
        self.entries = entries;
        Ok(())
    }

    pub fn entries(&self) -> &[ScoreEntry] {
        &self.entries
    }

    pub fn best(&self) -> Option<&ScoreEntry> {
        self.entries.first()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Whether a trial scoring `score` would enter the ledger.
    pub fn admits(&self, score: f64) -> bool {
        if !score.is_finite() {
            return false;
        }
        self.entries.len() < self.capacity || self.entries.last().map_or(true, |worst| score < worst.score)
    }

    /// Insert `entry` if it qualifies and persist; returns whether it was kept.
    pub fn record(&mut self, entry: ScoreEntry) -> HitGenResult<bool> {
        let trial = entry.trial;
        let admitted = self.admits(entry.score);
        if admitted {
            let pos = self.entries.partition_point(|e| e.score <= entry.score);
            info!("Trial {} enters the ledger at rank {} with score {:.6}", trial, pos + 1, entry.score);
            self.entries.insert(pos, entry);
            self.entries.truncate(self.capacity);
            self.persist()?;
        } else if !entry.score.is_finite() {
            warn!("Trial {} produced a non-finite score and was not recorded", trial);
        }
        self.write_meta(trial)?;
        Ok(admitted)
    }

    fn persist(&self) -> HitGenResult<()> {
        let mut buffer = Vec::new();
        for entry in &self.entries {
            serde_json::to_writer(&mut buffer, entry)?;
            buffer.push(b'\n');
        }
        write_atomic(&self.path, &buffer)
    }

    fn write_meta(&self, current_trial: usize) -> HitGenResult<()> {
        let meta = LedgerMeta { current_trial, best_score: self.best().map(|e| e.score) };
        write_json_atomic(&self.meta_path, &meta)
    }

    pub fn read_meta(&self) -> HitGenResult<LedgerMeta> {
        read_json(&self.meta_path)
    }

    /// Trial to resume from: one past the last recorded trial, or 0.
    pub fn next_trial(&self) -> HitGenResult<usize> {
        match self.read_meta() {
            Ok(meta) => Ok(meta.current_trial + 1),
            Err(HitGenError::MissingArtifact(_)) => Ok(0),
            Err(err) => Err(err),
        }
    }
}
