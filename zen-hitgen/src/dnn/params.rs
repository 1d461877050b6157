//! Named parameter tensors
//!
//! Layers own `ParamId` handles; the tensors themselves live in one
//! `ParamStore` so the optimizer, checkpointing and best-weight restoration
//! all work on a single flat list.

use serde::{Deserialize, Serialize};

use super::Matrix;
use crate::errors::{HitGenError, HitGenResult};

/// Index of a tensor inside a [`ParamStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ParamId(usize);

impl ParamId {
    pub fn index(self) -> usize {
        self.0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct ParamEntry {
    name: String,
    value: Matrix,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParamStore {
    entries: Vec<ParamEntry>,
}

impl ParamStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, value: Matrix) -> ParamId {
        self.entries.push(ParamEntry { name: name.into(), value });
        ParamId(self.entries.len() - 1)
    }

    pub fn value(&self, id: ParamId) -> &Matrix {
        &self.entries[id.0].value
    }

    pub fn value_mut(&mut self, id: ParamId) -> &mut Matrix {
        &mut self.entries[id.0].value
    }

    pub fn name(&self, id: ParamId) -> &str {
        &self.entries[id.0].name
    }

    pub fn ids(&self) -> impl Iterator<Item = ParamId> {
        (0..self.entries.len()).map(ParamId)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total number of scalar weights.
    pub fn parameter_count(&self) -> usize {
        self.entries.iter().map(|e| e.value.len()).sum()
    }

    pub fn values(&self) -> impl Iterator<Item = &Matrix> {
        self.entries.iter().map(|e| &e.value)
    }

    pub fn values_mut(&mut self) -> impl Iterator<Item = &mut Matrix> {
        self.entries.iter_mut().map(|e| &mut e.value)
    }

    pub fn all_finite(&self) -> bool {
        self.values().all(|v| v.iter().all(|x| x.is_finite()))
    }

    /// Overwrite every tensor with the matching one from `other`.
    ///
    /// Both stores must describe the same architecture: same names in the same
    /// order with the same shapes.
    pub fn copy_from(&mut self, other: &ParamStore) -> HitGenResult<()> {
        if self.entries.len() != other.entries.len() {
            return Err(HitGenError::shape(format!(
                "parameter count differs: model has {}, source has {}",
                self.entries.len(),
                other.entries.len()
            )));
        }
        for (mine, theirs) in self.entries.iter().zip(&other.entries) {
            if mine.name != theirs.name || mine.value.dim() != theirs.value.dim() {
                return Err(HitGenError::shape(format!(
                    "parameter '{}' {:?} cannot take '{}' {:?}",
                    mine.name,
                    mine.value.dim(),
                    theirs.name,
                    theirs.value.dim()
                )));
            }
        }
        for (mine, theirs) in self.entries.iter_mut().zip(&other.entries) {
            mine.value.assign(&theirs.value);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_register_and_count() {
        let mut store = ParamStore::new();
        let w = store.register("dense/w", Matrix::zeros((3, 2)));
        let b = store.register("dense/b", Matrix::zeros((1, 2)));
        assert_eq!(store.len(), 2);
        assert_eq!(store.parameter_count(), 8);
        assert_eq!(store.name(w), "dense/w");
        assert_eq!(store.ids().collect::<Vec<_>>(), vec![w, b]);
    }

    #[test]
    fn test_copy_from_checks_architecture() {
        let mut a = ParamStore::new();
        a.register("w", array![[1.0, 2.0]]);
        let mut b = ParamStore::new();
        let id = b.register("w", array![[3.0, 4.0]]);
        a.copy_from(&b).unwrap();
        assert_eq!(a.value(id), &array![[3.0, 4.0]]);

        let mut c = ParamStore::new();
        c.register("w", array![[1.0], [2.0]]);
        assert!(matches!(a.copy_from(&c), Err(HitGenError::ShapeMismatch(_))));
    }

    #[test]
    fn test_store_serializes() {
        let mut store = ParamStore::new();
        store.register("w", array![[0.5, -1.5]]);
        let json = serde_json::to_string(&store).unwrap();
        let back: ParamStore = serde_json::from_str(&json).unwrap();
        assert_eq!(store, back);
    }
}
