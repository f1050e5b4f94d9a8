//! Token/block neighbor index (§4.5, §9): an `AnnIndex` capability
//! (`create`, `add`, `search`, `save`, `load`, `view`) over 256-dim cosine
//! vectors, persisted as an opaque bincode blob.
//!
//! The reference system treats ANN as an accelerant for token-neighbor
//! lookups at training time, never as a primary retrieval path (spec.md
//! §1 Non-goals). A brute-force cosine scan over a few hundred thousand
//! 256-dim vectors is well within budget for that role, so this is a flat
//! index rather than a graph/tree structure — the `AnnIndex` trait is the
//! real contract; swapping in an HNSW-style backend later doesn't change
//! any caller.

use crate::error::{Result, XerpError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

pub const VECTOR_DIM: usize = 256;

pub trait AnnIndex {
    fn add(&mut self, key: i64, vector: [f32; VECTOR_DIM]);
    fn search(&self, query: &[f32; VECTOR_DIM], k: usize) -> Vec<(i64, f32)>;
    fn save(&self, path: &Path) -> Result<()>;
    fn load(path: &Path) -> Result<Self>
    where
        Self: Sized;
    fn view(&self) -> &[(i64, Vec<f32>)];
}

// Stored as `Vec<f32>` rather than `[f32; VECTOR_DIM]`: stock serde only
// implements Serialize/Deserialize for arrays up to length 32, and bincode
// inherits that bound. Every entry is still exactly VECTOR_DIM long by
// construction (`add`) and is length-checked on `load`.
#[derive(Serialize, Deserialize, Default)]
pub struct FlatAnnIndex {
    entries: Vec<(i64, Vec<f32>)>,
}

impl FlatAnnIndex {
    pub fn create() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl AnnIndex for FlatAnnIndex {
    fn add(&mut self, key: i64, vector: [f32; VECTOR_DIM]) {
        self.entries.push((key, vector.to_vec()));
    }

    fn search(&self, query: &[f32; VECTOR_DIM], k: usize) -> Vec<(i64, f32)> {
        use rayon::prelude::*;
        let mut scored: Vec<(i64, f32)> =
            self.entries.par_iter().map(|(key, vector)| (*key, cosine(query, vector))).collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal).then(a.0.cmp(&b.0)));
        scored.truncate(k);
        scored
    }

    fn save(&self, path: &Path) -> Result<()> {
        let bytes = bincode::serialize(&self.entries)
            .map_err(|e| XerpError::Vector(format!("serializing ann index: {e}")))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| XerpError::Vector(e.to_string()))?;
        }
        std::fs::write(path, bytes).map_err(|e| XerpError::Vector(format!("writing {}: {e}", path.display())))
    }

    fn load(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path).map_err(|e| XerpError::Vector(format!("reading {}: {e}", path.display())))?;
        let entries: Vec<(i64, Vec<f32>)> =
            bincode::deserialize(&bytes).map_err(|e| XerpError::Vector(format!("corrupt ann blob: {e}")))?;
        if let Some((key, vector)) = entries.iter().find(|(_, v)| v.len() != VECTOR_DIM) {
            return Err(XerpError::Vector(format!(
                "corrupt ann blob {}: entry {key} has dimension {}, expected {VECTOR_DIM}",
                path.display(),
                vector.len()
            )));
        }
        Ok(Self { entries })
    }

    fn view(&self) -> &[(i64, Vec<f32>)] {
        &self.entries
    }
}

fn cosine(a: &[f32; VECTOR_DIM], b: &[f32]) -> f32 {
    let mut dot = 0f32;
    let mut norm_a = 0f32;
    let mut norm_b = 0f32;
    for i in 0..VECTOR_DIM {
        dot += a[i] * b[i];
        norm_a += a[i] * a[i];
        norm_b += b[i] * b[i];
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// Builds a [`FlatAnnIndex`] from `(key, Vec<f32>)` pairs, padding/truncating
/// vectors of the wrong length rather than panicking on a dimension
/// mismatch — callers treat that as a degrade-to-exact-only signal upstream.
pub fn build_index(vectors: impl IntoIterator<Item = (i64, Vec<f32>)>) -> FlatAnnIndex {
    let mut index = FlatAnnIndex::create();
    for (key, vector) in vectors {
        let mut fixed = [0f32; VECTOR_DIM];
        let n = vector.len().min(VECTOR_DIM);
        fixed[..n].copy_from_slice(&vector[..n]);
        index.add(key, fixed);
    }
    index
}

/// A tiny read-through cache so query-time neighbor lookups don't rebuild
/// the index from the store on every call.
pub struct AnnCache {
    indexes: HashMap<String, FlatAnnIndex>,
}

impl AnnCache {
    pub fn new() -> Self {
        Self { indexes: HashMap::new() }
    }

    pub fn get_or_load(&mut self, name: &str, path: &Path) -> Option<&FlatAnnIndex> {
        if !self.indexes.contains_key(name) {
            match FlatAnnIndex::load(path) {
                Ok(index) => {
                    self.indexes.insert(name.to_string(), index);
                }
                Err(e) => {
                    tracing::warn!(name, error = %e, "ann index unavailable, degrading to exact-only");
                    return None;
                }
            }
        }
        self.indexes.get(name)
    }
}

impl Default for AnnCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn search_ranks_identical_vector_first() {
        let mut index = FlatAnnIndex::create();
        let mut a = [0f32; VECTOR_DIM];
        a[0] = 1.0;
        let mut b = [0f32; VECTOR_DIM];
        b[1] = 1.0;
        index.add(1, a);
        index.add(2, b);
        let results = index.search(&a, 2);
        assert_eq!(results[0].0, 1);
        assert!((results[0].1 - 1.0).abs() < 1e-6);
    }

    #[test]
    fn save_and_load_roundtrip() {
        let dir = tempdir().unwrap();
        let mut index = FlatAnnIndex::create();
        index.add(7, [0.5f32; VECTOR_DIM]);
        let path = dir.path().join("test.ann");
        index.save(&path).unwrap();
        let loaded = FlatAnnIndex::load(&path).unwrap();
        assert_eq!(loaded.len(), 1);
    }

    #[test]
    fn missing_file_is_a_vector_error() {
        let dir = tempdir().unwrap();
        let err = FlatAnnIndex::load(&dir.path().join("missing.ann")).unwrap_err();
        assert!(matches!(err, XerpError::Vector(_)));
    }
}
