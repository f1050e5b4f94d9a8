//! Vector trainer (C7, §4.5): co-occurrence under two context models, dense
//! feature-hashed projection, block centroids, and the token-neighbor ANN
//! indexes.
//!
//! Co-occurrence needs the ordered token stream within a window, which the
//! persisted postings (per-file aggregated line sets, no intra-line order)
//! can't reconstruct exactly — so the trainer re-reads each indexed file's
//! source text and re-tokenizes it, the same pure/cheap operation the
//! indexer already performs. This keeps the persisted schema exactly the
//! one in spec.md §3 (no extra "token stream" table) while giving the line
//! model real token-position windows. Documented as an open-question
//! resolution in DESIGN.md.

use crate::ann::{self, AnnIndex, VECTOR_DIM};
use crate::config::Config;
use crate::error::Result;
use crate::store::Store;
use crate::tokenizer;
use rayon::prelude::*;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

pub const MODEL_LINE: &str = "line";
pub const MODEL_BLOCK: &str = "block";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelSelector {
    Line,
    Block,
    All,
}

impl ModelSelector {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "line" => Some(Self::Line),
            "block" => Some(Self::Block),
            "all" => Some(Self::All),
            _ => None,
        }
    }

    fn includes_line(&self) -> bool {
        matches!(self, Self::Line | Self::All)
    }

    fn includes_block(&self) -> bool {
        matches!(self, Self::Block | Self::All)
    }
}

#[derive(Debug, Default)]
pub struct TrainReport {
    pub tokens_vectorized: usize,
    pub blocks_centroided: usize,
    pub pairs_line: usize,
    pub pairs_block: usize,
}

type SparseVec = HashMap<i64, u32>;

/// Full retrain of the selected models (§3 lifecycle: vectors/centroids are
/// always fully regenerated, never incrementally updated).
pub fn train(
    store: &mut Store,
    config: &Config,
    root: &Path,
    selector: ModelSelector,
    window: usize,
    min_count: u32,
    cancel: &AtomicBool,
) -> Result<TrainReport> {
    let mut report = TrainReport::default();
    let files = store.list_all_rel_paths()?;

    if selector.includes_line() {
        let sparse = accumulate_line_model(store, root, &files, window, cancel)?;
        report.pairs_line = persist_model(store, MODEL_LINE, &sparse, min_count)?;
        let vectorized = project_and_store(store, MODEL_LINE, &sparse)?;
        report.tokens_vectorized += vectorized;
        build_and_save_ann(store, config, MODEL_LINE)?;
    }

    if selector.includes_block() {
        let sparse = accumulate_block_model(store, root, &files, cancel)?;
        report.pairs_block = persist_model(store, MODEL_BLOCK, &sparse, min_count)?;
        project_and_store(store, MODEL_BLOCK, &sparse)?;
        build_and_save_ann(store, config, MODEL_BLOCK)?;

        report.blocks_centroided = build_centroids(store, config, &sparse)?;
    }

    store.set_meta("last_trained_at", &chrono::Utc::now().to_rfc3339())?;
    Ok(report)
}

/// Line model (§4.5): sweep the whole file's token stream; for each token
/// position, the context is the `±window` neighbors excluding itself.
fn accumulate_line_model(
    store: &Store,
    root: &Path,
    files: &[(i64, String)],
    window: usize,
    cancel: &AtomicBool,
) -> Result<HashMap<i64, SparseVec>> {
    let mut sparse: HashMap<i64, SparseVec> = HashMap::new();
    for (_, rel_path) in files {
        if cancel.load(Ordering::Relaxed) {
            break;
        }
        let Ok(content) = std::fs::read_to_string(root.join(rel_path)) else { continue };
        let lines: Vec<&str> = content.lines().collect();
        let tokenized = tokenizer::tokenize(&lines, 128);
        let mut stream: Vec<i64> = Vec::with_capacity(tokenized.occurrences.len());
        for occ in &tokenized.occurrences {
            if !occ.kind.eligible() {
                continue;
            }
            let token_id = Store::upsert_token(store.conn(), &occ.text, occ.kind)?;
            stream.push(token_id);
        }
        for (i, &token) in stream.iter().enumerate() {
            let lo = i.saturating_sub(window);
            let hi = (i + window + 1).min(stream.len());
            for &other in &stream[lo..hi] {
                if other == token {
                    continue;
                }
                *sparse.entry(token).or_default().entry(other).or_default() += 1;
            }
        }
    }
    Ok(sparse)
}

/// Block (scope) model (§4.5): leaf blocks sweep all their tokens together;
/// non-leaf blocks sweep only each child's header-line tokens.
fn accumulate_block_model(
    store: &Store,
    root: &Path,
    files: &[(i64, String)],
    cancel: &AtomicBool,
) -> Result<HashMap<i64, SparseVec>> {
    let mut sparse: HashMap<i64, SparseVec> = HashMap::new();
    for (file_id, rel_path) in files {
        if cancel.load(Ordering::Relaxed) {
            break;
        }
        let Ok(content) = std::fs::read_to_string(root.join(rel_path)) else { continue };
        let lines: Vec<&str> = content.lines().collect();
        let tokenized = tokenizer::tokenize(&lines, 128);

        // tokens by line, ids resolved once up front.
        let mut tokens_by_line: HashMap<u32, Vec<i64>> = HashMap::new();
        for occ in &tokenized.occurrences {
            if !occ.kind.eligible() {
                continue;
            }
            let token_id = Store::upsert_token(store.conn(), &occ.text, occ.kind)?;
            tokens_by_line.entry(occ.line).or_default().push(token_id);
        }

        let blocks = Store::blocks_for_file(store.conn(), *file_id)?;
        let children_of: HashMap<i64, Vec<i64>> = {
            let mut map: HashMap<i64, Vec<i64>> = HashMap::new();
            for b in &blocks {
                if let Some(p) = b.parent_block_id {
                    map.entry(p).or_default().push(b.id);
                }
            }
            map
        };

        for block in &blocks {
            let is_leaf = !children_of.contains_key(&block.id);
            let tokens: Vec<i64> = if is_leaf {
                (block.line_start..=block.line_end)
                    .flat_map(|l| tokens_by_line.get(&l).cloned().unwrap_or_default())
                    .collect()
            } else {
                children_of[&block.id]
                    .iter()
                    .filter_map(|child_id| blocks.iter().find(|b| b.id == *child_id))
                    .flat_map(|child| tokens_by_line.get(&child.line_start).cloned().unwrap_or_default())
                    .collect()
            };
            sweep_all_pairs(&tokens, &mut sparse);
        }
    }
    Ok(sparse)
}

fn sweep_all_pairs(tokens: &[i64], sparse: &mut HashMap<i64, SparseVec>) {
    for (i, &a) in tokens.iter().enumerate() {
        for &b in &tokens[i + 1..] {
            if a == b {
                continue;
            }
            *sparse.entry(a).or_default().entry(b).or_default() += 1;
            *sparse.entry(b).or_default().entry(a).or_default() += 1;
        }
    }
}

fn persist_model(store: &Store, model_id: &str, sparse: &HashMap<i64, SparseVec>, min_count: u32) -> Result<usize> {
    Store::clear_model(store.conn(), model_id)?;
    let mut pairs = 0usize;
    for (&token_a, contexts) in sparse {
        for (&token_b, &count) in contexts {
            if count < min_count || token_a >= token_b {
                continue;
            }
            Store::upsert_cooccurrence(store.conn(), model_id, token_a, token_b, count)?;
            pairs += 1;
        }
    }
    Ok(pairs)
}

/// Feature-hash a sparse `{context_id -> count}` vector into a dense
/// 256-dim vector: `bin = h1(context) % 256`, `sign = h2(context) ? +1 : -1`,
/// `dense[bin] += sign * count`, then L2-normalize.
pub fn dense_project(sparse: &SparseVec) -> (Vec<f32>, f64) {
    let mut dense = vec![0f32; VECTOR_DIM];
    for (&context_id, &count) in sparse {
        let (bin, sign) = feature_hash(context_id);
        dense[bin] += if sign { count as f32 } else { -(count as f32) };
    }
    let norm = (dense.iter().map(|v| (*v as f64) * (*v as f64)).sum::<f64>()).sqrt();
    if norm > 0.0 {
        for v in &mut dense {
            *v = (*v as f64 / norm) as f32;
        }
    }
    (dense, norm)
}

fn feature_hash(id: i64) -> (usize, bool) {
    let h1 = fnv1a(id.to_le_bytes().as_slice(), 0x811c9dc5);
    let h2 = fnv1a(id.to_le_bytes().as_slice(), 0x9e3779b9);
    ((h1 % VECTOR_DIM as u64) as usize, h2 % 2 == 0)
}

fn fnv1a(bytes: &[u8], seed: u64) -> u64 {
    let mut hash = seed;
    for &b in bytes {
        hash ^= b as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

fn project_and_store(store: &Store, model_id: &str, sparse: &HashMap<i64, SparseVec>) -> Result<usize> {
    let projected: Vec<(i64, Vec<f32>, f64)> = sparse
        .par_iter()
        .map(|(&token_id, vec)| {
            let (dense, norm) = dense_project(vec);
            (token_id, dense, norm)
        })
        .collect();
    for (token_id, dense, norm) in &projected {
        Store::write_token_vector(store.conn(), model_id, *token_id, dense, *norm)?;
    }
    Ok(projected.len())
}

fn build_and_save_ann(store: &Store, config: &Config, model_id: &str) -> Result<()> {
    let vectors = Store::all_token_vectors(store.conn(), model_id)?;
    let index = ann::build_index(vectors);
    index.save(&config.ann_path(&format!("token.{model_id}")))
}

/// Builds per-block centroids (scope model only, §4.5): leaves average the
/// top-IDF-weighted share of their eligible tokens' sparse vectors before
/// dense-projecting; parents are the renormalized mean of their children's
/// dense centroids, computed bottom-up.
fn build_centroids(store: &Store, config: &Config, block_sparse_ctx: &HashMap<i64, SparseVec>) -> Result<usize> {
    Store::clear_centroids(store.conn())?;
    let files = store.list_all_rel_paths()?;
    let mut count = 0usize;
    let n_files = store.file_count()? as f64;

    for (file_id, _) in &files {
        let blocks = Store::blocks_for_file(store.conn(), *file_id)?;
        let mut children_of: HashMap<i64, Vec<i64>> = HashMap::new();
        for b in &blocks {
            if let Some(p) = b.parent_block_id {
                children_of.entry(p).or_default().push(b.id);
            }
        }
        // Process deepest-first so parents can read children's centroids.
        let mut order: Vec<&crate::model::Block> = blocks.iter().collect();
        order.sort_by(|a, b| b.level.cmp(&a.level));

        let mut centroid_of: HashMap<i64, Vec<f32>> = HashMap::new();
        for block in order {
            let is_leaf = !children_of.contains_key(&block.id);
            let centroid = if is_leaf {
                leaf_centroid(store, block, block_sparse_ctx, config, n_files)?
            } else {
                let child_ids = &children_of[&block.id];
                let mut mean = vec![0f32; VECTOR_DIM];
                let mut n = 0usize;
                for child_id in child_ids {
                    if let Some(c) = centroid_of.get(child_id) {
                        for (m, v) in mean.iter_mut().zip(c.iter()) {
                            *m += v;
                        }
                        n += 1;
                    }
                }
                if n > 0 {
                    for m in &mut mean {
                        *m /= n as f32;
                    }
                    renormalize(&mut mean);
                }
                mean
            };
            Store::write_centroid(store.conn(), block.id, &centroid)?;
            centroid_of.insert(block.id, centroid);
            count += 1;
        }
    }
    Ok(count)
}

fn leaf_centroid(
    store: &Store,
    block: &crate::model::Block,
    sparse_ctx: &HashMap<i64, SparseVec>,
    config: &Config,
    n_files: f64,
) -> Result<Vec<f32>> {
    // Recover the block's eligible token ids from postings whose lines fall
    // in this block's range (mirrors the token_count formula in indexer.rs).
    let mut candidates: Vec<(i64, f64)> = Vec::new();
    let postings = Store::postings_for_file(store.conn(), block.file_id)?;
    for posting in &postings {
        if posting.lines.iter().any(|&l| block.contains_line(l)) {
            if let Some(token) = Store::get_token_by_id(store.conn(), posting.token_id)? {
                if token.kind.eligible() {
                    let idf = ((n_files + 1.0) / (token.df as f64 + 1.0)).ln() + 1.0;
                    candidates.push((token.id, idf));
                }
            }
        }
    }

    if candidates.is_empty() {
        return Ok(vec![0f32; VECTOR_DIM]);
    }

    candidates.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    let top_n = ((candidates.len() as f64) * config.train.salience_percent).round() as usize;
    let top_n = top_n.clamp(config.train.salience_min, config.train.salience_max).min(candidates.len());
    let selected = &candidates[..top_n];

    let mut weighted: SparseVec = HashMap::new();
    for &(token_id, idf) in selected {
        if let Some(contexts) = sparse_ctx.get(&token_id) {
            for (&ctx, &count) in contexts {
                *weighted.entry(ctx).or_insert(0) += (count as f64 * idf).round() as u32;
            }
        }
    }
    let (dense, _) = dense_project(&weighted);
    let mut dense = dense;
    renormalize(&mut dense);
    Ok(dense)
}

fn renormalize(v: &mut [f32]) {
    let norm = (v.iter().map(|x| (*x as f64) * (*x as f64)).sum::<f64>()).sqrt();
    if norm > 0.0 {
        for x in v.iter_mut() {
            *x = (*x as f64 / norm) as f32;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dense_projection_is_unit_norm_or_zero() {
        let mut sparse = HashMap::new();
        sparse.insert(1, 5);
        sparse.insert(2, 3);
        let (dense, _) = dense_project(&sparse);
        let norm: f64 = dense.iter().map(|v| (*v as f64).powi(2)).sum::<f64>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4);
    }

    #[test]
    fn empty_sparse_vector_projects_to_zero() {
        let sparse = HashMap::new();
        let (dense, _) = dense_project(&sparse);
        assert!(dense.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn feature_hash_is_deterministic() {
        assert_eq!(feature_hash(42), feature_hash(42));
    }
}
