//! `terms` (§6 CLI surface): suggests related terms for a piece of text,
//! either from raw co-occurrence counts (`scope`/`line`/`block`) or from
//! the trained dense vectors (`vector`, `combined`). Distinct from query
//! expansion in `query.rs`: this command surfaces neighbors directly as
//! its own result set rather than using them to gather candidate blocks.

use crate::ann::{AnnIndex, FlatAnnIndex, VECTOR_DIM};
use crate::config::Config;
use crate::error::{Result, XerpError};
use crate::store::Store;
use crate::tokenizer;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TermSource {
    /// Co-occurrence within the blocks the query's own tokens already hit.
    Scope,
    /// Nearest neighbors in the line co-occurrence vector space.
    Line,
    /// Nearest neighbors in the block co-occurrence vector space.
    Block,
    /// Nearest neighbors in the block centroid space.
    Vector,
    /// Line and block neighbor scores, summed.
    Combined,
}

impl TermSource {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "scope" => Some(TermSource::Scope),
            "line" => Some(TermSource::Line),
            "block" => Some(TermSource::Block),
            "vector" => Some(TermSource::Vector),
            "combined" => Some(TermSource::Combined),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TermHit {
    pub text: String,
    pub score: f64,
    pub df: u32,
}

/// Suggests related terms for `text` under the requested `source` model.
/// `max_df_percent` filters out terms so common they carry no discriminating
/// signal, same cutoff the query engine applies to expansion candidates.
pub fn run(store: &Store, config: &Config, text: &str, source: TermSource, top: usize, max_df_percent: f64) -> Result<Vec<TermHit>> {
    let lines = vec![text];
    let tokenized = tokenizer::tokenize(&lines, config.index.max_token_len);
    if tokenized.aggregated.is_empty() {
        return Ok(Vec::new());
    }

    let n_files = store.file_count()?;
    let mut query_token_ids = Vec::new();
    for (token_text, _) in &tokenized.aggregated {
        if let Some(token) = Store::get_token_by_text(store.conn(), token_text)? {
            query_token_ids.push(token.id);
        }
    }
    if query_token_ids.is_empty() {
        return Ok(Vec::new());
    }

    let mut ranked: HashMap<i64, f64> = HashMap::new();
    match source {
        TermSource::Scope => scope_neighbors(store, &query_token_ids, &mut ranked)?,
        TermSource::Line => merge_neighbors(store, config, "token.line", crate::vector::MODEL_LINE, &query_token_ids, &mut ranked)?,
        TermSource::Block => merge_neighbors(store, config, "token.block", crate::vector::MODEL_BLOCK, &query_token_ids, &mut ranked)?,
        TermSource::Vector => merge_neighbors(store, config, "centroid.block", crate::vector::MODEL_BLOCK, &query_token_ids, &mut ranked)?,
        TermSource::Combined => {
            merge_neighbors(store, config, "token.line", crate::vector::MODEL_LINE, &query_token_ids, &mut ranked)?;
            merge_neighbors(store, config, "token.block", crate::vector::MODEL_BLOCK, &query_token_ids, &mut ranked)?;
        }
    }

    let query_set: std::collections::HashSet<i64> = query_token_ids.iter().copied().collect();
    let mut hits = Vec::new();
    for (token_id, score) in ranked {
        if query_set.contains(&token_id) {
            continue;
        }
        let Some(token) = Store::get_token_by_id(store.conn(), token_id)? else { continue };
        let df_ratio = token.df as f64 / n_files.max(1) as f64;
        if df_ratio * 100.0 > max_df_percent {
            continue;
        }
        hits.push(TermHit { text: token.text, score, df: token.df });
    }

    hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal).then(a.text.cmp(&b.text)));
    hits.truncate(top);
    Ok(hits)
}

/// Scope-model neighbors: blocks the query's own tokens touch, ranked by
/// how often every other token in those same blocks co-occurs with them.
fn scope_neighbors(store: &Store, query_token_ids: &[i64], ranked: &mut HashMap<i64, f64>) -> Result<()> {
    let mut touched_blocks: std::collections::HashSet<i64> = std::collections::HashSet::new();
    for &token_id in query_token_ids {
        for posting in Store::postings_for_token(store.conn(), token_id)? {
            let line_map = Store::read_line_map(store.conn(), posting.file_id)?;
            for &line in &posting.lines {
                if let Some(&block_id) = line_map.get((line - 1) as usize) {
                    touched_blocks.insert(block_id);
                }
            }
        }
    }

    for block_id in touched_blocks {
        let Some(block) = Store::get_block(store.conn(), block_id)? else { continue };
        for posting in Store::postings_for_file(store.conn(), block.file_id)? {
            let tf_in_block = posting.lines.iter().filter(|&&l| block.contains_line(l)).count();
            if tf_in_block > 0 {
                *ranked.entry(posting.token_id).or_insert(0.0) += tf_in_block as f64;
            }
        }
    }
    Ok(())
}

/// Looks up each query token's trained vector in `model_id`, searches the
/// `index_name` ANN index for neighbors, and accumulates similarity into
/// `ranked`. A missing index (never trained) leaves `ranked` untouched
/// rather than failing the whole command.
fn merge_neighbors(
    store: &Store,
    config: &Config,
    index_name: &str,
    model_id: &str,
    query_token_ids: &[i64],
    ranked: &mut HashMap<i64, f64>,
) -> Result<()> {
    let Ok(index) = FlatAnnIndex::load(&config.ann_path(index_name)) else {
        tracing::warn!(model = index_name, "ann index unavailable, skipping this term source");
        return Ok(());
    };
    for &token_id in query_token_ids {
        let Some(vector) = Store::read_token_vector(store.conn(), model_id, token_id)? else { continue };
        let mut fixed = [0f32; VECTOR_DIM];
        let n = vector.len().min(VECTOR_DIM);
        fixed[..n].copy_from_slice(&vector[..n]);
        for (neighbor_id, similarity) in index.search(&fixed, config.query.expansion_top_k + 1) {
            if neighbor_id == token_id || (similarity as f64) < config.query.min_similarity {
                continue;
            }
            let entry = ranked.entry(neighbor_id).or_insert(0.0);
            *entry += similarity as f64;
        }
    }
    Ok(())
}

pub fn parse_source_or_err(s: &str) -> Result<TermSource> {
    TermSource::parse(s).ok_or_else(|| XerpError::Input(format!("unknown term source '{s}', expected scope|line|block|vector|combined")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::indexer::{run_index, DiscoveredFile};
    use std::sync::atomic::AtomicBool;
    use tempfile::tempdir;

    fn discover(dir: &std::path::Path, rel: &str) -> DiscoveredFile {
        let abs = dir.join(rel);
        let mtime = std::fs::metadata(&abs).unwrap().modified().unwrap();
        let mtime = mtime.duration_since(std::time::UNIX_EPOCH).unwrap().as_secs() as i64;
        DiscoveredFile { rel_path: rel.to_string(), abs_path: abs, mtime }
    }

    #[test]
    fn scope_source_finds_cooccurring_tokens() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("a.rs"), "fn retry(attempts) {\n  let backoff = calculate(attempts);\n}\n").unwrap();
        let mut store = Store::open_in_memory().unwrap();
        let config = Config::load(dir.path()).unwrap();
        let cancel = AtomicBool::new(false);
        let files = vec![discover(dir.path(), "a.rs")];
        run_index(&mut store, &config, &files, &cancel).unwrap();

        let hits = run(&store, &config, "retry", TermSource::Scope, 10, 100.0).unwrap();
        assert!(hits.iter().any(|h| h.text == "backoff" || h.text == "calculate" || h.text == "attempts"));
    }

    #[test]
    fn unknown_term_source_is_input_error() {
        assert!(parse_source_or_err("bogus").is_err());
        assert!(parse_source_or_err("scope").is_ok());
    }

    #[test]
    fn empty_text_returns_no_hits() {
        let dir = tempdir().unwrap();
        let store = Store::open_in_memory().unwrap();
        let config = Config::load(dir.path()).unwrap();
        let hits = run(&store, &config, "   ", TermSource::Scope, 10, 100.0).unwrap();
        assert!(hits.is_empty());
    }
}
