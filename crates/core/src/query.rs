//! Query engine (C8, §4.6): tokenize -> expand -> gather candidates ->
//! score -> rank -> assemble. The only path that can return a result
//! without a lexical match is the semantic-only mode of §4.6.3.
//!
//! Expansion policy resolves spec.md §9 Open Question 1: an expanded token
//! only *admits new candidate blocks* when its source token has zero
//! postings, or in semantic-only mode; otherwise expansion is re-rank-only,
//! contributing its similarity-weighted score to blocks already reached by
//! some other matched term.

use crate::ann::{AnnCache, AnnIndex, VECTOR_DIM};
use crate::config::{ClusterMode, Config};
use crate::feedback;
use crate::model::{Block, FileType, TokenKind};
use crate::scorer;
use crate::store::Store;
use crate::tokenizer;
use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Instant;

#[derive(Debug, Clone)]
pub struct ExpandedToken {
    pub from: String,
    pub to: String,
    pub similarity: f64,
}

#[derive(Debug, Clone)]
pub struct ExplainTerm {
    pub token: String,
    pub from_query: Option<String>,
    pub similarity: f64,
    pub lines: Vec<u32>,
}

#[derive(Debug, Clone)]
pub struct SnippetLine {
    pub line: u32,
    pub text: String,
    pub is_hit: bool,
}

#[derive(Debug, Clone)]
pub struct QueryResult {
    pub result_id: String,
    pub file_path: String,
    pub file_type: String,
    pub line_start: u32,
    pub line_end: u32,
    pub ancestors: Vec<String>,
    pub snippet: Vec<SnippetLine>,
    pub score: f64,
    pub salience: f64,
    pub cluster: f64,
    pub hits: u32,
    pub explain: Option<Vec<ExplainTerm>>,
}

#[derive(Debug, Default)]
pub struct QueryResponse {
    pub query: String,
    pub top: usize,
    pub timing_ms: u64,
    pub expanded_tokens: Vec<ExpandedToken>,
    pub results: Vec<QueryResult>,
}

#[derive(Debug, Clone)]
pub struct QueryOptions {
    pub top_k: usize,
    pub file_filter: Option<Regex>,
    pub type_filter: Option<FileType>,
    pub max_block_lines: usize,
    pub explain: bool,
    pub ancestry: bool,
    pub augment: bool,
    pub no_salience: bool,
}

impl QueryOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            top_k: config.query.top_k,
            file_filter: None,
            type_filter: None,
            max_block_lines: config.index.max_block_lines.max(1),
            explain: false,
            ancestry: true,
            augment: false,
            no_salience: false,
        }
    }
}

struct Term {
    token_id: i64,
    text: String,
    kind: TokenKind,
    sim: f64,
    source: Option<String>,
    candidate_generating: bool,
    idf: f64,
}

pub fn run(store: &Store, config: &Config, root: &Path, query_text: &str, options: &QueryOptions) -> crate::error::Result<QueryResponse> {
    let started = Instant::now();
    let mut response = QueryResponse { query: query_text.to_string(), top: options.top_k, ..Default::default() };

    let query_lines = vec![query_text];
    let tokenized = tokenizer::tokenize(&query_lines, config.index.max_token_len);
    if tokenized.aggregated.is_empty() {
        response.timing_ms = started.elapsed().as_millis() as u64;
        return Ok(response);
    }

    let n_files = store.file_count()?;
    let mut terms: Vec<Term> = Vec::new();
    let mut ann_cache = AnnCache::new();

    for (text, (kind, _)) in &tokenized.aggregated {
        let existing = Store::get_token_by_text(store.conn(), text)?;
        let has_hits = existing.as_ref().map(|t| t.df > 0).unwrap_or(false);
        if let Some(token) = &existing {
            terms.push(Term {
                token_id: token.id,
                text: text.clone(),
                kind: *kind,
                sim: 1.0,
                source: None,
                candidate_generating: true,
                idf: scorer::idf(n_files, token.df),
            });
        }

        if options.augment {
            let expansions = expand_token(store, config, &mut ann_cache, text, *kind, n_files)?;
            for (neighbor_id, neighbor_text, neighbor_kind, neighbor_df, similarity) in expansions {
                response.expanded_tokens.push(ExpandedToken { from: text.clone(), to: neighbor_text.clone(), similarity });
                terms.push(Term {
                    token_id: neighbor_id,
                    text: neighbor_text,
                    kind: neighbor_kind,
                    sim: similarity,
                    source: Some(text.clone()),
                    candidate_generating: !has_hits,
                    idf: scorer::idf(n_files, neighbor_df),
                });
            }
        }
    }

    if terms.is_empty() {
        response.timing_ms = started.elapsed().as_millis() as u64;
        return Ok(response);
    }

    // Apply feedback boosts (§4.6.2) to effective similarity before scoring.
    for term in &mut terms {
        let (useful, not_useful) = feedback::token_boost(store, term.token_id)?;
        term.sim = scorer::feedback_adjusted_sim(term.sim, useful, not_useful, config.query.w_feedback, config.query.w_feedback);
    }

    let semantic_only = options.augment && options.no_salience;
    let candidate_ids: Vec<i64> = if semantic_only {
        gather_semantic_candidates(store, config, &mut ann_cache, &terms, options.top_k.max(config.query.max_candidates.min(200)))?
    } else {
        gather_lexical_candidates(store, &terms, config.query.max_candidates)?
    };

    let mut scored = Vec::new();
    for block_id in &candidate_ids {
        let Some(block) = Store::get_block(store.conn(), *block_id)? else { continue };
        let Some(file) = file_for_block(store, &block)? else { continue };
        if let Some(re) = &options.file_filter {
            if !re.is_match(&file.rel_path) {
                continue;
            }
        }
        if let Some(ft) = options.type_filter {
            if file.file_type != ft {
                continue;
            }
        }

        if semantic_only {
            let Some(sim) = semantic_similarity(store, &terms, block.id)? else { continue };
            scored.push(ScoredBlock {
                block,
                file_path: file.rel_path,
                file_type: file.file_type,
                score: sim,
                salience: 0.0,
                cluster: sim,
                hits: 0,
                distinct_terms: 0,
                explain: Vec::new(),
            });
            continue;
        }

        let Some(scored_block) = score_block(store, config, &terms, &block, &file.rel_path, file.file_type, options)? else { continue };
        scored.push(scored_block);
    }

    scored.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(b.distinct_terms.cmp(&a.distinct_terms))
            .then(b.hits.cmp(&a.hits))
            .then(b.block.level.cmp(&a.block.level))
            .then(a.block.id.cmp(&b.block.id))
    });
    scored.truncate(options.top_k);

    for sb in scored {
        let ancestors = if options.ancestry {
            Store::ancestors(store.conn(), sb.block.id)?
                .into_iter()
                .rev()
                .map(|b| b.header_text)
                .collect()
        } else {
            Vec::new()
        };
        let snippet = build_snippet(root, &sb.file_path, &sb.block, options.max_block_lines, &sb.explain)?;
        let result_id = crate::hash::result_id(&sb.file_path, sb.block.line_start, sb.block.line_end, &sb.block.content_hash);
        Store::write_result_location(store.conn(), &result_id, sb.block.file_id, sb.block.line_start, sb.block.line_end)?;
        response.results.push(QueryResult {
            result_id,
            file_path: sb.file_path,
            file_type: sb.file_type.as_str().to_string(),
            line_start: sb.block.line_start,
            line_end: sb.block.line_end,
            ancestors,
            snippet,
            score: sb.score,
            salience: sb.salience,
            cluster: sb.cluster,
            hits: sb.hits,
            explain: if options.explain { Some(sb.explain) } else { None },
        });
    }

    response.timing_ms = started.elapsed().as_millis() as u64;
    Ok(response)
}

struct ScoredBlock {
    block: Block,
    file_path: String,
    file_type: FileType,
    score: f64,
    salience: f64,
    cluster: f64,
    hits: u32,
    distinct_terms: u32,
    explain: Vec<ExplainTerm>,
}

fn file_for_block(store: &Store, block: &Block) -> crate::error::Result<Option<crate::model::FileRecord>> {
    Store::get_file_by_id(store.conn(), block.file_id)
}

fn expand_token(
    store: &Store,
    config: &Config,
    ann_cache: &mut AnnCache,
    text: &str,
    kind: TokenKind,
    n_files: u32,
) -> crate::error::Result<Vec<(i64, String, TokenKind, u32, f64)>> {
    if !matches!(kind, TokenKind::Ident | TokenKind::Word | TokenKind::Compound) {
        return Ok(Vec::new());
    }
    let Some(token) = Store::get_token_by_text(store.conn(), text)? else { return Ok(Vec::new()) };
    let Some(index) = ann_cache.get_or_load("token.line", &config.ann_path("token.line")) else {
        return Ok(Vec::new());
    };
    let Some(vector) = Store::read_token_vector(store.conn(), crate::vector::MODEL_LINE, token.id)? else {
        return Ok(Vec::new());
    };
    let mut fixed = [0f32; VECTOR_DIM];
    let n = vector.len().min(VECTOR_DIM);
    fixed[..n].copy_from_slice(&vector[..n]);

    let neighbors = index.search(&fixed, config.query.expansion_top_k + 1);
    let mut out = Vec::new();
    for (neighbor_id, similarity) in neighbors {
        if neighbor_id == token.id || similarity < config.query.min_similarity as f32 {
            continue;
        }
        let Some(neighbor) = Store::get_token_by_id(store.conn(), neighbor_id)? else { continue };
        let df_ratio = neighbor.df as f64 / n_files.max(1) as f64;
        if df_ratio * 100.0 > config.query.max_df_percent {
            continue;
        }
        out.push((neighbor.id, neighbor.text, neighbor.kind, neighbor.df, similarity as f64));
        if out.len() >= config.query.expansion_top_k {
            break;
        }
    }
    Ok(out)
}

fn gather_lexical_candidates(store: &Store, terms: &[Term], max_candidates: usize) -> crate::error::Result<Vec<i64>> {
    let mut candidates: HashSet<i64> = HashSet::new();
    for term in terms.iter().filter(|t| t.candidate_generating) {
        for posting in Store::postings_for_token(store.conn(), term.token_id)? {
            let line_map = Store::read_line_map(store.conn(), posting.file_id)?;
            for &line in &posting.lines {
                if let Some(&block_id) = line_map.get((line - 1) as usize) {
                    candidates.insert(block_id);
                    for ancestor in Store::ancestors(store.conn(), block_id)? {
                        candidates.insert(ancestor.id);
                    }
                }
            }
        }
        if candidates.len() >= max_candidates {
            break;
        }
    }
    let mut out: Vec<i64> = candidates.into_iter().collect();
    out.sort_unstable();
    out.truncate(max_candidates);
    Ok(out)
}

fn query_centroid(store: &Store, terms: &[Term]) -> crate::error::Result<Vec<f32>> {
    let mut mean = vec![0f32; VECTOR_DIM];
    let mut weight_sum = 0f64;
    for term in terms {
        if let Some(vector) = Store::read_token_vector(store.conn(), crate::vector::MODEL_BLOCK, term.token_id)? {
            let w = term.idf;
            for (m, v) in mean.iter_mut().zip(vector.iter()) {
                *m += (*v as f64 * w) as f32;
            }
            weight_sum += w;
        }
    }
    if weight_sum > 0.0 {
        let norm = (mean.iter().map(|v| (*v as f64).powi(2)).sum::<f64>()).sqrt();
        if norm > 0.0 {
            for m in &mut mean {
                *m = (*m as f64 / norm) as f32;
            }
        }
    }
    Ok(mean)
}

fn gather_semantic_candidates(
    store: &Store,
    config: &Config,
    ann_cache: &mut AnnCache,
    terms: &[Term],
    top_n: usize,
) -> crate::error::Result<Vec<i64>> {
    let centroid = query_centroid(store, terms)?;
    let Some(index) = ann_cache.get_or_load("centroid.block", &config.ann_path("centroid.block")) else {
        return Ok(Vec::new());
    };
    let mut fixed = [0f32; VECTOR_DIM];
    let n = centroid.len().min(VECTOR_DIM);
    fixed[..n].copy_from_slice(&centroid[..n]);
    Ok(index.search(&fixed, top_n).into_iter().map(|(id, _)| id).collect())
}

fn semantic_similarity(store: &Store, terms: &[Term], block_id: i64) -> crate::error::Result<Option<f64>> {
    let centroid = query_centroid(store, terms)?;
    let Some(block_centroid) = Store::read_centroid(store.conn(), block_id)? else { return Ok(None) };
    Ok(Some(scorer::centroid_cluster(&centroid, &block_centroid)))
}

fn score_block(
    store: &Store,
    config: &Config,
    terms: &[Term],
    block: &Block,
    rel_path: &str,
    file_type: FileType,
    options: &QueryOptions,
) -> crate::error::Result<Option<ScoredBlock>> {
    let mut total_contribution = 0.0;
    let mut hits = 0u32;
    let mut distinct_terms = 0u32;
    let mut explain = Vec::new();

    for term in terms {
        let Some(posting) = Store::get_posting(store.conn(), term.token_id, block.file_id)? else { continue };
        let lines_in_block: Vec<u32> = posting.lines.iter().copied().filter(|&l| block.contains_line(l)).collect();
        if lines_in_block.is_empty() {
            continue;
        }
        let tf = lines_in_block.len() as u32;
        let tfw = scorer::tf_saturated(tf);
        let kind_weight = term.kind.weight();
        let contribution = scorer::term_contribution(tfw, term.idf, kind_weight, term.sim);
        total_contribution += contribution;
        hits += tf;
        distinct_terms += 1;
        explain.push(ExplainTerm {
            token: term.text.clone(),
            from_query: term.source.clone(),
            similarity: term.sim,
            lines: lines_in_block,
        });
    }

    if distinct_terms == 0 {
        return Ok(None);
    }

    let salience = scorer::salience(total_contribution, block.token_count);

    let cluster = match config.query.cluster_mode {
        ClusterMode::Centroid if options.augment => {
            let centroid = query_centroid(store, terms)?;
            match Store::read_centroid(store.conn(), block.id)? {
                Some(block_centroid) => scorer::centroid_cluster(&centroid, &block_centroid),
                None => 0.0,
            }
        }
        _ => {
            let children = Store::get_children(store.conn(), block.id)?;
            let mut child_hits = Vec::with_capacity(children.len());
            for child in &children {
                let mut n = 0u32;
                for term in terms {
                    if let Some(posting) = Store::get_posting(store.conn(), term.token_id, child.file_id)? {
                        n += posting.lines.iter().filter(|&&l| child.contains_line(l)).count() as u32;
                    }
                }
                child_hits.push(n);
            }
            scorer::concentration_cluster(&child_hits)
        }
    };

    let score = scorer::final_score(salience, cluster);

    Ok(Some(ScoredBlock {
        block: block.clone(),
        file_path: rel_path.to_string(),
        file_type,
        score,
        salience,
        cluster,
        hits,
        distinct_terms,
        explain,
    }))
}

/// Extracts the snippet lines for a result: the whole block when it fits
/// within `max_block_lines`, else the densest hit-cluster window of that
/// size (§4.6.1 step 6).
fn build_snippet(root: &Path, rel_path: &str, block: &Block, max_block_lines: usize, explain: &[ExplainTerm]) -> crate::error::Result<Vec<SnippetLine>> {
    let content = std::fs::read_to_string(root.join(rel_path)).unwrap_or_default();
    let lines: Vec<&str> = content.lines().collect();

    let mut hit_lines: HashSet<u32> = HashSet::new();
    for term in explain {
        hit_lines.extend(term.lines.iter().copied());
    }

    let (start, end) = if (block.line_end - block.line_start + 1) as usize <= max_block_lines {
        (block.line_start, block.line_end)
    } else {
        densest_window(block.line_start, block.line_end, max_block_lines as u32, &hit_lines)
    };

    let mut out = Vec::new();
    for line_no in start..=end {
        let text = lines.get((line_no - 1) as usize).map(|s| s.to_string()).unwrap_or_default();
        out.push(SnippetLine { line: line_no, text, is_hit: hit_lines.contains(&line_no) });
    }
    Ok(out)
}

fn densest_window(line_start: u32, line_end: u32, window: u32, hit_lines: &HashSet<u32>) -> (u32, u32) {
    let mut best_start = line_start;
    let mut best_count = -1i64;
    let mut start = line_start;
    while start <= line_end {
        let end = (start + window - 1).min(line_end);
        let count = (start..=end).filter(|l| hit_lines.contains(l)).count() as i64;
        if count > best_count {
            best_count = count;
            best_start = start;
        }
        if end == line_end {
            break;
        }
        start += 1;
    }
    (best_start, (best_start + window - 1).min(line_end))
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
    fn empty_query_returns_no_results() {
        let dir = tempdir().unwrap();
        let mut store = Store::open_in_memory().unwrap();
        let config = Config::load(dir.path()).unwrap();
        let options = QueryOptions::from_config(&config);
        let _ = &mut store;
        let response = run(&store, &config, dir.path(), "", &options).unwrap();
        assert!(response.results.is_empty());
    }

    #[test]
    fn end_to_end_query_finds_best_matching_file() {
        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join("retry.cr"),
            "def retry(attempts)\n  backoff = calculate(i)\n  sleep(backoff)\nend\n",
        )
        .unwrap();
        std::fs::write(
            dir.path().join("http.cr"),
            "class HttpClient\ndef request(url)\nfetch(url)\nend\nend\n",
        )
        .unwrap();

        let mut store = Store::open_in_memory().unwrap();
        let config = Config::load(dir.path()).unwrap();
        let cancel = AtomicBool::new(false);
        let files = vec![discover(dir.path(), "retry.cr"), discover(dir.path(), "http.cr")];
        run_index(&mut store, &config, &files, &cancel).unwrap();

        let options = QueryOptions::from_config(&config);
        let response = run(&store, &config, dir.path(), "retry backoff", &options).unwrap();
        assert!(!response.results.is_empty());
        assert_eq!(response.results[0].file_path, "retry.cr");
        assert!(response.results[0].hits >= 2);
        assert!(response.results[0].score > 0.0);
    }

    #[test]
    fn result_id_is_stable_across_identical_queries() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("a.rs"), "fn search(query: &str) {\n  println!(\"{}\", query);\n}\n").unwrap();
        let mut store = Store::open_in_memory().unwrap();
        let config = Config::load(dir.path()).unwrap();
        let cancel = AtomicBool::new(false);
        let files = vec![discover(dir.path(), "a.rs")];
        run_index(&mut store, &config, &files, &cancel).unwrap();

        let options = QueryOptions::from_config(&config);
        let first = run(&store, &config, dir.path(), "search query", &options).unwrap();
        let second = run(&store, &config, dir.path(), "search query", &options).unwrap();
        let first_ids: Vec<&str> = first.results.iter().map(|r| r.result_id.as_str()).collect();
        let second_ids: Vec<&str> = second.results.iter().map(|r| r.result_id.as_str()).collect();
        assert_eq!(first_ids, second_ids);
    }
}
