//! Indexer (C6): scan -> classify -> block-build -> tokenize -> postings ->
//! block-counts -> df update, incremental by `(mtime, content_hash)`.

use crate::adapters::select_adapter;
use crate::config::Config;
use crate::error::{PerFileError, Result, XerpError};
use crate::hash;
use crate::invariant;
use crate::model::FileType;
use crate::store::Store;
use crate::tokenizer;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

/// Files are an I/O concern outside the core; the caller (CLI) walks the
/// tree with `ignore` and hands in this minimal description per file.
#[derive(Debug, Clone)]
pub struct DiscoveredFile {
    pub rel_path: String,
    pub abs_path: PathBuf,
    pub mtime: i64,
}

/// Files larger than this are treated as a per-file error rather than read
/// into memory (§7 tier 2).
pub const MAX_FILE_SIZE: u64 = 1024 * 1024;

#[derive(Debug, Default)]
pub struct IndexReport {
    pub files_indexed: usize,
    pub files_skipped: usize,
    pub files_removed: usize,
    pub files_failed: Vec<PerFileError>,
    pub elapsed_ms: u64,
}

/// Runs a full indexing pass over `discovered`, skipping files whose
/// `(mtime, content_hash)` match the stored row, removing files no longer
/// present, and recomputing `df` for every token touched by the run.
///
/// `cancel` is polled between files (§5: cooperative cancellation; no
/// partial result is emitted on cancel — the already-committed per-file
/// transactions stand, since each one is independently consistent).
pub fn run_index(store: &mut Store, config: &Config, discovered: &[DiscoveredFile], cancel: &AtomicBool) -> Result<IndexReport> {
    let started = Instant::now();
    let mut report = IndexReport::default();
    let mut touched_tokens: HashSet<i64> = HashSet::new();

    let learned_keywords = Store::learned_header_keywords(store.conn())?;
    let discovered_paths: HashSet<&str> = discovered.iter().map(|f| f.rel_path.as_str()).collect();

    for file in discovered {
        if cancel.load(Ordering::Relaxed) {
            break;
        }
        match index_one_file(store, config, file, &learned_keywords) {
            Ok(IndexOutcome::Indexed(tokens)) => {
                report.files_indexed += 1;
                touched_tokens.extend(tokens);
            }
            Ok(IndexOutcome::Skipped) => report.files_skipped += 1,
            Err(e) => {
                tracing::warn!(file = %file.rel_path, error = %e, "skipping file");
                report.files_failed.push(PerFileError { path: file.abs_path.clone(), reason: e.to_string() });
            }
        }
    }

    // Remove files present in the store but absent from this scan.
    let stored_paths = store.list_all_rel_paths()?;
    for (file_id, rel_path) in stored_paths {
        if discovered_paths.contains(rel_path.as_str()) {
            continue;
        }
        let old_tokens = file_token_ids(store.conn(), file_id)?;
        touched_tokens.extend(old_tokens);
        Store::delete_file(store.conn(), file_id)?;
        report.files_removed += 1;
    }

    Store::recompute_df(store.conn(), &touched_tokens.into_iter().collect::<Vec<_>>())?;
    Store::sweep_orphaned_tokens(store.conn())?;

    report.elapsed_ms = started.elapsed().as_millis() as u64;
    tracing::info!(
        indexed = report.files_indexed,
        skipped = report.files_skipped,
        removed = report.files_removed,
        failed = report.files_failed.len(),
        "index run complete"
    );
    Ok(report)
}

enum IndexOutcome {
    Indexed(Vec<i64>),
    Skipped,
}

fn file_token_ids(conn: &rusqlite::Connection, file_id: i64) -> Result<Vec<i64>> {
    Ok(Store::postings_for_file(conn, file_id)?.into_iter().map(|p| p.token_id).collect())
}

fn is_binary(bytes: &[u8]) -> bool {
    let probe = &bytes[..bytes.len().min(8192)];
    probe.contains(&0)
}

fn index_one_file(
    store: &mut Store,
    config: &Config,
    file: &DiscoveredFile,
    learned_keywords: &HashSet<String>,
) -> Result<IndexOutcome> {
    let metadata = std::fs::metadata(&file.abs_path)
        .map_err(|e| XerpError::PerFile { path: file.abs_path.clone(), reason: e.to_string() })?;
    if metadata.len() > MAX_FILE_SIZE {
        return Err(XerpError::PerFile { path: file.abs_path.clone(), reason: "file exceeds 1 MiB cap".into() });
    }

    let raw = std::fs::read(&file.abs_path)
        .map_err(|e| XerpError::PerFile { path: file.abs_path.clone(), reason: e.to_string() })?;
    if is_binary(&raw) {
        return Err(XerpError::PerFile { path: file.abs_path.clone(), reason: "binary content detected".into() });
    }
    let content = String::from_utf8_lossy(&raw).into_owned();
    let content_hash = hash::hash_content(&content);

    let existing = Store::get_file_by_path(store.conn(), &file.rel_path)?;
    if let Some(ref existing) = existing {
        if existing.mtime == file.mtime && existing.content_hash == content_hash {
            return Ok(IndexOutcome::Skipped);
        }
    }

    let lines: Vec<&str> = content.lines().collect();
    let ext = file.rel_path.rsplit('.').next().unwrap_or("");
    let file_type = FileType::from_extension(ext);
    let adapter = select_adapter(
        file_type,
        config.index.tab_width,
        config.index.window_size,
        config.index.window_overlap,
        learned_keywords,
    );
    let forest = adapter.build_blocks(&lines);
    let line_count = lines.len() as u32;
    for block in &forest.blocks {
        let ok = invariant!(
            block.line_start >= 1 && block.line_end <= line_count && block.line_start <= block.line_end,
            "block [{}, {}] outside {} lines in {}",
            block.line_start,
            block.line_end,
            line_count,
            file.rel_path
        );
        if !ok {
            return Err(XerpError::Invariant(format!("adapter produced an out-of-range block in {}", file.rel_path)));
        }
    }
    let tokenize_result = tokenizer::tokenize(&lines, config.index.max_token_len);

    let mut touched_tokens: HashSet<i64> = HashSet::new();
    let now = chrono::Utc::now().to_rfc3339();

    let txn = store.transaction()?;
    let old_tokens = if let Some(ref existing) = existing {
        let old = file_token_ids(&txn, existing.id)?;
        Store::clear_file_derived(&txn, existing.id)?;
        old
    } else {
        Vec::new()
    };
    touched_tokens.extend(old_tokens);

    let file_id = Store::upsert_file(
        &txn,
        &file.rel_path,
        file_type,
        file.mtime,
        metadata.len(),
        lines.len() as u32,
        &content_hash,
        &now,
    )?;

    let content_hashes: Vec<String> = forest
        .blocks
        .iter()
        .map(|b| hash::hash_lines(&lines, b.line_start as usize, b.line_end as usize))
        .collect();

    // token_count(B) = eligible occurrences whose line falls in B's range.
    // Because children's ranges nest inside their parent's (invariant 4/5),
    // this single formula satisfies invariant 6 for both leaves and parents.
    let mut eligible_lines: Vec<u32> = tokenize_result
        .occurrences
        .iter()
        .filter(|occ| occ.kind.eligible())
        .map(|occ| occ.line)
        .collect();
    eligible_lines.sort_unstable();
    let token_counts: Vec<u32> = forest
        .blocks
        .iter()
        .map(|b| {
            let start = eligible_lines.partition_point(|&l| l < b.line_start);
            let end = eligible_lines.partition_point(|&l| l <= b.line_end);
            (end - start) as u32
        })
        .collect();

    // footer_text mirrors header_text but from each block's closing line,
    // the other half of the "first or last line" keyword source (§4.3).
    let footer_texts: Vec<String> = forest
        .blocks
        .iter()
        .map(|b| lines.get((b.line_end - 1) as usize).map(|l| l.trim().chars().take(80).collect()).unwrap_or_default())
        .collect();

    let block_ids = Store::insert_blocks(&txn, file_id, &forest.blocks, &content_hashes, &token_counts, &footer_texts)?;

    let line_to_block_ids: Vec<i64> = forest.line_to_block.iter().map(|&idx| block_ids[idx]).collect();
    Store::write_line_map(&txn, file_id, &line_to_block_ids)?;

    // Cache ancestry lines: each block's start line and the line just before it.
    for block in &forest.blocks {
        if let Some(text) = lines.get((block.line_start - 1) as usize) {
            Store::write_line_cache(&txn, file_id, block.line_start, text)?;
        }
        if block.line_start > 1 {
            if let Some(text) = lines.get((block.line_start - 2) as usize) {
                Store::write_line_cache(&txn, file_id, block.line_start - 1, text)?;
            }
        }
    }

    for (text, (kind, token_lines)) in &tokenize_result.aggregated {
        let token_id = Store::upsert_token(&txn, text, *kind)?;
        Store::upsert_posting(&txn, token_id, file_id, token_lines)?;
        touched_tokens.insert(token_id);
    }

    txn.commit()?;

    Ok(IndexOutcome::Indexed(touched_tokens.into_iter().collect()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn discover(dir: &std::path::Path, rel: &str) -> DiscoveredFile {
        let abs = dir.join(rel);
        let mtime = std::fs::metadata(&abs).unwrap().modified().unwrap();
        let mtime = mtime.duration_since(std::time::UNIX_EPOCH).unwrap().as_secs() as i64;
        DiscoveredFile { rel_path: rel.to_string(), abs_path: abs, mtime }
    }

    #[test]
    fn indexes_a_simple_file() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("retry.cr"), "def retry(attempts)\n  backoff = calculate(i)\n  sleep(backoff)\nend\n").unwrap();
        let mut store = Store::open_in_memory().unwrap();
        let config = Config::load(dir.path()).unwrap();
        let cancel = AtomicBool::new(false);
        let files = vec![discover(dir.path(), "retry.cr")];
        let report = run_index(&mut store, &config, &files, &cancel).unwrap();
        assert_eq!(report.files_indexed, 1);
        assert_eq!(report.files_skipped, 0);
        let file = Store::get_file_by_path(store.conn(), "retry.cr").unwrap().unwrap();
        assert_eq!(file.line_count, 4);
    }

    #[test]
    fn reindexing_unchanged_workspace_skips_everything() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("a.rs"), "fn main() {}\n").unwrap();
        let mut store = Store::open_in_memory().unwrap();
        let config = Config::load(dir.path()).unwrap();
        let cancel = AtomicBool::new(false);
        let files = vec![discover(dir.path(), "a.rs")];
        run_index(&mut store, &config, &files, &cancel).unwrap();
        let second = run_index(&mut store, &config, &files, &cancel).unwrap();
        assert_eq!(second.files_indexed, 0);
        assert_eq!(second.files_skipped, 1);
    }

    #[test]
    fn removed_file_is_deleted_from_store() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("a.rs"), "fn main() {}\n").unwrap();
        let mut store = Store::open_in_memory().unwrap();
        let config = Config::load(dir.path()).unwrap();
        let cancel = AtomicBool::new(false);
        let files = vec![discover(dir.path(), "a.rs")];
        run_index(&mut store, &config, &files, &cancel).unwrap();
        let report = run_index(&mut store, &config, &[], &cancel).unwrap();
        assert_eq!(report.files_removed, 1);
        assert!(Store::get_file_by_path(store.conn(), "a.rs").unwrap().is_none());
    }

    #[test]
    fn oversized_file_is_a_per_file_error() {
        let dir = tempdir().unwrap();
        let big = "x".repeat(MAX_FILE_SIZE as usize + 10);
        std::fs::write(dir.path().join("big.txt"), big).unwrap();
        let mut store = Store::open_in_memory().unwrap();
        let config = Config::load(dir.path()).unwrap();
        let cancel = AtomicBool::new(false);
        let files = vec![discover(dir.path(), "big.txt")];
        let report = run_index(&mut store, &config, &files, &cancel).unwrap();
        assert_eq!(report.files_failed.len(), 1);
        assert_eq!(report.files_indexed, 0);
    }
}
