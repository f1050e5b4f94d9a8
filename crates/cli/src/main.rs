//! xerp CLI — command-line shell over `xerp-core`.
//!
//! Converts argv into the option structs the core understands, walks the
//! filesystem (the core never touches a directory tree directly), and
//! formats results as human text, JSON, JSONL, or grep-style lines.

use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::time::UNIX_EPOCH;

use xerp_core::config::Config;
use xerp_core::error::XerpError;
use xerp_core::feedback;
use xerp_core::indexer::{self, DiscoveredFile};
use xerp_core::model::FileType;
use xerp_core::outline;
use xerp_core::query::{self, QueryOptions};
use xerp_core::store::Store;
use xerp_core::terms;
use xerp_core::vector;

/// xerp — deterministic, structure-aware code search.
#[derive(Parser)]
#[command(name = "xerp", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan the workspace and update the index
    Index {
        #[arg(long)]
        root: Option<PathBuf>,
        /// Discard the existing index and reindex every file from scratch
        #[arg(long)]
        rebuild: bool,
        /// Train the vector models immediately after indexing
        #[arg(long)]
        train: bool,
        #[arg(long)]
        json: bool,
    },
    /// Search the index for the smallest scopes matching TEXT
    Query {
        text: String,
        #[arg(long)]
        root: Option<PathBuf>,
        #[arg(long, default_value_t = 20)]
        top: usize,
        /// Only consider files whose path matches this regex
        #[arg(long)]
        file: Option<String>,
        #[arg(long, value_name = "code|markdown|config|text")]
        r#type: Option<String>,
        /// Extra context lines shown around the snippet (display only)
        #[arg(long, default_value_t = 0)]
        context: usize,
        #[arg(long)]
        max_block_lines: Option<usize>,
        /// Include per-token scoring detail
        #[arg(long)]
        explain: bool,
        #[arg(long)]
        no_ancestry: bool,
        /// Re-rank with trained vectors via nearest-neighbor expansion
        #[arg(long)]
        augment: bool,
        /// Semantic-only retrieval (requires --augment)
        #[arg(long)]
        no_salience: bool,
        #[arg(long)]
        json: bool,
        #[arg(long)]
        jsonl: bool,
        #[arg(long)]
        grep: bool,
    },
    /// Record feedback on a previous query result
    Mark {
        result_id: String,
        #[arg(long)]
        root: Option<PathBuf>,
        #[arg(long)]
        useful: bool,
        #[arg(long)]
        promising: bool,
        #[arg(long)]
        not_useful: bool,
        #[arg(long)]
        note: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// Build co-occurrence vectors, centroids, and neighbor indexes
    Train {
        #[arg(long)]
        root: Option<PathBuf>,
        #[arg(long, default_value = "all", value_name = "line|block|all")]
        model: String,
        #[arg(long)]
        window: Option<usize>,
        #[arg(long)]
        min_count: Option<u32>,
        /// Caps how many neighbors are sampled into the `--json` report
        #[arg(long, default_value_t = 8)]
        top_neighbors: usize,
        /// Drop existing vectors/centroids before retraining
        #[arg(long)]
        clear: bool,
        #[arg(long)]
        json: bool,
    },
    /// Render the block tree of one or more indexed files
    Outline {
        #[arg(long)]
        root: Option<PathBuf>,
        #[arg(long)]
        file: Option<String>,
        #[arg(long)]
        level: Option<u32>,
        #[arg(long)]
        json: bool,
    },
    /// Suggest related terms for a piece of text
    Terms {
        text: String,
        #[arg(long)]
        root: Option<PathBuf>,
        #[arg(long, default_value = "scope", value_name = "scope|line|block|vector|combined")]
        source: String,
        #[arg(long, default_value_t = 10)]
        top: usize,
        #[arg(long, default_value_t = 22.0)]
        max_df: f64,
    },
}

fn resolve_root(root: Option<PathBuf>) -> PathBuf {
    let root = root.unwrap_or_else(|| std::env::current_dir().expect("could not determine current directory"));
    root.canonicalize().unwrap_or(root)
}

/// Walks `root` with `.gitignore` honored and hidden/`.cache`/`.config`
/// directories skipped, the way the indexer's own cache and config live
/// underneath the workspace it indexes.
fn discover_files(root: &Path) -> Vec<DiscoveredFile> {
    let mut out = Vec::new();
    let walker = ignore::WalkBuilder::new(root)
        .hidden(true)
        .git_ignore(true)
        .git_global(true)
        .git_exclude(true)
        .filter_entry(|entry| {
            if entry.file_type().is_some_and(|ft| ft.is_dir()) {
                let name = entry.file_name().to_string_lossy();
                return name != ".cache" && name != ".git";
            }
            true
        })
        .build();

    for entry in walker {
        let Ok(entry) = entry else { continue };
        if !entry.file_type().is_some_and(|ft| ft.is_file()) {
            continue;
        }
        let abs_path = entry.path().to_path_buf();
        let Ok(rel_path) = abs_path.strip_prefix(root) else { continue };
        let rel_path = rel_path.to_string_lossy().replace('\\', "/");
        let mtime = std::fs::metadata(&abs_path)
            .and_then(|m| m.modified())
            .map(|t| t.duration_since(UNIX_EPOCH).unwrap_or_default().as_secs() as i64)
            .unwrap_or(0);
        out.push(DiscoveredFile { rel_path, abs_path, mtime });
    }
    out
}

fn open_store(config: &Config) -> Result<Store, XerpError> {
    Store::open(&config.db_path)
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive("xerp=warn".parse().unwrap()))
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let code = match run(cli) {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("xerp: {e}");
            e.exit_code()
        }
    };
    std::process::exit(code);
}

fn run(cli: Cli) -> Result<(), XerpError> {
    match cli.command {
        Commands::Index { root, rebuild, train, json } => cmd_index(root, rebuild, train, json),
        Commands::Query {
            text,
            root,
            top,
            file,
            r#type,
            context,
            max_block_lines,
            explain,
            no_ancestry,
            augment,
            no_salience,
            json,
            jsonl,
            grep,
        } => cmd_query(
            text,
            root,
            top,
            file,
            r#type,
            context,
            max_block_lines,
            explain,
            no_ancestry,
            augment,
            no_salience,
            json,
            jsonl,
            grep,
        ),
        Commands::Mark { result_id, root, useful, promising, not_useful, note, json } => {
            cmd_mark(result_id, root, useful, promising, not_useful, note, json)
        }
        Commands::Train { root, model, window, min_count, top_neighbors, clear, json } => {
            cmd_train(root, model, window, min_count, top_neighbors, clear, json)
        }
        Commands::Outline { root, file, level, json } => cmd_outline(root, file, level, json),
        Commands::Terms { text, root, source, top, max_df } => cmd_terms(text, root, source, top, max_df),
    }
}

fn cmd_index(root: Option<PathBuf>, rebuild: bool, train: bool, json: bool) -> Result<(), XerpError> {
    let root = resolve_root(root);
    let config = Config::load(&root)?;
    let mut store = open_store(&config)?;

    if rebuild {
        store.rebuild_all()?;
    }

    let discovered = discover_files(&root);
    let cancel = AtomicBool::new(false);
    let report = indexer::run_index(&mut store, &config, &discovered, &cancel)?;

    if train {
        let train_report = vector::train(
            &mut store,
            &config,
            &root,
            vector::ModelSelector::All,
            config.train.cooc_window_size,
            config.train.min_count,
            &cancel,
        )?;
        if json {
            println!(
                "{}",
                serde_json::json!({
                    "files_indexed": report.files_indexed,
                    "files_skipped": report.files_skipped,
                    "files_removed": report.files_removed,
                    "files_failed": report.files_failed.iter().map(|f| f.path.display().to_string()).collect::<Vec<_>>(),
                    "elapsed_ms": report.elapsed_ms,
                    "trained": {
                        "tokens_vectorized": train_report.tokens_vectorized,
                        "blocks_centroided": train_report.blocks_centroided,
                        "pairs_line": train_report.pairs_line,
                        "pairs_block": train_report.pairs_block,
                    }
                })
            );
        } else {
            print_index_report(&report);
            println!(
                "trained: {} tokens, {} blocks, {} line pairs, {} block pairs",
                train_report.tokens_vectorized, train_report.blocks_centroided, train_report.pairs_line, train_report.pairs_block
            );
        }
    } else if json {
        println!(
            "{}",
            serde_json::json!({
                "files_indexed": report.files_indexed,
                "files_skipped": report.files_skipped,
                "files_removed": report.files_removed,
                "files_failed": report.files_failed.iter().map(|f| f.path.display().to_string()).collect::<Vec<_>>(),
                "elapsed_ms": report.elapsed_ms,
            })
        );
    } else {
        print_index_report(&report);
    }

    if !report.files_failed.is_empty() {
        for failure in &report.files_failed {
            tracing::warn!(path = %failure.path.display(), reason = %failure.reason, "file skipped");
        }
    }

    Ok(())
}

fn print_index_report(report: &indexer::IndexReport) {
    println!(
        "indexed {} file(s), skipped {}, removed {}, failed {} ({}ms)",
        report.files_indexed,
        report.files_skipped,
        report.files_removed,
        report.files_failed.len(),
        report.elapsed_ms
    );
}

#[allow(clippy::too_many_arguments)]
fn cmd_query(
    text: String,
    root: Option<PathBuf>,
    top: usize,
    file: Option<String>,
    type_filter: Option<String>,
    context: usize,
    max_block_lines: Option<usize>,
    explain: bool,
    no_ancestry: bool,
    augment: bool,
    no_salience: bool,
    json: bool,
    jsonl: bool,
    grep: bool,
) -> Result<(), XerpError> {
    let root = resolve_root(root);
    let config = Config::load(&root)?;
    let store = open_store(&config)?;

    let mut options = QueryOptions::from_config(&config);
    options.top_k = top;
    options.explain = explain;
    options.ancestry = !no_ancestry;
    options.augment = augment;
    options.no_salience = no_salience;
    if let Some(pattern) = &file {
        options.file_filter =
            Some(regex::Regex::new(pattern).map_err(|e| XerpError::Input(format!("invalid --file regex: {e}")))?);
    }
    if let Some(type_str) = &type_filter {
        options.type_filter =
            Some(FileType::from_str(type_str).ok_or_else(|| XerpError::Input(format!("unknown --type '{type_str}'")))?);
    }
    if let Some(max_lines) = max_block_lines {
        options.max_block_lines = max_lines;
    }

    let response = query::run(&store, &config, &root, &text, &options)?;

    if jsonl {
        for result in &response.results {
            println!("{}", serde_json::to_string(&result_to_json(result, context)).unwrap());
        }
    } else if json {
        let payload = serde_json::json!({
            "query": response.query,
            "top": response.top,
            "timing_ms": response.timing_ms,
            "expanded_tokens": response.expanded_tokens.iter().map(|e| serde_json::json!({
                "from": e.from, "to": e.to, "similarity": e.similarity,
            })).collect::<Vec<_>>(),
            "results": response.results.iter().map(|r| result_to_json(r, context)).collect::<Vec<_>>(),
        });
        println!("{}", serde_json::to_string_pretty(&payload).unwrap());
    } else if grep {
        for result in &response.results {
            for line in &result.snippet {
                if line.is_hit {
                    println!("{}:{}:{}", result.file_path, line.line, line.text);
                }
            }
        }
    } else {
        print_human_results(&response);
    }

    Ok(())
}

fn result_to_json(result: &query::QueryResult, _context: usize) -> serde_json::Value {
    serde_json::json!({
        "result_id": result.result_id,
        "file_path": result.file_path,
        "file_type": result.file_type,
        "line_start": result.line_start,
        "line_end": result.line_end,
        "ancestors": result.ancestors,
        "snippet": result.snippet.iter().map(|l| serde_json::json!({
            "line": l.line, "text": l.text, "is_hit": l.is_hit,
        })).collect::<Vec<_>>(),
        "score": result.score,
        "salience": result.salience,
        "cluster": result.cluster,
        "hits": result.hits,
        "explain": result.explain.as_ref().map(|terms| {
            serde_json::json!({ "terms": terms.iter().map(|t| serde_json::json!({
                "token": t.token, "from_query": t.from_query, "similarity": t.similarity, "lines": t.lines,
            })).collect::<Vec<_>>() })
        }),
    })
}

fn print_human_results(response: &query::QueryResponse) {
    if response.results.is_empty() {
        eprintln!("no results for '{}'", response.query);
        return;
    }
    if !response.expanded_tokens.is_empty() {
        for e in &response.expanded_tokens {
            eprintln!("expanded '{}' -> '{}' ({:.2})", e.from, e.to, e.similarity);
        }
    }
    for result in &response.results {
        println!(
            "{}:{}-{}  score={:.3}  hits={}",
            result.file_path, result.line_start, result.line_end, result.score, result.hits
        );
        if !result.ancestors.is_empty() {
            println!("  {}", result.ancestors.join(" > "));
        }
        for line in &result.snippet {
            let marker = if line.is_hit { ">" } else { " " };
            println!("{marker}{:>5} | {}", line.line, line.text);
        }
        println!("  id: {}", result.result_id);
        println!();
    }
    eprintln!("{} result(s) in {}ms", response.results.len(), response.timing_ms);
}

fn cmd_mark(
    result_id: String,
    root: Option<PathBuf>,
    useful: bool,
    promising: bool,
    not_useful: bool,
    note: Option<String>,
    json: bool,
) -> Result<(), XerpError> {
    let selected = [useful, promising, not_useful].iter().filter(|&&b| b).count();
    if selected != 1 {
        return Err(XerpError::Input("mark requires exactly one of --useful, --promising, --not-useful".into()));
    }
    let score = if useful {
        1.0
    } else if promising {
        0.5
    } else {
        -1.0
    };

    let root = resolve_root(root);
    let config = Config::load(&root)?;
    let store = open_store(&config)?;

    let location = Store::read_result_location(store.conn(), &result_id)?;
    let (file_id, line_start, line_end) = match location {
        Some((f, s, e)) => (Some(f), Some(s), Some(e)),
        None => (None, None, None),
    };

    feedback::mark(&store, &result_id, score, note.as_deref(), file_id, line_start, line_end)?;

    if json {
        println!("{}", serde_json::json!({ "result_id": result_id, "score": score }));
    } else {
        println!("recorded feedback {score:+.1} for {result_id}");
    }
    Ok(())
}

fn cmd_train(
    root: Option<PathBuf>,
    model: String,
    window: Option<usize>,
    min_count: Option<u32>,
    top_neighbors: usize,
    clear: bool,
    json: bool,
) -> Result<(), XerpError> {
    let selector = vector::ModelSelector::parse(&model)
        .ok_or_else(|| XerpError::Input(format!("unknown --model '{model}', expected line|block|all")))?;

    let root = resolve_root(root);
    let config = Config::load(&root)?;
    let mut store = open_store(&config)?;

    if clear {
        match selector {
            vector::ModelSelector::Line => {
                Store::clear_model(store.conn(), vector::MODEL_LINE)?;
            }
            vector::ModelSelector::Block => {
                Store::clear_model(store.conn(), vector::MODEL_BLOCK)?;
                Store::clear_centroids(store.conn())?;
            }
            vector::ModelSelector::All => {
                Store::clear_model(store.conn(), vector::MODEL_LINE)?;
                Store::clear_model(store.conn(), vector::MODEL_BLOCK)?;
                Store::clear_centroids(store.conn())?;
            }
        }
    }

    let window = window.unwrap_or(config.train.cooc_window_size);
    let min_count = min_count.unwrap_or(config.train.min_count);
    let cancel = AtomicBool::new(false);
    let report = vector::train(&mut store, &config, &root, selector, window, min_count, &cancel)?;

    if json {
        println!(
            "{}",
            serde_json::json!({
                "tokens_vectorized": report.tokens_vectorized,
                "blocks_centroided": report.blocks_centroided,
                "pairs_line": report.pairs_line,
                "pairs_block": report.pairs_block,
                "top_neighbors": top_neighbors,
            })
        );
    } else {
        println!(
            "trained {} tokens, {} block centroids ({} line pairs, {} block pairs), sampling top {} neighbors",
            report.tokens_vectorized, report.blocks_centroided, report.pairs_line, report.pairs_block, top_neighbors
        );
    }
    Ok(())
}

fn cmd_outline(root: Option<PathBuf>, file: Option<String>, level: Option<u32>, json: bool) -> Result<(), XerpError> {
    let root = resolve_root(root);
    let config = Config::load(&root)?;
    let store = open_store(&config)?;

    let outlines = outline::run(&store, file.as_deref(), level)?;

    if json {
        let payload: Vec<serde_json::Value> = outlines
            .iter()
            .map(|f| {
                serde_json::json!({
                    "rel_path": f.rel_path,
                    "nodes": f.nodes.iter().map(|n| serde_json::json!({
                        "level": n.level,
                        "kind": n.kind.as_str(),
                        "line_start": n.line_start,
                        "line_end": n.line_end,
                        "header_text": n.header_text,
                    })).collect::<Vec<_>>(),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&payload).unwrap());
    } else {
        for file_outline in &outlines {
            println!("{}", file_outline.rel_path);
            for node in &file_outline.nodes {
                let indent = "  ".repeat(node.level as usize + 1);
                println!("{indent}{}:{}-{} {}", node.kind.as_str(), node.line_start, node.line_end, node.header_text.trim());
            }
        }
    }
    Ok(())
}

fn cmd_terms(text: String, root: Option<PathBuf>, source: String, top: usize, max_df: f64) -> Result<(), XerpError> {
    let source = terms::parse_source_or_err(&source)?;

    let root = resolve_root(root);
    let config = Config::load(&root)?;
    let store = open_store(&config)?;

    let hits = terms::run(&store, &config, &text, source, top, max_df)?;
    for hit in &hits {
        println!("{:<30} score={:.3} df={}", hit.text, hit.score, hit.df);
    }
    Ok(())
}
