//! Cross-module scenarios that exercise the indexer, query engine, and
//! feedback accumulator together rather than one module in isolation.
//! Single-module properties (varint roundtrips, tokenizer kinds, adapter
//! block trees, result-id stability) already live as unit tests next to
//! the code they cover.

use std::sync::atomic::AtomicBool;
use tempfile::tempdir;

use xerp_core::config::Config;
use xerp_core::feedback;
use xerp_core::indexer::{run_index, DiscoveredFile};
use xerp_core::query::{self, QueryOptions};
use xerp_core::store::Store;

fn discover(dir: &std::path::Path, rel: &str) -> DiscoveredFile {
    let abs = dir.join(rel);
    let mtime = std::fs::metadata(&abs).unwrap().modified().unwrap();
    let mtime = mtime.duration_since(std::time::UNIX_EPOCH).unwrap().as_secs() as i64;
    DiscoveredFile { rel_path: rel.to_string(), abs_path: abs, mtime }
}

/// After marking a result `--not-useful`, the same query's score for that
/// block must strictly decrease, everything else held equal.
#[test]
fn not_useful_feedback_lowers_the_blocks_score() {
    let dir = tempdir().unwrap();
    std::fs::write(
        dir.path().join("retry.rs"),
        "fn retry(foo: u32, bar: u32) -> u32 {\n  foo + bar\n}\n",
    )
    .unwrap();

    let mut store = Store::open_in_memory().unwrap();
    let config = Config::load(dir.path()).unwrap();
    let cancel = AtomicBool::new(false);
    let files = vec![discover(dir.path(), "retry.rs")];
    run_index(&mut store, &config, &files, &cancel).unwrap();

    let options = QueryOptions::from_config(&config);
    let before = query::run(&store, &config, dir.path(), "foo bar", &options).unwrap();
    assert!(!before.results.is_empty());
    let top = &before.results[0];
    let score_before = top.score;

    let file = Store::get_file_by_path(store.conn(), "retry.rs").unwrap().unwrap();
    feedback::mark(&store, &top.result_id, -1.0, Some("not useful"), Some(file.id), Some(top.line_start), Some(top.line_end)).unwrap();

    let after = query::run(&store, &config, dir.path(), "foo bar", &options).unwrap();
    let after_top = after.results.iter().find(|r| r.result_id == top.result_id).expect("same block still returned");
    assert!(after_top.score < score_before, "expected score to drop after negative feedback: {} !< {}", after_top.score, score_before);
}

/// A full index -> train -> query -> mark cycle on a small workspace with
/// two unrelated files, confirming augmented query expansion and feedback
/// both degrade gracefully when there isn't enough data to support them.
#[test]
fn index_train_query_mark_cycle_is_stable() {
    let dir = tempdir().unwrap();
    std::fs::write(
        dir.path().join("retry.rs"),
        "fn retry(attempts: u32) -> u32 {\n  let backoff = attempts * 2;\n  backoff\n}\n",
    )
    .unwrap();
    std::fs::write(
        dir.path().join("http.rs"),
        "struct HttpClient;\nimpl HttpClient {\n  fn request(url: &str) -> String {\n    url.to_string()\n  }\n}\n",
    )
    .unwrap();

    let mut store = Store::open_in_memory().unwrap();
    let config = Config::load(dir.path()).unwrap();
    let cancel = AtomicBool::new(false);
    let files = vec![discover(dir.path(), "retry.rs"), discover(dir.path(), "http.rs")];
    let report = run_index(&mut store, &config, &files, &cancel).unwrap();
    assert_eq!(report.files_indexed, 2);

    let train_report = xerp_core::vector::train(
        &mut store,
        &config,
        dir.path(),
        xerp_core::vector::ModelSelector::All,
        config.train.cooc_window_size,
        1,
        &cancel,
    )
    .unwrap();
    assert!(train_report.tokens_vectorized > 0);

    let mut options = QueryOptions::from_config(&config);
    options.augment = true;
    let response = query::run(&store, &config, dir.path(), "retry attempts", &options).unwrap();
    assert!(!response.results.is_empty());
    assert_eq!(response.results[0].file_path, "retry.rs");

    feedback::mark(&store, &response.results[0].result_id, 1.0, None, None, None, None).unwrap();
    let agg = Store::result_feedback(store.conn(), &response.results[0].result_id).unwrap();
    assert_eq!(agg, 1.0);
}
