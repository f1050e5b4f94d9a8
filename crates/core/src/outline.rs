//! `outline` (§6 CLI surface): renders the block tree of one or more
//! indexed files without touching tokens, postings, or the ANN indexes.
//! Purely a read over `blocks`/`files`, so it works even before `train`
//! has ever run.

use crate::error::Result;
use crate::model::BlockKind;
use crate::store::Store;

#[derive(Debug, Clone)]
pub struct OutlineNode {
    pub level: u32,
    pub kind: BlockKind,
    pub line_start: u32,
    pub line_end: u32,
    pub header_text: String,
}

#[derive(Debug, Clone)]
pub struct FileOutline {
    pub rel_path: String,
    pub nodes: Vec<OutlineNode>,
}

/// Builds an outline per matching file. `file_glob` filters `rel_path` with
/// shell-style `*`/`?` wildcards (no crate dependency for this; the
/// translation to regex is small enough to hand-roll). `max_level` caps
/// depth at the adapter's own `level` field; `None` means unlimited.
pub fn run(store: &Store, file_glob: Option<&str>, max_level: Option<u32>) -> Result<Vec<FileOutline>> {
    let glob_re = file_glob.map(glob_to_regex);
    let mut paths = store.list_all_rel_paths()?;
    paths.sort_by(|a, b| a.1.cmp(&b.1));

    let mut outlines = Vec::new();
    for (file_id, rel_path) in paths {
        if let Some(re) = &glob_re {
            if !re.is_match(&rel_path) {
                continue;
            }
        }
        let mut blocks = Store::blocks_for_file(store.conn(), file_id)?;
        blocks.sort_by_key(|b| (b.line_start, b.level));
        let nodes: Vec<OutlineNode> = blocks
            .into_iter()
            .filter(|b| max_level.map(|m| b.level <= m).unwrap_or(true))
            .map(|b| OutlineNode { level: b.level, kind: b.kind, line_start: b.line_start, line_end: b.line_end, header_text: b.header_text })
            .collect();
        if nodes.is_empty() {
            continue;
        }
        outlines.push(FileOutline { rel_path, nodes });
    }
    Ok(outlines)
}

/// Translates a shell glob into an anchored regex: `*` -> `.*`, `?` -> `.`,
/// everything else escaped literally.
fn glob_to_regex(glob: &str) -> regex::Regex {
    let mut pattern = String::from("^");
    for c in glob.chars() {
        match c {
            '*' => pattern.push_str(".*"),
            '?' => pattern.push('.'),
            '.' | '+' | '(' | ')' | '[' | ']' | '{' | '}' | '^' | '$' | '|' | '\\' => {
                pattern.push('\\');
                pattern.push(c);
            }
            c => pattern.push(c),
        }
    }
    pattern.push('$');
    regex::Regex::new(&pattern).unwrap_or_else(|_| regex::Regex::new("$^").unwrap())
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
    fn outline_lists_blocks_in_line_order() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("a.py"), "def foo():\n    x = 1\n    return x\n\ndef bar():\n    pass\n").unwrap();
        let mut store = Store::open_in_memory().unwrap();
        let config = Config::load(dir.path()).unwrap();
        let cancel = AtomicBool::new(false);
        let files = vec![discover(dir.path(), "a.py")];
        run_index(&mut store, &config, &files, &cancel).unwrap();

        let outlines = run(&store, None, None).unwrap();
        assert_eq!(outlines.len(), 1);
        let file = &outlines[0];
        assert_eq!(file.rel_path, "a.py");
        let starts: Vec<u32> = file.nodes.iter().map(|n| n.line_start).collect();
        let mut sorted = starts.clone();
        sorted.sort_unstable();
        assert_eq!(starts, sorted);
    }

    #[test]
    fn outline_filters_by_glob_and_level() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("a.py"), "def foo():\n    x = 1\n").unwrap();
        std::fs::write(dir.path().join("b.txt"), "just some text\nmore text\n").unwrap();
        let mut store = Store::open_in_memory().unwrap();
        let config = Config::load(dir.path()).unwrap();
        let cancel = AtomicBool::new(false);
        let files = vec![discover(dir.path(), "a.py"), discover(dir.path(), "b.txt")];
        run_index(&mut store, &config, &files, &cancel).unwrap();

        let only_py = run(&store, Some("*.py"), None).unwrap();
        assert_eq!(only_py.len(), 1);
        assert_eq!(only_py[0].rel_path, "a.py");

        let top_level_only = run(&store, None, Some(0)).unwrap();
        for outline in &top_level_only {
            assert!(outline.nodes.iter().all(|n| n.level == 0));
        }
    }

    #[test]
    fn glob_translates_wildcards_correctly() {
        let re = glob_to_regex("src/*.rs");
        assert!(re.is_match("src/main.rs"));
        assert!(!re.is_match("src/main.rs.bak"));
        assert!(!re.is_match("other/main.rs"));
    }
}
