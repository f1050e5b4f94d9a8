//! Indentation-based hierarchical block detection (§4.3.1), shared by the
//! plain `IndentAdapter` (config files) and the keyword-aware
//! `AlgolAdapter` mode (code files, sibling splitting on header keywords).

use super::{Adapter, BlockDraft, BlockForest};
use crate::model::{BlockKind, FileType};
use std::collections::HashSet;

/// Hardcoded default header-keyword tier (§4.3.1). Learned keywords,
/// computed from persisted block statistics, are merged in and win on
/// conflict — in practice this is a union, since learned keywords are only
/// ever positive evidence.
fn default_keywords() -> HashSet<String> {
    ["def", "class", "function", "fn", "if", "for", "while", "import", "let", "const"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

pub struct IndentAdapter {
    tab_width: usize,
    keyword_splitting: bool,
    keywords: HashSet<String>,
}

impl IndentAdapter {
    /// AlgolAdapter mode: sibling-splits same-indent blocks on a leading
    /// header keyword (`def`, `class`, `fn`, ...).
    pub fn algol(tab_width: usize, learned_keywords: HashSet<String>) -> Self {
        let mut keywords = default_keywords();
        keywords.extend(learned_keywords);
        Self { tab_width, keyword_splitting: true, keywords }
    }

    /// Plain indentation only, no keyword-based sibling splitting — used
    /// for config files, which rarely have Algol-style block headers.
    pub fn plain(tab_width: usize) -> Self {
        Self { tab_width, keyword_splitting: false, keywords: HashSet::new() }
    }
}

impl Adapter for IndentAdapter {
    fn supports(&self, file_type: FileType) -> bool {
        matches!(file_type, FileType::Code | FileType::Config)
    }

    fn build_blocks(&self, lines: &[&str]) -> BlockForest {
        build_indent_blocks(lines, self.tab_width, self.keyword_splitting, &self.keywords)
    }
}

/// Auto-detects a tab width from the most common positive leading-indent
/// delta between consecutive non-blank lines, defaulting to 2.
fn detect_tab_width(lines: &[&str]) -> usize {
    let mut prev: Option<usize> = None;
    let mut counts: std::collections::BTreeMap<usize, usize> = std::collections::BTreeMap::new();
    for line in lines {
        if line.trim().is_empty() {
            continue;
        }
        let leading = line.len() - line.trim_start_matches(' ').len();
        if let Some(p) = prev {
            let delta = leading.abs_diff(p);
            if delta > 0 {
                *counts.entry(delta).or_default() += 1;
            }
        }
        prev = Some(leading);
    }
    // Comparator breaks count ties by preferring the smaller delta, so the
    // result is a strict total order over distinct deltas and doesn't
    // depend on map iteration order.
    counts.into_iter().max_by(|a, b| a.1.cmp(&b.1).then(b.0.cmp(&a.0))).map(|(delta, _)| delta).unwrap_or(2)
}

fn first_token(line: &str) -> &str {
    let trimmed = line.trim_start();
    let end = trimmed.find(|c: char| !(c.is_alphanumeric() || c == '_')).unwrap_or(trimmed.len());
    &trimmed[..end]
}

struct Frame {
    block_idx: usize,
    opening_indent: usize,
}

pub fn build_indent_blocks(
    lines: &[&str],
    tab_width: usize,
    keyword_splitting: bool,
    keywords: &HashSet<String>,
) -> BlockForest {
    if lines.is_empty() {
        return BlockForest::default();
    }

    let effective_tab_width = if tab_width == 0 { detect_tab_width(lines).max(1) } else { tab_width };

    // Expand tabs, compute raw leading-space indent, then fold to levels.
    let expanded: Vec<String> = lines.iter().map(|l| l.replace('\t', &" ".repeat(effective_tab_width))).collect();
    let mut indent: Vec<usize> = expanded
        .iter()
        .map(|l| (l.len() - l.trim_start_matches(' ').len()) / effective_tab_width)
        .collect();

    // Blank lines inherit the following non-blank line's indent.
    let mut next_non_blank = indent.len();
    for i in (0..indent.len()).rev() {
        if expanded[i].trim().is_empty() {
            indent[i] = if next_non_blank < indent.len() { indent[next_non_blank] } else { 0 };
        } else {
            next_non_blank = i;
        }
    }

    let mut blocks: Vec<BlockDraft> = Vec::new();
    let mut line_to_block = vec![0usize; lines.len()];

    // Root frame covers the whole file at level 0.
    blocks.push(BlockDraft {
        kind: BlockKind::Layout,
        level: 0,
        line_start: 1,
        line_end: lines.len() as u32,
        parent: None,
        header_text: first_header_text(lines, 0),
    });
    let mut stack = vec![Frame { block_idx: 0, opening_indent: indent[0] }];

    for i in 0..lines.len() {
        if expanded[i].trim().is_empty() {
            line_to_block[i] = stack.last().unwrap().block_idx;
            continue;
        }

        while indent[i] < stack.last().unwrap().opening_indent && stack.len() > 1 {
            let frame = stack.pop().unwrap();
            blocks[frame.block_idx].line_end = i as u32; // i is 0-indexed -> previous line is i, 1-indexed i
        }

        let top_level = blocks[stack.last().unwrap().block_idx].level;
        if indent[i] > stack.last().unwrap().opening_indent {
            let parent_idx = stack.last().unwrap().block_idx;
            let new_idx = blocks.len();
            blocks.push(BlockDraft {
                kind: BlockKind::Layout,
                level: top_level + 1,
                line_start: (i + 1) as u32,
                line_end: lines.len() as u32,
                parent: Some(parent_idx),
                header_text: first_header_text(lines, i),
            });
            stack.push(Frame { block_idx: new_idx, opening_indent: indent[i] });
        } else if indent[i] == stack.last().unwrap().opening_indent
            && keyword_splitting
            && stack.len() > 1
            && keywords.contains(first_token(lines[i]))
        {
            let frame = stack.pop().unwrap();
            blocks[frame.block_idx].line_end = i as u32;
            let parent_idx = blocks[frame.block_idx].parent.expect("sibling split requires a parent");
            let new_idx = blocks.len();
            blocks.push(BlockDraft {
                kind: BlockKind::Layout,
                level: top_level,
                line_start: (i + 1) as u32,
                line_end: lines.len() as u32,
                parent: Some(parent_idx),
                header_text: first_header_text(lines, i),
            });
            stack.push(Frame { block_idx: new_idx, opening_indent: indent[i] });
        }

        line_to_block[i] = stack.last().unwrap().block_idx;
    }

    let last_line = lines.len() as u32;
    for frame in stack {
        blocks[frame.block_idx].line_end = last_line;
    }

    BlockForest { blocks, line_to_block }
}

fn first_header_text(lines: &[&str], idx: usize) -> String {
    lines.get(idx).map(|l| l.trim().chars().take(80).collect()).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_nesting_with_sibling_split() {
        let lines = vec!["class Foo", "  def bar", "    code", "  end", "end"];
        let keywords = default_keywords();
        let forest = build_indent_blocks(&lines, 2, true, &keywords);

        // Every line maps to exactly one block (trivially true: Vec is full length).
        assert_eq!(forest.line_to_block.len(), lines.len());

        // `def bar`'s block is nested under `class Foo`'s block.
        let bar_block = forest.line_to_block[1];
        let foo_block = forest.line_to_block[0];
        assert_ne!(bar_block, foo_block);
        assert_eq!(forest.blocks[bar_block].parent, Some(foo_block));

        for b in &forest.blocks {
            if let Some(p) = b.parent {
                assert!(forest.blocks[p].line_start <= b.line_start);
                assert!(forest.blocks[p].line_end >= b.line_end);
                assert!(forest.blocks[p].level < b.level);
            }
        }
    }

    #[test]
    fn deterministic_for_identical_input() {
        let lines = vec!["fn a()", "  x = 1", "fn b()", "  y = 2"];
        let keywords = default_keywords();
        let a = build_indent_blocks(&lines, 2, true, &keywords);
        let b = build_indent_blocks(&lines, 2, true, &keywords);
        assert_eq!(a.line_to_block, b.line_to_block);
        for (ba, bb) in a.blocks.iter().zip(b.blocks.iter()) {
            assert_eq!(ba.line_start, bb.line_start);
            assert_eq!(ba.line_end, bb.line_end);
            assert_eq!(ba.level, bb.level);
        }
    }

    #[test]
    fn plain_mode_does_not_split_siblings() {
        let lines = vec!["a:", "  b: 1", "  c: 2"];
        let forest = build_indent_blocks(&lines, 2, false, &HashSet::new());
        // No keyword splitting means `b:` and `c:` stay in the same block.
        assert_eq!(forest.line_to_block[1], forest.line_to_block[2]);
    }

    #[test]
    fn blank_lines_inherit_following_indent() {
        let lines = vec!["def f", "  x = 1", "", "  y = 2", "end"];
        let keywords = default_keywords();
        let forest = build_indent_blocks(&lines, 2, true, &keywords);
        // The blank line (index 2) should join the same block as its neighbors.
        assert_eq!(forest.line_to_block[2], forest.line_to_block[1]);
    }
}
