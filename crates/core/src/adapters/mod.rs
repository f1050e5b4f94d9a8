//! File classification into a block tree + line→block map (§4.3).
//!
//! Blocks are built as a flat `Vec<BlockDraft>` with parent indices during
//! construction (per the design note in spec.md §9: avoid back-references,
//! materialize real parent ids only after the caller inserts rows), then
//! handed to the indexer to persist.

pub mod indent;
pub mod markdown;
pub mod window;

use crate::model::BlockKind;

/// A block under construction, referencing its parent by index into the
/// same `Vec<BlockDraft>` rather than by a real (not-yet-assigned) id.
#[derive(Debug, Clone)]
pub struct BlockDraft {
    pub kind: BlockKind,
    pub level: u32,
    /// 1-indexed, inclusive.
    pub line_start: u32,
    /// 1-indexed, inclusive.
    pub line_end: u32,
    pub parent: Option<usize>,
    pub header_text: String,
}

/// The output of an adapter: a flat block forest plus the line→block-index
/// map (0-indexed lines, indices into `blocks`).
#[derive(Debug, Default)]
pub struct BlockForest {
    pub blocks: Vec<BlockDraft>,
    pub line_to_block: Vec<usize>,
}

pub trait Adapter {
    fn supports(&self, file_type: crate::model::FileType) -> bool;
    fn build_blocks(&self, lines: &[&str]) -> BlockForest;
}

/// Picks the adapter for a classified file: markdown headings, indentation
/// for code/config, or flat windows as the text/plain-fallback.
pub fn select_adapter(
    file_type: crate::model::FileType,
    tab_width: usize,
    window_size: usize,
    window_overlap: usize,
    learned_keywords: &std::collections::HashSet<String>,
) -> Box<dyn Adapter> {
    use crate::model::FileType::*;
    match file_type {
        Markdown => Box::new(markdown::MarkdownAdapter),
        Code => Box::new(indent::IndentAdapter::algol(tab_width, learned_keywords.clone())),
        Config => Box::new(indent::IndentAdapter::plain(tab_width)),
        Text => Box::new(window::WindowAdapter::new(window_size, window_overlap)),
    }
}
