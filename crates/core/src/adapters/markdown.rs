//! Heading-based block detection for markdown files (§4.3).

use super::{Adapter, BlockDraft, BlockForest};
use crate::model::{BlockKind, FileType};
use regex::Regex;
use std::sync::OnceLock;

fn heading_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(#{1,6})\s+(.*)$").unwrap())
}

pub struct MarkdownAdapter;

struct Frame {
    block_idx: usize,
    level: u32,
}

impl Adapter for MarkdownAdapter {
    fn supports(&self, file_type: FileType) -> bool {
        matches!(file_type, FileType::Markdown)
    }

    fn build_blocks(&self, lines: &[&str]) -> BlockForest {
        if lines.is_empty() {
            return BlockForest::default();
        }

        let mut blocks: Vec<BlockDraft> = Vec::new();
        let mut line_to_block = vec![0usize; lines.len()];
        let mut stack: Vec<Frame> = Vec::new();
        // Preamble block: content before the first heading, level 0.
        let mut preamble_idx: Option<usize> = None;

        for (i, &line) in lines.iter().enumerate() {
            if let Some(caps) = heading_re().captures(line) {
                let level = caps[1].len() as u32;
                // Close every open heading at level >= this one.
                while let Some(frame) = stack.last() {
                    if frame.level >= level {
                        let closed = stack.pop().unwrap();
                        blocks[closed.block_idx].line_end = i as u32;
                    } else {
                        break;
                    }
                }
                let parent = stack.last().map(|f| f.block_idx).or(preamble_idx);
                let new_idx = blocks.len();
                let header: String = line.trim().chars().take(80).collect();
                blocks.push(BlockDraft {
                    kind: BlockKind::Heading,
                    level,
                    line_start: (i + 1) as u32,
                    line_end: lines.len() as u32,
                    parent,
                    header_text: header,
                });
                stack.push(Frame { block_idx: new_idx, level });
                line_to_block[i] = new_idx;
            } else {
                if stack.is_empty() && preamble_idx.is_none() {
                    let idx = blocks.len();
                    blocks.push(BlockDraft {
                        kind: BlockKind::Heading,
                        level: 0,
                        line_start: (i + 1) as u32,
                        line_end: lines.len() as u32,
                        parent: None,
                        header_text: String::new(),
                    });
                    preamble_idx = Some(idx);
                }
                line_to_block[i] =
                    stack.last().map(|f| f.block_idx).or(preamble_idx).expect("preamble seeded above");
            }
        }

        let last_line = lines.len() as u32;
        for frame in stack {
            blocks[frame.block_idx].line_end = last_line;
        }
        if let Some(idx) = preamble_idx {
            if blocks[idx].line_end == 0 {
                blocks[idx].line_end = last_line;
            }
        }

        BlockForest { blocks, line_to_block }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn headings_close_at_equal_or_lower_level() {
        let lines = vec!["# Title", "intro text", "## Section A", "body a", "## Section B", "body b"];
        let forest = MarkdownAdapter.build_blocks(&lines);
        let title = forest.line_to_block[0];
        let section_a = forest.line_to_block[2];
        let section_b = forest.line_to_block[4];
        assert_ne!(section_a, section_b);
        assert_eq!(forest.blocks[section_a].parent, Some(title));
        assert_eq!(forest.blocks[section_b].parent, Some(title));
        // Section A closes before Section B opens.
        assert!(forest.blocks[section_a].line_end < forest.blocks[section_b].line_start);
    }

    #[test]
    fn deeper_heading_nests_under_shallower() {
        let lines = vec!["# H1", "## H2", "### H3", "text"];
        let forest = MarkdownAdapter.build_blocks(&lines);
        let h1 = forest.line_to_block[0];
        let h2 = forest.line_to_block[1];
        let h3 = forest.line_to_block[2];
        assert_eq!(forest.blocks[h2].parent, Some(h1));
        assert_eq!(forest.blocks[h3].parent, Some(h2));
    }

    #[test]
    fn preamble_before_first_heading() {
        let lines = vec!["intro line", "# Title", "body"];
        let forest = MarkdownAdapter.build_blocks(&lines);
        assert_eq!(forest.blocks[forest.line_to_block[0]].level, 0);
        assert_ne!(forest.line_to_block[0], forest.line_to_block[1]);
    }
}
