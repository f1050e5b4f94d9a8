//! Flat overlapping windows for plain text / unrecognized files (§4.3).
//!
//! Windows of up to `W` lines are placed on a `(W - O)` stride so consecutive
//! windows overlap by `O` lines for richer context, while each line is still
//! owned (in the line→block map) by exactly one window — the one whose
//! non-overlapping "core" region contains it.

use super::{Adapter, BlockDraft, BlockForest};
use crate::model::{BlockKind, FileType};

pub struct WindowAdapter {
    window_size: usize,
    overlap: usize,
}

impl WindowAdapter {
    pub fn new(window_size: usize, overlap: usize) -> Self {
        Self { window_size: window_size.max(1), overlap: overlap.min(window_size.saturating_sub(1)) }
    }
}

impl Adapter for WindowAdapter {
    fn supports(&self, file_type: FileType) -> bool {
        matches!(file_type, FileType::Text)
    }

    fn build_blocks(&self, lines: &[&str]) -> BlockForest {
        if lines.is_empty() {
            return BlockForest::default();
        }
        let stride = self.window_size.saturating_sub(self.overlap).max(1);
        let line_count = lines.len();

        let mut blocks = Vec::new();
        let mut start = 0usize;
        while start < line_count {
            let end = (start + self.window_size).min(line_count);
            let header: String = lines[start].trim().chars().take(80).collect();
            blocks.push(BlockDraft {
                kind: BlockKind::Window,
                level: 0,
                line_start: (start + 1) as u32,
                line_end: end as u32,
                parent: None,
                header_text: header,
            });
            if end == line_count {
                break;
            }
            start += stride;
        }

        let last_idx = blocks.len() - 1;
        let mut line_to_block = vec![0usize; line_count];
        for i in 0..line_count {
            let owner = (i / stride).min(last_idx);
            line_to_block[i] = owner;
        }

        BlockForest { blocks, line_to_block }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn windows_cover_every_line_exactly_once_in_the_map() {
        let lines: Vec<&str> = (0..120).map(|_| "line").collect();
        let adapter = WindowAdapter::new(50, 10);
        let forest = adapter.build_blocks(&lines);
        assert_eq!(forest.line_to_block.len(), lines.len());
        for &idx in &forest.line_to_block {
            assert!(idx < forest.blocks.len());
        }
    }

    #[test]
    fn short_file_is_a_single_window() {
        let lines = vec!["a", "b", "c"];
        let adapter = WindowAdapter::new(50, 10);
        let forest = adapter.build_blocks(&lines);
        assert_eq!(forest.blocks.len(), 1);
        assert_eq!(forest.blocks[0].line_start, 1);
        assert_eq!(forest.blocks[0].line_end, 3);
    }
}
