//! Data model: files, tokens, postings, blocks, and feedback events,
//! independent of how the persistence layer (`store.rs`) lays them out
//! as tables.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileType {
    Code,
    Markdown,
    Config,
    Text,
}

impl FileType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileType::Code => "code",
            FileType::Markdown => "markdown",
            FileType::Config => "config",
            FileType::Text => "text",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "code" => Some(FileType::Code),
            "markdown" => Some(FileType::Markdown),
            "config" => Some(FileType::Config),
            "text" => Some(FileType::Text),
            _ => None,
        }
    }

    /// Classify by extension. Unknown extensions fall back to `Text`, which
    /// routes through the window adapter.
    pub fn from_extension(ext: &str) -> Self {
        match ext.to_ascii_lowercase().as_str() {
            "md" | "markdown" => FileType::Markdown,
            "yaml" | "yml" | "toml" | "json" | "ini" | "cfg" | "conf" => FileType::Config,
            "txt" | "rst" | "adoc" | "log" => FileType::Text,
            "" => FileType::Text,
            _ => FileType::Code,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FileRecord {
    pub id: i64,
    pub rel_path: String,
    pub file_type: FileType,
    pub mtime: i64,
    pub size: u64,
    pub line_count: u32,
    pub content_hash: String,
    pub indexed_at: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenKind {
    Ident,
    Compound,
    Word,
    Str,
    Num,
    Op,
}

impl TokenKind {
    /// Weight used both for kind-upgrading ties and for the scorer's
    /// `kind_weight(t)` term (§4.2 / §4.6.2).
    pub fn weight(&self) -> f64 {
        match self {
            TokenKind::Ident => 1.0,
            TokenKind::Compound => 0.9,
            TokenKind::Word => 0.7,
            TokenKind::Str => 0.3,
            TokenKind::Num => 0.2,
            TokenKind::Op => 0.1,
        }
    }

    /// Eligible kinds count toward block size and centroid selection.
    pub fn eligible(&self) -> bool {
        matches!(self, TokenKind::Ident | TokenKind::Compound | TokenKind::Word)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TokenKind::Ident => "ident",
            TokenKind::Compound => "compound",
            TokenKind::Word => "word",
            TokenKind::Str => "str",
            TokenKind::Num => "num",
            TokenKind::Op => "op",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "ident" => Some(TokenKind::Ident),
            "compound" => Some(TokenKind::Compound),
            "word" => Some(TokenKind::Word),
            "str" => Some(TokenKind::Str),
            "num" => Some(TokenKind::Num),
            "op" => Some(TokenKind::Op),
            _ => None,
        }
    }

    /// The higher-weight kind of the two, used when the same text is
    /// observed under multiple kinds (§4.2 kind upgrading).
    pub fn upgrade(self, other: TokenKind) -> TokenKind {
        if other.weight() > self.weight() {
            other
        } else {
            self
        }
    }
}

#[derive(Debug, Clone)]
pub struct TokenRecord {
    pub id: i64,
    pub text: String,
    pub kind: TokenKind,
    pub df: u32,
}

#[derive(Debug, Clone)]
pub struct Posting {
    pub token_id: i64,
    pub file_id: i64,
    pub tf: u32,
    pub lines: Vec<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockKind {
    Layout,
    Heading,
    Window,
}

impl BlockKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockKind::Layout => "layout",
            BlockKind::Heading => "heading",
            BlockKind::Window => "window",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "layout" => Some(BlockKind::Layout),
            "heading" => Some(BlockKind::Heading),
            "window" => Some(BlockKind::Window),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Block {
    pub id: i64,
    pub file_id: i64,
    pub kind: BlockKind,
    pub level: u32,
    /// 1-indexed, inclusive.
    pub line_start: u32,
    /// 1-indexed, inclusive.
    pub line_end: u32,
    pub parent_block_id: Option<i64>,
    pub content_hash: String,
    pub token_count: u32,
    /// First non-blank line of the block, used as its "header" for
    /// ancestry rendering and sibling-split keyword matching.
    pub header_text: String,
    /// Last non-blank line of the block, the other half of the "first or
    /// last line" keyword source in §4.3.
    pub footer_text: String,
}

impl Block {
    pub fn contains_line(&self, line: u32) -> bool {
        line >= self.line_start && line <= self.line_end
    }
}

#[derive(Debug, Clone)]
pub struct FeedbackEvent {
    pub id: i64,
    pub result_id: String,
    pub score: f64,
    pub note: Option<String>,
    pub file_id: Option<i64>,
    pub line_start: Option<u32>,
    pub line_end: Option<u32>,
    pub created_at: String,
}

/// Clamp a feedback score into the `[-1, +1]` range required by §4.7.
pub fn clamp_feedback_score(score: f64) -> f64 {
    score.clamp(-1.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_upgrade_prefers_higher_weight() {
        assert_eq!(TokenKind::Str.upgrade(TokenKind::Ident), TokenKind::Ident);
        assert_eq!(TokenKind::Ident.upgrade(TokenKind::Str), TokenKind::Ident);
        assert_eq!(TokenKind::Num.upgrade(TokenKind::Op), TokenKind::Num);
    }

    #[test]
    fn eligible_kinds() {
        assert!(TokenKind::Ident.eligible());
        assert!(TokenKind::Compound.eligible());
        assert!(TokenKind::Word.eligible());
        assert!(!TokenKind::Str.eligible());
        assert!(!TokenKind::Num.eligible());
        assert!(!TokenKind::Op.eligible());
    }

    #[test]
    fn feedback_score_is_clamped() {
        assert_eq!(clamp_feedback_score(2.0), 1.0);
        assert_eq!(clamp_feedback_score(-2.0), -1.0);
        assert_eq!(clamp_feedback_score(0.3), 0.3);
    }

    #[test]
    fn file_type_from_extension() {
        assert_eq!(FileType::from_extension("md"), FileType::Markdown);
        assert_eq!(FileType::from_extension("yaml"), FileType::Config);
        assert_eq!(FileType::from_extension("rs"), FileType::Code);
        assert_eq!(FileType::from_extension("txt"), FileType::Text);
    }
}
