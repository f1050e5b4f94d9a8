//! Deterministic tokenizer (§4.2): splits each line into kinded token
//! occurrences (line comments, block comments, strings, numbers,
//! identifiers, operators), then derives compound tokens as a post-pass.

use crate::model::TokenKind;
use regex::Regex;
use std::collections::HashMap;
use std::sync::OnceLock;

#[derive(Debug, Clone)]
pub struct TokenOccurrence {
    pub text: String,
    pub kind: TokenKind,
    /// 1-indexed line number.
    pub line: u32,
}

/// Per-file tokenization output: the ordered occurrence stream (used by the
/// co-occurrence trainer's line model) plus the aggregated per-text view the
/// indexer needs for postings (`token -> (highest-weight kind, sorted unique lines)`).
#[derive(Debug, Default)]
pub struct TokenizeResult {
    pub occurrences: Vec<TokenOccurrence>,
    pub aggregated: HashMap<String, (TokenKind, Vec<u32>)>,
}

const BLOCK_OPENERS: &[(&str, &str)] = &[("\"\"\"", "\"\"\""), ("/*", "*/"), ("{-", "-}"), ("=begin", "=end")];

fn number_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\d+(\.\d+)?([eE][+-]?\d+)?").unwrap())
}

fn ident_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*").unwrap())
}

fn word_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[A-Za-z][A-Za-z']*").unwrap())
}

fn compound_dot_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b[A-Za-z_][A-Za-z0-9_]*(?:\.[A-Za-z_][A-Za-z0-9_]*)+\b").unwrap())
}

fn compound_scope_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b[A-Za-z_][A-Za-z0-9_]*(?:::[A-Za-z_][A-Za-z0-9_]*)+\b").unwrap())
}

fn compound_arity_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b[A-Za-z_][A-Za-z0-9_]*/\d+\b").unwrap())
}

enum CommentState {
    None,
    Block(&'static str),
}

/// Normalize a token's text per §4.2: `word`/`str` are lowercased and
/// stripped of surrounding punctuation; other kinds pass through verbatim.
/// Returns `None` if the result is empty, pure punctuation, or outside
/// `[1, max_token_len]`.
fn normalize(text: &str, kind: TokenKind, max_token_len: usize) -> Option<String> {
    let normalized = match kind {
        TokenKind::Word | TokenKind::Str => {
            text.trim_matches(|c: char| !c.is_alphanumeric()).to_lowercase()
        }
        _ => text.to_string(),
    };
    if normalized.is_empty() || normalized.len() > max_token_len {
        return None;
    }
    if normalized.chars().all(|c| !c.is_alphanumeric() && c != '_') {
        return None;
    }
    Some(normalized)
}

/// Emit `word` tokens for every alphabetic run in `text` (used for comment
/// and string interiors).
fn push_words(out: &mut Vec<TokenOccurrence>, text: &str, line: u32, max_token_len: usize) {
    for m in word_re().find_iter(text) {
        if let Some(norm) = normalize(m.as_str(), TokenKind::Word, max_token_len) {
            out.push(TokenOccurrence { text: norm, kind: TokenKind::Word, line });
        }
    }
}

fn push_str_tokens(out: &mut Vec<TokenOccurrence>, text: &str, line: u32, max_token_len: usize) {
    for m in word_re().find_iter(text) {
        if let Some(norm) = normalize(m.as_str(), TokenKind::Str, max_token_len) {
            out.push(TokenOccurrence { text: norm, kind: TokenKind::Str, line });
        }
    }
}

/// Tokenize every line of a file, then derive compound tokens (§4.2 step 6)
/// over the raw lines and fold everything into the aggregated view the
/// indexer needs.
pub fn tokenize(lines: &[&str], max_token_len: usize) -> TokenizeResult {
    let mut occurrences = Vec::new();
    let mut state = CommentState::None;

    for (i, &raw_line) in lines.iter().enumerate() {
        let line_no = (i + 1) as u32;
        let mut pos = 0usize;

        if let CommentState::Block(closer) = state {
            if let Some(end) = raw_line.find(closer) {
                push_words(&mut occurrences, &raw_line[..end], line_no, max_token_len);
                pos = end + closer.len();
                state = CommentState::None;
            } else {
                push_words(&mut occurrences, raw_line, line_no, max_token_len);
                continue;
            }
        }

        while pos < raw_line.len() {
            let remaining = &raw_line[pos..];

            if remaining.starts_with('#') || remaining.starts_with("//") {
                let marker_len = if remaining.starts_with("//") { 2 } else { 1 };
                push_words(&mut occurrences, &remaining[marker_len..], line_no, max_token_len);
                break;
            }

            if let Some((opener, closer)) =
                BLOCK_OPENERS.iter().find(|(open, _)| remaining.starts_with(open))
            {
                let after_open = &remaining[opener.len()..];
                if let Some(end) = after_open.find(closer) {
                    push_words(&mut occurrences, &after_open[..end], line_no, max_token_len);
                    pos += opener.len() + end + closer.len();
                } else {
                    push_words(&mut occurrences, after_open, line_no, max_token_len);
                    state = CommentState::Block(closer);
                    break;
                }
                continue;
            }

            if remaining.starts_with('"') || remaining.starts_with('\'') {
                let quote = remaining.as_bytes()[0] as char;
                if let Some(end) = remaining[1..].find(quote) {
                    push_str_tokens(&mut occurrences, &remaining[1..1 + end], line_no, max_token_len);
                    pos += 2 + end;
                } else {
                    push_str_tokens(&mut occurrences, &remaining[1..], line_no, max_token_len);
                    break;
                }
                continue;
            }

            if let Some(m) = number_re().find(remaining) {
                if let Some(norm) = normalize(m.as_str(), TokenKind::Num, max_token_len) {
                    occurrences.push(TokenOccurrence { text: norm, kind: TokenKind::Num, line: line_no });
                }
                pos += m.end().max(1);
                continue;
            }

            if let Some(m) = ident_re().find(remaining) {
                if let Some(norm) = normalize(m.as_str(), TokenKind::Ident, max_token_len) {
                    occurrences.push(TokenOccurrence { text: norm, kind: TokenKind::Ident, line: line_no });
                }
                pos += m.end().max(1);
                continue;
            }

            let ch = remaining.chars().next().unwrap();
            if !ch.is_whitespace() {
                if let Some(norm) = normalize(&ch.to_string(), TokenKind::Op, max_token_len) {
                    occurrences.push(TokenOccurrence { text: norm, kind: TokenKind::Op, line: line_no });
                }
            }
            pos += ch.len_utf8();
        }
    }

    for occ in derive_compounds(lines, max_token_len) {
        occurrences.push(occ);
    }

    let mut aggregated: HashMap<String, (TokenKind, Vec<u32>)> = HashMap::new();
    for occ in &occurrences {
        let entry = aggregated.entry(occ.text.clone()).or_insert_with(|| (occ.kind, Vec::new()));
        entry.0 = entry.0.upgrade(occ.kind);
        entry.1.push(occ.line);
    }
    for (_, lines) in aggregated.values_mut() {
        lines.sort_unstable();
        lines.dedup();
    }

    TokenizeResult { occurrences, aggregated }
}

/// Derive `compound` tokens for `A.B`, `A::B`, and `A/N` patterns (§4.2 step
/// 6), one occurrence per match in addition to the components already
/// emitted by the main scan.
fn derive_compounds(lines: &[&str], max_token_len: usize) -> Vec<TokenOccurrence> {
    let mut out = Vec::new();
    for (i, &raw_line) in lines.iter().enumerate() {
        let line_no = (i + 1) as u32;
        for re in [compound_dot_re(), compound_scope_re(), compound_arity_re()] {
            for m in re.find_iter(raw_line) {
                if let Some(norm) = normalize(m.as_str(), TokenKind::Compound, max_token_len) {
                    out.push(TokenOccurrence { text: norm, kind: TokenKind::Compound, line: line_no });
                }
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn texts_of_kind(result: &TokenizeResult, kind: TokenKind) -> Vec<&str> {
        let mut v: Vec<&str> = result
            .aggregated
            .iter()
            .filter(|(_, (k, _))| *k == kind)
            .map(|(t, _)| t.as_str())
            .collect();
        v.sort_unstable();
        v
    }

    #[test]
    fn basic_tokens_and_line_numbers() {
        let lines = vec!["def foo(bar)", "  baz = 42", "end"];
        let result = tokenize(&lines, 128);
        for name in ["def", "foo", "bar", "baz", "end"] {
            assert!(result.aggregated.contains_key(name), "missing {name}");
        }
        assert_eq!(result.aggregated["foo"].1, vec![1]);
        assert_eq!(result.aggregated["baz"].1, vec![2]);
        assert!(texts_of_kind(&result, TokenKind::Word).is_empty());
        assert_eq!(texts_of_kind(&result, TokenKind::Num), vec!["42"]);
    }

    #[test]
    fn compound_derivation() {
        let lines = vec!["obj.method", "Foo::Bar"];
        let result = tokenize(&lines, 128);
        assert!(result.aggregated.contains_key("obj.method"));
        assert!(result.aggregated.contains_key("Foo::Bar"));
        assert!(result.aggregated.contains_key("obj"));
        assert!(result.aggregated.contains_key("method"));
    }

    #[test]
    fn line_comment_yields_words_not_idents() {
        let lines = vec!["x = 1 // some comment here"];
        let result = tokenize(&lines, 128);
        assert_eq!(texts_of_kind(&result, TokenKind::Word), vec!["comment", "here", "some"]);
        assert!(result.aggregated.contains_key("x"));
    }

    #[test]
    fn block_comment_spans_lines() {
        let lines = vec!["/* start", "middle words", "end */", "real_ident"];
        let result = tokenize(&lines, 128);
        assert!(result.aggregated.contains_key("start"));
        assert!(result.aggregated.contains_key("middle"));
        assert!(result.aggregated.contains_key("real_ident"));
        assert_eq!(result.aggregated["real_ident"].0, TokenKind::Ident);
    }

    #[test]
    fn string_interior_yields_str_tokens() {
        let lines = vec![r#"let s = "hello world";"#];
        let result = tokenize(&lines, 128);
        assert_eq!(result.aggregated["hello"].0, TokenKind::Str);
        assert_eq!(result.aggregated["world"].0, TokenKind::Str);
    }

    #[test]
    fn kind_upgrades_to_highest_weight() {
        // "len" appears as both an identifier and inside a string; ident wins.
        let lines = vec![r#"len("len")"#];
        let result = tokenize(&lines, 128);
        assert_eq!(result.aggregated["len"].0, TokenKind::Ident);
    }

    #[test]
    fn rejects_tokens_outside_length_bounds() {
        let long = "a".repeat(200);
        let lines = vec![long.as_str()];
        let result = tokenize(&lines, 128);
        assert!(result.aggregated.is_empty());
    }
}
