//! Content-addressed SHA-256 hashing, used for file/block content hashes and
//! for the stable result identity in [`result_id`].

use sha2::{Digest, Sha256};

/// Hex-encoded SHA-256 digest of arbitrary bytes.
pub fn hash_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex(&hasher.finalize())
}

/// Hex-encoded SHA-256 digest of a file's full content.
pub fn hash_content(content: &str) -> String {
    hash_bytes(content.as_bytes())
}

/// Hex-encoded SHA-256 digest of a contiguous line range within a file's
/// content, used as a block's `content_hash`.
pub fn hash_lines(lines: &[&str], start: usize, end: usize) -> String {
    let mut hasher = Sha256::new();
    for line in &lines[start.saturating_sub(1)..end.min(lines.len())] {
        hasher.update(line.as_bytes());
        hasher.update(b"\n");
    }
    hex(&hasher.finalize())
}

/// `result_id = SHA256(rel_path | ":" | line_start | ":" | line_end | ":" | content_hash)`,
/// stable across reindexes that don't alter block content (§3 invariant 8).
pub fn result_id(rel_path: &str, line_start: u32, line_end: u32, content_hash: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(rel_path.as_bytes());
    hasher.update(b":");
    hasher.update(line_start.to_string().as_bytes());
    hasher.update(b":");
    hasher.update(line_end.to_string().as_bytes());
    hasher.update(b":");
    hasher.update(content_hash.as_bytes());
    hex(&hasher.finalize())
}

fn hex(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        s.push_str(&format!("{b:02x}"));
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_64_hex_chars() {
        let h = hash_content("hello world");
        assert_eq!(h.len(), 64);
        assert!(h.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn same_content_same_hash() {
        assert_eq!(hash_content("abc"), hash_content("abc"));
        assert_ne!(hash_content("abc"), hash_content("abd"));
    }

    #[test]
    fn result_id_distinct_on_any_component() {
        let a = result_id("foo.rs", 1, 10, "deadbeef");
        let b = result_id("foo.rs", 1, 11, "deadbeef");
        let c = result_id("foo.rs", 1, 10, "cafebabe");
        let d = result_id("bar.rs", 1, 10, "deadbeef");
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
    }

    #[test]
    fn result_id_stable() {
        let a = result_id("foo.rs", 1, 10, "deadbeef");
        let b = result_id("foo.rs", 1, 10, "deadbeef");
        assert_eq!(a, b);
    }
}
