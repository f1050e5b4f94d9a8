//! Feedback (C10, §4.7): append-only events, a per-result aggregate, and a
//! per-token accumulator the scorer reads back as a boost.

use crate::error::Result;
use crate::model::clamp_feedback_score;
use crate::store::Store;

/// Records a mark on a result: an append-only [`crate::model::FeedbackEvent`],
/// an updated per-result aggregate, and — if a location is supplied — a
/// per-token aggregate for every token with an occurrence inside
/// `[line_start, line_end]`. Feedback never adds candidates; it only
/// adjusts `sim(t)` for tokens already in the index (§4.6.2).
pub fn mark(
    store: &Store,
    result_id: &str,
    score: f64,
    note: Option<&str>,
    file_id: Option<i64>,
    line_start: Option<u32>,
    line_end: Option<u32>,
) -> Result<()> {
    let score = clamp_feedback_score(score);
    let created_at = chrono::Utc::now().to_rfc3339();

    Store::insert_feedback_event(store.conn(), result_id, score, note, file_id, line_start, line_end, &created_at)?;
    Store::accumulate_result_feedback(store.conn(), result_id, score)?;

    if let (Some(file_id), Some(start), Some(end)) = (file_id, line_start, line_end) {
        let postings = Store::postings_for_file(store.conn(), file_id)?;
        for posting in postings {
            if posting.lines.iter().any(|&l| l >= start && l <= end) {
                Store::accumulate_token_feedback(store.conn(), posting.token_id, score)?;
            }
        }
    }

    Ok(())
}

/// Reads the `(useful, not_useful)` accumulator for a token, used by the
/// query engine to adjust `sim(t)` per §4.6.2's feedback boost.
pub fn token_boost(store: &Store, token_id: i64) -> Result<(f64, f64)> {
    Store::token_feedback(store.conn(), token_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FileType, TokenKind};

    #[test]
    fn mark_clamps_out_of_range_scores() {
        let store = Store::open_in_memory().unwrap();
        mark(&store, "abc123", 5.0, None, None, None, None).unwrap();
        let agg = Store::result_feedback(store.conn(), "abc123").unwrap();
        assert_eq!(agg, 1.0);
    }

    #[test]
    fn mark_with_location_updates_token_accumulators() {
        let store = Store::open_in_memory().unwrap();
        let file_id = Store::upsert_file(store.conn(), "a.rs", FileType::Code, 1, 10, 5, "h", "t").unwrap();
        let token_id = Store::upsert_token(store.conn(), "foo", TokenKind::Ident).unwrap();
        Store::upsert_posting(store.conn(), token_id, file_id, &[2, 3]).unwrap();

        mark(&store, "rid1", -0.5, Some("noisy"), Some(file_id), Some(1), Some(4)).unwrap();

        let (useful, not_useful) = token_boost(&store, token_id).unwrap();
        assert_eq!(useful, 0.0);
        assert_eq!(not_useful, 0.5);
    }

    #[test]
    fn repeated_marks_accumulate() {
        let store = Store::open_in_memory().unwrap();
        mark(&store, "rid", 0.5, None, None, None, None).unwrap();
        mark(&store, "rid", 0.3, None, None, None, None).unwrap();
        let agg = Store::result_feedback(store.conn(), "rid").unwrap();
        assert!((agg - 0.8).abs() < 1e-9);
    }
}
