//! Scorer (C9, §4.6.2): TF saturation, IDF, size normalization, salience,
//! entropy-based concentration clustering, and the final combination.
//!
//! Pure functions over already-gathered hit data — no store access, so
//! these are trivially unit-testable and shareable across query-engine
//! worker threads.

/// Smoothed IDF: `ln((N+1)/(df+1)) + 1`. Regex-fallback tokens use 1.0,
/// handled by the caller rather than here (no `df` to smooth).
pub fn idf(n_files: u32, df: u32) -> f64 {
    (((n_files as f64) + 1.0) / ((df as f64) + 1.0)).ln() + 1.0
}

/// `tfw = ln(1 + tf)`.
pub fn tf_saturated(tf: u32) -> f64 {
    (1.0 + tf as f64).ln()
}

/// `c(t, B) = tfw * idf(t) * kind_weight(t) * sim(t)`.
pub fn term_contribution(tfw: f64, idf: f64, kind_weight: f64, sim: f64) -> f64 {
    tfw * idf * kind_weight * sim
}

/// `S(B) = (sum of term contributions) / (1 + size(B))^alpha`, alpha = 0.5.
pub fn salience(total_contribution: f64, size: u32) -> f64 {
    total_contribution / (1.0 + size as f64).powf(0.5)
}

/// Concentration-mode clustering (§4.6.2): entropy over the distribution of
/// hits across a block's immediate children. Zero when fewer than 2 hits or
/// only one child has any.
pub fn concentration_cluster(child_hit_counts: &[u32]) -> f64 {
    let n: u32 = child_hit_counts.iter().sum();
    let with_hits: Vec<u32> = child_hit_counts.iter().copied().filter(|&c| c > 0).collect();
    if n < 2 || with_hits.len() <= 1 {
        return 0.0;
    }
    let entropy: f64 = with_hits
        .iter()
        .map(|&c| {
            let p = c as f64 / n as f64;
            -p * p.ln()
        })
        .sum();
    let h_max = (with_hits.len() as f64).ln();
    if h_max <= 0.0 {
        0.0
    } else {
        (1.0 - entropy / h_max).clamp(0.0, 1.0)
    }
}

/// Centroid-mode clustering (§4.6.2): cosine similarity between the query
/// centroid and the block's centroid, clamped below at 0.
pub fn centroid_cluster(query_centroid: &[f32], block_centroid: &[f32]) -> f64 {
    cosine(query_centroid, block_centroid).max(0.0) as f64
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    let mut dot = 0f32;
    let mut norm_a = 0f32;
    let mut norm_b = 0f32;
    for (&x, &y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// `score(B) = S(B) * (1 + lambda * cluster(B))`, lambda = 0.2.
pub fn final_score(salience: f64, cluster: f64) -> f64 {
    const LAMBDA: f64 = 0.2;
    salience * (1.0 + LAMBDA * cluster)
}

/// Feedback boost (§4.6.2, optional): adjusts a term's effective similarity
/// before scoring, bounded so a single token's history can't flip sign.
pub fn feedback_adjusted_sim(sim: f64, useful: f64, not_useful: f64, w_useful: f64, w_not_useful: f64) -> f64 {
    (sim * (1.0 + w_useful * useful - w_not_useful * not_useful)).max(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idf_decreases_with_higher_df() {
        let rare = idf(1000, 1);
        let common = idf(1000, 900);
        assert!(rare > common);
    }

    #[test]
    fn tf_saturation_is_sublinear() {
        let tf1 = tf_saturated(1);
        let tf10 = tf_saturated(10);
        let tf100 = tf_saturated(100);
        assert!(tf10 - tf1 > tf100 - tf10);
    }

    #[test]
    fn concentration_zero_for_single_child_or_low_hits() {
        assert_eq!(concentration_cluster(&[5, 0, 0]), 0.0);
        assert_eq!(concentration_cluster(&[1, 0]), 0.0);
        assert_eq!(concentration_cluster(&[]), 0.0);
    }

    #[test]
    fn concentration_is_high_when_evenly_spread() {
        let spread = concentration_cluster(&[1, 1, 1, 1]);
        let concentrated = concentration_cluster(&[10, 1, 1, 1]);
        // Evenly spread hits across many children is *low* concentration
        // (high entropy), so cluster should be lower than a skewed split.
        assert!(concentrated > spread);
    }

    #[test]
    fn centroid_cluster_clamps_negative_similarity_to_zero() {
        let a = vec![1.0f32, 0.0];
        let b = vec![-1.0f32, 0.0];
        assert_eq!(centroid_cluster(&a, &b), 0.0);
    }

    #[test]
    fn final_score_scales_with_cluster() {
        let base = final_score(10.0, 0.0);
        let boosted = final_score(10.0, 1.0);
        assert_eq!(base, 10.0);
        assert!((boosted - 12.0).abs() < 1e-9);
    }

    #[test]
    fn feedback_boost_raises_and_lowers_similarity() {
        let boosted = feedback_adjusted_sim(1.0, 1.0, 0.0, 0.2, 0.2);
        let lowered = feedback_adjusted_sim(1.0, 0.0, 1.0, 0.2, 0.2);
        assert!(boosted > 1.0);
        assert!(lowered < 1.0);
        assert!(lowered >= 0.0);
    }
}
