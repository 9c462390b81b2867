// src/search/rank.rs
// HybridRanker: reciprocal-rank fusion of a dense-vector ranking and a lexical ranking
// over a shared candidate set.

use std::collections::HashMap;
use std::hash::Hash;

#[derive(Debug, Clone, Copy)]
pub struct RankerConfig {
    /// Dampener; larger k flattens the influence of rank position.
    pub k: f64,
    pub weight_vector: f64,
    pub weight_fts: f64,
    pub overlap_boost: f64,
}

impl Default for RankerConfig {
    fn default() -> Self {
        Self { k: 60.0, weight_vector: 0.6, weight_fts: 0.4, overlap_boost: 0.05 }
    }
}

impl From<&crate::config::RerankConfig> for RankerConfig {
    fn from(cfg: &crate::config::RerankConfig) -> Self {
        Self { k: cfg.k, weight_vector: cfg.weight_vector, weight_fts: cfg.weight_fts, overlap_boost: cfg.overlap_boost }
    }
}

/// Fuse two rankings (best first) into one scored, descending list. A document present
/// in only one ranking is treated as ranked at `len + 1` in the other — just past the
/// last real position, never at it — so uniquely-matched documents aren't zeroed out
/// but also aren't rewarded with a false top rank in the ranking that missed them.
pub fn reciprocal_rank_fusion<T>(vector_ranking: &[T], fts_ranking: &[T], cfg: &RankerConfig) -> Vec<(T, f64)>
where
    T: Eq + Hash + Clone,
{
    let vector_rank: HashMap<&T, usize> = vector_ranking.iter().enumerate().map(|(i, d)| (d, i + 1)).collect();
    let fts_rank: HashMap<&T, usize> = fts_ranking.iter().enumerate().map(|(i, d)| (d, i + 1)).collect();

    let max_vector_rank = vector_ranking.len() + 1;
    let max_fts_rank = fts_ranking.len() + 1;

    let mut seen = std::collections::HashSet::new();
    let mut scored = Vec::new();

    for doc in vector_ranking.iter().chain(fts_ranking.iter()) {
        if !seen.insert(doc.clone()) {
            continue;
        }
        let rv = vector_rank.get(doc).copied().unwrap_or(max_vector_rank);
        let rf = fts_rank.get(doc).copied().unwrap_or(max_fts_rank);
        let in_both = vector_rank.contains_key(doc) && fts_rank.contains_key(doc);

        let mut score = cfg.weight_vector / (cfg.k + rv as f64) + cfg.weight_fts / (cfg.k + rf as f64);
        if in_both {
            score += cfg.overlap_boost;
        }
        scored.push((doc.clone(), score));
    }

    scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    scored
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_document_in_both_rankings_beats_document_in_one() {
        let vector = vec!["a", "b", "c"];
        let fts = vec!["a", "d", "e"];
        let cfg = RankerConfig::default();
        let fused = reciprocal_rank_fusion(&vector, &fts, &cfg);
        assert_eq!(fused[0].0, "a");
    }

    #[test]
    fn test_output_sorted_descending() {
        let vector = vec!["a", "b", "c"];
        let fts = vec!["c", "b", "a"];
        let cfg = RankerConfig::default();
        let fused = reciprocal_rank_fusion(&vector, &fts, &cfg);
        for w in fused.windows(2) {
            assert!(w[0].1 >= w[1].1);
        }
    }

    #[test]
    fn test_document_only_in_vector_ranking_still_scored() {
        let vector = vec!["only_vector"];
        let fts: Vec<&str> = vec![];
        let cfg = RankerConfig::default();
        let fused = reciprocal_rank_fusion(&vector, &fts, &cfg);
        assert_eq!(fused.len(), 1);
        assert!(fused[0].1 > 0.0);
    }

    #[test]
    fn test_no_duplicate_documents_in_output() {
        let vector = vec!["a", "b"];
        let fts = vec!["b", "a"];
        let cfg = RankerConfig::default();
        let fused = reciprocal_rank_fusion(&vector, &fts, &cfg);
        assert_eq!(fused.len(), 2);
    }

    #[test]
    fn test_overlap_boost_is_additive() {
        let cfg_no_boost = RankerConfig { overlap_boost: 0.0, ..RankerConfig::default() };
        let cfg_boost = RankerConfig { overlap_boost: 0.5, ..RankerConfig::default() };
        let vector = vec!["a"];
        let fts = vec!["a"];
        let without = reciprocal_rank_fusion(&vector, &fts, &cfg_no_boost)[0].1;
        let with = reciprocal_rank_fusion(&vector, &fts, &cfg_boost)[0].1;
        assert!((with - without - 0.5).abs() < 1e-9);
    }
}
