//! Retrieval ranking: temporal decay, Maximal Marginal Relevance
//! diversification, and a score floor/limit pass.

use std::collections::BTreeSet;

use crate::schema::ChunkHit;
use crate::semantic_store::cosine_similarity;

/// Per-hit scoring breakdown, useful for debugging why something ranked
/// where it did.
#[derive(Debug, Clone)]
pub struct ScoredHit {
    pub hit: ChunkHit,
    pub original_score: f32,
    pub decayed_score: f32,
    pub age_in_days: f32,
    pub decay_multiplier: f32,
    pub relevance_score: f32,
    pub max_similarity: f32,
    pub mmr_score: f32,
}

#[derive(Debug, Clone, Default)]
pub struct RankingStats {
    pub input_count: usize,
    pub after_decay_count: usize,
    pub after_filter_count: usize,
    pub output_count: usize,
}

/// Exponential half-life decay: `multiplier = 0.5 ^ (age_days / half_life_days)`.
pub fn decay_multiplier(age_days: f32, half_life_days: f32) -> f32 {
    if half_life_days <= 0.0 {
        return 1.0;
    }
    0.5f32.powf(age_days / half_life_days)
}

pub fn apply_temporal_decay(hits: Vec<ChunkHit>, now_ms: i64, half_life_days: f32) -> Vec<ScoredHit> {
    hits.into_iter()
        .map(|hit| {
            let age_ms = (now_ms - hit.chunk.timestamp).max(0) as f32;
            let age_in_days = age_ms / (1000.0 * 60.0 * 60.0 * 24.0);
            let multiplier = decay_multiplier(age_in_days, half_life_days);
            let decayed = hit.score * multiplier;
            ScoredHit {
                original_score: hit.score,
                decayed_score: decayed,
                age_in_days,
                decay_multiplier: multiplier,
                relevance_score: decayed,
                max_similarity: 0.0,
                mmr_score: decayed,
                hit,
            }
        })
        .collect()
}

/// Greedy Maximal Marginal Relevance selection: repeatedly picks the
/// remaining candidate maximising
/// `lambda * relevance - (1 - lambda) * max_similarity_to_selected`,
/// skipping candidates whose similarity to an already-selected item exceeds
/// `duplicate_threshold`.
///
/// Similarity defaults to Jaccard over lowercased, punctuation-stripped
/// whitespace tokens. When `use_embeddings` is set and both sides carry an
/// embedding, cosine similarity over the embeddings replaces Jaccard for
/// that pair.
pub fn mmr_diversify(mut candidates: Vec<ScoredHit>, limit: usize, lambda: f32, duplicate_threshold: f32, use_embeddings: bool) -> Vec<ScoredHit> {
    let mut selected: Vec<ScoredHit> = Vec::new();

    while selected.len() < limit && !candidates.is_empty() {
        let mut best_idx = None;
        let mut best_mmr = f32::NEG_INFINITY;

        for (idx, candidate) in candidates.iter().enumerate() {
            let max_sim = selected
                .iter()
                .map(|s| text_similarity(&candidate.hit, &s.hit, use_embeddings))
                .fold(0.0f32, f32::max);

            if max_sim >= duplicate_threshold {
                continue;
            }

            let mmr = lambda * candidate.relevance_score - (1.0 - lambda) * max_sim;
            if mmr > best_mmr {
                best_mmr = mmr;
                best_idx = Some(idx);
            }
        }

        let Some(idx) = best_idx else { break };
        let mut picked = candidates.remove(idx);
        let max_sim = selected
            .iter()
            .map(|s| text_similarity(&picked.hit, &s.hit, use_embeddings))
            .fold(0.0f32, f32::max);
        picked.max_similarity = max_sim;
        picked.mmr_score = best_mmr;
        selected.push(picked);
    }

    selected
}

fn text_similarity(a: &ChunkHit, b: &ChunkHit, use_embeddings: bool) -> f32 {
    if use_embeddings {
        if let (Some(x), Some(y)) = (&a.chunk.embedding, &b.chunk.embedding) {
            return cosine_similarity(x, y);
        }
    }
    jaccard_similarity(&a.chunk.text, &b.chunk.text)
}

fn tokenize(text: &str) -> BTreeSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect()
}

fn jaccard_similarity(a: &str, b: &str) -> f32 {
    let tokens_a = tokenize(a);
    let tokens_b = tokenize(b);
    if tokens_a.is_empty() && tokens_b.is_empty() {
        return 1.0;
    }
    let intersection = tokens_a.intersection(&tokens_b).count();
    let union = tokens_a.union(&tokens_b).count();
    if union == 0 {
        0.0
    } else {
        intersection as f32 / union as f32
    }
}

/// Full pipeline: decay, filter by `min_score`, diversify with MMR, and
/// return the survivors plus stage-by-stage counts for observability.
pub fn rank(
    hits: Vec<ChunkHit>,
    now_ms: i64,
    half_life_days: f32,
    min_score: f32,
    limit: usize,
    mmr_lambda: f32,
    mmr_duplicate_threshold: f32,
    mmr_use_embeddings: bool,
) -> (Vec<ScoredHit>, RankingStats) {
    let input_count = hits.len();
    let decayed = apply_temporal_decay(hits, now_ms, half_life_days);
    let after_decay_count = decayed.len();

    let filtered: Vec<ScoredHit> = decayed.into_iter().filter(|s| s.relevance_score >= min_score).collect();
    let after_filter_count = filtered.len();

    let diversified = mmr_diversify(filtered, limit, mmr_lambda, mmr_duplicate_threshold, mmr_use_embeddings);
    let output_count = diversified.len();

    (
        diversified,
        RankingStats { input_count, after_decay_count, after_filter_count, output_count },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{MatchType, SemanticChunk};
    use uuid::Uuid;

    fn hit(text: &str, score: f32, timestamp: i64, embedding: Option<Vec<f32>>) -> ChunkHit {
        ChunkHit {
            chunk: SemanticChunk {
                id: Uuid::new_v4(),
                timestamp,
                text: text.into(),
                tags: Default::default(),
                source_event_id: None,
                source_type: None,
                session_id: None,
                embedding,
                metadata: None,
            },
            score,
            match_type: MatchType::Hybrid,
        }
    }

    #[test]
    fn decay_halves_score_at_half_life() {
        let mult = decay_multiplier(30.0, 30.0);
        assert!((mult - 0.5).abs() < 1e-6);
    }

    #[test]
    fn zero_half_life_disables_decay() {
        assert_eq!(decay_multiplier(1000.0, 0.0), 1.0);
    }

    #[test]
    fn older_items_score_lower_after_decay() {
        let now = 1_000_000_000_000i64;
        let day_ms = 1000 * 60 * 60 * 24;
        let hits = vec![
            hit("fresh", 1.0, now, None),
            hit("old", 1.0, now - 60 * day_ms, None),
        ];
        let scored = apply_temporal_decay(hits, now, 30.0);
        assert!(scored[0].decayed_score > scored[1].decayed_score);
    }

    #[test]
    fn mmr_drops_near_duplicates_by_embedding_when_opted_in() {
        let now = 0i64;
        let hits = vec![
            hit("a", 1.0, now, Some(vec![1.0, 0.0])),
            hit("a near-duplicate", 0.95, now, Some(vec![0.99, 0.01])),
            hit("distinct", 0.5, now, Some(vec![0.0, 1.0])),
        ];
        let scored = apply_temporal_decay(hits, now, 10_000.0);
        let diversified = mmr_diversify(scored, 3, 0.7, 0.8, true);
        assert_eq!(diversified.len(), 2);
        assert_eq!(diversified[0].hit.chunk.text, "a");
        assert_eq!(diversified[1].hit.chunk.text, "distinct");
    }

    #[test]
    fn mmr_drops_near_duplicates_by_jaccard_by_default() {
        let now = 0i64;
        let hits = vec![
            hit("rust memory safety guide", 1.0, now, None),
            hit("rust memory safety tips", 0.95, now, None),
            hit("baking sourdough bread", 0.5, now, None),
        ];
        let scored = apply_temporal_decay(hits, now, 10_000.0);
        let diversified = mmr_diversify(scored, 3, 0.7, 0.5, false);
        assert_eq!(diversified.len(), 2);
        assert_eq!(diversified[0].hit.chunk.text, "rust memory safety guide");
        assert_eq!(diversified[1].hit.chunk.text, "baking sourdough bread");
    }

    #[test]
    fn rank_reports_stage_counts() {
        let now = 0i64;
        let hits = vec![hit("a", 1.0, now, None), hit("b", 0.0001, now, None)];
        let (ranked, stats) = rank(hits, now, 30.0, 0.01, 5, 0.7, 0.8, false);
        assert_eq!(stats.input_count, 2);
        assert_eq!(stats.after_filter_count, 1);
        assert_eq!(ranked.len(), 1);
    }
}
