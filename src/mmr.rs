use crate::retriever::ScoredChunk;
use std::collections::HashSet;

/// Maximal-Marginal-Relevance reranker with a hard Jaccard dedup cutoff.
///
/// Candidates are selected one at a time by
/// `λ · normalized-relevance − (1 − λ) · max-similarity`, where similarity is
/// the Jaccard overlap of chunk token sets against everything already
/// selected. Anything above the dedup cutoff is dropped outright.
#[derive(Debug, Clone, Copy)]
pub struct MmrReranker {
    lambda: f32,
    dedup_cutoff: f32,
}

/// Jaccard(A, B) = |A ∩ B| / |A ∪ B|; two empty sets are identical (1),
/// one empty set is disjoint from anything non-empty (0).
pub fn jaccard(a: &HashSet<&str>, b: &HashSet<&str>) -> f32 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let intersection = a.intersection(b).count();
    let union = a.len() + b.len() - intersection;
    intersection as f32 / union as f32
}

impl MmrReranker {
    pub fn new(lambda: f32, dedup_cutoff: f32) -> Self {
        Self {
            lambda: lambda.clamp(0.0, 1.0),
            dedup_cutoff,
        }
    }

    pub fn rerank(&self, candidates: Vec<ScoredChunk>, k: usize) -> Vec<ScoredChunk> {
        if candidates.is_empty() || k == 0 {
            return Vec::new();
        }

        let max_score = candidates
            .iter()
            .map(|c| c.score)
            .fold(f32::NEG_INFINITY, f32::max);
        let denominator = if max_score.abs() > f32::EPSILON {
            max_score
        } else {
            1.0
        };
        let relevance: Vec<f32> = candidates.iter().map(|c| c.score / denominator).collect();

        let token_sets: Vec<HashSet<&str>> = candidates
            .iter()
            .map(|c| c.chunk.tokens.iter().map(String::as_str).collect())
            .collect();

        let mut remaining: Vec<usize> = (0..candidates.len()).collect();
        let mut selected: Vec<usize> = Vec::new();

        while selected.len() < k && !remaining.is_empty() {
            let mut best: Option<(usize, f32)> = None; // (position in remaining, mmr)
            let mut dropped: Vec<usize> = Vec::new(); // positions over the cutoff

            for (pos, &idx) in remaining.iter().enumerate() {
                let max_sim = selected
                    .iter()
                    .map(|&s| jaccard(&token_sets[idx], &token_sets[s]))
                    .fold(0.0f32, f32::max);

                if max_sim > self.dedup_cutoff {
                    // similarity only grows as the selection does; the
                    // candidate can never become admissible again
                    dropped.push(pos);
                    continue;
                }

                let mmr = self.lambda * relevance[idx] - (1.0 - self.lambda) * max_sim;
                match best {
                    Some((_, best_mmr)) if mmr <= best_mmr => {}
                    _ => best = Some((pos, mmr)),
                }
            }

            let Some((pos, _)) = best else { break };
            let idx = remaining[pos];
            selected.push(idx);

            dropped.push(pos);
            dropped.sort_unstable_by(|a, b| b.cmp(a));
            dropped.dedup();
            for pos in dropped {
                remaining.swap_remove(pos);
            }
        }

        // emit in selection order (approximates descending marginal utility)
        let mut by_index: Vec<Option<ScoredChunk>> = candidates.into_iter().map(Some).collect();
        selected
            .into_iter()
            .filter_map(|idx| by_index[idx].take())
            .collect()
    }
}
