use crate::error::Result;
use crate::mmr::MmrReranker;
use crate::retriever::{Retriever, ScoredChunk};

/// Thin composition: retriever → MMR diversification → score-threshold
/// filter. The retriever is asked for a multiple of the final k so MMR has
/// real candidates to trade relevance against.
pub struct RetrieveUseCase {
    retriever: Retriever,
    mmr: MmrReranker,
    min_score: f32,
}

impl RetrieveUseCase {
    pub fn new(retriever: Retriever, mmr: MmrReranker, min_score: f32) -> Self {
        Self {
            retriever,
            mmr,
            min_score,
        }
    }

    pub fn retrieve(&self, query: &str, top_k: usize) -> Result<Vec<ScoredChunk>> {
        if top_k == 0 {
            return Ok(Vec::new());
        }
        let candidate_k = (3 * top_k).max(top_k);
        let candidates = self.retriever.retrieve(query, candidate_k)?;
        let diversified = self.mmr.rerank(candidates, top_k);
        Ok(diversified
            .into_iter()
            .filter(|c| c.score >= self.min_score)
            .collect())
    }

    /// Retrieval-stage label used for snippet provenance.
    pub fn kind(&self) -> &'static str {
        self.retriever.kind()
    }
}
