use crate::embedder::Embedder;
use crate::error::{RagError, Result};
use crate::query_cache::QueryCache;
use crate::store::{Chunk, Document, IndexStore};
use crate::tokenizer::Tokenizer;
use crate::vector_store::VectorStore;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// A chunk with its raw text and a stage-dependent relevance score
/// (higher is better).
#[derive(Debug, Clone)]
pub struct ScoredChunk {
    pub chunk: Chunk,
    pub text: String,
    pub score: f32,
}

/// Optional external reranking stage. Implementations live outside the core;
/// the retriever only carries the seam.
pub trait Reranker {
    fn name(&self) -> &'static str;
    fn rerank(&self, query: &str, candidates: Vec<ScoredChunk>) -> Result<Vec<ScoredChunk>>;
}

fn sort_ranked(scores: &mut Vec<(String, f32)>) {
    scores.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.0.cmp(&b.0))
    });
}

// ---------------------------------------------------------------------------
// BM25 over the inverted postings
// ---------------------------------------------------------------------------

pub struct Bm25Retriever {
    store: Arc<IndexStore>,
    tokenizer: Tokenizer,
    k1: f32,
    b: f32,
    path_boost_weight: f32,
}

impl Bm25Retriever {
    pub fn new(
        store: Arc<IndexStore>,
        tokenizer: Tokenizer,
        k1: f32,
        b: f32,
        path_boost_weight: f32,
    ) -> Self {
        Self {
            store,
            tokenizer,
            k1,
            b,
            path_boost_weight,
        }
    }

    pub fn retrieve(&self, query: &str, k: usize) -> Result<Vec<ScoredChunk>> {
        let query_terms = self.tokenizer.tokenize(query);
        if query_terms.is_empty() || k == 0 {
            return Ok(Vec::new());
        }

        let stats = self.store.get_stats()?;
        if stats.total_chunks == 0 {
            return Ok(Vec::new());
        }
        let n = stats.total_chunks as f32;
        let avgdl = if stats.avg_chunk_len > 0.0 {
            stats.avg_chunk_len as f32
        } else {
            1.0
        };

        let mut scores: HashMap<String, f32> = HashMap::new();
        let mut chunk_cache: HashMap<String, Chunk> = HashMap::new();

        for term in &query_terms {
            let postings = self.store.get_postings(term)?;
            if postings.is_empty() {
                continue;
            }
            let n_term = postings.len() as f32;
            let idf = ((n - n_term + 0.5) / (n_term + 0.5) + 1.0).ln();

            for posting in postings {
                if !chunk_cache.contains_key(&posting.chunk_id) {
                    // postings may briefly outlive their chunk row; skip those
                    match self.store.get_chunk(&posting.chunk_id)? {
                        Some(chunk) => {
                            chunk_cache.insert(posting.chunk_id.clone(), chunk);
                        }
                        None => continue,
                    }
                }
                let Some(chunk) = chunk_cache.get(&posting.chunk_id) else {
                    continue;
                };
                let dl = chunk.tokens.len() as f32;
                let tf = posting.tf as f32;
                let contribution = idf * tf * (self.k1 + 1.0)
                    / (tf + self.k1 * (1.0 - self.b + self.b * dl / avgdl));
                *scores.entry(posting.chunk_id).or_insert(0.0) += contribution;
            }
        }

        if self.path_boost_weight > 0.0 {
            self.apply_path_boost(&query_terms, &chunk_cache, &mut scores)?;
        }

        let mut ranked: Vec<(String, f32)> = scores.into_iter().collect();
        sort_ranked(&mut ranked);
        ranked.truncate(k);

        self.materialize(ranked, &mut chunk_cache)
    }

    /// score · (1 + weight · |path-tokens ∩ query-tokens| / |query-tokens|)
    fn apply_path_boost(
        &self,
        query_terms: &[String],
        chunk_cache: &HashMap<String, Chunk>,
        scores: &mut HashMap<String, f32>,
    ) -> Result<()> {
        let query_set: HashSet<&str> = query_terms.iter().map(String::as_str).collect();
        if query_set.is_empty() {
            return Ok(());
        }

        let mut doc_cache: HashMap<String, Option<Document>> = HashMap::new();
        for (chunk_id, score) in scores.iter_mut() {
            let Some(chunk) = chunk_cache.get(chunk_id) else {
                continue;
            };
            let doc = doc_cache
                .entry(chunk.doc_id.clone())
                .or_insert(self.store.get_document(&chunk.doc_id)?);
            let Some(doc) = doc else { continue };

            let path_tokens = tokenize_path(&doc.path);
            let overlap = path_tokens
                .iter()
                .filter(|t| query_set.contains(t.as_str()))
                .collect::<HashSet<_>>()
                .len();
            if overlap == 0 {
                continue;
            }
            let boost = overlap as f32 / query_set.len() as f32;
            *score *= 1.0 + boost * self.path_boost_weight;
        }
        Ok(())
    }

    fn materialize(
        &self,
        ranked: Vec<(String, f32)>,
        chunk_cache: &mut HashMap<String, Chunk>,
    ) -> Result<Vec<ScoredChunk>> {
        let mut out = Vec::with_capacity(ranked.len());
        for (chunk_id, score) in ranked {
            let chunk = match chunk_cache.remove(&chunk_id) {
                Some(chunk) => chunk,
                None => match self.store.get_chunk(&chunk_id)? {
                    Some(chunk) => chunk,
                    None => continue,
                },
            };
            let Some(text) = self.store.get_chunk_text(&chunk_id)? else {
                continue;
            };
            out.push(ScoredChunk { chunk, text, score });
        }
        Ok(out)
    }
}

/// Path tokens: path split on separators, dots, underscores and hyphens,
/// lowercased, short fragments dropped.
fn tokenize_path(path: &str) -> Vec<String> {
    path.split(['/', '\\', '.', '_', '-'])
        .map(|t| t.to_lowercase())
        .filter(|t| t.chars().count() >= 2)
        .collect()
}

// ---------------------------------------------------------------------------
// Semantic (vector-only) retrieval
// ---------------------------------------------------------------------------

pub struct SemanticRetriever {
    store: Arc<IndexStore>,
    embedder: Arc<dyn Embedder>,
    vectors: Arc<VectorStore>,
}

impl SemanticRetriever {
    pub fn new(
        store: Arc<IndexStore>,
        embedder: Arc<dyn Embedder>,
        vectors: Arc<VectorStore>,
    ) -> Self {
        Self {
            store,
            embedder,
            vectors,
        }
    }

    pub fn retrieve(&self, query: &str, k: usize) -> Result<Vec<ScoredChunk>> {
        if query.trim().is_empty() || k == 0 {
            return Ok(Vec::new());
        }
        let query_vector = self.embedder.embed_query(query)?;
        let hits = self.vectors.search(&query_vector, k)?;

        let mut out = Vec::with_capacity(hits.len());
        for hit in hits {
            // orphaned vectors (chunk deleted, vector not yet pruned) are
            // ignored at search time
            let Some(chunk) = self.store.get_chunk(&hit.chunk_id)? else {
                continue;
            };
            let Some(text) = self.store.get_chunk_text(&hit.chunk_id)? else {
                continue;
            };
            out.push(ScoredChunk {
                chunk,
                text,
                score: hit.score,
            });
        }
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// Hybrid fusion
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FusionStrategy {
    /// Re-score a BM25-restricted candidate set with cosine similarity and
    /// combine weighted min-max-normalized scores. The default.
    RestrictedRescore,
    /// Rank-based reciprocal-rank fusion of both lists.
    RankFusion,
}

pub struct HybridRetriever {
    bm25: Bm25Retriever,
    semantic: Option<SemanticRetriever>,
    embedder: Option<Arc<dyn Embedder>>,
    vectors: Option<Arc<VectorStore>>,
    strategy: FusionStrategy,
    bm25_weight: f32,
    rrf_k: f32,
}

impl HybridRetriever {
    pub fn new(
        store: Arc<IndexStore>,
        bm25: Bm25Retriever,
        embedder: Option<Arc<dyn Embedder>>,
        vectors: Option<Arc<VectorStore>>,
        strategy: FusionStrategy,
        bm25_weight: f32,
        rrf_k: f32,
    ) -> Self {
        let semantic = match (&embedder, &vectors) {
            (Some(e), Some(v)) => Some(SemanticRetriever::new(
                store,
                Arc::clone(e),
                Arc::clone(v),
            )),
            _ => None,
        };
        Self {
            bm25,
            semantic,
            embedder,
            vectors,
            strategy,
            bm25_weight,
            rrf_k,
        }
    }

    pub fn retrieve(&self, query: &str, k: usize) -> Result<Vec<ScoredChunk>> {
        if k == 0 {
            return Ok(Vec::new());
        }
        let (Some(embedder), Some(vectors)) = (&self.embedder, &self.vectors) else {
            return self.bm25.retrieve(query, k);
        };

        let bm25_results = match self.bm25.retrieve(query, self.candidate_k(k)) {
            Ok(results) => results,
            Err(err) => {
                // lexical side down: vector-only if it still works
                tracing::warn!(%err, "bm25 retrieval failed, falling back to vector-only");
                return match &self.semantic {
                    Some(semantic) => semantic.retrieve(query, k),
                    None => Err(err),
                };
            }
        };

        let query_vector = match embedder.embed_query(query) {
            Ok(v) => v,
            Err(err) => {
                tracing::warn!(%err, "embedder unavailable, degrading to bm25-only");
                return Ok(truncated(bm25_results, k));
            }
        };

        match self.strategy {
            FusionStrategy::RestrictedRescore => {
                self.restricted_rescore(bm25_results, &query_vector, vectors, k)
            }
            FusionStrategy::RankFusion => {
                self.rank_fusion(bm25_results, &query_vector, vectors, k)
            }
        }
    }

    fn candidate_k(&self, k: usize) -> usize {
        match self.strategy {
            FusionStrategy::RestrictedRescore => (10 * k).max(50),
            FusionStrategy::RankFusion => (3 * k).max(20),
        }
    }

    /// combined = w · minmax(bm25) + (1 − w) · cosine, over exactly the BM25
    /// candidate set.
    fn restricted_rescore(
        &self,
        bm25_results: Vec<ScoredChunk>,
        query_vector: &[f32],
        vectors: &VectorStore,
        k: usize,
    ) -> Result<Vec<ScoredChunk>> {
        if bm25_results.is_empty() {
            return Ok(bm25_results);
        }

        let ids: HashSet<String> = bm25_results.iter().map(|r| r.chunk.id.clone()).collect();
        let cosine = match vectors.search_subset(query_vector, &ids) {
            Ok(scores) => scores,
            Err(err) => {
                tracing::warn!(%err, "vector scoring failed, degrading to bm25-only");
                return Ok(truncated(bm25_results, k));
            }
        };

        let min = bm25_results
            .iter()
            .map(|r| r.score)
            .fold(f32::INFINITY, f32::min);
        let max = bm25_results
            .iter()
            .map(|r| r.score)
            .fold(f32::NEG_INFINITY, f32::max);
        let span = max - min;

        let mut fused: Vec<ScoredChunk> = bm25_results
            .into_iter()
            .map(|mut r| {
                let normalized = if span > f32::EPSILON {
                    (r.score - min) / span
                } else if max > 0.0 {
                    1.0
                } else {
                    0.0
                };
                let vector_score = cosine.get(&r.chunk.id).copied().unwrap_or(0.0);
                r.score =
                    self.bm25_weight * normalized + (1.0 - self.bm25_weight) * vector_score;
                r
            })
            .collect();

        fused.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.chunk.id.cmp(&b.chunk.id))
        });
        fused.truncate(k);
        Ok(fused)
    }

    /// Σ w/(rrf_k + rank + 1) over both ranked lists.
    fn rank_fusion(
        &self,
        bm25_results: Vec<ScoredChunk>,
        query_vector: &[f32],
        vectors: &VectorStore,
        k: usize,
    ) -> Result<Vec<ScoredChunk>> {
        let candidate_k = self.candidate_k(k);
        let vector_hits = match vectors.search(query_vector, candidate_k) {
            Ok(hits) => hits,
            Err(err) => {
                tracing::warn!(%err, "vector search failed, degrading to bm25-only");
                return Ok(truncated(bm25_results, k));
            }
        };

        let mut fused: HashMap<String, f32> = HashMap::new();
        let mut texts: HashMap<String, ScoredChunk> = HashMap::new();

        for (rank, result) in bm25_results.into_iter().enumerate() {
            let contribution = self.bm25_weight / (self.rrf_k + rank as f32 + 1.0);
            *fused.entry(result.chunk.id.clone()).or_insert(0.0) += contribution;
            texts.insert(result.chunk.id.clone(), result);
        }
        for (rank, hit) in vector_hits.into_iter().enumerate() {
            let contribution = (1.0 - self.bm25_weight) / (self.rrf_k + rank as f32 + 1.0);
            *fused.entry(hit.chunk_id.clone()).or_insert(0.0) += contribution;
        }

        let mut ranked: Vec<(String, f32)> = fused.into_iter().collect();
        sort_ranked(&mut ranked);
        ranked.truncate(k);

        let mut out = Vec::with_capacity(ranked.len());
        for (chunk_id, score) in ranked {
            if let Some(mut result) = texts.remove(&chunk_id) {
                result.score = score;
                out.push(result);
                continue;
            }
            // vector-only id: materialize from the store, skipping orphans
            let Some(chunk) = self.bm25.store.get_chunk(&chunk_id)? else {
                continue;
            };
            let Some(text) = self.bm25.store.get_chunk_text(&chunk_id)? else {
                continue;
            };
            out.push(ScoredChunk { chunk, text, score });
        }
        Ok(out)
    }
}

fn truncated(mut results: Vec<ScoredChunk>, k: usize) -> Vec<ScoredChunk> {
    results.truncate(k);
    results
}

// ---------------------------------------------------------------------------
// Retriever family
// ---------------------------------------------------------------------------

/// Tagged retriever family. Composition (caching, reranking) nests through
/// the boxed `inner` variants.
pub enum Retriever {
    Bm25(Bm25Retriever),
    Hybrid(HybridRetriever),
    Semantic(SemanticRetriever),
    Reranked {
        inner: Box<Retriever>,
        reranker: Arc<dyn Reranker>,
    },
    Cached {
        inner: Box<Retriever>,
        cache: Arc<QueryCache>,
    },
}

impl Retriever {
    pub fn retrieve(&self, query: &str, k: usize) -> Result<Vec<ScoredChunk>> {
        match self {
            Self::Bm25(r) => r.retrieve(query, k),
            Self::Hybrid(r) => r.retrieve(query, k),
            Self::Semantic(r) => r.retrieve(query, k),
            Self::Reranked { inner, reranker } => {
                let candidates = inner.retrieve(query, k)?;
                reranker.rerank(query, candidates)
            }
            Self::Cached { inner, cache } => {
                if let Some(results) = cache.get(query, k) {
                    return Ok(results);
                }
                let results = inner.retrieve(query, k)?;
                cache.put(query, k, results.clone());
                Ok(results)
            }
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Bm25(_) => "bm25",
            Self::Hybrid(_) => "hybrid",
            Self::Semantic(_) => "semantic",
            Self::Reranked { inner, .. } => inner.kind(),
            Self::Cached { inner, .. } => inner.kind(),
        }
    }
}
