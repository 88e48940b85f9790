use crate::chunker::{AstChunker, Chunker, LineChunker};
use crate::config::{store_path, Config};
use crate::embedder::{build_embedder, Embedder};
use crate::error::Result;
use crate::indexer::IndexUseCase;
use crate::mmr::MmrReranker;
use crate::packer::Packer;
use crate::parsers::ParserRegistry;
use crate::query_cache::QueryCache;
use crate::retrieve::RetrieveUseCase;
use crate::retriever::{Bm25Retriever, FusionStrategy, HybridRetriever, Retriever};
use crate::store::IndexStore;
use crate::tokenizer::Tokenizer;
use crate::vector_store::VectorStore;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Everything wired together for one corpus root.
pub struct Pipeline {
    pub config: Config,
    pub store: Arc<IndexStore>,
    pub cache: Option<Arc<QueryCache>>,
    pub retrieve: RetrieveUseCase,
    pub packer: Packer,
    embedder: Option<Arc<dyn Embedder>>,
    vectors: Option<Arc<VectorStore>>,
}

impl Pipeline {
    pub fn indexer(&self) -> IndexUseCase {
        IndexUseCase::new(
            Arc::clone(&self.store),
            build_chunker(&self.config),
            self.config.clone(),
            self.embedder.clone(),
            self.vectors.clone(),
        )
    }
}

pub fn build_chunker(config: &Config) -> Box<dyn Chunker> {
    let tokenizer = Tokenizer::new(config.index.stemming);
    if config.index.ast_chunking {
        Box::new(AstChunker::new(
            ParserRegistry::with_defaults(),
            tokenizer,
            config.index.chunk_tokens,
            config.index.chunk_overlap,
        ))
    } else {
        Box::new(LineChunker::new(
            tokenizer,
            config.index.chunk_tokens,
            config.index.chunk_overlap,
        ))
    }
}

fn build_retriever(
    config: &Config,
    store: &Arc<IndexStore>,
    cache: Option<Arc<QueryCache>>,
    embedder: Option<Arc<dyn Embedder>>,
    vectors: Option<Arc<VectorStore>>,
) -> Retriever {
    let tokenizer = Tokenizer::new(config.index.stemming);
    let bm25 = Bm25Retriever::new(
        Arc::clone(store),
        tokenizer,
        config.search.k1,
        config.search.b,
        config.search.path_boost_weight,
    );

    let base = if config.search.hybrid_enabled {
        Retriever::Hybrid(HybridRetriever::new(
            Arc::clone(store),
            bm25,
            embedder,
            vectors,
            FusionStrategy::RestrictedRescore,
            config.search.bm25_weight,
            config.search.rrf_k,
        ))
    } else {
        Retriever::Bm25(bm25)
    };

    match cache {
        Some(cache) => Retriever::Cached {
            inner: Box::new(base),
            cache,
        },
        None => base,
    }
}

/// Open the store under `<root>/.rag/` and wire the full query pipeline.
///
/// An unavailable embedding provider downgrades to lexical-only retrieval
/// instead of failing the whole pipeline.
pub fn build_pipeline(root: &Path, config: Config) -> Result<Pipeline> {
    let store = Arc::new(IndexStore::open(&store_path(root))?);

    let cache = if config.cache.enabled {
        let cache = Arc::new(QueryCache::new(
            config.cache.capacity,
            Duration::from_secs(config.cache.ttl_secs),
        ));
        store.set_commit_hook(cache.commit_hook());
        Some(cache)
    } else {
        None
    };

    let embedder = match build_embedder(&config.embedding) {
        Ok(embedder) => embedder,
        Err(err) => {
            tracing::warn!(%err, "embedding provider unavailable, lexical-only retrieval");
            None
        }
    };
    let vectors = match &embedder {
        Some(embedder) => Some(Arc::new(VectorStore::open(
            store.database(),
            embedder.dimension(),
        )?)),
        None => None,
    };

    let retriever = build_retriever(&config, &store, cache.clone(), embedder.clone(), vectors.clone());
    let retrieve = RetrieveUseCase::new(
        retriever,
        MmrReranker::new(config.search.mmr_lambda, config.search.dedup_jaccard),
        config.search.min_score_threshold,
    );
    let packer = Packer::new(
        Tokenizer::new(config.index.stemming),
        config.pack.recency_boost,
    );

    Ok(Pipeline {
        config,
        store,
        cache,
        retrieve,
        packer,
        embedder,
        vectors,
    })
}
