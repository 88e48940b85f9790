use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

/// Hard safety ceiling: files larger than this are **always** skipped,
/// regardless of config. Protects low-RAM machines from tokenizing a 10 MB
/// minified bundle.
pub const ABSOLUTE_MAX_FILE_BYTES: u64 = 4_000_000;

/// Controls document chunking and the analysis chain applied at index time.
///
/// Every field here except `max_file_bytes` participates in the index config
/// fingerprint: changing one invalidates the on-disk index.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    /// Target chunk size in estimated tokens.
    pub chunk_tokens: usize,
    /// Estimated tokens shared between consecutive chunks of a document.
    pub chunk_overlap: usize,
    /// Apply English Porter stemming to index and query terms.
    pub stemming: bool,
    /// Route supported languages through the AST chunker instead of the
    /// line-window chunker.
    pub ast_chunking: bool,
    /// Files larger than this are skipped by the walker.
    pub max_file_bytes: u64,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            chunk_tokens: 320,
            chunk_overlap: 48,
            stemming: true,
            ast_chunking: false,
            max_file_bytes: 512 * 1024,
        }
    }
}

/// Retrieval-time knobs: BM25 parameters, hybrid fusion, MMR diversification.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    /// BM25 term-frequency saturation.
    pub k1: f32,
    /// BM25 document-length normalization.
    pub b: f32,
    /// Additive boost for query terms appearing in the document path;
    /// 0 disables the boost entirely.
    pub path_boost_weight: f32,
    pub top_k: usize,
    /// MMR relevance/diversity trade-off (1.0 = pure relevance).
    pub mmr_lambda: f32,
    /// Hard dedup: candidates above this Jaccard similarity versus any
    /// already-selected candidate are dropped.
    pub dedup_jaccard: f32,
    /// Fuse BM25 with vector scores when an embedder is configured.
    pub hybrid_enabled: bool,
    /// Rank constant for reciprocal-rank fusion.
    pub rrf_k: f32,
    /// BM25 share of the fused score (the vector side gets `1 - bm25_weight`).
    pub bm25_weight: f32,
    /// Results scoring below this after diversification are dropped.
    pub min_score_threshold: f32,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            k1: 1.2,
            b: 0.75,
            path_boost_weight: 0.2,
            top_k: 12,
            mmr_lambda: 0.7,
            dedup_jaccard: 0.92,
            hybrid_enabled: false,
            rrf_k: 60.0,
            bm25_weight: 0.6,
            min_score_threshold: 0.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PackConfig {
    /// Default token budget for the evidence pack.
    pub token_budget: usize,
    /// Multiplicative utility boost for chunks from recently modified
    /// documents; 0 disables recency weighting.
    pub recency_boost: f32,
}

impl Default for PackConfig {
    fn default() -> Self {
        Self {
            token_budget: 6_000,
            recency_boost: 0.25,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    pub capacity: usize,
    pub ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            capacity: 128,
            ttl_secs: 300,
        }
    }
}

/// Embedding provider settings. The API key for remote providers is read from
/// the environment variable named in `api_key_env`; the core never hard-codes
/// secrets.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub enabled: bool,
    /// `"local"` (model2vec static embeddings) or `"openai"` (HTTP endpoint
    /// speaking the OpenAI embeddings shape).
    pub provider: String,
    /// Model repo ID (local) or remote model name.
    pub model: String,
    /// Vector dimension of the store. For the local provider the model's
    /// actual output dimension wins.
    pub dimension: usize,
    pub batch_size: usize,
    pub api_key_env: String,
    pub endpoint: String,
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            provider: "local".to_string(),
            model: "minishlab/potion-retrieval-32M".to_string(),
            dimension: 256,
            batch_size: 16,
            api_key_env: "RAGPACK_API_KEY".to_string(),
            endpoint: "https://api.openai.com/v1/embeddings".to_string(),
            timeout_secs: 30,
        }
    }
}

/// Controls corpus walking (what to index).
///
/// `.gitignore` is always respected by the walker; these are additional glob
/// filters applied to repo-relative paths.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct WalkConfig {
    /// When non-empty, only files matching at least one glob are indexed.
    pub include: Vec<String>,
    /// Files matching any of these globs are skipped.
    pub exclude: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub index: IndexConfig,
    pub search: SearchConfig,
    pub pack: PackConfig,
    pub cache: CacheConfig,
    pub embedding: EmbeddingConfig,
    pub walk: WalkConfig,
}

impl Config {
    /// Fingerprint over the index-relevant config subset: first 8 bytes of
    /// SHA-256 over a canonical `key=value` serialization, hex-encoded.
    ///
    /// Deliberately excludes retrieval-only knobs (path boost, MMR, packing):
    /// changing those never forces a rebuild.
    pub fn fingerprint(&self) -> String {
        let canonical = format!(
            "stemming={}\nchunk_tokens={}\nchunk_overlap={}\nk1={}\nb={}\nast_chunking={}\nembedding_enabled={}\nembedding_provider={}\nembedding_model={}\n",
            self.index.stemming,
            self.index.chunk_tokens,
            self.index.chunk_overlap,
            self.search.k1,
            self.search.b,
            self.index.ast_chunking,
            self.embedding.enabled,
            self.embedding.provider,
            self.embedding.model,
        );
        short_sha256(canonical.as_bytes())
    }
}

/// First 8 bytes of SHA-256, hex-encoded (16 chars). Shared by document ids
/// and config fingerprints.
pub fn short_sha256(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    digest[..8].iter().map(|b| format!("{b:02x}")).collect()
}

/// Location of the index database under a corpus root.
pub fn store_path(root: &Path) -> PathBuf {
    root.join(".rag").join("index.db")
}

const CONFIG_FILE: &str = ".ragpack.yaml";

/// Load `<root>/.ragpack.yaml`; any failure (missing file, bad YAML) yields
/// the defaults so a bare corpus works out of the box.
pub fn load_config(root: &Path) -> Config {
    let path = root.join(CONFIG_FILE);
    let Ok(text) = std::fs::read_to_string(&path) else {
        return Config::default();
    };

    match serde_yaml::from_str::<Config>(&text) {
        Ok(cfg) => cfg,
        Err(err) => {
            tracing::warn!(path = %path.display(), %err, "invalid config, using defaults");
            Config::default()
        }
    }
}
