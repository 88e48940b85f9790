use crate::config::EmbeddingConfig;
use crate::error::{RagError, Result};
use model2vec_rs::model::StaticModel;
use std::sync::Arc;
use std::time::Duration;

/// Capability surface for query/chunk embedding. External providers must
/// carry explicit timeouts and surface their failures; the retriever treats
/// any error as a signal to degrade to lexical-only results.
pub trait Embedder {
    fn name(&self) -> &'static str;
    fn dimension(&self) -> usize;
    fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        let mut vectors = self.embed(&[text.to_string()])?;
        vectors
            .pop()
            .ok_or_else(|| RagError::ExternalUnavailable("embedder returned no vector".into()))
    }
}

// ---------------------------------------------------------------------------
// Local provider: static embeddings, no network after the model download
// ---------------------------------------------------------------------------

pub struct Model2VecEmbedder {
    model: StaticModel,
    dimension: usize,
}

impl Model2VecEmbedder {
    pub fn new(model_id: &str) -> Result<Self> {
        let model = StaticModel::from_pretrained(model_id, None, None, None)
            .map_err(|e| RagError::ExternalUnavailable(format!("load model {model_id}: {e}")))?;
        // The hub config decides the output width; probe once instead of
        // trusting the configured dimension.
        let dimension = model.encode_single("dimension probe").len();
        Ok(Self { model, dimension })
    }
}

impl Embedder for Model2VecEmbedder {
    fn name(&self) -> &'static str {
        "local"
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts
            .iter()
            .map(|t| self.model.encode_single(t))
            .collect())
    }
}

// ---------------------------------------------------------------------------
// HTTP provider: OpenAI-compatible embeddings endpoint
// ---------------------------------------------------------------------------

pub struct HttpEmbedder {
    agent: ureq::Agent,
    endpoint: String,
    model: String,
    api_key: Option<String>,
    dimension: usize,
}

impl HttpEmbedder {
    /// The API key is read from the environment variable named in config;
    /// a missing key is tolerated here so local endpoints keep working.
    pub fn from_config(cfg: &EmbeddingConfig) -> Self {
        let timeout = Duration::from_secs(cfg.timeout_secs.max(1));
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(timeout)
            .timeout(timeout)
            .build();
        Self {
            agent,
            endpoint: cfg.endpoint.clone(),
            model: cfg.model.clone(),
            api_key: std::env::var(&cfg.api_key_env).ok(),
            dimension: cfg.dimension,
        }
    }
}

impl Embedder for HttpEmbedder {
    fn name(&self) -> &'static str {
        "http"
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut request = self
            .agent
            .post(&self.endpoint)
            .set("Content-Type", "application/json");
        if let Some(key) = &self.api_key {
            request = request.set("Authorization", &format!("Bearer {key}"));
        }

        let response = request
            .send_json(serde_json::json!({
                "model": self.model,
                "input": texts,
            }))
            .map_err(|e| RagError::ExternalUnavailable(format!("embeddings request: {e}")))?;

        let body: serde_json::Value = response
            .into_json()
            .map_err(|e| RagError::ExternalUnavailable(format!("embeddings response: {e}")))?;

        let data = body
            .get("data")
            .and_then(|d| d.as_array())
            .ok_or_else(|| {
                RagError::ExternalUnavailable("embeddings response missing data array".into())
            })?;

        let mut vectors = Vec::with_capacity(data.len());
        for item in data {
            let vector: Vec<f32> = item
                .get("embedding")
                .and_then(|e| e.as_array())
                .map(|values| {
                    values
                        .iter()
                        .filter_map(|v| v.as_f64())
                        .map(|v| v as f32)
                        .collect()
                })
                .ok_or_else(|| {
                    RagError::ExternalUnavailable("embeddings response missing vector".into())
                })?;
            if vector.len() != self.dimension {
                return Err(RagError::DimensionMismatch {
                    expected: self.dimension,
                    actual: vector.len(),
                });
            }
            vectors.push(vector);
        }
        if vectors.len() != texts.len() {
            return Err(RagError::ExternalUnavailable(format!(
                "embeddings response returned {} vectors for {} inputs",
                vectors.len(),
                texts.len()
            )));
        }
        Ok(vectors)
    }
}

/// Build the configured provider, or `None` when embeddings are disabled.
pub fn build_embedder(cfg: &EmbeddingConfig) -> Result<Option<Arc<dyn Embedder>>> {
    if !cfg.enabled {
        return Ok(None);
    }
    match cfg.provider.as_str() {
        "local" => Ok(Some(Arc::new(Model2VecEmbedder::new(&cfg.model)?))),
        "openai" | "http" => Ok(Some(Arc::new(HttpEmbedder::from_config(cfg)))),
        other => Err(RagError::ConfigMismatch(format!(
            "unknown embedding provider: {other}"
        ))),
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Deterministic embedder for tests: hashes tokens into a fixed number of
    /// buckets so related texts land near each other without any model.
    pub struct StubEmbedder {
        pub dimension: usize,
    }

    impl Embedder for StubEmbedder {
        fn name(&self) -> &'static str {
            "stub"
        }

        fn dimension(&self) -> usize {
            self.dimension
        }

        fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Ok(texts
                .iter()
                .map(|text| {
                    let mut v = vec![0.0f32; self.dimension];
                    for token in text.split_whitespace() {
                        let mut h: u64 = 1469598103934665603;
                        for b in token.to_lowercase().bytes() {
                            h ^= b as u64;
                            h = h.wrapping_mul(1099511628211);
                        }
                        v[(h % self.dimension as u64) as usize] += 1.0;
                    }
                    v
                })
                .collect())
        }
    }

    /// Embedder that always fails, for degradation tests.
    pub struct BrokenEmbedder;

    impl Embedder for BrokenEmbedder {
        fn name(&self) -> &'static str {
            "broken"
        }

        fn dimension(&self) -> usize {
            4
        }

        fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Err(RagError::ExternalUnavailable("stub outage".into()))
        }
    }
}
