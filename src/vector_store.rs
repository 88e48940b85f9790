use crate::error::{RagError, Result};
use redb::{Database, ReadableTable};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, RwLock};

use crate::store::VECTORS;

/// One stored embedding: fixed-dimension vector plus free-form metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorItem {
    pub vector: Vec<f32>,
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct VectorHit {
    pub chunk_id: String,
    pub score: f32,
    pub metadata: BTreeMap<String, String>,
}

/// Exact-cosine vector store keyed by chunk id.
///
/// Persists into the `vectors` namespace of the shared index database and
/// keeps an in-memory mirror for scoring. The mirror is guarded by a single
/// reader-writer lock: upsert/delete take the writer, searches the reader.
/// Entries are expected to reference chunks present in the index store;
/// orphans are simply never asked for at search time.
pub struct VectorStore {
    db: Arc<Database>,
    dimension: usize,
    mirror: RwLock<HashMap<String, VectorItem>>,
}

impl VectorStore {
    /// Load the mirror from the shared database. Entries whose dimension
    /// disagrees with the declared one (e.g. after an embedding model swap
    /// that skipped the rebuild path) are dropped from the mirror and logged.
    pub fn open(db: Arc<Database>, dimension: usize) -> Result<Self> {
        let mut mirror = HashMap::new();
        {
            let txn = db.begin_read()?;
            let table = txn.open_table(VECTORS)?;
            for item in table.iter()? {
                let (key, value) = item?;
                let entry: VectorItem = bincode::deserialize(value.value())?;
                if entry.vector.len() != dimension {
                    tracing::warn!(
                        chunk_id = key.value(),
                        stored = entry.vector.len(),
                        declared = dimension,
                        "skipping vector with stale dimension"
                    );
                    continue;
                }
                mirror.insert(key.value().to_string(), entry);
            }
        }

        Ok(Self {
            db,
            dimension,
            mirror: RwLock::new(mirror),
        })
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn count(&self) -> usize {
        self.mirror.read().map(|m| m.len()).unwrap_or(0)
    }

    /// Insert or replace vectors. All dimensions are validated before any
    /// write happens, so a mismatch leaves both the database and the mirror
    /// untouched.
    pub fn upsert(&self, items: Vec<(String, Vec<f32>, BTreeMap<String, String>)>) -> Result<()> {
        if items.is_empty() {
            return Ok(());
        }
        for (_, vector, _) in &items {
            if vector.len() != self.dimension {
                return Err(RagError::DimensionMismatch {
                    expected: self.dimension,
                    actual: vector.len(),
                });
            }
        }

        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(VECTORS)?;
            for (id, vector, metadata) in &items {
                let entry = VectorItem {
                    vector: vector.clone(),
                    metadata: metadata.clone(),
                };
                table.insert(id.as_str(), bincode::serialize(&entry)?.as_slice())?;
            }
        }
        txn.commit()?;

        if let Ok(mut mirror) = self.mirror.write() {
            for (id, vector, metadata) in items {
                mirror.insert(id, VectorItem { vector, metadata });
            }
        }
        Ok(())
    }

    /// Exact cosine top-k over the whole mirror; ties break arbitrarily.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<VectorHit>> {
        if query.len() != self.dimension {
            return Err(RagError::DimensionMismatch {
                expected: self.dimension,
                actual: query.len(),
            });
        }
        let mirror = self
            .mirror
            .read()
            .map_err(|_| RagError::Storage("vector mirror lock poisoned".to_string()))?;

        let mut hits: Vec<VectorHit> = mirror
            .iter()
            .map(|(id, item)| VectorHit {
                chunk_id: id.clone(),
                score: cosine_similarity(query, &item.vector),
                metadata: item.metadata.clone(),
            })
            .collect();

        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(k);
        Ok(hits)
    }

    /// Cosine scores for exactly the given ids; ids unknown to the store
    /// score 0.
    pub fn search_subset(&self, query: &[f32], ids: &HashSet<String>) -> Result<HashMap<String, f32>> {
        if query.len() != self.dimension {
            return Err(RagError::DimensionMismatch {
                expected: self.dimension,
                actual: query.len(),
            });
        }
        let mirror = self
            .mirror
            .read()
            .map_err(|_| RagError::Storage("vector mirror lock poisoned".to_string()))?;

        let mut scores = HashMap::with_capacity(ids.len());
        for id in ids {
            let score = mirror
                .get(id)
                .map(|item| cosine_similarity(query, &item.vector))
                .unwrap_or(0.0);
            scores.insert(id.clone(), score);
        }
        Ok(scores)
    }

    pub fn delete(&self, ids: &HashSet<String>) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(VECTORS)?;
            for id in ids {
                table.remove(id.as_str())?;
            }
        }
        txn.commit()?;

        if let Ok(mut mirror) = self.mirror.write() {
            for id in ids {
                mirror.remove(id);
            }
        }
        Ok(())
    }
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::IndexStore;

    fn open_vectors(dim: usize) -> (tempfile::TempDir, VectorStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = IndexStore::open(&dir.path().join("index.db")).unwrap();
        let vectors = VectorStore::open(store.database(), dim).unwrap();
        (dir, vectors)
    }

    fn item(id: &str, vector: Vec<f32>) -> (String, Vec<f32>, BTreeMap<String, String>) {
        (id.to_string(), vector, BTreeMap::new())
    }

    #[test]
    fn cosine_basics() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
    }

    #[test]
    fn search_ranks_by_cosine() {
        let (_dir, vectors) = open_vectors(2);
        vectors
            .upsert(vec![
                item("aligned", vec![1.0, 0.0]),
                item("diagonal", vec![1.0, 1.0]),
                item("orthogonal", vec![0.0, 1.0]),
            ])
            .unwrap();

        let hits = vectors.search(&[1.0, 0.0], 2).unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].chunk_id, "aligned");
        assert_eq!(hits[1].chunk_id, "diagonal");
        assert!(hits[0].score > hits[1].score);
    }

    #[test]
    fn dimension_mismatch_rejects_whole_upsert() {
        let (_dir, vectors) = open_vectors(3);
        let err = vectors
            .upsert(vec![
                item("ok", vec![1.0, 0.0, 0.0]),
                item("bad", vec![1.0, 0.0]),
            ])
            .unwrap_err();
        assert!(matches!(
            err,
            RagError::DimensionMismatch {
                expected: 3,
                actual: 2
            }
        ));
        // no partial write
        assert_eq!(vectors.count(), 0);
    }

    #[test]
    fn subset_scores_missing_ids_as_zero() {
        let (_dir, vectors) = open_vectors(2);
        vectors.upsert(vec![item("known", vec![1.0, 0.0])]).unwrap();

        let ids: HashSet<String> = ["known".to_string(), "ghost".to_string()].into();
        let scores = vectors.search_subset(&[1.0, 0.0], &ids).unwrap();
        assert!((scores["known"] - 1.0).abs() < 1e-6);
        assert_eq!(scores["ghost"], 0.0);
    }

    #[test]
    fn upsert_replaces_and_delete_removes() {
        let (_dir, vectors) = open_vectors(2);
        vectors.upsert(vec![item("a", vec![1.0, 0.0])]).unwrap();
        vectors.upsert(vec![item("a", vec![0.0, 1.0])]).unwrap();
        assert_eq!(vectors.count(), 1);

        let hits = vectors.search(&[0.0, 1.0], 1).unwrap();
        assert!((hits[0].score - 1.0).abs() < 1e-6);

        vectors.delete(&["a".to_string()].into()).unwrap();
        assert_eq!(vectors.count(), 0);
    }

    #[test]
    fn persisted_vectors_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.db");
        {
            let store = IndexStore::open(&path).unwrap();
            let vectors = VectorStore::open(store.database(), 2).unwrap();
            vectors.upsert(vec![item("a", vec![0.5, 0.5])]).unwrap();
        }
        let store = IndexStore::open(&path).unwrap();
        let vectors = VectorStore::open(store.database(), 2).unwrap();
        assert_eq!(vectors.count(), 1);
    }
}
