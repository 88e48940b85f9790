use crate::error::Result;
use crate::retriever::ScoredChunk;
use crate::store::{Document, IndexStore};
use crate::tokenizer::Tokenizer;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

const SECONDS_PER_DAY: f32 = 86_400.0;
const MAX_AGE_DAYS: f32 = 30.0;

/// One cited snippet of the evidence pack.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snippet {
    pub path: String,
    /// `"L<start>-<end>"`, 1-based inclusive.
    pub range: String,
    /// Short provenance string (retrieval stage + score).
    pub why: String,
    pub text: String,
}

/// The evidence pack: bounded snippet set with citations, serialized as the
/// JSON wire format consumed downstream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackedContext {
    pub query: String,
    pub budget_tokens: usize,
    pub used_tokens: usize,
    pub snippets: Vec<Snippet>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub open_questions: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assumptions: Option<Vec<String>>,
}

impl PackedContext {
    fn empty(query: &str, budget_tokens: usize) -> Self {
        Self {
            query: query.to_string(),
            budget_tokens,
            used_tokens: 0,
            snippets: Vec::new(),
            open_questions: None,
            assumptions: None,
        }
    }
}

struct PackCandidate {
    chunk: ScoredChunk,
    doc_path: String,
    tokens: usize,
    utility: f32,
}

struct MergedSnippet {
    doc_id: String,
    doc_path: String,
    start_line: u32,
    end_line: u32,
    score: f32,
    text: String,
}

/// Greedy utility knapsack under a token budget, with adjacency merging and
/// a recency boost for freshly modified documents.
pub struct Packer {
    tokenizer: Tokenizer,
    recency_boost: f32,
}

impl Packer {
    pub fn new(tokenizer: Tokenizer, recency_boost: f32) -> Self {
        Self {
            tokenizer,
            recency_boost,
        }
    }

    /// `provenance` labels the retrieval stage for snippet citations.
    pub fn pack(
        &self,
        store: &IndexStore,
        query: &str,
        candidates: Vec<ScoredChunk>,
        budget_tokens: usize,
        provenance: &str,
    ) -> Result<PackedContext> {
        if candidates.is_empty() || budget_tokens == 0 {
            return Ok(PackedContext::empty(query, budget_tokens));
        }

        // resolve document rows once per doc; chunks with no document row
        // cannot be cited and are dropped
        let mut docs: HashMap<String, Document> = HashMap::new();
        for c in &candidates {
            if !docs.contains_key(&c.chunk.doc_id) {
                match store.get_document(&c.chunk.doc_id)? {
                    Some(doc) => {
                        docs.insert(c.chunk.doc_id.clone(), doc);
                    }
                    None => {
                        tracing::warn!(chunk = %c.chunk.id, "dropping chunk with no document row");
                    }
                }
            }
        }

        let max_mtime = docs.values().map(|d| d.mtime).max().unwrap_or(0);

        let mut pool: Vec<PackCandidate> = candidates
            .into_iter()
            .filter_map(|c| {
                let doc = docs.get(&c.chunk.doc_id)?;
                let tokens = self.tokenizer.count_tokens(&c.text).max(1);
                let factor = self.recency_factor(max_mtime, doc.mtime);
                Some(PackCandidate {
                    utility: c.score * factor / tokens as f32,
                    doc_path: doc.path.clone(),
                    tokens,
                    chunk: c,
                })
            })
            .collect();

        pool.sort_by(|a, b| {
            b.utility
                .partial_cmp(&a.utility)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.chunk.chunk.id.cmp(&b.chunk.chunk.id))
        });

        // greedy selection: over-budget candidates are skipped, not terminal
        let mut used = 0usize;
        let mut selected: Vec<PackCandidate> = Vec::new();
        for candidate in pool {
            if used + candidate.tokens <= budget_tokens {
                used += candidate.tokens;
                selected.push(candidate);
            }
        }
        if selected.is_empty() {
            return Ok(PackedContext::empty(query, budget_tokens));
        }

        let mut merged = merge_adjacent(selected);
        merged.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| (a.doc_id.as_str(), a.start_line).cmp(&(b.doc_id.as_str(), b.start_line)))
        });

        let used_tokens = merged
            .iter()
            .map(|m| self.tokenizer.count_tokens(&m.text).max(1))
            .sum();

        let snippets = merged
            .into_iter()
            .map(|m| Snippet {
                path: m.doc_path,
                range: format!("L{}-{}", m.start_line, m.end_line),
                why: format!("{} score {:.3}", provenance, m.score),
                text: m.text,
            })
            .collect();

        Ok(PackedContext {
            query: query.to_string(),
            budget_tokens,
            used_tokens,
            snippets,
            open_questions: None,
            assumptions: None,
        })
    }

    /// 1 + boost·(1 − age) − boost·age, with age normalized into [0, 1] over
    /// a 30-day window against the most recent document in the candidate set.
    fn recency_factor(&self, max_mtime: i64, mtime: i64) -> f32 {
        if self.recency_boost <= 0.0 {
            return 1.0;
        }
        let age_days = ((max_mtime - mtime) as f32 / SECONDS_PER_DAY).clamp(0.0, MAX_AGE_DAYS);
        let normalized = age_days / MAX_AGE_DAYS;
        1.0 + self.recency_boost * (1.0 - normalized) - self.recency_boost * normalized
    }
}

/// Merge selected chunks of the same document whose ranges touch or overlap
/// (`start ≤ prev_end + 1`): texts join with a newline, the range extends,
/// the better score wins.
fn merge_adjacent(selected: Vec<PackCandidate>) -> Vec<MergedSnippet> {
    let mut by_doc: HashMap<String, Vec<PackCandidate>> = HashMap::new();
    for candidate in selected {
        by_doc
            .entry(candidate.chunk.chunk.doc_id.clone())
            .or_default()
            .push(candidate);
    }

    let mut merged = Vec::new();
    for (doc_id, mut group) in by_doc {
        group.sort_by_key(|c| c.chunk.chunk.start_line);

        let mut iter = group.into_iter();
        let Some(first) = iter.next() else { continue };
        let mut current = MergedSnippet {
            doc_id: doc_id.clone(),
            doc_path: first.doc_path.clone(),
            start_line: first.chunk.chunk.start_line,
            end_line: first.chunk.chunk.end_line,
            score: first.chunk.score,
            text: first.chunk.text,
        };

        for candidate in iter {
            let chunk = &candidate.chunk.chunk;
            if chunk.start_line <= current.end_line + 1 {
                current.end_line = current.end_line.max(chunk.end_line);
                current.score = current.score.max(candidate.chunk.score);
                current.text.push('\n');
                current.text.push_str(&candidate.chunk.text);
            } else {
                merged.push(current);
                current = MergedSnippet {
                    doc_id: doc_id.clone(),
                    doc_path: candidate.doc_path.clone(),
                    start_line: chunk.start_line,
                    end_line: chunk.end_line,
                    score: candidate.chunk.score,
                    text: candidate.chunk.text,
                };
            }
        }
        merged.push(current);
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Chunk;
    use std::path::Path;

    fn store_with_docs(docs: &[(&str, i64)]) -> (tempfile::TempDir, IndexStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = IndexStore::open(&dir.path().join("index.db")).unwrap();
        for (path, mtime) in docs {
            store
                .put_document(&Document {
                    id: Document::id_for_path(Path::new(path)),
                    path: path.to_string(),
                    mtime: *mtime,
                    language: "unknown".to_string(),
                    content_hash: 0,
                })
                .unwrap();
        }
        (dir, store)
    }

    fn scored(path: &str, start: u32, end: u32, score: f32, text: &str) -> ScoredChunk {
        let doc_id = Document::id_for_path(Path::new(path));
        ScoredChunk {
            chunk: Chunk {
                id: Chunk::window_id(&doc_id, start, end),
                doc_id,
                start_line: start,
                end_line: end,
                tokens: text.split_whitespace().map(str::to_string).collect(),
            },
            text: text.to_string(),
            score,
        }
    }

    fn packer() -> Packer {
        Packer::new(Tokenizer::new(false), 0.0)
    }

    #[test]
    fn empty_candidates_return_empty_pack_with_budget() {
        let (_dir, store) = store_with_docs(&[]);
        let ctx = packer().pack(&store, "query", Vec::new(), 500, "bm25").unwrap();
        assert_eq!(ctx.budget_tokens, 500);
        assert_eq!(ctx.used_tokens, 0);
        assert!(ctx.snippets.is_empty());
    }

    #[test]
    fn adjacent_chunks_merge_into_one_snippet_with_max_score() {
        let (_dir, store) = store_with_docs(&[("/c/a.rs", 100)]);
        let candidates = vec![
            scored("/c/a.rs", 1, 10, 1.0, "first part here"),
            scored("/c/a.rs", 11, 20, 0.9, "second part here"),
        ];
        let ctx = packer().pack(&store, "q", candidates, 1000, "bm25").unwrap();

        assert_eq!(ctx.snippets.len(), 1);
        assert_eq!(ctx.snippets[0].range, "L1-20");
        assert!(ctx.snippets[0].why.contains("1.000"));
        assert_eq!(ctx.snippets[0].text, "first part here\nsecond part here");
        assert!(ctx.used_tokens <= ctx.budget_tokens);
    }

    #[test]
    fn non_adjacent_chunks_stay_separate() {
        let (_dir, store) = store_with_docs(&[("/c/a.rs", 100)]);
        let candidates = vec![
            scored("/c/a.rs", 1, 10, 1.0, "first part"),
            scored("/c/a.rs", 30, 40, 0.9, "distant part"),
        ];
        let ctx = packer().pack(&store, "q", candidates, 1000, "bm25").unwrap();
        assert_eq!(ctx.snippets.len(), 2);
        assert_eq!(ctx.snippets[0].range, "L1-10");
        assert_eq!(ctx.snippets[1].range, "L30-40");
    }

    #[test]
    fn budget_is_a_hard_ceiling_and_oversized_candidates_are_skipped() {
        let (_dir, store) = store_with_docs(&[("/c/a.rs", 100), ("/c/b.rs", 100)]);
        let big = (0..200).map(|i| format!("w{i}")).collect::<Vec<_>>().join(" ");
        let candidates = vec![
            scored("/c/a.rs", 1, 50, 1.0, &big),   // ~260 tokens, over budget
            scored("/c/b.rs", 1, 3, 0.5, "small useful snippet"),
        ];
        let ctx = packer().pack(&store, "q", candidates, 50, "bm25").unwrap();

        assert_eq!(ctx.snippets.len(), 1, "oversized candidate must be skipped");
        assert!(ctx.snippets[0].text.contains("small"));
        assert!(ctx.used_tokens <= 50);
    }

    #[test]
    fn everything_over_budget_yields_zero_snippets() {
        let (_dir, store) = store_with_docs(&[("/c/a.rs", 100)]);
        let big = (0..100).map(|i| format!("w{i}")).collect::<Vec<_>>().join(" ");
        let ctx = packer()
            .pack(&store, "q", vec![scored("/c/a.rs", 1, 9, 1.0, &big)], 10, "bm25")
            .unwrap();
        assert!(ctx.snippets.is_empty());
        assert_eq!(ctx.used_tokens, 0);
        assert_eq!(ctx.budget_tokens, 10);
    }

    #[test]
    fn snippets_come_back_ordered_by_score() {
        let (_dir, store) = store_with_docs(&[("/c/a.rs", 100), ("/c/b.rs", 100)]);
        let candidates = vec![
            scored("/c/a.rs", 1, 5, 0.4, "weaker evidence text"),
            scored("/c/b.rs", 1, 5, 0.9, "stronger evidence text"),
        ];
        let ctx = packer().pack(&store, "q", candidates, 1000, "bm25").unwrap();
        assert_eq!(ctx.snippets.len(), 2);
        assert!(ctx.snippets[0].text.contains("stronger"));
    }

    #[test]
    fn recency_boost_prefers_fresher_documents() {
        let now = 1_700_000_000i64;
        let month = 30 * 86_400i64;
        let (_dir, store) = store_with_docs(&[("/c/old.rs", now - month), ("/c/new.rs", now)]);

        // same score and size: only recency can break the tie
        let candidates = vec![
            scored("/c/old.rs", 1, 5, 1.0, "five words of old text"),
            scored("/c/new.rs", 1, 5, 1.0, "five words of new text"),
        ];
        // budget fits exactly one candidate
        let packer = Packer::new(Tokenizer::new(false), 0.5);
        let ctx = packer.pack(&store, "q", candidates, 6, "bm25").unwrap();

        assert_eq!(ctx.snippets.len(), 1);
        assert!(ctx.snippets[0].text.contains("new"));
    }

    #[test]
    fn wire_format_matches_the_contract() {
        let (_dir, store) = store_with_docs(&[("/c/a.rs", 100)]);
        let ctx = packer()
            .pack(
                &store,
                "how does parsing work",
                vec![scored("/c/a.rs", 3, 9, 0.7, "parse all the things")],
                100,
                "hybrid",
            )
            .unwrap();

        let json = serde_json::to_value(&ctx).unwrap();
        assert_eq!(json["query"], "how does parsing work");
        assert_eq!(json["budget_tokens"], 100);
        assert_eq!(json["snippets"][0]["range"], "L3-9");
        assert_eq!(json["snippets"][0]["path"], "/c/a.rs");
        assert!(json["snippets"][0]["why"]
            .as_str()
            .unwrap()
            .starts_with("hybrid"));
        assert!(json.get("open_questions").is_none());
    }
}
