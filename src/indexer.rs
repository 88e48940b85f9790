use crate::chunker::Chunker;
use crate::config::Config;
use crate::embedder::Embedder;
use crate::error::Result;
use crate::language::detect_language;
use crate::scanner::{scan_corpus, FileEntry, ScanOptions};
use crate::store::{BatchFile, Document, DocumentChunk, IndexStore, CURRENT_SCHEMA_VERSION};
use crate::vector_store::VectorStore;
use rayon::prelude::*;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use xxhash_rust::xxh3::xxh3_64;

/// Counters reported after an index run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexOutcome {
    pub indexed: usize,
    pub skipped: usize,
    pub deleted: usize,
    pub total_files: usize,
    pub cancelled: bool,
}

/// Progress callback: (processed, total, current path). Invoked at least once
/// per walked file.
pub type ProgressFn<'a> = dyn FnMut(usize, usize, &str) + 'a;

enum Delta {
    /// Stored mtime is current, or content proved unchanged; nothing to do.
    Unchanged,
    /// mtime moved but the content hash matches: refresh the stored mtime
    /// without re-chunking.
    Touched(Document),
    /// New or modified content to chunk and commit.
    Dirty(PreparedFile),
}

struct PreparedFile {
    batch: BatchFile,
    replaced_chunk_ids: Vec<String>,
}

/// Walk → delta detection → per-file chunk/post/commit → stale-doc deletion →
/// stats and schema update.
///
/// The read/tokenize/chunk phase runs on the rayon pool; commits stay on the
/// calling thread, one transaction per file, with the cancellation flag
/// checked between commits (never inside a file's transaction).
pub struct IndexUseCase {
    store: Arc<IndexStore>,
    chunker: Box<dyn Chunker>,
    config: Config,
    embedder: Option<Arc<dyn Embedder>>,
    vectors: Option<Arc<VectorStore>>,
}

impl IndexUseCase {
    pub fn new(
        store: Arc<IndexStore>,
        chunker: Box<dyn Chunker>,
        config: Config,
        embedder: Option<Arc<dyn Embedder>>,
        vectors: Option<Arc<VectorStore>>,
    ) -> Self {
        Self {
            store,
            chunker,
            config,
            embedder,
            vectors,
        }
    }

    pub fn run(
        &self,
        root: &Path,
        cancel: Option<&AtomicBool>,
        progress: &mut ProgressFn<'_>,
    ) -> Result<IndexOutcome> {
        let entries = scan_corpus(&ScanOptions {
            root: root.to_path_buf(),
            max_file_bytes: self.config.index.max_file_bytes,
            walk: self.config.walk.clone(),
        })?;
        let total = entries.len();

        let existing: HashMap<String, Document> = self
            .store
            .list_documents()?
            .into_iter()
            .map(|d| (d.path.clone(), d))
            .collect();
        let walked_paths: HashSet<String> = entries
            .iter()
            .map(|e| e.abs_path.to_string_lossy().into_owned())
            .collect();

        let mut outcome = IndexOutcome {
            total_files: total,
            ..IndexOutcome::default()
        };

        // read + hash + tokenize + chunk in parallel; order is preserved.
        // Only Sync pieces cross into the pool; the embedder stays out.
        let store = self.store.as_ref();
        let chunker = self.chunker.as_ref();
        let deltas: Vec<(PathBuf, Delta)> = entries
            .par_iter()
            .map(|entry| {
                let delta = prepare(store, entry, &existing, chunker);
                (entry.abs_path.clone(), delta)
            })
            .collect();

        // serialized commit phase, one transaction per file
        let mut cancelled = false;
        for (processed, (path, delta)) in deltas.into_iter().enumerate() {
            let display = path.to_string_lossy();
            progress(processed + 1, total, &display);

            if let Some(flag) = cancel {
                if flag.load(Ordering::Relaxed) {
                    cancelled = true;
                    break;
                }
            }

            match delta {
                Delta::Unchanged => outcome.skipped += 1,
                Delta::Touched(doc) => {
                    self.store.put_document(&doc)?;
                    outcome.skipped += 1;
                }
                Delta::Dirty(prepared) => {
                    self.commit_file(prepared)?;
                    outcome.indexed += 1;
                }
            }
        }

        // deleting documents on a partial walk would drop files that were
        // simply never reached
        if !cancelled {
            for (path, doc) in &existing {
                if walked_paths.contains(path) {
                    continue;
                }
                let stale_chunks: Vec<String> = self
                    .store
                    .get_chunks_by_document(&doc.id)?
                    .into_iter()
                    .map(|c| c.id)
                    .collect();
                self.store.delete_document(&doc.id)?;
                if let Some(vectors) = &self.vectors {
                    vectors.delete(&stale_chunks.into_iter().collect())?;
                }
                outcome.deleted += 1;
            }
        }

        let stats = self.store.recompute_stats()?;
        self.store.update_stats(&stats)?;
        self.store
            .set_schema_info(CURRENT_SCHEMA_VERSION, &self.config.fingerprint())?;

        outcome.cancelled = cancelled;
        tracing::info!(
            indexed = outcome.indexed,
            skipped = outcome.skipped,
            deleted = outcome.deleted,
            cancelled,
            "index run finished"
        );
        Ok(outcome)
    }

    fn commit_file(&self, prepared: PreparedFile) -> Result<()> {
        let PreparedFile {
            batch,
            replaced_chunk_ids,
        } = prepared;

        // keep references to the new chunks for the embedding pass
        let embed_inputs: Vec<(String, String)> = batch
            .chunks
            .iter()
            .map(|dc| (dc.chunk.id.clone(), dc.text.clone()))
            .collect();

        self.store.batch_index(&[batch])?;

        let (Some(embedder), Some(vectors)) = (&self.embedder, &self.vectors) else {
            return Ok(());
        };

        if !replaced_chunk_ids.is_empty() {
            vectors.delete(&replaced_chunk_ids.into_iter().collect())?;
        }

        let batch_size = self.config.embedding.batch_size.max(1);
        for window in embed_inputs.chunks(batch_size) {
            let texts: Vec<String> = window.iter().map(|(_, t)| t.clone()).collect();
            match embedder.embed(&texts) {
                Ok(vectors_out) => {
                    let items = window
                        .iter()
                        .zip(vectors_out)
                        .map(|((id, _), v)| (id.clone(), v, BTreeMap::new()))
                        .collect();
                    vectors.upsert(items)?;
                }
                Err(err) => {
                    // embeddings are an enrichment; the lexical index already
                    // committed
                    tracing::warn!(%err, "embedding batch failed");
                    return Ok(());
                }
            }
        }
        Ok(())
    }
}

/// Classify one walked file against its stored document, reading and
/// chunking only when the content actually changed.
fn prepare(
    store: &IndexStore,
    entry: &FileEntry,
    existing: &HashMap<String, Document>,
    chunker: &dyn Chunker,
) -> Delta {
    let path_key = entry.abs_path.to_string_lossy().into_owned();
    let prior = existing.get(&path_key);

    if let Some(doc) = prior {
        if doc.mtime >= entry.mtime {
            return Delta::Unchanged;
        }
    }

    let Ok(raw) = std::fs::read(&entry.abs_path) else {
        tracing::warn!(path = %path_key, "unreadable file, skipping");
        return Delta::Unchanged;
    };
    if raw.contains(&0u8) {
        return Delta::Unchanged; // binary
    }

    let content_hash = xxh3_64(&raw);
    if let Some(doc) = prior {
        if doc.content_hash == content_hash {
            // touched but identical (git checkout, save-without-changes)
            let mut refreshed = doc.clone();
            refreshed.mtime = entry.mtime;
            return Delta::Touched(refreshed);
        }
    }

    let content = String::from_utf8_lossy(&raw).into_owned();
    let doc = Document {
        id: Document::id_for_path(&entry.abs_path),
        path: path_key,
        mtime: entry.mtime,
        language: detect_language(&entry.abs_path).to_string(),
        content_hash,
    };

    let chunks = chunker.chunk(&doc, &content);
    let term_freqs = chunks
        .iter()
        .map(|dc| {
            let mut freqs: HashMap<String, u32> = HashMap::new();
            for term in &dc.chunk.tokens {
                *freqs.entry(term.clone()).or_insert(0) += 1;
            }
            freqs
        })
        .collect();

    let replaced_chunk_ids = prior
        .map(|doc| {
            store
                .get_chunks_by_document(&doc.id)
                .unwrap_or_default()
                .into_iter()
                .map(|c| c.id)
                .collect()
        })
        .unwrap_or_default();

    Delta::Dirty(PreparedFile {
        batch: BatchFile {
            doc,
            chunks,
            term_freqs,
        },
        replaced_chunk_ids,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunker::LineChunker;
    use crate::store::CorpusStats;
    use crate::tokenizer::Tokenizer;
    use std::fs;

    fn write(root: &Path, rel: &str, content: &str) -> PathBuf {
        let path = root.join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(&path, content).unwrap();
        path
    }

    fn backdate(path: &Path, seconds_ago: u64) {
        let mtime = std::time::SystemTime::now() - std::time::Duration::from_secs(seconds_ago);
        let file = fs::File::options().append(true).open(path).unwrap();
        file.set_modified(mtime).unwrap();
    }

    fn use_case(store: &Arc<IndexStore>, config: Config) -> IndexUseCase {
        let tokenizer = Tokenizer::new(config.index.stemming);
        IndexUseCase::new(
            Arc::clone(store),
            Box::new(LineChunker::new(
                tokenizer,
                config.index.chunk_tokens,
                config.index.chunk_overlap,
            )),
            config,
            None,
            None,
        )
    }

    fn run(use_case: &IndexUseCase, root: &Path) -> IndexOutcome {
        let mut noop = |_: usize, _: usize, _: &str| {};
        use_case.run(root, None, &mut noop).unwrap()
    }

    fn setup() -> (tempfile::TempDir, tempfile::TempDir, Arc<IndexStore>) {
        let corpus = tempfile::tempdir().unwrap();
        let db = tempfile::tempdir().unwrap();
        let store = Arc::new(IndexStore::open(&db.path().join("index.db")).unwrap());
        (corpus, db, store)
    }

    #[test]
    fn first_run_indexes_everything_and_updates_stats() {
        let (corpus, _db, store) = setup();
        write(corpus.path(), "a.txt", "alpha beta gamma");
        write(corpus.path(), "b.txt", "delta epsilon");

        let outcome = run(&use_case(&store, Config::default()), corpus.path());
        assert_eq!(outcome.indexed, 2);
        assert_eq!(outcome.skipped, 0);
        assert_eq!(outcome.deleted, 0);

        let stats = store.get_stats().unwrap();
        assert_eq!(stats.total_docs, 2);
        assert!(stats.total_chunks >= 2);
        assert!(stats.avg_chunk_len > 0.0);

        let info = store.get_schema_info().unwrap();
        assert_eq!(info.version, CURRENT_SCHEMA_VERSION);
        assert_eq!(info.fingerprint, Config::default().fingerprint());
    }

    #[test]
    fn unchanged_files_are_skipped_without_touching_postings() {
        let (corpus, _db, store) = setup();
        let file = write(corpus.path(), "a.txt", "alpha beta gamma");
        backdate(&file, 120);

        let uc = use_case(&store, Config::default());
        assert_eq!(run(&uc, corpus.path()).indexed, 1);

        let postings_before = store.get_postings("alpha").unwrap();
        let stats_before = store.get_stats().unwrap();

        let second = run(&uc, corpus.path());
        assert_eq!(second.indexed, 0);
        assert_eq!(second.skipped, 1);
        assert_eq!(store.get_postings("alpha").unwrap(), postings_before);
        assert_eq!(store.get_stats().unwrap(), stats_before);
    }

    #[test]
    fn touched_but_identical_content_only_refreshes_mtime() {
        let (corpus, _db, store) = setup();
        let file = write(corpus.path(), "a.txt", "alpha beta gamma");
        backdate(&file, 3600);

        let uc = use_case(&store, Config::default());
        run(&uc, corpus.path());
        let doc_before = store
            .get_document(&Document::id_for_path(&file))
            .unwrap()
            .unwrap();

        // rewrite identical bytes with a fresh mtime
        write(corpus.path(), "a.txt", "alpha beta gamma");
        let outcome = run(&uc, corpus.path());
        assert_eq!(outcome.indexed, 0);
        assert_eq!(outcome.skipped, 1);

        let doc_after = store
            .get_document(&Document::id_for_path(&file))
            .unwrap()
            .unwrap();
        assert!(doc_after.mtime >= doc_before.mtime);
        assert_eq!(doc_after.content_hash, doc_before.content_hash);
    }

    #[test]
    fn modified_file_replaces_chunks_and_postings() {
        let (corpus, _db, store) = setup();
        let file = write(corpus.path(), "a.txt", "alpha beta");
        backdate(&file, 3600);

        let uc = use_case(&store, Config::default());
        run(&uc, corpus.path());
        assert!(!store.get_postings("alpha").unwrap().is_empty());

        write(corpus.path(), "a.txt", "gamma delta");
        let outcome = run(&uc, corpus.path());
        assert_eq!(outcome.indexed, 1);

        assert!(store.get_postings("alpha").unwrap().is_empty());
        assert!(!store.get_postings("gamma").unwrap().is_empty());
    }

    #[test]
    fn vanished_files_are_deleted_with_their_postings() {
        let (corpus, _db, store) = setup();
        write(corpus.path(), "keep.txt", "alpha keepme");
        let gone = write(corpus.path(), "gone.txt", "omega goner");

        let uc = use_case(&store, Config::default());
        run(&uc, corpus.path());
        assert!(!store.get_postings("omega").unwrap().is_empty());

        fs::remove_file(&gone).unwrap();
        let outcome = run(&uc, corpus.path());
        assert_eq!(outcome.deleted, 1);

        assert!(store.get_postings("omega").unwrap().is_empty());
        assert!(store
            .get_document(&Document::id_for_path(&gone))
            .unwrap()
            .is_none());
        assert_eq!(store.get_stats().unwrap().total_docs, 1);
    }

    #[test]
    fn progress_fires_at_least_once_per_file() {
        let (corpus, _db, store) = setup();
        write(corpus.path(), "a.txt", "alpha");
        write(corpus.path(), "b.txt", "beta");

        let uc = use_case(&store, Config::default());
        let mut calls: Vec<(usize, usize)> = Vec::new();
        let mut progress = |processed: usize, total: usize, _path: &str| {
            calls.push((processed, total));
        };
        uc.run(corpus.path(), None, &mut progress).unwrap();

        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0], (1, 2));
        assert_eq!(calls[1], (2, 2));
    }

    #[test]
    fn cancellation_stops_between_commits_and_keeps_existing_docs() {
        let (corpus, _db, store) = setup();
        write(corpus.path(), "a.txt", "alpha");
        write(corpus.path(), "b.txt", "beta");

        let uc = use_case(&store, Config::default());
        let cancel = AtomicBool::new(true); // cancelled before the first commit
        let mut noop = |_: usize, _: usize, _: &str| {};
        let outcome = uc.run(corpus.path(), Some(&cancel), &mut noop).unwrap();

        assert!(outcome.cancelled);
        assert_eq!(outcome.indexed, 0);
        assert_eq!(outcome.deleted, 0, "no stale deletion on a partial walk");
    }

    #[test]
    fn empty_corpus_yields_zeroed_stats() {
        let (corpus, _db, store) = setup();
        let outcome = run(&use_case(&store, Config::default()), corpus.path());
        assert_eq!(outcome.total_files, 0);
        assert_eq!(store.get_stats().unwrap(), CorpusStats::default());
    }
}
