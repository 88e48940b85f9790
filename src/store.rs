use crate::config::{short_sha256, Config};
use crate::error::{RagError, Result};
use redb::{Database, ReadableTable, ReadableTableMetadata, TableDefinition};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex};

// ---------------------------------------------------------------------------
// Durable index store: one redb file, logical namespaces as tables.
//
//  <root>/.rag/index.db
//    documents   id → Document record
//    chunks      id → Chunk record (metadata + ordered token vector)
//    blobs       id → raw chunk text (binary-safe)
//    doc_chunks  doc id → ordered chunk id list
//    terms       term → posting list [{chunk_id, tf}]
//    stats       "corpus" → CorpusStats, plus the schema keys
//    vectors     chunk id → VectorItem (owned by VectorStore)
//    symbols / doc_symbols / callgraph   reserved namespaces
//
//  Concurrency model comes straight from redb: one serialized write
//  transaction at a time, snapshot-isolated parallel readers. Cross-namespace
//  writes for a file (doc + chunks + blobs + postings + doc_chunks) commit in
//  a single transaction or not at all.
// ---------------------------------------------------------------------------

pub const CURRENT_SCHEMA_VERSION: u32 = 2;

const DOCUMENTS: TableDefinition<&str, &[u8]> = TableDefinition::new("documents");
const CHUNKS: TableDefinition<&str, &[u8]> = TableDefinition::new("chunks");
const BLOBS: TableDefinition<&str, &[u8]> = TableDefinition::new("blobs");
const DOC_CHUNKS: TableDefinition<&str, &[u8]> = TableDefinition::new("doc_chunks");
const TERMS: TableDefinition<&str, &[u8]> = TableDefinition::new("terms");
const STATS: TableDefinition<&str, &[u8]> = TableDefinition::new("stats");
pub(crate) const VECTORS: TableDefinition<&str, &[u8]> = TableDefinition::new("vectors");
const SYMBOLS: TableDefinition<&str, &[u8]> = TableDefinition::new("symbols");
const DOC_SYMBOLS: TableDefinition<&str, &[u8]> = TableDefinition::new("doc_symbols");
const CALLGRAPH: TableDefinition<&str, &[u8]> = TableDefinition::new("callgraph");

const STATS_KEY: &str = "corpus";
const SCHEMA_VERSION_KEY: &str = "schema_version";
const FINGERPRINT_KEY: &str = "config_fingerprint";

type Tbl<'t> = redb::Table<'t, &'static str, &'static [u8]>;

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// First 8 bytes of SHA-256 over the absolute path, hex-encoded.
    pub id: String,
    /// Absolute path.
    pub path: String,
    /// Last-modified seconds.
    pub mtime: i64,
    pub language: String,
    /// xxh3 of the raw bytes at last index time. Lets a touched-but-unchanged
    /// file skip re-chunking even when its mtime moved forward.
    pub content_hash: u64,
}

impl Document {
    pub fn id_for_path(path: &Path) -> String {
        short_sha256(path.to_string_lossy().as_bytes())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub doc_id: String,
    /// 1-based inclusive line range, start ≤ end.
    pub start_line: u32,
    pub end_line: u32,
    /// Ordered post-tokenizer terms of the chunk text.
    pub tokens: Vec<String>,
}

impl Chunk {
    pub fn window_id(doc_id: &str, start: u32, end: u32) -> String {
        format!("{doc_id}:{start}-{end}")
    }

    pub fn unit_id(doc_id: &str, kind: &str, name: &str, start: u32) -> String {
        format!("{doc_id}:{kind}:{name}:{start}")
    }
}

/// A chunk together with its raw text, as produced by the chunker. The store
/// splits this into the `chunks` and `blobs` namespaces.
#[derive(Debug, Clone)]
pub struct DocumentChunk {
    pub chunk: Chunk,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Posting {
    pub chunk_id: String,
    pub tf: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CorpusStats {
    pub total_docs: u64,
    pub total_chunks: u64,
    pub avg_chunk_len: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaInfo {
    pub version: u32,
    pub fingerprint: String,
}

#[derive(Debug, Clone)]
pub struct MigrationCheck {
    pub needs_migration: bool,
    pub needs_rebuild: bool,
    pub reason: Option<String>,
}

/// One file's worth of writes for `batch_index`.
pub struct BatchFile {
    pub doc: Document,
    pub chunks: Vec<DocumentChunk>,
    /// Per-chunk term frequencies, parallel to `chunks`.
    pub term_freqs: Vec<HashMap<String, u32>>,
}

pub type CommitHook = Arc<dyn Fn() + Send + Sync>;

// ---------------------------------------------------------------------------
// Encoding helpers
// ---------------------------------------------------------------------------

fn enc<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(bincode::serialize(value)?)
}

fn dec<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(bincode::deserialize(bytes)?)
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

pub struct IndexStore {
    db: Arc<Database>,
    commit_hook: Mutex<Option<CommitHook>>,
}

impl IndexStore {
    /// Open (or create) the store and make sure every namespace exists so
    /// later read transactions never observe a missing table.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path)?;

        let txn = db.begin_write()?;
        for def in [
            DOCUMENTS, CHUNKS, BLOBS, DOC_CHUNKS, TERMS, STATS, VECTORS, SYMBOLS, DOC_SYMBOLS,
            CALLGRAPH,
        ] {
            txn.open_table(def)?;
        }
        txn.commit()?;

        Ok(Self {
            db: Arc::new(db),
            commit_hook: Mutex::new(None),
        })
    }

    /// Shared database handle for the companion `VectorStore`.
    pub fn database(&self) -> Arc<Database> {
        Arc::clone(&self.db)
    }

    /// Install the hook invoked after every committed mutation. The query
    /// cache passes its generation bump here.
    pub fn set_commit_hook(&self, hook: CommitHook) {
        if let Ok(mut guard) = self.commit_hook.lock() {
            *guard = Some(hook);
        }
    }

    fn notify_commit(&self) {
        let hook = match self.commit_hook.lock() {
            Ok(guard) => guard.clone(),
            Err(_) => None,
        };
        if let Some(hook) = hook {
            hook();
        }
    }

    // ── Documents ─────────────────────────────────────────────────────────

    pub fn put_document(&self, doc: &Document) -> Result<()> {
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(DOCUMENTS)?;
            table.insert(doc.id.as_str(), enc(doc)?.as_slice())?;
        }
        txn.commit()?;
        self.notify_commit();
        Ok(())
    }

    pub fn get_document(&self, id: &str) -> Result<Option<Document>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(DOCUMENTS)?;
        match table.get(id)? {
            Some(guard) => Ok(Some(dec(guard.value())?)),
            None => Ok(None),
        }
    }

    /// Like `get_document`, but absence is an error the caller can match on.
    pub fn require_document(&self, id: &str) -> Result<Document> {
        self.get_document(id)?
            .ok_or_else(|| RagError::NotFound(format!("document {id}")))
    }

    pub fn list_documents(&self) -> Result<Vec<Document>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(DOCUMENTS)?;
        let mut docs = Vec::new();
        for item in table.iter()? {
            let (_, value) = item?;
            docs.push(dec(value.value())?);
        }
        Ok(docs)
    }

    /// Delete a document together with its chunks, blobs and postings in one
    /// transaction.
    pub fn delete_document(&self, id: &str) -> Result<()> {
        let txn = self.db.begin_write()?;
        {
            let mut documents = txn.open_table(DOCUMENTS)?;
            let mut chunks = txn.open_table(CHUNKS)?;
            let mut blobs = txn.open_table(BLOBS)?;
            let mut doc_chunks = txn.open_table(DOC_CHUNKS)?;
            let mut terms = txn.open_table(TERMS)?;
            remove_doc_data(&mut chunks, &mut blobs, &mut doc_chunks, &mut terms, id)?;
            documents.remove(id)?;
        }
        txn.commit()?;
        self.notify_commit();
        Ok(())
    }

    // ── Chunks ────────────────────────────────────────────────────────────

    pub fn put_chunk(&self, chunk: &Chunk, text: &str) -> Result<()> {
        let txn = self.db.begin_write()?;
        {
            let mut chunks = txn.open_table(CHUNKS)?;
            let mut blobs = txn.open_table(BLOBS)?;
            let mut doc_chunks = txn.open_table(DOC_CHUNKS)?;

            chunks.insert(chunk.id.as_str(), enc(chunk)?.as_slice())?;
            blobs.insert(chunk.id.as_str(), text.as_bytes())?;

            let mut ids: Vec<String> = match doc_chunks.get(chunk.doc_id.as_str())? {
                Some(guard) => dec(guard.value())?,
                None => Vec::new(),
            };
            if !ids.iter().any(|i| i == &chunk.id) {
                ids.push(chunk.id.clone());
            }
            doc_chunks.insert(chunk.doc_id.as_str(), enc(&ids)?.as_slice())?;
        }
        txn.commit()?;
        self.notify_commit();
        Ok(())
    }

    pub fn get_chunk(&self, id: &str) -> Result<Option<Chunk>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(CHUNKS)?;
        match table.get(id)? {
            Some(guard) => Ok(Some(dec(guard.value())?)),
            None => Ok(None),
        }
    }

    pub fn require_chunk(&self, id: &str) -> Result<Chunk> {
        self.get_chunk(id)?
            .ok_or_else(|| RagError::NotFound(format!("chunk {id}")))
    }

    pub fn get_chunk_text(&self, id: &str) -> Result<Option<String>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(BLOBS)?;
        match table.get(id)? {
            Some(guard) => Ok(Some(String::from_utf8_lossy(guard.value()).into_owned())),
            None => Ok(None),
        }
    }

    pub fn get_chunks_by_document(&self, doc_id: &str) -> Result<Vec<Chunk>> {
        let txn = self.db.begin_read()?;
        let doc_chunks = txn.open_table(DOC_CHUNKS)?;
        let chunks = txn.open_table(CHUNKS)?;

        let ids: Vec<String> = match doc_chunks.get(doc_id)? {
            Some(guard) => dec(guard.value())?,
            None => return Ok(Vec::new()),
        };

        let mut out = Vec::with_capacity(ids.len());
        for id in &ids {
            if let Some(guard) = chunks.get(id.as_str())? {
                out.push(dec(guard.value())?);
            }
        }
        Ok(out)
    }

    /// Delete all chunks of a document (with blobs and postings) while
    /// keeping the document record itself.
    pub fn delete_chunks_by_document(&self, doc_id: &str) -> Result<()> {
        let txn = self.db.begin_write()?;
        {
            let mut chunks = txn.open_table(CHUNKS)?;
            let mut blobs = txn.open_table(BLOBS)?;
            let mut doc_chunks = txn.open_table(DOC_CHUNKS)?;
            let mut terms = txn.open_table(TERMS)?;
            remove_doc_data(&mut chunks, &mut blobs, &mut doc_chunks, &mut terms, doc_id)?;
        }
        txn.commit()?;
        self.notify_commit();
        Ok(())
    }

    // ── Postings ──────────────────────────────────────────────────────────

    /// Insert a posting with replace-if-present semantics for the
    /// (term, chunk) pair.
    pub fn put_posting(&self, term: &str, chunk_id: &str, tf: u32) -> Result<()> {
        let txn = self.db.begin_write()?;
        {
            let mut terms = txn.open_table(TERMS)?;
            let mut list: Vec<Posting> = match terms.get(term)? {
                Some(guard) => dec(guard.value())?,
                None => Vec::new(),
            };
            list.retain(|p| p.chunk_id != chunk_id);
            list.push(Posting {
                chunk_id: chunk_id.to_string(),
                tf,
            });
            terms.insert(term, enc(&list)?.as_slice())?;
        }
        txn.commit()?;
        self.notify_commit();
        Ok(())
    }

    pub fn get_postings(&self, term: &str) -> Result<Vec<Posting>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(TERMS)?;
        match table.get(term)? {
            Some(guard) => dec(guard.value()),
            None => Ok(Vec::new()),
        }
    }

    /// Remove a chunk's postings from the given terms' lists.
    pub fn delete_postings(&self, chunk_id: &str, terms_to_check: &[String]) -> Result<()> {
        let txn = self.db.begin_write()?;
        {
            let mut terms = txn.open_table(TERMS)?;
            let removed: HashSet<&str> = std::iter::once(chunk_id).collect();
            prune_postings(&mut terms, terms_to_check.iter().map(String::as_str), &removed)?;
        }
        txn.commit()?;
        self.notify_commit();
        Ok(())
    }

    // ── Stats ─────────────────────────────────────────────────────────────

    pub fn get_stats(&self) -> Result<CorpusStats> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(STATS)?;
        match table.get(STATS_KEY)? {
            Some(guard) => dec(guard.value()),
            None => Ok(CorpusStats::default()),
        }
    }

    pub fn update_stats(&self, stats: &CorpusStats) -> Result<()> {
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(STATS)?;
            table.insert(STATS_KEY, enc(stats)?.as_slice())?;
        }
        txn.commit()?;
        self.notify_commit();
        Ok(())
    }

    /// Recount documents and chunks from committed data. Used at the end of
    /// every index run so stats always reflect what a reader can see.
    pub fn recompute_stats(&self) -> Result<CorpusStats> {
        let txn = self.db.begin_read()?;
        let documents = txn.open_table(DOCUMENTS)?;
        let chunks = txn.open_table(CHUNKS)?;

        let total_docs = documents.len()?;
        let mut total_chunks = 0u64;
        let mut token_sum = 0u64;
        for item in chunks.iter()? {
            let (_, value) = item?;
            let chunk: Chunk = dec(value.value())?;
            total_chunks += 1;
            token_sum += chunk.tokens.len() as u64;
        }

        let avg_chunk_len = if total_chunks == 0 {
            0.0
        } else {
            token_sum as f64 / total_chunks as f64
        };

        Ok(CorpusStats {
            total_docs,
            total_chunks,
            avg_chunk_len,
        })
    }

    // ── Batch indexing ────────────────────────────────────────────────────

    /// Commit one or more files' documents, chunks, blobs and postings in a
    /// single transaction. Any prior chunk set of each document is removed in
    /// the same transaction, so a modified file is replaced atomically; each
    /// term's new postings are merged into its existing list.
    pub fn batch_index(&self, files: &[BatchFile]) -> Result<()> {
        if files.is_empty() {
            return Ok(());
        }

        let txn = self.db.begin_write()?;
        {
            let mut documents = txn.open_table(DOCUMENTS)?;
            let mut chunks = txn.open_table(CHUNKS)?;
            let mut blobs = txn.open_table(BLOBS)?;
            let mut doc_chunks = txn.open_table(DOC_CHUNKS)?;
            let mut terms = txn.open_table(TERMS)?;

            for file in files {
                if file.chunks.len() != file.term_freqs.len() {
                    return Err(RagError::Storage(format!(
                        "batch for {}: {} chunks but {} term-frequency maps",
                        file.doc.path,
                        file.chunks.len(),
                        file.term_freqs.len()
                    )));
                }

                remove_doc_data(
                    &mut chunks,
                    &mut blobs,
                    &mut doc_chunks,
                    &mut terms,
                    &file.doc.id,
                )?;

                documents.insert(file.doc.id.as_str(), enc(&file.doc)?.as_slice())?;

                let mut chunk_ids = Vec::with_capacity(file.chunks.len());
                for dc in &file.chunks {
                    chunks.insert(dc.chunk.id.as_str(), enc(&dc.chunk)?.as_slice())?;
                    blobs.insert(dc.chunk.id.as_str(), dc.text.as_bytes())?;
                    chunk_ids.push(dc.chunk.id.clone());
                }
                doc_chunks.insert(file.doc.id.as_str(), enc(&chunk_ids)?.as_slice())?;

                // term → additions across this file's chunks
                let mut additions: HashMap<&str, Vec<Posting>> = HashMap::new();
                for (dc, freqs) in file.chunks.iter().zip(&file.term_freqs) {
                    for (term, tf) in freqs {
                        additions.entry(term.as_str()).or_default().push(Posting {
                            chunk_id: dc.chunk.id.clone(),
                            tf: *tf,
                        });
                    }
                }

                for (term, mut new_postings) in additions {
                    let mut list: Vec<Posting> = match terms.get(term)? {
                        Some(guard) => dec(guard.value())?,
                        None => Vec::new(),
                    };
                    let fresh: HashSet<&str> =
                        new_postings.iter().map(|p| p.chunk_id.as_str()).collect();
                    list.retain(|p| !fresh.contains(p.chunk_id.as_str()));
                    list.append(&mut new_postings);
                    terms.insert(term, enc(&list)?.as_slice())?;
                }
            }
        }
        txn.commit()?;
        self.notify_commit();
        Ok(())
    }

    // ── Schema & migration ────────────────────────────────────────────────

    pub fn get_schema_info(&self) -> Result<SchemaInfo> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(STATS)?;

        let version = match table.get(SCHEMA_VERSION_KEY)? {
            Some(guard) => dec(guard.value())?,
            None => 0,
        };
        let fingerprint = match table.get(FINGERPRINT_KEY)? {
            Some(guard) => dec(guard.value())?,
            None => String::new(),
        };
        Ok(SchemaInfo {
            version,
            fingerprint,
        })
    }

    pub fn set_schema_info(&self, version: u32, fingerprint: &str) -> Result<()> {
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(STATS)?;
            table.insert(SCHEMA_VERSION_KEY, enc(&version)?.as_slice())?;
            table.insert(FINGERPRINT_KEY, enc(&fingerprint.to_string())?.as_slice())?;
        }
        txn.commit()?;
        self.notify_commit();
        Ok(())
    }

    /// Decide whether the on-disk index can serve the given configuration.
    pub fn check_migration(&self, config: &Config) -> Result<MigrationCheck> {
        let info = self.get_schema_info()?;
        let fingerprint = config.fingerprint();

        if info.version > CURRENT_SCHEMA_VERSION {
            return Ok(MigrationCheck {
                needs_migration: false,
                needs_rebuild: true,
                reason: Some(format!(
                    "index schema version {} is newer than supported {}; rebuild required",
                    info.version, CURRENT_SCHEMA_VERSION
                )),
            });
        }

        if !info.fingerprint.is_empty() && info.fingerprint != fingerprint {
            return Ok(MigrationCheck {
                needs_migration: false,
                needs_rebuild: true,
                reason: Some("index configuration changed".to_string()),
            });
        }

        if info.version < CURRENT_SCHEMA_VERSION {
            return Ok(MigrationCheck {
                needs_migration: true,
                needs_rebuild: false,
                reason: Some(format!(
                    "schema version {} behind current {}",
                    info.version, CURRENT_SCHEMA_VERSION
                )),
            });
        }

        Ok(MigrationCheck {
            needs_migration: false,
            needs_rebuild: false,
            reason: None,
        })
    }

    /// Run stepwise migrations up to the current schema version and record
    /// the configuration fingerprint. Schema keys are only ever written here
    /// and in `set_schema_info`.
    pub fn migrate(&self, config: &Config) -> Result<()> {
        let info = self.get_schema_info()?;
        if info.version > CURRENT_SCHEMA_VERSION {
            return Err(RagError::ConfigMismatch(format!(
                "index schema version {} is newer than supported {}",
                info.version, CURRENT_SCHEMA_VERSION
            )));
        }

        let txn = self.db.begin_write()?;
        {
            if info.version < 2 {
                // 1 → 2: the doc → chunk-list namespace joined the schema.
                txn.open_table(DOC_CHUNKS)?;
            }
            for def in [SYMBOLS, DOC_SYMBOLS, CALLGRAPH] {
                txn.open_table(def)?;
            }

            let mut table = txn.open_table(STATS)?;
            table.insert(SCHEMA_VERSION_KEY, enc(&CURRENT_SCHEMA_VERSION)?.as_slice())?;
            table.insert(FINGERPRINT_KEY, enc(&config.fingerprint())?.as_slice())?;
        }
        txn.commit()?;
        self.notify_commit();
        tracing::info!(version = CURRENT_SCHEMA_VERSION, "schema migrated");
        Ok(())
    }

    /// Wipe all domain namespaces while preserving the schema keys. The
    /// caller is expected to re-index and then `migrate` to refresh the
    /// fingerprint.
    pub fn clear(&self) -> Result<()> {
        let txn = self.db.begin_write()?;
        for def in [
            DOCUMENTS, CHUNKS, BLOBS, DOC_CHUNKS, TERMS, VECTORS, SYMBOLS, DOC_SYMBOLS, CALLGRAPH,
        ] {
            txn.delete_table(def)
                .map_err(|e| RagError::Storage(e.to_string()))?;
            txn.open_table(def)?;
        }
        {
            let mut table = txn.open_table(STATS)?;
            table.remove(STATS_KEY)?;
        }
        txn.commit()?;
        self.notify_commit();
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Transaction-internal helpers
// ---------------------------------------------------------------------------

/// Remove a document's chunks, blobs, doc→chunks entry and postings from
/// already-open tables. Returns the removed chunk ids.
fn remove_doc_data(
    chunks: &mut Tbl,
    blobs: &mut Tbl,
    doc_chunks: &mut Tbl,
    terms: &mut Tbl,
    doc_id: &str,
) -> Result<Vec<String>> {
    let ids: Vec<String> = match doc_chunks.get(doc_id)? {
        Some(guard) => dec(guard.value())?,
        None => Vec::new(),
    };
    if ids.is_empty() {
        doc_chunks.remove(doc_id)?;
        return Ok(ids);
    }

    let mut term_set: HashSet<String> = HashSet::new();
    for id in &ids {
        if let Some(guard) = chunks.get(id.as_str())? {
            let chunk: Chunk = dec(guard.value())?;
            term_set.extend(chunk.tokens);
        }
    }
    for id in &ids {
        chunks.remove(id.as_str())?;
        blobs.remove(id.as_str())?;
    }

    let removed: HashSet<&str> = ids.iter().map(String::as_str).collect();
    prune_postings(terms, term_set.iter().map(String::as_str), &removed)?;

    doc_chunks.remove(doc_id)?;
    Ok(ids)
}

/// Drop postings of the removed chunk ids from each term's list, deleting a
/// term entirely once its list becomes empty.
fn prune_postings<'a>(
    terms: &mut Tbl,
    terms_to_check: impl Iterator<Item = &'a str>,
    removed_chunks: &HashSet<&str>,
) -> Result<()> {
    for term in terms_to_check {
        let list: Option<Vec<Posting>> = match terms.get(term)? {
            Some(guard) => Some(dec(guard.value())?),
            None => None,
        };
        let Some(mut list) = list else { continue };

        let before = list.len();
        list.retain(|p| !removed_chunks.contains(p.chunk_id.as_str()));
        if list.len() == before {
            continue;
        }
        if list.is_empty() {
            terms.remove(term)?;
        } else {
            terms.insert(term, enc(&list)?.as_slice())?;
        }
    }
    Ok(())
}
