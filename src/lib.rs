pub mod chunker;
pub mod config;
pub mod embedder;
pub mod error;
pub mod indexer;
pub mod language;
pub mod mmr;
pub mod packer;
pub mod parsers;
pub mod pipeline;
pub mod query_cache;
pub mod retrieve;
pub mod retriever;
pub mod scanner;
pub mod store;
pub mod tokenizer;
pub mod vector_store;

pub use config::{load_config, store_path, Config};
pub use error::{RagError, Result};
pub use packer::{PackedContext, Snippet};
pub use pipeline::{build_pipeline, Pipeline};
pub use retriever::ScoredChunk;
pub use store::{CorpusStats, Document, IndexStore, SchemaInfo};
