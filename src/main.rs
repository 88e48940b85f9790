use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use ragpack::config::{load_config, store_path};
use ragpack::pipeline::build_pipeline;
use ragpack::store::CURRENT_SCHEMA_VERSION;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "ragpack")]
#[command(version)]
#[command(about = "Local evidence-pack retrieval engine (BM25 + vector hybrid)")]
struct Cli {
    /// Corpus root (defaults to the current directory)
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Incrementally index the corpus under the root
    Index,
    /// Rank snippets for a query
    Search {
        query: String,
        /// Number of results
        #[arg(long)]
        top_k: Option<usize>,
    },
    /// Build a token-budgeted evidence pack (JSON on stdout)
    Pack {
        query: String,
        /// Token budget override
        #[arg(long)]
        budget_tokens: Option<usize>,
        /// Number of candidates before packing
        #[arg(long)]
        top_k: Option<usize>,
    },
    /// Print corpus statistics and schema info
    Stats,
    /// Check whether the on-disk index matches the configuration
    Check,
    /// Wipe the index (schema keys survive)
    Clear {
        /// Confirm the wipe
        #[arg(long)]
        yes: bool,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let root = match cli.root {
        Some(root) => root,
        None => std::env::current_dir().context("failed to get current dir")?,
    };
    let root = root
        .canonicalize()
        .with_context(|| format!("corpus root {}", root.display()))?;
    let config = load_config(&root);

    match cli.cmd {
        Command::Index => cmd_index(&root, config),
        Command::Search { query, top_k } => cmd_search(&root, config, &query, top_k),
        Command::Pack {
            query,
            budget_tokens,
            top_k,
        } => cmd_pack(&root, config, &query, budget_tokens, top_k),
        Command::Stats => cmd_stats(&root, config),
        Command::Check => cmd_check(&root, config),
        Command::Clear { yes } => cmd_clear(&root, config, yes),
    }
}

fn cmd_index(root: &std::path::Path, config: ragpack::Config) -> Result<()> {
    let pipeline = build_pipeline(root, config)?;

    let check = pipeline.store.check_migration(&pipeline.config)?;
    if check.needs_rebuild {
        let reason = check.reason.unwrap_or_else(|| "rebuild required".to_string());
        eprintln!("{reason}; rebuilding index");
        pipeline.store.clear()?;
    } else if check.needs_migration {
        pipeline.store.migrate(&pipeline.config)?;
    }

    let bar = ProgressBar::new(0);
    bar.set_style(
        ProgressStyle::with_template("{bar:30} {pos}/{len} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
    );

    let indexer = pipeline.indexer();
    let mut on_progress = |processed: usize, total: usize, path: &str| {
        bar.set_length(total as u64);
        bar.set_position(processed as u64);
        let name = path.rsplit(['/', '\\']).next().unwrap_or(path).to_string();
        bar.set_message(name);
    };
    let outcome = indexer.run(root, None, &mut on_progress)?;
    bar.finish_and_clear();

    println!(
        "indexed {} files ({} unchanged, {} removed) out of {}",
        outcome.indexed, outcome.skipped, outcome.deleted, outcome.total_files
    );
    Ok(())
}

fn ensure_servable(pipeline: &ragpack::Pipeline) -> Result<()> {
    let check = pipeline.store.check_migration(&pipeline.config)?;
    if check.needs_rebuild {
        bail!(
            "{}; run `ragpack index` to rebuild",
            check.reason.unwrap_or_else(|| "rebuild required".to_string())
        );
    }
    Ok(())
}

fn cmd_search(
    root: &std::path::Path,
    config: ragpack::Config,
    query: &str,
    top_k: Option<usize>,
) -> Result<()> {
    let top_k = top_k.unwrap_or(config.search.top_k);
    let pipeline = build_pipeline(root, config)?;
    ensure_servable(&pipeline)?;

    let results = pipeline.retrieve.retrieve(query, top_k)?;
    if results.is_empty() {
        println!("no results");
        return Ok(());
    }
    for result in results {
        let doc = pipeline.store.get_document(&result.chunk.doc_id)?;
        let path = doc.map(|d| d.path).unwrap_or_else(|| "<missing>".to_string());
        println!(
            "{:>8.3}  {}:L{}-{}",
            result.score, path, result.chunk.start_line, result.chunk.end_line
        );
    }
    Ok(())
}

fn cmd_pack(
    root: &std::path::Path,
    config: ragpack::Config,
    query: &str,
    budget_tokens: Option<usize>,
    top_k: Option<usize>,
) -> Result<()> {
    let budget = budget_tokens.unwrap_or(config.pack.token_budget);
    let top_k = top_k.unwrap_or(config.search.top_k);
    let pipeline = build_pipeline(root, config)?;
    ensure_servable(&pipeline)?;

    let results = pipeline.retrieve.retrieve(query, top_k)?;
    let packed = pipeline.packer.pack(
        &pipeline.store,
        query,
        results,
        budget,
        pipeline.retrieve.kind(),
    )?;
    println!("{}", serde_json::to_string_pretty(&packed)?);
    Ok(())
}

fn cmd_stats(root: &std::path::Path, config: ragpack::Config) -> Result<()> {
    let pipeline = build_pipeline(root, config)?;
    let stats = pipeline.store.get_stats()?;
    let info = pipeline.store.get_schema_info()?;

    println!("database        {}", store_path(root).display());
    println!("documents       {}", stats.total_docs);
    println!("chunks          {}", stats.total_chunks);
    println!("avg chunk len   {:.1}", stats.avg_chunk_len);
    println!(
        "schema          v{} (current v{})",
        info.version, CURRENT_SCHEMA_VERSION
    );
    println!(
        "fingerprint     {}",
        if info.fingerprint.is_empty() {
            "<unset>"
        } else {
            &info.fingerprint
        }
    );
    if let Some(cache) = &pipeline.cache {
        let cs = cache.stats();
        println!(
            "cache           {}/{} entries, {} hits / {} misses, generation {}",
            cs.len, cs.capacity, cs.hits, cs.misses, cs.generation
        );
    }
    Ok(())
}

fn cmd_check(root: &std::path::Path, config: ragpack::Config) -> Result<()> {
    let pipeline = build_pipeline(root, config)?;
    let check = pipeline.store.check_migration(&pipeline.config)?;

    if check.needs_rebuild {
        println!(
            "rebuild required: {}",
            check.reason.unwrap_or_else(|| "unknown".to_string())
        );
    } else if check.needs_migration {
        println!(
            "migration pending: {}",
            check.reason.unwrap_or_else(|| "unknown".to_string())
        );
    } else {
        println!("index is up to date");
    }
    Ok(())
}

fn cmd_clear(root: &std::path::Path, config: ragpack::Config, yes: bool) -> Result<()> {
    if !yes {
        bail!("refusing to clear the index without --yes");
    }
    let pipeline = build_pipeline(root, config)?;
    pipeline.store.clear()?;
    if let Some(cache) = &pipeline.cache {
        cache.invalidate();
    }
    println!("index cleared (schema keys preserved)");
    Ok(())
}
