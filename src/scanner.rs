use crate::config::{WalkConfig, ABSOLUTE_MAX_FILE_BYTES};
use crate::error::{RagError, Result};
use ignore::WalkBuilder;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

/// Directory *names* skipped anywhere in the tree, compared against path
/// components. `.gitignore` handles most of these already; this is the
/// safety net for corpora without one.
const JUNK_DIRS: &[&str] = &[
    ".git",
    ".rag",
    "node_modules",
    "target",
    "dist",
    "build",
    "coverage",
    ".next",
    ".nuxt",
    "out",
    "vendor",
];

/// High-noise file suffixes that never carry retrievable evidence.
const JUNK_SUFFIXES: &[&str] = &[
    ".lock", ".min.js", ".map", ".svg", ".png", ".ico", ".jpg", ".jpeg",
    ".gif", ".pdf", ".woff", ".woff2",
];

/// One walked corpus file: absolute path, root-relative path, last-modified
/// seconds and byte size.
#[derive(Debug, Clone)]
pub struct FileEntry {
    pub abs_path: PathBuf,
    pub rel_path: PathBuf,
    pub mtime: i64,
    pub size: u64,
}

#[derive(Debug, Clone)]
pub struct ScanOptions {
    pub root: PathBuf,
    pub max_file_bytes: u64,
    pub walk: WalkConfig,
}

fn compile_globs(patterns: &[String], kind: &str) -> Vec<glob::Pattern> {
    patterns
        .iter()
        .filter_map(|p| match glob::Pattern::new(p.trim()) {
            Ok(pat) => Some(pat),
            Err(err) => {
                tracing::warn!(pattern = %p, %err, "ignoring bad {kind} glob");
                None
            }
        })
        .collect()
}

fn has_junk_component(rel: &Path) -> bool {
    rel.components().any(|c| {
        c.as_os_str()
            .to_str()
            .map(|name| JUNK_DIRS.contains(&name))
            .unwrap_or(false)
    })
}

fn has_junk_suffix(rel: &Path) -> bool {
    let name = rel
        .file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.to_ascii_lowercase())
        .unwrap_or_default();
    JUNK_SUFFIXES.iter().any(|s| name.ends_with(s))
}

fn mtime_seconds(meta: &std::fs::Metadata) -> i64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Walk the corpus root honoring `.gitignore`, the built-in junk filters and
/// the configured include/exclude globs (matched against root-relative
/// paths). Entries come back sorted by relative path so indexing order is
/// deterministic.
pub fn scan_corpus(opts: &ScanOptions) -> Result<Vec<FileEntry>> {
    let meta = std::fs::metadata(&opts.root)
        .map_err(|e| RagError::Storage(format!("corpus root {}: {e}", opts.root.display())))?;
    if !meta.is_dir() {
        return Err(RagError::Storage(format!(
            "corpus root is not a directory: {}",
            opts.root.display()
        )));
    }

    let includes = compile_globs(&opts.walk.include, "include");
    let excludes = compile_globs(&opts.walk.exclude, "exclude");
    let max_bytes = opts.max_file_bytes.min(ABSOLUTE_MAX_FILE_BYTES);

    let walker = WalkBuilder::new(&opts.root)
        .standard_filters(true) // .gitignore, .ignore, hidden, etc.
        .build();

    let mut entries = Vec::new();
    for item in walker {
        let dent = match item {
            Ok(d) => d,
            Err(_) => continue,
        };

        if !dent.file_type().map(|ft| ft.is_file()).unwrap_or(false) {
            continue;
        }

        let abs_path = dent.into_path();
        let Ok(rel_path) = abs_path.strip_prefix(&opts.root).map(Path::to_path_buf) else {
            continue;
        };

        if has_junk_component(&rel_path) || has_junk_suffix(&rel_path) {
            continue;
        }
        if excludes.iter().any(|p| p.matches_path(&rel_path)) {
            continue;
        }
        if !includes.is_empty() && !includes.iter().any(|p| p.matches_path(&rel_path)) {
            continue;
        }

        let meta = match std::fs::metadata(&abs_path) {
            Ok(m) => m,
            Err(_) => continue,
        };
        let size = meta.len();
        if size == 0 || size > max_bytes {
            continue;
        }

        entries.push(FileEntry {
            mtime: mtime_seconds(&meta),
            abs_path,
            rel_path,
            size,
        });
    }

    entries.sort_by(|a, b| a.rel_path.cmp(&b.rel_path));
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write(root: &Path, rel: &str, content: &str) {
        let path = root.join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, content).unwrap();
    }

    #[test]
    fn scan_skips_junk_dirs_and_sorts_by_rel_path() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "src/main.rs", "fn main() {}");
        write(dir.path(), "src/lib.rs", "pub mod x;");
        write(dir.path(), "node_modules/pkg/index.js", "junk");
        write(dir.path(), "target/debug/out.rs", "junk");
        write(dir.path(), ".rag/index.db", "binary");
        write(dir.path(), "Cargo.lock", "lockfile");

        let opts = ScanOptions {
            root: dir.path().to_path_buf(),
            max_file_bytes: 1024 * 1024,
            walk: WalkConfig::default(),
        };
        let entries = scan_corpus(&opts).unwrap();
        let rels: Vec<String> = entries
            .iter()
            .map(|e| e.rel_path.to_string_lossy().replace('\\', "/"))
            .collect();
        assert_eq!(rels, vec!["src/lib.rs", "src/main.rs"]);
        assert!(entries.iter().all(|e| e.size > 0 && e.mtime > 0));
    }

    #[test]
    fn include_globs_restrict_the_walk() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a.rs", "fn a() {}");
        write(dir.path(), "b.py", "def b(): pass");
        write(dir.path(), "notes.txt", "hello");

        let opts = ScanOptions {
            root: dir.path().to_path_buf(),
            max_file_bytes: 1024 * 1024,
            walk: WalkConfig {
                include: vec!["*.rs".into(), "*.py".into()],
                exclude: vec![],
            },
        };
        let entries = scan_corpus(&opts).unwrap();
        assert_eq!(entries.len(), 2);
    }

    #[test]
    fn exclude_globs_and_size_cap_apply() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "keep.rs", "fn main() {}");
        write(dir.path(), "generated/code.rs", "fn g() {}");
        write(dir.path(), "big.rs", &"x ".repeat(200));

        let opts = ScanOptions {
            root: dir.path().to_path_buf(),
            max_file_bytes: 64,
            walk: WalkConfig {
                include: vec![],
                exclude: vec!["generated/**".into()],
            },
        };
        let entries = scan_corpus(&opts).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].rel_path, PathBuf::from("keep.rs"));
    }
}
