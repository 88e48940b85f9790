use std::path::Path;

/// Extension → language tag table used for chunker routing and document
/// metadata. Unknown extensions map to `"unknown"`, which always takes the
/// line-window chunking path.
pub fn detect_language(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();

    match ext.as_str() {
        "rs" => "rust",
        "py" | "pyi" => "python",
        "js" | "jsx" | "mjs" | "cjs" => "javascript",
        "ts" | "tsx" => "typescript",
        "go" => "go",
        "java" => "java",
        "c" | "h" => "c",
        "cpp" | "cc" | "cxx" | "hpp" | "hh" => "cpp",
        "cs" => "csharp",
        "rb" => "ruby",
        "php" => "php",
        "swift" => "swift",
        "kt" | "kts" => "kotlin",
        "scala" => "scala",
        "sh" | "bash" => "shell",
        "sql" => "sql",
        "proto" => "proto",
        "md" | "markdown" => "markdown",
        "toml" => "toml",
        "yaml" | "yml" => "yaml",
        "json" => "json",
        "html" | "htm" => "html",
        "css" => "css",
        _ => "unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn well_known_extensions_resolve() {
        for (file, lang) in [
            ("main.rs", "rust"),
            ("app.PY", "python"),
            ("index.tsx", "typescript"),
            ("server.go", "go"),
            ("Widget.java", "java"),
            ("schema.sql", "sql"),
            ("notes.md", "markdown"),
        ] {
            assert_eq!(detect_language(&PathBuf::from(file)), lang, "{file}");
        }
    }

    #[test]
    fn unknown_and_missing_extensions_fall_back() {
        assert_eq!(detect_language(&PathBuf::from("data.xyz")), "unknown");
        assert_eq!(detect_language(&PathBuf::from("Makefile")), "unknown");
    }
}
