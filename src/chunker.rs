use crate::error::Result;
use crate::parsers::ParserRegistry;
use crate::store::{Chunk, Document, DocumentChunk};
use crate::tokenizer::Tokenizer;

/// A structural unit produced by a language parser: function, method, type.
///
/// Line numbers are 1-based and inclusive. `content` covers the whole unit
/// including its signature line; `children` holds nested units (methods of an
/// impl/class) which stay embedded in the parent's chunks.
#[derive(Debug, Clone)]
pub struct CodeUnit {
    pub kind: String,
    pub name: String,
    pub signature: String,
    pub start_line: u32,
    pub end_line: u32,
    pub content: String,
    pub doc_string: Option<String>,
    pub children: Vec<CodeUnit>,
    pub calls: Vec<String>,
}

/// Producer of `CodeUnit`s for one language, registered by language tag.
pub trait LanguageParser: Send + Sync {
    fn language(&self) -> &'static str;
    fn parse_units(&self, content: &str) -> Result<Vec<CodeUnit>>;
}

/// Splits one document into retrieval chunks.
pub trait Chunker: Send + Sync {
    fn chunk(&self, doc: &Document, content: &str) -> Vec<DocumentChunk>;
}

/// Doc-strings longer than this are not prepended as chunk headers.
const MAX_DOC_HEADER_CHARS: usize = 500;

// ---------------------------------------------------------------------------
// Line-window chunker: the universal fallback
// ---------------------------------------------------------------------------

/// Accumulates lines until the token estimate would exceed the budget, then
/// emits and backs up far enough to carry `overlap_tokens` into the next
/// chunk. A single line over the budget becomes its own chunk; lines are
/// never split.
#[derive(Debug, Clone)]
pub struct LineChunker {
    tokenizer: Tokenizer,
    max_tokens: usize,
    overlap_tokens: usize,
}

impl LineChunker {
    pub fn new(tokenizer: Tokenizer, max_tokens: usize, overlap_tokens: usize) -> Self {
        Self {
            tokenizer,
            max_tokens: max_tokens.max(1),
            overlap_tokens,
        }
    }
}

impl Chunker for LineChunker {
    fn chunk(&self, doc: &Document, content: &str) -> Vec<DocumentChunk> {
        let lines: Vec<&str> = content.lines().collect();
        if lines.is_empty() {
            return Vec::new();
        }
        let line_tokens: Vec<usize> = lines
            .iter()
            .map(|l| self.tokenizer.count_tokens(l))
            .collect();

        let mut out = Vec::new();
        let mut start = 0usize; // 0-based
        while start < lines.len() {
            let mut end = start;
            let mut used = line_tokens[start];
            if used <= self.max_tokens {
                while end + 1 < lines.len() && used + line_tokens[end + 1] <= self.max_tokens {
                    end += 1;
                    used += line_tokens[end];
                }
            }

            let text = lines[start..=end].join("\n");
            let start_line = start as u32 + 1;
            let end_line = end as u32 + 1;
            out.push(DocumentChunk {
                chunk: Chunk {
                    id: Chunk::window_id(&doc.id, start_line, end_line),
                    doc_id: doc.id.clone(),
                    start_line,
                    end_line,
                    tokens: self.tokenizer.tokenize(&text),
                },
                text,
            });

            if end + 1 >= lines.len() {
                break;
            }
            start = self.next_start(&line_tokens, start, end);
        }
        out
    }
}

impl LineChunker {
    /// Walk backward from the emitted chunk's end until the token sum covers
    /// the overlap budget; the next chunk starts at end − walked-lines,
    /// forced to make progress and to stay within the emitted range.
    fn next_start(&self, line_tokens: &[usize], start: usize, end: usize) -> usize {
        if self.overlap_tokens == 0 {
            return end + 1;
        }
        let mut sum = 0usize;
        let mut walked = 0usize;
        let mut j = end;
        loop {
            sum += line_tokens[j];
            walked += 1;
            if sum >= self.overlap_tokens || j == start {
                break;
            }
            j -= 1;
        }
        let candidate = end.saturating_sub(walked);
        if candidate <= start {
            start + 1
        } else {
            candidate
        }
    }
}

// ---------------------------------------------------------------------------
// AST chunker: language-routed, falls back to the window chunker
// ---------------------------------------------------------------------------

pub struct AstChunker {
    registry: ParserRegistry,
    window: LineChunker,
    tokenizer: Tokenizer,
    max_tokens: usize,
}

impl AstChunker {
    pub fn new(
        registry: ParserRegistry,
        tokenizer: Tokenizer,
        max_tokens: usize,
        overlap_tokens: usize,
    ) -> Self {
        Self {
            registry,
            window: LineChunker::new(tokenizer, max_tokens, overlap_tokens),
            tokenizer,
            max_tokens: max_tokens.max(1),
        }
    }

    fn chunk_unit(&self, doc: &Document, unit: &CodeUnit, out: &mut Vec<DocumentChunk>) {
        let estimate = self.tokenizer.count_tokens(&unit.content);
        if estimate <= self.max_tokens {
            let mut text = String::new();
            if let Some(ds) = &unit.doc_string {
                if !ds.is_empty() && ds.len() <= MAX_DOC_HEADER_CHARS {
                    text.push_str(ds);
                    text.push('\n');
                }
            }
            text.push_str(&unit.content);

            out.push(DocumentChunk {
                chunk: Chunk {
                    id: Chunk::unit_id(&doc.id, &unit.kind, &unit.name, unit.start_line),
                    doc_id: doc.id.clone(),
                    start_line: unit.start_line,
                    end_line: unit.end_line,
                    tokens: self.tokenizer.tokenize(&text),
                },
                text,
            });
            return;
        }

        // Oversized unit: split its body into budget-sized parts, each headed
        // by the unit signature, with a continuation marker on all but the
        // last part. Line numbers offset into the unit's own body.
        let body_lines: Vec<&str> = unit.content.lines().collect();
        let line_tokens: Vec<usize> = body_lines
            .iter()
            .map(|l| self.tokenizer.count_tokens(l))
            .collect();

        let mut parts: Vec<(usize, usize)> = Vec::new();
        let mut start = 0usize;
        while start < body_lines.len() {
            let mut end = start;
            let mut used = line_tokens[start];
            if used <= self.max_tokens {
                while end + 1 < body_lines.len() && used + line_tokens[end + 1] <= self.max_tokens {
                    end += 1;
                    used += line_tokens[end];
                }
            }
            parts.push((start, end));
            start = end + 1;
        }

        let total = parts.len();
        for (i, (s, e)) in parts.into_iter().enumerate() {
            let is_last = i + 1 == total;
            let header = if is_last {
                unit.signature.clone()
            } else {
                format!("{} (continued)", unit.signature)
            };
            let text = format!("{}\n{}", header, body_lines[s..=e].join("\n"));

            let start_line = unit.start_line + s as u32;
            let end_line = unit.start_line + e as u32;
            out.push(DocumentChunk {
                chunk: Chunk {
                    id: Chunk::unit_id(&doc.id, &unit.kind, &unit.name, start_line),
                    doc_id: doc.id.clone(),
                    start_line,
                    end_line,
                    tokens: self.tokenizer.tokenize(&text),
                },
                text,
            });
        }
    }
}

impl Chunker for AstChunker {
    fn chunk(&self, doc: &Document, content: &str) -> Vec<DocumentChunk> {
        let Some(parser) = self.registry.get(&doc.language) else {
            return self.window.chunk(doc, content);
        };

        let units = match parser.parse_units(content) {
            Ok(units) if !units.is_empty() => units,
            Ok(_) => {
                tracing::debug!(path = %doc.path, "no structural units, using line windows");
                return self.window.chunk(doc, content);
            }
            Err(err) => {
                tracing::warn!(path = %doc.path, %err, "parser failed, using line windows");
                return self.window.chunk(doc, content);
            }
        };

        let mut out = Vec::new();
        for unit in &units {
            self.chunk_unit(doc, unit, &mut out);
        }
        if out.is_empty() {
            return self.window.chunk(doc, content);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RagError;

    fn doc(language: &str) -> Document {
        Document {
            id: "testdoc0testdoc0".to_string(),
            path: "/corpus/file.x".to_string(),
            mtime: 0,
            language: language.to_string(),
            content_hash: 0,
        }
    }

    fn window(max_tokens: usize, overlap: usize) -> LineChunker {
        LineChunker::new(Tokenizer::new(false), max_tokens, overlap)
    }

    #[test]
    fn small_document_becomes_one_chunk() {
        let chunks = window(100, 10).chunk(&doc("unknown"), "alpha beta\ngamma delta");
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].chunk.start_line, 1);
        assert_eq!(chunks[0].chunk.end_line, 2);
        assert_eq!(chunks[0].text, "alpha beta\ngamma delta");
        assert_eq!(chunks[0].chunk.id, "testdoc0testdoc0:1-2");
    }

    #[test]
    fn ranges_are_1_based_inclusive_and_ordered() {
        // each line ≈ 2 words → floor(2 * 1.3) = 2 tokens
        let content = (0..12)
            .map(|i| format!("word{i} word{i}"))
            .collect::<Vec<_>>()
            .join("\n");
        let chunks = window(6, 0).chunk(&doc("unknown"), &content);

        assert!(chunks.len() > 1);
        for dc in &chunks {
            assert!(dc.chunk.start_line <= dc.chunk.end_line);
        }
        // no overlap requested: consecutive ranges touch without gaps
        for pair in chunks.windows(2) {
            assert_eq!(pair[1].chunk.start_line, pair[0].chunk.end_line + 1);
        }
        assert_eq!(chunks.last().unwrap().chunk.end_line, 12);
    }

    #[test]
    fn overlap_windows_rewind_but_always_progress() {
        let content = (0..20)
            .map(|i| format!("word{i} word{i} word{i}")) // 3 words → 3 tokens
            .collect::<Vec<_>>()
            .join("\n");
        let chunks = window(9, 3).chunk(&doc("unknown"), &content);

        assert!(chunks.len() > 2);
        for pair in chunks.windows(2) {
            let prev = &pair[0].chunk;
            let next = &pair[1].chunk;
            assert!(next.start_line > prev.start_line, "chunker must progress");
            assert!(next.start_line <= prev.end_line + 1, "no line may be skipped");
        }
    }

    #[test]
    fn oversized_single_line_gets_its_own_chunk() {
        let huge = (0..100).map(|i| format!("w{i}")).collect::<Vec<_>>().join(" ");
        let content = format!("small line\n{huge}\ntail line");
        let chunks = window(10, 2).chunk(&doc("unknown"), &content);

        let oversized = chunks
            .iter()
            .find(|c| c.chunk.start_line == 2 && c.chunk.end_line == 2)
            .expect("oversized line must be emitted alone");
        assert!(oversized.text.starts_with("w0"));
        assert_eq!(chunks.last().unwrap().chunk.end_line, 3);
    }

    #[test]
    fn token_vector_matches_tokenizer_output() {
        let chunks = window(100, 0).chunk(&doc("unknown"), "The quick brown fox\njumps over");
        let expected = Tokenizer::new(false).tokenize("The quick brown fox\njumps over");
        assert_eq!(chunks[0].chunk.tokens, expected);
    }

    // ── AST chunker ───────────────────────────────────────────────────────

    struct FixedParser {
        units: Vec<CodeUnit>,
    }

    impl LanguageParser for FixedParser {
        fn language(&self) -> &'static str {
            "fixed"
        }
        fn parse_units(&self, _content: &str) -> Result<Vec<CodeUnit>> {
            Ok(self.units.clone())
        }
    }

    struct FailingParser;

    impl LanguageParser for FailingParser {
        fn language(&self) -> &'static str {
            "failing"
        }
        fn parse_units(&self, _content: &str) -> Result<Vec<CodeUnit>> {
            Err(RagError::Parse("boom".to_string()))
        }
    }

    fn unit(name: &str, start: u32, end: u32, content: &str, doc_string: Option<&str>) -> CodeUnit {
        CodeUnit {
            kind: "function".to_string(),
            name: name.to_string(),
            signature: content.lines().next().unwrap_or("").to_string(),
            start_line: start,
            end_line: end,
            content: content.to_string(),
            doc_string: doc_string.map(str::to_string),
            children: Vec::new(),
            calls: Vec::new(),
        }
    }

    fn ast_chunker(parser: std::sync::Arc<dyn LanguageParser>, max_tokens: usize) -> AstChunker {
        let mut registry = ParserRegistry::new();
        registry.register(parser);
        AstChunker::new(registry, Tokenizer::new(false), max_tokens, 0)
    }

    #[test]
    fn small_unit_emits_one_chunk_with_doc_header() {
        let content = "fn add(a: i32, b: i32) -> i32 {\n    a + b\n}";
        let parser = FixedParser {
            units: vec![unit("add", 3, 5, content, Some("Adds two numbers."))],
        };
        let chunker = ast_chunker(std::sync::Arc::new(parser), 100);
        let chunks = chunker.chunk(&doc("fixed"), "irrelevant");

        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].text.starts_with("Adds two numbers.\n"));
        assert_eq!(chunks[0].chunk.start_line, 3);
        assert_eq!(chunks[0].chunk.end_line, 5);
        assert_eq!(chunks[0].chunk.id, "testdoc0testdoc0:function:add:3");
    }

    #[test]
    fn long_doc_string_is_not_prepended() {
        let content = "fn add() {}";
        let long_doc = "x".repeat(MAX_DOC_HEADER_CHARS + 1);
        let parser = FixedParser {
            units: vec![unit("add", 1, 1, content, Some(&long_doc))],
        };
        let chunker = ast_chunker(std::sync::Arc::new(parser), 100);
        let chunks = chunker.chunk(&doc("fixed"), "irrelevant");
        assert_eq!(chunks[0].text, content);
    }

    #[test]
    fn oversized_unit_splits_with_signature_and_continuation_marker() {
        let mut lines = vec!["fn big(input: &str) -> usize {".to_string()];
        for i in 0..30 {
            lines.push(format!("    let v{i} = input.len() + {i};"));
        }
        lines.push("}".to_string());
        let content = lines.join("\n");

        let parser = FixedParser {
            units: vec![unit("big", 10, 41, &content, None)],
        };
        let chunker = ast_chunker(std::sync::Arc::new(parser), 30);
        let chunks = chunker.chunk(&doc("fixed"), "irrelevant");

        assert!(chunks.len() > 1);
        for (i, dc) in chunks.iter().enumerate() {
            let first_line = dc.text.lines().next().unwrap();
            assert!(first_line.starts_with("fn big(input: &str) -> usize {"));
            if i + 1 < chunks.len() {
                assert!(first_line.ends_with("(continued)"));
            } else {
                assert!(!first_line.ends_with("(continued)"));
            }
        }
        // line numbers offset into the unit body
        assert_eq!(chunks[0].chunk.start_line, 10);
        assert_eq!(chunks.last().unwrap().chunk.end_line, 41);
    }

    #[test]
    fn parser_failure_falls_back_to_line_windows() {
        let chunker = ast_chunker(std::sync::Arc::new(FailingParser), 100);
        let chunks = chunker.chunk(&doc("failing"), "alpha beta\ngamma");
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].chunk.id, "testdoc0testdoc0:1-2");
    }

    #[test]
    fn unregistered_language_falls_back_to_line_windows() {
        let chunker = ast_chunker(std::sync::Arc::new(FailingParser), 100);
        let chunks = chunker.chunk(&doc("cobol"), "alpha beta");
        assert_eq!(chunks.len(), 1);
    }
}
