use crate::chunker::{CodeUnit, LanguageParser};
use crate::error::{RagError, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tree_sitter::{Language, Node, Parser};

/// Upper bound on call names recorded per unit.
const MAX_CALLS: usize = 32;

/// Grammar-level description of one language: which node kinds form top-level
/// units, which host nested members, and how comments look.
struct LanguageSpec {
    tag: &'static str,
    /// Function pointer keeps the spec `Send + Sync` without assumptions
    /// about the grammar handle itself.
    language: fn() -> Language,
    /// node kind → unit label for top-level units.
    units: &'static [(&'static str, &'static str)],
    /// node kind → unit label for members nested inside containers.
    members: &'static [(&'static str, &'static str)],
    /// Node kinds whose bodies are scanned for members.
    containers: &'static [&'static str],
    /// Transparent wrappers (decorators, export statements) to unwrap.
    wrappers: &'static [&'static str],
    /// Node kinds counted as call sites.
    call_kinds: &'static [&'static str],
    /// Uses the language's in-body docstring convention instead of leading
    /// comments.
    body_docstring: bool,
}

pub struct TreeSitterParser {
    spec: LanguageSpec,
}

impl TreeSitterParser {
    fn lookup(table: &[(&str, &str)], kind: &str) -> Option<String> {
        table
            .iter()
            .find(|(k, _)| *k == kind)
            .map(|(_, label)| label.to_string())
    }

    fn unwrap_node<'t>(&self, node: Node<'t>) -> Node<'t> {
        let mut current = node;
        while self.spec.wrappers.contains(&current.kind()) {
            let inner = current
                .child_by_field_name("definition")
                .or_else(|| current.child_by_field_name("declaration"))
                .or_else(|| {
                    (0..current.named_child_count())
                        .filter_map(|i| current.named_child(i))
                        .find(|c| {
                            Self::lookup(self.spec.units, c.kind()).is_some()
                                || Self::lookup(self.spec.members, c.kind()).is_some()
                        })
                });
            match inner {
                Some(inner) => current = inner,
                None => break,
            }
        }
        current
    }

    fn node_text<'s>(node: Node<'_>, source: &'s str) -> &'s str {
        node.utf8_text(source.as_bytes()).unwrap_or_default()
    }

    fn node_name(&self, node: Node<'_>, source: &str) -> String {
        if let Some(name) = node.child_by_field_name("name") {
            return Self::node_text(name, source).to_string();
        }
        // rust impl blocks name the implemented type
        if let Some(ty) = node.child_by_field_name("type") {
            return Self::node_text(ty, source).to_string();
        }
        // fallback: first identifier-ish descendant, two levels deep
        for depth1 in (0..node.named_child_count()).filter_map(|i| node.named_child(i)) {
            if depth1.kind().ends_with("identifier") {
                return Self::node_text(depth1, source).to_string();
            }
            for depth2 in (0..depth1.named_child_count()).filter_map(|i| depth1.named_child(i)) {
                if depth2.kind().ends_with("identifier") {
                    return Self::node_text(depth2, source).to_string();
                }
            }
        }
        "anonymous".to_string()
    }

    fn signature_of(content: &str) -> String {
        content
            .lines()
            .next()
            .unwrap_or("")
            .trim_end()
            .trim_end_matches('{')
            .trim_end()
            .to_string()
    }

    /// Consecutive comment siblings directly above the node, with common
    /// comment markers stripped.
    fn leading_comments(node: Node<'_>, source: &str) -> Option<String> {
        let mut lines: Vec<String> = Vec::new();
        let mut prev = node.prev_sibling();
        let mut expected_row = node.start_position().row;

        while let Some(sibling) = prev {
            if !sibling.kind().contains("comment") {
                break;
            }
            if sibling.end_position().row + 1 < expected_row {
                break;
            }
            expected_row = sibling.start_position().row;

            let text = Self::node_text(sibling, source);
            for raw in text.lines().rev() {
                let stripped = raw
                    .trim()
                    .trim_start_matches("///")
                    .trim_start_matches("//!")
                    .trim_start_matches("//")
                    .trim_start_matches("/**")
                    .trim_start_matches("/*")
                    .trim_end_matches("*/")
                    .trim_start_matches('*')
                    .trim_start_matches('#')
                    .trim();
                lines.push(stripped.to_string());
            }
            prev = sibling.prev_sibling();
        }

        if lines.is_empty() {
            return None;
        }
        lines.reverse();
        let joined = lines.join("\n").trim().to_string();
        if joined.is_empty() {
            None
        } else {
            Some(joined)
        }
    }

    /// Python-style docstring: first string expression of the body.
    fn body_docstring(node: Node<'_>, source: &str) -> Option<String> {
        let body = node.child_by_field_name("body")?;
        let first = body.named_child(0)?;
        let string_node = if first.kind() == "expression_statement" {
            first.named_child(0)?
        } else {
            first
        };
        if !string_node.kind().contains("string") {
            return None;
        }
        let raw = Self::node_text(string_node, source);
        let trimmed = raw
            .trim_start_matches("r\"\"\"")
            .trim_start_matches("\"\"\"")
            .trim_start_matches("'''")
            .trim_end_matches("\"\"\"")
            .trim_end_matches("'''")
            .trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    }

    fn collect_calls(&self, node: Node<'_>, source: &str, out: &mut Vec<String>) {
        let mut stack = vec![node];
        while let Some(current) = stack.pop() {
            if out.len() >= MAX_CALLS {
                return;
            }
            if self.spec.call_kinds.contains(&current.kind()) {
                if let Some(callee) = current
                    .child_by_field_name("function")
                    .or_else(|| current.named_child(0))
                {
                    let name = Self::node_text(callee, source);
                    // keep the trailing path segment of `a::b.c(...)` chains
                    let short = name
                        .rsplit(|c| c == '.' || c == ':')
                        .next()
                        .unwrap_or(name)
                        .trim()
                        .to_string();
                    if !short.is_empty() && !out.contains(&short) {
                        out.push(short);
                    }
                }
            }
            for i in 0..current.named_child_count() {
                if let Some(child) = current.named_child(i) {
                    stack.push(child);
                }
            }
        }
    }

    fn collect_members(&self, node: Node<'_>, source: &str) -> Vec<CodeUnit> {
        let mut members = Vec::new();
        for depth1 in (0..node.named_child_count()).filter_map(|i| node.named_child(i)) {
            if let Some(label) = Self::lookup(self.spec.members, depth1.kind()) {
                members.push(self.build_unit(depth1, source, &label, false));
                continue;
            }
            // members usually live one level down, inside a body/declaration list
            for depth2 in (0..depth1.named_child_count()).filter_map(|i| depth1.named_child(i)) {
                let unwrapped = self.unwrap_node(depth2);
                if let Some(label) = Self::lookup(self.spec.members, unwrapped.kind()) {
                    members.push(self.build_unit(unwrapped, source, &label, false));
                }
            }
        }
        members
    }

    fn build_unit(&self, node: Node<'_>, source: &str, label: &str, with_members: bool) -> CodeUnit {
        let content = Self::node_text(node, source).to_string();
        let doc_string = if self.spec.body_docstring {
            Self::body_docstring(node, source)
        } else {
            Self::leading_comments(node, source)
        };

        let mut calls = Vec::new();
        self.collect_calls(node, source, &mut calls);

        let children = if with_members && self.spec.containers.contains(&node.kind()) {
            self.collect_members(node, source)
        } else {
            Vec::new()
        };

        CodeUnit {
            kind: label.to_string(),
            name: self.node_name(node, source),
            signature: Self::signature_of(&content),
            start_line: node.start_position().row as u32 + 1,
            end_line: node.end_position().row as u32 + 1,
            content,
            doc_string,
            children,
            calls,
        }
    }
}

impl LanguageParser for TreeSitterParser {
    fn language(&self) -> &'static str {
        self.spec.tag
    }

    fn parse_units(&self, content: &str) -> Result<Vec<CodeUnit>> {
        let mut parser = Parser::new();
        parser
            .set_language(&(self.spec.language)())
            .map_err(|e| RagError::Parse(format!("{}: {e}", self.spec.tag)))?;

        let tree = parser
            .parse(content, None)
            .ok_or_else(|| RagError::Parse(format!("{}: parser produced no tree", self.spec.tag)))?;
        let root = tree.root_node();

        let mut units = Vec::new();
        for child in (0..root.named_child_count()).filter_map(|i| root.named_child(i)) {
            let node = self.unwrap_node(child);
            if let Some(label) = Self::lookup(self.spec.units, node.kind()) {
                units.push(self.build_unit(node, content, &label, true));
            }
        }
        Ok(units)
    }
}

// ---------------------------------------------------------------------------
// Language table
// ---------------------------------------------------------------------------

pub fn rust_parser() -> TreeSitterParser {
    TreeSitterParser {
        spec: LanguageSpec {
            tag: "rust",
            language: tree_sitter_rust::language,
            units: &[
                ("function_item", "function"),
                ("struct_item", "struct"),
                ("enum_item", "enum"),
                ("trait_item", "trait"),
                ("impl_item", "impl"),
                ("macro_definition", "macro"),
            ],
            members: &[("function_item", "function")],
            containers: &["impl_item", "trait_item"],
            wrappers: &[],
            call_kinds: &["call_expression", "macro_invocation"],
            body_docstring: false,
        },
    }
}

pub fn python_parser() -> TreeSitterParser {
    TreeSitterParser {
        spec: LanguageSpec {
            tag: "python",
            language: tree_sitter_python::language,
            units: &[
                ("function_definition", "function"),
                ("class_definition", "class"),
            ],
            members: &[("function_definition", "function")],
            containers: &["class_definition"],
            wrappers: &["decorated_definition"],
            call_kinds: &["call"],
            body_docstring: true,
        },
    }
}

pub fn typescript_parser() -> TreeSitterParser {
    TreeSitterParser {
        spec: LanguageSpec {
            tag: "typescript",
            language: tree_sitter_typescript::language_typescript,
            units: &[
                ("function_declaration", "function"),
                ("class_declaration", "class"),
                ("interface_declaration", "interface"),
                ("enum_declaration", "enum"),
                ("type_alias_declaration", "type"),
            ],
            members: &[("method_definition", "method")],
            containers: &["class_declaration"],
            wrappers: &["export_statement"],
            call_kinds: &["call_expression"],
            body_docstring: false,
        },
    }
}

#[cfg(feature = "lang-go")]
pub fn go_parser() -> TreeSitterParser {
    TreeSitterParser {
        spec: LanguageSpec {
            tag: "go",
            language: tree_sitter_go::language,
            units: &[
                ("function_declaration", "function"),
                ("method_declaration", "method"),
                ("type_declaration", "type"),
            ],
            members: &[],
            containers: &[],
            wrappers: &[],
            call_kinds: &["call_expression"],
            body_docstring: false,
        },
    }
}

#[cfg(feature = "lang-java")]
pub fn java_parser() -> TreeSitterParser {
    TreeSitterParser {
        spec: LanguageSpec {
            tag: "java",
            language: tree_sitter_java::language,
            units: &[
                ("class_declaration", "class"),
                ("interface_declaration", "interface"),
                ("enum_declaration", "enum"),
            ],
            members: &[
                ("method_declaration", "method"),
                ("constructor_declaration", "method"),
            ],
            containers: &["class_declaration", "interface_declaration", "enum_declaration"],
            wrappers: &[],
            call_kinds: &["method_invocation"],
            body_docstring: false,
        },
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Language tag → parser table consulted by the AST chunker.
pub struct ParserRegistry {
    parsers: HashMap<&'static str, Arc<dyn LanguageParser>>,
}

impl ParserRegistry {
    pub fn new() -> Self {
        Self {
            parsers: HashMap::new(),
        }
    }

    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(rust_parser()));
        registry.register(Arc::new(python_parser()));
        registry.register(Arc::new(typescript_parser()));
        #[cfg(feature = "lang-go")]
        registry.register(Arc::new(go_parser()));
        #[cfg(feature = "lang-java")]
        registry.register(Arc::new(java_parser()));
        registry
    }

    pub fn register(&mut self, parser: Arc<dyn LanguageParser>) {
        self.parsers.insert(parser.language(), parser);
    }

    pub fn get(&self, language: &str) -> Option<Arc<dyn LanguageParser>> {
        self.parsers.get(language).cloned()
    }

    pub fn languages(&self) -> Vec<&'static str> {
        let mut tags: Vec<&'static str> = self.parsers.keys().copied().collect();
        tags.sort_unstable();
        tags
    }
}

impl Default for ParserRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rust_units_carry_names_ranges_and_doc_comments() {
        let source = r#"/// Adds two numbers.
fn add(a: i32, b: i32) -> i32 {
    a + b
}

struct Point {
    x: f32,
    y: f32,
}

impl Point {
    fn norm(&self) -> f32 {
        (self.x * self.x + self.y * self.y).sqrt()
    }
}
"#;
        let units = rust_parser().parse_units(source).unwrap();
        assert_eq!(units.len(), 3);

        let add = &units[0];
        assert_eq!(add.kind, "function");
        assert_eq!(add.name, "add");
        assert_eq!(add.start_line, 2);
        assert_eq!(add.end_line, 4);
        assert_eq!(add.doc_string.as_deref(), Some("Adds two numbers."));
        assert_eq!(add.signature, "fn add(a: i32, b: i32) -> i32");

        let point_impl = &units[2];
        assert_eq!(point_impl.kind, "impl");
        assert_eq!(point_impl.name, "Point");
        assert_eq!(point_impl.children.len(), 1);
        assert_eq!(point_impl.children[0].name, "norm");
        assert!(point_impl.calls.contains(&"sqrt".to_string()));
    }

    #[test]
    fn python_docstring_and_decorated_defs() {
        let source = r#"@cached
def lookup(key):
    """Return the cached value for key."""
    return table.get(key)

class Store:
    def get(self, key):
        return self.data[key]
"#;
        let units = python_parser().parse_units(source).unwrap();
        assert_eq!(units.len(), 2);
        assert_eq!(units[0].name, "lookup");
        assert_eq!(
            units[0].doc_string.as_deref(),
            Some("Return the cached value for key.")
        );
        assert_eq!(units[1].kind, "class");
        assert_eq!(units[1].children.len(), 1);
    }

    #[test]
    fn typescript_export_wrappers_unwrap() {
        let source = r#"export function greet(name: string): string {
    return formatName(name);
}

export interface User {
    id: number;
}
"#;
        let units = typescript_parser().parse_units(source).unwrap();
        assert_eq!(units.len(), 2);
        assert_eq!(units[0].kind, "function");
        assert_eq!(units[0].name, "greet");
        assert!(units[0].calls.contains(&"formatName".to_string()));
        assert_eq!(units[1].kind, "interface");
    }

    #[test]
    fn prose_yields_no_units() {
        let units = rust_parser().parse_units("just some plain text\n").unwrap();
        assert!(units.is_empty());
    }

    #[test]
    fn registry_routes_by_language_tag() {
        let registry = ParserRegistry::with_defaults();
        assert!(registry.get("rust").is_some());
        assert!(registry.get("python").is_some());
        assert!(registry.get("cobol").is_none());
        assert!(registry.languages().contains(&"typescript"));
    }
}
