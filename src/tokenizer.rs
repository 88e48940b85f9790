use rust_stemmers::{Algorithm, Stemmer};
use std::sync::OnceLock;

/// Fixed English stopword set. Terms in this list never reach the index.
const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "but", "by", "for", "from",
    "had", "has", "have", "he", "her", "his", "if", "in", "into", "is", "it",
    "its", "no", "not", "of", "on", "or", "she", "so", "such", "that", "the",
    "their", "then", "there", "these", "they", "this", "to", "was", "were",
    "will", "with",
];

fn is_stopword(term: &str) -> bool {
    STOPWORDS.binary_search(&term).is_ok()
}

/// Shared stemmer instance. `rust_stemmers` compiles the Snowball English
/// (Porter-family) algorithm; creating it is cheap but not free, so it is
/// process-global.
fn stemmer() -> &'static Stemmer {
    static STEMMER: OnceLock<Stemmer> = OnceLock::new();
    STEMMER.get_or_init(|| Stemmer::create(Algorithm::English))
}

/// Normalizing tokenizer shared by indexing, querying and MMR.
///
/// `tokenize` is a pure function of `(text, stemming flag)`: runs of Unicode
/// letters/digits/underscores are lowercased, tokens shorter than two chars
/// and stopwords are dropped, and the remainder is optionally stemmed. Order
/// and duplicates are preserved.
#[derive(Debug, Clone, Copy)]
pub struct Tokenizer {
    stemming: bool,
}

impl Tokenizer {
    pub fn new(stemming: bool) -> Self {
        Self { stemming }
    }

    pub fn tokenize(&self, text: &str) -> Vec<String> {
        let mut terms = Vec::new();
        let mut current = String::new();

        for ch in text.chars() {
            if ch.is_alphanumeric() || ch == '_' {
                for low in ch.to_lowercase() {
                    current.push(low);
                }
            } else if !current.is_empty() {
                self.flush(&mut current, &mut terms);
            }
        }
        if !current.is_empty() {
            self.flush(&mut current, &mut terms);
        }

        terms
    }

    fn flush(&self, current: &mut String, terms: &mut Vec<String>) {
        let token = std::mem::take(current);
        if token.chars().count() < 2 || is_stopword(&token) {
            return;
        }
        if self.stemming {
            terms.push(stemmer().stem(&token).into_owned());
        } else {
            terms.push(token);
        }
    }

    /// Cheap token-count estimator: split-word count × 1.3, rounded down.
    ///
    /// This is the only sizing function the packer and chunker use; it never
    /// has to agree with `tokenize` term counts.
    pub fn count_tokens(&self, text: &str) -> usize {
        (text.split_whitespace().count() as f64 * 1.3) as usize
    }
}
