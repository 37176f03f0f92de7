use regex::Regex;
use std::collections::HashSet;
use std::sync::OnceLock;

const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "by", "for", "from", "in", "is", "it", "of",
    "on", "or", "that", "the", "this", "to", "was", "were", "with",
];

fn token_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"[\p{L}\p{N}]+").expect("token pattern is valid"))
}

/// Case-fold, strip punctuation, drop stop words and repeats.
///
/// Order of first occurrence is kept so callers can show matched terms.
pub fn tokenize(text: &str) -> Vec<String> {
    let normalized = text.to_lowercase();
    let mut seen = HashSet::new();
    let mut tokens = Vec::new();

    for found in token_pattern().find_iter(&normalized) {
        let token = found.as_str();
        if STOPWORDS.contains(&token) {
            continue;
        }
        if seen.insert(token.to_string()) {
            tokens.push(token.to_string());
        }
    }

    tokens
}
