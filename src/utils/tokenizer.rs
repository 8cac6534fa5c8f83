use serde::{Deserialize, Serialize};

/// Default minimum token length kept in the index
pub const MIN_TOKEN_LENGTH: usize = 2;

/// Maximum token length to store in the index.
/// Longer runs are almost always garbage (concatenated fields, encodings).
pub const MAX_TOKEN_LENGTH: usize = 64;

/// Full-text tokenizer shared by the index builder and the query engine,
/// so both sides agree on what a term is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tokenizer {
    pub min_len: usize,
    pub max_len: usize,
}

impl Default for Tokenizer {
    fn default() -> Self {
        Self {
            min_len: MIN_TOKEN_LENGTH,
            max_len: MAX_TOKEN_LENGTH,
        }
    }
}

impl Tokenizer {
    pub fn new(min_len: usize, max_len: usize) -> Self {
        Self {
            min_len: min_len.max(1),
            max_len: max_len.max(min_len.max(1)),
        }
    }

    /// Lowercase, split on non-alphanumeric boundaries, drop tokens outside the
    /// length bounds, collapse adjacent duplicates.
    pub fn tokens(&self, text: &str) -> Vec<String> {
        let mut tokens: Vec<String> = Vec::new();
        let mut current = String::new();

        for ch in text.chars() {
            if ch.is_alphanumeric() {
                current.extend(ch.to_lowercase());
            } else if !current.is_empty() {
                self.push_token(&mut tokens, &mut current);
            }
        }
        if !current.is_empty() {
            self.push_token(&mut tokens, &mut current);
        }

        tokens
    }

    fn push_token(&self, tokens: &mut Vec<String>, current: &mut String) {
        let len = current.chars().count();
        if len >= self.min_len
            && len <= self.max_len
            && tokens.last().map(|last| last != current).unwrap_or(true)
        {
            tokens.push(std::mem::take(current));
        } else {
            current.clear();
        }
    }

    /// Count occurrences per distinct token, sorted by token
    pub fn term_frequencies(&self, text: &str) -> Vec<(String, u32)> {
        let mut tokens = self.tokens(text);
        tokens.sort_unstable();

        let mut freqs: Vec<(String, u32)> = Vec::new();
        for token in tokens {
            match freqs.last_mut() {
                Some((last, count)) if *last == token => *count += 1,
                _ => freqs.push((token, 1)),
            }
        }
        freqs
    }

    /// Distinct tokens of a query, in first-seen order
    pub fn query_terms(&self, text: &str) -> Vec<String> {
        let mut terms: Vec<String> = Vec::new();
        for token in self.tokens(text) {
            if !terms.contains(&token) {
                terms.push(token);
            }
        }
        terms
    }

    /// Canonical form used to compare a query with a name as a whole phrase
    pub fn phrase_key(&self, text: &str) -> String {
        self.tokens(text).join(" ")
    }
}
