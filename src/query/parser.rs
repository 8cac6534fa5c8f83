//! Command-line query syntax.
//!
//! Free words form the text term; `field:value` pairs set filters:
//!
//! ```text
//! food bank state:CA ntee:K3 city:"san jose" revenue:1000..50000 assets:>10 sort:-revenue top:20
//! ```
//!
//! `ntee:` takes an NTEE code prefix and `category:` a major group letter or
//! description. Range values accept `N`, `N..M`, `N..`, `..M`, `>N`, `>=N`, `<N` and `<=N`.
//! Unknown fields are kept as literal text.

use crate::error::QueryError;
use crate::query::{Range, SearchRequest, SortOrder};

/// Parse a query string into a search request
pub fn parse_query(input: &str) -> Result<SearchRequest, QueryError> {
    QueryParser::new(input).parse()
}

struct QueryParser<'a> {
    input: &'a str,
    pos: usize,
    request: SearchRequest,
    words: Vec<String>,
}

impl<'a> QueryParser<'a> {
    fn new(input: &'a str) -> Self {
        Self {
            input,
            pos: 0,
            request: SearchRequest::default(),
            words: Vec::new(),
        }
    }

    fn parse(mut self) -> Result<SearchRequest, QueryError> {
        loop {
            self.skip_whitespace();
            if self.is_eof() {
                break;
            }
            if self.peek_char() == Some('"') {
                let phrase = self.parse_quoted();
                if !phrase.trim().is_empty() {
                    self.words.push(phrase.trim().to_string());
                }
                continue;
            }
            self.parse_term()?;
        }

        if !self.words.is_empty() {
            self.request.term = Some(self.words.join(" "));
        }
        Ok(self.request)
    }

    fn parse_term(&mut self) -> Result<(), QueryError> {
        let start = self.pos;

        while let Some(ch) = self.peek_char() {
            if ch.is_alphanumeric() || ch == '_' {
                self.advance();
            } else if ch == ':' && self.pos > start {
                let field = self.input[start..self.pos].to_string();
                self.advance();
                let value = self.parse_value();
                return self.apply_field(&field, value);
            } else {
                break;
            }
        }

        // Plain word: take everything up to the next whitespace
        while let Some(ch) = self.peek_char() {
            if ch.is_whitespace() {
                break;
            }
            self.advance();
        }
        let word = &self.input[start..self.pos];
        if !word.is_empty() {
            self.words.push(word.to_string());
        }
        Ok(())
    }

    fn parse_value(&mut self) -> String {
        if self.peek_char() == Some('"') {
            return self.parse_quoted();
        }
        let start = self.pos;
        while let Some(ch) = self.peek_char() {
            if ch.is_whitespace() {
                break;
            }
            self.advance();
        }
        self.input[start..self.pos].to_string()
    }

    fn parse_quoted(&mut self) -> String {
        self.consume_char('"');
        let start = self.pos;
        while !self.is_eof() && self.peek_char() != Some('"') {
            self.advance();
        }
        let value = self.input[start..self.pos].to_string();
        self.consume_char('"');
        value
    }

    fn apply_field(&mut self, field: &str, value: String) -> Result<(), QueryError> {
        let malformed = |value: &str| QueryError::MalformedFilter {
            field: field.to_string(),
            value: value.to_string(),
        };

        match field.to_lowercase().as_str() {
            "state" | "st" => self.request.filters.state = Some(value),
            "ntee" | "code" => self.request.filters.ntee = Some(value),
            "category" | "cat" => self.request.filters.category = Some(value),
            "city" => self.request.filters.city = Some(value),
            "revenue" | "rev" => {
                self.request.filters.revenue = parse_range(&value).ok_or_else(|| malformed(&value))?
            }
            "assets" => {
                self.request.filters.assets = parse_range(&value).ok_or_else(|| malformed(&value))?
            }
            "sort" => self.request.sort = value.parse::<SortOrder>()?,
            "top" | "limit" => {
                self.request.limit = Some(value.parse().map_err(|_| malformed(&value))?)
            }
            "offset" | "skip" => {
                self.request.offset = value.parse().map_err(|_| malformed(&value))?
            }
            _ => self.words.push(format!("{}:{}", field, value)),
        }
        Ok(())
    }

    fn skip_whitespace(&mut self) {
        while self.peek_char().is_some_and(|c| c.is_whitespace()) {
            self.advance();
        }
    }

    fn is_eof(&self) -> bool {
        self.pos >= self.input.len()
    }

    fn peek_char(&self) -> Option<char> {
        self.input[self.pos..].chars().next()
    }

    fn consume_char(&mut self, expected: char) -> bool {
        if self.peek_char() == Some(expected) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn advance(&mut self) {
        if let Some(ch) = self.peek_char() {
            self.pos += ch.len_utf8();
        }
    }
}

/// Parse a dollar amount, tolerating `_` and `,` separators
fn parse_amount(s: &str) -> Option<u64> {
    let cleaned: String = s.chars().filter(|c| *c != '_' && *c != ',').collect();
    if cleaned.is_empty() {
        return None;
    }
    cleaned.parse().ok()
}

fn parse_range(value: &str) -> Option<Range> {
    let value = value.trim();
    if let Some(rest) = value.strip_prefix(">=") {
        return Some(Range::new(Some(parse_amount(rest)?), None));
    }
    if let Some(rest) = value.strip_prefix("<=") {
        return Some(Range::new(None, Some(parse_amount(rest)?)));
    }
    if let Some(rest) = value.strip_prefix('>') {
        return Some(Range::new(Some(parse_amount(rest)?.checked_add(1)?), None));
    }
    if let Some(rest) = value.strip_prefix('<') {
        return Some(Range::new(None, Some(parse_amount(rest)?.checked_sub(1)?)));
    }
    if let Some((min, max)) = value.split_once("..") {
        let min = if min.is_empty() { None } else { Some(parse_amount(min)?) };
        let max = if max.is_empty() { None } else { Some(parse_amount(max)?) };
        if min.is_none() && max.is_none() {
            return None;
        }
        return Some(Range::new(min, max));
    }
    let exact = parse_amount(value)?;
    Some(Range::new(Some(exact), Some(exact)))
}
