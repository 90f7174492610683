//! Content validators: URL detection and forbidden-term matching.

use regex::Regex;
use std::sync::LazyLock;

const URL_PATTERN: &str =
    r"https?://(?:[a-zA-Z]|[0-9]|[$-_@.&+]|[!*\\(),]|(?:%[0-9a-fA-F][0-9a-fA-F]))+";

/// Fixed moderation list: "die", "kill", "murder".
pub const DEFAULT_FORBIDDEN_TERMS: [&str; 3] = ["死ね", "殺す", "殺害"];

static URL_MATCHER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(URL_PATTERN).expect("URL pattern is a valid regex"));

/// True if an http(s) URL appears anywhere in `text`.
pub fn contains_url(text: &str) -> bool {
    URL_MATCHER.is_match(text)
}

#[derive(Debug, Clone)]
pub struct ContentFilter {
    forbidden_terms: Vec<String>,
}

impl ContentFilter {
    pub fn new<I, S>(forbidden_terms: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            forbidden_terms: forbidden_terms
                .into_iter()
                .map(Into::into)
                .filter(|term: &String| !term.is_empty())
                .collect(),
        }
    }

    pub fn contains_url(&self, text: &str) -> bool {
        contains_url(text)
    }

    /// First term, in list order, that occurs as a literal substring.
    pub fn contains_forbidden_term(&self, text: &str) -> Option<&str> {
        self.forbidden_terms
            .iter()
            .find(|term| text.contains(term.as_str()))
            .map(String::as_str)
    }

    pub fn forbidden_terms(&self) -> &[String] {
        &self.forbidden_terms
    }
}

impl Default for ContentFilter {
    fn default() -> Self {
        Self::new(DEFAULT_FORBIDDEN_TERMS)
    }
}
