//! Pinning evaluator claims to spans of the response text.
//!
//! Claims are matched with decreasing confidence: verbatim, then with
//! whitespace collapsed, then by a five-word window, then by a sentence that
//! shares key terms with the claim. The first strategy that hits wins.

use regex::Regex;
use std::sync::OnceLock;
use tracing::{debug, warn};

use super::types::{Claim, LocatedClaim, MatchMethod};

/// Words too common to count as key terms.
const STOPWORDS: &[&str] = &[
    "these", "those", "their", "there", "about", "after", "before", "which", "would", "could",
    "should",
];

fn sentence_boundary() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[.!?]\s+").expect("static regex"))
}

/// Finds where claims sit inside a response.
#[derive(Debug, Clone)]
pub struct ClaimLocator {
    /// Words per sliding window in the partial-phrase search
    phrase_window: usize,
    /// Key terms a sentence must share with the claim
    min_key_terms: usize,
    /// Sentences must be longer than this (characters)
    min_sentence_chars: usize,
    /// Key terms must be longer than this (characters)
    min_term_chars: usize,
}

impl Default for ClaimLocator {
    fn default() -> Self {
        Self::new()
    }
}

impl ClaimLocator {
    pub fn new() -> Self {
        Self {
            phrase_window: 5,
            min_key_terms: 2,
            min_sentence_chars: 20,
            min_term_chars: 4,
        }
    }

    /// Set the partial-phrase window size.
    pub fn with_phrase_window(mut self, words: usize) -> Self {
        self.phrase_window = words.max(1);
        self
    }

    /// Set how many key terms a sentence must share.
    pub fn with_min_key_terms(mut self, terms: usize) -> Self {
        self.min_key_terms = terms.max(1);
        self
    }

    /// Locate every claim it can; unlocated claims are logged and skipped.
    pub fn locate(&self, response_text: &str, claims: &[Claim]) -> Vec<LocatedClaim> {
        claims
            .iter()
            .filter_map(|claim| {
                let located = self.locate_one(response_text, claim);
                if located.is_none() && !claim.text.trim().is_empty() {
                    warn!(
                        claim = %preview(&claim.text, 60),
                        "Could not locate claim in content"
                    );
                }
                located
            })
            .collect()
    }

    /// Locate a single claim.
    pub fn locate_one(&self, response_text: &str, claim: &Claim) -> Option<LocatedClaim> {
        let text = claim.text.as_str();
        if text.trim().is_empty() {
            return None;
        }

        let (start, length, method) = self
            .find_exact(response_text, text)
            .or_else(|| self.find_normalized(response_text, text))
            .or_else(|| self.find_partial_phrase(response_text, text))
            .or_else(|| self.find_by_sentence(response_text, text))?;

        debug!(%method, start, length, "Located claim");
        Some(LocatedClaim::new(claim.clone(), start, length, method))
    }

    fn find_exact(&self, haystack: &str, needle: &str) -> Option<(usize, usize, MatchMethod)> {
        haystack
            .find(needle)
            .map(|idx| (idx, needle.len(), MatchMethod::Exact))
    }

    fn find_normalized(&self, haystack: &str, needle: &str) -> Option<(usize, usize, MatchMethod)> {
        let (norm_needle, _) = normalize_whitespace(needle);
        if norm_needle.is_empty() {
            return None;
        }
        let (norm_haystack, offsets) = normalize_whitespace(haystack);
        let norm_start = norm_haystack.find(&norm_needle)?;
        let norm_end = norm_start + norm_needle.len();

        let last = norm_haystack[..norm_end].chars().next_back()?;
        let start = offsets[norm_start];
        let end = offsets[norm_end - last.len_utf8()] + last.len_utf8();
        Some((start, end - start, MatchMethod::Normalized))
    }

    fn find_partial_phrase(
        &self,
        haystack: &str,
        needle: &str,
    ) -> Option<(usize, usize, MatchMethod)> {
        let words: Vec<&str> = needle.split_whitespace().collect();
        if words.len() < self.phrase_window {
            return None;
        }

        words.windows(self.phrase_window).find_map(|window| {
            let phrase = window.join(" ");
            haystack
                .find(&phrase)
                .map(|idx| (idx, phrase.len(), MatchMethod::PartialPhrase))
        })
    }

    fn find_by_sentence(&self, haystack: &str, needle: &str) -> Option<(usize, usize, MatchMethod)> {
        let terms = self.key_terms(needle);
        if terms.len() < self.min_key_terms {
            return None;
        }

        split_sentences(haystack)
            .into_iter()
            .find(|&(start, end)| {
                let sentence = &haystack[start..end];
                if sentence.chars().count() <= self.min_sentence_chars {
                    return false;
                }
                let lower = sentence.to_lowercase();
                let hits = terms.iter().filter(|t| lower.contains(t.as_str())).count();
                hits >= self.min_key_terms
            })
            .map(|(start, end)| (start, end - start, MatchMethod::SentenceHeuristic))
    }

    /// Lowercased claim words long enough to be distinctive.
    fn key_terms(&self, claim_text: &str) -> Vec<String> {
        let mut terms: Vec<String> = Vec::new();
        for word in claim_text.split_whitespace() {
            let word = word
                .trim_matches(|c: char| !c.is_alphanumeric())
                .to_lowercase();
            if word.chars().count() > self.min_term_chars
                && !STOPWORDS.contains(&word.as_str())
                && !terms.contains(&word)
            {
                terms.push(word);
            }
        }
        terms
    }
}

/// Collapse whitespace runs to single spaces and trim the ends.
///
/// Returns the normalized text and, for every normalized byte, the byte offset
/// in `text` of the character it came from.
pub(crate) fn normalize_whitespace(text: &str) -> (String, Vec<usize>) {
    let mut normalized = String::with_capacity(text.len());
    let mut offsets = Vec::with_capacity(text.len());
    let mut pending_space: Option<usize> = None;

    for (idx, ch) in text.char_indices() {
        if ch.is_whitespace() {
            if !normalized.is_empty() && pending_space.is_none() {
                pending_space = Some(idx);
            }
            continue;
        }
        if let Some(space_idx) = pending_space.take() {
            normalized.push(' ');
            offsets.push(space_idx);
        }
        normalized.push(ch);
        offsets.extend(std::iter::repeat(idx).take(ch.len_utf8()));
    }

    (normalized, offsets)
}

/// Sentence spans `[start, end)`; terminal punctuation stays with its sentence.
pub(crate) fn split_sentences(text: &str) -> Vec<(usize, usize)> {
    let mut spans = Vec::new();
    let mut start = 0;

    for boundary in sentence_boundary().find_iter(text) {
        // Punctuation is one ASCII byte
        let end = boundary.start() + 1;
        if end > start {
            spans.push((start, end));
        }
        start = boundary.end();
    }
    if start < text.len() {
        spans.push((start, text.len()));
    }

    spans
}

/// Truncate for log output without splitting a character.
pub(crate) fn preview(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}
