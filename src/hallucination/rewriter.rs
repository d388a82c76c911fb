//! Grounded rewriting of flagged regions.
//!
//! Each region goes through an ordered fallback chain: direct rewrite (with
//! one expansion follow-up when the result is too thin), a structured
//! rewrite of text with the claims replaced by tags, a minimal substitution
//! done locally, and finally the untouched region with a disclaimer. Every
//! stage yields a [`RewriteAttempt`]; the first validated one wins.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use crate::error::{Error, Result};

use super::generator::{truncate_chars, Generator, EXTRACTION_GROUNDING_LIMIT, NO_FACTS_FOUND};
use super::grouper::SectionGrouper;
use super::locator::{preview, ClaimLocator};
use super::types::{Claim, RewriteAttempt, RewriteMethod, RewriteRegion};

/// Appended to a region when no stage could fix it.
pub const DISCLAIMER: &str = "\n\n[NOTE: This section may contain factual inaccuracies. Please verify information from reliable sources.]";

pub(crate) const SECTION_HEADER: &str = "ORIGINAL SECTION:";
pub(crate) const CLAIMS_HEADER: &str = "PROBLEMATIC CLAIMS TO REPLACE OR REMOVE:";
pub(crate) const FULL_TEXT_HEADER: &str = "==== ORIGINAL TEXT ====";
pub(crate) const FULL_CONTEXT_HEADER: &str = "==== CONTEXT FROM RELIABLE SOURCES ====";
pub(crate) const REPLACE_TAG: &str = "[REPLACE WITH ACCURATE INFO:";

const REWRITE_SYSTEM_PROMPT: &str = "You are an expert fact-checker and content rewriter who fixes \
hallucinations in AI-generated text. Rewrite the section so it contains only information supported \
by the context.

Rules:
1. Replace inaccurate information with accurate facts from the context.
2. Remove anything the context cannot support.
3. Make direct factual statements; do not add qualifiers such as \"according to sources\".
4. Never invent information.
5. Keep the style and tone of the original and make the text flow naturally.
6. Return only the corrected text with no explanation.";

const EXPANSION_SYSTEM_PROMPT: &str = "You are an expert fact-checker and content writer.";

const STRUCTURED_SYSTEM_PROMPT: &str =
    "You are an expert fact-checker. Replace inaccurate claims with factual information.";

const FULL_REWRITE_SYSTEM_PROMPT: &str = "You are an expert content corrector who fixes factual \
inaccuracies while preserving the original style, tone and flow.

Rules:
1. Replace hallucinated information with factual information from the context instead of just deleting it.
2. Leave accurate content unchanged.
3. Do not add disclaimers such as \"according to sources\".
4. Match the technical level of the original and preserve its paragraph structure.
5. Use only information from the provided context and be specific with dates, names and details.
6. Never invent information, even if the context seems incomplete.";

const FULL_REWRITE_RETRY_SUFFIX: &str =
    "\n\nPlease be extra careful to fact-check and replace any hallucinated information.";

/// Characters of surrounding document shown on each side of a region.
const NEIGHBOR_CHARS: usize = 300;

/// Configuration for the rewriter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RewriterConfig {
    /// Grounding characters included in region rewrite prompts
    pub grounding_limit: usize,
    /// Grounding characters included in the whole-document rewrite prompt
    pub full_grounding_limit: usize,
    /// Validated output must have at least this many characters
    pub min_output_chars: usize,
    /// Token-set similarity below which a short rewrite gets an expansion request
    pub similarity_floor: f64,
    /// "Short" means fewer words than this share of the original
    pub expansion_word_ratio: f64,
    /// Whole-document rewrites shorter than this share of the input are rejected
    pub full_min_ratio: f64,
    /// Whole-document rewrites longer than this multiple of the input are rejected
    pub full_max_ratio: f64,
    /// Bound on each generator call
    pub call_timeout: Option<Duration>,
}

impl Default for RewriterConfig {
    fn default() -> Self {
        Self {
            grounding_limit: 3000,
            full_grounding_limit: 4000,
            min_output_chars: 20,
            similarity_floor: 0.4,
            expansion_word_ratio: 0.5,
            full_min_ratio: 0.3,
            full_max_ratio: 4.0,
            call_timeout: None,
        }
    }
}

impl RewriterConfig {
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = Some(timeout);
        self
    }
}

/// Result of rewriting one region.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionRewrite {
    pub start: usize,
    pub end: usize,
    pub original: String,
    /// Replacement for `original`
    pub text: String,
    /// Stage that produced `text`
    pub method: RewriteMethod,
    /// Every stage tried, in order
    pub attempts: Vec<RewriteAttempt>,
}

impl RegionRewrite {
    fn unchanged(start: usize, end: usize, original: &str, reason: &str) -> Self {
        Self {
            start,
            end,
            original: original.to_string(),
            text: original.to_string(),
            method: RewriteMethod::Unchanged,
            attempts: vec![RewriteAttempt::rejected(RewriteMethod::Unchanged, None, reason)],
        }
    }

    pub fn changed(&self) -> bool {
        self.text != self.original
    }
}

/// Result of fixing a whole piece of content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixOutcome {
    pub content: String,
    /// One entry per region, in document order
    pub rewrites: Vec<RegionRewrite>,
    /// Claims the locator could pin to a span
    pub located_claims: usize,
}

impl FixOutcome {
    pub fn changed(&self) -> bool {
        self.rewrites.iter().any(RegionRewrite::changed)
    }
}

/// Rewrites flagged regions using only grounding facts.
pub struct SectionRewriter {
    generator: Arc<dyn Generator>,
    config: RewriterConfig,
    locator: ClaimLocator,
    grouper: SectionGrouper,
}

impl SectionRewriter {
    pub fn new(generator: Arc<dyn Generator>, config: RewriterConfig) -> Self {
        Self {
            generator,
            config,
            locator: ClaimLocator::new(),
            grouper: SectionGrouper::default(),
        }
    }

    pub fn with_locator(mut self, locator: ClaimLocator) -> Self {
        self.locator = locator;
        self
    }

    pub fn with_grouper(mut self, grouper: SectionGrouper) -> Self {
        self.grouper = grouper;
        self
    }

    pub fn config(&self) -> &RewriterConfig {
        &self.config
    }

    /// Locate, group and rewrite every region holding one of `claims`.
    ///
    /// Regions are rewritten from last to first so earlier offsets stay valid
    /// while splicing.
    #[instrument(skip_all, fields(content_len = content.len(), claims = claims.len()))]
    pub async fn fix_content(
        &self,
        query: &str,
        content: &str,
        grounding_text: &str,
        claims: &[Claim],
    ) -> FixOutcome {
        if content.trim().is_empty() || claims.is_empty() {
            return FixOutcome {
                content: content.to_string(),
                rewrites: Vec::new(),
                located_claims: 0,
            };
        }

        let located = self.locator.locate(content, claims);
        let regions = self.grouper.group(content, &located, claims);
        info!(
            located = located.len(),
            regions = regions.len(),
            "Rewriting flagged regions"
        );

        let mut fixed = content.to_string();
        let mut rewrites = Vec::with_capacity(regions.len());
        for region in regions.iter().rev() {
            if region.text.trim().is_empty() {
                continue;
            }
            let rewrite = self.rewrite(content, region, grounding_text, query).await;
            if rewrite.changed() {
                fixed.replace_range(region.start..region.end, &rewrite.text);
            }
            rewrites.push(rewrite);
        }
        rewrites.reverse();

        FixOutcome {
            content: fixed,
            rewrites,
            located_claims: located.len(),
        }
    }

    /// Rewrite one region through the fallback chain.
    ///
    /// Never fails: generator errors are recorded on the attempt and the
    /// chain moves on, ending at the disclaimer stage.
    pub async fn rewrite(
        &self,
        full_text: &str,
        region: &RewriteRegion,
        grounding_text: &str,
        original_query: &str,
    ) -> RegionRewrite {
        if region.claims.is_empty() {
            return RegionRewrite::unchanged(region.start, region.end, &region.text, "no claims");
        }
        if region.text.trim().is_empty() {
            return RegionRewrite::unchanged(region.start, region.end, &region.text, "empty region");
        }

        debug!(
            claims = region.claims.len(),
            len = region.text.len(),
            section = %preview(&region.text, 50),
            "Rewriting region"
        );

        let mut attempts = Vec::new();
        let finish = |text: String, method: RewriteMethod, attempts: Vec<RewriteAttempt>| RegionRewrite {
            start: region.start,
            end: region.end,
            original: region.text.clone(),
            text,
            method,
            attempts,
        };

        // Stage 1: direct rewrite, possibly expanded
        for attempt in self.direct_rewrite(full_text, region, grounding_text, original_query).await {
            let accepted = attempt.accepted_text().map(str::to_string);
            let method = attempt.method;
            attempts.push(attempt);
            if let Some(text) = accepted {
                return finish(text, method, attempts);
            }
        }

        // Facts feed the structured and minimal stages
        let facts = self.extract_facts(&region.claims, grounding_text).await;
        let spans = claim_spans(region);

        // Stage 2: structured rewrite
        let attempt = self.structured_rewrite(region, &spans, &facts, grounding_text).await;
        let accepted = attempt.accepted_text().map(str::to_string);
        attempts.push(attempt);
        if let Some(text) = accepted {
            return finish(text, RewriteMethod::Structured, attempts);
        }

        // Stage 3: minimal substitution
        let attempt = self.minimal_substitution(region, &spans, &facts);
        let accepted = attempt.accepted_text().map(str::to_string);
        attempts.push(attempt);
        if let Some(text) = accepted {
            return finish(text, RewriteMethod::MinimalSubstitution, attempts);
        }

        // Stage 4: disclaimer
        warn!(
            section = %preview(&region.text, 50),
            "All rewrite stages failed; appending disclaimer"
        );
        let text = with_disclaimer(&region.text);
        attempts.push(RewriteAttempt::accepted(RewriteMethod::Disclaimer, text.clone()));
        finish(text, RewriteMethod::Disclaimer, attempts)
    }

    /// Rewrite a whole document in one pass.
    ///
    /// Two tries, the second cooler and more insistent. Output far shorter or
    /// longer than the input is rejected; if both tries fail the original
    /// text comes back with method [`RewriteMethod::Unchanged`].
    #[instrument(skip_all, fields(content_len = content.len()))]
    pub async fn rewrite_full(&self, query: &str, content: &str, grounding_text: &str) -> RegionRewrite {
        let user_prompt = format!(
            "I need you to rewrite this text to improve factual accuracy. \
It was written to answer: {query}\n\n\
{FULL_TEXT_HEADER}\n{content}\n\n\
{FULL_CONTEXT_HEADER}\n{context}\n\n\
Rewrite the original text, replacing inaccurate information with facts from the context. \
Keep the same style, structure and technical depth. \
Return ONLY the corrected text without prefixes, explanations or markdown formatting.",
            context = truncate_chars(grounding_text, self.config.full_grounding_limit),
        );
        let retry_prompt = format!("{}{}", user_prompt, FULL_REWRITE_RETRY_SUFFIX);
        let max_tokens = output_budget(content);
        let input_chars = content.chars().count() as f64;

        let mut attempts = Vec::new();
        for (prompt, temperature) in [(&user_prompt, 0.3), (&retry_prompt, 0.1)] {
            let result = self
                .generate(FULL_REWRITE_SYSTEM_PROMPT, prompt, temperature, max_tokens)
                .await;
            let text = match result {
                Ok(text) => text,
                Err(e) => {
                    warn!(error = %e, "Full rewrite attempt failed");
                    attempts.push(RewriteAttempt::rejected(
                        RewriteMethod::FullDocument,
                        None,
                        e.to_string(),
                    ));
                    continue;
                }
            };

            let output_chars = text.chars().count() as f64;
            if output_chars < input_chars * self.config.full_min_ratio {
                attempts.push(RewriteAttempt::rejected(
                    RewriteMethod::FullDocument,
                    Some(text),
                    "rewrite suspiciously short",
                ));
                continue;
            }
            if output_chars > input_chars * self.config.full_max_ratio {
                attempts.push(RewriteAttempt::rejected(
                    RewriteMethod::FullDocument,
                    Some(text),
                    "rewrite suspiciously long",
                ));
                continue;
            }

            attempts.push(RewriteAttempt::accepted(RewriteMethod::FullDocument, text.clone()));
            return RegionRewrite {
                start: 0,
                end: content.len(),
                original: content.to_string(),
                text,
                method: RewriteMethod::FullDocument,
                attempts,
            };
        }

        warn!("Full rewrite failed; keeping original content");
        RegionRewrite {
            start: 0,
            end: content.len(),
            original: content.to_string(),
            text: content.to_string(),
            method: RewriteMethod::Unchanged,
            attempts,
        }
    }

    async fn direct_rewrite(
        &self,
        full_text: &str,
        region: &RewriteRegion,
        grounding_text: &str,
        query: &str,
    ) -> Vec<RewriteAttempt> {
        let context = truncate_chars(grounding_text, self.config.grounding_limit);
        let user_prompt = format!(
            "I need you to rewrite a section of content that contains factual inaccuracies. \
The content answers the question: {query}\n\n\
{SECTION_HEADER}\n{section}\n\n\
{CLAIMS_HEADER}\n{claims}\n\n\
FACTUAL CONTEXT - USE ONLY THESE FACTS:\n{context}\n\n\
{neighbors}\
Rewrite the section so it is factually accurate, using ONLY information from the context. \
Keep a similar style and tone. Return ONLY the corrected section.",
            section = region.text,
            claims = format_claims(&region.claims),
            neighbors = neighbor_excerpt(full_text, region),
        );
        let max_tokens = output_budget(&region.text);

        let rewritten = match self
            .generate(REWRITE_SYSTEM_PROMPT, &user_prompt, 0.1, max_tokens)
            .await
        {
            Ok(text) => text,
            Err(e) => {
                warn!(error = %e, "Direct rewrite failed");
                return vec![RewriteAttempt::rejected(RewriteMethod::Direct, None, e.to_string())];
            }
        };

        let similarity = jaccard_similarity(&rewritten, &region.text);
        let rewritten_words = rewritten.split_whitespace().count() as f64;
        let original_words = region.text.split_whitespace().count() as f64;
        let needs_expansion = similarity < self.config.similarity_floor
            && rewritten_words < self.config.expansion_word_ratio * original_words;

        if !needs_expansion {
            return vec![self.validate(RewriteMethod::Direct, rewritten)];
        }

        debug!(similarity, "Rewrite much shorter than original; requesting expansion");
        let mut attempts = vec![RewriteAttempt::rejected(
            RewriteMethod::Direct,
            Some(rewritten.clone()),
            format!("too short (similarity {:.2})", similarity),
        )];

        let expansion_prompt = format!(
            "{user_prompt}\n\n\
YOUR PREVIOUS REWRITE:\n{rewritten}\n\n\
That rewrite is good but too short. Expand it with more details from the context to \
approximately the length of the original. Use only factual information.\n\
Original length: {original_words} words\n\
Current rewrite: {rewritten_words} words",
        );
        match self
            .generate(EXPANSION_SYSTEM_PROMPT, &expansion_prompt, 0.2, max_tokens)
            .await
        {
            Ok(expanded) => attempts.push(self.validate(RewriteMethod::Expanded, expanded)),
            Err(e) => {
                warn!(error = %e, "Expansion request failed");
                attempts.push(RewriteAttempt::rejected(
                    RewriteMethod::Expanded,
                    None,
                    e.to_string(),
                ));
            }
        }
        attempts
    }

    async fn structured_rewrite(
        &self,
        region: &RewriteRegion,
        spans: &[ClaimSpan],
        facts: &[Option<String>],
        grounding_text: &str,
    ) -> RewriteAttempt {
        let marked = splice_spans(&region.text, spans, |span| {
            let guidance = facts[span.claim]
                .as_deref()
                .unwrap_or("Use facts from context");
            format!("{} {}]", REPLACE_TAG, guidance)
        });

        let prompt = format!(
            "I need you to fix this text that contains inaccuracies. Problematic areas are marked \
with {REPLACE_TAG} ...] tags. Replace each tagged section with accurate information based on \
the guidance provided.\n\n\
MARKED TEXT:\n{marked}\n\n\
CONTEXT FROM RELIABLE SOURCES:\n{context}\n\n\
Rewrite the entire text, replacing marked sections while keeping the original flow and style. \
Return ONLY the corrected text, with NO explanations or notes.",
            context = truncate_chars(grounding_text, self.config.grounding_limit),
        );

        match self
            .generate(STRUCTURED_SYSTEM_PROMPT, &prompt, 0.1, output_budget(&region.text))
            .await
        {
            Ok(text) if text.contains(REPLACE_TAG) => RewriteAttempt::rejected(
                RewriteMethod::Structured,
                Some(text),
                "replacement tags left in output",
            ),
            Ok(text) => self.validate(RewriteMethod::Structured, text),
            Err(e) => {
                warn!(error = %e, "Structured rewrite failed");
                RewriteAttempt::rejected(RewriteMethod::Structured, None, e.to_string())
            }
        }
    }

    fn minimal_substitution(
        &self,
        region: &RewriteRegion,
        spans: &[ClaimSpan],
        facts: &[Option<String>],
    ) -> RewriteAttempt {
        if spans.is_empty() {
            return RewriteAttempt::rejected(
                RewriteMethod::MinimalSubstitution,
                None,
                "no claim spans inside region",
            );
        }

        let text = splice_spans(&region.text, spans, |span| match &facts[span.claim] {
            Some(fact) => fact.clone(),
            None => hedge(&region.claims[span.claim].text),
        });

        if text == region.text {
            return RewriteAttempt::rejected(
                RewriteMethod::MinimalSubstitution,
                Some(text),
                "substitution changed nothing",
            );
        }
        self.validate(RewriteMethod::MinimalSubstitution, text)
    }

    /// One extraction call per claim; failures and "nothing found" map to `None`.
    async fn extract_facts(&self, claims: &[Claim], grounding_text: &str) -> Vec<Option<String>> {
        let grounding = truncate_chars(grounding_text, EXTRACTION_GROUNDING_LIMIT);
        let mut facts = Vec::with_capacity(claims.len());
        for claim in claims {
            let extracted = within(
                self.config.call_timeout,
                self.generator.extract_facts(&claim.text, grounding),
            )
            .await;
            let fact = match extracted {
                Ok(fact) => usable_fact(fact),
                Err(e) => {
                    warn!(error = %e, claim = %preview(&claim.text, 60), "Fact extraction failed");
                    None
                }
            };
            facts.push(fact);
        }
        facts
    }

    fn validate(&self, method: RewriteMethod, text: String) -> RewriteAttempt {
        if text.chars().count() < self.config.min_output_chars {
            RewriteAttempt::rejected(method, Some(text), "output too short")
        } else {
            RewriteAttempt::accepted(method, text)
        }
    }

    async fn generate(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        temperature: f64,
        max_tokens: u32,
    ) -> Result<String> {
        within(
            self.config.call_timeout,
            self.generator
                .rewrite(system_prompt, user_prompt, temperature, max_tokens),
        )
        .await
    }
}

/// Await `fut`, failing with [`Error::Timeout`] once `limit` elapses.
pub(crate) async fn within<T, F>(limit: Option<Duration>, fut: F) -> Result<T>
where
    F: std::future::Future<Output = Result<T>>,
{
    match limit {
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| Error::timeout(limit.as_millis() as u64))?,
        None => fut.await,
    }
}

/// A claim's span relative to its region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ClaimSpan {
    start: usize,
    end: usize,
    /// Index into `region.claims`
    claim: usize,
}

/// Spans of the region's claims, sorted by start, overlaps dropped.
///
/// Located spans are preferred; claims the locator missed fall back to a
/// verbatim search inside the region.
fn claim_spans(region: &RewriteRegion) -> Vec<ClaimSpan> {
    let mut spans: Vec<ClaimSpan> = region
        .claims
        .iter()
        .enumerate()
        .filter_map(|(idx, claim)| {
            let located = region.located.iter().find(|l| {
                &l.claim == claim && l.start_index >= region.start && l.end() <= region.end
            });
            match located {
                Some(l) => Some(ClaimSpan {
                    start: l.start_index - region.start,
                    end: l.end() - region.start,
                    claim: idx,
                }),
                None if claim.text.is_empty() => None,
                None => region.text.find(&claim.text).map(|start| ClaimSpan {
                    start,
                    end: start + claim.text.len(),
                    claim: idx,
                }),
            }
        })
        .collect();

    spans.sort_by_key(|s| (s.start, s.end));
    let mut kept: Vec<ClaimSpan> = Vec::with_capacity(spans.len());
    for span in spans {
        if kept.last().map_or(true, |prev| span.start >= prev.end) {
            kept.push(span);
        }
    }
    kept
}

/// Replace each span (sorted, non-overlapping) with `replacement(span)`.
fn splice_spans<F>(text: &str, spans: &[ClaimSpan], replacement: F) -> String
where
    F: Fn(&ClaimSpan) -> String,
{
    let mut out = text.to_string();
    for span in spans.iter().rev() {
        out.replace_range(span.start..span.end, &replacement(span));
    }
    out
}

fn usable_fact(fact: String) -> Option<String> {
    let fact = fact.trim();
    let no_facts = NO_FACTS_FOUND.trim_end_matches('.');
    if fact.is_empty() || fact.contains(no_facts) {
        None
    } else {
        Some(fact.to_string())
    }
}

/// Hedged paraphrase of a claim nothing in the grounding supports.
pub fn hedge(claim_text: &str) -> String {
    let claim = claim_text.trim().trim_end_matches(|c| matches!(c, '.' | '!' | '?'));
    let mut chars = claim.chars();
    let lowered = match chars.next() {
        Some(first) => first.to_lowercase().chain(chars).collect::<String>(),
        None => String::new(),
    };
    format!(
        "Some sources suggest that {}, though this information could not be fully verified.",
        lowered
    )
}

/// `text` with [`DISCLAIMER`] appended once.
pub fn with_disclaimer(text: &str) -> String {
    if text.contains(DISCLAIMER) {
        text.to_string()
    } else {
        format!("{}{}", text, DISCLAIMER)
    }
}

/// Jaccard similarity of lowercase whitespace-split token sets.
pub fn jaccard_similarity(a: &str, b: &str) -> f64 {
    let a: HashSet<String> = a.split_whitespace().map(str::to_lowercase).collect();
    let b: HashSet<String> = b.split_whitespace().map(str::to_lowercase).collect();
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let intersection = a.intersection(&b).count();
    let union = a.union(&b).count();
    intersection as f64 / union as f64
}

fn format_claims(claims: &[Claim]) -> String {
    claims
        .iter()
        .map(|c| match &c.correction {
            Some(correction) => format!("- {}: {} (suggested: {})", c.text, c.reason, correction),
            None => format!("- {}: {}", c.text, c.reason),
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Nearby document text, so the rewrite reads on from what surrounds it.
fn neighbor_excerpt(full_text: &str, region: &RewriteRegion) -> String {
    if region.covers(full_text.len()) || region.end > full_text.len() {
        return String::new();
    }
    let before = &full_text[..region.start];
    let before_start = before
        .char_indices()
        .rev()
        .nth(NEIGHBOR_CHARS.saturating_sub(1))
        .map(|(idx, _)| idx)
        .unwrap_or(0);
    let before = before[before_start..].trim();
    let after = truncate_chars(&full_text[region.end..], NEIGHBOR_CHARS).trim();

    let mut excerpt = String::new();
    if !before.is_empty() {
        excerpt.push_str(&format!("TEXT BEFORE THE SECTION (do not rewrite):\n{}\n\n", before));
    }
    if !after.is_empty() {
        excerpt.push_str(&format!("TEXT AFTER THE SECTION (do not rewrite):\n{}\n\n", after));
    }
    excerpt
}

fn output_budget(text: &str) -> u32 {
    let budget = text.chars().count().saturating_mul(2).max(1000);
    u32::try_from(budget).unwrap_or(u32::MAX)
}
