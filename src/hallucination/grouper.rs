//! Clustering located claims into paragraph-bounded rewrite regions.

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::types::{Claim, LocatedClaim, RewriteRegion};

const PARAGRAPH_BREAK: &str = "\n\n";

/// Configuration for region grouping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GrouperConfig {
    /// Claims starting within this many bytes of the open region's end join it
    pub merge_distance: usize,
    /// More regions than this escalates to a whole-document rewrite
    pub max_regions: usize,
    /// Regions covering more than this share of the text escalate too
    pub max_coverage: f64,
    /// Any located span below this confidence escalates too
    pub min_span_confidence: f64,
}

impl Default for GrouperConfig {
    fn default() -> Self {
        Self {
            merge_distance: 500,
            max_regions: 5,
            max_coverage: 0.8,
            min_span_confidence: 0.0,
        }
    }
}

/// Groups located claims into non-overlapping regions ordered by start.
#[derive(Debug, Clone, Default)]
pub struct SectionGrouper {
    config: GrouperConfig,
}

impl SectionGrouper {
    pub fn new(config: GrouperConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &GrouperConfig {
        &self.config
    }

    /// Build rewrite regions.
    ///
    /// `located` should come from [`ClaimLocator::locate`] over the same
    /// `response_text`. Spans that overrun the text or split a character are
    /// clamped and widened to character boundaries first.
    ///
    /// `all_claims` is the evaluator's full claim list; it is attached to the
    /// region when grouping falls back to the whole document, so claims that
    /// could not be located still reach the rewriter.
    ///
    /// [`ClaimLocator::locate`]: super::locator::ClaimLocator::locate
    pub fn group(
        &self,
        response_text: &str,
        located: &[LocatedClaim],
        all_claims: &[Claim],
    ) -> Vec<RewriteRegion> {
        let located: Vec<LocatedClaim> = located
            .iter()
            .cloned()
            .map(|l| snap_to_text(response_text, l))
            .collect();
        let whole_document = || {
            let claims = if all_claims.is_empty() {
                located.iter().map(|l| l.claim.clone()).collect()
            } else {
                all_claims.to_vec()
            };
            vec![RewriteRegion::whole_document(
                response_text,
                claims,
                located.to_vec(),
            )]
        };

        if located.is_empty() {
            debug!("No located claims; rewriting whole document");
            return whole_document();
        }

        if located
            .iter()
            .any(|l| l.confidence() < self.config.min_span_confidence)
        {
            debug!("Low-confidence span; rewriting whole document");
            return whole_document();
        }

        let mut sorted = located.clone();
        sorted.sort_by_key(|l| l.start_index);

        let mut regions: Vec<RewriteRegion> = Vec::new();
        let mut current: Option<RewriteRegion> = None;

        for item in sorted {
            let claim_start = item.start_index;
            let claim_end = item.end();
            let (para_start, para_end) = paragraph_bounds(response_text, claim_start, claim_end);

            match current.as_mut() {
                Some(open) if claim_start < open.end + self.config.merge_distance => {
                    open.start = open.start.min(para_start);
                    open.end = open.end.max(para_end);
                    open.claims.push(item.claim.clone());
                    open.located.push(item);
                }
                _ => {
                    if let Some(done) = current.take() {
                        regions.push(close_region(response_text, done));
                    }
                    current = Some(RewriteRegion {
                        start: para_start,
                        end: para_end,
                        text: String::new(),
                        claims: vec![item.claim.clone()],
                        located: vec![item],
                    });
                }
            }
        }
        if let Some(done) = current.take() {
            regions.push(close_region(response_text, done));
        }

        let covered: usize = regions.iter().map(RewriteRegion::len).sum();
        let too_many = regions.len() > self.config.max_regions;
        let too_much = covered as f64 > self.config.max_coverage * response_text.len() as f64;

        if too_many || too_much {
            debug!(
                regions = regions.len(),
                covered,
                total = response_text.len(),
                "Claims too scattered; rewriting whole document"
            );
            return whole_document();
        }

        regions
    }
}

/// Enclosing paragraph of `[start, end)`: from just after the previous blank
/// line (or text start) to the next blank line (or text end).
fn paragraph_bounds(text: &str, start: usize, end: usize) -> (usize, usize) {
    let para_start = text[..start]
        .rfind(PARAGRAPH_BREAK)
        .map(|idx| idx + PARAGRAPH_BREAK.len())
        .unwrap_or(0);
    let para_end = text[end..]
        .find(PARAGRAPH_BREAK)
        .map(|idx| end + idx)
        .unwrap_or(text.len());
    (para_start.min(start), para_end.max(end))
}

/// `located` with its span clamped to `text` and widened to char boundaries.
fn snap_to_text(text: &str, mut located: LocatedClaim) -> LocatedClaim {
    let start = floor_char_boundary(text, located.start_index);
    let end = located.start_index.saturating_add(located.length);
    let end = ceil_char_boundary(text, end).max(start);
    located.start_index = start;
    located.length = end - start;
    located
}

fn floor_char_boundary(text: &str, index: usize) -> usize {
    let mut index = index.min(text.len());
    while !text.is_char_boundary(index) {
        index -= 1;
    }
    index
}

fn ceil_char_boundary(text: &str, index: usize) -> usize {
    let mut index = index.min(text.len());
    while !text.is_char_boundary(index) {
        index += 1;
    }
    index
}

fn close_region(text: &str, mut region: RewriteRegion) -> RewriteRegion {
    region.text = text[region.start..region.end].to_string();
    region
}
