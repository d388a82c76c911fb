//! Core types for faithfulness verification.
//!
//! Claims come out of an evaluator, get located in the response text,
//! grouped into rewrite regions, and drive the rewrite loop. Everything here
//! is created fresh per request and owned by the caller once returned.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Which evaluator payload shape a claim was normalized from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClaimKind {
    /// Structured `problematic_claims` entry with text and reason
    Problematic,
    /// Bare `hallucinated_statements` entry
    Hallucinated,
    /// Bare `grounding.ungrounded_claims` entry
    Ungrounded,
}

impl ClaimKind {
    /// Reason attached when the payload carried none.
    pub fn default_reason(&self) -> &'static str {
        match self {
            Self::Problematic => "Not verified",
            Self::Hallucinated => "Not supported by sources",
            Self::Ungrounded => "Not grounded in sources",
        }
    }
}

impl std::fmt::Display for ClaimKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Problematic => write!(f, "problematic"),
            Self::Hallucinated => write!(f, "hallucinated"),
            Self::Ungrounded => write!(f, "ungrounded"),
        }
    }
}

/// A span of the response flagged as unsupported or contradicted.
///
/// Claims are produced by the evaluator and never mutated downstream.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Claim {
    /// The offending text, as quoted by the evaluator
    pub text: String,
    /// Why the evaluator flagged it
    pub reason: String,
    /// Suggested correction, when the evaluator offered one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correction: Option<String>,
    /// Payload shape the claim came from
    #[serde(default = "default_kind")]
    pub kind: ClaimKind,
}

fn default_kind() -> ClaimKind {
    ClaimKind::Problematic
}

impl Claim {
    /// Create a new claim.
    pub fn new(text: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            reason: reason.into(),
            correction: None,
            kind: ClaimKind::Problematic,
        }
    }

    /// Create a claim from a bare statement of the given kind.
    pub fn bare(text: impl Into<String>, kind: ClaimKind) -> Self {
        Self {
            text: text.into(),
            reason: kind.default_reason().to_string(),
            correction: None,
            kind,
        }
    }

    /// Set the suggested correction.
    pub fn with_correction(mut self, correction: impl Into<String>) -> Self {
        self.correction = Some(correction.into());
        self
    }
}

/// How a claim was found in the response text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchMethod {
    /// Verbatim substring
    Exact,
    /// Substring after collapsing whitespace runs
    Normalized,
    /// A five-word window of the claim
    PartialPhrase,
    /// A sentence sharing key terms with the claim
    SentenceHeuristic,
}

impl MatchMethod {
    /// Confidence that the located span is the claim.
    pub fn confidence(&self) -> f64 {
        match self {
            Self::Exact => 1.0,
            Self::Normalized => 0.9,
            Self::PartialPhrase => 0.6,
            Self::SentenceHeuristic => 0.4,
        }
    }
}

impl std::fmt::Display for MatchMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Exact => write!(f, "exact"),
            Self::Normalized => write!(f, "normalized"),
            Self::PartialPhrase => write!(f, "partial_phrase"),
            Self::SentenceHeuristic => write!(f, "sentence_heuristic"),
        }
    }
}

/// A claim pinned to a byte span of the response text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocatedClaim {
    pub claim: Claim,
    /// Byte offset of the span start
    pub start_index: usize,
    /// Span length in bytes
    pub length: usize,
    pub method: MatchMethod,
}

impl LocatedClaim {
    pub fn new(claim: Claim, start_index: usize, length: usize, method: MatchMethod) -> Self {
        Self {
            claim,
            start_index,
            length,
            method,
        }
    }

    /// Exclusive end offset of the span.
    pub fn end(&self) -> usize {
        self.start_index + self.length
    }

    pub fn confidence(&self) -> f64 {
        self.method.confidence()
    }
}

/// A half-open span `[start, end)` of the response selected for rewriting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RewriteRegion {
    pub start: usize,
    pub end: usize,
    /// `response[start..end]`
    pub text: String,
    /// Claims this region is responsible for
    pub claims: Vec<Claim>,
    /// Located spans inside the region, in absolute offsets
    pub located: Vec<LocatedClaim>,
}

impl RewriteRegion {
    /// A region covering the whole document.
    pub fn whole_document(
        text: &str,
        claims: Vec<Claim>,
        located: Vec<LocatedClaim>,
    ) -> Self {
        Self {
            start: 0,
            end: text.len(),
            text: text.to_string(),
            claims,
            located,
        }
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// Whether this region spans a document of `doc_len` bytes entirely.
    pub fn covers(&self, doc_len: usize) -> bool {
        self.start == 0 && self.end == doc_len
    }
}

/// Evaluator verdict for one piece of content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationResult {
    /// Faithfulness score in [0, 1]
    pub faithfulness_score: f64,
    /// Free-text assessment
    pub assessment: String,
    pub problematic_claims: Vec<Claim>,
}

impl EvaluationResult {
    pub fn new(faithfulness_score: f64, assessment: impl Into<String>) -> Self {
        Self {
            faithfulness_score,
            assessment: assessment.into(),
            problematic_claims: Vec::new(),
        }
    }

    pub fn with_claim(mut self, claim: Claim) -> Self {
        self.problematic_claims.push(claim);
        self
    }

    pub fn with_claims(mut self, claims: Vec<Claim>) -> Self {
        self.problematic_claims = claims;
        self
    }

    pub fn has_claims(&self) -> bool {
        !self.problematic_claims.is_empty()
    }

    /// Sorted, de-duplicated claim texts; equal signatures mean the evaluator
    /// flagged the same things.
    pub fn claim_signature(&self) -> BTreeSet<&str> {
        self.problematic_claims
            .iter()
            .map(|c| c.text.as_str())
            .collect()
    }
}

/// One entry of the loop's audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationMetric {
    /// 0 for the initial evaluation
    pub iteration: u32,
    pub score: f64,
    pub problematic_claim_count: usize,
    pub assessment: String,
}

impl IterationMetric {
    pub fn from_evaluation(iteration: u32, evaluation: &EvaluationResult) -> Self {
        Self {
            iteration,
            score: evaluation.faithfulness_score,
            problematic_claim_count: evaluation.problematic_claims.len(),
            assessment: evaluation.assessment.clone(),
        }
    }
}

/// Terminal state of a feedback-loop run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopStatus {
    /// Target score met
    Passed,
    /// Meaningful improvement without reaching the target
    Improved,
    /// Ran out of iterations or hit diminishing returns without meaningful gain
    NoImprovement,
    /// Rewrites stopped producing new content
    Exhausted,
}

impl std::fmt::Display for LoopStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Passed => write!(f, "passed"),
            Self::Improved => write!(f, "improved"),
            Self::NoImprovement => write!(f, "no_improvement"),
            Self::Exhausted => write!(f, "exhausted"),
        }
    }
}

impl LoopStatus {
    /// Human-readable status line.
    pub fn describe(&self) -> &'static str {
        match self {
            Self::Passed => "Successfully improved",
            Self::Improved => "Improved but not verified",
            Self::NoImprovement => "No meaningful improvement",
            Self::Exhausted => "No further progress possible",
        }
    }
}

/// Why the loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopStop {
    /// Initial content already met the target
    AlreadyPassing,
    /// A candidate reached the target
    TargetReached,
    /// All iterations used
    IterationLimit,
    /// Rewrite and full-document rewrite both reproduced seen content
    RepeatedContent,
    /// Best score gained too little over the initial score
    DiminishingReturns,
    /// The evaluator kept flagging the same claims
    PersistentClaims,
    /// Wall-clock budget for the loop ran out
    TimeBudget,
}

impl std::fmt::Display for LoopStop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AlreadyPassing => write!(f, "already_passing"),
            Self::TargetReached => write!(f, "target_reached"),
            Self::IterationLimit => write!(f, "iteration_limit"),
            Self::RepeatedContent => write!(f, "repeated_content"),
            Self::DiminishingReturns => write!(f, "diminishing_returns"),
            Self::PersistentClaims => write!(f, "persistent_claims"),
            Self::TimeBudget => write!(f, "time_budget"),
        }
    }
}

/// Output of one feedback-loop run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImprovementResult {
    pub initial_content: String,
    /// Best-scoring version seen, not necessarily the last one tried
    pub final_content: String,
    pub initial_score: f64,
    pub final_score: f64,
    pub iterations: u32,
    pub verification_passed: bool,
    pub metrics: Vec<IterationMetric>,
    pub status: LoopStatus,
    pub stop: LoopStop,
    /// `final_score - initial_score` exceeded the meaningful-improvement delta
    pub improved: bool,
    pub improvement_delta: f64,
    pub initial_evaluation: EvaluationResult,
    pub final_evaluation: EvaluationResult,
}

/// What a verification request is about.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationRequest {
    /// The question that prompted the content
    pub query: String,
    /// The content under verification
    pub content: String,
    /// Reference material claims are checked against
    pub grounding_text: String,
    /// Source identifiers (URLs) behind the grounding text
    pub sources: Vec<String>,
}

impl VerificationRequest {
    pub fn new(
        query: impl Into<String>,
        content: impl Into<String>,
        grounding_text: impl Into<String>,
    ) -> Self {
        Self {
            query: query.into(),
            content: content.into(),
            grounding_text: grounding_text.into(),
            sources: Vec::new(),
        }
    }

    pub fn with_sources<I, S>(mut self, sources: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.sources = sources.into_iter().map(Into::into).collect();
        self
    }

    /// Same request about different content.
    pub fn with_content(&self, content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..self.clone()
        }
    }
}

/// Which rewrite strategy produced a text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RewriteMethod {
    /// Direct grounded rewrite
    Direct,
    /// Direct rewrite followed by an expansion request
    Expanded,
    /// Rewrite of text with claims marked by replacement tags
    Structured,
    /// Claim spans substituted with extracted facts or hedges
    MinimalSubstitution,
    /// Original text with an inaccuracy disclaimer appended
    Disclaimer,
    /// Whole-document rewrite
    FullDocument,
    /// Nothing to rewrite; text returned as-is
    Unchanged,
}

impl std::fmt::Display for RewriteMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Direct => write!(f, "direct"),
            Self::Expanded => write!(f, "expanded"),
            Self::Structured => write!(f, "structured"),
            Self::MinimalSubstitution => write!(f, "minimal_substitution"),
            Self::Disclaimer => write!(f, "disclaimer"),
            Self::FullDocument => write!(f, "full_document"),
            Self::Unchanged => write!(f, "unchanged"),
        }
    }
}

/// Outcome of one rewrite stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RewriteAttempt {
    pub method: RewriteMethod,
    /// Produced text, if the stage produced any
    pub text: Option<String>,
    pub validated: bool,
    /// Why the stage was rejected
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejection: Option<String>,
}

impl RewriteAttempt {
    pub fn accepted(method: RewriteMethod, text: impl Into<String>) -> Self {
        Self {
            method,
            text: Some(text.into()),
            validated: true,
            rejection: None,
        }
    }

    pub fn rejected(method: RewriteMethod, text: Option<String>, reason: impl Into<String>) -> Self {
        Self {
            method,
            text,
            validated: false,
            rejection: Some(reason.into()),
        }
    }

    /// The text, if this attempt passed validation.
    pub fn accepted_text(&self) -> Option<&str> {
        if self.validated {
            self.text.as_deref()
        } else {
            None
        }
    }
}
