//! Faithfulness verification and iterative correction of generated content.
//!
//! Content is scored against grounding text by an [`Evaluator`]. Claims it
//! flags are located in the text, grouped into paragraph-bounded regions and
//! rewritten by a [`Generator`]; the result is scored again, and the loop keeps
//! the best-scoring version until it meets a target or runs out of budget.
//!
//! ## Pipeline
//!
//! 1. [`ClaimLocator`]: find each flagged claim (exact, whitespace-normalized,
//!    5-word phrase, then sentence heuristic)
//! 2. [`SectionGrouper`]: merge located claims into regions, escalating to a
//!    whole-document region when regions are too many or cover too much
//! 3. [`SectionRewriter`]: rewrite each region through a fallback chain
//!    ending in an appended disclaimer
//! 4. [`FeedbackLoop`]: evaluate, rewrite, re-evaluate
//! 5. [`ContentVerification`]: apply a [`VerificationLevel`] policy
//! 6. [`HallucinationManager`]: the single entry point returning labelled content
//!
//! ## Example
//!
//! ```rust,ignore
//! use faithloop::hallucination::{HallucinationManager, ProgressReporter, VerificationRequest};
//!
//! let manager = HallucinationManager::from_env()?;
//! let request = VerificationRequest::new(query, draft, search_results)
//!     .with_sources(["https://docs.docker.com"]);
//!
//! let progress = ProgressReporter::from_fn(|event| {
//!     println!("{}", event);
//!     Ok(())
//! });
//!
//! let processed = manager.process_content(&request, &progress, false).await?;
//! println!("{}", processed.score_summary.status);
//! println!("{}", processed.processed_content);
//! ```

pub mod cache;
pub mod evaluator;
pub mod feedback;
pub mod generator;
pub mod grouper;
pub mod locator;
pub mod management;
pub mod progress;
pub mod rewriter;
pub mod types;
pub mod verification;

#[cfg(test)]
mod proptest;
#[cfg(test)]
pub(crate) mod test_support;

// Re-exports for convenience
pub use cache::{content_hash, CacheConfig, CacheKey, CacheKeyScope, CacheStats, EvaluationCache};
pub use evaluator::{parse_evaluation, Evaluator, LlmEvaluator};
pub use feedback::{status_text, FeedbackConfig, FeedbackLoop, LoopLimits};
pub use generator::{Generator, LlmGenerator, EXTRACTION_GROUNDING_LIMIT, NO_FACTS_FOUND};
pub use grouper::{GrouperConfig, SectionGrouper};
pub use locator::ClaimLocator;
pub use management::{
    HallucinationManager, ManagerConfig, ProcessedContent, ProcessingDetails, ScoreSummary,
};
pub use progress::{ProgressCallback, ProgressEvent, ProgressReporter};
pub use rewriter::{
    hedge, jaccard_similarity, with_disclaimer, FixOutcome, RegionRewrite, RewriterConfig,
    SectionRewriter, DISCLAIMER,
};
pub use types::{
    Claim, ClaimKind, EvaluationResult, ImprovementResult, IterationMetric, LocatedClaim,
    LoopStatus, LoopStop, MatchMethod, RewriteAttempt, RewriteMethod, RewriteRegion,
    VerificationRequest,
};
pub use verification::{
    add_verification_metadata, verification_badge, BadgeColor, ContentVerification,
    VerificationBadge, VerificationLevel, VerificationPolicy, VerificationResult,
};
