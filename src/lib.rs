//! # faithloop
//!
//! Faithfulness verification and iterative correction for LLM-generated content.
//!
//! ## Core Components
//!
//! - **Evaluator**: scores content against grounding text and flags claims
//! - **Locator / Grouper**: pinpoint flagged claims and cluster them into regions
//! - **Rewriter**: fix regions through a chain of fallback strategies
//! - **FeedbackLoop**: evaluate, rewrite, re-evaluate, keeping the best version
//! - **Verification**: relaxed / standard / strict pass policies and badges
//!
//! ## Example
//!
//! ```rust,ignore
//! use faithloop::{HallucinationManager, ProgressReporter, VerificationRequest};
//!
//! let manager = HallucinationManager::from_env()?;
//! let request = VerificationRequest::new(
//!     "What is Docker?",
//!     draft,
//!     search_results,
//! );
//!
//! let processed = manager
//!     .process_content(&request, &ProgressReporter::none(), false)
//!     .await?;
//! if !processed.verification_passed {
//!     println!("{}", processed.score_summary.status);
//! }
//! ```

pub mod error;
pub mod hallucination;
pub mod llm;

// Re-exports for convenience
pub use error::{Error, Result};
pub use hallucination::{
    Claim, ClaimKind, ContentVerification, EvaluationCache, EvaluationResult, Evaluator,
    FeedbackConfig, FeedbackLoop, Generator, HallucinationManager, ImprovementResult,
    LlmEvaluator, LlmGenerator, ManagerConfig, ProcessedContent, ProgressEvent,
    ProgressReporter, SectionRewriter, VerificationLevel, VerificationRequest,
    VerificationResult,
};
pub use llm::{ClientConfig, CompletionRequest, CompletionResponse, LLMClient, OpenAIClient};
