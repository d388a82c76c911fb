//! End-to-end entry point: evaluate, verify, improve and label content.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument};

use crate::error::Result;
use crate::llm::{ClientConfig, LLMClient, OpenAIClient};

use super::cache::{CacheConfig, CacheStats, EvaluationCache};
use super::evaluator::{Evaluator, LlmEvaluator};
use super::feedback::{FeedbackConfig, FeedbackLoop};
use super::generator::{Generator, LlmGenerator};
use super::progress::{ProgressEvent, ProgressReporter};
use super::types::{Claim, EvaluationResult, VerificationRequest};
use super::verification::{add_verification_metadata, ContentVerification, VerificationLevel, VerificationResult};

/// Configuration for [`HallucinationManager`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerConfig {
    /// Model used for evaluation and rewriting
    pub model: String,
    pub level: VerificationLevel,
    pub feedback: FeedbackConfig,
    pub cache: CacheConfig,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            model: "gpt-4o".to_string(),
            level: VerificationLevel::Standard,
            feedback: FeedbackConfig::default(),
            cache: CacheConfig::default(),
        }
    }
}

impl ManagerConfig {
    /// Create configuration from `FAITHLOOP_*` environment variables.
    ///
    /// Unset or unparsable numbers fall back to defaults; an unknown
    /// `FAITHLOOP_LEVEL` is an error.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`ManagerConfig::from_env`], reading variables through `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let secs = |key: &str| {
            lookup(key)
                .and_then(|s| s.trim().parse::<u64>().ok())
                .map(Duration::from_secs)
        };

        let level = match lookup("FAITHLOOP_LEVEL") {
            Some(raw) => raw.parse()?,
            None => defaults.level,
        };

        let mut feedback = defaults.feedback;
        feedback.call_timeout = secs("FAITHLOOP_CALL_TIMEOUT_SECS");
        feedback.loop_budget = secs("FAITHLOOP_LOOP_BUDGET_SECS");

        let mut cache = defaults.cache;
        if let Some(capacity) = lookup("FAITHLOOP_CACHE_CAPACITY").and_then(|s| s.trim().parse().ok()) {
            cache.capacity = capacity;
        }
        if let Some(ttl) = lookup("FAITHLOOP_CACHE_TTL_SECS").and_then(|s| s.trim().parse().ok()) {
            cache.ttl_secs = Some(ttl);
        }

        Ok(Self {
            model: lookup("FAITHLOOP_MODEL").unwrap_or(defaults.model),
            level,
            feedback,
            cache,
        })
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_level(mut self, level: VerificationLevel) -> Self {
        self.level = level;
        self
    }

    pub fn with_feedback(mut self, feedback: FeedbackConfig) -> Self {
        self.feedback = feedback;
        self
    }

    pub fn with_cache(mut self, cache: CacheConfig) -> Self {
        self.cache = cache;
        self
    }
}

/// Score figures for display.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreSummary {
    pub initial_score: f64,
    pub final_score: f64,
    /// Score gain in percentage points
    pub improvement_percent: f64,
    pub iterations: u32,
    /// Whether the feedback loop ran
    pub improved: bool,
    /// Badge text for the verdict
    pub status: String,
}

/// Full records behind a [`ProcessedContent`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingDetails {
    pub initial_evaluation: EvaluationResult,
    pub verification: VerificationResult,
    /// Markdown report, present when the feedback loop ran
    pub improvement_report: Option<String>,
}

/// Result of [`HallucinationManager::process_content`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessedContent {
    pub original_content: String,
    /// Content to show, with a verification footer when it was improved and verified
    pub processed_content: String,
    pub verification_passed: bool,
    pub score_summary: ScoreSummary,
    /// Claims flagged on the original content
    pub problematic_claims: Vec<Claim>,
    pub details: Option<ProcessingDetails>,
}

/// Owns the evaluator, generator, cache, loop and verification policy.
pub struct HallucinationManager {
    feedback: Arc<FeedbackLoop>,
    verification: ContentVerification,
    config: ManagerConfig,
}

impl HallucinationManager {
    pub fn new(
        evaluator: Arc<dyn Evaluator>,
        generator: Arc<dyn Generator>,
        config: ManagerConfig,
    ) -> Self {
        let cache = EvaluationCache::new(config.cache.clone());
        let feedback = Arc::new(
            FeedbackLoop::new(evaluator, generator, config.feedback.clone()).with_cache(cache),
        );
        let verification = ContentVerification::new(feedback.clone(), config.level);
        Self {
            feedback,
            verification,
            config,
        }
    }

    /// Wire the OpenAI-backed evaluator and generator.
    pub fn from_config(config: ManagerConfig, client_config: ClientConfig) -> Result<Self> {
        let client: Arc<dyn LLMClient> = Arc::new(OpenAIClient::new(
            client_config.with_default_model(config.model.clone()),
        )?);
        let evaluator = Arc::new(LlmEvaluator::new(client.clone()).with_model(config.model.clone()));
        let generator = Arc::new(LlmGenerator::new(client).with_model(config.model.clone()));
        Ok(Self::new(evaluator, generator, config))
    }

    /// Create a manager from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_config(ManagerConfig::from_env()?, ClientConfig::from_env()?)
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn level(&self) -> VerificationLevel {
        self.verification.level()
    }

    pub async fn cache_stats(&self) -> CacheStats {
        self.feedback.cache().stats().await
    }

    /// Run content through verification and improvement.
    ///
    /// Content is always returned, labelled rather than withheld; only an
    /// evaluator failure makes this an error.
    #[instrument(skip_all, fields(level = %self.level(), with_details = with_details))]
    pub async fn process_content(
        &self,
        request: &VerificationRequest,
        progress: &ProgressReporter,
        with_details: bool,
    ) -> Result<ProcessedContent> {
        progress.report(ProgressEvent::ProcessingStarted {
            query: request.query.clone(),
        });

        progress.report(ProgressEvent::EvaluationStarted);
        let initial_evaluation = self.feedback.evaluate_cached(request).await?;
        let verification = self
            .verification
            .verify_evaluated(request, initial_evaluation.clone(), true, progress)
            .await;

        let processed_content = if verification.passed && verification.content != request.content {
            add_verification_metadata(&verification.content, &verification)
        } else {
            verification.content.clone()
        };

        let score_summary = ScoreSummary {
            initial_score: initial_evaluation.faithfulness_score,
            final_score: verification.score,
            improvement_percent: (verification.score - initial_evaluation.faithfulness_score) * 100.0,
            iterations: verification.iterations,
            improved: verification.improvement_performed,
            status: verification.badge().text,
        };
        info!(
            initial = score_summary.initial_score,
            final_score = score_summary.final_score,
            passed = verification.passed,
            "Content processed"
        );

        let problematic_claims = initial_evaluation.problematic_claims.clone();
        let verification_passed = verification.passed;
        let details = with_details.then(|| ProcessingDetails {
            improvement_report: verification
                .improvement
                .as_ref()
                .map(FeedbackLoop::improvement_report),
            initial_evaluation,
            verification,
        });

        Ok(ProcessedContent {
            original_content: request.content.clone(),
            processed_content,
            verification_passed,
            score_summary,
            problematic_claims,
            details,
        })
    }

    /// Evaluate without improving.
    pub async fn evaluate_only(&self, request: &VerificationRequest) -> Result<EvaluationResult> {
        self.feedback.evaluate_cached(request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::hallucination::test_support::{original_section, ScriptedEvaluator, ScriptedGenerator};
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    const CLAIM: &str = "Docker was invented by Solomon Hykes in 2010 at dotCloud";

    fn content() -> String {
        format!(
            "Containers package an application with its dependencies.\n\n\
{}. It quickly became the standard way to ship software.\n\n\
Virtual machines, by contrast, each run a full guest operating system.",
            CLAIM
        )
    }

    fn request() -> VerificationRequest {
        VerificationRequest::new(
            "What is Docker?",
            content(),
            "Docker was created by Solomon Hykes in 2013 at dotCloud.",
        )
    }

    fn date_fixing_manager() -> (Arc<ScriptedEvaluator>, Arc<ScriptedGenerator>, HallucinationManager) {
        let evaluator = Arc::new(ScriptedEvaluator::new(|response| {
            if response.contains("2010") {
                Ok(EvaluationResult::new(0.6, "Wrong date")
                    .with_claim(Claim::new(CLAIM, "Sources say 2013")))
            } else {
                Ok(EvaluationResult::new(0.975, "Supported"))
            }
        }));
        let generator = Arc::new(ScriptedGenerator::new(|call| {
            Ok(original_section(&call.user)
                .unwrap_or_default()
                .replace("invented by Solomon Hykes in 2010", "created by Solomon Hykes in 2013"))
        }));
        let manager = HallucinationManager::new(
            evaluator.clone(),
            generator.clone(),
            ManagerConfig::default(),
        );
        (evaluator, generator, manager)
    }

    #[tokio::test]
    async fn test_improved_content_gets_footer() {
        let (_, _, manager) = date_fixing_manager();

        let processed = manager
            .process_content(&request(), &ProgressReporter::none(), false)
            .await
            .unwrap();

        assert!(processed.verification_passed);
        assert!(!processed.processed_content.contains("2010"));
        assert!(processed
            .processed_content
            .ends_with("\n---\n*Content [VERIFIED] (97% factual accuracy) [Auto-improved]*\n"));
        assert_eq!(processed.original_content, content());
        assert_eq!(processed.problematic_claims.len(), 1);
        assert_eq!(processed.problematic_claims[0].text, CLAIM);
        assert_eq!(processed.score_summary.iterations, 1);
        assert!(processed.score_summary.improved);
        assert_eq!(processed.score_summary.status, "[OK] Verified & Auto-improved");
        assert!(processed.details.is_none());
    }

    #[tokio::test]
    async fn test_details_include_report() {
        let (_, _, manager) = date_fixing_manager();

        let processed = manager
            .process_content(&request(), &ProgressReporter::none(), true)
            .await
            .unwrap();

        let details = processed.details.unwrap();
        assert_eq!(details.initial_evaluation.faithfulness_score, 0.6);
        assert!(details.verification.improvement_performed);
        let report = details.improvement_report.unwrap();
        assert!(report.contains("- **Iterations Required**: 1"));
    }

    #[tokio::test]
    async fn test_passing_content_is_returned_as_is() {
        let evaluator = Arc::new(ScriptedEvaluator::fixed(0.96, Vec::new()));
        let generator = Arc::new(ScriptedGenerator::failing());
        let manager =
            HallucinationManager::new(evaluator.clone(), generator.clone(), ManagerConfig::default());

        let processed = manager
            .process_content(&request(), &ProgressReporter::none(), true)
            .await
            .unwrap();

        assert!(processed.verification_passed);
        assert_eq!(processed.processed_content, content());
        assert_eq!(processed.score_summary.status, "[OK] Verified");
        assert!(processed.details.unwrap().improvement_report.is_none());
        // Verification reuses the initial evaluation
        assert_eq!(evaluator.calls(), 1);
        assert!(generator.calls().is_empty());
    }

    #[tokio::test]
    async fn test_uncached_content_is_evaluated_once() {
        let evaluator = Arc::new(ScriptedEvaluator::fixed(0.96, Vec::new()));
        let manager = HallucinationManager::new(
            evaluator.clone(),
            Arc::new(ScriptedGenerator::failing()),
            ManagerConfig::default().with_cache(CacheConfig::default().with_capacity(0)),
        );

        let processed = manager
            .process_content(&request(), &ProgressReporter::none(), false)
            .await
            .unwrap();

        assert!(processed.verification_passed);
        assert_eq!(evaluator.calls(), 1);
        assert_eq!(manager.cache_stats().await.entry_count, 0);
    }

    #[tokio::test]
    async fn test_uncached_improvement_evaluates_original_once() {
        let original_evaluations = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = original_evaluations.clone();
        let evaluator = Arc::new(ScriptedEvaluator::new(move |response| {
            if response.contains("2010") {
                counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                Ok(EvaluationResult::new(0.6, "Wrong date")
                    .with_claim(Claim::new(CLAIM, "Sources say 2013")))
            } else {
                Ok(EvaluationResult::new(0.975, "Supported"))
            }
        }));
        let generator = Arc::new(ScriptedGenerator::new(|call| {
            Ok(original_section(&call.user)
                .unwrap_or_default()
                .replace("invented by Solomon Hykes in 2010", "created by Solomon Hykes in 2013"))
        }));
        let manager = HallucinationManager::new(
            evaluator.clone(),
            generator,
            ManagerConfig::default().with_cache(CacheConfig::default().with_capacity(0)),
        );

        let processed = manager
            .process_content(&request(), &ProgressReporter::none(), false)
            .await
            .unwrap();

        assert!(processed.verification_passed);
        assert_eq!(processed.score_summary.initial_score, 0.6);
        assert_eq!(
            original_evaluations.load(std::sync::atomic::Ordering::SeqCst),
            1
        );
        // Original once, the rewritten candidate once
        assert_eq!(evaluator.calls(), 2);
    }

    #[tokio::test]
    async fn test_unfixable_content_is_labelled_not_withheld() {
        let evaluator = Arc::new(ScriptedEvaluator::fixed(0.4, vec![Claim::new(CLAIM, "wrong")]));
        let manager = HallucinationManager::new(
            evaluator,
            Arc::new(ScriptedGenerator::echo()),
            ManagerConfig::default(),
        );

        let processed = manager
            .process_content(&request(), &ProgressReporter::none(), false)
            .await
            .unwrap();

        assert!(!processed.verification_passed);
        assert_eq!(processed.processed_content, content());
        assert_eq!(
            processed.score_summary.status,
            "[ERROR] Auto-improved but may contain inaccuracies"
        );
    }

    #[tokio::test]
    async fn test_evaluate_only_skips_rewriting() {
        let (evaluator, generator, manager) = date_fixing_manager();

        let evaluation = manager.evaluate_only(&request()).await.unwrap();

        assert_eq!(evaluation.faithfulness_score, 0.6);
        assert_eq!(evaluator.calls(), 1);
        assert!(generator.calls().is_empty());
        assert_eq!(manager.cache_stats().await.misses, 1);
    }

    #[tokio::test]
    async fn test_evaluator_failure_is_an_error() {
        let manager = HallucinationManager::new(
            Arc::new(ScriptedEvaluator::new(|_| Err(Error::evaluation("no score")))),
            Arc::new(ScriptedGenerator::failing()),
            ManagerConfig::default(),
        );

        let err = manager
            .process_content(&request(), &ProgressReporter::none(), false)
            .await
            .unwrap_err();
        assert!(err.is_evaluation());
    }

    #[test]
    fn test_config_from_lookup() {
        let vars = HashMap::from([
            ("FAITHLOOP_MODEL", "gpt-4o-mini"),
            ("FAITHLOOP_LEVEL", "high"),
            ("FAITHLOOP_CALL_TIMEOUT_SECS", "30"),
            ("FAITHLOOP_CACHE_CAPACITY", "not-a-number"),
            ("FAITHLOOP_CACHE_TTL_SECS", "60"),
        ]);
        let config = ManagerConfig::from_lookup(|key| vars.get(key).map(|v| v.to_string())).unwrap();

        assert_eq!(config.model, "gpt-4o-mini");
        assert_eq!(config.level, VerificationLevel::Strict);
        assert_eq!(config.feedback.call_timeout, Some(Duration::from_secs(30)));
        assert_eq!(config.feedback.loop_budget, None);
        assert_eq!(config.cache.capacity, 256);
        assert_eq!(config.cache.ttl_secs, Some(60));
    }

    #[test]
    fn test_config_rejects_unknown_level() {
        let result = ManagerConfig::from_lookup(|key| {
            (key == "FAITHLOOP_LEVEL").then(|| "paranoid".to_string())
        });
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
