//! Verification policy: decide whether content passes, and whether to run the
//! feedback loop on it first.

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use tracing::{info, instrument};

use crate::error::{Error, Result};

use super::feedback::{FeedbackLoop, LoopLimits};
use super::progress::{ProgressEvent, ProgressReporter};
use super::types::{EvaluationResult, ImprovementResult, IterationMetric, VerificationRequest};

/// Named strictness policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerificationLevel {
    Relaxed,
    #[default]
    Standard,
    Strict,
}

impl VerificationLevel {
    pub fn policy(&self) -> VerificationPolicy {
        match self {
            Self::Relaxed => VerificationPolicy {
                target_score: 0.90,
                max_iterations: 2,
                pass_threshold: 0.85,
            },
            Self::Standard => VerificationPolicy {
                target_score: 0.95,
                max_iterations: 3,
                pass_threshold: 0.90,
            },
            Self::Strict => VerificationPolicy {
                target_score: 0.98,
                max_iterations: 5,
                pass_threshold: 0.95,
            },
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Relaxed => "relaxed",
            Self::Standard => "standard",
            Self::Strict => "strict",
        }
    }
}

impl std::fmt::Display for VerificationLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for VerificationLevel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "relaxed" | "basic" => Ok(Self::Relaxed),
            "standard" => Ok(Self::Standard),
            "strict" | "high" => Ok(Self::Strict),
            other => Err(Error::Config(format!(
                "unknown verification level '{}' (expected relaxed, standard or strict)",
                other
            ))),
        }
    }
}

/// Scores and budget attached to a [`VerificationLevel`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VerificationPolicy {
    /// Score the feedback loop aims for
    pub target_score: f64,
    pub max_iterations: u32,
    /// Score at which content passes
    pub pass_threshold: f64,
}

impl VerificationPolicy {
    pub fn limits(&self) -> LoopLimits {
        LoopLimits {
            max_iterations: self.max_iterations,
            target_score: self.target_score,
        }
    }
}

/// Outcome of [`ContentVerification::verify`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationResult {
    pub passed: bool,
    /// Score of the returned content
    pub score: f64,
    pub initial_score: f64,
    pub threshold: f64,
    pub level: VerificationLevel,
    pub original_content: String,
    /// Returned content, improved when the loop ran
    pub content: String,
    /// Whether the feedback loop ran
    pub improvement_performed: bool,
    /// Whether the loop gained a meaningful amount
    pub improved: bool,
    pub iterations: u32,
    pub improvement_delta: f64,
    pub metrics: Vec<IterationMetric>,
    pub improvement: Option<ImprovementResult>,
    /// Evaluation of the original content
    pub evaluation: EvaluationResult,
}

impl VerificationResult {
    pub fn badge(&self) -> VerificationBadge {
        verification_badge(self)
    }
}

/// Badge colour bands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BadgeColor {
    Green,
    Yellow,
    Red,
}

impl BadgeColor {
    pub fn for_score(score: f64) -> Self {
        if score >= 0.95 {
            Self::Green
        } else if score >= 0.85 {
            Self::Yellow
        } else {
            Self::Red
        }
    }

    fn marker(&self) -> &'static str {
        match self {
            Self::Green => "[OK]",
            Self::Yellow => "[WARNING]",
            Self::Red => "[ERROR]",
        }
    }
}

impl std::fmt::Display for BadgeColor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Green => write!(f, "green"),
            Self::Yellow => write!(f, "yellow"),
            Self::Red => write!(f, "red"),
        }
    }
}

/// Display data for a verification verdict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationBadge {
    pub text: String,
    pub color: BadgeColor,
    pub score_percent: u32,
    pub passed: bool,
    pub improved: bool,
}

fn score_percent(score: f64) -> u32 {
    (score.clamp(0.0, 1.0) * 100.0).floor() as u32
}

pub fn verification_badge(result: &VerificationResult) -> VerificationBadge {
    let color = BadgeColor::for_score(result.score);
    let passed = result.passed;
    let improved = result.improvement_performed;
    let label = match (passed, improved) {
        (true, true) => "Verified & Auto-improved",
        (true, false) => "Verified",
        (false, true) => "Auto-improved but may contain inaccuracies",
        (false, false) => "May contain inaccuracies",
    };

    VerificationBadge {
        text: format!("{} {}", color.marker(), label),
        color,
        score_percent: score_percent(result.score),
        passed,
        improved,
    }
}

/// Append a markdown footer stating the verdict.
pub fn add_verification_metadata(content: &str, result: &VerificationResult) -> String {
    let status = if result.passed {
        "[VERIFIED]"
    } else {
        "[WARNING: May contain inaccuracies]"
    };
    let mut line = format!(
        "*Content {} ({}% factual accuracy)",
        status,
        score_percent(result.score)
    );
    if result.improvement_performed {
        line.push_str(" [Auto-improved]");
    }
    line.push('*');

    format!("{}\n---\n{}\n", content, line)
}

/// Applies a [`VerificationLevel`] to content.
pub struct ContentVerification {
    feedback: Arc<FeedbackLoop>,
    level: VerificationLevel,
}

impl ContentVerification {
    pub fn new(feedback: Arc<FeedbackLoop>, level: VerificationLevel) -> Self {
        Self { feedback, level }
    }

    pub fn level(&self) -> VerificationLevel {
        self.level
    }

    pub fn policy(&self) -> VerificationPolicy {
        self.level.policy()
    }

    pub fn feedback(&self) -> &FeedbackLoop {
        &self.feedback
    }

    /// Evaluate once and pass at the level's threshold; otherwise optionally
    /// run the feedback loop with the level's target and budget.
    ///
    /// Evaluation failures propagate. Content that fails is still returned,
    /// marked as not passed.
    pub async fn verify(
        &self,
        request: &VerificationRequest,
        allow_improvement: bool,
        progress: &ProgressReporter,
    ) -> Result<VerificationResult> {
        progress.report(ProgressEvent::EvaluationStarted);
        let evaluation = self.feedback.evaluate_cached(request).await?;
        Ok(self
            .verify_evaluated(request, evaluation, allow_improvement, progress)
            .await)
    }

    /// Like [`verify`](Self::verify), with `evaluation` already computed for
    /// `request.content`.
    #[instrument(skip_all, fields(level = %self.level, allow_improvement = allow_improvement))]
    pub async fn verify_evaluated(
        &self,
        request: &VerificationRequest,
        evaluation: EvaluationResult,
        allow_improvement: bool,
        progress: &ProgressReporter,
    ) -> VerificationResult {
        let policy = self.policy();
        progress.report(ProgressEvent::VerificationStarted { level: self.level });

        let initial_score = evaluation.faithfulness_score;

        let mut result = VerificationResult {
            passed: initial_score >= policy.pass_threshold,
            score: initial_score,
            initial_score,
            threshold: policy.pass_threshold,
            level: self.level,
            original_content: request.content.clone(),
            content: request.content.clone(),
            improvement_performed: false,
            improved: false,
            iterations: 0,
            improvement_delta: 0.0,
            metrics: Vec::new(),
            improvement: None,
            evaluation,
        };

        if result.passed {
            info!(
                score = initial_score,
                threshold = policy.pass_threshold,
                "Content passed verification"
            );
        } else if allow_improvement {
            info!(score = initial_score, "Content failed verification; attempting improvement");
            let improvement = self
                .feedback
                .improve_from(request, result.evaluation.clone(), policy.limits(), progress)
                .await;

            result.improvement_performed = true;
            result.improved = improvement.improved;
            result.content = improvement.final_content.clone();
            result.score = improvement.final_score;
            result.iterations = improvement.iterations;
            result.improvement_delta = improvement.improvement_delta;
            result.metrics = improvement.metrics.clone();
            result.passed = improvement.final_score >= policy.pass_threshold;
            result.improvement = Some(improvement);
        } else {
            info!(score = initial_score, "Content failed verification; improvement not allowed");
        }

        progress.report(ProgressEvent::VerificationFinished {
            passed: result.passed,
            score: result.score,
        });
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hallucination::feedback::FeedbackConfig;
    use crate::hallucination::test_support::{original_section, ScriptedEvaluator, ScriptedGenerator};
    use crate::hallucination::types::Claim;
    use pretty_assertions::assert_eq;

    const BORDERLINE: &str = "Rust was first released in 2012 by Mozilla Research. \
It guarantees memory safety without a garbage collector.";

    fn borderline_verification(
        level: VerificationLevel,
    ) -> (Arc<ScriptedGenerator>, ContentVerification) {
        let evaluator = Arc::new(ScriptedEvaluator::new(|response| {
            if response == BORDERLINE {
                Ok(EvaluationResult::new(0.91, "Mostly supported").with_claim(Claim::new(
                    "Rust was first released in 2012",
                    "1.0 shipped in 2015",
                )))
            } else {
                Ok(EvaluationResult::new(0.99, "Supported"))
            }
        }));
        let generator = Arc::new(ScriptedGenerator::new(|call| {
            Ok(original_section(&call.user)
                .unwrap_or_default()
                .replace("first released in 2012", "first released as 1.0 in 2015"))
        }));
        let feedback = FeedbackLoop::new(evaluator, generator.clone(), FeedbackConfig::default());
        (generator, ContentVerification::new(Arc::new(feedback), level))
    }

    fn request() -> VerificationRequest {
        VerificationRequest::new(
            "When was Rust released?",
            BORDERLINE,
            "Rust 1.0 was released in May 2015.",
        )
    }

    #[tokio::test]
    async fn test_strict_improves_borderline_content() {
        let (generator, verification) = borderline_verification(VerificationLevel::Strict);

        let result = verification
            .verify(&request(), true, &ProgressReporter::none())
            .await
            .unwrap();

        assert!(result.improvement_performed);
        assert!(result.passed);
        assert_eq!(result.initial_score, 0.91);
        assert_eq!(result.score, 0.99);
        assert!(result.content.contains("2015"));
        assert_eq!(result.threshold, 0.95);
        assert!(!generator.calls().is_empty());
        assert!(result.improvement.is_some());
    }

    #[tokio::test]
    async fn test_relaxed_passes_borderline_content() {
        let (generator, verification) = borderline_verification(VerificationLevel::Relaxed);

        let result = verification
            .verify(&request(), true, &ProgressReporter::none())
            .await
            .unwrap();

        assert!(result.passed);
        assert!(!result.improvement_performed);
        assert_eq!(result.content, BORDERLINE);
        assert_eq!(result.iterations, 0);
        assert!(generator.calls().is_empty());
    }

    #[tokio::test]
    async fn test_failing_content_kept_when_improvement_disallowed() {
        let (generator, verification) = borderline_verification(VerificationLevel::Strict);

        let result = verification
            .verify(&request(), false, &ProgressReporter::none())
            .await
            .unwrap();

        assert!(!result.passed);
        assert!(!result.improvement_performed);
        assert_eq!(result.content, BORDERLINE);
        assert_eq!(result.evaluation.problematic_claims.len(), 1);
        assert!(generator.calls().is_empty());
    }

    #[tokio::test]
    async fn test_verify_evaluated_does_not_re_evaluate_original() {
        let evaluator = Arc::new(ScriptedEvaluator::new(|response| {
            if response == BORDERLINE {
                Err(Error::evaluation("original evaluated twice"))
            } else {
                Ok(EvaluationResult::new(0.99, "Supported"))
            }
        }));
        let generator = Arc::new(ScriptedGenerator::new(|call| {
            Ok(original_section(&call.user)
                .unwrap_or_default()
                .replace("first released in 2012", "first released as 1.0 in 2015"))
        }));
        let feedback = FeedbackLoop::new(evaluator.clone(), generator, FeedbackConfig::default());
        let verification = ContentVerification::new(Arc::new(feedback), VerificationLevel::Strict);
        let evaluation = EvaluationResult::new(0.91, "Mostly supported").with_claim(Claim::new(
            "Rust was first released in 2012",
            "1.0 shipped in 2015",
        ));

        let result = verification
            .verify_evaluated(&request(), evaluation, true, &ProgressReporter::none())
            .await;

        assert!(result.passed);
        assert_eq!(result.initial_score, 0.91);
        assert_eq!(result.score, 0.99);
        assert_eq!(evaluator.calls(), 1);
    }

    #[tokio::test]
    async fn test_evaluation_failure_propagates() {
        let evaluator = Arc::new(ScriptedEvaluator::new(|_| {
            Err(Error::evaluation("unparsable verdict"))
        }));
        let feedback = FeedbackLoop::new(
            evaluator,
            Arc::new(ScriptedGenerator::failing()),
            FeedbackConfig::default(),
        );
        let verification = ContentVerification::new(Arc::new(feedback), VerificationLevel::Standard);

        let err = verification
            .verify(&request(), true, &ProgressReporter::none())
            .await
            .unwrap_err();
        assert!(err.is_evaluation());
    }

    #[test]
    fn test_level_parsing() {
        assert_eq!("relaxed".parse::<VerificationLevel>().unwrap(), VerificationLevel::Relaxed);
        assert_eq!("BASIC".parse::<VerificationLevel>().unwrap(), VerificationLevel::Relaxed);
        assert_eq!(" Standard ".parse::<VerificationLevel>().unwrap(), VerificationLevel::Standard);
        assert_eq!("high".parse::<VerificationLevel>().unwrap(), VerificationLevel::Strict);
        assert!(matches!(
            "paranoid".parse::<VerificationLevel>(),
            Err(Error::Config(_))
        ));
        assert_eq!(VerificationLevel::default(), VerificationLevel::Standard);
    }

    #[test]
    fn test_policy_table() {
        let strict = VerificationLevel::Strict.policy();
        assert_eq!(strict.target_score, 0.98);
        assert_eq!(strict.max_iterations, 5);
        assert_eq!(strict.pass_threshold, 0.95);
        assert_eq!(VerificationLevel::Relaxed.policy().max_iterations, 2);
        assert_eq!(VerificationLevel::Standard.policy().pass_threshold, 0.90);
    }

    fn verdict(score: f64, passed: bool, improvement_performed: bool) -> VerificationResult {
        VerificationResult {
            passed,
            score,
            initial_score: score,
            threshold: 0.9,
            level: VerificationLevel::Standard,
            original_content: "text".into(),
            content: "text".into(),
            improvement_performed,
            improved: improvement_performed,
            iterations: 0,
            improvement_delta: 0.0,
            metrics: Vec::new(),
            improvement: None,
            evaluation: EvaluationResult::new(score, "scripted"),
        }
    }

    #[test]
    fn test_badges() {
        let badge = verdict(0.975, true, true).badge();
        assert_eq!(badge.color, BadgeColor::Green);
        assert_eq!(badge.text, "[OK] Verified & Auto-improved");
        assert_eq!(badge.score_percent, 97);

        let badge = verdict(0.875, false, false).badge();
        assert_eq!(badge.color, BadgeColor::Yellow);
        assert_eq!(badge.text, "[WARNING] May contain inaccuracies");

        let badge = verdict(0.5, false, true).badge();
        assert_eq!(badge.color, BadgeColor::Red);
        assert_eq!(badge.text, "[ERROR] Auto-improved but may contain inaccuracies");
        assert_eq!(badge.score_percent, 50);
    }

    #[test]
    fn test_verification_footer() {
        assert_eq!(
            add_verification_metadata("Body.", &verdict(0.5, false, false)),
            "Body.\n---\n*Content [WARNING: May contain inaccuracies] (50% factual accuracy)*\n"
        );
        assert_eq!(
            add_verification_metadata("Body.", &verdict(0.25, true, true)),
            "Body.\n---\n*Content [VERIFIED] (25% factual accuracy) [Auto-improved]*\n"
        );
    }
}
