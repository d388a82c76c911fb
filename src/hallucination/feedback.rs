//! The evaluate → rewrite → evaluate loop.
//!
//! The loop only ever moves its "best" version forward: a candidate replaces
//! the best one only when it scores strictly higher, so a regressing rewrite
//! is recorded in the metrics and otherwise ignored.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::error::{Error, Result};

use super::cache::{content_hash, EvaluationCache};
use super::evaluator::Evaluator;
use super::generator::Generator;
use super::progress::{ProgressEvent, ProgressReporter};
use super::rewriter::{within, RewriterConfig, SectionRewriter};
use super::types::{
    EvaluationResult, ImprovementResult, IterationMetric, LoopStatus, LoopStop,
    VerificationRequest,
};

/// Configuration for the feedback loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedbackConfig {
    pub max_iterations: u32,
    pub target_score: f64,
    /// Gains above this count as meaningful improvement
    pub meaningful_delta: f64,
    /// From the second iteration on, stop when the best score is within this
    /// of the initial score
    pub diminishing_delta: f64,
    /// Bound on each evaluator and generator call
    pub call_timeout: Option<Duration>,
    /// Bound on the whole loop
    pub loop_budget: Option<Duration>,
}

impl Default for FeedbackConfig {
    fn default() -> Self {
        Self {
            max_iterations: 3,
            target_score: 0.9,
            meaningful_delta: 0.05,
            diminishing_delta: 0.1,
            call_timeout: None,
            loop_budget: None,
        }
    }
}

impl FeedbackConfig {
    pub fn with_max_iterations(mut self, max_iterations: u32) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn with_target_score(mut self, target_score: f64) -> Self {
        self.target_score = target_score.clamp(0.0, 1.0);
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = Some(timeout);
        self
    }

    pub fn with_loop_budget(mut self, budget: Duration) -> Self {
        self.loop_budget = Some(budget);
        self
    }

    pub fn limits(&self) -> LoopLimits {
        LoopLimits {
            max_iterations: self.max_iterations,
            target_score: self.target_score,
        }
    }
}

/// Per-run iteration budget and target.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LoopLimits {
    pub max_iterations: u32,
    pub target_score: f64,
}

enum IterationOutcome {
    /// Both the rewrite and the full rewrite reproduced seen content
    Repeated,
    Evaluated {
        content: String,
        evaluation: EvaluationResult,
    },
}

/// Iteratively improves content until it meets a target score.
pub struct FeedbackLoop {
    evaluator: Arc<dyn Evaluator>,
    rewriter: SectionRewriter,
    cache: EvaluationCache,
    config: FeedbackConfig,
}

impl FeedbackLoop {
    /// Create a loop with a private cache and a default rewriter over `generator`.
    pub fn new(
        evaluator: Arc<dyn Evaluator>,
        generator: Arc<dyn Generator>,
        config: FeedbackConfig,
    ) -> Self {
        let rewriter_config = RewriterConfig {
            call_timeout: config.call_timeout,
            ..RewriterConfig::default()
        };
        Self {
            evaluator,
            rewriter: SectionRewriter::new(generator, rewriter_config),
            cache: EvaluationCache::default(),
            config,
        }
    }

    /// Share `cache` with other loops.
    pub fn with_cache(mut self, cache: EvaluationCache) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_rewriter(mut self, rewriter: SectionRewriter) -> Self {
        self.rewriter = rewriter;
        self
    }

    pub fn config(&self) -> &FeedbackConfig {
        &self.config
    }

    pub fn cache(&self) -> &EvaluationCache {
        &self.cache
    }

    /// Evaluate through the cache.
    pub async fn evaluate_cached(&self, request: &VerificationRequest) -> Result<EvaluationResult> {
        let key = self.cache.key_for(request);
        if let Some(hit) = self.cache.get(&key).await {
            return Ok(hit);
        }

        let evaluation = within(
            self.config.call_timeout,
            self.evaluator.evaluate(
                &request.query,
                &request.content,
                &request.grounding_text,
                &request.sources,
            ),
        )
        .await
        .map_err(|e| match e {
            Error::Evaluation { .. } => e,
            other => Error::evaluation_with_source("evaluator call failed", other),
        })?;

        self.cache.insert(key, evaluation.clone()).await;
        Ok(evaluation)
    }

    /// Improve with the configured iteration limit and target.
    pub async fn improve(
        &self,
        request: &VerificationRequest,
        progress: &ProgressReporter,
    ) -> Result<ImprovementResult> {
        self.improve_with(request, self.config.limits(), progress)
            .await
    }

    /// Improve `request.content` until it scores `limits.target_score`.
    ///
    /// Only the initial evaluation can fail the call; failures inside an
    /// iteration are logged and the iteration counts as no improvement.
    pub async fn improve_with(
        &self,
        request: &VerificationRequest,
        limits: LoopLimits,
        progress: &ProgressReporter,
    ) -> Result<ImprovementResult> {
        let started = Instant::now();

        progress.report(ProgressEvent::EvaluationStarted);
        let initial_evaluation = self.evaluate_cached(request).await?;
        Ok(self
            .run(request, initial_evaluation, limits, progress, started)
            .await)
    }

    /// Like [`improve_with`](Self::improve_with), starting from an evaluation
    /// of `request.content` the caller already has.
    pub async fn improve_from(
        &self,
        request: &VerificationRequest,
        initial_evaluation: EvaluationResult,
        limits: LoopLimits,
        progress: &ProgressReporter,
    ) -> ImprovementResult {
        self.run(request, initial_evaluation, limits, progress, Instant::now())
            .await
    }

    #[instrument(skip_all, fields(max_iterations = limits.max_iterations, target = limits.target_score))]
    async fn run(
        &self,
        request: &VerificationRequest,
        initial_evaluation: EvaluationResult,
        limits: LoopLimits,
        progress: &ProgressReporter,
        started: Instant,
    ) -> ImprovementResult {
        let initial_score = initial_evaluation.faithfulness_score;
        let mut metrics = vec![IterationMetric::from_evaluation(0, &initial_evaluation)];

        if initial_score >= limits.target_score {
            info!(score = initial_score, "Content already meets target");
            let result = self.finish(
                request,
                RunState {
                    best_content: request.content.clone(),
                    best_evaluation: initial_evaluation.clone(),
                    iterations: 0,
                    passed: true,
                    stop: LoopStop::AlreadyPassing,
                },
                initial_evaluation,
                metrics,
            );
            progress.report(ProgressEvent::ImprovementCompleted {
                initial_score,
                final_score: result.final_score,
            });
            return result;
        }

        let mut state = RunState {
            best_content: request.content.clone(),
            best_evaluation: initial_evaluation.clone(),
            iterations: 0,
            passed: false,
            stop: LoopStop::IterationLimit,
        };
        let mut seen: HashSet<String> = HashSet::from([content_hash(&request.content)]);

        for iteration in 1..=limits.max_iterations {
            let remaining = match self.remaining_budget(started) {
                Some(remaining) if remaining.is_zero() => {
                    state.stop = LoopStop::TimeBudget;
                    break;
                }
                other => other,
            };

            state.iterations = iteration;
            let best_score = state.best_evaluation.faithfulness_score;
            progress.report(ProgressEvent::IterationStarted {
                iteration,
                max_iterations: limits.max_iterations,
                best_score,
            });

            if !state.best_evaluation.has_claims() && best_score >= limits.target_score {
                progress.report(ProgressEvent::NoIssues { score: best_score });
                state.passed = true;
                state.stop = LoopStop::TargetReached;
                break;
            }

            progress.report(ProgressEvent::FixingClaims {
                count: state.best_evaluation.problematic_claims.len(),
            });

            let outcome = within(
                remaining,
                self.run_iteration(request, &state.best_content, &state.best_evaluation, &mut seen),
            )
            .await;

            match outcome {
                Ok(IterationOutcome::Repeated) => {
                    info!(iteration, "Rewrites reproduced seen content; stopping");
                    state.stop = LoopStop::RepeatedContent;
                    break;
                }
                Ok(IterationOutcome::Evaluated {
                    content,
                    evaluation,
                }) => {
                    metrics.push(IterationMetric::from_evaluation(iteration, &evaluation));
                    let score = evaluation.faithfulness_score;
                    let adopted = score > best_score;
                    progress.report(ProgressEvent::CandidateEvaluated {
                        iteration,
                        score,
                        adopted,
                    });

                    if adopted {
                        debug!(score, previous = best_score, "New best version");
                        state.best_content = content;
                        state.best_evaluation = evaluation;
                        if score >= limits.target_score {
                            progress.report(ProgressEvent::TargetReached { score });
                            state.passed = true;
                            state.stop = LoopStop::TargetReached;
                            break;
                        }
                    } else if evaluation.has_claims()
                        && evaluation.claim_signature() == state.best_evaluation.claim_signature()
                    {
                        info!(iteration, "Evaluator flagged the same claims again; stopping");
                        state.stop = LoopStop::PersistentClaims;
                        break;
                    }
                }
                Err(Error::Timeout { .. }) if self.budget_exhausted(started) => {
                    warn!(iteration, "Loop time budget exhausted");
                    state.stop = LoopStop::TimeBudget;
                    break;
                }
                Err(e) => {
                    warn!(iteration, error = %e, "Improvement iteration failed");
                    continue;
                }
            }

            let best_score = state.best_evaluation.faithfulness_score;
            if iteration >= 2 && best_score <= initial_score + self.config.diminishing_delta {
                info!(iteration, best_score, "No significant improvement; stopping");
                state.stop = LoopStop::DiminishingReturns;
                break;
            }
        }

        let result = self.finish(request, state, initial_evaluation, metrics);
        info!(
            initial = result.initial_score,
            final_score = result.final_score,
            iterations = result.iterations,
            stop = %result.stop,
            "Improvement complete"
        );
        progress.report(ProgressEvent::ImprovementCompleted {
            initial_score: result.initial_score,
            final_score: result.final_score,
        });
        result
    }

    async fn run_iteration(
        &self,
        request: &VerificationRequest,
        best_content: &str,
        best_evaluation: &EvaluationResult,
        seen: &mut HashSet<String>,
    ) -> Result<IterationOutcome> {
        let fixed = self
            .rewriter
            .fix_content(
                &request.query,
                best_content,
                &request.grounding_text,
                &best_evaluation.problematic_claims,
            )
            .await;

        let mut candidate = fixed.content;
        let mut hash = content_hash(&candidate);
        if seen.contains(&hash) {
            debug!("Rewrite reproduced seen content; trying a full rewrite");
            let full = self
                .rewriter
                .rewrite_full(&request.query, best_content, &request.grounding_text)
                .await;
            candidate = full.text;
            hash = content_hash(&candidate);
            if seen.contains(&hash) {
                return Ok(IterationOutcome::Repeated);
            }
        }
        seen.insert(hash);

        let evaluation = self
            .evaluate_cached(&request.with_content(candidate.clone()))
            .await?;
        Ok(IterationOutcome::Evaluated {
            content: candidate,
            evaluation,
        })
    }

    /// Render a markdown report of a loop run.
    pub fn improvement_report(result: &ImprovementResult) -> String {
        let mut lines = vec![
            "## Content Improvement Report".to_string(),
            String::new(),
            format!("- **Initial Faithfulness Score**: {:.2}", result.initial_score),
            format!("- **Final Faithfulness Score**: {:.2}", result.final_score),
            format!("- **Improvement**: {:.2} points", result.improvement_delta),
            format!("- **Iterations Required**: {}", result.iterations),
            format!("- **Verification Status**: {}", status_text(result)),
            format!("- **Stopped Because**: {}", result.stop),
            String::new(),
            "### Iteration Metrics".to_string(),
            String::new(),
        ];

        for metric in &result.metrics {
            lines.push(format!(
                "- Iteration {}: Score = {:.2}, Issues = {}, Assessment = {}",
                metric.iteration, metric.score, metric.problematic_claim_count, metric.assessment
            ));
        }

        lines.extend([
            String::new(),
            "### Conclusion".to_string(),
            String::new(),
            format!(
                "The content {}",
                if result.verification_passed {
                    "successfully passed verification checks."
                } else {
                    "did not meet the minimum quality threshold."
                }
            ),
        ]);

        lines.join("\n")
    }

    fn remaining_budget(&self, started: Instant) -> Option<Duration> {
        self.config
            .loop_budget
            .map(|budget| budget.saturating_sub(started.elapsed()))
    }

    fn budget_exhausted(&self, started: Instant) -> bool {
        self.remaining_budget(started)
            .is_some_and(|remaining| remaining.is_zero())
    }

    fn finish(
        &self,
        request: &VerificationRequest,
        state: RunState,
        initial_evaluation: EvaluationResult,
        metrics: Vec<IterationMetric>,
    ) -> ImprovementResult {
        let initial_score = initial_evaluation.faithfulness_score;
        let final_score = state.best_evaluation.faithfulness_score;
        let improvement_delta = final_score - initial_score;
        let improved = improvement_delta > self.config.meaningful_delta;

        let status = if state.passed {
            LoopStatus::Passed
        } else if improved {
            LoopStatus::Improved
        } else if state.stop == LoopStop::RepeatedContent {
            LoopStatus::Exhausted
        } else {
            LoopStatus::NoImprovement
        };

        ImprovementResult {
            initial_content: request.content.clone(),
            final_content: state.best_content,
            initial_score,
            final_score,
            iterations: state.iterations,
            verification_passed: state.passed,
            metrics,
            status,
            stop: state.stop,
            improved,
            improvement_delta,
            initial_evaluation,
            final_evaluation: state.best_evaluation,
        }
    }
}

struct RunState {
    best_content: String,
    best_evaluation: EvaluationResult,
    iterations: u32,
    passed: bool,
    stop: LoopStop,
}

/// Status line for reports.
pub fn status_text(result: &ImprovementResult) -> &'static str {
    if result.stop == LoopStop::AlreadyPassing {
        "Already met quality criteria"
    } else {
        result.status.describe()
    }
}
