//! Progress reporting at named checkpoints of a verification run.

use serde::{Deserialize, Serialize};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{trace, warn};

use crate::error::{Error, Result};

use super::verification::VerificationLevel;

/// Checkpoint reached during processing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProgressEvent {
    /// The manager picked up a request
    ProcessingStarted { query: String },
    /// Verification started at a level
    VerificationStarted { level: VerificationLevel },
    /// About to evaluate the initial content
    EvaluationStarted,
    /// An improvement iteration began
    IterationStarted {
        iteration: u32,
        max_iterations: u32,
        best_score: f64,
    },
    /// The best version has no flagged claims left
    NoIssues { score: f64 },
    /// Rewriting is about to address this many claims
    FixingClaims { count: usize },
    /// A rewritten candidate was scored
    CandidateEvaluated {
        iteration: u32,
        score: f64,
        adopted: bool,
    },
    /// The target score was met
    TargetReached { score: f64 },
    /// The loop finished
    ImprovementCompleted { initial_score: f64, final_score: f64 },
    /// Verification reached a verdict
    VerificationFinished { passed: bool, score: f64 },
}

impl std::fmt::Display for ProgressEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ProcessingStarted { query } => {
                write!(f, "Processing content for query: {}", query)
            }
            Self::VerificationStarted { level } => {
                write!(f, "Verifying content against sources, level={}...", level)
            }
            Self::EvaluationStarted => write!(f, "Evaluating initial content..."),
            Self::IterationStarted {
                iteration,
                max_iterations,
                best_score,
            } => write!(
                f,
                "Improvement iteration {}/{}: current score = {:.3}",
                iteration, max_iterations, best_score
            ),
            Self::NoIssues { score } => write!(
                f,
                "No issues found, content meets quality criteria (score={:.2})",
                score
            ),
            Self::FixingClaims { count } => write!(f, "Fixing {} problematic claims...", count),
            Self::CandidateEvaluated {
                iteration,
                score,
                adopted,
            } => write!(
                f,
                "Iteration {} candidate scored {:.2}{}",
                iteration,
                score,
                if *adopted { " (new best)" } else { "" }
            ),
            Self::TargetReached { score } => {
                write!(f, "Target quality achieved: score={:.2}", score)
            }
            Self::ImprovementCompleted {
                initial_score,
                final_score,
            } => write!(
                f,
                "Improvement complete: initial={:.2}, final={:.2}",
                initial_score, final_score
            ),
            Self::VerificationFinished { passed, score } => write!(
                f,
                "Verification {} (score={:.2})",
                if *passed { "passed" } else { "failed" },
                score
            ),
        }
    }
}

/// Caller-supplied progress sink.
pub type ProgressCallback = Arc<dyn Fn(&ProgressEvent) -> Result<()> + Send + Sync>;

/// Delivers progress events without letting the callback disturb the run.
///
/// Errors and panics raised by the callback are logged and dropped.
#[derive(Clone, Default)]
pub struct ProgressReporter {
    callback: Option<ProgressCallback>,
}

impl std::fmt::Debug for ProgressReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressReporter")
            .field("callback", &self.callback.is_some())
            .finish()
    }
}

impl ProgressReporter {
    /// A reporter that discards events.
    pub fn none() -> Self {
        Self::default()
    }

    pub fn new(callback: ProgressCallback) -> Self {
        Self {
            callback: Some(callback),
        }
    }

    pub fn from_fn<F>(callback: F) -> Self
    where
        F: Fn(&ProgressEvent) -> Result<()> + Send + Sync + 'static,
    {
        Self::new(Arc::new(callback))
    }

    pub fn report(&self, event: ProgressEvent) {
        trace!(%event, "Progress");
        let Some(callback) = &self.callback else {
            return;
        };

        let outcome = catch_unwind(AssertUnwindSafe(|| callback(&event)))
            .unwrap_or_else(|_| Err(Error::Callback("progress callback panicked".into())));
        if let Err(e) = outcome {
            warn!(error = %e, %event, "Progress callback failed; continuing");
        }
    }
}
