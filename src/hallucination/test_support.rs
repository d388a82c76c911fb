//! Scripted evaluator and generator stubs for unit tests.

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::error::{Error, Result};

use super::evaluator::Evaluator;
use super::generator::Generator;
use super::rewriter::{CLAIMS_HEADER, FULL_CONTEXT_HEADER, FULL_TEXT_HEADER, SECTION_HEADER};
use super::types::{Claim, EvaluationResult};

/// One recorded `Generator::rewrite` call.
#[derive(Debug, Clone)]
pub(crate) struct GeneratorCall {
    pub system: String,
    pub user: String,
    pub temperature: f64,
    pub max_tokens: u32,
}

type RewriteFn = dyn Fn(&GeneratorCall) -> Result<String> + Send + Sync;
type FactsFn = dyn Fn(&str) -> Result<String> + Send + Sync;

/// Generator whose replies come from closures.
pub(crate) struct ScriptedGenerator {
    rewrite_fn: Box<RewriteFn>,
    facts_fn: Box<FactsFn>,
    delay: Option<Duration>,
    calls: Mutex<Vec<GeneratorCall>>,
    fact_calls: AtomicUsize,
}

impl ScriptedGenerator {
    pub fn new<F>(rewrite_fn: F) -> Self
    where
        F: Fn(&GeneratorCall) -> Result<String> + Send + Sync + 'static,
    {
        Self {
            rewrite_fn: Box::new(rewrite_fn),
            facts_fn: Box::new(|_| Err(Error::generation("no facts scripted"))),
            delay: None,
            calls: Mutex::new(Vec::new()),
            fact_calls: AtomicUsize::new(0),
        }
    }

    /// Every call fails.
    pub fn failing() -> Self {
        Self::new(|_| Err(Error::generation("scripted failure")))
    }

    /// Returns the text it was asked to rewrite, unchanged.
    pub fn echo() -> Self {
        Self::new(|call| {
            original_section(&call.user)
                .ok_or_else(|| Error::generation("prompt has no original text"))
        })
    }

    pub fn with_facts<F>(mut self, facts_fn: F) -> Self
    where
        F: Fn(&str) -> Result<String> + Send + Sync + 'static,
    {
        self.facts_fn = Box::new(facts_fn);
        self
    }

    /// Sleep this long before every rewrite reply.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> Vec<GeneratorCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn fact_calls(&self) -> usize {
        self.fact_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Generator for ScriptedGenerator {
    async fn rewrite(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        temperature: f64,
        max_output_tokens: u32,
    ) -> Result<String> {
        let call = GeneratorCall {
            system: system_prompt.to_string(),
            user: user_prompt.to_string(),
            temperature,
            max_tokens: max_output_tokens,
        };
        self.calls.lock().unwrap().push(call.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        (self.rewrite_fn)(&call)
    }

    async fn extract_facts(&self, claim_text: &str, _grounding_text: &str) -> Result<String> {
        self.fact_calls.fetch_add(1, Ordering::SeqCst);
        (self.facts_fn)(claim_text)
    }
}

/// The text a region or whole-document rewrite prompt asks to be rewritten.
pub(crate) fn original_section(prompt: &str) -> Option<String> {
    let between = |open: &str, close: &str| -> Option<String> {
        let start = prompt.find(open)? + open.len() + 1;
        let end = start + prompt[start..].find(close)?;
        Some(prompt[start..end].trim_end_matches('\n').to_string())
    };
    between(SECTION_HEADER, CLAIMS_HEADER).or_else(|| between(FULL_TEXT_HEADER, FULL_CONTEXT_HEADER))
}

type EvaluateFn = dyn Fn(&str) -> Result<EvaluationResult> + Send + Sync;
type SlowFn = dyn Fn(&str) -> bool + Send + Sync;

/// Evaluator whose verdicts come from a closure over the response text.
pub(crate) struct ScriptedEvaluator {
    evaluate_fn: Box<EvaluateFn>,
    slow: Option<(Box<SlowFn>, Duration)>,
    calls: AtomicUsize,
}

impl ScriptedEvaluator {
    pub fn new<F>(evaluate_fn: F) -> Self
    where
        F: Fn(&str) -> Result<EvaluationResult> + Send + Sync + 'static,
    {
        Self {
            evaluate_fn: Box::new(evaluate_fn),
            slow: None,
            calls: AtomicUsize::new(0),
        }
    }

    /// Sleep `delay` before answering for responses matching `is_slow`.
    pub fn with_delay_when<F>(mut self, is_slow: F, delay: Duration) -> Self
    where
        F: Fn(&str) -> bool + Send + Sync + 'static,
    {
        self.slow = Some((Box::new(is_slow), delay));
        self
    }

    /// Always the same verdict.
    pub fn fixed(score: f64, claims: Vec<Claim>) -> Self {
        Self::new(move |_| Ok(EvaluationResult::new(score, "scripted").with_claims(claims.clone())))
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Evaluator for ScriptedEvaluator {
    async fn evaluate(
        &self,
        _query: &str,
        response: &str,
        _grounding_text: &str,
        _sources: &[String],
    ) -> Result<EvaluationResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some((is_slow, delay)) = &self.slow {
            if is_slow(response) {
                tokio::time::sleep(*delay).await;
            }
        }
        (self.evaluate_fn)(response)
    }
}
