//! The evaluator seam and its LLM-backed implementation.
//!
//! An evaluator scores how faithful a response is to its grounding text and
//! lists the claims it could not support. Whatever shape the verdict arrives
//! in, it leaves this module as an [`EvaluationResult`] with tagged claims.

use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, instrument};

use crate::error::{Error, Result};
use crate::llm::{ChatMessage, CompletionRequest, LLMClient};

use super::generator::truncate_chars;
use super::types::{Claim, ClaimKind, EvaluationResult};

/// Scores faithfulness of a response against grounding material.
///
/// Implementations must return an error rather than a zero score when the
/// verdict cannot be produced.
#[async_trait]
pub trait Evaluator: Send + Sync {
    async fn evaluate(
        &self,
        query: &str,
        response: &str,
        grounding_text: &str,
        sources: &[String],
    ) -> Result<EvaluationResult>;
}

const EVALUATOR_SYSTEM_PROMPT: &str = "You are a meticulous fact-checker. \
You compare a response against reference context and report which statements \
are not supported by it. You answer with a single JSON object and nothing else.";

/// Grounding text beyond this many characters is cut from the evaluation prompt.
const GROUNDING_LIMIT: usize = 8000;

/// Evaluator that asks an LLM for a JSON verdict.
pub struct LlmEvaluator {
    client: Arc<dyn LLMClient>,
    model: Option<String>,
    max_tokens: u32,
}

impl LlmEvaluator {
    pub fn new(client: Arc<dyn LLMClient>) -> Self {
        Self {
            client,
            model: None,
            max_tokens: 1500,
        }
    }

    /// Use a specific model instead of the client's default.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    fn build_prompt(query: &str, response: &str, grounding_text: &str, sources: &[String]) -> String {
        let sources = if sources.is_empty() {
            "(none listed)".to_string()
        } else {
            sources
                .iter()
                .map(|s| format!("- {}", s))
                .collect::<Vec<_>>()
                .join("\n")
        };

        format!(
            r#"Evaluate how faithful the RESPONSE is to the CONTEXT.

QUERY:
{query}

RESPONSE:
{response}

CONTEXT:
{context}

SOURCES:
{sources}

Return JSON with this shape:
{{
  "faithfulness_score": <number between 0 and 1>,
  "assessment": "<one or two sentences>",
  "problematic_claims": [
    {{"text": "<exact quote from the response>", "reason": "<why it is unsupported>", "correction": "<fact from the context, if any>"}}
  ]
}}

Quote claim text verbatim from the RESPONSE. Use an empty list when every statement is supported."#,
            query = query,
            response = response,
            context = truncate_chars(grounding_text, GROUNDING_LIMIT),
            sources = sources,
        )
    }
}

#[async_trait]
impl Evaluator for LlmEvaluator {
    #[instrument(skip_all, fields(response_len = response.len()))]
    async fn evaluate(
        &self,
        query: &str,
        response: &str,
        grounding_text: &str,
        sources: &[String],
    ) -> Result<EvaluationResult> {
        let mut request = CompletionRequest::new()
            .with_system(EVALUATOR_SYSTEM_PROMPT)
            .with_message(ChatMessage::user(Self::build_prompt(
                query,
                response,
                grounding_text,
                sources,
            )))
            .with_temperature(0.0)
            .with_max_tokens(self.max_tokens);
        if let Some(model) = &self.model {
            request = request.with_model(model.clone());
        }

        let completion = self
            .client
            .complete(request)
            .await
            .map_err(|e| Error::evaluation_with_source("evaluator call failed", e))?;

        let result = parse_evaluation(&completion.content)?;
        debug!(
            score = result.faithfulness_score,
            claims = result.problematic_claims.len(),
            "Evaluation parsed"
        );
        Ok(result)
    }
}

#[derive(Debug, Deserialize)]
struct RawEvaluation {
    #[serde(default, alias = "score")]
    faithfulness_score: Option<f64>,
    #[serde(default)]
    assessment: Option<String>,
    #[serde(default)]
    problematic_claims: Vec<RawClaim>,
    #[serde(default)]
    hallucinated_statements: Vec<String>,
    #[serde(default)]
    grounding: Option<RawGrounding>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawClaim {
    Text(String),
    Detailed {
        text: String,
        #[serde(default)]
        reason: Option<String>,
        #[serde(default)]
        correction: Option<String>,
    },
}

#[derive(Debug, Deserialize)]
struct RawGrounding {
    #[serde(default)]
    ungrounded_claims: Vec<String>,
}

/// Parse an evaluator verdict into an [`EvaluationResult`].
///
/// Accepts bare JSON or JSON wrapped in prose or a code fence. Claims from
/// `problematic_claims`, `hallucinated_statements` and
/// `grounding.ungrounded_claims` are merged in that order, first occurrence
/// of a text wins.
pub fn parse_evaluation(text: &str) -> Result<EvaluationResult> {
    let json = extract_json(text);
    let raw: RawEvaluation = serde_json::from_str(json)
        .map_err(|e| Error::evaluation_with_source("unparsable evaluator verdict", e))?;

    let score = raw
        .faithfulness_score
        .ok_or_else(|| Error::evaluation("verdict has no faithfulness_score"))?;
    if !score.is_finite() || !(0.0..=1.0).contains(&score) {
        return Err(Error::evaluation(format!(
            "faithfulness_score {} is outside [0, 1]",
            score
        )));
    }

    let mut claims: Vec<Claim> = Vec::new();
    let mut push = |claim: Claim| {
        if !claim.text.trim().is_empty() && !claims.iter().any(|c| c.text == claim.text) {
            claims.push(claim);
        }
    };

    for raw_claim in raw.problematic_claims {
        match raw_claim {
            RawClaim::Text(text) => push(Claim::bare(text, ClaimKind::Problematic)),
            RawClaim::Detailed {
                text,
                reason,
                correction,
            } => {
                let reason = reason
                    .filter(|r| !r.trim().is_empty())
                    .unwrap_or_else(|| ClaimKind::Problematic.default_reason().to_string());
                let mut claim = Claim::new(text, reason);
                claim.correction = correction.filter(|c| !c.trim().is_empty());
                push(claim);
            }
        }
    }
    for text in raw.hallucinated_statements {
        push(Claim::bare(text, ClaimKind::Hallucinated));
    }
    for text in raw.grounding.map(|g| g.ungrounded_claims).unwrap_or_default() {
        push(Claim::bare(text, ClaimKind::Ungrounded));
    }

    Ok(EvaluationResult::new(score, raw.assessment.unwrap_or_default()).with_claims(claims))
}

/// Pull a JSON object out of model output that may carry fences or prose.
fn extract_json(response: &str) -> &str {
    if let Some(start) = response.find("```") {
        let fenced = &response[start + 3..];
        let body_start = fenced.find('\n').map(|i| i + 1).unwrap_or(0);
        let body = &fenced[body_start..];
        if let Some(end) = body.find("```") {
            return body[..end].trim();
        }
    }

    match (response.find('{'), response.rfind('}')) {
        (Some(start), Some(end)) if end > start => &response[start..=end],
        _ => response.trim(),
    }
}
