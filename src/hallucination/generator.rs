//! The generation seam used by the rewriter.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, instrument};

use crate::error::{Error, Result};
use crate::llm::{ChatMessage, CompletionRequest, LLMClient};

/// Text generation capability.
///
/// Both methods return an error when the underlying call fails; an empty
/// string is a valid (if useless) completion.
#[async_trait]
pub trait Generator: Send + Sync {
    /// Single-turn completion.
    async fn rewrite(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        temperature: f64,
        max_output_tokens: u32,
    ) -> Result<String>;

    /// Pull the facts in `grounding_text` that bear on `claim_text`.
    async fn extract_facts(&self, claim_text: &str, grounding_text: &str) -> Result<String>;
}

/// Reply an extractor gives when the grounding text has nothing on a claim.
pub const NO_FACTS_FOUND: &str = "No directly relevant information found in context.";

/// Grounding text beyond this many characters is cut from extraction prompts.
pub const EXTRACTION_GROUNDING_LIMIT: usize = 4000;

const EXTRACTION_SYSTEM_PROMPT: &str = "You are a factual information extractor. \
Find accurate information in the provided context that could replace an incorrect claim. \
Extract only statements the context directly supports.";

/// Generator backed by an [`LLMClient`].
pub struct LlmGenerator {
    client: Arc<dyn LLMClient>,
    model: Option<String>,
}

impl LlmGenerator {
    pub fn new(client: Arc<dyn LLMClient>) -> Self {
        Self {
            client,
            model: None,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    async fn complete(&self, mut request: CompletionRequest) -> Result<String> {
        if let Some(model) = &self.model {
            request = request.with_model(model.clone());
        }
        let response = self
            .client
            .complete(request)
            .await
            .map_err(|e| Error::generation(e.to_string()))?;
        debug!(
            output_tokens = response.usage.output_tokens,
            "Generation complete"
        );
        Ok(response.content.trim().to_string())
    }
}

#[async_trait]
impl Generator for LlmGenerator {
    #[instrument(skip_all, fields(temperature = temperature, max_tokens = max_output_tokens))]
    async fn rewrite(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        temperature: f64,
        max_output_tokens: u32,
    ) -> Result<String> {
        let request = CompletionRequest::new()
            .with_system(system_prompt)
            .with_message(ChatMessage::user(user_prompt))
            .with_temperature(temperature)
            .with_max_tokens(max_output_tokens);
        self.complete(request).await
    }

    #[instrument(skip_all)]
    async fn extract_facts(&self, claim_text: &str, grounding_text: &str) -> Result<String> {
        let prompt = format!(
            "Find accurate information in the context that directly addresses this claim:\n\n\
CLAIM: {}\n\n\
CONTEXT:\n{}\n\n\
Extract ONLY the specific facts from the context that could replace this claim. \
Be concise and precise. If the context has nothing relevant, reply exactly \"{}\"",
            claim_text,
            truncate_chars(grounding_text, EXTRACTION_GROUNDING_LIMIT),
            NO_FACTS_FOUND,
        );
        let request = CompletionRequest::new()
            .with_system(EXTRACTION_SYSTEM_PROMPT)
            .with_message(ChatMessage::user(prompt))
            .with_temperature(0.0)
            .with_max_tokens(250);
        self.complete(request).await
    }
}

/// The first `max_chars` characters of `text`.
pub(crate) fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
