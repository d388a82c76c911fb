//! LLM client abstraction.
//!
//! The verification loop talks to models only through [`LLMClient`]; the
//! evaluator and generator adapters in [`crate::hallucination`] wrap any
//! implementation of it.
//!
//! ## Example
//!
//! ```rust,ignore
//! use faithloop::llm::{ChatMessage, ClientConfig, CompletionRequest, LLMClient, OpenAIClient};
//!
//! let client = OpenAIClient::new(ClientConfig::new("your-api-key").with_default_model("gpt-4o"))?;
//!
//! let request = CompletionRequest::new()
//!     .with_system("You are a fact-checker.")
//!     .with_message(ChatMessage::user("Hello"))
//!     .with_temperature(0.1);
//!
//! let response = client.complete(request).await?;
//! ```

mod client;
mod types;

pub use client::{ClientConfig, LLMClient, OpenAIClient};
pub use types::{
    ChatMessage, ChatRole, CompletionRequest, CompletionResponse, StopReason, TokenUsage,
};
