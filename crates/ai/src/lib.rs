//! AI summarization client: provider-pluggable text completion behind a
//! circuit breaker with retry, plus prompt construction and response parsing.

pub mod client;
pub mod error;
pub mod prompt;

pub use client::{AiClient, AiClientConfig, AiProvider, Completion};
pub use error::AiError;
pub use prompt::{
    IncidentBundle, IncidentSummary, SYSTEM_PROMPT, build_batch_prompt, build_single_prompt,
    fallback_summary, parse_batch_response, parse_single_response,
};
