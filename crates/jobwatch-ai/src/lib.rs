//! Relevance scoring and embedding contracts, backed by an OpenAI-compatible API.

use async_trait::async_trait;
use thiserror::Error;

mod openai;
mod text;

pub use openai::{OpenAiClient, OpenAiEmbedder, OpenAiScorer, DEFAULT_SCORING_PROMPT, OPENAI_API_URL};
pub use text::{embedding_text, scoring_input, EMBEDDING_TEXT_LIMIT};

pub const CRATE_NAME: &str = "jobwatch-ai";

#[derive(Debug, Error)]
pub enum AiError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("API error ({status}): {body}")]
    Api { status: u16, body: String },
    #[error("invalid API key header: {0}")]
    Header(#[from] reqwest::header::InvalidHeaderValue),
    #[error("response contained no {0}")]
    Empty(&'static str),
}

/// Classifies a listing. Returns the raw model reply; callers own the
/// validation of that reply into a `RelevanceScore`.
#[async_trait]
pub trait RelevanceScorer: Send + Sync {
    async fn score(&self, input: &str) -> Result<String, AiError>;
}

#[async_trait]
pub trait Embedder: Send + Sync {
    /// Length every returned vector is expected to have.
    fn dimensions(&self) -> usize;

    async fn embed(&self, text: &str) -> Result<Vec<f32>, AiError>;
}
