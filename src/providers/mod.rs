//! Boundaries to the external embedding, similarity-search and generation
//! services. Handles are created once at startup and injected where needed.

pub mod gemini;
#[cfg(any(test, feature = "test-utils"))]
pub mod scripted;
pub mod supabase;

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::events::ChatMessage;

pub use gemini::GeminiClient;
pub use supabase::SupabaseSearch;

/// Lazy, finite, non-restartable sequence of generated text fragments
pub type TextStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// A chunk returned by the similarity search
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievedDocument {
    pub text: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// Request to the generation provider
#[derive(Debug, Clone, Default)]
pub struct GenerationRequest {
    /// Prior turns, oldest first
    pub history: Vec<ChatMessage>,
    /// New user turn
    pub prompt: String,
    pub system_instruction: Option<String>,
    pub temperature: Option<f32>,
    pub max_output_tokens: Option<u32>,
}

impl GenerationRequest {
    pub fn new(history: Vec<ChatMessage>, prompt: impl Into<String>) -> Self {
        Self {
            history,
            prompt: prompt.into(),
            ..Default::default()
        }
    }

    pub fn with_system_instruction(mut self, instruction: impl Into<String>) -> Self {
        self.system_instruction = Some(instruction.into());
        self
    }

    pub fn with_max_output_tokens(mut self, tokens: u32) -> Self {
        self.max_output_tokens = Some(tokens);
        self
    }
}

#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Embed `text` into a fixed-length vector
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

#[async_trait]
pub trait SearchProvider: Send + Sync {
    /// Nearest chunks to `vector` within `scope_id`, best first
    async fn search(
        &self,
        scope_id: &str,
        vector: &[f32],
        top_k: usize,
        threshold: f32,
    ) -> Result<Vec<RetrievedDocument>>;
}

#[async_trait]
pub trait GenerationProvider: Send + Sync {
    /// Start a generation and return its fragments as they arrive
    async fn stream_generate(&self, request: GenerationRequest) -> Result<TextStream>;
}
