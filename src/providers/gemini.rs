use async_stream::try_stream;
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::time::Duration;

use super::{EmbeddingProvider, GenerationProvider, GenerationRequest, TextStream};
use crate::codec::SseBuffer;
use crate::error::{Error, Result};

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";

/// Gemini client for embeddings and streaming generation
#[derive(Clone)]
pub struct GeminiClient {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    chat_model: String,
    embedding_model: String,
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    embedding: EmbeddingValues,
}

#[derive(Debug, Deserialize)]
struct EmbeddingValues {
    values: Vec<f32>,
}

impl GeminiClient {
    pub fn new(api_key: impl Into<String>) -> Result<Self> {
        // No overall timeout: a generation stream stays open as long as the model writes.
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            client,
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            chat_model: "gemini-1.5-flash".to_string(),
            embedding_model: "text-embedding-004".to_string(),
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_chat_model(mut self, model: impl Into<String>) -> Self {
        self.chat_model = model.into();
        self
    }

    pub fn with_embedding_model(mut self, model: impl Into<String>) -> Self {
        self.embedding_model = model.into();
        self
    }

    fn model_url(&self, model: &str, action: &str) -> String {
        format!("{}/v1beta/models/{}:{}", self.base_url, model, action)
    }

    fn generation_payload(request: &GenerationRequest) -> Value {
        let mut contents: Vec<Value> = request
            .history
            .iter()
            .map(|msg| {
                json!({
                    "role": msg.role.gemini_role(),
                    "parts": [{ "text": msg.content }]
                })
            })
            .collect();
        contents.push(json!({
            "role": "user",
            "parts": [{ "text": request.prompt }]
        }));

        let mut payload = json!({ "contents": contents });

        if let Some(instruction) = &request.system_instruction {
            payload["systemInstruction"] = json!({
                "parts": [{ "text": instruction }]
            });
        }

        let mut generation_config = serde_json::Map::new();
        if let Some(temperature) = request.temperature {
            generation_config.insert("temperature".to_string(), json!(temperature));
        }
        if let Some(max_tokens) = request.max_output_tokens {
            generation_config.insert("maxOutputTokens".to_string(), json!(max_tokens));
        }
        if !generation_config.is_empty() {
            payload["generationConfig"] = Value::Object(generation_config);
        }

        payload
    }
}

#[async_trait]
impl EmbeddingProvider for GeminiClient {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let url = self.model_url(&self.embedding_model, "embedContent");
        let payload = json!({
            "model": format!("models/{}", self.embedding_model),
            "content": { "parts": [{ "text": text }] }
        });

        let response = self
            .client
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .json(&payload)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(Error::Embedding(format!("Gemini API error ({}): {}", status, error_text)));
        }

        let body: EmbedResponse = response.json().await?;
        tracing::debug!(dimensions = body.embedding.values.len(), "Received query embedding");
        Ok(body.embedding.values)
    }
}

#[async_trait]
impl GenerationProvider for GeminiClient {
    async fn stream_generate(&self, request: GenerationRequest) -> Result<TextStream> {
        let url = format!("{}?alt=sse", self.model_url(&self.chat_model, "streamGenerateContent"));
        let payload = Self::generation_payload(&request);

        let response = self
            .client
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .json(&payload)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(Error::Generation(format!("Gemini API error ({}): {}", status, error_text)));
        }

        Ok(Box::pin(fragments(response)))
    }
}

/// Relay the text of each SSE chunk of a `streamGenerateContent` response
fn fragments(response: reqwest::Response) -> impl Stream<Item = Result<String>> {
    try_stream! {
        let mut body = Box::pin(response.bytes_stream());
        let mut records = SseBuffer::new();

        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            for payload in records.push(&chunk) {
                if let Some(text) = candidate_text(&payload)? {
                    yield text;
                }
            }
        }

        // Flush any remaining record (without blank line)
        if let Some(payload) = records.finish() {
            if let Some(text) = candidate_text(&payload)? {
                yield text;
            }
        }
    }
}

/// Text of the first candidate in one streamed chunk
fn candidate_text(payload: &[u8]) -> Result<Option<String>> {
    let chunk: Value = match serde_json::from_slice(payload) {
        Ok(chunk) => chunk,
        Err(e) => {
            tracing::warn!(error = %e, "Skipping unparseable Gemini stream chunk");
            return Ok(None);
        }
    };

    if let Some(error) = chunk.get("error") {
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| error.to_string());
        return Err(Error::Generation(message));
    }

    let text: String = chunk
        .pointer("/candidates/0/content/parts")
        .and_then(Value::as_array)
        .map(|parts| {
            parts
                .iter()
                .filter_map(|part| part.get("text").and_then(Value::as_str))
                .collect()
        })
        .unwrap_or_default();

    Ok((!text.is_empty()).then_some(text))
}
