//! Server side of an exchange: retrieval, generation and frame relay.

use std::pin::Pin;
use std::sync::Arc;

use async_stream::try_stream;
use futures::{Stream, StreamExt, TryStreamExt};

use crate::citations::Citation;
use crate::codec::StreamFrame;
use crate::config::RetrievalConfig;
use crate::error::{Error, Result};
use crate::events::{ChatMessage, ChatRequest};
use crate::obligations::{self, Obligation};
use crate::prompts;
use crate::providers::{
    EmbeddingProvider, GenerationProvider, GenerationRequest, RetrievedDocument, SearchProvider,
    TextStream,
};

/// Frames of one answer, ending with the terminal frame unless it fails
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<StreamFrame>> + Send>>;

/// An exchange whose preconditions and upstream calls have succeeded.
/// Nothing has been sent to the client yet.
pub struct PreparedStream {
    /// Position of the answer in the client's message log
    pub ordinal: Option<usize>,
    pub citations: Vec<Citation>,
    pub frames: FrameStream,
}

impl std::fmt::Debug for PreparedStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PreparedStream")
            .field("ordinal", &self.ordinal)
            .field("citations", &self.citations)
            .finish_non_exhaustive()
    }
}

#[derive(Clone)]
pub struct StreamProducer {
    embedder: Arc<dyn EmbeddingProvider>,
    search: Arc<dyn SearchProvider>,
    generator: Arc<dyn GenerationProvider>,
    summarizer: Arc<dyn GenerationProvider>,
    retrieval: RetrievalConfig,
    temperature: Option<f32>,
    max_output_tokens: Option<u32>,
}

impl StreamProducer {
    pub fn new(
        embedder: Arc<dyn EmbeddingProvider>,
        search: Arc<dyn SearchProvider>,
        generator: Arc<dyn GenerationProvider>,
    ) -> Self {
        Self {
            embedder,
            search,
            summarizer: generator.clone(),
            generator,
            retrieval: RetrievalConfig::default(),
            temperature: None,
            max_output_tokens: None,
        }
    }

    pub fn with_retrieval(mut self, retrieval: RetrievalConfig) -> Self {
        self.retrieval = retrieval;
        self
    }

    /// Use a different generator for contract summaries
    pub fn with_summarizer(mut self, summarizer: Arc<dyn GenerationProvider>) -> Self {
        self.summarizer = summarizer;
        self
    }

    pub fn with_generation_options(
        mut self,
        temperature: Option<f32>,
        max_output_tokens: Option<u32>,
    ) -> Self {
        self.temperature = temperature;
        self.max_output_tokens = max_output_tokens;
        self
    }

    /// Validate a chat request, retrieve its context and open the generation.
    ///
    /// Every failure here happens before the response starts, so callers can
    /// still report it as a plain error response.
    pub async fn prepare(&self, request: ChatRequest) -> Result<PreparedStream> {
        let ChatRequest {
            mut messages,
            chat_id,
        } = request;

        let chat_id = chat_id
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| Error::validation("chatId is required."))?;
        let query = messages
            .pop()
            .ok_or_else(|| Error::validation("No messages provided."))?;
        if query.content.trim().is_empty() {
            return Err(Error::validation("The last message has no content."));
        }

        // Index of the answer in the client log
        let ordinal = messages.len() + 1;
        // Turns cut off before any text carry nothing the model can use
        messages.retain(|msg| !msg.content.trim().is_empty());

        let documents = self.retrieve(&chat_id, &query.content).await?;
        let citations = documents
            .iter()
            .map(|doc| Citation::from_document(doc, self.retrieval.excerpt_chars))
            .collect();

        let prompt = prompts::context_prompt(&documents, &query.content);
        let fragments = self
            .generator
            .stream_generate(self.generation_request(messages, prompt))
            .await?;

        tracing::info!(chat_id = %chat_id, ordinal, hits = documents.len(), "Answer stream opened");

        Ok(PreparedStream {
            ordinal: Some(ordinal),
            citations,
            frames: Box::pin(relay(fragments)),
        })
    }

    /// Open a plain-language summary stream for a contract
    pub async fn prepare_summary(&self, text: &str) -> Result<PreparedStream> {
        if text.trim().is_empty() {
            return Err(Error::validation("No contract text provided."));
        }

        let request = self
            .generation_request(Vec::new(), prompts::summary_prompt(text))
            .with_system_instruction(prompts::summary_instruction());
        let fragments = self.summarizer.stream_generate(request).await?;

        tracing::info!(chars = text.chars().count(), "Summary stream opened");

        Ok(PreparedStream {
            ordinal: None,
            citations: Vec::new(),
            frames: Box::pin(relay(fragments)),
        })
    }

    /// Ask the model for the contract's obligations and parse its answer.
    ///
    /// The whole answer is needed before parsing, so nothing is streamed.
    pub async fn extract_obligations(&self, text: &str) -> Result<Vec<Obligation>> {
        if text.trim().is_empty() {
            return Err(Error::validation("No contract text provided."));
        }

        let request = self.generation_request(Vec::new(), prompts::obligations_prompt(text));
        let answer: String = self
            .summarizer
            .stream_generate(request)
            .await?
            .try_collect()
            .await?;

        let obligations = obligations::parse_obligations(&answer).inspect_err(|e| {
            tracing::warn!(error = %e, chars = answer.chars().count(), "Unusable obligations answer");
        })?;
        tracing::info!(count = obligations.len(), "Obligations extracted");
        Ok(obligations)
    }

    /// Embed `query` and search the chunks of `scope_id`.
    ///
    /// Fails without searching when the embedding has the wrong length.
    pub async fn retrieve(&self, scope_id: &str, query: &str) -> Result<Vec<RetrievedDocument>> {
        let vector = self.embedder.embed(query).await?;
        if vector.len() != self.retrieval.dimensions {
            return Err(Error::InvalidEmbedding {
                expected: self.retrieval.dimensions,
                actual: vector.len(),
            });
        }

        let documents = self
            .search
            .search(
                scope_id,
                &vector,
                self.retrieval.match_count,
                self.retrieval.similarity_threshold,
            )
            .await?;
        tracing::debug!(scope = scope_id, hits = documents.len(), "Retrieved context");
        Ok(documents)
    }

    fn generation_request(&self, history: Vec<ChatMessage>, prompt: String) -> GenerationRequest {
        let mut request = GenerationRequest::new(history, prompt);
        request.temperature = self.temperature;
        request.max_output_tokens = self.max_output_tokens;
        request
    }
}

/// Wrap generated fragments into frames and append the terminal frame.
/// A fragment error ends the stream with that error and no terminal frame.
fn relay(mut fragments: TextStream) -> impl Stream<Item = Result<StreamFrame>> {
    try_stream! {
        while let Some(fragment) = fragments.next().await {
            let text = fragment?;
            if text.is_empty() {
                continue;
            }
            yield StreamFrame::text(text);
        }
        yield StreamFrame::done();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::Role;
    use crate::providers::scripted::{ScriptStep, ScriptedGeneration, StaticEmbedding, StaticSearch};
    use futures::TryStreamExt;
    use serde_json::json;

    fn documents() -> Vec<RetrievedDocument> {
        vec![
            RetrievedDocument {
                text: "The tenancy starts on 1 March and runs for twelve months.".to_string(),
                metadata: json!({ "loc": { "pageNumber": 1 } }),
            },
            RetrievedDocument {
                text: "Rent is due on the third working day.".to_string(),
                metadata: json!({ "loc": { "pageNumber": 2 } }),
            },
        ]
    }

    fn chat(messages: Vec<ChatMessage>) -> ChatRequest {
        ChatRequest {
            messages,
            chat_id: Some("doc-7".to_string()),
        }
    }

    #[tokio::test]
    async fn test_prepare_streams_frames_then_done() {
        let generator = Arc::new(ScriptedGeneration::fragments(["Hel", "lo"]));
        let search = Arc::new(StaticSearch::new(documents()));
        let producer = StreamProducer::new(
            Arc::new(StaticEmbedding::new(768)),
            search.clone(),
            generator.clone(),
        );

        let prepared = producer
            .prepare(chat(vec![ChatMessage::user("When does it start?")]))
            .await
            .unwrap();
        assert_eq!(prepared.ordinal, Some(1));
        assert_eq!(prepared.citations.len(), 2);
        assert!(prepared.citations[0].excerpt.ends_with("..."));

        let frames: Vec<StreamFrame> = prepared.frames.try_collect().await.unwrap();
        assert_eq!(
            frames,
            vec![StreamFrame::text("Hel"), StreamFrame::text("lo"), StreamFrame::done()]
        );
        assert_eq!(search.last_scope().await.as_deref(), Some("doc-7"));
    }

    #[tokio::test]
    async fn test_prepare_passes_history_and_context_prompt() {
        let generator = Arc::new(ScriptedGeneration::fragments(["ok"]));
        let producer = StreamProducer::new(
            Arc::new(StaticEmbedding::new(768)),
            Arc::new(StaticSearch::new(documents())),
            generator.clone(),
        );

        let prepared = producer
            .prepare(chat(vec![
                ChatMessage::user("Who is the landlord?"),
                ChatMessage::assistant("Ms. Weber."),
                ChatMessage::user("When is rent due?"),
            ]))
            .await
            .unwrap();
        assert_eq!(prepared.ordinal, Some(3));

        let request = generator.last_request().await.unwrap();
        assert_eq!(request.history.len(), 2);
        assert_eq!(request.history[1].role, Role::Assistant);
        assert!(request.prompt.starts_with("Context: The tenancy starts"));
        assert!(request.prompt.contains("Question: When is rent due?"));
    }

    #[tokio::test]
    async fn test_interrupted_empty_turns_are_not_sent() {
        let generator = Arc::new(ScriptedGeneration::fragments(["ok"]));
        let producer = StreamProducer::new(
            Arc::new(StaticEmbedding::new(768)),
            Arc::new(StaticSearch::new(documents())),
            generator.clone(),
        );

        let prepared = producer
            .prepare(chat(vec![
                ChatMessage::user("first"),
                ChatMessage::assistant(""),
                ChatMessage::user("second"),
            ]))
            .await
            .unwrap();
        // The ordinal still counts the empty turn
        assert_eq!(prepared.ordinal, Some(3));

        let request = generator.last_request().await.unwrap();
        assert_eq!(request.history, vec![ChatMessage::user("first")]);
    }

    #[tokio::test]
    async fn test_wrong_embedding_length_never_generates() {
        let generator = Arc::new(ScriptedGeneration::fragments(["never"]));
        let search = Arc::new(StaticSearch::new(documents()));
        let producer = StreamProducer::new(
            Arc::new(StaticEmbedding::new(10)),
            search.clone(),
            generator.clone(),
        );

        let err = producer
            .prepare(chat(vec![ChatMessage::user("Anything?")]))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidEmbedding { expected: 768, actual: 10 }));
        assert_eq!(generator.calls(), 0);
        assert_eq!(search.calls(), 0);
    }

    #[tokio::test]
    async fn test_validation_errors() {
        let generator = Arc::new(ScriptedGeneration::fragments(["x"]));
        let embedder = Arc::new(StaticEmbedding::new(768));
        let producer = StreamProducer::new(
            embedder.clone(),
            Arc::new(StaticSearch::default()),
            generator.clone(),
        );

        let empty = producer.prepare(chat(Vec::new())).await.unwrap_err();
        assert_eq!(empty.to_string(), "No messages provided.");

        let blank = producer
            .prepare(chat(vec![ChatMessage::user("   ")]))
            .await
            .unwrap_err();
        assert_eq!(blank.status_code(), 400);

        let missing_id = producer
            .prepare(ChatRequest {
                messages: vec![ChatMessage::user("q")],
                chat_id: None,
            })
            .await
            .unwrap_err();
        assert_eq!(missing_id.to_string(), "chatId is required.");

        assert_eq!(embedder.calls(), 0);
        assert_eq!(generator.calls(), 0);
    }

    #[tokio::test]
    async fn test_search_failure_is_reported_before_stream() {
        let generator = Arc::new(ScriptedGeneration::fragments(["x"]));
        let producer = StreamProducer::new(
            Arc::new(StaticEmbedding::new(768)),
            Arc::new(StaticSearch::failing("rpc down")),
            generator.clone(),
        );

        let err = producer
            .prepare(chat(vec![ChatMessage::user("q")]))
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 502);
        assert_eq!(generator.calls(), 0);
    }

    #[tokio::test]
    async fn test_embedding_failure_stops_before_search() {
        let search = Arc::new(StaticSearch::new(documents()));
        let generator = Arc::new(ScriptedGeneration::fragments(["x"]));
        let producer = StreamProducer::new(
            Arc::new(StaticEmbedding::failing("model overloaded")),
            search.clone(),
            generator.clone(),
        );

        let err = producer
            .prepare(chat(vec![ChatMessage::user("q")]))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Embedding(_)));
        assert_eq!(err.status_code(), 502);
        assert_eq!(search.calls(), 0);
        assert_eq!(generator.calls(), 0);
    }

    #[tokio::test]
    async fn test_midstream_failure_has_no_terminal_frame() {
        let producer = StreamProducer::new(
            Arc::new(StaticEmbedding::new(768)),
            Arc::new(StaticSearch::new(documents())),
            Arc::new(ScriptedGeneration::new(vec![
                ScriptStep::Text("The rent".into()),
                ScriptStep::Error("connection reset".into()),
            ])),
        );

        let prepared = producer
            .prepare(chat(vec![ChatMessage::user("q")]))
            .await
            .unwrap();
        let items: Vec<Result<StreamFrame>> = prepared.frames.collect().await;
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].as_ref().unwrap(), &StreamFrame::text("The rent"));
        assert!(items[1].is_err());
    }

    #[tokio::test]
    async fn test_summary_uses_instruction_and_summarizer() {
        let chat_generator = Arc::new(ScriptedGeneration::fragments(["chat"]));
        let summarizer = Arc::new(ScriptedGeneration::fragments(["1. ", "Parties"]));
        let producer = StreamProducer::new(
            Arc::new(StaticEmbedding::new(768)),
            Arc::new(StaticSearch::default()),
            chat_generator.clone(),
        )
        .with_summarizer(summarizer.clone());

        let prepared = producer.prepare_summary("This lease is made between...").await.unwrap();
        assert_eq!(prepared.ordinal, None);
        assert!(prepared.citations.is_empty());

        let frames: Vec<StreamFrame> = prepared.frames.try_collect().await.unwrap();
        assert_eq!(frames.last(), Some(&StreamFrame::done()));

        let request = summarizer.last_request().await.unwrap();
        assert!(request.system_instruction.is_some());
        assert!(request.prompt.ends_with("This lease is made between..."));
        assert_eq!(chat_generator.calls(), 0);

        assert!(producer.prepare_summary("  ").await.is_err());
    }

    #[tokio::test]
    async fn test_extract_obligations_from_fenced_answer() {
        let summarizer = Arc::new(ScriptedGeneration::fragments([
            "```json\n[{\"entityName\":\"Tenant\",",
            "\"obligationType\":\"Rent\",\"keyDates\":\"monthly\"}]\n```",
        ]));
        let producer = StreamProducer::new(
            Arc::new(StaticEmbedding::new(768)),
            Arc::new(StaticSearch::default()),
            Arc::new(ScriptedGeneration::default()),
        )
        .with_summarizer(summarizer.clone());

        let obligations = producer.extract_obligations("The tenant pays rent monthly.").await.unwrap();
        assert_eq!(obligations.len(), 1);
        assert_eq!(obligations[0].entity_name, "Tenant");
        assert_eq!(obligations[0].key_dates, "monthly");

        let request = summarizer.last_request().await.unwrap();
        assert!(request.prompt.ends_with("Contract: The tenant pays rent monthly."));
        assert!(request.system_instruction.is_none());
    }

    #[tokio::test]
    async fn test_extract_obligations_without_block_fails() {
        let producer = StreamProducer::new(
            Arc::new(StaticEmbedding::new(768)),
            Arc::new(StaticSearch::default()),
            Arc::new(ScriptedGeneration::fragments(["Sorry, ", "I cannot help with that."])),
        );

        let err = producer.extract_obligations("Some contract").await.unwrap_err();
        assert!(matches!(err, Error::Extraction(_)));
        assert_eq!(err.status_code(), 502);

        let blank = producer.extract_obligations(" ").await.unwrap_err();
        assert_eq!(blank.status_code(), 400);
    }
}
