//! Deterministic providers driven by fixed scripts, for tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_stream::try_stream;
use async_trait::async_trait;
use futures::Stream;
use tokio::sync::Mutex;

use super::{
    EmbeddingProvider, GenerationProvider, GenerationRequest, RetrievedDocument, SearchProvider,
    TextStream,
};
use crate::error::{Error, Result};

/// One step of a scripted generation
#[derive(Debug, Clone)]
pub enum ScriptStep {
    /// Emit a text fragment
    Text(String),
    /// Fail the stream mid-flight
    Error(String),
    /// Never produce anything again
    Stall,
}

/// Generation provider replaying a fixed list of steps
#[derive(Debug, Clone, Default)]
pub struct ScriptedGeneration {
    steps: Vec<ScriptStep>,
    reject: Option<String>,
    calls: Arc<AtomicUsize>,
    last_request: Arc<Mutex<Option<GenerationRequest>>>,
}

impl ScriptedGeneration {
    pub fn new(steps: Vec<ScriptStep>) -> Self {
        Self {
            steps,
            ..Default::default()
        }
    }

    /// Script emitting each fragment in order
    pub fn fragments<I, S>(fragments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(fragments.into_iter().map(|f| ScriptStep::Text(f.into())).collect())
    }

    /// Provider refusing every request before any fragment
    pub fn rejecting(message: impl Into<String>) -> Self {
        Self {
            reject: Some(message.into()),
            ..Default::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub async fn last_request(&self) -> Option<GenerationRequest> {
        self.last_request.lock().await.clone()
    }
}

fn replay(steps: Vec<ScriptStep>) -> impl Stream<Item = Result<String>> {
    try_stream! {
        for step in steps {
            match step {
                ScriptStep::Text(text) => {
                    yield text;
                }
                ScriptStep::Error(message) => {
                    Err::<(), Error>(Error::Generation(message))?;
                }
                ScriptStep::Stall => futures::future::pending::<()>().await,
            }
        }
    }
}

#[async_trait]
impl GenerationProvider for ScriptedGeneration {
    async fn stream_generate(&self, request: GenerationRequest) -> Result<TextStream> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_request.lock().await = Some(request);

        if let Some(message) = &self.reject {
            return Err(Error::Generation(message.clone()));
        }

        Ok(Box::pin(replay(self.steps.clone())))
    }
}

/// Embedding provider returning a constant vector
#[derive(Debug, Clone)]
pub struct StaticEmbedding {
    dimensions: usize,
    fail: Option<String>,
    calls: Arc<AtomicUsize>,
}

impl StaticEmbedding {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions,
            fail: None,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            fail: Some(message.into()),
            ..Self::new(0)
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EmbeddingProvider for StaticEmbedding {
    async fn embed(&self, _text: &str) -> Result<Vec<f32>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.fail {
            Some(message) => Err(Error::Embedding(message.clone())),
            None => Ok(vec![0.1; self.dimensions]),
        }
    }
}

/// Search provider returning the same documents for every query
#[derive(Debug, Clone, Default)]
pub struct StaticSearch {
    documents: Vec<RetrievedDocument>,
    fail: Option<String>,
    calls: Arc<AtomicUsize>,
    last_scope: Arc<Mutex<Option<String>>>,
}

impl StaticSearch {
    pub fn new(documents: Vec<RetrievedDocument>) -> Self {
        Self {
            documents,
            ..Default::default()
        }
    }

    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            fail: Some(message.into()),
            ..Default::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub async fn last_scope(&self) -> Option<String> {
        self.last_scope.lock().await.clone()
    }
}

#[async_trait]
impl SearchProvider for StaticSearch {
    async fn search(
        &self,
        scope_id: &str,
        _vector: &[f32],
        top_k: usize,
        _threshold: f32,
    ) -> Result<Vec<RetrievedDocument>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_scope.lock().await = Some(scope_id.to_string());

        if let Some(message) = &self.fail {
            return Err(Error::Search(message.clone()));
        }
        Ok(self.documents.iter().take(top_k).cloned().collect())
    }
}
