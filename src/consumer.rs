//! Client side of an exchange.
//!
//! Network I/O for each exchange runs on its own task and reports through a
//! channel; all conversation state is mutated by the owner through
//! [`StreamConsumer::next_event`], [`StreamConsumer::submit`] and
//! [`StreamConsumer::cancel`].

use async_stream::try_stream;
use futures::{Stream, StreamExt};
use reqwest::header::HeaderMap;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::citations::{self, MESSAGE_INDEX_HEADER, SOURCES_HEADER};
use crate::codec::{FrameDecoder, StreamFrame};
use crate::conversation::ConversationState;
use crate::error::{Error, Result};
use crate::events::{ChatEvent, ChatRequest, ContractRequest, ObligationsResponse, ResponseMeta};
use crate::obligations::Obligation;

const EVENT_BUFFER: usize = 64;

/// Outcome of a submission attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submission {
    Accepted,
    /// Blank text, or an exchange already in flight
    Rejected,
}

/// What the transport task reports back
#[derive(Debug)]
enum TransportEvent {
    Head(ResponseMeta),
    Frame(StreamFrame),
    Failed(String),
}

/// The single in-flight exchange
struct Exchange {
    token: CancellationToken,
    events: mpsc::Receiver<TransportEvent>,
}

impl Drop for Exchange {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

pub struct StreamConsumer {
    client: reqwest::Client,
    chat_url: String,
    chat_id: String,
    state: ConversationState,
    exchange: Option<Exchange>,
}

impl StreamConsumer {
    /// Consumer for the document `chat_id` served at `endpoint`
    pub fn new(endpoint: &str, chat_id: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            client,
            chat_url: format!("{}/api/chat", endpoint.trim_end_matches('/')),
            chat_id: chat_id.into(),
            state: ConversationState::new(),
            exchange: None,
        })
    }

    pub fn state(&self) -> &ConversationState {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut ConversationState {
        &mut self.state
    }

    pub fn chat_id(&self) -> &str {
        &self.chat_id
    }

    pub fn is_busy(&self) -> bool {
        self.exchange.is_some()
    }

    /// Start a new exchange for `text`
    pub fn submit(&mut self, text: &str) -> Submission {
        if self.is_busy() {
            tracing::debug!("Submission rejected: exchange in flight");
            return Submission::Rejected;
        }
        if self.state.begin_exchange(text).is_none() {
            return Submission::Rejected;
        }

        let request = ChatRequest {
            messages: self.state.request_history(),
            chat_id: Some(self.chat_id.clone()),
        };

        let token = CancellationToken::new();
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        tokio::spawn(run_exchange(
            self.client.clone(),
            self.chat_url.clone(),
            request,
            tx,
            token.clone(),
        ));

        self.exchange = Some(Exchange { token, events: rx });
        Submission::Accepted
    }

    /// Cancel whatever is in flight, then submit `text`
    pub fn supersede(&mut self, text: &str) -> Submission {
        if text.trim().is_empty() {
            return Submission::Rejected;
        }
        self.cancel();
        self.submit(text)
    }

    /// Abort the in-flight exchange.
    ///
    /// The open message stays interrupted and nothing is reported as a
    /// failure. Returns `None` when nothing was in flight.
    pub fn cancel(&mut self) -> Option<ChatEvent> {
        // Dropping the exchange cancels its token and the receiver
        let _exchange = self.exchange.take()?;
        self.state.cancel_open();
        tracing::info!("Exchange cancelled");
        Some(ChatEvent::Cancelled)
    }

    /// Wait for the next event of the in-flight exchange and apply it.
    ///
    /// Returns `None` when nothing is in flight.
    pub async fn next_event(&mut self) -> Option<ChatEvent> {
        loop {
            let exchange = self.exchange.as_mut()?;
            let event = match exchange.events.recv().await {
                Some(TransportEvent::Head(meta)) => Some(self.on_response(meta)),
                Some(TransportEvent::Frame(frame)) => self.on_frame(frame),
                Some(TransportEvent::Failed(message)) => Some(self.on_failure(message)),
                // Task ended without reporting; treat like a truncated body
                None => Some(self.on_failure(Error::Truncated.to_string())),
            };
            if let Some(event) = event {
                return Some(event);
            }
        }
    }

    /// Apply one decoded frame to the open assistant message.
    ///
    /// A terminal frame closes the message and yields `Finished` exactly
    /// once; frames arriving with no open message are ignored.
    pub fn on_frame(&mut self, frame: StreamFrame) -> Option<ChatEvent> {
        if frame.is_terminal() {
            if !frame.text.is_empty() {
                self.state.append_delta(&frame.text);
            }
            if !self.state.close_open() {
                return None;
            }
            self.exchange = None;
            return Some(ChatEvent::Finished);
        }

        if !self.state.append_delta(&frame.text) {
            tracing::debug!("Ignoring frame with no open message");
            return None;
        }
        self.state.mark_streaming();
        Some(ChatEvent::Delta(frame.text))
    }

    fn on_response(&mut self, meta: ResponseMeta) -> ChatEvent {
        self.state.mark_streaming();
        if let Some(ordinal) = meta.ordinal.or_else(|| self.state.open_index()) {
            self.state.attach_citations(ordinal, meta.citations.clone());
        }
        ChatEvent::ResponseReceived(meta)
    }

    fn on_failure(&mut self, message: String) -> ChatEvent {
        self.exchange = None;
        self.state.fail_open(message.clone());
        tracing::warn!(error = %message, "Exchange failed");
        ChatEvent::Failed(message)
    }
}

async fn run_exchange(
    client: reqwest::Client,
    url: String,
    request: ChatRequest,
    tx: mpsc::Sender<TransportEvent>,
    token: CancellationToken,
) {
    tokio::select! {
        _ = token.cancelled() => {
            tracing::debug!("Transport stopped by cancellation");
        }
        result = transport(&client, &url, &request, &tx) => {
            if let Err(e) = result {
                let _ = tx.send(TransportEvent::Failed(e.to_string())).await;
            }
        }
    }
}

async fn transport(
    client: &reqwest::Client,
    url: &str,
    request: &ChatRequest,
    tx: &mpsc::Sender<TransportEvent>,
) -> Result<()> {
    let response = post_json(client, url, request).await?;
    if tx
        .send(TransportEvent::Head(response_meta(response.headers())))
        .await
        .is_err()
    {
        return Ok(());
    }

    let mut body = Box::pin(frames(response));
    while let Some(frame) = body.next().await {
        let frame = frame?;
        let done = frame.is_terminal();
        if tx.send(TransportEvent::Frame(frame)).await.is_err() || done {
            return Ok(());
        }
    }
    Err(Error::Truncated)
}

/// POST `body` and return the response once its status is known to be a
/// success. Error statuses are turned into [`Error::Remote`] with the message
/// from the `{"error": ...}` body when there is one.
pub async fn post_json(
    client: &reqwest::Client,
    url: &str,
    body: &impl Serialize,
) -> Result<reqwest::Response> {
    let response = client.post(url).json(body).send().await?;
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let text = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<serde_json::Value>(&text)
        .ok()
        .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(str::to_string))
        .unwrap_or_else(|| {
            if text.is_empty() {
                status.canonical_reason().unwrap_or("request failed").to_string()
            } else {
                text
            }
        });

    Err(Error::Remote {
        status: status.as_u16(),
        message,
    })
}

/// Ask the server at `endpoint` for the obligations in `text`
pub async fn fetch_obligations(
    client: &reqwest::Client,
    endpoint: &str,
    text: &str,
) -> Result<Vec<Obligation>> {
    let url = format!("{}/api/obligations", endpoint.trim_end_matches('/'));
    let request = ContractRequest {
        text: text.to_string(),
    };
    let response: ObligationsResponse = post_json(client, &url, &request).await?.json().await?;
    Ok(response.obligations)
}

/// Read the ordinal and citations from a response head.
/// A malformed citation header is logged and treated as empty.
pub fn response_meta(headers: &HeaderMap) -> ResponseMeta {
    let ordinal = headers
        .get(MESSAGE_INDEX_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok());

    let citations = match headers.get(SOURCES_HEADER).map(|v| v.to_str()) {
        None => Vec::new(),
        Some(Ok(value)) => citations::decode_header(value).unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Ignoring malformed citation header");
            Vec::new()
        }),
        Some(Err(e)) => {
            tracing::warn!(error = %e, "Ignoring non-text citation header");
            Vec::new()
        }
    };

    ResponseMeta { ordinal, citations }
}

/// Decode the frames of a streamed response body as they arrive
pub fn frames(response: reqwest::Response) -> impl Stream<Item = Result<StreamFrame>> {
    try_stream! {
        let mut body = Box::pin(response.bytes_stream());
        let mut decoder = FrameDecoder::new();

        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            for frame in decoder.push(&chunk) {
                yield frame;
            }
        }
        for frame in decoder.finish() {
            yield frame;
        }

        if decoder.dropped() > 0 {
            tracing::warn!(dropped = decoder.dropped(), "Skipped malformed records");
        }
    }
}
