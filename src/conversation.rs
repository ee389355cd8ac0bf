//! Client-side conversation log and exchange phase machine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::Display;
use uuid::Uuid;

use crate::citations::{Citation, CitationSet};
use crate::events::{ChatMessage, Role};

/// Lifecycle of a single message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum MessageStatus {
    /// Receiving text
    Open,
    /// Terminal frame arrived
    Closed,
    /// Exchange was cancelled or failed before completing
    Interrupted,
}

/// Where the conversation is in its current exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum Phase {
    Idle,
    /// Request sent, response head not yet received
    Submitting,
    Streaming,
    /// Last exchange failed; a new submission is allowed
    Error,
}

/// A single message in the conversation log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub role: Role,
    pub content: String,
    pub status: MessageStatus,
    pub created_at: DateTime<Utc>,
}

impl Message {
    fn new(role: Role, content: String, status: MessageStatus) -> Self {
        Self {
            id: Uuid::new_v4(),
            role,
            content,
            status,
            created_at: Utc::now(),
        }
    }

    pub fn is_open(&self) -> bool {
        self.status == MessageStatus::Open
    }

    pub fn to_chat_message(&self) -> ChatMessage {
        ChatMessage {
            role: self.role,
            content: self.content.clone(),
        }
    }
}

/// Ordered, append-only log of messages with per-message citations.
///
/// Only the content of the newest assistant message is ever mutated, and only
/// while it is open.
#[derive(Debug, Clone)]
pub struct ConversationState {
    messages: Vec<Message>,
    citations: CitationSet,
    phase: Phase,
    input: String,
    last_error: Option<String>,
}

impl Default for ConversationState {
    fn default() -> Self {
        Self::new()
    }
}

impl ConversationState {
    pub fn new() -> Self {
        Self {
            messages: Vec::new(),
            citations: CitationSet::new(),
            phase: Phase::Idle,
            input: String::new(),
            last_error: None,
        }
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn citations(&self) -> &CitationSet {
        &self.citations
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Whether an exchange is in flight
    pub fn is_busy(&self) -> bool {
        matches!(self.phase, Phase::Submitting | Phase::Streaming)
    }

    pub fn input(&self) -> &str {
        &self.input
    }

    pub fn set_input(&mut self, text: impl Into<String>) {
        self.input = text.into();
    }

    /// The open assistant message, if any
    pub fn open_message(&self) -> Option<&Message> {
        self.messages.last().filter(|msg| msg.is_open())
    }

    /// Index of the open assistant message
    pub fn open_index(&self) -> Option<usize> {
        self.open_message().map(|_| self.messages.len() - 1)
    }

    /// Append the user turn and an empty assistant placeholder.
    ///
    /// Returns the placeholder's index, or `None` when `text` is blank or an
    /// exchange is already in flight.
    pub fn begin_exchange(&mut self, text: &str) -> Option<usize> {
        if text.trim().is_empty() || self.is_busy() {
            return None;
        }

        self.messages
            .push(Message::new(Role::User, text.to_string(), MessageStatus::Closed));
        self.messages
            .push(Message::new(Role::Assistant, String::new(), MessageStatus::Open));
        self.input.clear();
        self.last_error = None;
        self.phase = Phase::Submitting;

        Some(self.messages.len() - 1)
    }

    /// Messages to send with the current exchange, without the placeholder
    pub fn request_history(&self) -> Vec<ChatMessage> {
        let end = self.open_index().unwrap_or(self.messages.len());
        self.messages[..end]
            .iter()
            .map(Message::to_chat_message)
            .collect()
    }

    /// Response head arrived
    pub fn mark_streaming(&mut self) {
        if self.phase == Phase::Submitting {
            self.phase = Phase::Streaming;
        }
    }

    /// Merge citations for the message at `ordinal`
    pub fn attach_citations(&mut self, ordinal: usize, citations: Vec<Citation>) -> usize {
        self.citations.merge(ordinal, citations)
    }

    /// Append text to the open assistant message. Returns false if no message
    /// is open.
    pub fn append_delta(&mut self, text: &str) -> bool {
        match self.messages.last_mut() {
            Some(msg) if msg.is_open() => {
                msg.content.push_str(text);
                true
            }
            _ => false,
        }
    }

    /// Close the open assistant message. Returns false if none was open.
    pub fn close_open(&mut self) -> bool {
        if !self.set_open_status(MessageStatus::Closed) {
            return false;
        }
        self.phase = Phase::Idle;
        true
    }

    /// Leave the open message unfinished after a cancellation
    pub fn cancel_open(&mut self) -> bool {
        let interrupted = self.set_open_status(MessageStatus::Interrupted);
        self.phase = Phase::Idle;
        interrupted
    }

    /// Leave the open message unfinished after a failure
    pub fn fail_open(&mut self, message: impl Into<String>) -> bool {
        let interrupted = self.set_open_status(MessageStatus::Interrupted);
        self.phase = Phase::Error;
        self.last_error = Some(message.into());
        interrupted
    }

    fn set_open_status(&mut self, status: MessageStatus) -> bool {
        match self.messages.last_mut() {
            Some(msg) if msg.is_open() => {
                msg.status = status;
                true
            }
            _ => false,
        }
    }
}
