use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display};

use crate::citations::Citation;
use crate::obligations::Obligation;

/// Role of a message in a conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, AsRefStr, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Role {
    User,
    /// Generation APIs call this role `model`
    #[serde(alias = "model")]
    Assistant,
}

impl Role {
    /// Role name expected by the Gemini `contents` array
    pub fn gemini_role(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "model",
        }
    }
}

/// Message as carried over the wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Body of `POST /api/chat`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    /// Document the similarity search is scoped to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat_id: Option<String>,
}

/// Body of `POST /api/summary` and `POST /api/obligations`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContractRequest {
    pub text: String,
}

/// Body returned by `POST /api/obligations`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ObligationsResponse {
    pub obligations: Vec<Obligation>,
}

/// Metadata delivered with the response head, before any frame
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResponseMeta {
    /// Position of the assistant message this exchange fills
    pub ordinal: Option<usize>,
    pub citations: Vec<Citation>,
}

/// Events surfaced to the owner of a conversation while an exchange runs
#[derive(Debug, Clone, PartialEq)]
pub enum ChatEvent {
    /// Response head arrived; fires once, before any text
    ResponseReceived(ResponseMeta),
    /// Text appended to the open assistant message
    Delta(String),
    /// Terminal frame arrived and the assistant message was closed
    Finished,
    /// Exchange failed; the assistant message stays unfinished
    Failed(String),
    /// Exchange was cancelled by the caller; never reported as a failure
    Cancelled,
}

impl ChatEvent {
    /// Whether the exchange is over after this event
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ChatEvent::Finished | ChatEvent::Failed(_) | ChatEvent::Cancelled
        )
    }
}
