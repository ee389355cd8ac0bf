//! Docusuite: questions about a contract answered from retrieved excerpts,
//! streamed token by token over server-sent events.

pub mod citations;
pub mod codec;
pub mod commands;
pub mod config;
pub mod consumer;
pub mod conversation;
pub mod error;
pub mod events;
pub mod obligations;
pub mod producer;
pub mod prompts;
pub mod providers;
pub mod server;
pub mod streaming;
pub mod ui;

pub use error::{Error, Result};
