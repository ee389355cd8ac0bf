//! Terminal chat loop and its slash commands

pub mod commands;
pub mod manager;

pub use commands::{ParsedCommand, SlashCommand, get_help_text, parse_slash_command};
pub use manager::{ConversationAction, ConversationManager};
