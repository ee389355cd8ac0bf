use std::str::FromStr;

use strum::{AsRefStr, EnumIter, EnumString, IntoEnumIterator, IntoStaticStr};

use crate::obligations::Aspect;

/// Commands that can be invoked by starting a line with a leading slash.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, EnumString, EnumIter, AsRefStr, IntoStaticStr,
)]
#[strum(serialize_all = "kebab-case")]
pub enum SlashCommand {
    /// Stop the answer being streamed
    Cancel,
    /// Show the citations gathered so far
    Sources,
    /// Print the conversation so far
    History,
    /// List the obligations extracted from the contract
    Obligations,
    /// Ask about one obligation, e.g. `/explain 2 penalties`
    Explain,
    /// Show help
    Help,
    /// Exit the chat
    Bye,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedCommand {
    pub command: SlashCommand,
    pub argument: Option<String>,
}

impl ParsedCommand {
    pub fn argument(&self) -> Option<&str> {
        self.argument.as_deref()
    }

    /// Message index given as argument, e.g. `/sources 3`
    pub fn index_argument(&self) -> Option<usize> {
        self.argument()?.trim().parse().ok()
    }

    /// Number and aspect of `/explain <n> [aspect]`; `None` when malformed
    pub fn explain_arguments(&self) -> Option<(usize, Aspect)> {
        let mut parts = self.argument()?.split_whitespace();
        let number = parts.next()?.parse().ok()?;
        let aspect = match parts.next() {
            Some(name) => Aspect::from_str(name).ok()?,
            None => Aspect::default(),
        };
        match parts.next() {
            Some(_) => None,
            None => Some((number, aspect)),
        }
    }
}

impl SlashCommand {
    /// User-visible description shown in help.
    pub fn description(self) -> &'static str {
        match self {
            SlashCommand::Cancel => "stop the answer being streamed",
            SlashCommand::Sources => "show cited excerpts (optionally for one message index)",
            SlashCommand::History => "print the conversation so far",
            SlashCommand::Obligations => "list the obligations found in the contract",
            SlashCommand::Explain => "ask about obligation <n>, optionally one aspect of it",
            SlashCommand::Help => "show available commands",
            SlashCommand::Bye => "exit the chat",
        }
    }

    /// Command string without the leading '/'.
    pub fn command(self) -> &'static str {
        self.into()
    }
}

/// Parse a slash command from user input
pub fn parse_slash_command(input: &str) -> Option<ParsedCommand> {
    let rest = input.trim().strip_prefix('/')?;

    let mut parts = rest.split_whitespace();
    let head = parts.next()?;
    let args: Vec<&str> = parts.collect();

    let command = SlashCommand::from_str(&head.to_lowercase())
        .ok()
        .or_else(|| match head.to_lowercase().as_str() {
            "q" | "quit" | "exit" => Some(SlashCommand::Bye),
            "c" | "stop" => Some(SlashCommand::Cancel),
            "s" | "src" => Some(SlashCommand::Sources),
            "o" | "obl" => Some(SlashCommand::Obligations),
            "e" => Some(SlashCommand::Explain),
            "h" | "?" => Some(SlashCommand::Help),
            _ => None,
        })?;

    let argument = if args.is_empty() {
        None
    } else {
        Some(args.join(" "))
    };

    Some(ParsedCommand { command, argument })
}

/// Get help text for all available commands
pub fn get_help_text() -> String {
    let mut help = String::from("Available commands:\n\n");
    for command in SlashCommand::iter() {
        help.push_str(&format!("/{} - {}\n", command.command(), command.description()));
    }

    help.push_str(&format!(
        "\nAspects for /explain: {}",
        Aspect::iter().map(Aspect::label).collect::<Vec<_>>().join(", ")
    ));
    help.push_str("\nAliases: /q for /bye, /c for /cancel, /s for /sources, /o for /obligations, /e for /explain, /h for /help");
    help.push_str("\nTyping a new question while an answer streams replaces it. Ctrl-C cancels.");

    help
}
