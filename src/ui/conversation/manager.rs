use std::io::Write;

use anyhow::Result;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

use crate::consumer::{StreamConsumer, Submission};
use crate::conversation::MessageStatus;
use crate::events::{ChatEvent, Role};
use crate::obligations::Obligation;
use crate::streaming::{StreamController, message_line};
use crate::ui::conversation::{ParsedCommand, SlashCommand, get_help_text, parse_slash_command};

/// Actions that can be requested by the conversation manager
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversationAction {
    None,
    Exit,
}

/// Drives a terminal chat: reads lines, submits questions and prints
/// streamed answers as they arrive.
pub struct ConversationManager<W: Write> {
    consumer: StreamConsumer,
    controller: StreamController,
    obligations: Vec<Obligation>,
    out: W,
}

impl<W: Write> ConversationManager<W> {
    pub fn new(consumer: StreamConsumer, out: W) -> Self {
        Self {
            consumer,
            controller: StreamController::new(),
            obligations: Vec::new(),
            out,
        }
    }

    /// Obligations `/obligations` lists and `/explain` asks about
    pub fn with_obligations(mut self, obligations: Vec<Obligation>) -> Self {
        self.obligations = obligations;
        self
    }

    pub fn consumer(&self) -> &StreamConsumer {
        &self.consumer
    }

    pub fn output(&self) -> &W {
        &self.out
    }

    /// Run until `/bye`, end of input, or Ctrl-C while idle
    pub async fn run<R>(&mut self, input: R) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
    {
        writeln!(
            self.out,
            "Chatting about document {}. Type /help for commands.",
            self.consumer.chat_id()
        )?;
        let mut lines = input.lines();

        loop {
            tokio::select! {
                line = lines.next_line() => {
                    let Some(line) = line? else { break };
                    if self.handle_input(line)? == ConversationAction::Exit {
                        break;
                    }
                }
                Some(event) = self.consumer.next_event(), if self.consumer.is_busy() => {
                    self.render_event(&event)?;
                }
                _ = tokio::signal::ctrl_c() => {
                    match self.consumer.cancel() {
                        Some(event) => self.render_event(&event)?,
                        None => break,
                    }
                }
            }
        }

        // Leaving mid-answer drops the transport
        if let Some(event) = self.consumer.cancel() {
            self.render_event(&event)?;
        }
        Ok(())
    }

    /// Handle one line typed by the user
    pub fn handle_input(&mut self, input: String) -> Result<ConversationAction> {
        let text = input.trim();
        if text.is_empty() {
            return Ok(ConversationAction::None);
        }

        if let Some(command) = parse_slash_command(text) {
            return self.handle_slash_command(command);
        }

        self.ask(text)?;
        Ok(ConversationAction::None)
    }

    /// Send a question; a new question replaces the answer in flight
    fn ask(&mut self, text: &str) -> Result<()> {
        if self.consumer.is_busy() {
            let lines = self.controller.process_event(&ChatEvent::Cancelled);
            self.print_lines(&lines)?;
        }

        self.consumer.state_mut().set_input(text);
        match self.consumer.supersede(text) {
            Submission::Accepted => {
                self.controller.reset();
                writeln!(self.out, "{}", message_line(Role::User, text))?;
            }
            Submission::Rejected => writeln!(self.out, "⚠️ Question not sent")?,
        }
        self.out.flush()?;
        Ok(())
    }

    /// Print whatever an exchange event produces
    pub fn render_event(&mut self, event: &ChatEvent) -> Result<()> {
        if let ChatEvent::ResponseReceived(meta) = event {
            let sources = match meta.citations.len() {
                0 => String::new(),
                n => format!(" [{} source{}, /sources]", n, if n == 1 { "" } else { "s" }),
            };
            writeln!(self.out, "📄 Docusuite:{}", sources)?;
        }

        let lines = self.controller.process_event(event);
        self.print_lines(&lines)?;
        self.out.flush()?;
        Ok(())
    }

    fn print_lines(&mut self, lines: &[String]) -> Result<()> {
        for line in lines {
            writeln!(self.out, "{}", line)?;
        }
        Ok(())
    }

    /// Handle slash commands
    fn handle_slash_command(&mut self, command: ParsedCommand) -> Result<ConversationAction> {
        match command.command {
            SlashCommand::Cancel => match self.consumer.cancel() {
                Some(event) => self.render_event(&event)?,
                None => writeln!(self.out, "Nothing to cancel")?,
            },
            SlashCommand::Sources => self.print_sources(command.index_argument())?,
            SlashCommand::History => self.print_history()?,
            SlashCommand::Obligations => self.print_obligations()?,
            SlashCommand::Explain => self.explain(&command)?,
            SlashCommand::Help => writeln!(self.out, "{}", get_help_text())?,
            SlashCommand::Bye => return Ok(ConversationAction::Exit),
        }
        Ok(ConversationAction::None)
    }

    fn print_sources(&mut self, index: Option<usize>) -> Result<()> {
        let citations = self.consumer.state().citations();
        let entries: Vec<_> = match index {
            Some(index) => citations
                .iter()
                .filter(|(ordinal, _)| *ordinal == index)
                .collect(),
            None => citations.iter().collect(),
        };

        if entries.is_empty() {
            writeln!(self.out, "No sources yet")?;
            return Ok(());
        }

        for (ordinal, list) in entries {
            writeln!(self.out, "Message {}:", ordinal)?;
            for citation in list {
                match citation.page_number() {
                    Some(page) => writeln!(self.out, "  p.{} {}", page, citation.excerpt)?,
                    None => writeln!(self.out, "  {}", citation.excerpt)?,
                }
            }
        }
        Ok(())
    }

    fn print_obligations(&mut self) -> Result<()> {
        if self.obligations.is_empty() {
            writeln!(self.out, "No obligations loaded (start the chat with --contract <file>)")?;
            return Ok(());
        }

        for (number, obligation) in self.obligations.iter().enumerate() {
            writeln!(self.out, "{}. {}", number + 1, obligation.headline())?;
        }
        Ok(())
    }

    fn explain(&mut self, command: &ParsedCommand) -> Result<()> {
        let Some((number, aspect)) = command.explain_arguments() else {
            writeln!(self.out, "Usage: /explain <n> [obligation|description|penalties|dates|risks]")?;
            return Ok(());
        };

        let question = match number.checked_sub(1).and_then(|i| self.obligations.get(i)) {
            Some(obligation) => obligation.follow_up(aspect),
            None => {
                writeln!(self.out, "No obligation {} (see /obligations)", number)?;
                return Ok(());
            }
        };
        self.ask(&question)
    }

    fn print_history(&mut self) -> Result<()> {
        let messages = self.consumer.state().messages();
        if messages.is_empty() {
            writeln!(self.out, "No messages yet")?;
            return Ok(());
        }

        for (index, message) in messages.iter().enumerate() {
            let suffix = match message.status {
                MessageStatus::Interrupted => " (interrupted)",
                MessageStatus::Open => " …",
                MessageStatus::Closed => "",
            };
            writeln!(
                self.out,
                "[{}] {}{}",
                index,
                message_line(message.role, &message.content),
                suffix
            )?;
        }
        Ok(())
    }
}
