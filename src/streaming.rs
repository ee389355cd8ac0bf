use std::collections::VecDeque;

use crate::events::{ChatEvent, Role};

/// Line buffer for streaming text output
#[derive(Debug, Clone, Default)]
pub struct StreamState {
    /// Lines ready to be displayed
    queued_lines: VecDeque<String>,
    /// Current line being built
    current_line: String,
    /// Whether we've seen any content
    has_content: bool,
}

impl StreamState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Process a text delta
    pub fn push_delta(&mut self, delta: &str) {
        if !delta.is_empty() {
            self.has_content = true;
        }

        self.current_line.push_str(delta);

        // Check for complete lines
        while let Some(newline_pos) = self.current_line.find('\n') {
            let line = self.current_line[..newline_pos].to_string();
            self.current_line.drain(..=newline_pos);
            self.queued_lines.push_back(line);
        }
    }

    /// Get all complete lines
    pub fn drain_lines(&mut self) -> Vec<String> {
        self.queued_lines.drain(..).collect()
    }

    /// Partial line not yet terminated by a newline
    pub fn current_line(&self) -> &str {
        &self.current_line
    }

    pub fn has_content(&self) -> bool {
        self.has_content
    }

    /// Flush complete lines plus the trailing partial line
    pub fn finalize(&mut self) -> Vec<String> {
        let mut lines = self.drain_lines();
        if !self.current_line.trim().is_empty() {
            lines.push(std::mem::take(&mut self.current_line));
        }
        self.current_line.clear();
        lines
    }

    pub fn clear(&mut self) {
        self.queued_lines.clear();
        self.current_line.clear();
        self.has_content = false;
    }
}

/// Turns exchange events into printable lines
#[derive(Debug, Clone, Default)]
pub struct StreamController {
    state: StreamState,
    is_streaming: bool,
}

impl StreamController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lines to print after `event`
    pub fn process_event(&mut self, event: &ChatEvent) -> Vec<String> {
        match event {
            ChatEvent::ResponseReceived(_) => {
                self.state.clear();
                self.is_streaming = true;
                Vec::new()
            }
            ChatEvent::Delta(delta) => {
                self.state.push_delta(delta);
                self.state.drain_lines()
            }
            ChatEvent::Finished => {
                self.is_streaming = false;
                let lines = self.state.finalize();
                if lines.is_empty() && !self.state.has_content() {
                    return vec!["(empty answer)".to_string()];
                }
                lines
            }
            ChatEvent::Failed(error) => {
                self.is_streaming = false;
                let mut lines = self.state.finalize();
                lines.push(format!("❌ Error: {}", error));
                lines
            }
            ChatEvent::Cancelled => {
                self.is_streaming = false;
                let mut lines = self.state.finalize();
                lines.push("⏹ Cancelled".to_string());
                lines
            }
        }
    }

    pub fn is_streaming(&self) -> bool {
        self.is_streaming
    }

    pub fn reset(&mut self) {
        self.state.clear();
        self.is_streaming = false;
    }
}

/// Prefix a message for transcript output
pub fn message_line(role: Role, content: &str) -> String {
    match role {
        Role::User => format!("👤 You: {}", content),
        Role::Assistant => format!("📄 Docusuite: {}", content),
    }
}
