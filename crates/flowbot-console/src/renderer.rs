//! Terminal renderer

use std::io::Write;
use std::sync::atomic::{AtomicI32, Ordering};

use async_trait::async_trait;
use flowbot_core::{ButtonAction, ChatTarget, Keyboard, MessageId, MessageRenderer, Prompt, RenderError};

/// Prints bot output to stdout. Message ids are assigned locally.
pub struct ConsoleRenderer {
    next_id: AtomicI32,
    last_prompt: AtomicI32,
}

impl Default for ConsoleRenderer {
    fn default() -> Self {
        Self {
            next_id: AtomicI32::new(1),
            last_prompt: AtomicI32::new(0),
        }
    }
}

impl ConsoleRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Id of the most recently sent or edited prompt; button presses target it
    pub fn last_prompt(&self) -> MessageId {
        self.last_prompt.load(Ordering::SeqCst)
    }

    fn next_id(&self) -> MessageId {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    fn print(&self, text: &str) -> Result<(), RenderError> {
        let mut out = std::io::stdout().lock();
        writeln!(out, "{}", text).map_err(|e| RenderError::ApiError(e.to_string()))?;
        out.flush().map_err(|e| RenderError::ApiError(e.to_string()))
    }
}

/// Keyboard rows as `[label -> data]` cells
pub fn format_keyboard(keyboard: &Keyboard) -> String {
    keyboard
        .rows
        .iter()
        .map(|row| {
            row.iter()
                .map(|button| match button.action {
                    ButtonAction::Callback(ref data) => format!("[{} -> !{}]", button.text, data),
                    ButtonAction::Url(ref url) => format!("[{} <{}>]", button.text, url),
                })
                .collect::<Vec<_>>()
                .join(" ")
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn format_prompt(prompt: &Prompt) -> String {
    match prompt.keyboard {
        Some(ref keyboard) => format!("{}\n{}", prompt.text, format_keyboard(keyboard)),
        None => prompt.text.clone(),
    }
}

#[async_trait]
impl MessageRenderer for ConsoleRenderer {
    async fn send_text(&self, _chat: &ChatTarget, text: &str) -> Result<MessageId, RenderError> {
        self.print(&format!("bot> {}", text))?;
        Ok(self.next_id())
    }

    async fn send_prompt(&self, _chat: &ChatTarget, prompt: &Prompt) -> Result<MessageId, RenderError> {
        let id = self.next_id();
        self.print(&format!("bot#{}> {}", id, format_prompt(prompt)))?;
        self.last_prompt.store(id, Ordering::SeqCst);
        Ok(id)
    }

    async fn edit_prompt(
        &self,
        _chat: &ChatTarget,
        message_id: MessageId,
        prompt: &Prompt,
    ) -> Result<(), RenderError> {
        self.print(&format!("bot#{} (edited)> {}", message_id, format_prompt(prompt)))?;
        self.last_prompt.store(message_id, Ordering::SeqCst);
        Ok(())
    }

    async fn delete_message(&self, _chat: &ChatTarget, _message_id: MessageId) -> Result<(), RenderError> {
        Ok(())
    }

    async fn answer_callback(
        &self,
        _callback_id: &str,
        text: Option<&str>,
        show_alert: bool,
    ) -> Result<(), RenderError> {
        match text.filter(|t| !t.is_empty()) {
            Some(text) if show_alert => self.print(&format!("bot (alert)> {}", text)),
            Some(text) => self.print(&format!("bot (toast)> {}", text)),
            None => Ok(()),
        }
    }

    fn platform_name(&self) -> &'static str {
        "console"
    }
}
