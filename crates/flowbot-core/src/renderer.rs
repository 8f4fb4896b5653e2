//! Message renderer abstraction
//!
//! The chat platform client is consumed through `MessageRenderer`. Each
//! platform implementation handles:
//! - Sending prompts and plain text
//! - Editing a prompt in place
//! - Deleting messages
//! - Acknowledging callback presses

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::event::{ChatTarget, MessageId};

/// Callback data returning to the main menu
pub const CALLBACK_MAIN_MENU: &str = "main_menu";
/// Callback data going back one step
pub const CALLBACK_BACK: &str = "back";
/// Callback data cancelling the current step (same as back)
pub const CALLBACK_CANCEL: &str = "cancel";
/// Callback prefix starting a flow (`flow:<id>`)
pub const CALLBACK_FLOW_PREFIX: &str = "flow:";

/// Renderer/transport errors
#[derive(Debug, Error)]
pub enum RenderError {
    #[error("API error: {0}")]
    ApiError(String),

    #[error("Message not found: {0}")]
    MessageNotFound(MessageId),

    #[error("Rate limit exceeded")]
    RateLimitExceeded,

    #[error("Unsupported operation: {0}")]
    Unsupported(String),
}

/// Dynamic button descriptor returned by keyboard providers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ButtonData {
    /// Button label
    pub text: String,

    /// Callback data sent on press
    pub callback: String,

    /// Link opened on press
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl ButtonData {
    pub fn new(text: impl Into<String>, callback: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            callback: callback.into(),
            url: None,
        }
    }
}

/// What pressing a button does
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ButtonAction {
    Callback(String),
    Url(String),
}

/// Inline keyboard button
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Button {
    pub text: String,
    pub action: ButtonAction,
}

impl Button {
    pub fn callback(text: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            action: ButtonAction::Callback(data.into()),
        }
    }

    pub fn url(text: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            action: ButtonAction::Url(url.into()),
        }
    }
}

/// Inline keyboard, rows of buttons
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Keyboard {
    pub rows: Vec<Vec<Button>>,
}

impl Keyboard {
    pub fn builder() -> KeyboardBuilder {
        KeyboardBuilder::default()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.iter().all(|row| row.is_empty())
    }

    /// All callback data on the keyboard, row by row
    pub fn callbacks(&self) -> Vec<&str> {
        self.rows
            .iter()
            .flatten()
            .filter_map(|b| match &b.action {
                ButtonAction::Callback(data) => Some(data.as_str()),
                ButtonAction::Url(_) => None,
            })
            .collect()
    }
}

/// Fluent keyboard construction
#[derive(Debug, Default)]
pub struct KeyboardBuilder {
    rows: Vec<Vec<Button>>,
}

impl KeyboardBuilder {
    /// Add a row; empty rows are dropped
    pub fn row(mut self, buttons: Vec<Button>) -> Self {
        if !buttons.is_empty() {
            self.rows.push(buttons);
        }
        self
    }

    /// Lay buttons out in rows of `columns` (2 when zero)
    pub fn grid(mut self, buttons: Vec<Button>, columns: usize) -> Self {
        let columns = if columns == 0 { 2 } else { columns };
        for chunk in buttons.chunks(columns) {
            self.rows.push(chunk.to_vec());
        }
        self
    }

    pub fn back(self, text: Option<&str>) -> Self {
        let text = text.unwrap_or("⬅️ Back");
        self.row(vec![Button::callback(text, CALLBACK_BACK)])
    }

    pub fn main_menu(self, text: Option<&str>) -> Self {
        let text = text.unwrap_or("🏠 Main Menu");
        self.row(vec![Button::callback(text, CALLBACK_MAIN_MENU)])
    }

    pub fn build(self) -> Keyboard {
        Keyboard { rows: self.rows }
    }
}

/// Rendered step prompt
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Prompt {
    pub text: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keyboard: Option<Keyboard>,

    /// Platform parse mode (Markdown, HTML, ...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parse_mode: Option<String>,
}

impl Prompt {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }

    /// Attach a keyboard; empty keyboards are dropped
    pub fn with_keyboard(mut self, keyboard: Keyboard) -> Self {
        self.keyboard = Some(keyboard).filter(|kb| !kb.is_empty());
        self
    }

    pub fn with_parse_mode(mut self, parse_mode: Option<String>) -> Self {
        self.parse_mode = parse_mode;
        self
    }
}

/// Chat platform client used by the router and prompt display
///
/// Implement this trait to connect a messaging platform. All calls are
/// addressed by chat (and topic) plus message id where relevant.
#[async_trait]
pub trait MessageRenderer: Send + Sync {
    /// Send a plain text message
    async fn send_text(&self, target: &ChatTarget, text: &str) -> Result<MessageId, RenderError>;

    /// Send a prompt with its keyboard
    async fn send_prompt(&self, target: &ChatTarget, prompt: &Prompt) -> Result<MessageId, RenderError>;

    /// Replace the text and keyboard of an existing prompt
    async fn edit_prompt(
        &self,
        target: &ChatTarget,
        message_id: MessageId,
        prompt: &Prompt,
    ) -> Result<(), RenderError>;

    /// Delete a message
    async fn delete_message(&self, target: &ChatTarget, message_id: MessageId) -> Result<(), RenderError>;

    /// Acknowledge a callback press, optionally showing text or an alert
    async fn answer_callback(
        &self,
        callback_id: &str,
        text: Option<&str>,
        show_alert: bool,
    ) -> Result<(), RenderError>;

    /// Platform name
    fn platform_name(&self) -> &'static str;
}
