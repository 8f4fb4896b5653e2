//! Inbound event model
//!
//! Platform-neutral shapes of the updates a chat platform delivers:
//! messages (commands, text, photos, documents) and inline keyboard
//! callbacks, plus the `EventContext` handed to registered handlers.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::renderer::{MessageRenderer, RenderError};

/// Platform message identifier
pub type MessageId = i32;

/// Kind of inbound event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Command,
    Callback,
    Text,
    Photo,
    Document,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Command => "command",
            Self::Callback => "callback",
            Self::Text => "text",
            Self::Photo => "photo",
            Self::Document => "document",
        };
        f.write_str(name)
    }
}

/// User information from the platform
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    /// Platform user id
    pub id: i64,

    /// Username or handle
    pub username: Option<String>,

    /// Display name
    pub display_name: Option<String>,

    /// Is bot/system user
    #[serde(default)]
    pub is_bot: bool,
}

impl User {
    pub fn new(id: i64) -> Self {
        Self {
            id,
            ..Default::default()
        }
    }

    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    /// Username, or empty when the user has none
    pub fn username_or_empty(&self) -> &str {
        self.username.as_deref().unwrap_or("")
    }
}

/// Where a message goes: a chat and, for forum groups, a topic
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChatTarget {
    pub chat_id: i64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic_id: Option<i32>,
}

impl ChatTarget {
    pub fn new(chat_id: i64) -> Self {
        Self {
            chat_id,
            topic_id: None,
        }
    }

    pub fn with_topic(chat_id: i64, topic_id: Option<i32>) -> Self {
        Self { chat_id, topic_id }
    }
}

/// One size of an uploaded photo
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhotoSize {
    pub file_id: String,
    #[serde(default)]
    pub width: u32,
    #[serde(default)]
    pub height: u32,
}

/// Uploaded document
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    pub file_id: String,
    #[serde(default)]
    pub file_name: Option<String>,
    #[serde(default)]
    pub mime_type: Option<String>,
}

/// Message from the platform
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncomingMessage {
    pub message_id: MessageId,

    pub chat: ChatTarget,

    /// Sender; channel posts have none
    pub from: Option<User>,

    #[serde(default)]
    pub text: Option<String>,

    /// Photo sizes, smallest first
    #[serde(default)]
    pub photos: Vec<PhotoSize>,

    #[serde(default)]
    pub document: Option<Document>,

    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl IncomingMessage {
    /// Text message from `user` in `chat`
    pub fn text(message_id: MessageId, chat: ChatTarget, user: User, text: impl Into<String>) -> Self {
        Self {
            message_id,
            chat,
            from: Some(user),
            text: Some(text.into()),
            photos: Vec::new(),
            document: None,
            timestamp: Utc::now(),
        }
    }

    /// Photo message from `user` in `chat`
    pub fn photo(message_id: MessageId, chat: ChatTarget, user: User, photos: Vec<PhotoSize>) -> Self {
        Self {
            photos,
            text: None,
            ..Self::text(message_id, chat, user, "")
        }
    }

    /// Document message from `user` in `chat`
    pub fn document(message_id: MessageId, chat: ChatTarget, user: User, document: Document) -> Self {
        Self {
            document: Some(document),
            text: None,
            ..Self::text(message_id, chat, user, "")
        }
    }

    /// Classify the message. Commands win over media, media over text.
    pub fn kind(&self) -> Option<EventKind> {
        let text = self.text.as_deref().unwrap_or("");
        if text.starts_with('/') {
            Some(EventKind::Command)
        } else if !self.photos.is_empty() {
            Some(EventKind::Photo)
        } else if self.document.is_some() {
            Some(EventKind::Document)
        } else if !text.is_empty() {
            Some(EventKind::Text)
        } else {
            None
        }
    }

    /// Largest photo size (the platform sends sizes smallest first)
    pub fn largest_photo(&self) -> Option<&PhotoSize> {
        self.photos.last()
    }
}

/// Message a callback button was attached to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallbackOrigin {
    pub chat: ChatTarget,
    pub message_id: MessageId,
}

/// Inline keyboard button press
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallbackQuery {
    /// Callback id, used to acknowledge the press
    pub id: String,

    pub from: User,

    /// Message carrying the keyboard, when still accessible
    #[serde(default)]
    pub message: Option<CallbackOrigin>,

    /// Callback data of the pressed button
    #[serde(default)]
    pub data: String,
}

impl CallbackQuery {
    pub fn new(id: impl Into<String>, from: User, origin: CallbackOrigin, data: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            from,
            message: Some(origin),
            data: data.into(),
        }
    }

    /// Chat of the keyboard message, or the user's private chat
    pub fn chat(&self) -> ChatTarget {
        self.message
            .map(|origin| origin.chat)
            .unwrap_or_else(|| ChatTarget::new(self.from.id))
    }
}

/// An update delivered by the platform
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Update {
    Message(IncomingMessage),
    CallbackQuery(CallbackQuery),
}

/// Parsed `/command args` text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandInvocation {
    /// Command name without the slash or `@bot` suffix
    pub name: String,

    /// Everything after the first space
    pub args: String,
}

impl CommandInvocation {
    /// Parse `/name@bot args`. Returns `None` when the text is not a command.
    pub fn parse(text: &str) -> Option<Self> {
        let rest = text.strip_prefix('/')?;
        let (head, args) = match rest.split_once(' ') {
            Some((head, args)) => (head, args.trim()),
            None => (rest, ""),
        };
        let name = match head.find('@') {
            Some(idx) => &head[..idx],
            None => head,
        };
        Some(Self {
            name: name.to_string(),
            args: args.to_string(),
        })
    }
}

/// Context handed to registered handlers for one inbound event
#[derive(Clone)]
pub struct EventContext {
    /// Event kind
    pub kind: EventKind,

    /// Who triggered the event
    pub user: User,

    /// Where it happened
    pub chat: ChatTarget,

    /// Message id of the user's message, or of the keyboard message for callbacks
    pub message_id: Option<MessageId>,

    /// Callback id (callbacks only)
    pub callback_id: Option<String>,

    /// Raw input: text, callback data, or file id
    pub payload: String,

    /// Parsed command (commands only)
    pub command: Option<CommandInvocation>,

    renderer: Arc<dyn MessageRenderer>,
}

impl fmt::Debug for EventContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventContext")
            .field("kind", &self.kind)
            .field("user", &self.user.id)
            .field("chat", &self.chat)
            .field("message_id", &self.message_id)
            .field("payload", &self.payload)
            .finish()
    }
}

impl EventContext {
    /// Context for a message of the given kind
    pub fn from_message(
        kind: EventKind,
        user: User,
        message: &IncomingMessage,
        payload: impl Into<String>,
        renderer: Arc<dyn MessageRenderer>,
    ) -> Self {
        let command = match kind {
            EventKind::Command => message.text.as_deref().and_then(CommandInvocation::parse),
            _ => None,
        };
        Self {
            kind,
            user,
            chat: message.chat,
            message_id: Some(message.message_id),
            callback_id: None,
            payload: payload.into(),
            command,
            renderer,
        }
    }

    /// Context for a callback query
    pub fn from_callback(query: &CallbackQuery, renderer: Arc<dyn MessageRenderer>) -> Self {
        Self {
            kind: EventKind::Callback,
            user: query.from.clone(),
            chat: query.chat(),
            message_id: query.message.map(|origin| origin.message_id),
            callback_id: Some(query.id.clone()),
            payload: query.data.clone(),
            command: None,
            renderer,
        }
    }

    /// Renderer for sending responses
    pub fn renderer(&self) -> &Arc<dyn MessageRenderer> {
        &self.renderer
    }

    /// Send a plain text message to the event's chat
    pub async fn reply(&self, text: &str) -> Result<MessageId, RenderError> {
        self.renderer.send_text(&self.chat, text).await
    }

    /// Acknowledge the callback, optionally with a notification text.
    /// No-op for non-callback events.
    pub async fn answer(&self, text: Option<&str>) -> Result<(), RenderError> {
        match self.callback_id {
            Some(ref id) => self.renderer.answer_callback(id, text, false).await,
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_command() {
        let cmd = CommandInvocation::parse("/start").unwrap();
        assert_eq!(cmd.name, "start");
        assert_eq!(cmd.args, "");

        let cmd = CommandInvocation::parse("/order@shop_bot 3 apples").unwrap();
        assert_eq!(cmd.name, "order");
        assert_eq!(cmd.args, "3 apples");

        // Case is preserved
        let cmd = CommandInvocation::parse("/Help").unwrap();
        assert_eq!(cmd.name, "Help");

        assert!(CommandInvocation::parse("hello").is_none());
    }

    #[test]
    fn test_message_kind() {
        let chat = ChatTarget::new(10);
        let user = User::new(1);

        let msg = IncomingMessage::text(1, chat, user.clone(), "/menu");
        assert_eq!(msg.kind(), Some(EventKind::Command));

        let msg = IncomingMessage::text(2, chat, user.clone(), "hi");
        assert_eq!(msg.kind(), Some(EventKind::Text));

        let photo = PhotoSize {
            file_id: "p1".to_string(),
            ..Default::default()
        };
        let msg = IncomingMessage::photo(3, chat, user.clone(), vec![photo]);
        assert_eq!(msg.kind(), Some(EventKind::Photo));

        let doc = Document {
            file_id: "d1".to_string(),
            ..Default::default()
        };
        let msg = IncomingMessage::document(4, chat, user.clone(), doc);
        assert_eq!(msg.kind(), Some(EventKind::Document));

        let msg = IncomingMessage::text(5, chat, user, "");
        assert_eq!(msg.kind(), None);
    }

    #[test]
    fn test_callback_chat_falls_back_to_private_chat() {
        let query = CallbackQuery {
            id: "cb".to_string(),
            from: User::new(42),
            message: None,
            data: "x".to_string(),
        };
        assert_eq!(query.chat(), ChatTarget::new(42));
    }

    #[test]
    fn test_update_deserialize() {
        let json = r#"{"callback_query":{"id":"c1","from":{"id":7,"username":"ann","display_name":null},"message":{"chat":{"chat_id":9},"message_id":3},"data":"back"}}"#;
        let update: Update = serde_json::from_str(json).unwrap();
        match update {
            Update::CallbackQuery(q) => {
                assert_eq!(q.data, "back");
                assert_eq!(q.chat().chat_id, 9);
            }
            _ => panic!("Expected callback query"),
        }
    }
}
