use std::path::PathBuf;

use clap::Parser;
use flowbot_core::{CallbackOrigin, CallbackQuery, ChatTarget, Document, IncomingMessage, MessageId, PhotoSize, Update, User};

/// flowbot console - drive conversation flows from the terminal
#[derive(Parser, Debug)]
#[command(name = "flowbot")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Bot configuration file (YAML, or JSON with a .json extension)
    #[arg(short, long, env = "FLOWBOT_CONFIG")]
    pub config: PathBuf,

    /// Extra directory of single-flow YAML files
    #[arg(long, env = "FLOWBOT_FLOWS_DIR")]
    pub flows_dir: Option<PathBuf>,

    /// User id the console speaks as
    #[arg(long, default_value_t = 1)]
    pub user: i64,

    /// Chat id the console speaks in
    #[arg(long, default_value_t = 1)]
    pub chat: i64,

    /// Username passed to the allow-list
    #[arg(long)]
    pub username: Option<String>,

    /// Only these user ids may use the bot (repeatable)
    #[arg(long = "allow")]
    pub allow: Vec<i64>,

    /// Verbose routing logs
    #[arg(short, long)]
    pub debug: bool,
}

/// One line of console input, already classified
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    /// `!data` presses a button on the last prompt
    Press(String),
    /// `:photo <file_id>`
    Photo(String),
    /// `:doc <file_id> [name]`
    Document(String, Option<String>),
    /// `/command` or plain text
    Message(String),
    /// `:quit`
    Quit,
}

impl Input {
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        if let Some(data) = line.strip_prefix('!') {
            return Some(Self::Press(data.trim().to_string()));
        }
        if line == ":quit" || line == ":q" {
            return Some(Self::Quit);
        }
        if let Some(rest) = line.strip_prefix(":photo ") {
            return Some(Self::Photo(rest.trim().to_string()));
        }
        if let Some(rest) = line.strip_prefix(":doc ") {
            let mut parts = rest.trim().splitn(2, ' ');
            let file_id = parts.next().unwrap_or_default().to_string();
            let name = parts.next().map(|n| n.trim().to_string()).filter(|n| !n.is_empty());
            return Some(Self::Document(file_id, name));
        }
        Some(Self::Message(line.to_string()))
    }

    /// Build the platform update for this input
    pub fn into_update(self, user: &User, chat: ChatTarget, message_id: MessageId, prompt_id: MessageId) -> Option<Update> {
        let update = match self {
            Self::Press(data) => Update::CallbackQuery(CallbackQuery::new(
                format!("console-{}", message_id),
                user.clone(),
                CallbackOrigin {
                    chat,
                    message_id: prompt_id,
                },
                data,
            )),
            Self::Photo(file_id) => Update::Message(IncomingMessage::photo(
                message_id,
                chat,
                user.clone(),
                vec![PhotoSize {
                    file_id,
                    ..Default::default()
                }],
            )),
            Self::Document(file_id, file_name) => Update::Message(IncomingMessage::document(
                message_id,
                chat,
                user.clone(),
                Document {
                    file_id,
                    file_name,
                    mime_type: None,
                },
            )),
            Self::Message(text) => Update::Message(IncomingMessage::text(message_id, chat, user.clone(), text)),
            Self::Quit => return None,
        };
        Some(update)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_input() {
        assert_eq!(Input::parse("  "), None);
        assert_eq!(Input::parse("!plan:pro"), Some(Input::Press("plan:pro".to_string())));
        assert_eq!(Input::parse("/start"), Some(Input::Message("/start".to_string())));
        assert_eq!(Input::parse("hello"), Some(Input::Message("hello".to_string())));
        assert_eq!(Input::parse(":photo abc"), Some(Input::Photo("abc".to_string())));
        assert_eq!(
            Input::parse(":doc d1 my cv.pdf"),
            Some(Input::Document("d1".to_string(), Some("my cv.pdf".to_string())))
        );
        assert_eq!(Input::parse(":doc d2"), Some(Input::Document("d2".to_string(), None)));
        assert_eq!(Input::parse(":q"), Some(Input::Quit));
    }

    #[test]
    fn test_press_targets_last_prompt() {
        let user = User::new(7);
        let update = Input::Press("yes".to_string())
            .into_update(&user, ChatTarget::new(3), 12, 40)
            .unwrap();
        match update {
            Update::CallbackQuery(q) => {
                assert_eq!(q.data, "yes");
                assert_eq!(q.message.unwrap().message_id, 40);
                assert_eq!(q.chat(), ChatTarget::new(3));
            }
            _ => panic!("Expected callback query"),
        }
        assert!(Input::Quit.into_update(&user, ChatTarget::new(3), 1, 1).is_none());
    }
}
