//! Branch and skip conditions
//!
//! The built-in language is deliberately small:
//!
//! - `input == "literal"` compares the raw input
//! - `key == "value"` / `key != "value"` compare stored session data as
//!   strings, with an optional `data.` prefix on the key
//! - an empty condition always holds
//!
//! Anything else parses to `Condition::Custom`. Without a registered
//! `ConditionEvaluator` a custom condition holds.

use flowbot_session::Session;
use tracing::debug;

/// Parsed condition expression
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Condition {
    Always,
    InputEquals(String),
    Equals { key: String, value: String },
    NotEquals { key: String, value: String },
    Custom(String),
}

/// Split on `op` when it occurs exactly once
fn split_once_exact<'a>(expr: &'a str, op: &str) -> Option<(&'a str, &'a str)> {
    let (lhs, rhs) = expr.split_once(op)?;
    if rhs.contains(op) {
        return None;
    }
    Some((lhs.trim(), rhs.trim()))
}

fn unquote(value: &str) -> String {
    value.trim_matches(|c| c == '"' || c == '\'').to_string()
}

fn data_key(key: &str) -> String {
    key.strip_prefix("data.").unwrap_or(key).to_string()
}

impl Condition {
    pub fn parse(expr: &str) -> Self {
        let expr = expr.trim();
        if expr.is_empty() {
            return Self::Always;
        }

        if let Some((lhs, rhs)) = split_once_exact(expr, "==") {
            if lhs == "input" {
                return Self::InputEquals(unquote(rhs));
            }
            return Self::Equals {
                key: data_key(lhs),
                value: unquote(rhs),
            };
        }

        if let Some((lhs, rhs)) = split_once_exact(expr, "!=") {
            return Self::NotEquals {
                key: data_key(lhs),
                value: unquote(rhs),
            };
        }

        Self::Custom(expr.to_string())
    }

    /// Whether the condition only looks at the raw input
    pub fn is_input(&self) -> bool {
        matches!(self, Self::Always | Self::InputEquals(_))
    }

    /// Evaluate with the built-in rules
    pub fn matches(&self, session: &Session, input: &str) -> bool {
        match self {
            Self::Always => true,
            Self::InputEquals(expected) => input == expected,
            Self::Equals { key, value } => session.get_string(key) == *value,
            Self::NotEquals { key, value } => session.get_string(key) != *value,
            Self::Custom(expr) => {
                debug!(condition = %expr, "Unrecognized condition treated as true");
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowbot_session::SessionKey;
    use std::time::Duration;

    fn session() -> Session {
        Session::new(SessionKey::new(1, 1), None, "f", "a", Duration::from_secs(60))
    }

    #[test]
    fn test_parse_forms() {
        assert_eq!(Condition::parse(""), Condition::Always);
        assert_eq!(Condition::parse("   "), Condition::Always);
        assert_eq!(
            Condition::parse(r#"input == "yes""#),
            Condition::InputEquals("yes".to_string())
        );
        assert_eq!(
            Condition::parse("data.plan == 'pro'"),
            Condition::Equals {
                key: "plan".to_string(),
                value: "pro".to_string()
            }
        );
        assert_eq!(
            Condition::parse(r#"plan != "free""#),
            Condition::NotEquals {
                key: "plan".to_string(),
                value: "free".to_string()
            }
        );
        assert_eq!(
            Condition::parse("age > 18"),
            Condition::Custom("age > 18".to_string())
        );
        assert!(matches!(Condition::parse("a == b == c"), Condition::Custom(_)));
    }

    #[test]
    fn test_data_comparisons_are_string_only() {
        let s = session();
        s.set("plan", "pro");
        s.set("count", 3);

        assert!(Condition::parse(r#"data.plan == "pro""#).matches(&s, ""));
        assert!(!Condition::parse(r#"plan != "pro""#).matches(&s, ""));
        // Non-string data reads as empty
        assert!(!Condition::parse(r#"count == "3""#).matches(&s, ""));
        assert!(Condition::parse(r#"missing == """#).matches(&s, ""));
    }

    #[test]
    fn test_input_and_fail_open() {
        let s = session();
        let cond = Condition::parse(r#"input == "a""#);
        assert!(cond.matches(&s, "a"));
        assert!(!cond.matches(&s, "b"));
        assert!(cond.is_input());

        let custom = Condition::parse("score >= 10");
        assert!(!custom.is_input());
        assert!(custom.matches(&s, "anything"));
    }
}
