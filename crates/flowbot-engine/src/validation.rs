//! Input validation rules

use std::sync::OnceLock;

use dashmap::DashMap;
use flowbot_core::{ValidationRule, ValidationType};
use flowbot_session::Session;
use regex::Regex;
use thiserror::Error;

use crate::capabilities::Capabilities;

/// Message shown to the user when a rule itself is broken
pub const MISCONFIGURED_MESSAGE: &str = "Validation rule configuration error";

const EMAIL_PATTERN: &str = r"^[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}$";

/// Validation failure
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// Input rejected; the message is shown to the user
    #[error("{0}")]
    Invalid(String),

    /// The rule cannot be applied (bad pattern)
    #[error("Validation rule configuration error: {0}")]
    Misconfigured(String),
}

impl ValidationError {
    /// Text to show the user
    pub fn user_message(&self) -> &str {
        match self {
            Self::Invalid(msg) => msg,
            Self::Misconfigured(_) => MISCONFIGURED_MESSAGE,
        }
    }
}

fn is_email(input: &str) -> bool {
    static EMAIL: OnceLock<Option<Regex>> = OnceLock::new();
    EMAIL
        .get_or_init(|| Regex::new(EMAIL_PATTERN).ok())
        .as_ref()
        .map_or(false, |re| re.is_match(input))
}

fn invalid(rule: &ValidationRule, default: impl Into<String>) -> ValidationError {
    ValidationError::Invalid(match rule.error_msg {
        Some(ref msg) if !msg.is_empty() => msg.clone(),
        _ => default.into(),
    })
}

/// Applies `ValidationRule`s, caching compiled patterns
#[derive(Debug, Default)]
pub struct InputValidator {
    patterns: DashMap<String, Regex>,
}

impl InputValidator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn validate(
        &self,
        rule: &ValidationRule,
        input: &str,
        session: &Session,
        capabilities: &Capabilities,
    ) -> Result<(), ValidationError> {
        match rule.rule_type {
            ValidationType::Number => validate_number(rule, input),
            ValidationType::Address => validate_address(rule, input),
            ValidationType::Email => {
                if is_email(input) {
                    Ok(())
                } else {
                    Err(invalid(rule, "Please enter a valid email address"))
                }
            }
            ValidationType::Regex => self.validate_regex(rule, input),
            ValidationType::Custom => {
                let Some(name) = rule.custom.as_deref().filter(|n| !n.is_empty()) else {
                    return Ok(());
                };
                match capabilities.validator(name) {
                    Some(validator) => validator
                        .validate(input, session)
                        .map_err(ValidationError::Invalid),
                    None => {
                        tracing::debug!(validator = %name, "Custom validator not registered");
                        Ok(())
                    }
                }
            }
            ValidationType::Other => Ok(()),
        }
    }

    fn validate_regex(&self, rule: &ValidationRule, input: &str) -> Result<(), ValidationError> {
        let Some(pattern) = rule.pattern.as_deref().filter(|p| !p.is_empty()) else {
            return Ok(());
        };

        let cached = self.patterns.get(pattern).map(|re| re.is_match(input));
        let matched = match cached {
            Some(matched) => matched,
            None => {
                let re = Regex::new(pattern)
                    .map_err(|e| ValidationError::Misconfigured(format!("{}: {}", pattern, e)))?;
                let matched = re.is_match(input);
                self.patterns.insert(pattern.to_string(), re);
                matched
            }
        };

        if matched {
            Ok(())
        } else {
            Err(invalid(rule, "Input format is incorrect"))
        }
    }
}

/// Surrounding whitespace is ignored, so " 5" from a mobile keyboard passes.
fn validate_number(rule: &ValidationRule, input: &str) -> Result<(), ValidationError> {
    let value: f64 = input
        .trim()
        .parse()
        .map_err(|_| invalid(rule, "Please enter a valid number"))?;

    // Unparsable bounds are ignored
    if let Some(min) = rule.min.as_deref() {
        if let Ok(bound) = min.trim().parse::<f64>() {
            if value < bound {
                return Err(invalid(rule, format!("Number cannot be less than {}", min)));
            }
        }
    }
    if let Some(max) = rule.max.as_deref() {
        if let Ok(bound) = max.trim().parse::<f64>() {
            if value > bound {
                return Err(invalid(rule, format!("Number cannot be greater than {}", max)));
            }
        }
    }

    Ok(())
}

fn validate_address(rule: &ValidationRule, input: &str) -> Result<(), ValidationError> {
    let valid = input.len() == 42
        && input
            .strip_prefix("0x")
            .map_or(false, |hex| hex.chars().all(|c| c.is_ascii_hexdigit()));

    if valid {
        Ok(())
    } else {
        Err(invalid(rule, "Please enter a valid Ethereum address"))
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

    fn check(rule: &ValidationRule, input: &str) -> Result<(), ValidationError> {
        InputValidator::new().validate(rule, input, &session(), &Capabilities::new())
    }

    #[test]
    fn test_number_range() {
        let rule = ValidationRule::number(Some("1"), Some("10"));
        assert!(check(&rule, "5").is_ok());
        assert!(check(&rule, "1").is_ok());
        assert!(check(&rule, "10").is_ok());

        let err = check(&rule, "0").unwrap_err();
        assert_eq!(err.user_message(), "Number cannot be less than 1");
        let err = check(&rule, "11").unwrap_err();
        assert_eq!(err.user_message(), "Number cannot be greater than 10");
        let err = check(&rule, "abc").unwrap_err();
        assert_eq!(err.user_message(), "Please enter a valid number");
    }

    #[test]
    fn test_number_trims_whitespace() {
        let rule = ValidationRule::number(Some("1"), Some("10"));
        assert!(check(&rule, " 5").is_ok());
        assert!(check(&rule, "7\n").is_ok());
        assert_eq!(
            check(&rule, " 12 ").unwrap_err().user_message(),
            "Number cannot be greater than 10"
        );
        assert!(check(&rule, "   ").is_err());
        assert!(check(&rule, "5 5").is_err());
    }

    #[test]
    fn test_number_ignores_bad_bounds() {
        let rule = ValidationRule::number(Some("low"), None);
        assert!(check(&rule, "-5").is_ok());
    }

    #[test]
    fn test_address() {
        let rule = ValidationRule::new(ValidationType::Address);
        assert!(check(&rule, &format!("0x{}", "a".repeat(40))).is_ok());
        assert!(check(&rule, &format!("0x{}", "AbC0".repeat(10))).is_ok());

        assert!(check(&rule, "0x123").is_err());
        let with_g = format!("0x{}g", "a".repeat(39));
        assert_eq!(with_g.len(), 42);
        let err = check(&rule, &with_g).unwrap_err();
        assert_eq!(err.user_message(), "Please enter a valid Ethereum address");
        assert!(check(&rule, &format!("1x{}", "a".repeat(40))).is_err());
    }

    #[test]
    fn test_email() {
        let rule = ValidationRule::new(ValidationType::Email);
        assert!(check(&rule, "ann@example.com").is_ok());
        assert!(check(&rule, "ann@example").is_err());
        assert!(check(&rule, "not an email").is_err());
    }

    #[test]
    fn test_regex() {
        let rule = ValidationRule::regex("^[0-9]{4}$");
        assert!(check(&rule, "1234").is_ok());
        assert_eq!(
            check(&rule, "12a4").unwrap_err().user_message(),
            "Input format is incorrect"
        );

        let empty = ValidationRule::regex("");
        assert!(check(&empty, "anything").is_ok());

        let broken = ValidationRule::regex("([a-z");
        let err = check(&broken, "abc").unwrap_err();
        assert!(matches!(err, ValidationError::Misconfigured(_)));
        assert_eq!(err.user_message(), MISCONFIGURED_MESSAGE);
    }

    #[test]
    fn test_error_msg_override() {
        let rule = ValidationRule::number(None, Some("3")).with_error_msg("Pick 1 to 3");
        assert_eq!(check(&rule, "9").unwrap_err().user_message(), "Pick 1 to 3");
        assert_eq!(check(&rule, "x").unwrap_err().user_message(), "Pick 1 to 3");
    }

    #[test]
    fn test_custom_validator() {
        let caps = Capabilities::new().with_validator("even", |input: &str, _: &Session| {
            match input.parse::<i64>() {
                Ok(n) if n % 2 == 0 => Ok(()),
                _ => Err("Must be even".to_string()),
            }
        });
        let validator = InputValidator::new();
        let s = session();

        let rule = ValidationRule::custom("even");
        assert!(validator.validate(&rule, "4", &s, &caps).is_ok());
        assert_eq!(
            validator.validate(&rule, "3", &s, &caps),
            Err(ValidationError::Invalid("Must be even".to_string()))
        );

        // Unregistered validators accept everything
        let unknown = ValidationRule::custom("nope");
        assert!(validator.validate(&unknown, "3", &s, &caps).is_ok());
    }
}
