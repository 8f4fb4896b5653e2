// flowbot Core - Flow and step definitions
//
// Declarative conversation flows: a flow is a map of steps, each step a
// prompt plus the rules that decide which step comes next.

use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::error::{FlowbotError, FlowbotResult};
use crate::event::EventKind;

/// A conversation flow
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlowConfig {
    /// Unique flow identifier; taken from the map key when omitted
    #[serde(default)]
    pub id: String,

    /// Human-readable name
    #[serde(default)]
    pub name: String,

    /// First step of the flow
    pub initial_step: String,

    /// Steps keyed by step id
    #[serde(default)]
    pub steps: HashMap<String, StepConfig>,

    /// Session TTL override for this flow
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_secs: Option<u64>,

    /// Hook name invoked when the flow starts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_start: Option<String>,

    /// Hook name invoked when the flow ends
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_end: Option<String>,
}

impl FlowConfig {
    /// Create an empty flow starting at `initial_step`
    pub fn new(id: impl Into<String>, initial_step: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            initial_step: initial_step.into(),
            ..Default::default()
        }
    }

    /// Add a step, keyed by its id
    pub fn with_step(mut self, step: StepConfig) -> Self {
        self.steps.insert(step.id.clone(), step);
        self
    }

    /// Steps declared without an `id` take their map key
    pub fn fill_step_ids(&mut self) {
        for (key, step) in self.steps.iter_mut() {
            if step.id.is_empty() {
                step.id = key.clone();
            }
        }
    }

    /// Look up a step by id
    pub fn step(&self, step_id: &str) -> Option<&StepConfig> {
        self.steps.get(step_id)
    }

    /// Session TTL for this flow, or `default` when the flow has none
    pub fn ttl(&self, default: Duration) -> Duration {
        match self.ttl_secs {
            Some(secs) if secs > 0 => Duration::from_secs(secs),
            _ => default,
        }
    }

    /// Check required fields and references.
    ///
    /// Dangling `next_step` / branch targets are logged, not rejected: the
    /// engine treats a missing step as terminal.
    pub fn validate(&self) -> FlowbotResult<()> {
        if self.id.is_empty() {
            return Err(FlowbotError::InvalidFlow("flow id is empty".to_string()));
        }
        if self.initial_step.is_empty() {
            return Err(FlowbotError::InvalidFlow(format!(
                "flow '{}' has no initial_step",
                self.id
            )));
        }
        if self.steps.is_empty() {
            return Err(FlowbotError::InvalidFlow(format!(
                "flow '{}' has no steps",
                self.id
            )));
        }
        if !self.steps.contains_key(&self.initial_step) {
            return Err(FlowbotError::StepNotFound {
                flow: self.id.clone(),
                step: self.initial_step.clone(),
            });
        }

        for (step_id, step) in &self.steps {
            let targets = step
                .next_step
                .iter()
                .chain(step.branches.iter().map(|b| &b.next_step));
            for target in targets {
                if !target.is_empty() && !self.steps.contains_key(target) {
                    tracing::warn!(
                        flow = %self.id,
                        step = %step_id,
                        target = %target,
                        "Step references an unknown step"
                    );
                }
            }
        }

        Ok(())
    }
}

/// What kind of input a step expects
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputKind {
    /// Text message
    #[default]
    Text,
    /// Inline keyboard button press
    Callback,
    /// Text or button press
    Any,
    /// No input; the step is informational
    None,
    /// Photo upload
    Photo,
    /// Document upload
    Document,
}

impl InputKind {
    /// Whether a step expecting `self` accepts an event of `kind`
    pub fn accepts(&self, kind: EventKind) -> bool {
        match kind {
            EventKind::Text => matches!(self, Self::Text | Self::Any),
            EventKind::Callback => matches!(self, Self::Callback | Self::Any),
            EventKind::Photo => *self == Self::Photo,
            EventKind::Document => *self == Self::Document,
            EventKind::Command => false,
        }
    }
}

/// A single step within a flow
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepConfig {
    /// Step id, unique within the flow; taken from the map key when omitted
    #[serde(default)]
    pub id: String,

    /// Prompt shown to the user
    #[serde(default)]
    pub prompt_text: String,

    /// Inline keyboard shown with the prompt
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keyboard: Option<KeyboardConfig>,

    /// Expected input kind
    #[serde(default)]
    pub input_type: InputKind,

    /// Input validation rule
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation: Option<ValidationRule>,

    /// Default next step
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_step: Option<String>,

    /// Conditional transitions, evaluated in order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub branches: Vec<BranchConfig>,

    /// Completion handler; when set it owns the transition
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_complete: Option<String>,

    /// Session data key the input is stored under
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub store_as: Option<String>,

    /// Skip this step when the condition holds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_if: Option<String>,

    /// Platform parse mode for the prompt (Markdown, HTML, ...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parse_mode: Option<String>,
}

impl StepConfig {
    pub fn new(id: impl Into<String>, input_type: InputKind) -> Self {
        Self {
            id: id.into(),
            input_type,
            ..Default::default()
        }
    }

    pub fn prompt(mut self, text: impl Into<String>) -> Self {
        self.prompt_text = text.into();
        self
    }

    pub fn next(mut self, step_id: impl Into<String>) -> Self {
        self.next_step = Some(step_id.into());
        self
    }

    pub fn store_as(mut self, key: impl Into<String>) -> Self {
        self.store_as = Some(key.into());
        self
    }

    pub fn validation(mut self, rule: ValidationRule) -> Self {
        self.validation = Some(rule);
        self
    }

    pub fn branch(mut self, condition: impl Into<String>, next_step: impl Into<String>) -> Self {
        self.branches.push(BranchConfig {
            condition: condition.into(),
            next_step: next_step.into(),
            handler: None,
        });
        self
    }

    pub fn on_complete(mut self, handler: impl Into<String>) -> Self {
        self.on_complete = Some(handler.into());
        self
    }

    pub fn skip_if(mut self, condition: impl Into<String>) -> Self {
        self.skip_if = Some(condition.into());
        self
    }

    pub fn keyboard(mut self, keyboard: KeyboardConfig) -> Self {
        self.keyboard = Some(keyboard);
        self
    }
}

/// Conditional transition
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BranchConfig {
    /// Condition expression, e.g. `input == "yes"` or `data.plan != "free"`
    #[serde(default)]
    pub condition: String,

    /// Target step when the condition holds
    pub next_step: String,

    /// Handler run when this branch is taken
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handler: Option<String>,
}

/// Validation rule types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidationType {
    /// Floating point number with optional inclusive bounds
    Number,
    /// `0x`-prefixed 40-hex-digit address
    Address,
    /// Email address
    Email,
    /// Configured regular expression
    Regex,
    /// Named validator from the capability table
    Custom,
    /// Unrecognized type; always valid
    #[serde(other)]
    Other,
}

/// Bounds may be written as YAML numbers or strings
#[derive(Deserialize)]
#[serde(untagged)]
enum Bound {
    Int(i64),
    Float(f64),
    Text(String),
}

fn number_bound<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Bound>::deserialize(deserializer)?.map(|bound| match bound {
        Bound::Int(n) => n.to_string(),
        Bound::Float(n) => n.to_string(),
        Bound::Text(s) => s,
    }))
}

/// Input validation rule
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationRule {
    #[serde(rename = "type")]
    pub rule_type: ValidationType,

    /// Pattern for `regex`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,

    /// Message overriding the type-specific default
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_msg: Option<String>,

    /// Inclusive lower bound for `number`
    #[serde(default, deserialize_with = "number_bound", skip_serializing_if = "Option::is_none")]
    pub min: Option<String>,

    /// Inclusive upper bound for `number`
    #[serde(default, deserialize_with = "number_bound", skip_serializing_if = "Option::is_none")]
    pub max: Option<String>,

    /// Validator name for `custom`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom: Option<String>,
}

impl ValidationRule {
    pub fn new(rule_type: ValidationType) -> Self {
        Self {
            rule_type,
            pattern: None,
            error_msg: None,
            min: None,
            max: None,
            custom: None,
        }
    }

    pub fn number(min: Option<&str>, max: Option<&str>) -> Self {
        Self {
            min: min.map(str::to_string),
            max: max.map(str::to_string),
            ..Self::new(ValidationType::Number)
        }
    }

    pub fn regex(pattern: impl Into<String>) -> Self {
        Self {
            pattern: Some(pattern.into()),
            ..Self::new(ValidationType::Regex)
        }
    }

    pub fn custom(name: impl Into<String>) -> Self {
        Self {
            custom: Some(name.into()),
            ..Self::new(ValidationType::Custom)
        }
    }

    pub fn with_error_msg(mut self, msg: impl Into<String>) -> Self {
        self.error_msg = Some(msg.into());
        self
    }
}

/// Inline keyboard attached to a step prompt
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KeyboardConfig {
    /// Static button rows
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub buttons: Vec<Vec<ButtonConfig>>,

    /// Dynamic keyboard provider name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,

    /// Prefix prepended to dynamic button callback data
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback_prefix: Option<String>,

    /// Columns of the dynamic button grid
    #[serde(default = "default_columns")]
    pub columns: usize,

    /// Append a back button row
    #[serde(default)]
    pub add_back: bool,

    /// Append a main-menu button row
    #[serde(default)]
    pub add_main: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub back_text: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub main_text: Option<String>,
}

fn default_columns() -> usize {
    2
}

/// Static keyboard button
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ButtonConfig {
    pub text: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_flow_yaml() {
        let yaml = r#"
id: signup
name: Sign up
initial_step: ask_name
ttl_secs: 120
steps:
  ask_name:
    id: ask_name
    prompt_text: "What's your name?"
    store_as: name
    next_step: ask_plan
  ask_plan:
    id: ask_plan
    prompt_text: "Pick a plan"
    input_type: callback
    keyboard:
      buttons:
        - - text: Free
            callback: free
          - text: Pro
            callback: pro
      add_back: true
    branches:
      - condition: 'input == "pro"'
        next_step: ask_card
    next_step: done
  ask_card:
    id: ask_card
    validation:
      type: regex
      pattern: "^[0-9]{16}$"
      error_msg: "16 digits please"
  done:
    id: done
    input_type: none
"#;

        let flow: FlowConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(flow.id, "signup");
        assert_eq!(flow.steps.len(), 4);
        assert!(flow.validate().is_ok());
        assert_eq!(flow.ttl(Duration::from_secs(600)), Duration::from_secs(120));

        let plan = flow.step("ask_plan").unwrap();
        assert_eq!(plan.input_type, InputKind::Callback);
        assert_eq!(plan.branches[0].next_step, "ask_card");
        let keyboard = plan.keyboard.as_ref().unwrap();
        assert_eq!(keyboard.buttons[0].len(), 2);
        assert_eq!(keyboard.columns, 2);

        let card = flow.step("ask_card").unwrap();
        let rule = card.validation.as_ref().unwrap();
        assert_eq!(rule.rule_type, ValidationType::Regex);
        assert_eq!(rule.error_msg.as_deref(), Some("16 digits please"));
        assert_eq!(card.input_type, InputKind::Text);
    }

    #[test]
    fn test_number_bounds_accept_numbers_and_strings() {
        let rule: ValidationRule = serde_yaml::from_str("type: number\nmin: 18\nmax: \"99.5\"").unwrap();
        assert_eq!(rule.min.as_deref(), Some("18"));
        assert_eq!(rule.max.as_deref(), Some("99.5"));

        let rule: ValidationRule = serde_yaml::from_str("type: number").unwrap();
        assert!(rule.min.is_none());
    }

    #[test]
    fn test_unknown_validation_type_is_other() {
        let rule: ValidationRule = serde_yaml::from_str("type: required").unwrap();
        assert_eq!(rule.rule_type, ValidationType::Other);
    }

    #[test]
    fn test_validate_rejects_missing_initial_step() {
        let flow = FlowConfig::new("f", "missing").with_step(StepConfig::new("a", InputKind::Text));
        assert!(matches!(
            flow.validate(),
            Err(FlowbotError::StepNotFound { .. })
        ));

        let empty = FlowConfig::new("f", "a");
        assert!(matches!(empty.validate(), Err(FlowbotError::InvalidFlow(_))));
    }

    #[test]
    fn test_input_kind_accepts() {
        assert!(InputKind::Text.accepts(EventKind::Text));
        assert!(InputKind::Any.accepts(EventKind::Text));
        assert!(InputKind::Any.accepts(EventKind::Callback));
        assert!(!InputKind::Any.accepts(EventKind::Photo));
        assert!(InputKind::Photo.accepts(EventKind::Photo));
        assert!(!InputKind::Text.accepts(EventKind::Document));
        assert!(!InputKind::None.accepts(EventKind::Text));
    }

    #[test]
    fn test_ttl_falls_back_to_default() {
        let mut flow = FlowConfig::new("f", "a");
        assert_eq!(flow.ttl(Duration::from_secs(60)), Duration::from_secs(60));
        flow.ttl_secs = Some(0);
        assert_eq!(flow.ttl(Duration::from_secs(60)), Duration::from_secs(60));
    }
}
