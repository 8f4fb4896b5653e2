// flowbot Core - Configuration
//
// Bot settings and flow definitions, loaded from YAML or JSON. The engine
// reads flows through the `FlowSource` trait so callers can plug in other
// sources.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{FlowbotError, FlowbotResult};
use crate::flow::FlowConfig;

/// Read-only access to flow definitions
pub trait FlowSource: Send + Sync {
    /// Get a flow by id
    fn flow(&self, flow_id: &str) -> Option<Arc<FlowConfig>>;

    /// Default session TTL
    fn default_ttl(&self) -> Duration;
}

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlowbotConfig {
    /// Bot-level settings
    #[serde(default)]
    pub bot: BotConfig,

    /// Flows keyed by flow id
    #[serde(default)]
    pub flows: HashMap<String, Arc<FlowConfig>>,
}

/// Bot-level settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotConfig {
    /// Default session TTL in seconds
    #[serde(default = "default_ttl_secs")]
    pub default_ttl_secs: u64,

    /// Expired-session sweep interval in seconds
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,

    /// Verbose routing logs
    #[serde(default)]
    pub debug: bool,

    /// Registered handler invoked by main-menu navigation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub main_menu_id: Option<String>,

    /// Commands bound from configuration
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub commands: Vec<CommandConfig>,

    /// Callbacks bound from configuration
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub callbacks: Vec<CallbackConfig>,
}

fn default_ttl_secs() -> u64 {
    600
}

fn default_cleanup_interval_secs() -> u64 {
    300
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            default_ttl_secs: default_ttl_secs(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
            debug: false,
            main_menu_id: None,
            commands: Vec::new(),
            callbacks: Vec::new(),
        }
    }
}

impl BotConfig {
    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }
}

/// Built-in action bound to a command or callback
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuiltinAction {
    /// Start the flow named by `target`
    StartFlow,
    /// Acknowledge the callback with `answer_text`
    Answer,
}

/// Command binding
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandConfig {
    /// Command name, without the slash
    pub command: String,

    /// Shown in the platform's command menu
    #[serde(default)]
    pub description: String,

    /// Registered handler name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handler: Option<String>,

    /// Built-in action used when no handler is bound
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<BuiltinAction>,

    /// Action target (flow id)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
}

/// Callback binding
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallbackConfig {
    /// Callback data, or prefix when `is_prefix`
    pub callback: String,

    #[serde(default)]
    pub is_prefix: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handler: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<BuiltinAction>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,

    /// Notification text shown when acknowledging
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer_text: Option<String>,
}

impl FlowbotConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load from a file; `.json` files are parsed as JSON, everything else as YAML
    pub fn from_file(path: impl AsRef<Path>) -> FlowbotResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            FlowbotError::config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;
        let is_json = path.extension().map_or(false, |e| e == "json");
        Self::from_str_with_format(&content, is_json)
    }

    /// Parse configuration text
    pub fn from_str_with_format(content: &str, is_json: bool) -> FlowbotResult<Self> {
        let mut config: FlowbotConfig = if is_json {
            serde_json::from_str(content)?
        } else {
            serde_yaml::from_str(content)?
        };
        config.fill_flow_ids();
        Ok(config)
    }

    /// Flows keyed in a map may omit `id`; take it from the key
    fn fill_flow_ids(&mut self) {
        for (key, flow) in self.flows.iter_mut() {
            let flow = Arc::make_mut(flow);
            if flow.id.is_empty() {
                flow.id = key.clone();
            }
            flow.fill_step_ids();
        }
    }

    /// Apply `FLOWBOT_*` environment overrides
    pub fn apply_env_overrides(&mut self) {
        if let Ok(value) = std::env::var("FLOWBOT_DEFAULT_TTL_SECS") {
            match value.parse::<u64>() {
                Ok(secs) => self.bot.default_ttl_secs = secs,
                Err(e) => tracing::warn!("Ignoring FLOWBOT_DEFAULT_TTL_SECS={}: {}", value, e),
            }
        }
        if let Ok(value) = std::env::var("FLOWBOT_DEBUG") {
            self.bot.debug = matches!(value.as_str(), "1" | "true" | "yes");
        }
    }

    /// Validate every flow
    pub fn validate(&self) -> FlowbotResult<()> {
        for flow in self.flows.values() {
            flow.validate()?;
        }
        Ok(())
    }

    /// Add a flow keyed by its id
    pub fn add_flow(&mut self, flow: FlowConfig) {
        self.flows.insert(flow.id.clone(), Arc::new(flow));
    }

    /// Load every `.yaml` / `.yml` file in `dir` as a single flow.
    ///
    /// Files that fail to parse or validate are logged and skipped.
    pub fn load_flows_dir(&mut self, dir: impl AsRef<Path>) -> FlowbotResult<usize> {
        let dir = dir.as_ref();
        if !dir.exists() {
            return Err(FlowbotError::config(format!(
                "Flows directory does not exist: {}",
                dir.display()
            )));
        }

        let mut loaded = 0;
        for entry in std::fs::read_dir(dir)?.flatten() {
            let path = entry.path();
            if !path.extension().map_or(false, |e| e == "yaml" || e == "yml") {
                continue;
            }

            let parsed = std::fs::read_to_string(&path)
                .map_err(FlowbotError::from)
                .and_then(|content| serde_yaml::from_str::<FlowConfig>(&content).map_err(FlowbotError::from))
                .map(|mut flow| {
                    flow.fill_step_ids();
                    flow
                })
                .and_then(|flow| flow.validate().map(|_| flow));

            match parsed {
                Ok(flow) => {
                    tracing::debug!("Loaded flow: {} from {}", flow.id, path.display());
                    self.add_flow(flow);
                    loaded += 1;
                }
                Err(e) => {
                    tracing::warn!("Failed to load flow from {}: {}", path.display(), e);
                }
            }
        }

        tracing::info!("Loaded {} flows from {}", loaded, dir.display());
        Ok(loaded)
    }
}

impl FlowSource for FlowbotConfig {
    fn flow(&self, flow_id: &str) -> Option<Arc<FlowConfig>> {
        self.flows.get(flow_id).cloned()
    }

    fn default_ttl(&self) -> Duration {
        self.bot.default_ttl()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::{InputKind, StepConfig};
    use std::io::Write;

    const CONFIG_YAML: &str = r#"
bot:
  default_ttl_secs: 90
  debug: true
  commands:
    - command: signup
      description: Create an account
      action: start_flow
      target: signup
  callbacks:
    - callback: "item:"
      is_prefix: true
      handler: show_item
flows:
  signup:
    initial_step: name
    steps:
      name:
        prompt_text: "Name?"
        next_step: done
      done:
        input_type: none
"#;

    #[test]
    fn test_load_yaml_config() {
        let config = FlowbotConfig::from_str_with_format(CONFIG_YAML, false).unwrap();
        assert_eq!(config.bot.default_ttl(), Duration::from_secs(90));
        assert_eq!(config.bot.cleanup_interval(), Duration::from_secs(300));
        assert!(config.bot.debug);
        assert_eq!(config.bot.commands[0].action, Some(BuiltinAction::StartFlow));
        assert!(config.bot.callbacks[0].is_prefix);

        let flow = config.flow("signup").unwrap();
        assert_eq!(flow.id, "signup");
        assert_eq!(flow.step("name").unwrap().id, "name");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_json_file() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(
            file,
            r#"{{"flows":{{"f":{{"id":"f","initial_step":"a","steps":{{"a":{{"id":"a"}}}}}}}}}}"#
        )
        .unwrap();

        let config = FlowbotConfig::from_file(file.path()).unwrap();
        assert!(config.flow("f").is_some());
        assert_eq!(config.default_ttl(), Duration::from_secs(600));
    }

    #[test]
    fn test_load_flows_dir_skips_bad_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("good.yaml"),
            "id: good\ninitial_step: a\nsteps:\n  a:\n    id: a\n",
        )
        .unwrap();
        std::fs::write(dir.path().join("bad.yml"), "id: bad\ninitial_step: missing\nsteps: {}\n").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let mut config = FlowbotConfig::new();
        let loaded = config.load_flows_dir(dir.path()).unwrap();
        assert_eq!(loaded, 1);
        assert!(config.flow("good").is_some());
        assert!(config.flow("bad").is_none());
    }

    #[test]
    fn test_missing_flows_dir_is_error() {
        let mut config = FlowbotConfig::new();
        assert!(config.load_flows_dir("/definitely/not/here").is_err());
    }

    #[test]
    fn test_add_flow() {
        let mut config = FlowbotConfig::new();
        config.add_flow(FlowConfig::new("f", "a").with_step(StepConfig::new("a", InputKind::Text)));
        assert!(config.flow("f").is_some());
        assert!(config.flow("g").is_none());
    }
}
