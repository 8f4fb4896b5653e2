//! Capability table - named handlers the flow definitions refer to
//!
//! Flows name step handlers, keyboard providers and validators by string.
//! The table is filled in before the engine is built and is read-only
//! afterwards, so lookups need no locking.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use flowbot_core::{ButtonData, EventContext};
use flowbot_session::Session;
use tracing::debug;

/// Completion handler named by a step's `on_complete` or a branch's `handler`
///
/// The handler may mutate the session and owns any further transition.
#[async_trait]
pub trait StepHandler: Send + Sync {
    async fn handle(&self, ctx: &EventContext, session: Arc<Session>) -> anyhow::Result<()>;
}

#[async_trait]
impl<F, Fut> StepHandler for F
where
    F: Fn(EventContext, Arc<Session>) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    async fn handle(&self, ctx: &EventContext, session: Arc<Session>) -> anyhow::Result<()> {
        (self)(ctx.clone(), session).await
    }
}

/// Dynamic keyboard buttons for a step
#[async_trait]
pub trait KeyboardProvider: Send + Sync {
    async fn buttons(&self, ctx: &EventContext, session: Arc<Session>) -> Vec<ButtonData>;
}

#[async_trait]
impl<F, Fut> KeyboardProvider for F
where
    F: Fn(EventContext, Arc<Session>) -> Fut + Send + Sync,
    Fut: Future<Output = Vec<ButtonData>> + Send,
{
    async fn buttons(&self, ctx: &EventContext, session: Arc<Session>) -> Vec<ButtonData> {
        (self)(ctx.clone(), session).await
    }
}

/// Custom input validator; `Err` carries the message shown to the user
pub trait Validator: Send + Sync {
    fn validate(&self, input: &str, session: &Session) -> Result<(), String>;
}

impl<F> Validator for F
where
    F: Fn(&str, &Session) -> Result<(), String> + Send + Sync,
{
    fn validate(&self, input: &str, session: &Session) -> Result<(), String> {
        (self)(input, session)
    }
}

/// Replacement for the built-in condition forms
pub trait ConditionEvaluator: Send + Sync {
    fn evaluate(&self, session: &Session, condition: &str) -> bool;
}

impl<F> ConditionEvaluator for F
where
    F: Fn(&Session, &str) -> bool + Send + Sync,
{
    fn evaluate(&self, session: &Session, condition: &str) -> bool {
        (self)(session, condition)
    }
}

/// Named capabilities available to flows
#[derive(Clone, Default)]
pub struct Capabilities {
    step_handlers: HashMap<String, Arc<dyn StepHandler>>,
    keyboard_providers: HashMap<String, Arc<dyn KeyboardProvider>>,
    validators: HashMap<String, Arc<dyn Validator>>,
    condition_evaluator: Option<Arc<dyn ConditionEvaluator>>,
}

impl Capabilities {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a step handler
    pub fn register_step_handler(
        &mut self,
        name: impl Into<String>,
        handler: Arc<dyn StepHandler>,
    ) -> &mut Self {
        let name = name.into();
        debug!(handler = %name, "Registering step handler");
        self.step_handlers.insert(name, handler);
        self
    }

    /// Register a dynamic keyboard provider
    pub fn register_keyboard_provider(
        &mut self,
        name: impl Into<String>,
        provider: Arc<dyn KeyboardProvider>,
    ) -> &mut Self {
        let name = name.into();
        debug!(provider = %name, "Registering keyboard provider");
        self.keyboard_providers.insert(name, provider);
        self
    }

    /// Register a custom validator
    pub fn register_validator(
        &mut self,
        name: impl Into<String>,
        validator: Arc<dyn Validator>,
    ) -> &mut Self {
        let name = name.into();
        debug!(validator = %name, "Registering validator");
        self.validators.insert(name, validator);
        self
    }

    pub fn set_condition_evaluator(&mut self, evaluator: Arc<dyn ConditionEvaluator>) -> &mut Self {
        self.condition_evaluator = Some(evaluator);
        self
    }

    /// Builder form of `register_step_handler` for closures
    pub fn with_step_handler<F, Fut>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(EventContext, Arc<Session>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.register_step_handler(name, Arc::new(handler));
        self
    }

    pub fn with_keyboard_provider<F, Fut>(mut self, name: impl Into<String>, provider: F) -> Self
    where
        F: Fn(EventContext, Arc<Session>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Vec<ButtonData>> + Send + 'static,
    {
        self.register_keyboard_provider(name, Arc::new(provider));
        self
    }

    pub fn with_validator<F>(mut self, name: impl Into<String>, validator: F) -> Self
    where
        F: Fn(&str, &Session) -> Result<(), String> + Send + Sync + 'static,
    {
        self.register_validator(name, Arc::new(validator));
        self
    }

    pub fn with_condition_evaluator<F>(mut self, evaluator: F) -> Self
    where
        F: Fn(&Session, &str) -> bool + Send + Sync + 'static,
    {
        self.set_condition_evaluator(Arc::new(evaluator));
        self
    }

    pub fn step_handler(&self, name: &str) -> Option<Arc<dyn StepHandler>> {
        self.step_handlers.get(name).cloned()
    }

    pub fn keyboard_provider(&self, name: &str) -> Option<Arc<dyn KeyboardProvider>> {
        self.keyboard_providers.get(name).cloned()
    }

    pub fn validator(&self, name: &str) -> Option<Arc<dyn Validator>> {
        self.validators.get(name).cloned()
    }

    pub fn condition_evaluator(&self) -> Option<&Arc<dyn ConditionEvaluator>> {
        self.condition_evaluator.as_ref()
    }
}

impl std::fmt::Debug for Capabilities {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Capabilities")
            .field("step_handlers", &self.step_handlers.keys().collect::<Vec<_>>())
            .field("keyboard_providers", &self.keyboard_providers.keys().collect::<Vec<_>>())
            .field("validators", &self.validators.keys().collect::<Vec<_>>())
            .field("condition_evaluator", &self.condition_evaluator.is_some())
            .finish()
    }
}
