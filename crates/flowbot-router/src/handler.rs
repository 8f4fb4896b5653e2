//! Handler traits for router destinations

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use flowbot_core::EventContext;

/// Destination for commands, callbacks and messages outside a conversation
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, ctx: &EventContext) -> anyhow::Result<()>;
}

#[async_trait]
impl<F, Fut> EventHandler for F
where
    F: Fn(EventContext) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    async fn handle(&self, ctx: &EventContext) -> anyhow::Result<()> {
        (self)(ctx.clone()).await
    }
}

/// Decides whether `(user_id, username)` may use the bot
pub trait AuthPredicate: Send + Sync {
    fn allow(&self, user_id: i64, username: &str) -> bool;
}

impl<F> AuthPredicate for F
where
    F: Fn(i64, &str) -> bool + Send + Sync,
{
    fn allow(&self, user_id: i64, username: &str) -> bool {
        (self)(user_id, username)
    }
}

/// Handlers referenced by name from `BotConfig` command and callback entries
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn EventHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, handler: Arc<dyn EventHandler>) -> &mut Self {
        self.handlers.insert(name.into(), handler);
        self
    }

    pub fn with_handler<F, Fut>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(EventContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.register(name, Arc::new(handler));
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn EventHandler>> {
        self.handlers.get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("handlers", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}
