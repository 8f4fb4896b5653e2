//! Event router
//!
//! Authenticates inbound events and dispatches each one to a single
//! destination. Built-in navigation callbacks (`main_menu`, `back`,
//! `cancel`) always win; exact callback routes come before prefix routes,
//! and prefix routes are tried in registration order.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use flowbot_core::{
    BotConfig, BuiltinAction, CallbackQuery, EventContext, EventKind, FlowbotError, FlowbotResult,
    IncomingMessage, MessageId, MessageRenderer, Update, User, CALLBACK_BACK, CALLBACK_CANCEL,
    CALLBACK_FLOW_PREFIX, CALLBACK_MAIN_MENU,
};
use flowbot_engine::{FlowEngine, StepInput, StepOutcome};
use flowbot_session::{Session, SessionStore};
use parking_lot::RwLock;
use tracing::{debug, error, info, warn};

use crate::display::{PromptDisplay, StepDisplay};
use crate::handler::{AuthPredicate, EventHandler, HandlerRegistry};

/// Routing decisions log at `info` when the router is in debug mode
macro_rules! route_log {
    ($router:expr, $($arg:tt)+) => {
        if $router.debug.load(Ordering::Relaxed) {
            info!($($arg)+)
        } else {
            debug!($($arg)+)
        }
    };
}

/// Destination of a command or callback
#[derive(Clone)]
enum Route {
    Handler(Arc<dyn EventHandler>),
    StartFlow {
        flow_id: String,
        answer: Option<String>,
    },
    /// Start the flow named after the `flow:` prefix
    FlowFromData,
    Answer(Option<String>),
}

#[derive(Default)]
struct RouteTables {
    commands: HashMap<String, Route>,
    callbacks: HashMap<String, Route>,
    prefixes: Vec<(String, Route)>,
    message: Option<Arc<dyn EventHandler>>,
    photo: Option<Arc<dyn EventHandler>>,
    document: Option<Arc<dyn EventHandler>>,
    main_menu: Option<Arc<dyn EventHandler>>,
}

impl RouteTables {
    fn callback_route(&self, data: &str) -> Option<Route> {
        if let Some(route) = self.callbacks.get(data) {
            return Some(route.clone());
        }
        self.prefixes
            .iter()
            .find(|(prefix, _)| data.starts_with(prefix.as_str()))
            .map(|(_, route)| route.clone())
    }

    fn insert_prefix(&mut self, prefix: String, route: Route) {
        match self.prefixes.iter_mut().find(|(p, _)| *p == prefix) {
            Some(entry) => entry.1 = route,
            None => self.prefixes.push((prefix, route)),
        }
    }
}

/// Inbound event router
pub struct Router {
    store: Arc<SessionStore>,
    engine: Arc<FlowEngine>,
    renderer: Arc<dyn MessageRenderer>,
    display: RwLock<Arc<dyn StepDisplay>>,
    tables: RwLock<RouteTables>,
    auth: RwLock<Option<Arc<dyn AuthPredicate>>>,
    debug: AtomicBool,
}

impl Router {
    pub fn new(
        store: Arc<SessionStore>,
        engine: Arc<FlowEngine>,
        renderer: Arc<dyn MessageRenderer>,
    ) -> Self {
        let display: Arc<dyn StepDisplay> = Arc::new(PromptDisplay::new(Arc::clone(&engine)));

        let mut tables = RouteTables::default();
        tables.insert_prefix(CALLBACK_FLOW_PREFIX.to_string(), Route::FlowFromData);

        Self {
            store,
            engine,
            renderer,
            display: RwLock::new(display),
            tables: RwLock::new(tables),
            auth: RwLock::new(None),
            debug: AtomicBool::new(false),
        }
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    pub fn engine(&self) -> &Arc<FlowEngine> {
        &self.engine
    }

    pub fn renderer(&self) -> &Arc<dyn MessageRenderer> {
        &self.renderer
    }

    pub fn set_debug(&self, debug: bool) {
        self.debug.store(debug, Ordering::Relaxed);
    }

    /// Replace the step display
    pub fn set_display(&self, display: Arc<dyn StepDisplay>) {
        *self.display.write() = display;
    }

    /// Restrict the bot to users the predicate allows
    pub fn set_auth<F>(&self, predicate: F)
    where
        F: Fn(i64, &str) -> bool + Send + Sync + 'static,
    {
        *self.auth.write() = Some(Arc::new(predicate));
    }

    pub fn clear_auth(&self) {
        *self.auth.write() = None;
    }

    /// Register a command handler. A leading `/` is ignored.
    pub fn register_command<F, Fut>(&self, command: &str, handler: F)
    where
        F: Fn(EventContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.insert_command(command, Route::Handler(Arc::new(handler)));
    }

    /// Register a handler for exact callback data
    pub fn register_callback<F, Fut>(&self, data: &str, handler: F)
    where
        F: Fn(EventContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.tables
            .write()
            .callbacks
            .insert(data.to_string(), Route::Handler(Arc::new(handler)));
    }

    /// Register a handler for callback data starting with `prefix`.
    ///
    /// When several prefixes match, the one registered first wins.
    /// Re-registering a prefix keeps its position.
    pub fn register_callback_prefix<F, Fut>(&self, prefix: &str, handler: F)
    where
        F: Fn(EventContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.tables
            .write()
            .insert_prefix(prefix.to_string(), Route::Handler(Arc::new(handler)));
    }

    /// Default handler for text outside a conversation
    pub fn set_message_handler<F, Fut>(&self, handler: F)
    where
        F: Fn(EventContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.tables.write().message = Some(Arc::new(handler));
    }

    /// Default handler for photos the current step does not take
    pub fn set_photo_handler<F, Fut>(&self, handler: F)
    where
        F: Fn(EventContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.tables.write().photo = Some(Arc::new(handler));
    }

    /// Default handler for documents the current step does not take
    pub fn set_document_handler<F, Fut>(&self, handler: F)
    where
        F: Fn(EventContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.tables.write().document = Some(Arc::new(handler));
    }

    /// Handler invoked by main-menu navigation, after the session ends
    pub fn set_main_menu_handler<F, Fut>(&self, handler: F)
    where
        F: Fn(EventContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.tables.write().main_menu = Some(Arc::new(handler));
    }

    fn insert_command(&self, command: &str, route: Route) {
        let name = command.strip_prefix('/').unwrap_or(command);
        self.tables.write().commands.insert(name.to_string(), route);
    }

    /// Bind the commands and callbacks declared in `BotConfig`.
    ///
    /// A named handler found in `registry` wins over the entry's action.
    /// Entries with neither are skipped with a warning. `main_menu_id`
    /// names the registry handler used for main-menu navigation.
    pub fn configure(&self, bot: &BotConfig, registry: &HandlerRegistry) {
        self.set_debug(bot.debug);

        for cmd in &bot.commands {
            match configured_route(
                cmd.handler.as_deref(),
                cmd.action,
                cmd.target.as_deref(),
                None,
                registry,
            ) {
                Some(route) => self.insert_command(&cmd.command, route),
                None => warn!("Command /{} has no usable handler or action", cmd.command),
            }
        }

        for cb in &bot.callbacks {
            let route = configured_route(
                cb.handler.as_deref(),
                cb.action,
                cb.target.as_deref(),
                cb.answer_text.clone(),
                registry,
            );
            match route {
                Some(route) if cb.is_prefix => {
                    self.tables.write().insert_prefix(cb.callback.clone(), route);
                }
                Some(route) => {
                    self.tables.write().callbacks.insert(cb.callback.clone(), route);
                }
                None => warn!("Callback '{}' has no usable handler or action", cb.callback),
            }
        }

        if let Some(name) = bot.main_menu_id.as_deref().filter(|n| !n.is_empty()) {
            match registry.get(name) {
                Some(handler) => self.tables.write().main_menu = Some(handler),
                None => warn!("Main menu handler '{}' is not registered", name),
            }
        }

        info!(
            commands = bot.commands.len(),
            callbacks = bot.callbacks.len(),
            "Router configured"
        );
    }

    fn is_authorized(&self, user: &User) -> bool {
        let auth = self.auth.read().clone();
        match auth {
            Some(predicate) => predicate.allow(user.id, user.username_or_empty()),
            None => true,
        }
    }

    /// Dispatch one platform update
    pub async fn handle_update(&self, update: Update) {
        match update {
            Update::Message(message) => self.handle_message(message).await,
            Update::CallbackQuery(query) => self.handle_callback(query).await,
        }
    }

    /// Dispatch a message: command, photo, document or text
    pub async fn handle_message(&self, message: IncomingMessage) {
        let Some(user) = message.from.clone() else {
            debug!(chat = message.chat.chat_id, "Dropping message without sender");
            return;
        };
        let Some(kind) = message.kind() else {
            debug!(chat = message.chat.chat_id, "Dropping empty message");
            return;
        };

        if !self.is_authorized(&user) {
            warn!(user = user.id, kind = %kind, "Unauthorized message dropped");
            return;
        }

        match kind {
            EventKind::Command => self.handle_command(user, &message).await,
            EventKind::Photo => self.handle_photo(user, &message).await,
            EventKind::Document => self.handle_document(user, &message).await,
            EventKind::Text => self.handle_text(user, &message).await,
            EventKind::Callback => {}
        }
    }

    async fn handle_command(&self, user: User, message: &IncomingMessage) {
        let text = message.text.clone().unwrap_or_default();
        let ctx = EventContext::from_message(
            EventKind::Command,
            user,
            message,
            text,
            Arc::clone(&self.renderer),
        );
        let Some(name) = ctx.command.as_ref().map(|c| c.name.clone()) else {
            return;
        };

        route_log!(self, user = ctx.user.id, chat = ctx.chat.chat_id, "Command received: /{}", name);

        let route = self.tables.read().commands.get(&name).cloned();
        match route {
            Some(route) => self.run_route(&ctx, route).await,
            None => warn!(user = ctx.user.id, "No handler for command /{}", name),
        }
    }

    /// A live session takes all text; a step expecting other input drops it
    async fn handle_text(&self, user: User, message: &IncomingMessage) {
        let text = message.text.clone().unwrap_or_default();
        let ctx = EventContext::from_message(
            EventKind::Text,
            user,
            message,
            text.clone(),
            Arc::clone(&self.renderer),
        );

        route_log!(self, user = ctx.user.id, chat = ctx.chat.chat_id, "Message received: {}", preview(&text));

        if let Some(session) = self.store.get(ctx.user.id, ctx.chat.chat_id) {
            self.run_conversation(&ctx, session, StepInput::text(text)).await;
            return;
        }

        let handler = self.tables.read().message.clone();
        self.run_default(&ctx, handler).await;
    }

    async fn handle_photo(&self, user: User, message: &IncomingMessage) {
        let Some(photo) = message.largest_photo() else {
            return;
        };
        let file_id = photo.file_id.clone();
        let ctx = EventContext::from_message(
            EventKind::Photo,
            user,
            message,
            file_id.clone(),
            Arc::clone(&self.renderer),
        );

        route_log!(self, user = ctx.user.id, chat = ctx.chat.chat_id, "Photo received");

        if let Some(session) = self.session_expecting(&ctx) {
            self.run_conversation(&ctx, session, StepInput::photo(file_id)).await;
            return;
        }

        let handler = self.tables.read().photo.clone();
        self.run_default(&ctx, handler).await;
    }

    async fn handle_document(&self, user: User, message: &IncomingMessage) {
        let Some(document) = message.document.clone() else {
            return;
        };
        let ctx = EventContext::from_message(
            EventKind::Document,
            user,
            message,
            document.file_id.clone(),
            Arc::clone(&self.renderer),
        );

        route_log!(
            self,
            user = ctx.user.id,
            chat = ctx.chat.chat_id,
            "Document received: {}",
            document.file_name.as_deref().unwrap_or("")
        );

        if let Some(session) = self.session_expecting(&ctx) {
            let input = StepInput::document(document.file_id, document.file_name);
            self.run_conversation(&ctx, session, input).await;
            return;
        }

        let handler = self.tables.read().document.clone();
        self.run_default(&ctx, handler).await;
    }

    /// Live session whose current step takes the event's kind of input
    fn session_expecting(&self, ctx: &EventContext) -> Option<Arc<Session>> {
        let session = self.store.get(ctx.user.id, ctx.chat.chat_id)?;
        let step = self.engine.current_step(&session)?;
        step.input_type.accepts(ctx.kind).then_some(session)
    }

    async fn run_default(&self, ctx: &EventContext, handler: Option<Arc<dyn EventHandler>>) {
        match handler {
            Some(handler) => {
                if let Err(e) = handler.handle(ctx).await {
                    error!(user = ctx.user.id, kind = %ctx.kind, "Default handler failed: {:#}", e);
                }
            }
            None => route_log!(self, user = ctx.user.id, kind = %ctx.kind, "No handler; event dropped"),
        }
    }

    /// Dispatch a callback query
    pub async fn handle_callback(&self, query: CallbackQuery) {
        let ctx = EventContext::from_callback(&query, Arc::clone(&self.renderer));

        if !self.is_authorized(&ctx.user) {
            warn!(user = ctx.user.id, "Unauthorized callback acknowledged and dropped");
            self.acknowledge(&ctx, None).await;
            return;
        }

        route_log!(self, user = ctx.user.id, chat = ctx.chat.chat_id, "Callback received: {}", ctx.payload);

        match ctx.payload.as_str() {
            CALLBACK_MAIN_MENU => return self.navigate_main_menu(&ctx).await,
            CALLBACK_BACK | CALLBACK_CANCEL => return self.navigate_back(&ctx).await,
            _ => {}
        }

        let route = self.tables.read().callback_route(&ctx.payload);
        if let Some(route) = route {
            self.run_route(&ctx, route).await;
            return;
        }

        self.acknowledge(&ctx, None).await;
        if let Some(session) = self.store.get(ctx.user.id, ctx.chat.chat_id) {
            let input = StepInput::callback(ctx.payload.clone());
            self.run_conversation(&ctx, session, input).await;
        }
    }

    async fn run_route(&self, ctx: &EventContext, route: Route) {
        match route {
            Route::Handler(handler) => {
                if let Err(e) = handler.handle(ctx).await {
                    error!(user = ctx.user.id, kind = %ctx.kind, payload = %ctx.payload, "Handler failed: {:#}", e);
                }
            }
            Route::StartFlow { flow_id, answer } => {
                self.acknowledge(ctx, answer.as_deref()).await;
                self.start_flow_or_menu(ctx, &flow_id).await;
            }
            Route::FlowFromData => {
                self.acknowledge(ctx, None).await;
                let flow_id = ctx
                    .payload
                    .strip_prefix(CALLBACK_FLOW_PREFIX)
                    .unwrap_or(&ctx.payload)
                    .to_string();
                self.start_flow_or_menu(ctx, &flow_id).await;
            }
            Route::Answer(text) => self.acknowledge(ctx, text.as_deref()).await,
        }
    }

    /// Start a flow from a route; on failure fall back to the main menu
    async fn start_flow_or_menu(&self, ctx: &EventContext, flow_id: &str) {
        // Callbacks replace the menu message they came from
        let keyboard = match ctx.kind {
            EventKind::Callback => ctx.message_id,
            _ => None,
        };
        if let Err(e) = self.start_flow(ctx, flow_id, keyboard).await {
            if e.is_not_found() {
                warn!(user = ctx.user.id, flow = %flow_id, "Cannot start flow: {}", e);
            } else {
                error!(user = ctx.user.id, flow = %flow_id, "Failed to start flow: {}", e);
            }
            self.invoke_main_menu(ctx).await;
        }
    }

    /// Start `flow_id` for the event's user and chat and show its first step.
    ///
    /// Any session already live for the key is ended first. The flow's
    /// `on_start` handler runs before `skip_if` conditions are resolved, so it
    /// can seed session data. With `keyboard_message_id` set, the prompt
    /// edits that message instead of sending a new one.
    pub async fn start_flow(
        &self,
        ctx: &EventContext,
        flow_id: &str,
        keyboard_message_id: Option<MessageId>,
    ) -> FlowbotResult<Arc<Session>> {
        let flow = self
            .engine
            .flow(flow_id)
            .ok_or_else(|| FlowbotError::FlowNotFound(flow_id.to_string()))?;

        // Sessions carry the lookup key, which is what the engine resolves
        let ttl = flow.ttl(self.engine.default_ttl());
        let session = self.store.start(
            ctx.user.id,
            ctx.chat.chat_id,
            ctx.chat.topic_id,
            flow_id,
            &flow.initial_step,
            ttl,
        );

        let turn = session.lock_turn().await;
        session.set_keyboard_message_id(keyboard_message_id);

        if let Some(name) = flow.on_start.as_deref().filter(|n| !n.is_empty()) {
            if let Err(e) = self.engine.execute_step_handler(ctx, &session, name).await {
                error!(flow = %flow_id, handler = %name, "Flow start handler failed: {:#}", e);
            }
        }

        let first = self.engine.resolve_skips(&session, &flow.initial_step);
        if first != flow.initial_step && !self.store.change_step_for(&session, &first) {
            route_log!(self, session = %session.id(), "Session replaced while starting");
            drop(turn);
            return Ok(session);
        }

        let display = self.display.read().clone();
        let shown = display.display(ctx, &session).await;
        drop(turn);
        shown?;

        Ok(session)
    }

    async fn navigate_main_menu(&self, ctx: &EventContext) {
        self.acknowledge(ctx, None).await;
        self.end_session(ctx).await;
        self.invoke_main_menu(ctx).await;
    }

    async fn invoke_main_menu(&self, ctx: &EventContext) {
        let handler = self.tables.read().main_menu.clone();
        if let Some(handler) = handler {
            if let Err(e) = handler.handle(ctx).await {
                error!(user = ctx.user.id, "Main menu handler failed: {:#}", e);
            }
        }
    }

    /// Return to the previous step, or leave the flow when there is none
    async fn navigate_back(&self, ctx: &EventContext) {
        let Some(session) = self.store.get(ctx.user.id, ctx.chat.chat_id) else {
            return self.navigate_main_menu(ctx).await;
        };

        let turn = session.lock_turn().await;
        if !self.is_current(&session) {
            drop(turn);
            return self.navigate_main_menu(ctx).await;
        }

        match session.previous_step() {
            Some(previous) => {
                self.acknowledge(ctx, None).await;
                route_log!(self, session = %session.id(), to = %previous, "Navigating back");
                if self.store.change_step_for(&session, &previous) {
                    self.show_step(ctx, &session).await;
                }
            }
            None => {
                drop(turn);
                self.navigate_main_menu(ctx).await;
            }
        }
    }

    /// End the key's session and run its flow's `on_end` handler
    async fn end_session(&self, ctx: &EventContext) -> Option<Arc<Session>> {
        let session = self.store.end(ctx.user.id, ctx.chat.chat_id)?;

        let on_end = self
            .engine
            .flow(&session.flow_id())
            .and_then(|flow| flow.on_end.clone())
            .filter(|name| !name.is_empty());
        if let Some(name) = on_end {
            if let Err(e) = self.engine.execute_step_handler(ctx, &session, &name).await {
                error!(session = %session.id(), handler = %name, "Flow end handler failed: {:#}", e);
            }
        }

        Some(session)
    }

    /// Whether `session` is still the live session for its key
    fn is_current(&self, session: &Arc<Session>) -> bool {
        self.store
            .get(session.user_id(), session.chat_id())
            .map_or(false, |live| Arc::ptr_eq(&live, session))
    }

    /// Feed input to the session's current step, one event at a time per session
    async fn run_conversation(&self, ctx: &EventContext, session: Arc<Session>, input: StepInput) {
        let _turn = session.lock_turn().await;
        if !self.is_current(&session) {
            route_log!(self, session = %session.id(), "Session ended before input was applied");
            return;
        }

        let step_id = session.step_id();
        let outcome = self.engine.process_input(ctx, &session, &input).await;
        route_log!(
            self,
            session = %session.id(),
            flow = %session.flow_id(),
            step = %step_id,
            outcome = ?outcome,
            "Step input processed"
        );

        let consumed = matches!(
            outcome,
            StepOutcome::Continue(_) | StepOutcome::Stay | StepOutcome::HandledByCallback
        );
        if consumed && input.kind == EventKind::Text {
            self.delete_user_message(ctx).await;
        }

        match outcome {
            StepOutcome::ValidationFailed(message) => {
                if let Err(e) = ctx.reply(&format!("❌ {}", message)).await {
                    warn!(session = %session.id(), "Failed to send validation message: {}", e);
                }
            }
            StepOutcome::Continue(next) => {
                // Handlers may have ended or replaced the session meanwhile
                if self.store.change_step_for(&session, &next) {
                    self.show_step(ctx, &session).await;
                } else {
                    route_log!(self, session = %session.id(), to = %next, "Session no longer live; transition dropped");
                }
            }
            StepOutcome::Stay | StepOutcome::HandledByCallback => {}
            StepOutcome::Rejected | StepOutcome::Terminal => {
                route_log!(self, session = %session.id(), step = %step_id, kind = %input.kind, "Input ignored");
            }
        }
    }

    async fn delete_user_message(&self, ctx: &EventContext) {
        let Some(message_id) = ctx.message_id else {
            return;
        };
        if let Err(e) = self.renderer.delete_message(&ctx.chat, message_id).await {
            debug!(chat = ctx.chat.chat_id, message = message_id, "Could not delete user message: {}", e);
        }
    }

    async fn show_step(&self, ctx: &EventContext, session: &Arc<Session>) {
        let display = self.display.read().clone();
        if let Err(e) = display.display(ctx, session).await {
            error!(session = %session.id(), step = %session.step_id(), "Failed to display step: {}", e);
        }
    }

    async fn acknowledge(&self, ctx: &EventContext, text: Option<&str>) {
        if let Err(e) = ctx.answer(text).await {
            warn!(user = ctx.user.id, "Failed to acknowledge callback: {}", e);
        }
    }
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tables = self.tables.read();
        f.debug_struct("Router")
            .field("platform", &self.renderer.platform_name())
            .field("commands", &tables.commands.keys().collect::<Vec<_>>())
            .field("callbacks", &tables.callbacks.keys().collect::<Vec<_>>())
            .field(
                "prefixes",
                &tables.prefixes.iter().map(|(p, _)| p).collect::<Vec<_>>(),
            )
            .field("debug", &self.debug.load(Ordering::Relaxed))
            .finish()
    }
}

fn configured_route(
    handler: Option<&str>,
    action: Option<BuiltinAction>,
    target: Option<&str>,
    answer: Option<String>,
    registry: &HandlerRegistry,
) -> Option<Route> {
    if let Some(name) = handler.filter(|n| !n.is_empty()) {
        match registry.get(name) {
            Some(handler) => return Some(Route::Handler(handler)),
            None => warn!("Handler '{}' is not registered", name),
        }
    }

    match action? {
        BuiltinAction::StartFlow => target
            .filter(|t| !t.is_empty())
            .map(|flow_id| Route::StartFlow {
                flow_id: flow_id.to_string(),
                answer,
            }),
        BuiltinAction::Answer => Some(Route::Answer(answer)),
    }
}

/// First 50 characters of a message for logs
fn preview(text: &str) -> String {
    let mut chars = text.chars();
    let head: String = chars.by_ref().take(50).collect();
    if chars.next().is_some() {
        format!("{}...", head)
    } else {
        head
    }
}
