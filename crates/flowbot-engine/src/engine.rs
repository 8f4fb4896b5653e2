//! Flow engine
//!
//! Stateless step logic over a `FlowSource`. The engine never errors on a
//! missing flow or step: a session pointing at one is terminal.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use flowbot_core::{
    ButtonData, EventContext, EventKind, FlowConfig, FlowSource, StepConfig,
};
use flowbot_session::Session;
use parking_lot::RwLock;
use serde_json::Value;
use tracing::{debug, error, warn};

use crate::capabilities::Capabilities;
use crate::condition::Condition;
use crate::validation::{InputValidator, ValidationError};

/// One unit of user input for the current step
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepInput {
    pub kind: EventKind,

    /// Value stored and matched by branches: text, callback data or file id
    pub value: String,

    /// Original file name (documents only)
    pub file_name: Option<String>,
}

impl StepInput {
    pub fn text(value: impl Into<String>) -> Self {
        Self {
            kind: EventKind::Text,
            value: value.into(),
            file_name: None,
        }
    }

    pub fn callback(data: impl Into<String>) -> Self {
        Self {
            kind: EventKind::Callback,
            ..Self::text(data)
        }
    }

    pub fn photo(file_id: impl Into<String>) -> Self {
        Self {
            kind: EventKind::Photo,
            ..Self::text(file_id)
        }
    }

    pub fn document(file_id: impl Into<String>, file_name: Option<String>) -> Self {
        Self {
            kind: EventKind::Document,
            file_name,
            ..Self::text(file_id)
        }
    }

    /// History entry text for this input
    fn history_entry(&self) -> String {
        match self.kind {
            EventKind::Photo => format!("photo:{}", self.value),
            EventKind::Document => format!("doc:{}", self.value),
            _ => self.value.clone(),
        }
    }
}

/// Result of feeding input to the current step
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    /// Move to this step
    Continue(String),
    /// No next step; the session stays where it is
    Stay,
    /// A completion handler ran and owns the transition
    HandledByCallback,
    /// Input rejected; nothing was stored
    ValidationFailed(String),
    /// The step does not take this kind of input
    Rejected,
    /// The session's step no longer exists
    Terminal,
}

/// Chosen branch or default transition
#[derive(Debug, Default)]
struct Transition {
    next_step: Option<String>,
    handler: Option<String>,
}

/// Flow engine
pub struct FlowEngine {
    source: RwLock<Arc<dyn FlowSource>>,
    capabilities: Capabilities,
    validator: InputValidator,
    conditions: DashMap<String, Arc<Condition>>,
}

impl FlowEngine {
    pub fn new(source: Arc<dyn FlowSource>, capabilities: Capabilities) -> Self {
        Self {
            source: RwLock::new(source),
            capabilities,
            validator: InputValidator::new(),
            conditions: DashMap::new(),
        }
    }

    /// Swap the flow definitions; sessions keep their ids and pick up the
    /// new definitions on their next event
    pub fn set_source(&self, source: Arc<dyn FlowSource>) {
        *self.source.write() = source;
        self.conditions.clear();
        debug!("Flow source replaced");
    }

    pub fn source(&self) -> Arc<dyn FlowSource> {
        self.source.read().clone()
    }

    pub fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    pub fn default_ttl(&self) -> Duration {
        self.source.read().default_ttl()
    }

    pub fn flow(&self, flow_id: &str) -> Option<Arc<FlowConfig>> {
        self.source.read().flow(flow_id)
    }

    pub fn step(&self, flow_id: &str, step_id: &str) -> Option<StepConfig> {
        self.flow(flow_id)?.step(step_id).cloned()
    }

    /// Step the session is currently on
    pub fn current_step(&self, session: &Session) -> Option<StepConfig> {
        self.step(&session.flow_id(), &session.step_id())
    }

    /// Validate `input` against the current step's rule. No step or no rule
    /// means valid.
    pub fn validate_input(&self, session: &Session, input: &str) -> Result<(), ValidationError> {
        match self.current_step(session).and_then(|step| step.validation) {
            Some(rule) => self
                .validator
                .validate(&rule, input, session, &self.capabilities),
            None => Ok(()),
        }
    }

    /// Parsed, cached condition
    pub fn condition(&self, expr: &str) -> Arc<Condition> {
        if let Some(cond) = self.conditions.get(expr) {
            return Arc::clone(cond.value());
        }
        let cond = Arc::new(Condition::parse(expr));
        if matches!(*cond, Condition::Custom(_)) && self.capabilities.condition_evaluator().is_none() {
            warn!(condition = %expr.trim(), "Unrecognized condition with no evaluator registered; it always holds");
        }
        self.conditions.insert(expr.to_string(), Arc::clone(&cond));
        cond
    }

    /// Evaluate a condition. A registered evaluator decides everything except
    /// empty and `input == ...` conditions.
    pub fn evaluate_condition(&self, session: &Session, expr: &str, input: &str) -> bool {
        let cond = self.condition(expr);
        if cond.is_input() {
            return cond.matches(session, input);
        }
        match self.capabilities.condition_evaluator() {
            Some(evaluator) => evaluator.evaluate(session, expr.trim()),
            None => cond.matches(session, input),
        }
    }

    fn resolve_transition(&self, step: &StepConfig, session: &Session, input: &str) -> Transition {
        for branch in &step.branches {
            if self.evaluate_condition(session, &branch.condition, input) {
                debug!(
                    step = %step.id,
                    condition = %branch.condition,
                    next = %branch.next_step,
                    "Branch matched"
                );
                return Transition {
                    next_step: Some(branch.next_step.clone()).filter(|s| !s.is_empty()),
                    handler: branch.handler.clone().filter(|h| !h.is_empty()),
                };
            }
        }

        Transition {
            next_step: step.next_step.clone().filter(|s| !s.is_empty()),
            handler: None,
        }
    }

    /// Next step for `input`: the first matching branch, else the step's
    /// `next_step`. `None` means stay.
    pub fn determine_next_step(&self, session: &Session, input: &str) -> Option<String> {
        let step = self.current_step(session)?;
        self.resolve_transition(&step, session, input).next_step
    }

    /// Follow `skip_if` from `step_id` to the first step that is not skipped.
    /// A skipped step without a `next_step` stops the walk.
    pub fn resolve_skips(&self, session: &Session, step_id: &str) -> String {
        let Some(flow) = self.flow(&session.flow_id()) else {
            return step_id.to_string();
        };

        let mut current = step_id.to_string();
        for _ in 0..flow.steps.len() {
            let Some(step) = flow.step(&current) else {
                break;
            };
            let skip = match step.skip_if.as_deref() {
                Some(cond) if !cond.trim().is_empty() => self.evaluate_condition(session, cond, ""),
                _ => false,
            };
            if !skip {
                break;
            }
            match step.next_step.as_deref().filter(|s| !s.is_empty()) {
                Some(next) => {
                    debug!(skipped = %current, next = %next, "Step skipped");
                    current = next.to_string();
                }
                None => break,
            }
        }
        current
    }

    /// Run a named step handler; unknown names are a no-op
    pub async fn execute_step_handler(
        &self,
        ctx: &EventContext,
        session: &Arc<Session>,
        name: &str,
    ) -> anyhow::Result<()> {
        match self.capabilities.step_handler(name) {
            Some(handler) => handler.handle(ctx, Arc::clone(session)).await,
            None => {
                debug!(handler = %name, "Step handler not registered");
                Ok(())
            }
        }
    }

    /// Buttons from a named keyboard provider; unknown names yield none
    pub async fn dynamic_keyboard_data(
        &self,
        ctx: &EventContext,
        session: &Arc<Session>,
        provider: &str,
    ) -> Vec<ButtonData> {
        match self.capabilities.keyboard_provider(provider) {
            Some(p) => p.buttons(ctx, Arc::clone(session)).await,
            None => {
                debug!(provider = %provider, "Keyboard provider not registered");
                Vec::new()
            }
        }
    }

    /// Feed input to the session's current step.
    ///
    /// Checks the input kind, validates text, stores the value under
    /// `store_as`, records history, then runs the completion handler or
    /// resolves the next step. Does not move the session; the caller applies
    /// `Continue` through the session store.
    pub async fn process_input(
        &self,
        ctx: &EventContext,
        session: &Arc<Session>,
        input: &StepInput,
    ) -> StepOutcome {
        let Some(step) = self.current_step(session) else {
            debug!(
                flow = %session.flow_id(),
                step = %session.step_id(),
                "Session step not found"
            );
            return StepOutcome::Terminal;
        };

        if !step.input_type.accepts(input.kind) {
            debug!(step = %step.id, kind = %input.kind, "Step does not accept input kind");
            return StepOutcome::Rejected;
        }

        if input.kind == EventKind::Text {
            if let Some(ref rule) = step.validation {
                if let Err(e) = self
                    .validator
                    .validate(rule, &input.value, session, &self.capabilities)
                {
                    if let ValidationError::Misconfigured(ref detail) = e {
                        warn!(flow = %session.flow_id(), step = %step.id, "Broken validation rule: {}", detail);
                    }
                    return StepOutcome::ValidationFailed(e.user_message().to_string());
                }
            }
        }

        if let Some(key) = step.store_as.as_deref().filter(|k| !k.is_empty()) {
            store_input(session, key, input);
        }
        // History holds step keys so back navigation can resolve them
        session.add_history(session.step_id(), input.history_entry());

        if let Some(name) = step.on_complete.as_deref().filter(|n| !n.is_empty()) {
            if let Err(e) = self.execute_step_handler(ctx, session, name).await {
                error!(handler = %name, step = %step.id, "Step handler failed: {:#}", e);
            }
            return StepOutcome::HandledByCallback;
        }

        let transition = self.resolve_transition(&step, session, &input.value);
        if let Some(ref name) = transition.handler {
            if let Err(e) = self.execute_step_handler(ctx, session, name).await {
                error!(handler = %name, step = %step.id, "Branch handler failed: {:#}", e);
            }
        }

        match transition.next_step {
            Some(next) => StepOutcome::Continue(self.resolve_skips(session, &next)),
            None => StepOutcome::Stay,
        }
    }
}

fn store_input(session: &Session, key: &str, input: &StepInput) {
    session.set(key, input.value.as_str());
    match input.kind {
        EventKind::Photo => {
            session.set(format!("{}_file_id", key), input.value.as_str());
        }
        EventKind::Document => {
            session.set(format!("{}_file_id", key), input.value.as_str());
            let name = input.file_name.clone().unwrap_or_default();
            session.set(format!("{}_file_name", key), Value::String(name));
        }
        _ => {}
    }
}

impl std::fmt::Debug for FlowEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowEngine")
            .field("capabilities", &self.capabilities)
            .field("cached_conditions", &self.conditions.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use flowbot_core::{
        ChatTarget, FlowbotConfig, InputKind, MessageId, MessageRenderer, Prompt, RenderError,
        User, ValidationRule,
    };
    use flowbot_session::SessionKey;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct NullRenderer;

    #[async_trait]
    impl MessageRenderer for NullRenderer {
        async fn send_text(&self, _: &ChatTarget, _: &str) -> Result<MessageId, RenderError> {
            Ok(1)
        }
        async fn send_prompt(&self, _: &ChatTarget, _: &Prompt) -> Result<MessageId, RenderError> {
            Ok(1)
        }
        async fn edit_prompt(&self, _: &ChatTarget, _: MessageId, _: &Prompt) -> Result<(), RenderError> {
            Ok(())
        }
        async fn delete_message(&self, _: &ChatTarget, _: MessageId) -> Result<(), RenderError> {
            Ok(())
        }
        async fn answer_callback(&self, _: &str, _: Option<&str>, _: bool) -> Result<(), RenderError> {
            Ok(())
        }
        fn platform_name(&self) -> &'static str {
            "null"
        }
    }

    fn ctx() -> EventContext {
        let query = flowbot_core::CallbackQuery {
            id: "cb".to_string(),
            from: User::new(1),
            message: None,
            data: String::new(),
        };
        EventContext::from_callback(&query, Arc::new(NullRenderer))
    }

    fn source(flow: FlowConfig) -> Arc<dyn FlowSource> {
        let mut config = FlowbotConfig::new();
        config.add_flow(flow);
        Arc::new(config)
    }

    fn session_at(flow: &str, step: &str) -> Arc<Session> {
        Arc::new(Session::new(SessionKey::new(1, 1), None, flow, step, Duration::from_secs(60)))
    }

    fn branching_flow() -> FlowConfig {
        FlowConfig::new("f", "s1")
            .with_step(
                StepConfig::new("s1", InputKind::Any)
                    .branch(r#"input == "a""#, "s2")
                    .branch(r#"input == "b""#, "s3")
                    .next("s4"),
            )
            .with_step(StepConfig::new("s2", InputKind::Text))
            .with_step(StepConfig::new("s3", InputKind::Text))
            .with_step(StepConfig::new("s4", InputKind::Text))
    }

    #[test]
    fn test_branch_order_and_default() {
        let engine = FlowEngine::new(source(branching_flow()), Capabilities::new());
        let s = session_at("f", "s1");

        assert_eq!(engine.determine_next_step(&s, "a").as_deref(), Some("s2"));
        assert_eq!(engine.determine_next_step(&s, "b").as_deref(), Some("s3"));
        assert_eq!(engine.determine_next_step(&s, "c").as_deref(), Some("s4"));

        let missing = session_at("f", "gone");
        assert_eq!(engine.determine_next_step(&missing, "a"), None);
    }

    #[test]
    fn test_data_branches_and_custom_evaluator() {
        let flow = FlowConfig::new("f", "s1")
            .with_step(
                StepConfig::new("s1", InputKind::Text)
                    .branch(r#"data.plan == "pro""#, "pro")
                    .branch("score > 10", "high")
                    .next("basic"),
            );
        let engine = FlowEngine::new(source(flow.clone()), Capabilities::new());
        let s = session_at("f", "s1");

        // Unrecognized condition holds without an evaluator
        assert_eq!(engine.determine_next_step(&s, "x").as_deref(), Some("high"));
        s.set("plan", "pro");
        assert_eq!(engine.determine_next_step(&s, "x").as_deref(), Some("pro"));

        let caps = Capabilities::new().with_condition_evaluator(|_: &Session, _: &str| false);
        let strict = FlowEngine::new(source(flow), caps);
        assert_eq!(strict.determine_next_step(&s, "x").as_deref(), Some("basic"));
    }

    #[derive(Clone, Default)]
    struct CapturedLogs(Arc<parking_lot::Mutex<Vec<u8>>>);

    impl CapturedLogs {
        fn text(&self) -> String {
            String::from_utf8_lossy(&self.0.lock()).into_owned()
        }
    }

    impl std::io::Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for CapturedLogs {
        type Writer = CapturedLogs;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    fn warnings_during(f: impl FnOnce()) -> String {
        let logs = CapturedLogs::default();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(logs.clone())
            .with_max_level(tracing::Level::WARN)
            .with_ansi(false)
            .finish();
        tracing::subscriber::with_default(subscriber, f);
        logs.text()
    }

    #[test]
    fn test_unrecognized_condition_warns_once() {
        let flow = FlowConfig::new("f", "s1").with_step(
            StepConfig::new("s1", InputKind::Text)
                .branch("score > 10", "high")
                .next("basic"),
        );
        let engine = FlowEngine::new(source(flow.clone()), Capabilities::new());
        let s = session_at("f", "s1");

        let logs = warnings_during(|| {
            assert_eq!(engine.determine_next_step(&s, "x").as_deref(), Some("high"));
            assert_eq!(engine.determine_next_step(&s, "y").as_deref(), Some("high"));
        });
        assert!(logs.contains("WARN"));
        assert!(logs.contains("score > 10"));
        assert_eq!(logs.matches("Unrecognized condition").count(), 1);

        // An evaluator makes custom conditions legitimate
        let caps = Capabilities::new().with_condition_evaluator(|_: &Session, _: &str| true);
        let evaluated = FlowEngine::new(source(flow), caps);
        let logs = warnings_during(|| {
            evaluated.determine_next_step(&s, "x");
        });
        assert!(logs.is_empty());
    }

    #[test]
    fn test_resolve_skips() {
        let flow = FlowConfig::new("f", "a")
            .with_step(StepConfig::new("a", InputKind::Text).next("b"))
            .with_step(
                StepConfig::new("b", InputKind::Text)
                    .skip_if(r#"data.has_email == "yes""#)
                    .next("c"),
            )
            .with_step(StepConfig::new("c", InputKind::Text).skip_if(r#"data.vip == "yes""#))
            .with_step(StepConfig::new("loop", InputKind::Text).skip_if("").next("loop"));
        let engine = FlowEngine::new(source(flow), Capabilities::new());
        let s = session_at("f", "a");

        assert_eq!(engine.resolve_skips(&s, "b"), "b");
        s.set("has_email", "yes");
        assert_eq!(engine.resolve_skips(&s, "b"), "c");
        // Skipped step with nowhere to go stays put
        s.set("vip", "yes");
        assert_eq!(engine.resolve_skips(&s, "c"), "c");
        assert_eq!(engine.resolve_skips(&s, "unknown"), "unknown");
    }

    #[tokio::test]
    async fn test_process_text_input_advances() {
        let flow = FlowConfig::new("F", "A")
            .with_step(StepConfig::new("A", InputKind::Text).store_as("name").next("B"))
            .with_step(StepConfig::new("B", InputKind::Text));
        let engine = FlowEngine::new(source(flow), Capabilities::new());
        let s = session_at("F", "A");

        let outcome = engine.process_input(&ctx(), &s, &StepInput::text("Alice")).await;
        assert_eq!(outcome, StepOutcome::Continue("B".to_string()));
        assert_eq!(s.get_string("name"), "Alice");
        assert_eq!(s.history().len(), 1);
        assert_eq!(s.history()[0].step_id, "A");
        // The caller moves the session
        assert_eq!(s.step_id(), "A");
    }

    #[tokio::test]
    async fn test_process_validation_failure_leaves_state() {
        let flow = FlowConfig::new("f", "age").with_step(
            StepConfig::new("age", InputKind::Text)
                .store_as("age")
                .validation(ValidationRule::number(Some("1"), Some("120")))
                .next("done"),
        );
        let engine = FlowEngine::new(source(flow), Capabilities::new());
        let s = session_at("f", "age");

        let outcome = engine.process_input(&ctx(), &s, &StepInput::text("abc")).await;
        assert_eq!(
            outcome,
            StepOutcome::ValidationFailed("Please enter a valid number".to_string())
        );
        assert!(s.get("age").is_none());
        assert!(s.history().is_empty());

        let broken = FlowConfig::new("g", "x").with_step(
            StepConfig::new("x", InputKind::Text).validation(ValidationRule::regex("(")),
        );
        let engine = FlowEngine::new(source(broken), Capabilities::new());
        let s = session_at("g", "x");
        assert_eq!(
            engine.process_input(&ctx(), &s, &StepInput::text("abc")).await,
            StepOutcome::ValidationFailed("Validation rule configuration error".to_string())
        );
    }

    #[tokio::test]
    async fn test_process_rejects_wrong_kind_and_missing_step() {
        let engine = FlowEngine::new(source(branching_flow()), Capabilities::new());

        let s = session_at("f", "s2");
        assert_eq!(
            engine.process_input(&ctx(), &s, &StepInput::callback("a")).await,
            StepOutcome::Rejected
        );
        assert!(s.history().is_empty());

        let gone = session_at("f", "nope");
        assert_eq!(
            engine.process_input(&ctx(), &gone, &StepInput::text("a")).await,
            StepOutcome::Terminal
        );
        let unknown_flow = session_at("nope", "s1");
        assert_eq!(
            engine.process_input(&ctx(), &unknown_flow, &StepInput::text("a")).await,
            StepOutcome::Terminal
        );
    }

    #[tokio::test]
    async fn test_completion_handler_owns_transition() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let caps = Capabilities::new().with_step_handler("finish", move |_ctx, session: Arc<Session>| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                session.complete();
                Ok(())
            }
        });
        let flow = FlowConfig::new("f", "a").with_step(
            StepConfig::new("a", InputKind::Callback)
                .store_as("choice")
                .on_complete("finish")
                .next("b"),
        );
        let engine = FlowEngine::new(source(flow), caps);
        let s = session_at("f", "a");

        let outcome = engine.process_input(&ctx(), &s, &StepInput::callback("yes")).await;
        assert_eq!(outcome, StepOutcome::HandledByCallback);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(s.get_string("choice"), "yes");
        assert_eq!(s.state(), flowbot_session::SessionState::Completed);
    }

    #[tokio::test]
    async fn test_failing_handler_is_logged_not_propagated() {
        let caps = Capabilities::new().with_step_handler("boom", |_ctx, _session| async {
            Err(anyhow::anyhow!("boom"))
        });
        let flow = FlowConfig::new("f", "a")
            .with_step(StepConfig::new("a", InputKind::Text).on_complete("boom"));
        let engine = FlowEngine::new(source(flow), caps);
        let s = session_at("f", "a");

        assert_eq!(
            engine.process_input(&ctx(), &s, &StepInput::text("x")).await,
            StepOutcome::HandledByCallback
        );
        // Unregistered handler names are a no-op
        assert!(engine.execute_step_handler(&ctx(), &s, "missing").await.is_ok());
    }

    #[tokio::test]
    async fn test_media_storage_and_history() {
        let flow = FlowConfig::new("f", "pic")
            .with_step(StepConfig::new("pic", InputKind::Photo).store_as("avatar").next("doc"))
            .with_step(StepConfig::new("doc", InputKind::Document).store_as("cv"));
        let engine = FlowEngine::new(source(flow), Capabilities::new());
        let s = session_at("f", "pic");

        let outcome = engine.process_input(&ctx(), &s, &StepInput::photo("ph-9")).await;
        assert_eq!(outcome, StepOutcome::Continue("doc".to_string()));
        assert_eq!(s.get_string("avatar"), "ph-9");
        assert_eq!(s.get_string("avatar_file_id"), "ph-9");

        s.set_step("doc");
        let doc = StepInput::document("d-1", Some("cv.pdf".to_string()));
        assert_eq!(engine.process_input(&ctx(), &s, &doc).await, StepOutcome::Stay);
        assert_eq!(s.get_string("cv_file_id"), "d-1");
        assert_eq!(s.get_string("cv_file_name"), "cv.pdf");

        let history: Vec<String> = s.history().into_iter().map(|h| h.input).collect();
        assert_eq!(history, vec!["photo:ph-9", "doc:d-1"]);
    }

    #[tokio::test]
    async fn test_keyboard_provider_lookup() {
        let caps = Capabilities::new().with_keyboard_provider("items", |_ctx, _session| async {
            vec![ButtonData::new("One", "1"), ButtonData::new("Two", "2")]
        });
        let engine = FlowEngine::new(source(branching_flow()), caps);
        let s = session_at("f", "s1");

        assert_eq!(engine.dynamic_keyboard_data(&ctx(), &s, "items").await.len(), 2);
        assert!(engine.dynamic_keyboard_data(&ctx(), &s, "none").await.is_empty());
    }

    #[test]
    fn test_set_source_swaps_definitions() {
        let engine = FlowEngine::new(source(branching_flow()), Capabilities::new());
        assert!(engine.flow("f").is_some());

        engine.set_source(source(FlowConfig::new("g", "x")));
        assert!(engine.flow("f").is_none());
        assert!(engine.flow("g").is_some());
    }
}
