//! Step prompt display

use std::sync::Arc;

use async_trait::async_trait;
use flowbot_core::{
    Button, ButtonConfig, ButtonData, ChatTarget, EventContext, FlowbotResult, Keyboard,
    KeyboardConfig, Prompt,
};
use flowbot_engine::FlowEngine;
use flowbot_session::Session;
use tracing::debug;

/// Shows the prompt of a session's current step
#[async_trait]
pub trait StepDisplay: Send + Sync {
    async fn display(&self, ctx: &EventContext, session: &Arc<Session>) -> FlowbotResult<()>;
}

/// Default display: renders the step prompt and keyboard through the
/// event's renderer, editing the session's prompt message when it has one
pub struct PromptDisplay {
    engine: Arc<FlowEngine>,
}

impl PromptDisplay {
    pub fn new(engine: Arc<FlowEngine>) -> Self {
        Self { engine }
    }

    /// Prompt for the current step; `None` when the step no longer exists
    pub async fn build_prompt(&self, ctx: &EventContext, session: &Arc<Session>) -> Option<Prompt> {
        let step = self.engine.current_step(session)?;

        let mut prompt = Prompt::new(step.prompt_text).with_parse_mode(step.parse_mode);
        if let Some(ref keyboard) = step.keyboard {
            prompt = prompt.with_keyboard(self.build_keyboard(ctx, session, keyboard).await);
        }
        Some(prompt)
    }

    /// Static rows, then provider buttons in a grid, then navigation rows
    async fn build_keyboard(
        &self,
        ctx: &EventContext,
        session: &Arc<Session>,
        config: &KeyboardConfig,
    ) -> Keyboard {
        let mut builder = Keyboard::builder();

        for row in &config.buttons {
            builder = builder.row(row.iter().map(static_button).collect());
        }

        if let Some(provider) = config.provider.as_deref().filter(|p| !p.is_empty()) {
            let prefix = config.callback_prefix.as_deref().unwrap_or("");
            let buttons: Vec<Button> = self
                .engine
                .dynamic_keyboard_data(ctx, session, provider)
                .await
                .into_iter()
                .map(|data| dynamic_button(data, prefix))
                .collect();
            builder = builder.grid(buttons, config.columns);
        }

        if config.add_back {
            builder = builder.back(config.back_text.as_deref());
        }
        if config.add_main {
            builder = builder.main_menu(config.main_text.as_deref());
        }

        builder.build()
    }
}

fn static_button(config: &ButtonConfig) -> Button {
    match config.url.as_deref().filter(|u| !u.is_empty()) {
        Some(url) => Button::url(&config.text, url),
        None => Button::callback(&config.text, config.callback.as_deref().unwrap_or("")),
    }
}

fn dynamic_button(data: ButtonData, prefix: &str) -> Button {
    match data.url {
        Some(url) => Button::url(data.text, url),
        None => Button::callback(data.text, format!("{}{}", prefix, data.callback)),
    }
}

#[async_trait]
impl StepDisplay for PromptDisplay {
    async fn display(&self, ctx: &EventContext, session: &Arc<Session>) -> FlowbotResult<()> {
        let Some(prompt) = self.build_prompt(ctx, session).await else {
            debug!(
                flow = %session.flow_id(),
                step = %session.step_id(),
                "No step to display"
            );
            return Ok(());
        };

        let target = ChatTarget::with_topic(session.chat_id(), session.topic_id());
        let renderer = ctx.renderer();

        match session.keyboard_message_id() {
            Some(message_id) => {
                renderer.edit_prompt(&target, message_id, &prompt).await?;
            }
            None => {
                let message_id = renderer.send_prompt(&target, &prompt).await?;
                session.set_keyboard_message_id(Some(message_id));
            }
        }

        Ok(())
    }
}
