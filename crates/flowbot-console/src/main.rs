//! flowbot console
//!
//! Loads a bot configuration and drives the router from stdin, printing bot
//! output to stdout. Lines starting with `/` are commands, `!data` presses a
//! button on the last prompt, `:photo <id>` and `:doc <id> [name]` send
//! media, and anything else is text.

mod cli;
mod renderer;

use std::sync::Arc;

use anyhow::Context as _;
use clap::Parser;
use flowbot_core::{
    Button, ButtonData, ChatTarget, EventContext, FlowbotConfig, Keyboard, Prompt, User,
    CALLBACK_FLOW_PREFIX,
};
use flowbot_engine::{Capabilities, FlowEngine};
use flowbot_router::{HandlerRegistry, Router};
use flowbot_session::{Session, SessionHooks, SessionStore};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::cli::{Cli, Input};
use crate::renderer::ConsoleRenderer;

const HELP_TEXT: &str = "Commands start with '/', '!data' presses a button, \
':photo <id>' and ':doc <id> [name]' send files, ':quit' exits.";

fn init_tracing(debug: bool) {
    let default = if debug { "flowbot=debug" } else { "flowbot=info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn session_hooks() -> SessionHooks {
    SessionHooks::new()
        .on_start(|session| {
            info!(session = %session.id(), flow = %session.flow_id(), "Conversation started");
        })
        .on_end(|session| {
            info!(session = %session.id(), flow = %session.flow_id(), "Conversation ended");
        })
        .on_step_change(|session, from, to| {
            debug!(session = %session.id(), "Step {} -> {}", from, to);
        })
}

/// Handlers referenced by the demo configuration
fn demo_capabilities(store: Arc<SessionStore>) -> Capabilities {
    Capabilities::new()
        .with_step_handler("finish_signup", move |ctx: EventContext, session: Arc<Session>| {
            let store = Arc::clone(&store);
            async move {
                let summary = format!(
                    "Welcome {}! Plan: {}, email: {}",
                    session.get_string("name"),
                    session.get_string("plan"),
                    session.get_string("email"),
                );
                session.complete();
                store.end(session.user_id(), session.chat_id());
                ctx.reply(&summary).await?;
                Ok(())
            }
        })
        .with_keyboard_provider("plans", |_ctx, _session| async {
            vec![
                ButtonData::new("Free", "free"),
                ButtonData::new("Pro", "pro"),
                ButtonData::new("Team", "team"),
            ]
        })
        .with_validator("adult", |input: &str, _session: &Session| {
            match input.trim().parse::<u32>() {
                Ok(age) if age >= 18 => Ok(()),
                Ok(_) => Err("You must be 18 or older".to_string()),
                Err(_) => Err("Please enter your age in years".to_string()),
            }
        })
}

async fn show_main_menu(ctx: EventContext, flows: Arc<Vec<String>>) -> anyhow::Result<()> {
    let buttons = flows
        .iter()
        .map(|id| Button::callback(id.as_str(), format!("{}{}", CALLBACK_FLOW_PREFIX, id)))
        .collect();
    let prompt = Prompt::new("Main menu").with_keyboard(Keyboard::builder().grid(buttons, 2).build());
    ctx.renderer().send_prompt(&ctx.chat, &prompt).await?;
    Ok(())
}

fn demo_handlers(flows: Arc<Vec<String>>) -> HandlerRegistry {
    HandlerRegistry::new()
        .with_handler("menu", move |ctx| show_main_menu(ctx, Arc::clone(&flows)))
        .with_handler("help", |ctx: EventContext| async move {
            ctx.reply(HELP_TEXT).await?;
            Ok(())
        })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.debug);

    let mut config = FlowbotConfig::from_file(&cli.config)
        .with_context(|| format!("Failed to load config {}", cli.config.display()))?;
    if let Some(ref dir) = cli.flows_dir {
        config.load_flows_dir(dir)?;
    }
    config.apply_env_overrides();
    if cli.debug {
        config.bot.debug = true;
    }
    config.validate()?;

    let mut flow_ids: Vec<String> = config.flows.keys().cloned().collect();
    flow_ids.sort();
    let flow_ids = Arc::new(flow_ids);
    let bot = config.bot.clone();
    info!("Loaded {} flows from {}", flow_ids.len(), cli.config.display());

    let store = Arc::new(SessionStore::new(bot.default_ttl()).with_hooks(session_hooks()));
    let engine = Arc::new(FlowEngine::new(
        Arc::new(config),
        demo_capabilities(Arc::clone(&store)),
    ));
    let renderer = Arc::new(ConsoleRenderer::new());
    let router = Router::new(Arc::clone(&store), engine, renderer.clone());

    router.configure(&bot, &demo_handlers(Arc::clone(&flow_ids)));
    if !cli.allow.is_empty() {
        let allowed = cli.allow.clone();
        router.set_auth(move |user_id, _username| allowed.contains(&user_id));
    }

    let shutdown = CancellationToken::new();
    let cleanup = store.spawn_cleanup(bot.cleanup_interval(), shutdown.clone());

    let mut user = User::new(cli.user);
    user.username = cli.username.clone();
    let chat = ChatTarget::new(cli.chat);
    println!("{}", HELP_TEXT);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut message_id = 0;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
            line = lines.next_line() => {
                let Some(line) = line? else {
                    break;
                };
                let Some(input) = Input::parse(&line) else {
                    continue;
                };
                message_id += 1;
                let Some(update) = input.into_update(&user, chat, message_id, renderer.last_prompt()) else {
                    break;
                };
                router.handle_update(update).await;
            }
        }
    }

    shutdown.cancel();
    cleanup.await?;
    info!(sessions = store.count(), "Console stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowbot_core::{FlowSource, InputKind};
    use flowbot_session::SessionKey;
    use std::time::Duration;

    const DEMO_CONFIG: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/../../demos/signup.yaml");

    #[test]
    fn test_demo_config_is_valid() {
        let config = FlowbotConfig::from_file(DEMO_CONFIG).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.bot.cleanup_interval(), Duration::from_secs(60));
        assert_eq!(config.bot.main_menu_id.as_deref(), Some("menu"));

        let signup = config.flow("signup").unwrap();
        assert_eq!(signup.ttl(config.default_ttl()), Duration::from_secs(300));
        let seats = signup.step("seats").unwrap().validation.clone().unwrap();
        assert_eq!(seats.min.as_deref(), Some("2"));
        assert_eq!(
            config.flow("feedback").unwrap().step("thanks").unwrap().input_type,
            InputKind::None
        );
    }

    #[test]
    fn test_adult_validator() {
        let store = Arc::new(SessionStore::default());
        let capabilities = demo_capabilities(store);
        let validator = capabilities.validator("adult").unwrap();
        let session = Session::new(SessionKey::new(1, 1), None, "signup", "age", Duration::from_secs(60));

        assert!(validator.validate("30", &session).is_ok());
        assert_eq!(
            validator.validate("12", &session),
            Err("You must be 18 or older".to_string())
        );
        assert!(validator.validate("old", &session).is_err());
    }
}
