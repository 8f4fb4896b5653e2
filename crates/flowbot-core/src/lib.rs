// flowbot Core - Foundation types and traits for flowbot
//
// Flow and step definitions, configuration loading, the inbound event model
// and the renderer trait the other flowbot crates build on.

pub mod config;
pub mod error;
pub mod event;
pub mod flow;
pub mod renderer;

// Re-export core types
pub use config::{
    BotConfig, BuiltinAction, CallbackConfig, CommandConfig, FlowSource, FlowbotConfig,
};
pub use error::{FlowbotError, FlowbotResult};
pub use event::{
    CallbackOrigin, CallbackQuery, ChatTarget, CommandInvocation, Document, EventContext,
    EventKind, IncomingMessage, MessageId, PhotoSize, Update, User,
};
pub use flow::{
    BranchConfig, ButtonConfig, FlowConfig, InputKind, KeyboardConfig, StepConfig,
    ValidationRule, ValidationType,
};
pub use renderer::{
    Button, ButtonAction, ButtonData, Keyboard, KeyboardBuilder, MessageRenderer, Prompt, RenderError,
    CALLBACK_BACK, CALLBACK_CANCEL, CALLBACK_FLOW_PREFIX, CALLBACK_MAIN_MENU,
};
