//! flowbot Router - inbound event dispatch
//!
//! The router authenticates every event, then sends it to exactly one
//! destination:
//! - Commands to registered or configured command routes
//! - Callbacks to navigation, exact, prefix, session, or acknowledge-only
//! - Text to the live session, which drops it when the current step takes
//!   other input; without a session, to the default message handler
//! - Photos and documents to the live session when its step accepts them,
//!   else to the default handler for that kind
//!
//! Conversation input runs under the session's turn lock, so events for one
//! `(user, chat)` are applied one at a time.

pub mod display;
pub mod handler;
pub mod router;

pub use display::{PromptDisplay, StepDisplay};
pub use handler::{AuthPredicate, EventHandler, HandlerRegistry};
pub use router::Router;
