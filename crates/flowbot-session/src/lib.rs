//! flowbot Session - conversation session store
//!
//! Live sessions are indexed by `(user, chat)` in a sharded concurrent map.
//! Each session guards its own fields, so mutating one conversation never
//! blocks index operations on another.
//!
//! ## Lifecycle
//!
//! - `SessionStore::start` ends any previous session for the key first
//! - `SessionStore::get` ends sessions whose TTL has passed
//! - `SessionStore::spawn_cleanup` sweeps expired sessions on an interval
//!
//! Lifecycle hooks run on the calling task and never under the index lock.

pub mod session;
pub mod store;

pub use session::{HistoryEntry, Session, SessionKey, SessionState};
pub use store::{SessionHooks, SessionStore, DEFAULT_CLEANUP_INTERVAL, DEFAULT_SESSION_TTL};
