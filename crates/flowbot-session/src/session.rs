//! A single user's progress through a flow

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Composite session key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionKey {
    pub user_id: i64,
    pub chat_id: i64,
}

impl SessionKey {
    pub fn new(user_id: i64, chat_id: i64) -> Self {
        Self { user_id, chat_id }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.user_id, self.chat_id)
    }
}

/// Descriptive session state; transitions are driven by callers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    #[default]
    Waiting,
    Completed,
    Cancelled,
}

/// One completed step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub step_id: String,
    pub input: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug)]
struct SessionInner {
    flow_id: String,
    step_id: String,
    state: SessionState,
    data: HashMap<String, Value>,
    history: Vec<HistoryEntry>,
    keyboard_message_id: Option<i32>,
    updated_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

/// Conversation session
///
/// Field access goes through a per-session lock. The separate turn lock
/// (`lock_turn`) serializes whole event-handling sequences for the session.
#[derive(Debug)]
pub struct Session {
    id: Uuid,
    key: SessionKey,
    topic_id: Option<i32>,
    created_at: DateTime<Utc>,
    inner: RwLock<SessionInner>,
    turn: tokio::sync::Mutex<()>,
}

/// `now + ttl`, saturating at the latest representable time
fn deadline(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|ttl| now.checked_add_signed(ttl))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

impl Session {
    pub fn new(
        key: SessionKey,
        topic_id: Option<i32>,
        flow_id: impl Into<String>,
        step_id: impl Into<String>,
        ttl: Duration,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            key,
            topic_id,
            created_at: now,
            inner: RwLock::new(SessionInner {
                flow_id: flow_id.into(),
                step_id: step_id.into(),
                state: SessionState::Waiting,
                data: HashMap::new(),
                history: Vec::new(),
                keyboard_message_id: None,
                updated_at: now,
                expires_at: deadline(now, ttl),
            }),
            turn: tokio::sync::Mutex::new(()),
        }
    }

    /// Unique id of this session instance
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn key(&self) -> SessionKey {
        self.key
    }

    pub fn user_id(&self) -> i64 {
        self.key.user_id
    }

    pub fn chat_id(&self) -> i64 {
        self.key.chat_id
    }

    /// Forum topic the session runs in
    pub fn topic_id(&self) -> Option<i32> {
        self.topic_id
    }

    pub fn flow_id(&self) -> String {
        self.inner.read().flow_id.clone()
    }

    pub fn step_id(&self) -> String {
        self.inner.read().step_id.clone()
    }

    /// Move to another step. Use `SessionStore::change_step` to fire hooks.
    pub fn set_step(&self, step_id: impl Into<String>) {
        let mut inner = self.inner.write();
        inner.step_id = step_id.into();
        inner.updated_at = Utc::now();
    }

    pub fn state(&self) -> SessionState {
        self.inner.read().state
    }

    pub fn set_state(&self, state: SessionState) {
        let mut inner = self.inner.write();
        inner.state = state;
        inner.updated_at = Utc::now();
    }

    pub fn complete(&self) {
        self.set_state(SessionState::Completed);
    }

    pub fn cancel(&self) {
        self.set_state(SessionState::Cancelled);
    }

    /// Store a value under `key`, replacing any previous value
    pub fn set(&self, key: impl Into<String>, value: impl Into<Value>) {
        let mut inner = self.inner.write();
        inner.data.insert(key.into(), value.into());
        inner.updated_at = Utc::now();
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.inner.read().data.get(key).cloned()
    }

    /// String value, or empty when missing or not a string
    pub fn get_string(&self, key: &str) -> String {
        match self.inner.read().data.get(key) {
            Some(Value::String(s)) => s.clone(),
            _ => String::new(),
        }
    }

    /// Integer value, truncating floats; 0 when missing or not a number
    pub fn get_int(&self, key: &str) -> i64 {
        match self.inner.read().data.get(key) {
            Some(Value::Number(n)) => n
                .as_i64()
                .or_else(|| n.as_f64().map(|f| f as i64))
                .unwrap_or(0),
            _ => 0,
        }
    }

    pub fn remove(&self, key: &str) -> Option<Value> {
        let mut inner = self.inner.write();
        let removed = inner.data.remove(key);
        if removed.is_some() {
            inner.updated_at = Utc::now();
        }
        removed
    }

    /// Copy of all collected data
    pub fn data_snapshot(&self) -> HashMap<String, Value> {
        self.inner.read().data.clone()
    }

    /// Record a completed step
    pub fn add_history(&self, step_id: impl Into<String>, input: impl Into<String>) {
        let now = Utc::now();
        let mut inner = self.inner.write();
        inner.history.push(HistoryEntry {
            step_id: step_id.into(),
            input: input.into(),
            timestamp: now,
        });
        inner.updated_at = now;
    }

    pub fn history(&self) -> Vec<HistoryEntry> {
        self.inner.read().history.clone()
    }

    /// Step of the second-to-last history entry
    pub fn previous_step(&self) -> Option<String> {
        let inner = self.inner.read();
        let len = inner.history.len();
        if len >= 2 {
            Some(inner.history[len - 2].step_id.clone())
        } else {
            None
        }
    }

    /// Message carrying the current prompt, edited in place on redisplay
    pub fn keyboard_message_id(&self) -> Option<i32> {
        self.inner.read().keyboard_message_id
    }

    pub fn set_keyboard_message_id(&self, message_id: Option<i32>) {
        self.inner.write().keyboard_message_id = message_id;
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.inner.read().updated_at
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.inner.read().expires_at
    }

    pub fn set_expires_at(&self, expires_at: DateTime<Utc>) {
        self.inner.write().expires_at = expires_at;
    }

    /// Push expiry to `now + ttl`
    pub fn refresh(&self, ttl: Duration) {
        let now = Utc::now();
        let mut inner = self.inner.write();
        inner.expires_at = deadline(now, ttl);
        inner.updated_at = now;
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() > self.inner.read().expires_at
    }

    /// Hold for the duration of one event-handling sequence
    pub async fn lock_turn(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.turn.lock().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn session() -> Session {
        Session::new(SessionKey::new(1, 2), None, "f", "a", Duration::from_secs(60))
    }

    #[test]
    fn test_typed_getters() {
        let s = session();
        s.set("name", "Alice");
        s.set("age", 42);
        s.set("score", json!(7.9));
        s.set("flag", true);

        assert_eq!(s.get_string("name"), "Alice");
        assert_eq!(s.get_string("age"), "");
        assert_eq!(s.get_string("missing"), "");
        assert_eq!(s.get_int("age"), 42);
        assert_eq!(s.get_int("score"), 7);
        assert_eq!(s.get_int("flag"), 0);
        assert_eq!(s.get_int("name"), 0);

        assert_eq!(s.remove("name"), Some(json!("Alice")));
        assert!(s.get("name").is_none());
        assert_eq!(s.data_snapshot().len(), 3);
    }

    #[test]
    fn test_previous_step() {
        let s = session();
        assert_eq!(s.previous_step(), None);

        s.add_history("s1", "x");
        assert_eq!(s.previous_step(), None);

        s.add_history("s2", "y");
        s.add_history("s3", "z");
        assert_eq!(s.previous_step().as_deref(), Some("s2"));
        assert_eq!(s.history().len(), 3);
        assert_eq!(s.history()[2].input, "z");
    }

    #[test]
    fn test_expiry_and_refresh() {
        let s = session();
        assert!(!s.is_expired());

        s.set_expires_at(Utc::now() - chrono::Duration::seconds(1));
        assert!(s.is_expired());

        s.refresh(Duration::from_secs(30));
        assert!(!s.is_expired());
        assert!(s.expires_at() > Utc::now());
    }

    #[test]
    fn test_huge_ttl_saturates() {
        let s = Session::new(SessionKey::new(1, 2), None, "f", "a", Duration::MAX);
        assert!(!s.is_expired());
    }

    #[test]
    fn test_state_transitions() {
        let s = session();
        assert_eq!(s.state(), SessionState::Waiting);
        s.complete();
        assert_eq!(s.state(), SessionState::Completed);
        s.cancel();
        assert_eq!(s.state(), SessionState::Cancelled);
    }

    #[test]
    fn test_key_display() {
        assert_eq!(SessionKey::new(-100, 7).to_string(), "-100:7");
        assert_ne!(SessionKey::new(1, 23), SessionKey::new(12, 3));
    }
}
