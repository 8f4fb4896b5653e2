//! Session store
//!
//! Owns the `(user, chat) -> session` index. Expiry is enforced lazily on
//! `get` and eagerly by `cleanup`; both use `Session::is_expired`.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::session::{Session, SessionKey};

/// TTL used when the store is created with a zero TTL
pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(30 * 60);

/// Sweep interval used when `spawn_cleanup` gets a zero interval
pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(5 * 60);

type SessionHook = Arc<dyn Fn(&Session) + Send + Sync>;
type StepChangeHook = Arc<dyn Fn(&Session, &str, &str) + Send + Sync>;

/// Lifecycle callbacks
///
/// Hooks run synchronously on the task that triggered them; keep them short.
#[derive(Clone, Default)]
pub struct SessionHooks {
    on_start: Option<SessionHook>,
    on_end: Option<SessionHook>,
    on_step_change: Option<StepChangeHook>,
}

impl SessionHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_start(mut self, hook: impl Fn(&Session) + Send + Sync + 'static) -> Self {
        self.on_start = Some(Arc::new(hook));
        self
    }

    pub fn on_end(mut self, hook: impl Fn(&Session) + Send + Sync + 'static) -> Self {
        self.on_end = Some(Arc::new(hook));
        self
    }

    /// Called with `(session, old_step, new_step)`
    pub fn on_step_change(
        mut self,
        hook: impl Fn(&Session, &str, &str) + Send + Sync + 'static,
    ) -> Self {
        self.on_step_change = Some(Arc::new(hook));
        self
    }
}

impl std::fmt::Debug for SessionHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHooks")
            .field("on_start", &self.on_start.is_some())
            .field("on_end", &self.on_end.is_some())
            .field("on_step_change", &self.on_step_change.is_some())
            .finish()
    }
}

/// Concurrent index of live sessions
#[derive(Debug)]
pub struct SessionStore {
    sessions: DashMap<SessionKey, Arc<Session>>,
    default_ttl: Duration,
    hooks: SessionHooks,
}

impl SessionStore {
    /// Create a store; a zero `default_ttl` falls back to 30 minutes
    pub fn new(default_ttl: Duration) -> Self {
        let default_ttl = if default_ttl.is_zero() {
            DEFAULT_SESSION_TTL
        } else {
            default_ttl
        };
        Self {
            sessions: DashMap::new(),
            default_ttl,
            hooks: SessionHooks::default(),
        }
    }

    /// Install lifecycle hooks
    pub fn with_hooks(mut self, hooks: SessionHooks) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Start a new session, ending any existing one for the key first.
    ///
    /// A zero `ttl` uses the store default.
    pub fn start(
        &self,
        user_id: i64,
        chat_id: i64,
        topic_id: Option<i32>,
        flow_id: &str,
        initial_step: &str,
        ttl: Duration,
    ) -> Arc<Session> {
        let ttl = if ttl.is_zero() { self.default_ttl } else { ttl };
        let key = SessionKey::new(user_id, chat_id);

        if let Some((_, previous)) = self.sessions.remove(&key) {
            self.fire_end(&previous);
        }

        let session = Arc::new(Session::new(key, topic_id, flow_id, initial_step, ttl));

        // A concurrent start may have slipped in between remove and insert
        if let Some(displaced) = self.sessions.insert(key, Arc::clone(&session)) {
            self.fire_end(&displaced);
        }

        info!(
            session = %session.id(),
            user = user_id,
            chat = chat_id,
            flow = %flow_id,
            step = %initial_step,
            "Session started"
        );

        if let Some(ref hook) = self.hooks.on_start {
            hook(&session);
        }

        session
    }

    /// Live session for the key. Expired sessions are ended and not returned.
    pub fn get(&self, user_id: i64, chat_id: i64) -> Option<Arc<Session>> {
        let key = SessionKey::new(user_id, chat_id);
        let session = self.sessions.get(&key).map(|entry| Arc::clone(entry.value()))?;

        if session.is_expired() {
            debug!(session = %session.id(), key = %key, "Session expired on read");
            self.remove_exact(&key, &session);
            return None;
        }

        Some(session)
    }

    /// Remove the session for the key, firing the end hook
    pub fn end(&self, user_id: i64, chat_id: i64) -> Option<Arc<Session>> {
        let key = SessionKey::new(user_id, chat_id);
        let (_, session) = self.sessions.remove(&key)?;
        self.fire_end(&session);
        Some(session)
    }

    /// Move the live session to `new_step`; no-op without one
    pub fn change_step(&self, user_id: i64, chat_id: i64, new_step: &str) {
        let Some(session) = self.get(user_id, chat_id) else {
            return;
        };

        let old_step = session.step_id();
        session.set_step(new_step);
        self.step_changed(&session, &old_step, new_step);
    }

    /// Move `session` to `new_step` only while it is still the live session
    /// for its key. Returns false, leaving everything untouched, once it has
    /// been ended or replaced.
    pub fn change_step_for(&self, session: &Arc<Session>, new_step: &str) -> bool {
        if session.is_expired() {
            return false;
        }

        let old_step = {
            // Holding the entry keeps `start`/`end` from swapping it out
            let Some(entry) = self.sessions.get(&session.key()) else {
                return false;
            };
            if !Arc::ptr_eq(entry.value(), session) {
                return false;
            }
            let old_step = session.step_id();
            session.set_step(new_step);
            old_step
        };

        self.step_changed(session, &old_step, new_step);
        true
    }

    fn step_changed(&self, session: &Session, old_step: &str, new_step: &str) {
        debug!(
            session = %session.id(),
            from = %old_step,
            to = %new_step,
            "Session step changed"
        );

        if let Some(ref hook) = self.hooks.on_step_change {
            hook(session, old_step, new_step);
        }
    }

    /// End every expired session, returning how many were removed
    pub fn cleanup(&self) -> usize {
        let expired: Vec<(SessionKey, Arc<Session>)> = self
            .sessions
            .iter()
            .filter(|entry| entry.value().is_expired())
            .map(|entry| (*entry.key(), Arc::clone(entry.value())))
            .collect();

        expired
            .iter()
            .filter(|(key, session)| self.remove_exact(key, session))
            .count()
    }

    /// Run `cleanup` every `interval` until `shutdown` is cancelled.
    ///
    /// Live sessions are left in place on shutdown.
    pub fn spawn_cleanup(
        self: &Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let store = Arc::clone(self);
        let interval = if interval.is_zero() {
            DEFAULT_CLEANUP_INTERVAL
        } else {
            interval
        };

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // First tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        debug!("Session cleanup task stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        let removed = store.cleanup();
                        if removed > 0 {
                            info!(removed, remaining = store.count(), "Expired sessions cleaned up");
                        }
                    }
                }
            }
        })
    }

    /// Number of sessions in the index, expired or not
    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    /// Remove `session` only if it is still the one indexed under `key`.
    /// Exactly one caller wins, so the end hook fires once.
    fn remove_exact(&self, key: &SessionKey, session: &Arc<Session>) -> bool {
        match self
            .sessions
            .remove_if(key, |_, current| Arc::ptr_eq(current, session))
        {
            Some((_, removed)) => {
                self.fire_end(&removed);
                true
            }
            None => false,
        }
    }

    fn fire_end(&self, session: &Session) {
        info!(
            session = %session.id(),
            key = %session.key(),
            flow = %session.flow_id(),
            "Session ended"
        );
        if let Some(ref hook) = self.hooks.on_end {
            hook(session);
        }
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new(DEFAULT_SESSION_TTL)
    }
}
