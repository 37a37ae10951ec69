//! Session Manager: per-downstream-session identity, TTL sweep, and
//! progress-notification fan-out.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::mpsc;

/// A progress/log notification relayed from an upstream to the session
/// that originated the call.
#[derive(Debug, Clone)]
pub struct StreamEvent {
    pub method: String,
    pub params: Value,
}

struct SessionState {
    created_at: Instant,
    last_activity: Instant,
    ttl: Duration,
    capabilities: Value,
    streams: HashMap<String, mpsc::UnboundedSender<StreamEvent>>,
}

/// Owns every live session. Sessions are cheap, opaque identifiers; nodes
/// never hold a reference back to a session.
#[derive(Default)]
pub struct SessionManager {
    sessions: Mutex<HashMap<String, SessionState>>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// `createSession(id?)`. Generates an opaque id if none is supplied.
    pub fn create_session(&self, id: Option<String>, ttl: Duration, capabilities: Value) -> String {
        let id = id.unwrap_or_else(new_session_id);
        let now = Instant::now();
        self.sessions.lock().expect("session table lock poisoned").insert(
            id.clone(),
            SessionState {
                created_at: now,
                last_activity: now,
                ttl,
                capabilities,
                streams: HashMap::new(),
            },
        );
        id
    }

    /// `touch(id)`. Returns whether the session is still live.
    pub fn touch(&self, id: &str) -> bool {
        let mut sessions = self.sessions.lock().expect("session table lock poisoned");
        match sessions.get_mut(id) {
            Some(session) if session.last_activity.elapsed() <= session.ttl => {
                session.last_activity = Instant::now();
                true
            }
            Some(_) => {
                sessions.remove(id);
                false
            }
            None => false,
        }
    }

    pub fn capabilities(&self, id: &str) -> Option<Value> {
        self.sessions
            .lock()
            .expect("session table lock poisoned")
            .get(id)
            .map(|s| s.capabilities.clone())
    }

    /// `destroy(id)`. Releases every outstanding stream belonging to the
    /// session by simply dropping their senders.
    pub fn destroy(&self, id: &str) {
        self.sessions.lock().expect("session table lock poisoned").remove(id);
    }

    /// `sweep()`. Destroys sessions whose last activity is older than
    /// their TTL. Intended to be called periodically from a background
    /// task.
    pub fn sweep(&self) -> usize {
        let mut sessions = self.sessions.lock().expect("session table lock poisoned");
        let before = sessions.len();
        sessions.retain(|_, session| session.last_activity.elapsed() <= session.ttl);
        before - sessions.len()
    }

    /// Register an outgoing stream (e.g. the SSE channel backing a
    /// downstream `GET /mcp`) under `stream_id` for the named session.
    pub fn register_stream(&self, session_id: &str, stream_id: &str) -> Option<mpsc::UnboundedReceiver<StreamEvent>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut sessions = self.sessions.lock().expect("session table lock poisoned");
        let session = sessions.get_mut(session_id)?;
        session.streams.insert(stream_id.to_string(), tx);
        Some(rx)
    }

    pub fn unregister_stream(&self, session_id: &str, stream_id: &str) {
        if let Some(session) = self
            .sessions
            .lock()
            .expect("session table lock poisoned")
            .get_mut(session_id)
        {
            session.streams.remove(stream_id);
        }
    }

    /// Deliver a progress/log notification to every outgoing stream of a
    /// session. Silently dropped if the session no longer exists (spec
    /// §4.5 "notifications arriving after the session has been destroyed
    /// are dropped silently").
    pub fn deliver(&self, session_id: &str, event: StreamEvent) {
        let sessions = self.sessions.lock().expect("session table lock poisoned");
        let Some(session) = sessions.get(session_id) else {
            return;
        };
        for sender in session.streams.values() {
            let _ = sender.send(event.clone());
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().expect("session table lock poisoned").len()
    }

    pub fn created_at(&self, id: &str) -> Option<Instant> {
        self.sessions
            .lock()
            .expect("session table lock poisoned")
            .get(id)
            .map(|s| s.created_at)
    }
}

fn new_session_id() -> String {
    use std::sync::atomic::{AtomicU64, Ordering};
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let pid = std::process::id();
    let seq = COUNTER.fetch_add(1, Ordering::Relaxed);
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    format!("sess-{pid:x}-{nanos:x}-{seq:x}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn touch_keeps_a_fresh_session_alive() {
        let manager = SessionManager::new();
        let id = manager.create_session(None, Duration::from_secs(60), Value::Null);
        assert!(manager.touch(&id));
    }

    #[test]
    fn touch_on_unknown_session_returns_false() {
        let manager = SessionManager::new();
        assert!(!manager.touch("does-not-exist"));
    }

    #[test]
    fn destroy_removes_the_session() {
        let manager = SessionManager::new();
        let id = manager.create_session(None, Duration::from_secs(60), Value::Null);
        manager.destroy(&id);
        assert!(!manager.touch(&id));
    }

    #[test]
    fn sweep_evicts_expired_sessions_only() {
        let manager = SessionManager::new();
        let fresh = manager.create_session(None, Duration::from_secs(60), Value::Null);
        let stale = manager.create_session(None, Duration::from_millis(0), Value::Null);
        std::thread::sleep(Duration::from_millis(5));
        let evicted = manager.sweep();
        assert_eq!(evicted, 1);
        assert!(manager.touch(&fresh));
        assert!(!manager.touch(&stale));
    }

    #[test]
    fn delivery_to_destroyed_session_is_a_noop() {
        let manager = SessionManager::new();
        manager.deliver(
            "ghost",
            StreamEvent {
                method: "notifications/progress".to_string(),
                params: Value::Null,
            },
        );
    }

    #[test]
    fn generated_session_ids_are_unique() {
        let manager = SessionManager::new();
        let a = manager.create_session(None, Duration::from_secs(60), Value::Null);
        let b = manager.create_session(None, Duration::from_secs(60), Value::Null);
        assert_ne!(a, b);
    }
}
