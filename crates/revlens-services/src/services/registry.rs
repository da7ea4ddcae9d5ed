//! In-process session registry: the dedup set of running analyses and the
//! conversation-history cache.
//!
//! These are the only two pieces of shared mutable state outside the
//! database. Each sits behind its own mutex with short, await-free critical
//! sections. The claim handle releases on drop, so the dedup entry is freed
//! on every exit path of a background task, panics included.

use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

/// One remembered conversation turn
#[derive(Debug, Clone)]
pub struct ChatTurn {
    pub role: String,
    pub content: Value,
}

/// Process-wide registry, constructed once in `main` and handed around as an
/// `Arc`. No global singletons.
#[derive(Default)]
pub struct SessionRegistry {
    running: Mutex<HashSet<String>>,
    history: Mutex<HashMap<String, Vec<ChatTurn>>>,
}

impl SessionRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Claim a session id for a background run. Returns `None` when a run
    /// for the same id is already in flight.
    pub fn claim(self: &Arc<Self>, session_id: &str) -> Option<ClaimGuard> {
        let mut running = self.running.lock().expect("registry mutex poisoned");
        if !running.insert(session_id.to_string()) {
            return None;
        }
        Some(ClaimGuard {
            registry: Arc::clone(self),
            session_id: session_id.to_string(),
        })
    }

    /// Is a background run currently holding this id?
    pub fn is_running(&self, session_id: &str) -> bool {
        self.running
            .lock()
            .expect("registry mutex poisoned")
            .contains(session_id)
    }

    fn release(&self, session_id: &str) {
        self.running
            .lock()
            .expect("registry mutex poisoned")
            .remove(session_id);
    }

    /// Remember a conversation turn for a session
    pub fn append_turn(&self, session_id: &str, role: &str, content: Value) {
        let mut history = self.history.lock().expect("registry mutex poisoned");
        history
            .entry(session_id.to_string())
            .or_default()
            .push(ChatTurn {
                role: role.to_string(),
                content,
            });
    }

    /// Snapshot the remembered turns of a session
    pub fn snapshot(&self, session_id: &str) -> Vec<ChatTurn> {
        self.history
            .lock()
            .expect("registry mutex poisoned")
            .get(session_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Drop all in-process state for a session (used by cascade delete)
    pub fn forget(&self, session_id: &str) {
        self.release(session_id);
        self.history
            .lock()
            .expect("registry mutex poisoned")
            .remove(session_id);
    }
}

/// Holds the dedup claim for one session; releases it on drop.
pub struct ClaimGuard {
    registry: Arc<SessionRegistry>,
    session_id: String,
}

impl ClaimGuard {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }
}

impl Drop for ClaimGuard {
    fn drop(&mut self) {
        self.registry.release(&self.session_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_claim_is_exclusive_until_dropped() {
        let registry = SessionRegistry::new();

        let guard = registry.claim("s1").expect("first claim");
        assert!(registry.is_running("s1"));
        assert!(registry.claim("s1").is_none());
        assert!(registry.claim("s2").is_some());

        drop(guard);
        assert!(!registry.is_running("s1"));
        assert!(registry.claim("s1").is_some());
    }

    #[test]
    fn test_claim_released_on_panic() {
        let registry = SessionRegistry::new();
        let registry_clone = Arc::clone(&registry);

        let result = std::panic::catch_unwind(move || {
            let _guard = registry_clone.claim("s1").expect("claim");
            panic!("pipeline blew up");
        });
        assert!(result.is_err());
        assert!(!registry.is_running("s1"));
    }

    #[test]
    fn test_history_snapshot_and_forget() {
        let registry = SessionRegistry::new();
        registry.append_turn("s1", "user", json!({"q": 1}));
        registry.append_turn("s1", "assistant", json!({"a": 1}));

        let turns = registry.snapshot("s1");
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].role, "user");
        assert_eq!(turns[1].role, "assistant");

        registry.forget("s1");
        assert!(registry.snapshot("s1").is_empty());
    }

    #[test]
    fn test_forget_clears_running_claim() {
        let registry = SessionRegistry::new();
        let guard = registry.claim("s1").expect("claim");
        registry.forget("s1");
        assert!(!registry.is_running("s1"));
        // dropping the stale guard afterwards is harmless
        drop(guard);
    }

    #[tokio::test]
    async fn test_concurrent_claims_are_rejected_while_held() {
        let registry = SessionRegistry::new();
        let _guard = registry.claim("same-session").expect("initial claim");

        let mut handles = Vec::new();
        for _ in 0..16 {
            let registry = Arc::clone(&registry);
            handles.push(tokio::spawn(async move {
                registry.claim("same-session").is_some()
            }));
        }
        for handle in handles {
            assert!(!handle.await.unwrap());
        }
    }
}
