//! Connection registry: one table of live WebSocket sessions per user.
//!
//! A client reconnecting after a page reload reuses its `connection_id`, and
//! the admit path must recognize that and evict nothing — closing the "other"
//! connections on every reconnect is what caused the disconnect/reconnect
//! storm this table exists to prevent. Only a genuinely new non-keepalive
//! connection id evicts the user's other non-keepalive sessions.
//!
//! All admit/touch/remove logic for one user runs under that user's DashMap
//! shard guard, so concurrent connects from the same user serialize without
//! blocking unrelated users.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use tokio::sync::Notify;

/// Idle timeout for a keepalive candidate entry (10 minutes).
const KEEPALIVE_TIMEOUT_SECS: i64 = 600;
/// Idle timeout for a regular candidate entry (2 minutes).
const SESSION_TIMEOUT_SECS: i64 = 120;

/// One live session owned by the registry while its socket is open.
#[derive(Clone)]
pub struct SessionEntry {
    pub connection_id: String,
    pub is_keepalive: bool,
    pub established_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    /// Fired when the registry destroys this entry out from under its
    /// actor, which must then close its socket and tear down. Also serves
    /// as the actor's identity token for `remove`.
    pub cancel: Arc<Notify>,
}

/// Outcome of an admit call.
pub struct AdmitDecision {
    /// True when the incoming id matched a surviving entry (same logical
    /// client reconnecting) and nothing was evicted.
    pub reconnect: bool,
    /// Connection ids whose sessions were displaced. Their cancel signals
    /// have already fired; each evicted actor closes and cleans up itself.
    pub evicted: Vec<String>,
}

/// Process-wide table of active sessions, keyed by user id then connection id.
#[derive(Default)]
pub struct ConnectionRegistry {
    users: DashMap<String, HashMap<String, SessionEntry>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit a freshly authenticated connection, resolving conflicts with
    /// the user's existing sessions.
    pub fn admit(
        &self,
        user_id: &str,
        connection_id: &str,
        is_keepalive: bool,
        cancel: Arc<Notify>,
    ) -> AdmitDecision {
        self.admit_at(user_id, connection_id, is_keepalive, cancel, Utc::now())
    }

    /// Admit with an explicit clock, for the timeout tests.
    pub fn admit_at(
        &self,
        user_id: &str,
        connection_id: &str,
        is_keepalive: bool,
        cancel: Arc<Notify>,
        now: DateTime<Utc>,
    ) -> AdmitDecision {
        let mut sessions = self.users.entry(user_id.to_string()).or_default();

        // Liveness sweep. The timeout is chosen per candidate entry: the
        // long keepalive window applies only to the entry matching the
        // incoming id when the incoming connection itself is keepalive.
        sessions.retain(|cid, entry| {
            let keepalive_candidate = cid == connection_id && is_keepalive;
            let timeout = if keepalive_candidate {
                Duration::seconds(KEEPALIVE_TIMEOUT_SECS)
            } else {
                Duration::seconds(SESSION_TIMEOUT_SECS)
            };
            now - entry.last_seen < timeout
        });

        // Reconnect with the same id: refresh and evict nothing. This must
        // short-circuit before the eviction sweep below.
        if let Some(existing) = sessions.get_mut(connection_id) {
            tracing::info!(
                user_id = %user_id,
                connection_id = %connection_id,
                "Reconnection with same connection id"
            );
            existing.last_seen = now;
            existing.is_keepalive = is_keepalive;
            existing.cancel = cancel;
            return AdmitDecision {
                reconnect: true,
                evicted: Vec::new(),
            };
        }

        // New connection id: a non-keepalive connection displaces the user's
        // other non-keepalive sessions. Keepalive entries are immune, and a
        // keepalive connection never evicts anyone.
        let mut evicted = Vec::new();
        if !is_keepalive {
            let displaced: Vec<String> = sessions
                .iter()
                .filter(|(_, entry)| !entry.is_keepalive)
                .map(|(cid, _)| cid.clone())
                .collect();
            for cid in displaced {
                if let Some(entry) = sessions.remove(&cid) {
                    tracing::info!(
                        user_id = %user_id,
                        evicted_connection_id = %cid,
                        "Evicting old connection for new connection id"
                    );
                    // Wake the displaced actor so it closes its socket and
                    // releases its topic subscriptions; merely dropping the
                    // entry would leave the old session running.
                    entry.cancel.notify_one();
                    evicted.push(cid);
                }
            }
        }

        sessions.insert(
            connection_id.to_string(),
            SessionEntry {
                connection_id: connection_id.to_string(),
                is_keepalive,
                established_at: now,
                last_seen: now,
                cancel,
            },
        );

        tracing::debug!(
            user_id = %user_id,
            connections = sessions.len(),
            "Connection admitted"
        );

        AdmitDecision {
            reconnect: false,
            evicted,
        }
    }

    /// Refresh a session's liveness timestamp. Called on protocol ping.
    pub fn touch(&self, user_id: &str, connection_id: &str) {
        self.touch_at(user_id, connection_id, Utc::now());
    }

    pub fn touch_at(&self, user_id: &str, connection_id: &str, now: DateTime<Utc>) {
        if let Some(mut sessions) = self.users.get_mut(user_id) {
            if let Some(entry) = sessions.get_mut(connection_id) {
                entry.last_seen = now;
            }
        }
    }

    /// Drop a session on disconnect. Idempotent: the eviction path may have
    /// already removed the entry before the evicted task's own teardown runs.
    /// `cancel` is the caller's identity token: a superseded actor whose
    /// entry was replaced by a same-id reconnect must not delete the
    /// replacement's entry when its socket finally dies.
    pub fn remove(&self, user_id: &str, connection_id: &str, cancel: &Arc<Notify>) {
        let mut now_empty = false;
        if let Some(mut sessions) = self.users.get_mut(user_id) {
            if sessions
                .get(connection_id)
                .is_some_and(|entry| Arc::ptr_eq(&entry.cancel, cancel))
            {
                sessions.remove(connection_id);
            }
            now_empty = sessions.is_empty();
        }
        if now_empty {
            self.users.remove_if(user_id, |_, sessions| sessions.is_empty());
        }
        tracing::debug!(
            user_id = %user_id,
            connection_id = %connection_id,
            "Connection removed from registry"
        );
    }

    /// Number of live sessions for a user.
    pub fn session_count(&self, user_id: &str) -> usize {
        self.users.get(user_id).map(|s| s.len()).unwrap_or(0)
    }

    /// Whether a specific session is currently registered.
    pub fn contains(&self, user_id: &str, connection_id: &str) -> bool {
        self.users
            .get(user_id)
            .map(|s| s.contains_key(connection_id))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signal() -> Arc<Notify> {
        Arc::new(Notify::new())
    }

    #[test]
    fn reconnect_with_same_id_evicts_nothing() {
        let registry = ConnectionRegistry::new();

        let first = registry.admit("u1", "cid", false, signal());
        assert!(!first.reconnect);
        assert!(first.evicted.is_empty());

        let second = registry.admit("u1", "cid", false, signal());
        assert!(second.reconnect);
        assert!(second.evicted.is_empty());
        assert_eq!(registry.session_count("u1"), 1);
    }

    #[test]
    fn new_id_evicts_other_regular_sessions() {
        let registry = ConnectionRegistry::new();

        registry.admit("u1", "cid_a", false, signal());
        let decision = registry.admit("u1", "cid_b", false, signal());

        assert!(!decision.reconnect);
        assert_eq!(decision.evicted, vec!["cid_a"]);
        assert!(!registry.contains("u1", "cid_a"));
        assert!(registry.contains("u1", "cid_b"));
    }

    #[test]
    fn keepalive_entry_is_never_evicted() {
        let registry = ConnectionRegistry::new();

        registry.admit("u1", "keep", true, signal());
        registry.admit("u1", "reg_a", false, signal());

        let decision = registry.admit("u1", "reg_b", false, signal());
        assert_eq!(decision.evicted, vec!["reg_a"]);
        assert!(registry.contains("u1", "keep"));
        assert!(registry.contains("u1", "reg_b"));
    }

    #[test]
    fn keepalive_connection_never_evicts_others() {
        let registry = ConnectionRegistry::new();

        registry.admit("u1", "reg_a", false, signal());
        let decision = registry.admit("u1", "keep", true, signal());

        assert!(decision.evicted.is_empty());
        assert!(registry.contains("u1", "reg_a"));
        assert!(registry.contains("u1", "keep"));
    }

    #[test]
    fn stale_regular_entry_dropped_after_timeout() {
        let registry = ConnectionRegistry::new();
        let t0 = Utc::now();

        registry.admit_at("u1", "old", false, signal(), t0);
        // 121 seconds later the old entry is past the regular timeout and
        // is swept rather than evicted.
        let later = t0 + Duration::seconds(121);
        let decision = registry.admit_at("u1", "new", false, signal(), later);

        assert!(decision.evicted.is_empty());
        assert!(!registry.contains("u1", "old"));
        assert!(registry.contains("u1", "new"));
    }

    #[test]
    fn keepalive_window_applies_only_to_matching_incoming_id() {
        let registry = ConnectionRegistry::new();
        let t0 = Utc::now();

        registry.admit_at("u1", "keep", true, signal(), t0);

        // Five minutes idle: within the keepalive window for that id.
        let later = t0 + Duration::seconds(300);
        let decision = registry.admit_at("u1", "keep", true, signal(), later);
        assert!(decision.reconnect);

        // But a different incoming id sees the same entry through the
        // regular 120s window, so by then it has been swept.
        let registry = ConnectionRegistry::new();
        registry.admit_at("u1", "keep", true, signal(), t0);
        registry.admit_at("u1", "other", true, signal(), later);
        assert!(!registry.contains("u1", "keep"));
    }

    #[test]
    fn touch_refreshes_liveness() {
        let registry = ConnectionRegistry::new();
        let t0 = Utc::now();

        registry.admit_at("u1", "cid", false, signal(), t0);
        registry.touch_at("u1", "cid", t0 + Duration::seconds(100));

        // 200s after admit but only 100s after the ping: still live.
        let decision =
            registry.admit_at("u1", "cid", false, signal(), t0 + Duration::seconds(200));
        assert!(decision.reconnect);
    }

    #[test]
    fn remove_is_idempotent_and_drops_empty_user() {
        let registry = ConnectionRegistry::new();
        let cancel = signal();

        registry.admit("u1", "cid", false, cancel.clone());
        registry.remove("u1", "cid", &cancel);
        registry.remove("u1", "cid", &cancel);

        assert_eq!(registry.session_count("u1"), 0);
    }

    #[tokio::test]
    async fn eviction_fires_displaced_session_signal() {
        let registry = ConnectionRegistry::new();
        let cancel_a = signal();

        registry.admit("u1", "cid_a", false, cancel_a.clone());
        let decision = registry.admit("u1", "cid_b", false, signal());

        assert_eq!(decision.evicted, vec!["cid_a"]);
        // notify_one stores a permit, so the signal is observable even
        // though nothing was awaiting it at eviction time.
        tokio::time::timeout(std::time::Duration::from_millis(50), cancel_a.notified())
            .await
            .expect("displaced session was not signalled");
    }

    #[test]
    fn superseded_actor_cannot_remove_replacement_entry() {
        let registry = ConnectionRegistry::new();
        let old = signal();
        registry.admit("u1", "cid", false, old.clone());

        let new = signal();
        let decision = registry.admit("u1", "cid", false, new.clone());
        assert!(decision.reconnect);

        // The old actor's exit path runs after the reconnect replaced its
        // entry; its token no longer matches, so the entry survives.
        registry.remove("u1", "cid", &old);
        assert!(registry.contains("u1", "cid"));

        registry.remove("u1", "cid", &new);
        assert!(!registry.contains("u1", "cid"));
    }
}
