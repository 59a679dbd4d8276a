//! The in-memory session catalog (`spec.md` §4.5), protected by a
//! reader-writer lock per §5's explicit mandate: a `RwLock`'s writer side
//! gives a single linearization point per mutation for free, which the
//! ordering guarantee ("all state transitions totally ordered per session")
//! needs and a striped concurrent map does not.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use helix_dbus::types::{HostResources, LifecycleState, SessionRecord};
use tokio::sync::{broadcast, RwLock};

/// One session's catalog entry. A superset of [`SessionRecord`] (adds the
/// `tunnel_id` and lease bookkeeping the D-Bus-facing type omits).
#[derive(Debug, Clone)]
pub struct SessionEntry {
    pub session_id: String,
    pub owner: String,
    pub image_ref: String,
    pub host_id: String,
    pub container_id: String,
    /// Derived from `container_id` (`spec.md` §3 "Tunnel: identified by
    /// `tunnel_id` derived from `container_id`").
    pub tunnel_id: String,
    pub lifecycle_state: LifecycleState,
    pub viewer_count: u32,
    pub created_at: i64,
    pub lease_renewed_at: i64,
}

impl SessionEntry {
    fn from_record(record: SessionRecord) -> Self {
        Self {
            tunnel_id: record.container_id.clone(),
            session_id: record.session_id,
            owner: record.owner,
            image_ref: record.image_ref,
            host_id: record.host_id,
            container_id: record.container_id,
            lifecycle_state: record.lifecycle_state,
            viewer_count: record.viewer_count,
            created_at: record.created_at,
            lease_renewed_at: now_unix(),
        }
    }

    #[must_use]
    pub fn to_record(&self) -> SessionRecord {
        SessionRecord {
            session_id: self.session_id.clone(),
            owner: self.owner.clone(),
            image_ref: self.image_ref.clone(),
            host_id: self.host_id.clone(),
            container_id: self.container_id.clone(),
            lifecycle_state: self.lifecycle_state,
            viewer_count: self.viewer_count,
            created_at: self.created_at,
        }
    }
}

/// One recorded lifecycle transition, append-only per session.
#[derive(Debug, Clone)]
pub struct Transition {
    pub session_id: String,
    pub from: LifecycleState,
    pub to: LifecycleState,
    pub reason: Option<String>,
    pub at: i64,
}

struct CatalogInner {
    entries: HashMap<String, SessionEntry>,
    transitions: HashMap<String, Vec<Transition>>,
}

/// Process-wide catalog shared by the D-Bus server and the lease-expiry
/// sweep task.
#[derive(Clone)]
pub struct Catalog {
    inner: Arc<RwLock<CatalogInner>>,
    /// `Observe(session_id)` channels (`spec.md` §4.5), bounded and
    /// oldest-dropped-on-lag since `Observe` is advisory/polling-grade, not
    /// an at-least-once delivery guarantee.
    observers: Arc<DashMap<String, broadcast::Sender<Transition>>>,
}

impl Default for Catalog {
    fn default() -> Self {
        Self {
            inner: Arc::new(RwLock::new(CatalogInner {
                entries: HashMap::new(),
                transitions: HashMap::new(),
            })),
            observers: Arc::new(DashMap::new()),
        }
    }
}

impl Catalog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new session. Returns `false` if already present.
    pub async fn register(&self, record: SessionRecord) -> bool {
        let mut inner = self.inner.write().await;
        if inner.entries.contains_key(&record.session_id) {
            return false;
        }
        let entry = SessionEntry::from_record(record);
        inner.entries.insert(entry.session_id.clone(), entry);
        true
    }

    #[must_use]
    pub async fn lookup(&self, session_id: &str) -> Option<SessionEntry> {
        self.inner.read().await.entries.get(session_id).cloned()
    }

    #[must_use]
    pub async fn list(&self) -> Vec<SessionEntry> {
        self.inner.read().await.entries.values().cloned().collect()
    }

    /// Move a session to a new lifecycle state. Terminal states are sticky —
    /// enforced here, the catalog's single mutation point, not by callers.
    /// Returns `false` for an unknown session.
    pub async fn transition(&self, session_id: &str, to: LifecycleState, reason: Option<String>) -> bool {
        let transition = {
            let mut inner = self.inner.write().await;
            let Some(entry) = inner.entries.get_mut(session_id) else {
                return false;
            };
            if entry.lifecycle_state.is_terminal() {
                return false;
            }
            let from = entry.lifecycle_state;
            entry.lifecycle_state = to;
            let transition = Transition {
                session_id: session_id.to_string(),
                from,
                to,
                reason,
                at: now_unix(),
            };
            inner
                .transitions
                .entry(session_id.to_string())
                .or_default()
                .push(transition.clone());
            transition
        };

        if let Some(tx) = self.observers.get(session_id) {
            let _ = tx.send(transition);
        }
        true
    }

    /// `RenewLease(session_id, host_id)`. Returns `false` if the session is
    /// unknown or owned by a different host than the one renewing.
    pub async fn renew_lease(&self, session_id: &str, host_id: &str) -> bool {
        let mut inner = self.inner.write().await;
        let Some(entry) = inner.entries.get_mut(session_id) else {
            return false;
        };
        if entry.host_id != host_id {
            return false;
        }
        entry.lease_renewed_at = now_unix();
        true
    }

    pub async fn set_viewer_count(&self, session_id: &str, count: u32) -> bool {
        let mut inner = self.inner.write().await;
        let Some(entry) = inner.entries.get_mut(session_id) else {
            return false;
        };
        entry.viewer_count = count;
        true
    }

    /// Subscribe to this session's transition stream (`Observe`).
    #[must_use]
    pub fn observe(&self, session_id: &str) -> broadcast::Receiver<Transition> {
        self.observers
            .entry(session_id.to_string())
            .or_insert_with(|| broadcast::channel(32).0)
            .subscribe()
    }

    /// The transition log for one session, in the totally-ordered arrival
    /// order required by `spec.md` §4.5.
    #[must_use]
    pub async fn transitions_for(&self, session_id: &str) -> Vec<Transition> {
        self.inner
            .read()
            .await
            .transitions
            .get(session_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Sessions whose lease has not been renewed within `expire`, excluding
    /// those already in a terminal state.
    pub async fn expired_leases(&self, expire_secs: u64) -> Vec<String> {
        let cutoff = now_unix() - i64::try_from(expire_secs).unwrap_or(i64::MAX);
        self.inner
            .read()
            .await
            .entries
            .values()
            .filter(|e| !e.lifecycle_state.is_terminal() && e.lease_renewed_at < cutoff)
            .map(|e| e.session_id.clone())
            .collect()
    }

    /// Host resource advertisement is owned by each host's Supervisor (its
    /// `SessionTable::resources`), not by the Registry — the catalog tracks
    /// session location and state only, so this always returns `None`.
    #[must_use]
    pub fn host_resources(&self, _host_id: &str) -> Option<HostResources> {
        None
    }
}

#[allow(clippy::cast_possible_wrap)]
fn now_unix() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_record(id: &str) -> SessionRecord {
        SessionRecord {
            session_id: id.to_string(),
            owner: "agent-1".to_string(),
            image_ref: "helix/ubuntu:1".to_string(),
            host_id: "host-0".to_string(),
            container_id: "c123".to_string(),
            lifecycle_state: LifecycleState::Pending,
            viewer_count: 0,
            created_at: 0,
        }
    }

    #[tokio::test]
    async fn register_then_lookup_round_trips() {
        let catalog = Catalog::new();
        assert!(catalog.register(sample_record("s1")).await);
        let entry = catalog.lookup("s1").await.expect("entry present");
        assert_eq!(entry.tunnel_id, "c123");
    }

    #[tokio::test]
    async fn duplicate_register_is_rejected() {
        let catalog = Catalog::new();
        assert!(catalog.register(sample_record("s1")).await);
        assert!(!catalog.register(sample_record("s1")).await);
    }

    #[tokio::test]
    async fn terminal_states_are_sticky() {
        let catalog = Catalog::new();
        catalog.register(sample_record("s1")).await;
        assert!(catalog.transition("s1", LifecycleState::Failed, None).await);
        assert!(!catalog.transition("s1", LifecycleState::Ready, None).await);
        let entry = catalog.lookup("s1").await.unwrap();
        assert_eq!(entry.lifecycle_state, LifecycleState::Failed);
    }

    #[tokio::test]
    async fn transition_log_is_totally_ordered() {
        let catalog = Catalog::new();
        catalog.register(sample_record("s1")).await;
        catalog.transition("s1", LifecycleState::Starting, None).await;
        catalog.transition("s1", LifecycleState::Ready, None).await;
        let log = catalog.transitions_for("s1").await;
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].to, LifecycleState::Starting);
        assert_eq!(log[1].to, LifecycleState::Ready);
    }

    #[tokio::test]
    async fn renew_lease_rejects_wrong_host() {
        let catalog = Catalog::new();
        catalog.register(sample_record("s1")).await;
        assert!(!catalog.renew_lease("s1", "host-9").await);
        assert!(catalog.renew_lease("s1", "host-0").await);
    }
}
