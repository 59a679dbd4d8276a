//! Session data model and the per-host table of live sessions (`spec.md`
//! §3 "Session"). The table is this Supervisor's private view — the
//! authoritative cross-host catalog lives in the Session Registry (C5);
//! this table exists so `HealthLoop`/`Reap` can drive lifecycle locally and
//! so `dbus::SupervisorBackend` has something to answer queries from.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use helix_dbus::types::{HostResources, LifecycleState, SessionRecord};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::config::HostCapacity;

/// Resource shape requested at `CreateSession` time (`spec.md` §3
/// "resources").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceRequest {
    pub cpu_cores: u32,
    pub ram_mb: u64,
    pub gpu_vendor: String,
    pub disk_quota_gb: u64,
}

/// One session tracked by this host's Supervisor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub owner: String,
    pub image_ref: String,
    pub host_id: String,
    pub container_id: String,
    pub resources: ResourceRequest,
    pub lifecycle_state: LifecycleState,
    pub created_at: i64,
    pub ready_at: Option<i64>,
    pub terminated_at: Option<i64>,
    /// Reason the session reached `Failed`/`Stopped`, for audit and for the
    /// viewer-facing `lifecycle_state`/`reason` surfaced per `spec.md` §7.
    pub last_reason: Option<String>,
    /// Consecutive `HealthLoop` probe failures (`spec.md` §4.3: three
    /// consecutive failures transition the session to `Failed`).
    #[serde(default)]
    pub consecutive_health_failures: u32,
}

impl Session {
    #[must_use]
    pub fn to_record(&self) -> SessionRecord {
        SessionRecord {
            session_id: self.session_id.clone(),
            owner: self.owner.clone(),
            image_ref: self.image_ref.clone(),
            host_id: self.host_id.clone(),
            container_id: self.container_id.clone(),
            lifecycle_state: self.lifecycle_state,
            viewer_count: 0,
            created_at: self.created_at,
        }
    }

    /// Move to a new lifecycle state. Terminal states (`Stopped`, `Failed`)
    /// are sticky: once reached no further transition is applied
    /// (`spec.md` §3 invariant), matching the Session Registry's identical
    /// single-mutation-point rule for the cross-host catalog.
    pub fn transition(&mut self, next: LifecycleState) {
        if self.lifecycle_state.is_terminal() {
            return;
        }
        self.lifecycle_state = next;
        match next {
            LifecycleState::Ready => self.ready_at = Some(now_unix()),
            LifecycleState::Stopped | LifecycleState::Failed => {
                self.terminated_at = Some(now_unix());
            }
            _ => {}
        }
    }
}

/// Per-vendor encoder session counters, admitted with compare-and-set to
/// avoid oversubscription under racing `CreateSession` calls (`spec.md` §5
/// "Shared-resource policy").
#[derive(Debug, Default)]
pub struct EncoderSessionCounter {
    nvenc_in_use: AtomicU32,
}

impl EncoderSessionCounter {
    /// Attempt to reserve one NVENC session. Returns `false` (no mutation)
    /// if the host's advertised capacity would be exceeded.
    pub fn try_reserve_nvenc(&self, capacity: u32) -> bool {
        let mut current = self.nvenc_in_use.load(Ordering::SeqCst);
        loop {
            if current >= capacity {
                return false;
            }
            match self.nvenc_in_use.compare_exchange_weak(
                current,
                current + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }

    pub fn release_nvenc(&self) {
        self.nvenc_in_use.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| Some(v.saturating_sub(1))).ok();
    }

    #[must_use]
    pub fn nvenc_in_use(&self) -> u32 {
        self.nvenc_in_use.load(Ordering::SeqCst)
    }
}

struct TableInner {
    sessions: HashMap<String, Session>,
    capacity: HostCapacity,
    cpu_in_use: u32,
    ram_mb_in_use: u64,
    state_file: std::path::PathBuf,
}

/// Thread-safe table of sessions local to this host, guarded by a
/// reader-writer lock per `spec.md` §5 ("Session Registry is protected by a
/// reader-writer lock") — the same discipline applies here since this table
/// feeds the same `SessionRecord` shape to D-Bus callers.
#[derive(Clone)]
pub struct SessionTable {
    inner: Arc<RwLock<TableInner>>,
    encoder_counter: Arc<EncoderSessionCounter>,
    host_id: String,
}

impl SessionTable {
    #[must_use]
    pub fn new(host_id: String, capacity: HostCapacity, state_file: std::path::PathBuf) -> Self {
        Self {
            inner: Arc::new(RwLock::new(TableInner {
                sessions: HashMap::new(),
                capacity,
                cpu_in_use: 0,
                ram_mb_in_use: 0,
                state_file,
            })),
            encoder_counter: Arc::new(EncoderSessionCounter::default()),
            host_id,
        }
    }

    #[must_use]
    pub fn host_id(&self) -> &str {
        &self.host_id
    }

    /// Admission control: refuse a request that would exceed any advertised
    /// dimension (`spec.md` §4.3). On success, reserves capacity
    /// immediately so a racing `CreateSession` sees the updated totals.
    pub async fn try_admit(&self, req: &ResourceRequest) -> Result<(), HostResources> {
        let mut inner = self.inner.write().await;
        let would_cpu = inner.cpu_in_use + req.cpu_cores;
        let would_ram = inner.ram_mb_in_use + req.ram_mb;
        let nvenc_wanted = req.gpu_vendor.eq_ignore_ascii_case("nvidia");

        if would_cpu > inner.capacity.cpu_cores || would_ram > inner.capacity.ram_mb {
            return Err(self.resources_locked(&inner));
        }
        if nvenc_wanted && !self.encoder_counter.try_reserve_nvenc(inner.capacity.nvenc_sessions) {
            return Err(self.resources_locked(&inner));
        }

        inner.cpu_in_use = would_cpu;
        inner.ram_mb_in_use = would_ram;
        Ok(())
    }

    /// Release capacity reserved by [`Self::try_admit`] for a terminated
    /// session.
    pub async fn release(&self, req: &ResourceRequest) {
        let mut inner = self.inner.write().await;
        inner.cpu_in_use = inner.cpu_in_use.saturating_sub(req.cpu_cores);
        inner.ram_mb_in_use = inner.ram_mb_in_use.saturating_sub(req.ram_mb);
        if req.gpu_vendor.eq_ignore_ascii_case("nvidia") {
            self.encoder_counter.release_nvenc();
        }
    }

    fn resources_locked(&self, inner: &TableInner) -> HostResources {
        HostResources {
            gpu_count: inner.capacity.gpu_count,
            free_encoder_sessions: inner
                .capacity
                .nvenc_sessions
                .saturating_sub(self.encoder_counter.nvenc_in_use()),
            free_cpu_cores: inner.capacity.cpu_cores.saturating_sub(inner.cpu_in_use),
            free_ram_mb: inner.capacity.ram_mb.saturating_sub(inner.ram_mb_in_use),
        }
    }

    #[must_use]
    pub async fn resources(&self) -> HostResources {
        let inner = self.inner.read().await;
        self.resources_locked(&inner)
    }

    pub async fn insert(&self, session: Session) {
        self.inner.write().await.sessions.insert(session.session_id.clone(), session);
    }

    #[must_use]
    pub async fn get(&self, session_id: &str) -> Option<Session> {
        self.inner.read().await.sessions.get(session_id).cloned()
    }

    pub async fn mutate<F: FnOnce(&mut Session)>(&self, session_id: &str, f: F) {
        if let Some(s) = self.inner.write().await.sessions.get_mut(session_id) {
            f(s);
        }
    }

    pub async fn remove(&self, session_id: &str) -> Option<Session> {
        self.inner.write().await.sessions.remove(session_id)
    }

    #[must_use]
    pub async fn list(&self) -> Vec<Session> {
        self.inner.read().await.sessions.values().cloned().collect()
    }

    /// Non-terminal sessions, the working set `HealthLoop`/`Reap` iterate.
    #[must_use]
    pub async fn list_active(&self) -> Vec<Session> {
        self.inner
            .read()
            .await
            .sessions
            .values()
            .filter(|s| !s.lifecycle_state.is_terminal())
            .cloned()
            .collect()
    }

    /// Persist the table to the state file (atomic temp-file-plus-rename,
    /// matching a periodic state-snapshot idiom).
    pub async fn save_state(&self) -> Result<()> {
        let inner = self.inner.read().await;
        let entries: Vec<&Session> = inner.sessions.values().collect();
        let contents = serde_json::to_string_pretty(&entries).context("failed to serialize sessions")?;

        if let Some(parent) = inner.state_file.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create state dir: {}", parent.display()))?;
        }

        let tmp_path = inner.state_file.with_extension("json.tmp");
        std::fs::write(&tmp_path, &contents)
            .with_context(|| format!("failed to write temp state: {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, &inner.state_file)
            .with_context(|| format!("failed to rename state file: {}", inner.state_file.display()))?;
        Ok(())
    }

    /// Load sessions from the persisted state file, reconciling against
    /// live container inventory is the caller's job (`spec.md` §6.4); this
    /// just repopulates the in-memory table.
    pub async fn load_state(&self) -> Result<()> {
        let state_file = self.inner.read().await.state_file.clone();
        if !state_file.exists() {
            return Ok(());
        }
        let contents = std::fs::read_to_string(&state_file)
            .with_context(|| format!("failed to read state file: {}", state_file.display()))?;
        let entries: Vec<Session> = serde_json::from_str(&contents)
            .with_context(|| format!("failed to parse state file: {}", state_file.display()))?;

        let mut inner = self.inner.write().await;
        for entry in entries {
            if !entry.lifecycle_state.is_terminal() {
                inner.cpu_in_use += entry.resources.cpu_cores;
                inner.ram_mb_in_use += entry.resources.ram_mb;
                if entry.resources.gpu_vendor.eq_ignore_ascii_case("nvidia") {
                    self.encoder_counter.try_reserve_nvenc(u32::MAX);
                }
            }
            inner.sessions.insert(entry.session_id.clone(), entry);
        }
        Ok(())
    }
}

/// Get current Unix timestamp in seconds.
#[allow(clippy::cast_possible_wrap)]
#[must_use]
pub fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}
