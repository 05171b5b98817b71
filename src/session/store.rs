//! Concurrent session store.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::{Mutex, MutexGuard};

use super::{MemoryHandle, SessionId, SessionState};

/// One stored session.
struct SessionSlot {
    id: SessionId,
    created_at: DateTime<Utc>,
    /// Store epoch, for converting `last_activity_ms` back to an `Instant`
    epoch: Instant,
    /// Milliseconds since `epoch` of the last completed request
    last_activity_ms: AtomicU64,
    /// Requests currently holding this session
    active: AtomicUsize,
    state: Mutex<SessionState>,
}

impl SessionSlot {
    fn new(id: SessionId, epoch: Instant) -> Self {
        let state = SessionState::new(&id);
        let slot = Self {
            id,
            created_at: Utc::now(),
            epoch,
            last_activity_ms: AtomicU64::new(0),
            active: AtomicUsize::new(0),
            state: Mutex::new(state),
        };
        slot.touch();
        slot
    }

    fn touch(&self) {
        let ms = self.epoch.elapsed().as_millis() as u64;
        self.last_activity_ms.fetch_max(ms, Ordering::AcqRel);
    }

    fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_activity_ms.load(Ordering::Acquire));
        self.epoch.elapsed().saturating_sub(last)
    }

    fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }
}

/// Handle to a session held for the duration of one request.
///
/// While a guard exists the session is pinned: [`SessionStore::sweep_expired`]
/// skips it. Dropping the guard unpins it.
pub struct SessionGuard {
    slot: Arc<SessionSlot>,
    created: bool,
}

impl SessionGuard {
    /// Session id.
    pub fn id(&self) -> &SessionId {
        &self.slot.id
    }

    /// Whether this call created the session.
    pub fn was_created(&self) -> bool {
        self.created
    }

    /// Exclusive access to the session's mutable state.
    ///
    /// Requests for the same session serialize here; other sessions are
    /// unaffected.
    pub async fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.slot.state.lock().await
    }

    /// Mark the session as active now.
    pub fn touch(&self) {
        self.slot.touch();
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.slot.active.fetch_sub(1, Ordering::AcqRel);
    }
}

impl std::fmt::Debug for SessionGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionGuard")
            .field("id", &self.slot.id)
            .field("created", &self.created)
            .finish()
    }
}

/// Read-only view of a session for the status endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    /// Session id (credential fingerprint)
    pub session_id: SessionId,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Seconds since the last completed request
    pub idle_secs: u64,
    /// Messages attributed to the session
    pub message_count: u64,
    /// Completed requests
    pub requests: u64,
    /// Tokens saved so far
    pub tokens_saved: u64,
    /// Cost saved so far (USD)
    pub cost_saved: f64,
    /// Requests in flight
    pub active_requests: usize,
}

/// Maps session ids to per-session state.
///
/// Backed by a sharded `DashMap`, so unrelated sessions never contend on a
/// single global lock. Creation goes through the map's entry API, which
/// makes get-or-create atomic per key.
pub struct SessionStore {
    sessions: DashMap<SessionId, Arc<SessionSlot>>,
    epoch: Instant,
    created: AtomicU64,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
            epoch: Instant::now(),
            created: AtomicU64::new(0),
        }
    }

    /// Return the session for `id`, creating it if needed, pinned against sweep.
    ///
    /// Concurrent first calls for the same id create exactly one session.
    pub fn get_or_create(&self, id: SessionId) -> SessionGuard {
        let mut created = false;

        // Pin while the shard lock is held so a concurrent sweep cannot
        // observe the slot unpinned between lookup and use.
        let slot = {
            let key = id.clone();
            let entry = self.sessions.entry(id).or_insert_with(|| {
                created = true;
                Arc::new(SessionSlot::new(key, self.epoch))
            });
            entry.value().active.fetch_add(1, Ordering::AcqRel);
            Arc::clone(entry.value())
        };

        if created {
            self.created.fetch_add(1, Ordering::Relaxed);
            tracing::info!(session = %slot.id.short(), "Created new session");
        } else {
            tracing::debug!(session = %slot.id.short(), "Retrieved existing session");
        }

        SessionGuard { slot, created }
    }

    /// Look up a session without creating it.
    ///
    /// `None` is a normal outcome for an id that was never seen or was swept.
    pub async fn get(&self, id: &SessionId) -> Option<SessionSnapshot> {
        let slot = self.sessions.get(id).map(|entry| Arc::clone(entry.value()))?;
        Some(snapshot(&slot).await)
    }

    /// Whether a session exists.
    pub fn contains(&self, id: &SessionId) -> bool {
        self.sessions.contains_key(id)
    }

    /// Remove idle sessions that no request is currently holding.
    ///
    /// Returns the memory handles of the removed sessions so the caller can
    /// release engine-side state.
    pub fn sweep_expired(&self, idle_timeout: Duration) -> Vec<(SessionId, MemoryHandle)> {
        let mut removed = Vec::new();

        // retain holds each shard's write lock, the same lock get_or_create
        // pins under, so the active check cannot race a new request.
        self.sessions.retain(|id, slot| {
            let expired = slot.active() == 0 && slot.idle_for() > idle_timeout;
            if expired {
                removed.push((id.clone(), MemoryHandle::for_session(id)));
            }
            !expired
        });

        for (id, _) in &removed {
            tracing::debug!(session = %id.short(), "Removed expired session");
        }

        removed
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Sessions created since start, including swept ones.
    pub fn total_created(&self) -> u64 {
        self.created.load(Ordering::Relaxed)
    }

    /// Snapshots of all live sessions, ordered by id.
    pub async fn snapshots(&self) -> Vec<SessionSnapshot> {
        let slots: Vec<Arc<SessionSlot>> = self
            .sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        let mut out = Vec::with_capacity(slots.len());
        for slot in &slots {
            out.push(snapshot(slot).await);
        }
        out.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        out
    }
}

async fn snapshot(slot: &SessionSlot) -> SessionSnapshot {
    let state = slot.state.lock().await;
    SessionSnapshot {
        session_id: slot.id.clone(),
        created_at: slot.created_at,
        idle_secs: slot.idle_for().as_secs(),
        message_count: state.message_count(),
        requests: state.requests(),
        tokens_saved: state.tokens_saved(),
        cost_saved: state.cost_saved(),
        active_requests: slot.active(),
    }
}
