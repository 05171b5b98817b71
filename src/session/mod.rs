//! Per-credential session state.
//!
//! A session is keyed by a fingerprint of the client credential and lives
//! only in memory: after a restart the same credential maps to the same
//! (fresh) session again.
//!
//! # Lifecycle
//!
//! ```text
//!   first request with credential C
//!         │ get_or_create(fingerprint(C))
//!         v
//!     [Active] ──── request done ───> [Idle] ──── idle > timeout ───> (swept)
//!         ^                              │
//!         └──────── next request ────────┘
//! ```
//!
//! A session is pinned while any request holds a [`SessionGuard`]; the
//! sweeper never removes a pinned session.

mod fingerprint;
mod store;

use std::fmt;

use serde::Serialize;

use crate::provider::Message;

pub use fingerprint::fingerprint;
pub use store::{SessionGuard, SessionSnapshot, SessionStore};

/// Width of a session id in hex characters.
///
/// 16 hex chars keep 64 bits of the SHA-256 digest. Collisions between two
/// credentials are possible in principle; the fingerprint is a grouping key,
/// not a security boundary.
pub const SESSION_ID_LEN: usize = 16;

/// Deterministic, non-reversible session identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Derive the session id for a credential.
    ///
    /// Requests without a credential share one anonymous session.
    pub fn from_credential(credential: Option<&str>) -> Self {
        Self(fingerprint(credential.unwrap_or_default()))
    }

    /// Session id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short prefix for log lines.
    pub fn short(&self) -> &str {
        &self.0[..8.min(self.0.len())]
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque reference to a session's memory inside the compression engine.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct MemoryHandle(String);

impl MemoryHandle {
    /// Handle used for a session's engine memory.
    pub fn for_session(id: &SessionId) -> Self {
        Self(format!("session-{id}"))
    }

    /// Handle as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Mutable per-session state, guarded by the session's lock.
#[derive(Debug)]
pub struct SessionState {
    history: Vec<Message>,
    message_count: u64,
    requests: u64,
    tokens_saved: u64,
    cost_saved_nanos: u64,
    memory: MemoryHandle,
}

impl SessionState {
    fn new(id: &SessionId) -> Self {
        Self {
            history: Vec::new(),
            message_count: 0,
            requests: 0,
            tokens_saved: 0,
            cost_saved_nanos: 0,
            memory: MemoryHandle::for_session(id),
        }
    }

    /// Record an incoming conversation and return the turns not seen before.
    ///
    /// A one-message request is a new turn. A longer list is matched against
    /// the known history: only what follows the common prefix is new, a resend
    /// of known turns adds nothing, and on divergence the history is cut back
    /// to the common prefix before the new turns are appended. The message
    /// count is incremented here, before any threshold comparison.
    pub fn absorb(&mut self, incoming: &[Message]) -> Vec<Message> {
        let common = if incoming.len() > 1 {
            self.history
                .iter()
                .zip(incoming)
                .take_while(|(known, new)| known == new)
                .count()
        } else {
            0
        };

        if incoming.len() > 1 && common < self.history.len() && common < incoming.len() {
            self.history.truncate(common);
        }

        let fresh = incoming[common..].to_vec();
        self.history.extend(fresh.iter().cloned());
        self.message_count += fresh.len() as u64;
        fresh
    }

    /// Add one completed request's savings.
    pub fn record_savings(&mut self, tokens_saved: u64, cost_saved_nanos: u64) {
        self.requests += 1;
        self.tokens_saved += tokens_saved;
        self.cost_saved_nanos += cost_saved_nanos;
    }

    /// Everything the session has seen, in conversation order.
    pub fn history(&self) -> &[Message] {
        &self.history
    }

    /// Number of messages attributed to this session.
    pub fn message_count(&self) -> u64 {
        self.message_count
    }

    /// Completed requests.
    pub fn requests(&self) -> u64 {
        self.requests
    }

    /// Running tokens saved.
    pub fn tokens_saved(&self) -> u64 {
        self.tokens_saved
    }

    /// Running cost saved in USD.
    pub fn cost_saved(&self) -> f64 {
        crate::metrics::nanos_to_usd(self.cost_saved_nanos)
    }

    /// Engine memory for this session.
    pub fn memory(&self) -> &MemoryHandle {
        &self.memory
    }
}
