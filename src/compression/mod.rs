//! Threshold-gated context compression.
//!
//! # Policy
//!
//! ```text
//!   incoming messages
//!         │
//!         v
//!   absorb into session ──> count += new turns ──> remember(new turns)
//!                                │
//!                      count >= threshold ?
//!                       │no            │yes
//!                       v              v
//!                  passthrough     recall(memory, latest message)
//!                                      │ ok & non-empty     │ error / timeout / empty
//!                                      v                    v
//!                              reduced messages        passthrough (fail open)
//! ```
//!
//! The count is incremented before the comparison, so with the default
//! threshold of 10 the 10th message is the first to trigger compression.
//! The whole sequence runs under the session's lock: two requests for the
//! same session cannot both read a pre-increment count.

mod engine;
mod local;
mod tokens;

use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;

pub use engine::{CompressionEngine, EngineFuture, HttpEngine, MemoryMetadata, RecallParams};
pub use local::LocalEngine;
pub use tokens::{approximate_tokens, count_words};

use crate::provider::Message;
use crate::session::SessionGuard;

/// Default message-count threshold.
pub const DEFAULT_THRESHOLD: u64 = 10;

/// Gate settings.
#[derive(Debug, Clone)]
pub struct GateConfig {
    /// Compression on/off; when off, sessions are still counted
    pub enabled: bool,
    /// Message count at which compression starts
    pub threshold: u64,
    /// Maximum messages the engine may return
    pub result_limit: usize,
    /// Minimum importance for a message to be retained
    pub min_importance: f32,
    /// Deadline for the remember batch and for the recall call
    pub timeout: Duration,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: DEFAULT_THRESHOLD,
            result_limit: 20,
            min_importance: 0.3,
            timeout: Duration::from_secs(10),
        }
    }
}

/// Per-request compression decision, derived from the session count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressionDecision {
    /// Whether the engine should be asked for a reduced context
    pub should_compress: bool,
    /// Threshold the count was compared against
    pub threshold_message_count: u64,
}

/// Result of running a request through the gate.
#[derive(Debug, Clone)]
pub struct GateOutcome {
    /// Messages to forward
    pub messages: Vec<Message>,
    /// Approximate tokens of the context being replaced
    pub tokens_before: u64,
    /// Approximate tokens of the forwarded context
    pub tokens_after: u64,
    /// Whether `messages` differs from the request's own list
    pub compressed: bool,
    /// Decision that led here
    pub decision: CompressionDecision,
}

impl GateOutcome {
    fn passthrough(messages: Vec<Message>, decision: CompressionDecision) -> Self {
        let tokens = approximate_tokens(&messages);
        Self {
            messages,
            tokens_before: tokens,
            tokens_after: tokens,
            compressed: false,
            decision,
        }
    }

    /// `tokens_after / tokens_before`, 1.0 when nothing was counted.
    pub fn ratio(&self) -> f64 {
        if self.tokens_before == 0 {
            1.0
        } else {
            self.tokens_after as f64 / self.tokens_before as f64
        }
    }
}

/// Decides per request whether to substitute a reduced context.
#[derive(Clone)]
pub struct CompressionGate {
    engine: Arc<dyn CompressionEngine>,
    config: GateConfig,
}

impl CompressionGate {
    /// Create a gate over an engine.
    pub fn new(engine: Arc<dyn CompressionEngine>, config: GateConfig) -> Self {
        Self { engine, config }
    }

    /// Gate settings.
    pub fn config(&self) -> &GateConfig {
        &self.config
    }

    /// Engine behind this gate.
    pub fn engine(&self) -> &Arc<dyn CompressionEngine> {
        &self.engine
    }

    /// Decision for a session that has seen `message_count` messages,
    /// including the current request's.
    pub fn decide(&self, message_count: u64) -> CompressionDecision {
        CompressionDecision {
            should_compress: self.config.enabled && message_count >= self.config.threshold,
            threshold_message_count: self.config.threshold,
        }
    }

    /// Run one request's messages through the gate.
    ///
    /// Never fails: engine errors, timeouts and empty results fall back to
    /// the original messages.
    pub async fn evaluate(&self, session: &SessionGuard, messages: Vec<Message>) -> GateOutcome {
        let mut state = session.lock().await;

        let fresh = state.absorb(&messages);
        let count = state.message_count();
        let memory = state.memory().clone();

        if self.config.enabled && !fresh.is_empty() {
            let first_position = count - fresh.len() as u64;
            let ingest = async {
                for (offset, message) in fresh.iter().enumerate() {
                    let metadata = MemoryMetadata {
                        session_id: session.id().clone(),
                        role: message.role.clone(),
                        position: first_position + offset as u64,
                    };
                    if let Err(e) = self.engine.remember(&memory, message, metadata).await {
                        tracing::warn!(session = %session.id().short(), "remember failed: {}", e);
                    }
                }
            };
            // One deadline for the whole batch; the session lock is held meanwhile
            if timeout(self.config.timeout, ingest).await.is_err() {
                tracing::warn!(
                    session = %session.id().short(),
                    new_messages = fresh.len(),
                    "remember timed out after {:?}",
                    self.config.timeout
                );
            }
        }

        let decision = self.decide(count);
        if !decision.should_compress {
            tracing::debug!(
                session = %session.id().short(),
                count,
                threshold = decision.threshold_message_count,
                "Below threshold, forwarding unchanged"
            );
            return GateOutcome::passthrough(messages, decision);
        }

        let Some(query) = messages.last().map(Message::text) else {
            return GateOutcome::passthrough(messages, decision);
        };
        let params = RecallParams {
            limit: self.config.result_limit,
            min_importance: self.config.min_importance,
        };

        match timeout(
            self.config.timeout,
            self.engine.recall(&memory, &query, params),
        )
        .await
        {
            Ok(Ok(reduced)) if !reduced.is_empty() => {
                let tokens_before = approximate_tokens(state.history());
                let tokens_after = approximate_tokens(&reduced);
                tracing::info!(
                    session = %session.id().short(),
                    messages_before = state.history().len(),
                    messages_after = reduced.len(),
                    tokens_before,
                    tokens_after,
                    "Compressed context"
                );
                GateOutcome {
                    messages: reduced,
                    tokens_before,
                    tokens_after,
                    compressed: true,
                    decision,
                }
            },
            Ok(Ok(_)) => {
                tracing::warn!(
                    session = %session.id().short(),
                    engine = self.engine.name(),
                    "Engine returned no messages, forwarding uncompressed"
                );
                GateOutcome::passthrough(messages, decision)
            },
            Ok(Err(e)) => {
                tracing::warn!(
                    session = %session.id().short(),
                    engine = self.engine.name(),
                    "Compression failed, forwarding uncompressed: {}",
                    e
                );
                GateOutcome::passthrough(messages, decision)
            },
            Err(_) => {
                tracing::warn!(
                    session = %session.id().short(),
                    engine = self.engine.name(),
                    "Compression timed out after {:?}, forwarding uncompressed",
                    self.config.timeout
                );
                GateOutcome::passthrough(messages, decision)
            },
        }
    }
}
