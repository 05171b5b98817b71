//! Savings and request metrics.
//!
//! Tracks per-session subtotals and process-wide totals of tokens and cost
//! saved by compression. Totals only grow; they reset with the process.
//!
//! Cost is accumulated as integer nano-USD so that totals do not depend on
//! the order requests were recorded in.

mod pricing;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Serialize;

pub use pricing::{PricingRule, PricingTable};

use crate::provider::ProviderKind;
use crate::session::SessionId;

/// Latencies kept for percentile calculation.
const LATENCY_WINDOW: usize = 1000;

/// Convert nano-USD to USD.
pub fn nanos_to_usd(nanos: u64) -> f64 {
    nanos as f64 / 1_000_000_000.0
}

/// One completed request, as seen by the aggregator.
#[derive(Debug, Clone)]
pub struct RequestRecord {
    /// Session the request was attributed to
    pub session_id: SessionId,
    /// Upstream provider
    pub provider: ProviderKind,
    /// Requested model, if the payload named one
    pub model: Option<String>,
    /// Approximate tokens before compression
    pub tokens_before: u64,
    /// Approximate tokens after compression
    pub tokens_after: u64,
    /// Whether the gate substituted a reduced context
    pub compressed: bool,
    /// End-to-end latency
    pub latency: Duration,
}

/// Savings attributed to one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Savings {
    /// Tokens saved, never negative
    pub tokens_saved: u64,
    /// Cost saved in nano-USD
    pub cost_saved_nanos: u64,
}

impl Savings {
    /// Cost saved in USD.
    pub fn cost_saved(&self) -> f64 {
        nanos_to_usd(self.cost_saved_nanos)
    }
}

/// Per-session subtotal.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct SessionTotals {
    requests: u64,
    compressed_requests: u64,
    tokens_before: u64,
    tokens_after: u64,
    tokens_saved: u64,
    cost_saved_nanos: u64,
}

impl SessionTotals {
    fn add(&mut self, record: &RequestRecord, savings: Savings) {
        self.requests += 1;
        self.compressed_requests += u64::from(record.compressed);
        self.tokens_before += record.tokens_before;
        self.tokens_after += record.tokens_after;
        self.tokens_saved += savings.tokens_saved;
        self.cost_saved_nanos += savings.cost_saved_nanos;
    }
}

/// Process-wide metrics.
#[derive(Debug)]
pub struct MetricsAggregator {
    pricing: PricingTable,
    /// Per-session subtotals; updates for one session serialize on its shard
    sessions: DashMap<SessionId, SessionTotals>,
    requests: AtomicU64,
    compressed_requests: AtomicU64,
    tokens_before: AtomicU64,
    tokens_after: AtomicU64,
    tokens_saved: AtomicU64,
    cost_saved_nanos: AtomicU64,
    errors: AtomicU64,
    latencies: RwLock<VecDeque<Duration>>,
    started_at: Instant,
}

impl Default for MetricsAggregator {
    fn default() -> Self {
        Self::new(PricingTable::default())
    }
}

impl MetricsAggregator {
    /// Create an empty aggregator.
    pub fn new(pricing: PricingTable) -> Self {
        Self {
            pricing,
            sessions: DashMap::new(),
            requests: AtomicU64::new(0),
            compressed_requests: AtomicU64::new(0),
            tokens_before: AtomicU64::new(0),
            tokens_after: AtomicU64::new(0),
            tokens_saved: AtomicU64::new(0),
            cost_saved_nanos: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            latencies: RwLock::new(VecDeque::with_capacity(LATENCY_WINDOW)),
            started_at: Instant::now(),
        }
    }

    /// Pricing table in use.
    pub fn pricing(&self) -> &PricingTable {
        &self.pricing
    }

    /// Savings a record represents, without recording it.
    pub fn savings_for(&self, record: &RequestRecord) -> Savings {
        let tokens_saved = record.tokens_before.saturating_sub(record.tokens_after);
        Savings {
            tokens_saved,
            cost_saved_nanos: self.pricing.cost_nanos(
                record.provider,
                record.model.as_deref(),
                tokens_saved,
            ),
        }
    }

    /// Record a completed request.
    pub fn record(&self, record: &RequestRecord) -> Savings {
        let savings = self.savings_for(record);

        self.sessions
            .entry(record.session_id.clone())
            .or_default()
            .add(record, savings);

        self.requests.fetch_add(1, Ordering::Relaxed);
        self.compressed_requests
            .fetch_add(u64::from(record.compressed), Ordering::Relaxed);
        self.tokens_before
            .fetch_add(record.tokens_before, Ordering::Relaxed);
        self.tokens_after
            .fetch_add(record.tokens_after, Ordering::Relaxed);
        self.tokens_saved
            .fetch_add(savings.tokens_saved, Ordering::Relaxed);
        self.cost_saved_nanos
            .fetch_add(savings.cost_saved_nanos, Ordering::Relaxed);

        if let Ok(mut latencies) = self.latencies.write() {
            if latencies.len() == LATENCY_WINDOW {
                latencies.pop_front();
            }
            latencies.push_back(record.latency);
        }

        tracing::debug!(
            session = %record.session_id.short(),
            provider = %record.provider,
            tokens_saved = savings.tokens_saved,
            "Recorded request"
        );

        savings
    }

    /// Record a request that failed before producing a response.
    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Total recorded requests.
    pub fn total_requests(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    /// Total tokens saved.
    pub fn total_tokens_saved(&self) -> u64 {
        self.tokens_saved.load(Ordering::Relaxed)
    }

    /// Total cost saved in nano-USD.
    pub fn total_cost_saved_nanos(&self) -> u64 {
        self.cost_saved_nanos.load(Ordering::Relaxed)
    }

    /// Total errors.
    pub fn total_errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    /// Subtotal for one session.
    pub fn session(&self, id: &SessionId) -> Option<SessionMetrics> {
        self.sessions
            .get(id)
            .map(|entry| SessionMetrics::from_totals(id, entry.value()))
    }

    /// Sessions with the most tokens saved, highest first.
    pub fn top_sessions(&self, limit: usize) -> Vec<SessionMetrics> {
        let mut all: Vec<SessionMetrics> = self
            .sessions
            .iter()
            .map(|entry| SessionMetrics::from_totals(entry.key(), entry.value()))
            .collect();
        all.sort_by(|a, b| {
            b.tokens_saved
                .cmp(&a.tokens_saved)
                .then_with(|| a.session_id.cmp(&b.session_id))
        });
        all.truncate(limit);
        all
    }

    fn percentile_latency(&self, percentile: usize) -> Option<Duration> {
        let latencies = self.latencies.read().ok()?;
        if latencies.is_empty() {
            return None;
        }

        let mut sorted: Vec<_> = latencies.iter().copied().collect();
        sorted.sort();

        let idx = (sorted.len() * percentile / 100).min(sorted.len() - 1);
        Some(sorted[idx])
    }

    /// Uptime since the aggregator was created.
    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Serializable snapshot of the global counters.
    pub fn summary(&self) -> MetricsSummary {
        let tokens_before = self.tokens_before.load(Ordering::Relaxed);
        let tokens_saved = self.total_tokens_saved();
        let to_ms = |d: Duration| d.as_secs_f64() * 1000.0;

        MetricsSummary {
            sessions: self.sessions.len(),
            total_requests: self.total_requests(),
            compressed_requests: self.compressed_requests.load(Ordering::Relaxed),
            total_errors: self.total_errors(),
            tokens_before,
            tokens_after: self.tokens_after.load(Ordering::Relaxed),
            tokens_saved,
            reduction_percent: if tokens_before == 0 {
                0.0
            } else {
                tokens_saved as f64 / tokens_before as f64 * 100.0
            },
            cost_saved: nanos_to_usd(self.total_cost_saved_nanos()),
            p50_latency_ms: self.percentile_latency(50).map(to_ms),
            p95_latency_ms: self.percentile_latency(95).map(to_ms),
            p99_latency_ms: self.percentile_latency(99).map(to_ms),
            uptime_secs: self.uptime().as_secs(),
        }
    }
}

/// Per-session metrics view.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionMetrics {
    /// Session id
    pub session_id: SessionId,
    /// Recorded requests
    pub requests: u64,
    /// Requests whose context was compressed
    pub compressed_requests: u64,
    /// Tokens before compression
    pub tokens_before: u64,
    /// Tokens after compression
    pub tokens_after: u64,
    /// Tokens saved
    pub tokens_saved: u64,
    /// Cost saved in nano-USD
    pub cost_saved_nanos: u64,
    /// Cost saved in USD
    pub cost_saved: f64,
}

impl SessionMetrics {
    fn from_totals(id: &SessionId, totals: &SessionTotals) -> Self {
        Self {
            session_id: id.clone(),
            requests: totals.requests,
            compressed_requests: totals.compressed_requests,
            tokens_before: totals.tokens_before,
            tokens_after: totals.tokens_after,
            tokens_saved: totals.tokens_saved,
            cost_saved_nanos: totals.cost_saved_nanos,
            cost_saved: nanos_to_usd(totals.cost_saved_nanos),
        }
    }
}

/// Global metrics snapshot for serialization.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSummary {
    /// Sessions with recorded requests.
    pub sessions: usize,
    /// Total recorded requests.
    pub total_requests: u64,
    /// Requests whose context was compressed.
    pub compressed_requests: u64,
    /// Requests that failed upstream.
    pub total_errors: u64,
    /// Tokens before compression.
    pub tokens_before: u64,
    /// Tokens after compression.
    pub tokens_after: u64,
    /// Tokens saved.
    pub tokens_saved: u64,
    /// Share of tokens saved.
    pub reduction_percent: f64,
    /// Cost saved in USD.
    pub cost_saved: f64,
    /// 50th percentile latency in milliseconds.
    pub p50_latency_ms: Option<f64>,
    /// 95th percentile latency in milliseconds.
    pub p95_latency_ms: Option<f64>,
    /// 99th percentile latency in milliseconds.
    pub p99_latency_ms: Option<f64>,
    /// Uptime in seconds.
    pub uptime_secs: u64,
}
