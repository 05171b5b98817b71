//! # ctxproxy - Context-Compressing Proxy for AI Provider APIs
//!
//! A transparent forwarding proxy between AI-tool clients and upstream
//! provider APIs (Anthropic, OpenAI, Google). It tracks each client's
//! conversation in a session keyed by a fingerprint of its credential and,
//! once the conversation reaches a message threshold, replaces the outgoing
//! message list with a reduced context chosen by a compression engine.
//!
//! ## Features
//!
//! - **Native endpoints**: clients only change their base URL
//! - **Per-credential sessions**: at most one session per fingerprint, pinned while in use
//! - **Threshold-gated compression**: the 10th message (by default) is the first to compress
//! - **Fail-open**: engine errors, timeouts and empty results forward the original body
//! - **Savings metrics**: tokens and cost saved per session and globally
//!
//! ## Request Flow
//!
//! ```text
//! request ─> ProviderDetector ─> extract_messages ─> SessionStore::get_or_create
//!                                                             │
//!            response + savings header <─ Upstream <─ CompressionGate::evaluate
//!                      │
//!                      └─> MetricsAggregator::record
//! ```
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use ctxproxy::{Config, ProxyServer};
//!
//! let mut config = Config::default();
//! config.compression.threshold = 20;
//!
//! let server = ProxyServer::new(config)?;
//! server.run().await?;
//! ```
//!
//! ## Modules
//!
//! - [`provider`]: Provider detection and message extraction
//! - [`session`]: Credential fingerprints and the session store
//! - [`compression`]: Compression gate and engines
//! - [`metrics`]: Savings aggregation and pricing
//! - [`proxy`]: HTTP server and upstream relay
//! - [`config`]: Configuration management
//! - [`error`]: Error types and result aliases

pub mod compression;
pub mod config;
pub mod error;
pub mod metrics;
pub mod provider;
pub mod proxy;
pub mod session;

// Re-exports for convenience
pub use compression::{CompressionEngine, CompressionGate, GateConfig, HttpEngine, LocalEngine};
pub use config::Config;
pub use error::{ProxyError, Result};
pub use metrics::{MetricsAggregator, PricingTable};
pub use provider::{Message, ProviderDetector, ProviderKind, Role};
pub use proxy::{ProxyServer, SavingsHeader, SAVINGS_HEADER};
pub use session::{SessionId, SessionStore};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
