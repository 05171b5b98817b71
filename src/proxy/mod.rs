//! Transparent forwarding proxy for AI provider APIs.
//!
//! The proxy accepts requests in each provider's native shape, so clients
//! only change their base URL. Conversation requests are attributed to a
//! session and, past the message threshold, forwarded with a reduced
//! context. Responses come back with status and body unchanged plus one
//! savings header.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                          ctxproxy                             │
//! ├───────────────────────────────────────────────────────────────┤
//! │                                                               │
//! │  Client ──> Provider ──> Messages ──> Session ──> Compression │
//! │             Detector     Extractor    Store       Gate        │
//! │                                                     │         │
//! │                                                     v         │
//! │                                               ┌──────────┐    │
//! │                                               │ Upstream │    │
//! │                                               │ Provider │    │
//! │                                               └──────────┘    │
//! │                                                     │         │
//! │  Client <── + x-ctxproxy-savings <── Metrics <──────┘         │
//! │                                                               │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use ctxproxy::{Config, ProxyServer};
//!
//! #[tokio::main]
//! async fn main() -> ctxproxy::Result<()> {
//!     let server = ProxyServer::new(Config::load(None)?)?;
//!     server.run().await
//! }
//! ```
//!
//! # Endpoints
//!
//! | Endpoint | Method | Description |
//! |----------|--------|-------------|
//! | `/health` | GET | Health check and session count |
//! | `/metrics` | GET | Aggregate savings and latency |
//! | `/sessions` | GET | Live sessions |
//! | `/v1/messages` | POST | Anthropic Messages API |
//! | `/v1/chat/completions` | POST | OpenAI Chat Completions API |
//! | `/v1beta/models/{model}:generateContent` | POST | Google Gemini API |
//! | anything else | any | Relayed to the detected provider unchanged |
//!
//! # Client Configuration
//!
//! ```bash
//! export ANTHROPIC_BASE_URL=http://localhost:8080
//! export OPENAI_BASE_URL=http://localhost:8080/v1
//! ```

mod forward;
mod header;
mod server;

pub use forward::{relay_headers, Upstream, UpstreamResponse};
pub use header::{SavingsHeader, SAVINGS_HEADER};
pub use server::{ProxyServer, ProxyState};
