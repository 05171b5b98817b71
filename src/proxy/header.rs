//! Savings metadata response header.

use std::fmt;

use axum::http::{HeaderName, HeaderValue};

use crate::compression::GateOutcome;
use crate::metrics::Savings;

/// Name of the header added to every proxied conversation response.
pub const SAVINGS_HEADER: HeaderName = HeaderName::from_static("x-ctxproxy-savings");

/// Savings for one request, rendered as a compact `key=value` list:
///
/// ```text
/// x-ctxproxy-savings: tokens_saved=18,cost_saved=0.000054,compression_ratio=0.100,compressed=true,tokens_before=20,tokens_after=2
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct SavingsHeader {
    /// Tokens saved by this request
    pub tokens_saved: u64,
    /// Cost saved in USD
    pub cost_saved: f64,
    /// `tokens_after / tokens_before`
    pub compression_ratio: f64,
    /// Whether a reduced context was forwarded
    pub compressed: bool,
    /// Approximate tokens before compression
    pub tokens_before: u64,
    /// Approximate tokens forwarded
    pub tokens_after: u64,
}

impl SavingsHeader {
    /// Header for a gate outcome and the savings recorded for it.
    pub fn new(outcome: &GateOutcome, savings: Savings) -> Self {
        Self {
            tokens_saved: savings.tokens_saved,
            cost_saved: savings.cost_saved(),
            compression_ratio: outcome.ratio(),
            compressed: outcome.compressed,
            tokens_before: outcome.tokens_before,
            tokens_after: outcome.tokens_after,
        }
    }

    /// Parse a header value produced by [`SavingsHeader::to_header_value`].
    pub fn parse(value: &str) -> Option<Self> {
        let mut header = Self {
            tokens_saved: 0,
            cost_saved: 0.0,
            compression_ratio: 1.0,
            compressed: false,
            tokens_before: 0,
            tokens_after: 0,
        };

        for pair in value.split(',') {
            let (key, val) = pair.trim().split_once('=')?;
            match key {
                "tokens_saved" => header.tokens_saved = val.parse().ok()?,
                "cost_saved" => header.cost_saved = val.parse().ok()?,
                "compression_ratio" => header.compression_ratio = val.parse().ok()?,
                "compressed" => header.compressed = val.parse().ok()?,
                "tokens_before" => header.tokens_before = val.parse().ok()?,
                "tokens_after" => header.tokens_after = val.parse().ok()?,
                _ => {},
            }
        }
        Some(header)
    }

    /// Header value; only ASCII is produced.
    pub fn to_header_value(&self) -> HeaderValue {
        HeaderValue::from_str(&self.to_string())
            .unwrap_or_else(|_| HeaderValue::from_static("compressed=false"))
    }
}

impl fmt::Display for SavingsHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "tokens_saved={},cost_saved={:.6},compression_ratio={:.3},compressed={},tokens_before={},tokens_after={}",
            self.tokens_saved,
            self.cost_saved,
            self.compression_ratio,
            self.compressed,
            self.tokens_before,
            self.tokens_after
        )
    }
}
