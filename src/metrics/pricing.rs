//! Input-token pricing table.
//!
//! Savings are priced at the input rate only: the proxy shrinks what is sent,
//! not what the model generates.

use serde::{Deserialize, Serialize};

use crate::provider::ProviderKind;

/// One pricing rule (USD per million input tokens).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PricingRule {
    /// Restrict the rule to one provider; `None` matches any
    #[serde(default)]
    pub provider: Option<ProviderKind>,
    /// Case-insensitive model name prefix
    pub model_prefix: String,
    /// USD per million input tokens
    pub input_per_million: f64,
}

impl PricingRule {
    /// Create a rule.
    pub fn new(provider: Option<ProviderKind>, model_prefix: &str, input_per_million: f64) -> Self {
        Self {
            provider,
            model_prefix: model_prefix.to_lowercase(),
            input_per_million,
        }
    }
}

/// Model pricing lookup by longest matching prefix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PricingTable {
    rules: Vec<PricingRule>,
}

impl Default for PricingTable {
    fn default() -> Self {
        use ProviderKind::{Anthropic, Google, OpenAI};

        Self::new(vec![
            // Anthropic
            PricingRule::new(Some(Anthropic), "claude-3-opus", 15.0),
            PricingRule::new(Some(Anthropic), "claude-opus-4", 15.0),
            PricingRule::new(Some(Anthropic), "claude-3-5-sonnet", 3.0),
            PricingRule::new(Some(Anthropic), "claude-3-7-sonnet", 3.0),
            PricingRule::new(Some(Anthropic), "claude-sonnet-4", 3.0),
            PricingRule::new(Some(Anthropic), "claude-3-sonnet", 3.0),
            PricingRule::new(Some(Anthropic), "claude-3-5-haiku", 0.8),
            PricingRule::new(Some(Anthropic), "claude-3-haiku", 0.25),
            // OpenAI
            PricingRule::new(Some(OpenAI), "gpt-4o-mini", 0.15),
            PricingRule::new(Some(OpenAI), "gpt-4o", 2.5),
            PricingRule::new(Some(OpenAI), "gpt-4-turbo", 10.0),
            PricingRule::new(Some(OpenAI), "gpt-4", 30.0),
            PricingRule::new(Some(OpenAI), "gpt-3.5-turbo", 0.5),
            PricingRule::new(Some(OpenAI), "o1-mini", 3.0),
            PricingRule::new(Some(OpenAI), "o1", 15.0),
            PricingRule::new(Some(OpenAI), "o3-mini", 1.1),
            // Google
            PricingRule::new(Some(Google), "gemini-1.5-pro", 1.25),
            PricingRule::new(Some(Google), "gemini-1.5-flash", 0.075),
            PricingRule::new(Some(Google), "gemini-2.0-flash", 0.1),
        ])
    }
}

impl PricingTable {
    /// Build a table from rules.
    pub fn new(rules: Vec<PricingRule>) -> Self {
        Self { rules }
    }

    /// A table that prices nothing.
    pub fn empty() -> Self {
        Self { rules: Vec::new() }
    }

    /// Rules in the table.
    pub fn rules(&self) -> &[PricingRule] {
        &self.rules
    }

    /// Input price for a model, if known.
    ///
    /// Provider-prefixed model ids (`anthropic/claude-3-opus`) match on the
    /// part after the last `/`.
    pub fn input_per_million(&self, provider: ProviderKind, model: &str) -> Option<f64> {
        let model = model.to_lowercase();
        let model = model.rsplit('/').next().unwrap_or(&model);

        self.rules
            .iter()
            .filter(|r| r.provider.map_or(true, |p| p == provider))
            .filter(|r| model.starts_with(&r.model_prefix.to_lowercase()))
            .max_by_key(|r| r.model_prefix.len())
            .map(|r| r.input_per_million)
    }

    /// Cost of `tokens` input tokens in nano-USD; zero for unknown models.
    pub fn cost_nanos(&self, provider: ProviderKind, model: Option<&str>, tokens: u64) -> u64 {
        let Some(price) = model.and_then(|m| self.input_per_million(provider, m)) else {
            return 0;
        };
        // USD/1M tokens * 1e9 nano-USD/USD / 1e6 = price * 1000 nano-USD per token
        (tokens as f64 * price * 1000.0).round() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_longest_prefix_wins() {
        let table = PricingTable::default();
        assert_eq!(
            table.input_per_million(ProviderKind::OpenAI, "gpt-4o-mini-2024-07-18"),
            Some(0.15)
        );
        assert_eq!(
            table.input_per_million(ProviderKind::OpenAI, "gpt-4o-2024-08-06"),
            Some(2.5)
        );
        assert_eq!(
            table.input_per_million(ProviderKind::OpenAI, "gpt-4-0613"),
            Some(30.0)
        );
    }

    #[test]
    fn test_provider_scoping() {
        let table = PricingTable::default();
        assert_eq!(
            table.input_per_million(ProviderKind::Google, "claude-3-opus"),
            None
        );

        let any = PricingTable::new(vec![PricingRule::new(None, "llama", 0.2)]);
        assert_eq!(
            any.input_per_million(ProviderKind::OpenAI, "meta-llama/llama-3.1-70b"),
            Some(0.2)
        );
    }

    #[test]
    fn test_unknown_model_costs_nothing() {
        let table = PricingTable::default();
        assert_eq!(
            table.cost_nanos(ProviderKind::OpenAI, Some("mystery-model"), 1_000_000),
            0
        );
        assert_eq!(table.cost_nanos(ProviderKind::OpenAI, None, 1_000_000), 0);
    }

    #[test]
    fn test_cost_nanos() {
        let table = PricingTable::default();
        // 1M tokens at $3/M = $3 = 3e9 nano-USD
        assert_eq!(
            table.cost_nanos(ProviderKind::Anthropic, Some("claude-3-5-sonnet-20241022"), 1_000_000),
            3_000_000_000
        );
    }
}
