//! Token usage and cost estimation.
//!
//! Successful responses report how many tokens they consumed:
//!
//! | Response shape | Fields read |
//! |----------------|-------------|
//! | Anthropic messages | `usage.input_tokens`, `usage.output_tokens` |
//! | Titan embeddings | `inputTextTokenCount` |
//! | Generic | `usage.prompt_tokens` / `usage.completion_tokens` |
//!
//! [`PricingTable`] turns that usage into an estimated cost in USD. Prices
//! are per million tokens and matched against model ids by substring, so
//! `"claude-3-5-sonnet"` prices `anthropic.claude-3-5-sonnet-20241022-v2:0`.
//! Models without an entry use the fallback price. Estimates only; the
//! provider's bill is authoritative.
//!
//! ```rust
//! use edgequake_resilience::pricing::{ModelPricing, PricingTable, TokenUsage};
//!
//! let mut table = PricingTable::default();
//! table.set_pricing("my-model", ModelPricing::new(1.0, 2.0));
//!
//! let usage = TokenUsage::new(1_000_000, 500_000);
//! assert_eq!(table.estimate("vendor.my-model-v1", &usage), 2.0);
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Tokens consumed by one remote call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
        }
    }

    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }

    /// Read the usage a model response reports, if any.
    pub fn from_response(response: &Value) -> Option<Self> {
        let count = |v: &Value, field: &str| v.get(field).and_then(Value::as_u64);

        if let Some(usage) = response.get("usage") {
            let input = count(usage, "input_tokens").or_else(|| count(usage, "prompt_tokens"));
            let output =
                count(usage, "output_tokens").or_else(|| count(usage, "completion_tokens"));
            if input.is_some() || output.is_some() {
                return Some(Self::new(input.unwrap_or(0), output.unwrap_or(0)));
            }
        }
        count(response, "inputTextTokenCount").map(|input| Self::new(input, 0))
    }
}

/// Pricing information for a model, in dollars per million tokens.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelPricing {
    pub input_cost_per_million: f64,
    pub output_cost_per_million: f64,
}

impl ModelPricing {
    pub fn new(input_cost_per_million: f64, output_cost_per_million: f64) -> Self {
        Self {
            input_cost_per_million,
            output_cost_per_million,
        }
    }

    /// Calculate cost for given token counts.
    pub fn calculate_cost(&self, input_tokens: u64, output_tokens: u64) -> f64 {
        let input_cost = (input_tokens as f64 / 1_000_000.0) * self.input_cost_per_million;
        let output_cost = (output_tokens as f64 / 1_000_000.0) * self.output_cost_per_million;
        input_cost + output_cost
    }
}

/// Prices keyed by model id fragment.
#[derive(Debug, Clone, PartialEq)]
pub struct PricingTable {
    prices: HashMap<String, ModelPricing>,
    fallback: ModelPricing,
}

impl Default for PricingTable {
    fn default() -> Self {
        let mut prices = HashMap::new();

        // Claude models
        prices.insert("claude-3-5-sonnet".to_string(), ModelPricing::new(3.0, 15.0));
        prices.insert("claude-3-5-haiku".to_string(), ModelPricing::new(0.8, 4.0));
        prices.insert("claude-3-haiku".to_string(), ModelPricing::new(0.25, 1.25));
        prices.insert("claude-3-opus".to_string(), ModelPricing::new(15.0, 75.0));

        // Embedding models
        prices.insert("titan-embed-text".to_string(), ModelPricing::new(0.2, 0.0));
        prices.insert("cohere.embed".to_string(), ModelPricing::new(0.1, 0.0));

        Self {
            prices,
            fallback: ModelPricing::new(1.0, 1.0),
        }
    }
}

impl PricingTable {
    /// A table with no entries; every model is priced at `fallback`.
    pub fn empty(fallback: ModelPricing) -> Self {
        Self {
            prices: HashMap::new(),
            fallback,
        }
    }

    pub fn set_pricing(&mut self, model_fragment: impl Into<String>, pricing: ModelPricing) {
        self.prices.insert(model_fragment.into(), pricing);
    }

    pub fn set_fallback(&mut self, pricing: ModelPricing) {
        self.fallback = pricing;
    }

    /// Price of `model_id`. The longest matching fragment wins.
    pub fn pricing_for(&self, model_id: &str) -> ModelPricing {
        self.prices
            .iter()
            .filter(|(fragment, _)| model_id.contains(fragment.as_str()))
            .max_by_key(|(fragment, _)| fragment.len())
            .map(|(_, pricing)| *pricing)
            .unwrap_or(self.fallback)
    }

    pub fn estimate(&self, model_id: &str, usage: &TokenUsage) -> f64 {
        self.pricing_for(model_id)
            .calculate_cost(usage.input_tokens, usage.output_tokens)
    }
}
