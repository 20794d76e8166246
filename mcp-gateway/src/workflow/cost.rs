//! Token/cost tabulation from tool-call usage metadata (§4.3 step 5).

use std::collections::HashMap;

use serde_json::Value;

/// Extracted usage for a single step outcome.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct UsageTelemetry {
    pub tokens_used: u64,
    pub cost_credits: f64,
}

/// Per-million-token pricing for a model, in credits.
#[derive(Debug, Clone, Copy)]
pub struct ModelPricing {
    pub input_per_million: f64,
    pub output_per_million: f64,
}

/// Pricing table keyed by model name, with a default fallback for unknown
/// models (§4.3: "unknown models fall back to a configured default").
pub struct CostTable {
    pricing: HashMap<String, ModelPricing>,
    default_pricing: ModelPricing,
}

impl Default for CostTable {
    fn default() -> Self {
        let mut pricing = HashMap::new();
        pricing.insert("gpt-4o".to_string(), ModelPricing { input_per_million: 2.50, output_per_million: 10.00 });
        pricing.insert("gpt-4o-mini".to_string(), ModelPricing { input_per_million: 0.15, output_per_million: 0.60 });
        pricing.insert(
            "claude-3-5-sonnet".to_string(),
            ModelPricing { input_per_million: 3.00, output_per_million: 15.00 },
        );
        pricing.insert(
            "claude-3-haiku".to_string(),
            ModelPricing { input_per_million: 0.25, output_per_million: 1.25 },
        );

        Self { pricing, default_pricing: ModelPricing { input_per_million: 1.00, output_per_million: 3.00 } }
    }
}

impl CostTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_default(&mut self, pricing: ModelPricing) {
        self.default_pricing = pricing;
    }

    pub fn set_model_pricing(&mut self, model: impl Into<String>, pricing: ModelPricing) {
        self.pricing.insert(model.into(), pricing);
    }

    /// Extract OpenAI-style (`usage.prompt_tokens`/`completion_tokens`) or
    /// Anthropic-style (`usage.input_tokens`/`output_tokens`) usage from a
    /// tool result, then price it against `model_name`. Returns `None` if
    /// the result exposes no recognizable usage metadata.
    pub fn tabulate(&self, model_name: Option<&str>, output: &Value) -> Option<UsageTelemetry> {
        let usage = output.get("usage")?;

        let (input_tokens, output_tokens) = if let (Some(prompt), Some(completion)) =
            (usage.get("prompt_tokens").and_then(Value::as_u64), usage.get("completion_tokens").and_then(Value::as_u64))
        {
            (prompt, completion)
        } else if let (Some(input), Some(output)) =
            (usage.get("input_tokens").and_then(Value::as_u64), usage.get("output_tokens").and_then(Value::as_u64))
        {
            (input, output)
        } else {
            return None;
        };

        let pricing = model_name.and_then(|m| self.pricing.get(m)).copied().unwrap_or(self.default_pricing);
        let cost = (input_tokens as f64 / 1_000_000.0) * pricing.input_per_million
            + (output_tokens as f64 / 1_000_000.0) * pricing.output_per_million;

        Some(UsageTelemetry { tokens_used: input_tokens + output_tokens, cost_credits: cost })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_openai_style_usage() {
        let table = CostTable::new();
        let output = serde_json::json!({"usage": {"prompt_tokens": 1000, "completion_tokens": 500}});
        let telemetry = table.tabulate(Some("gpt-4o-mini"), &output).unwrap();
        assert_eq!(telemetry.tokens_used, 1500);
        assert!(telemetry.cost_credits > 0.0);
    }

    #[test]
    fn extracts_anthropic_style_usage() {
        let table = CostTable::new();
        let output = serde_json::json!({"usage": {"input_tokens": 200, "output_tokens": 100}});
        let telemetry = table.tabulate(Some("claude-3-haiku"), &output).unwrap();
        assert_eq!(telemetry.tokens_used, 300);
    }

    #[test]
    fn unknown_model_falls_back_to_default_pricing() {
        let table = CostTable::new();
        let output = serde_json::json!({"usage": {"input_tokens": 1_000_000, "output_tokens": 0}});
        let telemetry = table.tabulate(Some("some-unlisted-model"), &output).unwrap();
        assert_eq!(telemetry.cost_credits, 1.00);
    }

    #[test]
    fn no_usage_metadata_returns_none() {
        let table = CostTable::new();
        assert!(table.tabulate(Some("gpt-4o"), &serde_json::json!({"result": "ok"})).is_none());
    }
}
