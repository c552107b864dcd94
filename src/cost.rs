//! Cost calculation from token usage and model pricing.
//!
//! Used when a backend reports token usage without a cost (the Messages API
//! never reports one; the CLI usually does).

use crate::backend::Usage;

/// Model pricing in nanodollars per token (1 USD = 1_000_000_000 nanodollars).
/// Using nanodollars avoids floating-point rounding issues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelPricing {
    pub input_nano_per_token: u64,
    pub output_nano_per_token: u64,
    pub cache_create_nano_per_token: u64,
    pub cache_read_nano_per_token: u64,
}

impl ModelPricing {
    /// Standard Anthropic cache pricing: writes at 1.25x input, reads at 0.1x.
    const fn anthropic(input: u64, output: u64) -> Self {
        Self {
            input_nano_per_token: input,
            output_nano_per_token: output,
            cache_create_nano_per_token: input * 5 / 4,
            cache_read_nano_per_token: input / 10,
        }
    }
}

/// Normalize model names to canonical form for pricing lookup.
fn normalize_model(model: &str) -> &str {
    let trimmed = model.trim();
    let trimmed = trimmed.strip_prefix("anthropic/").unwrap_or(trimmed);

    match trimmed {
        s if s.contains("opus-4-5") || s.contains("opus-4.5") => "claude-opus-4-5",
        s if s.contains("opus-4") || s.contains("4-opus") => "claude-opus-4",
        s if s.contains("sonnet-4") || s.contains("4-sonnet") => "claude-sonnet-4",
        s if s.contains("3-7-sonnet") || s.contains("3.7-sonnet") => "claude-sonnet-4",
        s if s.contains("3-5-sonnet") || s.contains("3.5-sonnet") => "claude-sonnet-4",
        s if s.contains("haiku-4-5") || s.contains("haiku-4.5") => "claude-haiku-4-5",
        s if s.contains("3-5-haiku") || s.contains("3.5-haiku") => "claude-3-5-haiku",
        s if s.contains("3-opus") => "claude-opus-4",
        "opus" => "claude-opus-4",
        "sonnet" => "claude-sonnet-4",
        "haiku" => "claude-haiku-4-5",
        _ => trimmed,
    }
}

/// Get pricing for a model. Returns None if model is unknown.
///
/// $3 per 1M tokens = 3_000 nanodollars per token.
pub fn pricing_for_model(model: &str) -> Option<ModelPricing> {
    match normalize_model(model) {
        "claude-opus-4-5" => Some(ModelPricing::anthropic(5_000, 25_000)),
        "claude-opus-4" => Some(ModelPricing::anthropic(15_000, 75_000)),
        "claude-sonnet-4" => Some(ModelPricing::anthropic(3_000, 15_000)),
        "claude-haiku-4-5" => Some(ModelPricing::anthropic(1_000, 5_000)),
        "claude-3-5-haiku" => Some(ModelPricing::anthropic(800, 4_000)),
        _ => None,
    }
}

/// Cost in nanodollars. `input_tokens` counts uncached input only, so cache
/// tokens are billed on top of it.
fn cost_nano(pricing: &ModelPricing, usage: &Usage) -> u64 {
    let mut cost_nano = usage
        .input_tokens
        .saturating_mul(pricing.input_nano_per_token);
    cost_nano = cost_nano.saturating_add(
        usage
            .output_tokens
            .saturating_mul(pricing.output_nano_per_token),
    );
    if let Some(cache_create) = usage.cache_creation_input_tokens {
        cost_nano =
            cost_nano.saturating_add(cache_create.saturating_mul(pricing.cache_create_nano_per_token));
    }
    if let Some(cache_read) = usage.cache_read_input_tokens {
        cost_nano =
            cost_nano.saturating_add(cache_read.saturating_mul(pricing.cache_read_nano_per_token));
    }
    cost_nano
}

/// Calculate cost in USD from token usage and model.
///
/// Returns `None` for unknown models so callers can tell "free" apart from
/// "not priced".
pub fn cost_usd_from_usage(model: &str, usage: &Usage) -> Option<f64> {
    if !usage.has_usage() {
        return Some(0.0);
    }
    let Some(pricing) = pricing_for_model(model) else {
        tracing::warn!(model = %model, "Unknown model for cost calculation");
        return None;
    };
    Some(cost_nano(&pricing, usage) as f64 / 1_000_000_000.0)
}

/// Fill in `usage.cost_usd` from pricing when the backend reported none.
pub fn with_cost(model: &str, mut usage: Usage) -> Usage {
    if usage.cost_usd.is_none() {
        usage.cost_usd = cost_usd_from_usage(model, &usage);
    }
    usage
}

#[cfg(test)]
mod tests {
    use super::*;

    fn usage(input: u64, output: u64) -> Usage {
        Usage {
            input_tokens: input,
            output_tokens: output,
            ..Default::default()
        }
    }

    #[test]
    fn test_normalize_model() {
        assert_eq!(normalize_model("claude-sonnet-4-20250514"), "claude-sonnet-4");
        assert_eq!(normalize_model("anthropic/claude-opus-4-1"), "claude-opus-4");
        assert_eq!(normalize_model("claude-opus-4-5-20251101"), "claude-opus-4-5");
        assert_eq!(normalize_model("claude-3-5-haiku-latest"), "claude-3-5-haiku");
        assert_eq!(normalize_model("sonnet"), "claude-sonnet-4");
        assert_eq!(normalize_model("gpt-4o"), "gpt-4o");
    }

    #[test]
    fn test_cache_pricing_is_derived_from_input() {
        let pricing = pricing_for_model("claude-sonnet-4").unwrap();
        assert_eq!(pricing.cache_create_nano_per_token, 3_750);
        assert_eq!(pricing.cache_read_nano_per_token, 300);
    }

    #[test]
    fn test_cost_calculation_basic() {
        // 1M input ($3) + 100k output ($1.50)
        let cost = cost_usd_from_usage("claude-sonnet-4", &usage(1_000_000, 100_000)).unwrap();
        assert!((cost - 4.5).abs() < 1e-9);
    }

    #[test]
    fn test_cache_tokens_are_billed_on_top_of_input() {
        let u = Usage {
            input_tokens: 1_000,
            output_tokens: 0,
            cache_creation_input_tokens: Some(1_000_000),
            cache_read_input_tokens: Some(1_000_000),
            cost_usd: None,
        };
        // $0.003 + $3.75 + $0.30
        let cost = cost_usd_from_usage("claude-sonnet-4", &u).unwrap();
        assert!((cost - 4.053).abs() < 1e-9);
    }

    #[test]
    fn test_unknown_model_is_unpriced() {
        assert_eq!(cost_usd_from_usage("mystery-model", &usage(10, 10)), None);
        assert_eq!(cost_usd_from_usage("mystery-model", &usage(0, 0)), Some(0.0));
    }

    #[test]
    fn test_with_cost_keeps_reported_cost() {
        let reported = Usage {
            cost_usd: Some(0.42),
            ..usage(1_000_000, 0)
        };
        assert_eq!(with_cost("claude-sonnet-4", reported).cost_usd, Some(0.42));
        let computed = with_cost("claude-sonnet-4", usage(1_000_000, 0));
        assert!((computed.cost_usd.unwrap() - 3.0).abs() < 1e-9);
    }
}
