//! Model pricing registry.
//!
//! Centralized pricing data for all supported models.
//! Costs are in nanodollars (1e-9 USD) per token.

use std::collections::HashMap;
use std::sync::OnceLock;

/// Pricing information for a model.
#[derive(Debug, Clone, Copy)]
pub struct ModelPricing {
    /// Provider name.
    pub provider: &'static str,
    /// Cost per input token in nanodollars.
    pub input_nanos_per_token: i64,
    /// Cost per output token in nanodollars.
    pub output_nanos_per_token: i64,
}

impl ModelPricing {
    const fn new(provider: &'static str, input: i64, output: i64) -> Self {
        Self {
            provider,
            input_nanos_per_token: input,
            output_nanos_per_token: output,
        }
    }

    /// Calculate cost for a request.
    pub fn calculate_cost(&self, input_tokens: u32, output_tokens: u32) -> i64 {
        (input_tokens as i64) * self.input_nanos_per_token
            + (output_tokens as i64) * self.output_nanos_per_token
    }
}

// =============================================================================
// PRICING DATA
// =============================================================================

// Gemini (verify periodically against the provider pricing page)
// 2.5 Flash-Lite: $0.10/1M input, $0.40/1M output
// 2.5 Flash: $0.30/1M input, $2.50/1M output (output includes thinking tokens)
// 2.5 Pro: $1.25/1M input, $10.00/1M output (prompts <= 200k tokens)
// 2.5 Flash Image: $0.30/1M input, $30.00/1M output (image tokens)

const GEMINI_25_FLASH_LITE: ModelPricing = ModelPricing::new("gemini", 100, 400);
const GEMINI_25_FLASH: ModelPricing = ModelPricing::new("gemini", 300, 2_500);
const GEMINI_25_PRO: ModelPricing = ModelPricing::new("gemini", 1_250, 10_000);
const GEMINI_25_FLASH_IMAGE: ModelPricing = ModelPricing::new("gemini", 300, 30_000);

static PRICING_MAP: OnceLock<HashMap<&'static str, ModelPricing>> = OnceLock::new();

fn init_pricing() -> HashMap<&'static str, ModelPricing> {
    let mut map = HashMap::new();

    map.insert("gemini-2.5-flash-lite", GEMINI_25_FLASH_LITE);
    map.insert("gemini-2.5-flash", GEMINI_25_FLASH);
    map.insert("gemini-flash-latest", GEMINI_25_FLASH);
    map.insert("gemini-2.5-pro", GEMINI_25_PRO);
    map.insert("gemini-pro-latest", GEMINI_25_PRO);
    map.insert("gemini-2.5-flash-image", GEMINI_25_FLASH_IMAGE);
    map.insert("gemini-2.5-flash-image-preview", GEMINI_25_FLASH_IMAGE);

    map
}

/// Get pricing for a model.
pub fn get_pricing(model_id: &str) -> Option<ModelPricing> {
    let map = PRICING_MAP.get_or_init(init_pricing);
    map.get(model_id).copied()
}

/// Calculate completion cost.
pub fn completion_cost(model: &str, input_tokens: u32, output_tokens: u32) -> i64 {
    // Default to a mid-range model if unknown
    let default = ModelPricing::new("unknown", 1_000, 5_000);
    let pricing = get_pricing(model).unwrap_or(default);
    pricing.calculate_cost(input_tokens, output_tokens)
}
