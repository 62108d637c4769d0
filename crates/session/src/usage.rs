//! Token and cost accounting for one model step.

use corvid_core::message::{CacheTokens, Tokens};
use corvid_core::provider::{ModelCost, Usage};

const PER_MILLION: f64 = 1_000_000.0;

/// Tokens reported for a step, in message form.
pub fn step_tokens(usage: &Usage) -> Tokens {
    Tokens {
        input: usage.input_tokens,
        output: usage.output_tokens,
        reasoning: usage.reasoning_tokens,
        cache: CacheTokens {
            read: usage.cached_input_tokens,
            write: usage.cache_write_tokens,
        },
    }
}

/// USD cost of `tokens` at the model's per-million rates.
pub fn step_cost(tokens: &Tokens, cost: &ModelCost) -> f64 {
    (tokens.input as f64 * cost.input
        + tokens.output as f64 * cost.output
        + tokens.cache.read as f64 * cost.cache_read
        + tokens.cache.write as f64 * cost.cache_write)
        / PER_MILLION
}
