//! Usage accounting across pipeline iterations.
//!
//! The engine threads a [`UsageStats`] handle through every agent invocation
//! as an opaque counter; backends feed it token usage and tool calls parsed
//! from their event streams.

use std::collections::BTreeMap;
use std::time::Instant;

/// Pricing per 1M tokens (USD) by model family.
struct Pricing {
    input: f64,
    output: f64,
    cache_read: f64,
    cache_write: f64,
}

const PRICING: &[(&str, Pricing)] = &[
    (
        "opus",
        Pricing {
            input: 5.0,
            output: 25.0,
            cache_read: 0.50,
            cache_write: 6.25,
        },
    ),
    (
        "haiku",
        Pricing {
            input: 1.0,
            output: 5.0,
            cache_read: 0.10,
            cache_write: 1.25,
        },
    ),
    (
        "sonnet",
        Pricing {
            input: 3.0,
            output: 15.0,
            cache_read: 0.30,
            cache_write: 3.75,
        },
    ),
];

/// Map a model id to a pricing family, defaulting to sonnet when unknown.
fn resolve_pricing(model: &str) -> &'static Pricing {
    let model = model.to_lowercase();
    PRICING
        .iter()
        .find(|(family, _)| model.contains(family))
        .map(|(_, pricing)| pricing)
        .unwrap_or(&PRICING[2].1)
}

/// Token and tool-call counters for one or more pipeline runs.
#[derive(Debug, Clone)]
pub struct UsageStats {
    started: Instant,
    pub iterations_completed: u64,
    pub iterations_failed: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_tokens: u64,
    pub cache_write_tokens: u64,
    /// Cost reported by the backend, when it reports one.
    pub reported_cost_usd: f64,
    pub api_turns: u64,
    /// Model id captured from the backend's session start event.
    pub model: String,
    pub tool_calls: BTreeMap<String, u64>,
}

impl Default for UsageStats {
    fn default() -> Self {
        Self {
            started: Instant::now(),
            iterations_completed: 0,
            iterations_failed: 0,
            input_tokens: 0,
            output_tokens: 0,
            cache_read_tokens: 0,
            cache_write_tokens: 0,
            reported_cost_usd: 0.0,
            api_turns: 0,
            model: String::new(),
            tool_calls: BTreeMap::new(),
        }
    }
}

impl UsageStats {
    /// Record one tool invocation by name.
    pub fn add_tool_call(&mut self, name: &str) {
        *self.tool_calls.entry(name.to_string()).or_insert(0) += 1;
    }

    /// Accumulate a usage report from a backend event.
    pub fn add_usage(&mut self, usage: &serde_json::Value) {
        let count = |key: &str| usage.get(key).and_then(serde_json::Value::as_u64).unwrap_or(0);
        self.input_tokens += count("input_tokens");
        self.output_tokens += count("output_tokens");
        self.cache_read_tokens += count("cache_read_input_tokens");
        self.cache_write_tokens += count("cache_creation_input_tokens");
    }

    /// Estimate cost from token counts and the captured model family.
    ///
    /// Backends that report their own total (`reported_cost_usd`) are more
    /// authoritative; this estimate covers the ones that do not.
    pub fn estimated_cost_usd(&self) -> f64 {
        let pricing = resolve_pricing(&self.model);
        (self.input_tokens as f64 * pricing.input
            + self.output_tokens as f64 * pricing.output
            + self.cache_read_tokens as f64 * pricing.cache_read
            + self.cache_write_tokens as f64 * pricing.cache_write)
            / 1_000_000.0
    }

    /// Fold another counter into this one, keeping the earlier start time.
    pub fn merge(&mut self, other: &UsageStats) {
        if other.started < self.started {
            self.started = other.started;
        }
        self.iterations_completed += other.iterations_completed;
        self.iterations_failed += other.iterations_failed;
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.cache_read_tokens += other.cache_read_tokens;
        self.cache_write_tokens += other.cache_write_tokens;
        self.reported_cost_usd += other.reported_cost_usd;
        self.api_turns += other.api_turns;
        if !other.model.is_empty() {
            self.model = other.model.clone();
        }
        for (name, count) in &other.tool_calls {
            *self.tool_calls.entry(name.clone()).or_insert(0) += count;
        }
    }

    /// Human-readable run summary.
    pub fn summary(&self) -> String {
        let elapsed = self.started.elapsed().as_secs();
        let cost = if self.reported_cost_usd > 0.0 {
            self.reported_cost_usd
        } else {
            self.estimated_cost_usd()
        };
        let tool_total: u64 = self.tool_calls.values().sum();
        format!(
            "elapsed {}m{:02}s | iterations {} ok / {} failed | tokens in {} out {} (cache r {} w {}) | tools {} | cost ${:.2}",
            elapsed / 60,
            elapsed % 60,
            self.iterations_completed,
            self.iterations_failed,
            self.input_tokens,
            self.output_tokens,
            self.cache_read_tokens,
            self.cache_write_tokens,
            tool_total,
            cost,
        )
    }
}
