//! Usage accounting types and the sink seam.
//!
//! The manager constructs a [`UsageRecord`] per terminal request result and
//! hands it to whatever sink is installed; the storage crate provides the
//! durable one, tests install counters.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input: i64,
    pub output: i64,
    pub reasoning: i64,
    pub cached: i64,
    pub total: i64,
    pub audio: i64,
    pub cache_creation_input: i64,
    pub cache_read_input: i64,
    pub tool_use_prompt: i64,
}

impl TokenUsage {
    pub fn merge(&mut self, other: &TokenUsage) {
        self.input += other.input;
        self.output += other.output;
        self.reasoning += other.reasoning;
        self.cached += other.cached;
        self.total += other.total;
        self.audio += other.audio;
        self.cache_creation_input += other.cache_creation_input;
        self.cache_read_input += other.cache_read_input;
        self.tool_use_prompt += other.tool_use_prompt;
    }
}

#[derive(Debug, Clone)]
pub struct UsageRecord {
    pub provider: String,
    pub model: String,
    pub api_key: Option<String>,
    pub auth_id: String,
    pub auth_index: i64,
    pub source: Option<String>,
    pub requested_at: OffsetDateTime,
    pub failed: bool,
    pub tokens: TokenUsage,
}

pub trait UsageSink: Send + Sync {
    fn record(&self, record: UsageRecord);
}

#[derive(Debug, Default)]
pub struct NoopUsageSink;

impl UsageSink for NoopUsageSink {
    fn record(&self, _record: UsageRecord) {}
}

pub type SharedUsageSink = Arc<dyn UsageSink>;
