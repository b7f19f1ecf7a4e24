//! Durable usage pipeline for llm-mux.

pub mod backend;
pub mod db;
pub mod entities;
pub mod store;

pub use backend::{UsageBackend, UsageBackendConfig, UsageCounters, UsageCountersSnapshot};
pub use llm_mux_auth::{UsageRecord, UsageSink};
pub use store::{GlobalUsageStats, UsageQuery, UsageStore};
