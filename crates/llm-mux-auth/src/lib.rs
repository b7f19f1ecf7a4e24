//! Core multiplexing abstractions for llm-mux.
//!
//! This crate intentionally does **not** depend on any HTTP framework or
//! client. It holds the auth data model and state machine, the quota engine,
//! the copy-on-write model registry, provider scoring, the token pool, and
//! the executor/stream contracts the engine crate drives.

pub mod auth;
pub mod errors;
pub mod events;
pub mod executor;
pub mod registry;
pub mod stats;
pub mod stream;
pub mod usage;
pub mod watcher;

pub use auth::{
    ATTR_VIRTUAL_PRIMARY, Auth, AuthStatus, BlockDecision, BlockReason, GroupBlock, ModelState,
    PoolEntry, PoolLease, QuotaGroupResolver, QuotaGroupResolvers, QuotaState, QuotaSummary,
    RefreshedToken, RuntimeHandle, TokenPool, TokenRefresher,
};
pub use errors::{ErrorCategory, GatewayError, GatewayResult, parse_retry_after};
pub use events::{
    AuthDisabledEvent, CooldownEndEvent, CooldownStartEvent, EventHub, EventSink, OperationalEvent,
};
pub use executor::{
    ExecOptions, ExecRequest, ExecResponse, Executor, RequestContext, STREAM_SCAN_INITIAL,
    STREAM_SCAN_MAX, StreamChunk,
};
pub use registry::{
    CanonicalTarget, ModelEntry, ModelInfo, ModelRegistration, ModelRegistry, RegistryState,
};
pub use stats::{ProviderStats, StatsSnapshot};
pub use stream::{StreamOutcome, forward_stream};
pub use usage::{NoopUsageSink, SharedUsageSink, TokenUsage, UsageRecord, UsageSink};
pub use watcher::{AuthUpdate, AuthUpdateAction};
