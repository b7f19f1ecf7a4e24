//! Auth data model.
//!
//! An [`Auth`] is one credential, addressable by a stable id. The manager
//! owns auths exclusively; anything that leaves the manager's write path is a
//! clone (the opaque runtime handle stays shared through its `Arc`).

mod pool;
pub mod quota;
pub mod state;

pub use pool::{PoolEntry, PoolLease, RefreshedToken, TokenPool, TokenRefresher};
pub use quota::{
    BlockDecision, BlockReason, GroupBlock, QuotaGroupResolver, QuotaGroupResolvers,
};

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::time::Instant;

/// Attribute flag excluding an auth from model registration.
pub const ATTR_VIRTUAL_PRIMARY: &str = "virtual_primary";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthStatus {
    Active,
    Error,
    Disabled,
}

/// Per-(auth, model) quota accounting.
#[derive(Debug, Clone, Default)]
pub struct QuotaState {
    pub exceeded: bool,
    pub reason: Option<String>,
    pub next_recover_at: Option<Instant>,
    pub backoff_level: u32,
    pub last_exhausted_at: Option<Instant>,
}

/// Per-(auth, model) fine state.
#[derive(Debug, Clone)]
pub struct ModelState {
    pub status: AuthStatus,
    pub unavailable: bool,
    pub next_retry_after: Option<Instant>,
    pub last_error: Option<String>,
    pub quota: QuotaState,
}

impl Default for ModelState {
    fn default() -> Self {
        Self {
            status: AuthStatus::Active,
            unavailable: false,
            next_retry_after: None,
            last_error: None,
            quota: QuotaState::default(),
        }
    }
}

/// Auth-level rollup of the per-model quota states.
#[derive(Debug, Clone, Copy, Default)]
pub struct QuotaSummary {
    pub exceeded: bool,
    pub backoff_level: u32,
}

/// Opaque provider-private state (refreshed tokens and the like).
///
/// The manager never reaches into this; executors downcast it back to their
/// own type.
#[derive(Clone)]
pub struct RuntimeHandle(pub Arc<dyn Any + Send + Sync>);

impl RuntimeHandle {
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self(Arc::new(value))
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref::<T>()
    }
}

impl fmt::Debug for RuntimeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RuntimeHandle(..)")
    }
}

/// One credential and everything selection needs to know about it.
#[derive(Debug, Clone)]
pub struct Auth {
    pub id: String,
    /// Normalized lowercase provider tag.
    pub provider: String,
    pub label: String,
    pub status: AuthStatus,
    /// Hard-kill flag; a disabled auth is never selected again.
    pub disabled: bool,
    /// Derived: every known model state is unavailable right now.
    pub unavailable: bool,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
    pub last_refreshed_at: Option<OffsetDateTime>,
    /// When the credential's token should next be refreshed, for auths whose
    /// provider uses the token pool.
    pub next_refresh_after: Option<OffsetDateTime>,
    /// Earliest instant this auth may be tried again while unavailable.
    pub next_retry_after: Option<Instant>,
    pub last_error: Option<String>,
    /// Provider-specific JSON carried through untouched.
    pub metadata: serde_json::Value,
    /// String bag used for resolution (virtual-primary flag and the like).
    pub attributes: HashMap<String, String>,
    pub runtime: Option<RuntimeHandle>,
    pub model_states: HashMap<String, ModelState>,
    pub quota: QuotaSummary,
    /// Lazy per-auth quota-group index: group key -> block window.
    pub quota_groups: HashMap<String, GroupBlock>,
    /// Stable per-auth ordinal assigned at registration, used in usage records.
    pub index: i64,
    /// Monotonic stamp of the last time selection picked this auth.
    pub selection_seq: u64,
}

impl Auth {
    pub fn new(id: impl Into<String>, provider: impl Into<String>) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            id: id.into(),
            provider: llm_mux_common::normalize_provider(&provider.into()),
            label: String::new(),
            status: AuthStatus::Active,
            disabled: false,
            unavailable: false,
            created_at: now,
            updated_at: now,
            last_refreshed_at: None,
            next_refresh_after: None,
            next_retry_after: None,
            last_error: None,
            metadata: serde_json::Value::Null,
            attributes: HashMap::new(),
            runtime: None,
            model_states: HashMap::new(),
            quota: QuotaSummary::default(),
            quota_groups: HashMap::new(),
            index: 0,
            selection_seq: 0,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn is_virtual_primary(&self) -> bool {
        self.attributes
            .get(ATTR_VIRTUAL_PRIMARY)
            .is_some_and(|value| value == "true" || value == "1")
    }

    pub fn model_state(&self, model: &str) -> Option<&ModelState> {
        self.model_states.get(model)
    }

    pub fn model_state_mut(&mut self, model: &str) -> &mut ModelState {
        self.model_states.entry(model.to_string()).or_default()
    }

    /// Clone released to observers outside the manager's write path.
    pub fn observer_clone(&self) -> Auth {
        self.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_tag_is_normalized_on_construction() {
        let auth = Auth::new("a1", " Claude ");
        assert_eq!(auth.provider, "claude");
    }

    #[test]
    fn virtual_primary_flag_reads_attributes() {
        let mut auth = Auth::new("a1", "gemini");
        assert!(!auth.is_virtual_primary());
        auth.attributes
            .insert(ATTR_VIRTUAL_PRIMARY.to_string(), "true".to_string());
        assert!(auth.is_virtual_primary());
    }

    #[test]
    fn model_state_mut_creates_default_active_state() {
        let mut auth = Auth::new("a1", "claude");
        let state = auth.model_state_mut("claude-sonnet-4");
        assert_eq!(state.status, AuthStatus::Active);
        assert!(!state.unavailable);
    }
}
