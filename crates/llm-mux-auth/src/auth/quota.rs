//! Quota and cooldown accounting.
//!
//! Some providers meter a family of models out of one upstream bucket;
//! exhausting `claude-sonnet-4` on such an auth means `claude-opus-4` is
//! already dead on it too. A pluggable per-provider resolver maps a model to
//! its quota group, and the per-auth group index blocks siblings that have
//! never even been requested yet.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use super::{Auth, AuthStatus};

const MIN_QUOTA_COOLDOWN: Duration = Duration::from_secs(1);
const MAX_QUOTA_COOLDOWN: Duration = Duration::from_secs(30 * 60);

/// Block window stored in the per-auth group index.
#[derive(Debug, Clone, Copy)]
pub struct GroupBlock {
    pub blocked_until: Instant,
    pub backoff_until: Option<Instant>,
}

/// Maps a model to its quota group key. Must be pure.
pub trait QuotaGroupResolver: Send + Sync {
    fn resolve(&self, model: &str) -> Option<String>;
}

impl<F> QuotaGroupResolver for F
where
    F: Fn(&str) -> Option<String> + Send + Sync,
{
    fn resolve(&self, model: &str) -> Option<String> {
        self(model)
    }
}

/// Per-provider resolver registry, built once at startup.
#[derive(Default)]
pub struct QuotaGroupResolvers {
    by_provider: HashMap<String, Arc<dyn QuotaGroupResolver>>,
}

impl QuotaGroupResolvers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        mut self,
        provider: impl Into<String>,
        resolver: Arc<dyn QuotaGroupResolver>,
    ) -> Self {
        self.by_provider
            .insert(llm_mux_common::normalize_provider(&provider.into()), resolver);
        self
    }

    pub fn resolve(&self, provider: &str, model: &str) -> Option<String> {
        self.by_provider.get(provider)?.resolve(model)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockReason {
    None,
    Disabled,
    ModelCooldown,
    QuotaGroup,
}

#[derive(Debug, Clone, Copy)]
pub struct BlockDecision {
    pub blocked: bool,
    pub reason: BlockReason,
    pub next: Option<Instant>,
}

impl BlockDecision {
    fn open() -> Self {
        Self {
            blocked: false,
            reason: BlockReason::None,
            next: None,
        }
    }
}

/// Exponential quota cooldown: `clamp(1s * 2^prev_level, 1s, 30m)`.
///
/// Returns the wait plus the level to store for the next exhaustion. The
/// process-wide cooldown toggle short-circuits to zero wait.
pub fn next_quota_cooldown(prev_level: u32) -> (Duration, u32) {
    if llm_mux_common::cooldown_disabled() {
        return (Duration::ZERO, prev_level);
    }
    let factor = 1u64 << prev_level.min(11);
    let wait = MIN_QUOTA_COOLDOWN
        .saturating_mul(factor as u32)
        .clamp(MIN_QUOTA_COOLDOWN, MAX_QUOTA_COOLDOWN);
    (wait, prev_level + 1)
}

/// Mark every known sibling of `model` in its quota group unavailable and
/// remember the block so first-seen siblings stay blocked too. Idempotent.
pub fn propagate_quota_to_group(
    resolvers: &QuotaGroupResolvers,
    auth: &mut Auth,
    model: &str,
    next_retry_after: Instant,
    now: Instant,
) {
    let Some(group) = resolvers.resolve(&auth.provider, model) else {
        return;
    };

    let provider = auth.provider.clone();
    let siblings: Vec<String> = auth
        .model_states
        .keys()
        .filter(|known| {
            known.as_str() != model
                && resolvers.resolve(&provider, known).as_deref() == Some(group.as_str())
        })
        .cloned()
        .collect();

    for sibling in siblings {
        let state = auth.model_state_mut(&sibling);
        state.unavailable = true;
        state.next_retry_after = Some(next_retry_after);
        state.quota.exceeded = true;
        state.quota.last_exhausted_at = Some(now);
    }

    auth.quota_groups.insert(
        group,
        GroupBlock {
            blocked_until: next_retry_after,
            backoff_until: Some(next_retry_after),
        },
    );
}

/// Clear quota blocks for `model`'s whole group after a success on it.
pub fn clear_quota_group_on_success(
    resolvers: &QuotaGroupResolvers,
    auth: &mut Auth,
    model: &str,
) {
    let Some(group) = resolvers.resolve(&auth.provider, model) else {
        return;
    };

    let provider = auth.provider.clone();
    let members: Vec<String> = auth
        .model_states
        .keys()
        .filter(|known| resolvers.resolve(&provider, known).as_deref() == Some(group.as_str()))
        .cloned()
        .collect();

    for member in members {
        let state = auth.model_state_mut(&member);
        state.quota = super::QuotaState::default();
        state.unavailable = false;
        state.next_retry_after = None;
    }

    auth.quota_groups.remove(&group);
}

/// Decide whether `auth` may be tried for `model` right now.
///
/// Expired per-model and group windows are cleared in place, so a blocked
/// verdict always carries a future `next` (except for disabled auths).
pub fn is_auth_blocked_for_model(
    resolvers: &QuotaGroupResolvers,
    auth: &mut Auth,
    model: &str,
    now: Instant,
) -> BlockDecision {
    if auth.disabled {
        return BlockDecision {
            blocked: true,
            reason: BlockReason::Disabled,
            next: None,
        };
    }

    if let Some(state) = auth.model_states.get_mut(model) {
        if state.unavailable {
            match state.next_retry_after {
                Some(next) if next > now => {
                    return BlockDecision {
                        blocked: true,
                        reason: BlockReason::ModelCooldown,
                        next: Some(next),
                    };
                }
                _ => {
                    // Window elapsed; make the model selectable again.
                    state.unavailable = false;
                    state.next_retry_after = None;
                    state.quota.exceeded = false;
                    if state.status == AuthStatus::Error {
                        state.status = AuthStatus::Active;
                    }
                }
            }
        }
    }

    if let Some(group) = resolvers.resolve(&auth.provider, model) {
        if let Some(block) = auth.quota_groups.get(&group) {
            if block.blocked_until > now {
                return BlockDecision {
                    blocked: true,
                    reason: BlockReason::QuotaGroup,
                    next: Some(block.blocked_until),
                };
            }
            auth.quota_groups.remove(&group);
        }
    }

    BlockDecision::open()
}
