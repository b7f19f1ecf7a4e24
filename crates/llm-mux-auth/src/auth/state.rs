//! Pure auth state transitions.
//!
//! No I/O here: the manager locks the auth, calls these, and publishes the
//! result. `update_aggregated_availability` must run before the auth is
//! released to readers; every mutation path below ends with it.

use std::time::Duration;

use tokio::time::Instant;

use crate::errors::{ErrorCategory, GatewayError};

use super::quota::next_quota_cooldown;
use super::{Auth, AuthStatus};

const AUTH_ERROR_RETRY: Duration = Duration::from_secs(30 * 60);
const NOT_FOUND_RETRY: Duration = Duration::from_secs(12 * 60 * 60);
const TRANSIENT_RETRY: Duration = Duration::from_secs(60);

/// Reset auth-level error state after a success on `model`.
///
/// Other models' states are left alone; a quota block on a sibling model is
/// the quota engine's to clear, not ours.
pub fn clear_auth_state_on_success(auth: &mut Auth, model: &str, now: Instant) {
    auth.status = AuthStatus::Active;
    auth.last_error = None;

    let state = auth.model_state_mut(model);
    state.status = AuthStatus::Active;
    state.unavailable = false;
    state.next_retry_after = None;
    state.last_error = None;
    state.quota = super::QuotaState::default();

    update_aggregated_availability(auth, now);
}

/// Fold an upstream failure into the auth, dispatching on error category.
///
/// `retry_after` is the provider-supplied recovery hint; when present it
/// overrides every computed cooldown.
pub fn apply_auth_failure_state(
    auth: &mut Auth,
    model: &str,
    err: &GatewayError,
    retry_after: Option<Duration>,
    now: Instant,
) {
    if err.category == ErrorCategory::UserError {
        // Malformed request: not the auth's fault, no penalty.
        update_aggregated_availability(auth, now);
        return;
    }

    auth.status = AuthStatus::Error;
    auth.last_error = Some(err.message.clone());

    match err.category {
        ErrorCategory::AuthRevoked => {
            auth.disabled = true;
            auth.status = AuthStatus::Disabled;
            let state = auth.model_state_mut(model);
            state.status = AuthStatus::Disabled;
            state.unavailable = true;
            state.last_error = Some(err.message.clone());
        }
        ErrorCategory::AuthError => {
            let wait = retry_after.unwrap_or(AUTH_ERROR_RETRY);
            cool_down_model(auth, model, err, now + wait);
        }
        ErrorCategory::QuotaError => {
            let state = auth.model_state_mut(model);
            let (computed, next_level) = next_quota_cooldown(state.quota.backoff_level);
            let wait = retry_after.unwrap_or(computed);
            let until = now + wait;
            state.status = AuthStatus::Error;
            state.unavailable = true;
            state.next_retry_after = Some(until);
            state.last_error = Some(err.message.clone());
            state.quota.exceeded = true;
            state.quota.reason = Some(err.message.clone());
            state.quota.next_recover_at = Some(until);
            state.quota.backoff_level = next_level;
            state.quota.last_exhausted_at = Some(now);
        }
        ErrorCategory::NotFound => {
            let wait = retry_after.unwrap_or(NOT_FOUND_RETRY);
            cool_down_model(auth, model, err, now + wait);
        }
        ErrorCategory::Transient => {
            let wait = retry_after.unwrap_or(TRANSIENT_RETRY);
            cool_down_model(auth, model, err, now + wait);
        }
        ErrorCategory::Unknown => {
            let state = auth.model_state_mut(model);
            state.status = AuthStatus::Error;
            state.last_error = Some(err.message.clone());
        }
        ErrorCategory::UserError => {}
    }

    update_aggregated_availability(auth, now);
}

fn cool_down_model(auth: &mut Auth, model: &str, err: &GatewayError, until: Instant) {
    let state = auth.model_state_mut(model);
    state.status = AuthStatus::Error;
    state.unavailable = true;
    state.next_retry_after = Some(until);
    state.last_error = Some(err.message.clone());
}

/// Recompute the auth-level rollups from the per-model states.
///
/// `unavailable` holds iff every known model state is unavailable with a
/// retry window still in the future; states whose window has elapsed are
/// cleared on the way through.
pub fn update_aggregated_availability(auth: &mut Auth, now: Instant) {
    let mut all_unavailable = !auth.model_states.is_empty();
    let mut earliest_retry: Option<Instant> = None;
    let mut any_quota_exceeded = false;
    let mut max_backoff = 0u32;

    for state in auth.model_states.values_mut() {
        if state.unavailable
            && let Some(next) = state.next_retry_after
            && next <= now
        {
            state.unavailable = false;
            state.next_retry_after = None;
        }

        if state.unavailable {
            if let Some(next) = state.next_retry_after {
                earliest_retry = Some(match earliest_retry {
                    Some(current) if current <= next => current,
                    _ => next,
                });
            }
        } else {
            all_unavailable = false;
        }

        any_quota_exceeded |= state.quota.exceeded;
        max_backoff = max_backoff.max(state.quota.backoff_level);
    }

    auth.unavailable = all_unavailable;
    auth.next_retry_after = if all_unavailable { earliest_retry } else { None };
    auth.quota.exceeded = any_quota_exceeded;
    auth.quota.backoff_level = max_backoff;
    auth.updated_at = time::OffsetDateTime::now_utc();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quota_error() -> GatewayError {
        GatewayError::from_status(429, "quota exhausted")
    }

    #[test]
    fn user_error_leaves_auth_active() {
        let mut auth = Auth::new("a1", "claude");
        let err = GatewayError::from_status(400, "bad body");
        apply_auth_failure_state(&mut auth, "claude-sonnet-4", &err, None, Instant::now());
        assert_eq!(auth.status, AuthStatus::Active);
        assert!(!auth.unavailable);
        assert!(auth.last_error.is_none());
    }

    #[test]
    fn revoked_auth_is_hard_disabled() {
        let mut auth = Auth::new("a1", "codex");
        let err = GatewayError::from_status(401, "invalid_grant");
        apply_auth_failure_state(&mut auth, "gpt-5", &err, None, Instant::now());
        assert!(auth.disabled);
        assert_eq!(auth.status, AuthStatus::Disabled);
    }

    #[test]
    fn quota_error_escalates_backoff() {
        let mut auth = Auth::new("a1", "claude");
        let now = Instant::now();
        apply_auth_failure_state(&mut auth, "claude-sonnet-4", &quota_error(), None, now);
        let first = auth.model_state("claude-sonnet-4").unwrap().quota.backoff_level;
        apply_auth_failure_state(&mut auth, "claude-sonnet-4", &quota_error(), None, now);
        let second = auth.model_state("claude-sonnet-4").unwrap().quota.backoff_level;
        assert!(second > first);
        assert!(auth.quota.exceeded);
        assert_eq!(auth.quota.backoff_level, second);
    }

    #[test]
    fn retry_after_overrides_computed_cooldown() {
        let mut auth = Auth::new("a1", "claude");
        let now = Instant::now();
        apply_auth_failure_state(
            &mut auth,
            "claude-sonnet-4",
            &quota_error(),
            Some(Duration::from_secs(2)),
            now,
        );
        let state = auth.model_state("claude-sonnet-4").unwrap();
        assert_eq!(state.next_retry_after, Some(now + Duration::from_secs(2)));
    }

    #[test]
    fn aggregation_tracks_all_models() {
        let mut auth = Auth::new("a1", "gemini");
        let now = Instant::now();
        let err = GatewayError::from_status(503, "down");
        apply_auth_failure_state(&mut auth, "gemini-2.5-pro", &err, None, now);
        assert!(auth.unavailable, "single blocked model blocks the auth");

        // A second, healthy model makes the auth available again.
        auth.model_state_mut("gemini-2.5-flash");
        update_aggregated_availability(&mut auth, now);
        assert!(!auth.unavailable);
        assert_eq!(auth.next_retry_after, None);
    }

    #[test]
    fn aggregation_picks_earliest_retry() {
        let mut auth = Auth::new("a1", "gemini");
        let now = Instant::now();
        let late = now + Duration::from_secs(300);
        let early = now + Duration::from_secs(30);
        {
            let state = auth.model_state_mut("gemini-2.5-pro");
            state.unavailable = true;
            state.next_retry_after = Some(late);
        }
        {
            let state = auth.model_state_mut("gemini-2.5-flash");
            state.unavailable = true;
            state.next_retry_after = Some(early);
        }
        update_aggregated_availability(&mut auth, now);
        assert!(auth.unavailable);
        assert_eq!(auth.next_retry_after, Some(early));
    }

    #[test]
    fn success_clears_only_the_succeeding_model() {
        let mut auth = Auth::new("a1", "gemini");
        let now = Instant::now();
        let err = GatewayError::from_status(503, "down");
        apply_auth_failure_state(&mut auth, "gemini-2.5-pro", &err, None, now);
        apply_auth_failure_state(&mut auth, "gemini-2.5-flash", &err, None, now);

        clear_auth_state_on_success(&mut auth, "gemini-2.5-pro", now);
        assert_eq!(auth.status, AuthStatus::Active);
        assert!(!auth.model_state("gemini-2.5-pro").unwrap().unavailable);
        assert!(auth.model_state("gemini-2.5-flash").unwrap().unavailable);
        assert!(!auth.unavailable);
    }
}
