//! Lock-free runtime settings.
//!
//! Two process-wide toggles exist (quota cooldown disable for tests/debug,
//! statistics enable); everything else lives on a shared [`RuntimeSettings`]
//! handle so config reloads never take a lock on the request path.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

static COOLDOWN_DISABLED: AtomicBool = AtomicBool::new(false);
static STATISTICS_ENABLED: AtomicBool = AtomicBool::new(true);

/// Disable quota cooldowns process-wide. Intended for tests and debugging.
pub fn set_cooldown_disabled(disabled: bool) {
    COOLDOWN_DISABLED.store(disabled, Ordering::Relaxed);
}

pub fn cooldown_disabled() -> bool {
    COOLDOWN_DISABLED.load(Ordering::Relaxed)
}

pub fn set_statistics_enabled(enabled: bool) {
    STATISTICS_ENABLED.store(enabled, Ordering::Relaxed);
}

pub fn statistics_enabled() -> bool {
    STATISTICS_ENABLED.load(Ordering::Relaxed)
}

/// Reloadable per-process settings shared by the manager and registry.
#[derive(Debug)]
pub struct RuntimeSettings {
    /// Extra attempts after the first failed one. `max_attempts = retry + 1`.
    request_retry: AtomicU32,
    /// Upper bound on cooldown-aware waiting, in milliseconds.
    max_retry_interval_ms: AtomicU64,
    /// Emit `"[Display] id"` model IDs from the registry listing.
    show_provider_prefix: AtomicBool,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            request_retry: AtomicU32::new(2),
            max_retry_interval_ms: AtomicU64::new(30_000),
            show_provider_prefix: AtomicBool::new(false),
        }
    }
}

impl RuntimeSettings {
    pub fn request_retry(&self) -> u32 {
        self.request_retry.load(Ordering::Relaxed)
    }

    pub fn set_request_retry(&self, retry: u32) {
        self.request_retry.store(retry, Ordering::Relaxed);
    }

    pub fn max_attempts(&self) -> u32 {
        self.request_retry().saturating_add(1).max(1)
    }

    pub fn max_retry_interval(&self) -> Duration {
        Duration::from_millis(self.max_retry_interval_ms.load(Ordering::Relaxed))
    }

    pub fn set_max_retry_interval(&self, interval: Duration) {
        self.max_retry_interval_ms
            .store(interval.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn show_provider_prefix(&self) -> bool {
        self.show_provider_prefix.load(Ordering::Relaxed)
    }

    pub fn set_show_provider_prefix(&self, show: bool) {
        self.show_provider_prefix.store(show, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max_attempts_is_at_least_one() {
        let settings = RuntimeSettings::default();
        settings.set_request_retry(0);
        assert_eq!(settings.max_attempts(), 1);
        settings.set_request_retry(3);
        assert_eq!(settings.max_attempts(), 4);
    }

    #[test]
    fn retry_interval_round_trips() {
        let settings = RuntimeSettings::default();
        settings.set_max_retry_interval(Duration::from_secs(7));
        assert_eq!(settings.max_retry_interval(), Duration::from_secs(7));
    }
}
