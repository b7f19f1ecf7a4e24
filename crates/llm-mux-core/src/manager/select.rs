//! Provider ordering.
//!
//! Providers are scored best-first; the leading group of equal scores is
//! rotated by an atomic cursor so equally-good providers share load instead
//! of the first one taking every request.

use std::sync::atomic::{AtomicU64, Ordering};

use llm_mux_auth::ProviderStats;
use llm_mux_common::normalize_provider;

/// Lowercase, trim, dedupe; input order is preserved for the survivors.
pub fn normalize_providers(providers: &[String]) -> Vec<String> {
    let mut seen = Vec::new();
    for provider in providers {
        let normalized = normalize_provider(provider);
        if normalized.is_empty() || seen.contains(&normalized) {
            continue;
        }
        seen.push(normalized);
    }
    seen
}

#[derive(Debug, Default)]
pub struct ProviderSelector {
    cursor: AtomicU64,
}

impl ProviderSelector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Score-sorted provider order with round-robin rotation of the
    /// top equal-score group.
    pub fn order(&self, stats: &ProviderStats, model: &str, providers: Vec<String>) -> Vec<String> {
        if providers.len() <= 1 {
            return providers;
        }
        let mut sorted = stats.sort_by_score(&providers, model);
        let best = stats.score(&sorted[0], model);
        let mut head = 1;
        while head < sorted.len() && (stats.score(&sorted[head], model) - best).abs() < 1e-9 {
            head += 1;
        }
        if head > 1 {
            let shift = (self.cursor.fetch_add(1, Ordering::Relaxed) % head as u64) as usize;
            sorted[..head].rotate_left(shift);
        }
        sorted
    }
}
