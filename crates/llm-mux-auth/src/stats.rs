//! Per-(provider, model) scoring.
//!
//! Recording sits on the hot path next to stream completion, so the leaves
//! are atomics only; the membership map takes its write lock exactly once
//! per (provider, model) pair.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

const LATENCY_ALPHA: f64 = 0.2;
/// Latency at which the score halves; keeps scores dimensionless.
const LATENCY_NORMALIZER: f64 = 1.0;

#[derive(Debug, Default)]
struct ModelScore {
    requests: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    /// EWMA latency in seconds, stored as f64 bits.
    latency_ewma: AtomicU64,
}

impl ModelScore {
    fn record(&self, ok: bool, latency: Duration) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        if ok {
            self.successes.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failures.fetch_add(1, Ordering::Relaxed);
        }

        let sample = latency.as_secs_f64();
        let mut current = self.latency_ewma.load(Ordering::Relaxed);
        loop {
            let prev = f64::from_bits(current);
            let next = if self.requests.load(Ordering::Relaxed) <= 1 {
                sample
            } else {
                prev + LATENCY_ALPHA * (sample - prev)
            };
            match self.latency_ewma.compare_exchange_weak(
                current,
                next.to_bits(),
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }
    }

    fn score(&self) -> f64 {
        let requests = self.requests.load(Ordering::Relaxed);
        if requests == 0 {
            return 1.0;
        }
        let successes = self.successes.load(Ordering::Relaxed);
        let success_rate = successes as f64 / requests as f64;
        let latency = f64::from_bits(self.latency_ewma.load(Ordering::Relaxed));
        success_rate * (1.0 / (1.0 + latency / LATENCY_NORMALIZER))
    }
}

/// Snapshot of one (provider, model) counter triple.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub requests: u64,
    pub successes: u64,
    pub failures: u64,
}

#[derive(Default)]
pub struct ProviderStats {
    scores: RwLock<HashMap<(String, String), Arc<ModelScore>>>,
}

impl ProviderStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, provider: &str, model: &str, ok: bool, latency: Duration) {
        if !llm_mux_common::statistics_enabled() {
            return;
        }
        self.entry(provider, model).record(ok, latency);
    }

    pub fn score(&self, provider: &str, model: &str) -> f64 {
        let key = (provider.to_string(), model.to_string());
        match self.scores.read().expect("stats lock poisoned").get(&key) {
            Some(score) => score.score(),
            None => 1.0,
        }
    }

    pub fn snapshot(&self, provider: &str, model: &str) -> StatsSnapshot {
        let key = (provider.to_string(), model.to_string());
        match self.scores.read().expect("stats lock poisoned").get(&key) {
            Some(score) => StatsSnapshot {
                requests: score.requests.load(Ordering::Relaxed),
                successes: score.successes.load(Ordering::Relaxed),
                failures: score.failures.load(Ordering::Relaxed),
            },
            None => StatsSnapshot::default(),
        }
    }

    /// Stable best-first reorder of `providers`; ties preserve input order.
    pub fn sort_by_score(&self, providers: &[String], model: &str) -> Vec<String> {
        let mut scored: Vec<(f64, String)> = providers
            .iter()
            .map(|provider| (self.score(provider, model), provider.clone()))
            .collect();
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        scored.into_iter().map(|(_, provider)| provider).collect()
    }

    fn entry(&self, provider: &str, model: &str) -> Arc<ModelScore> {
        let key = (provider.to_string(), model.to_string());
        if let Some(score) = self.scores.read().expect("stats lock poisoned").get(&key) {
            return score.clone();
        }
        let mut guard = self.scores.write().expect("stats lock poisoned");
        guard.entry(key).or_default().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unseen_pairs_score_neutral() {
        let stats = ProviderStats::new();
        assert_eq!(stats.score("claude", "claude-sonnet-4"), 1.0);
    }

    #[test]
    fn failures_lower_the_score() {
        let stats = ProviderStats::new();
        stats.record("claude", "m", true, Duration::from_millis(100));
        stats.record("claude", "m", false, Duration::from_millis(100));
        let score = stats.score("claude", "m");
        assert!(score < 1.0 && score > 0.0);

        let snap = stats.snapshot("claude", "m");
        assert_eq!(snap.requests, 2);
        assert_eq!(snap.successes, 1);
        assert_eq!(snap.failures, 1);
    }

    #[test]
    fn slower_provider_sorts_after_faster_one() {
        let stats = ProviderStats::new();
        for _ in 0..16 {
            stats.record("fast", "m", true, Duration::from_millis(50));
            stats.record("slow", "m", true, Duration::from_secs(3));
        }
        let sorted = stats.sort_by_score(
            &["slow".to_string(), "fast".to_string()],
            "m",
        );
        assert_eq!(sorted, vec!["fast".to_string(), "slow".to_string()]);
    }

    #[test]
    fn ties_preserve_input_order() {
        let stats = ProviderStats::new();
        let input = vec!["b".to_string(), "a".to_string(), "c".to_string()];
        assert_eq!(stats.sort_by_score(&input, "m"), input);
    }

    #[test]
    fn parallel_recording_does_not_lose_counts() {
        let stats = Arc::new(ProviderStats::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let stats = stats.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..1000 {
                    stats.record("p", "m", true, Duration::from_millis(10));
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(stats.snapshot("p", "m").requests, 8000);
    }
}
