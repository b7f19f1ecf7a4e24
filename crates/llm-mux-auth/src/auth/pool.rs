//! Pool for refreshable-token credentials.
//!
//! Entry fields are atomics so `pick` and the refresh loop never contend;
//! the map lock only covers membership. Picks hand out an RAII lease that
//! decrements `active_requests` on drop, so a request aborted anywhere in
//! the pipeline still releases its slot.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::task::JoinHandle;
use tokio::time::{self as tokio_time, MissedTickBehavior};
use tracing::warn;

use crate::errors::GatewayError;

const REFRESH_TICK: Duration = Duration::from_secs(30);
const REFRESH_ATTEMPTS: u32 = 3;
const REFRESH_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(10);
const REFRESH_BACKOFF_STEP: Duration = Duration::from_secs(2);

fn epoch_ms() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

#[derive(Debug, Clone)]
pub struct RefreshedToken {
    pub access_token: String,
    pub expires_at_ms: i64,
    pub refresh_at_ms: i64,
}

/// Exchanges a stale credential for a fresh token. Provider-specific.
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn refresh(&self, auth_id: &str) -> Result<RefreshedToken, GatewayError>;
}

pub struct PoolEntry {
    auth_id: String,
    provider: String,
    access_token: ArcSwapOption<String>,
    token_expires_at_ms: AtomicI64,
    token_refresh_at_ms: AtomicI64,
    active_requests: AtomicU32,
    cooldown_until_ms: AtomicI64,
    refreshing: AtomicBool,
}

impl PoolEntry {
    pub fn new(
        auth_id: impl Into<String>,
        provider: impl Into<String>,
        access_token: Option<String>,
        expires_at_ms: i64,
        refresh_at_ms: i64,
    ) -> Self {
        Self {
            auth_id: auth_id.into(),
            provider: llm_mux_common::normalize_provider(&provider.into()),
            access_token: ArcSwapOption::from(access_token.map(Arc::new)),
            token_expires_at_ms: AtomicI64::new(expires_at_ms),
            token_refresh_at_ms: AtomicI64::new(refresh_at_ms),
            active_requests: AtomicU32::new(0),
            cooldown_until_ms: AtomicI64::new(0),
            refreshing: AtomicBool::new(false),
        }
    }

    pub fn auth_id(&self) -> &str {
        &self.auth_id
    }

    pub fn token(&self) -> Option<Arc<String>> {
        self.access_token.load_full()
    }

    pub fn active_requests(&self) -> u32 {
        self.active_requests.load(Ordering::Relaxed)
    }

    pub fn set_cooldown_until_ms(&self, until_ms: i64) {
        self.cooldown_until_ms.store(until_ms, Ordering::Relaxed);
    }

    /// Usable now: not cooling down, token outlives `buffer`.
    pub fn ready(&self, buffer: Duration) -> bool {
        let now = epoch_ms();
        if self.cooldown_until_ms.load(Ordering::Relaxed) > now {
            return false;
        }
        now + buffer.as_millis() as i64 <= self.token_expires_at_ms.load(Ordering::Relaxed)
    }

    fn apply(&self, token: RefreshedToken) {
        self.access_token.store(Some(Arc::new(token.access_token)));
        self.token_expires_at_ms
            .store(token.expires_at_ms, Ordering::Relaxed);
        self.token_refresh_at_ms
            .store(token.refresh_at_ms, Ordering::Relaxed);
    }
}

/// Decrements `active_requests` on drop.
pub struct PoolLease {
    entry: Arc<PoolEntry>,
}

impl PoolLease {
    pub fn entry(&self) -> &PoolEntry {
        &self.entry
    }
}

impl Drop for PoolLease {
    fn drop(&mut self) {
        self.entry.active_requests.fetch_sub(1, Ordering::Relaxed);
    }
}

pub struct TokenPool {
    entries: RwLock<HashMap<String, Arc<PoolEntry>>>,
    refresher: Arc<dyn TokenRefresher>,
}

impl TokenPool {
    pub fn new(refresher: Arc<dyn TokenRefresher>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            refresher,
        }
    }

    pub fn insert(&self, entry: PoolEntry) {
        let mut guard = self.entries.write().expect("token pool lock poisoned");
        guard.insert(entry.auth_id.clone(), Arc::new(entry));
    }

    pub fn remove(&self, auth_id: &str) {
        let mut guard = self.entries.write().expect("token pool lock poisoned");
        guard.remove(auth_id);
    }

    pub fn get(&self, auth_id: &str) -> Option<Arc<PoolEntry>> {
        let guard = self.entries.read().expect("token pool lock poisoned");
        guard.get(auth_id).cloned()
    }

    /// Least-loaded ready entry for `provider`. The returned lease holds a
    /// slot on the entry until dropped.
    pub fn pick(&self, provider: &str, buffer: Duration) -> Option<PoolLease> {
        let provider = llm_mux_common::normalize_provider(provider);
        let guard = self.entries.read().expect("token pool lock poisoned");
        let chosen = guard
            .values()
            .filter(|entry| entry.provider == provider && entry.ready(buffer))
            .min_by_key(|entry| entry.active_requests())
            .cloned()?;
        drop(guard);

        chosen.active_requests.fetch_add(1, Ordering::Relaxed);
        Some(PoolLease { entry: chosen })
    }

    /// 30 s refresh loop: one refresh task per due entry, guarded by a CAS
    /// so overlapping ticks never double-refresh.
    pub fn spawn_refresh_loop(self: Arc<Self>) -> JoinHandle<()> {
        let pool = self;
        tokio::spawn(async move {
            let mut ticker = tokio_time::interval(REFRESH_TICK);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let now = epoch_ms();
                let due: Vec<Arc<PoolEntry>> = {
                    let guard = pool.entries.read().expect("token pool lock poisoned");
                    guard
                        .values()
                        .filter(|entry| {
                            entry.token_refresh_at_ms.load(Ordering::Relaxed) < now
                                && entry
                                    .refreshing
                                    .compare_exchange(
                                        false,
                                        true,
                                        Ordering::AcqRel,
                                        Ordering::Acquire,
                                    )
                                    .is_ok()
                        })
                        .cloned()
                        .collect()
                };
                for entry in due {
                    let refresher = pool.refresher.clone();
                    tokio::spawn(async move {
                        refresh_entry(&refresher, &entry).await;
                        entry.refreshing.store(false, Ordering::Release);
                    });
                }
            }
        })
    }
}

async fn refresh_entry(refresher: &Arc<dyn TokenRefresher>, entry: &Arc<PoolEntry>) {
    for attempt in 1..=REFRESH_ATTEMPTS {
        match tokio_time::timeout(REFRESH_ATTEMPT_TIMEOUT, refresher.refresh(&entry.auth_id)).await
        {
            Ok(Ok(token)) => {
                entry.apply(token);
                return;
            }
            Ok(Err(err)) => {
                warn!(
                    event = "token_refresh_failed",
                    auth_id = %entry.auth_id,
                    attempt,
                    error = %err
                );
            }
            Err(_) => {
                warn!(
                    event = "token_refresh_timeout",
                    auth_id = %entry.auth_id,
                    attempt
                );
            }
        }
        if attempt < REFRESH_ATTEMPTS {
            tokio_time::sleep(REFRESH_BACKOFF_STEP * attempt).await;
        }
    }
}
