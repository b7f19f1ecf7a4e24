//! Batched usage pipeline.
//!
//! `record` never blocks the request path: counters are atomics and the
//! queue send is `try_send`, dropping (with a warning) under saturation.
//! One writer task batches into the store, one cleaner enforces retention.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;

use sea_orm::DbErr;
use time::OffsetDateTime;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{self as tokio_time, MissedTickBehavior};
use tracing::{info, warn};

use llm_mux_auth::{UsageRecord, UsageSink};

use crate::store::UsageStore;

const FLUSH_RETRIES: u32 = 3;
const FLUSH_RETRY_DELAY: Duration = Duration::from_millis(200);

#[derive(Debug, Clone)]
pub struct UsageBackendConfig {
    pub queue_capacity: usize,
    pub batch_size: usize,
    pub flush_interval: Duration,
    pub cleanup_interval: Duration,
    pub retention_days: u32,
}

impl Default for UsageBackendConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1000,
            batch_size: 100,
            flush_interval: Duration::from_secs(5),
            cleanup_interval: Duration::from_secs(24 * 60 * 60),
            retention_days: 30,
        }
    }
}

/// Live counters, seeded from storage at startup so dashboards survive a
/// restart.
#[derive(Debug, Default)]
pub struct UsageCounters {
    pub total: AtomicI64,
    pub success: AtomicI64,
    pub failure: AtomicI64,
    pub dropped: AtomicI64,
    pub input_tokens: AtomicI64,
    pub output_tokens: AtomicI64,
    pub total_tokens: AtomicI64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UsageCountersSnapshot {
    pub total: i64,
    pub success: i64,
    pub failure: i64,
    pub dropped: i64,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub total_tokens: i64,
}

impl UsageCounters {
    pub fn snapshot(&self) -> UsageCountersSnapshot {
        UsageCountersSnapshot {
            total: self.total.load(Ordering::Relaxed),
            success: self.success.load(Ordering::Relaxed),
            failure: self.failure.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            input_tokens: self.input_tokens.load(Ordering::Relaxed),
            output_tokens: self.output_tokens.load(Ordering::Relaxed),
            total_tokens: self.total_tokens.load(Ordering::Relaxed),
        }
    }
}

pub struct UsageBackend {
    store: UsageStore,
    tx: mpsc::Sender<UsageRecord>,
    counters: Arc<UsageCounters>,
    stop_tx: watch::Sender<bool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl UsageBackend {
    /// Sync the schema, seed counters from stored stats, start the write and
    /// cleanup loops.
    pub async fn start(store: UsageStore, config: UsageBackendConfig) -> Result<Arc<Self>, DbErr> {
        store.sync().await?;

        let counters = Arc::new(UsageCounters::default());
        let stats = store.query_global_stats().await?;
        let failed = store.count_failed().await? as i64;
        counters
            .total
            .store(stats.total_requests(), Ordering::Relaxed);
        counters.failure.store(failed, Ordering::Relaxed);
        counters
            .success
            .store(stats.total_requests() - failed, Ordering::Relaxed);
        counters
            .input_tokens
            .store(stats.input_tokens.unwrap_or(0), Ordering::Relaxed);
        counters
            .output_tokens
            .store(stats.output_tokens.unwrap_or(0), Ordering::Relaxed);
        counters
            .total_tokens
            .store(stats.total_tokens.unwrap_or(0), Ordering::Relaxed);

        let (tx, rx) = mpsc::channel(config.queue_capacity);
        let (stop_tx, stop_rx) = watch::channel(false);

        let mut handles = Vec::new();
        handles.push(tokio::spawn(write_loop(
            store.clone(),
            rx,
            config.clone(),
            stop_rx.clone(),
        )));
        handles.push(tokio::spawn(cleanup_loop(
            store.clone(),
            config.clone(),
            stop_rx,
        )));

        Ok(Arc::new(Self {
            store,
            tx,
            counters,
            stop_tx,
            handles: Mutex::new(handles),
            stopped: AtomicBool::new(false),
        }))
    }

    pub fn counters(&self) -> &UsageCounters {
        &self.counters
    }

    /// Idempotent: signal the loops, wait for the drain + final flush, close
    /// the store.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.stop_tx.send(true);
        let handles: Vec<JoinHandle<()>> = {
            let mut guard = self.handles.lock().await;
            guard.drain(..).collect()
        };
        for handle in handles {
            let _ = handle.await;
        }
        let _ = self.store.connection().clone().close().await;
        info!(event = "usage_backend_stopped");
    }
}

impl UsageSink for UsageBackend {
    fn record(&self, record: UsageRecord) {
        self.counters.total.fetch_add(1, Ordering::Relaxed);
        if record.failed {
            self.counters.failure.fetch_add(1, Ordering::Relaxed);
        } else {
            self.counters.success.fetch_add(1, Ordering::Relaxed);
        }
        self.counters
            .input_tokens
            .fetch_add(record.tokens.input, Ordering::Relaxed);
        self.counters
            .output_tokens
            .fetch_add(record.tokens.output, Ordering::Relaxed);
        self.counters
            .total_tokens
            .fetch_add(record.tokens.total, Ordering::Relaxed);

        match self.tx.try_send(record) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(event = "usage_record_dropped", reason = "queue_full");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

async fn write_loop(
    store: UsageStore,
    mut rx: mpsc::Receiver<UsageRecord>,
    config: UsageBackendConfig,
    mut stop_rx: watch::Receiver<bool>,
) {
    let mut buffer: Vec<UsageRecord> = Vec::with_capacity(config.batch_size);
    let mut ticker = tokio_time::interval(config.flush_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            Some(record) = rx.recv() => {
                buffer.push(record);
                if buffer.len() >= config.batch_size {
                    flush(&store, &mut buffer).await;
                }
            }
            _ = ticker.tick() => {
                if !buffer.is_empty() {
                    flush(&store, &mut buffer).await;
                }
            }
            _ = stop_rx.changed() => {
                // Drain whatever is queued, then final-flush.
                while let Ok(record) = rx.try_recv() {
                    buffer.push(record);
                    if buffer.len() >= config.batch_size {
                        flush(&store, &mut buffer).await;
                    }
                }
                if !buffer.is_empty() {
                    flush(&store, &mut buffer).await;
                }
                break;
            }
            else => {
                if !buffer.is_empty() {
                    flush(&store, &mut buffer).await;
                }
                break;
            }
        }
    }
}

async fn flush(store: &UsageStore, buffer: &mut Vec<UsageRecord>) {
    let mut batch = Vec::new();
    std::mem::swap(buffer, &mut batch);

    for attempt in 1..=FLUSH_RETRIES {
        match store.insert_batch(&batch).await {
            Ok(()) => return,
            Err(err) => {
                warn!(event = "usage_flush_failed", attempt, error = %err);
                if attempt < FLUSH_RETRIES {
                    tokio_time::sleep(FLUSH_RETRY_DELAY).await;
                }
            }
        }
    }
    // At-most-once: a batch that cannot be written is given up on.
    warn!(event = "usage_batch_dropped", size = batch.len());
}

async fn cleanup_loop(
    store: UsageStore,
    config: UsageBackendConfig,
    mut stop_rx: watch::Receiver<bool>,
) {
    let mut ticker = tokio_time::interval(config.cleanup_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let cutoff = OffsetDateTime::now_utc()
                    - time::Duration::days(i64::from(config.retention_days));
                match store.delete_older_than(cutoff).await {
                    Ok(0) => {}
                    Ok(deleted) => info!(event = "usage_retention_cleanup", deleted),
                    Err(err) => warn!(event = "usage_cleanup_failed", error = %err),
                }
            }
            _ = stop_rx.changed() => break,
        }
    }
}
