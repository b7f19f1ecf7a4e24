//! Operational events.
//!
//! Cooldown and disable transitions are broadcast so dashboards and log
//! sinks can follow selection health without polling the manager.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};
use std::time::SystemTime;

use tokio::sync::broadcast;

#[derive(Debug, Clone)]
pub enum OperationalEvent {
    CooldownStart(CooldownStartEvent),
    CooldownEnd(CooldownEndEvent),
    AuthDisabled(AuthDisabledEvent),
}

#[derive(Debug, Clone)]
pub struct CooldownStartEvent {
    pub at: SystemTime,
    pub auth_id: String,
    /// None for auth-wide cooldowns.
    pub model: Option<String>,
    pub reason: String,
    pub until: SystemTime,
}

#[derive(Debug, Clone)]
pub struct CooldownEndEvent {
    pub at: SystemTime,
    pub auth_id: String,
    pub model: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AuthDisabledEvent {
    pub at: SystemTime,
    pub auth_id: String,
    pub reason: String,
}

pub trait EventSink: Send + Sync {
    fn write<'a>(
        &'a self,
        event: &'a OperationalEvent,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>>;
}

/// Fan-out hub: a broadcast channel for subscribers plus registered sinks.
///
/// Sink writes run on their own tasks; a slow sink never stalls the
/// selection path that emitted the event.
#[derive(Clone)]
pub struct EventHub {
    inner: Arc<HubInner>,
}

struct HubInner {
    tx: broadcast::Sender<OperationalEvent>,
    sinks: RwLock<Vec<Arc<dyn EventSink>>>,
}

impl EventHub {
    pub fn new(buffer: usize) -> Self {
        let (tx, _) = broadcast::channel(buffer);
        Self {
            inner: Arc::new(HubInner {
                tx,
                sinks: RwLock::new(Vec::new()),
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OperationalEvent> {
        self.inner.tx.subscribe()
    }

    pub async fn add_sink(&self, sink: Arc<dyn EventSink>) {
        self.inner
            .sinks
            .write()
            .expect("event sink registry poisoned")
            .push(sink);
    }

    pub async fn emit(&self, event: OperationalEvent) {
        let _ = self.inner.tx.send(event.clone());
        let sinks = self
            .inner
            .sinks
            .read()
            .expect("event sink registry poisoned")
            .clone();
        for sink in sinks {
            let event = event.clone();
            tokio::spawn(async move {
                sink.write(&event).await;
            });
        }
    }
}
