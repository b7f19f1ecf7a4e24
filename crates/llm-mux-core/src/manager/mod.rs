//! The auth manager: central selection loop.
//!
//! Every request walks the same template: order the candidate providers,
//! translate the model ID per provider, then pick not-yet-tried auths until
//! one succeeds, feeding every terminal result back into auth state, quota
//! groups, provider stats, and the usage sink. Executors are always invoked
//! with no manager lock held.

mod select;

pub use select::{ProviderSelector, normalize_providers};

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

use tokio::sync::{Mutex, RwLock, mpsc};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use llm_mux_auth::auth::{quota, state};
use llm_mux_auth::{
    Auth, AuthDisabledEvent, AuthStatus, AuthUpdate, AuthUpdateAction, BlockReason,
    CooldownEndEvent, CooldownStartEvent, ErrorCategory, EventHub, ExecOptions, ExecRequest,
    ExecResponse, Executor, GatewayError, GatewayResult, ModelInfo, ModelRegistry,
    OperationalEvent, ProviderStats, QuotaGroupResolvers, RequestContext, SharedUsageSink,
    StreamChunk, StreamOutcome, TokenUsage, UsageRecord, forward_stream,
};
use llm_mux_common::{RuntimeSettings, normalize_model_id};

const AVAILABILITY_POLL: Duration = Duration::from_millis(500);

/// Produces the model list an auth advertises at registration time.
pub trait ModelRegistrar: Send + Sync {
    fn models_for(&self, auth: &Auth) -> Vec<ModelInfo>;
}

/// Supplies an executor for an auth's provider when one is not already
/// registered. Invoked during watcher ingestion so a provider that first
/// appears at runtime gets an adapter without a restart.
pub trait ExecutorRegistrar: Send + Sync {
    fn executor_for(&self, auth: &Auth) -> Option<Arc<dyn Executor>>;
}

/// Default registrar: reads the `models` array from auth metadata.
#[derive(Debug, Default)]
pub struct MetadataModelRegistrar;

impl ModelRegistrar for MetadataModelRegistrar {
    fn models_for(&self, auth: &Auth) -> Vec<ModelInfo> {
        auth.metadata
            .get("models")
            .cloned()
            .and_then(|value| serde_json::from_value::<Vec<ModelInfo>>(value).ok())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy)]
enum UnaryOp {
    Execute,
    CountTokens,
}

/// Everything result feedback needs, detached from the manager so stream
/// completion hooks can outlive the calling request.
#[derive(Clone)]
struct Feedback {
    registry: Arc<ModelRegistry>,
    stats: Arc<ProviderStats>,
    resolvers: Arc<QuotaGroupResolvers>,
    usage: SharedUsageSink,
    events: EventHub,
}

#[derive(Clone)]
struct ResultMeta {
    auth_id: String,
    auth_index: i64,
    provider: String,
    canonical_model: String,
    native_model: String,
    source: Option<String>,
    api_key: Option<String>,
}

impl Feedback {
    async fn success(
        &self,
        handle: &Arc<Mutex<Auth>>,
        meta: &ResultMeta,
        usage: Option<TokenUsage>,
        latency: Duration,
    ) {
        let now = Instant::now();
        let was_blocked = {
            let mut auth = handle.lock().await;
            let was_blocked = auth.unavailable;
            state::clear_auth_state_on_success(&mut auth, &meta.native_model, now);
            quota::clear_quota_group_on_success(&self.resolvers, &mut auth, &meta.native_model);
            state::update_aggregated_availability(&mut auth, now);
            was_blocked
        };

        self.registry
            .clear_client_marks(&meta.auth_id, &meta.provider, &meta.native_model);
        self.stats
            .record(&meta.provider, &meta.canonical_model, true, latency);
        self.usage.record(self.record_for(meta, false, usage));

        if was_blocked {
            self.events
                .emit(OperationalEvent::CooldownEnd(CooldownEndEvent {
                    at: SystemTime::now(),
                    auth_id: meta.auth_id.clone(),
                    model: Some(meta.native_model.clone()),
                }))
                .await;
        }
    }

    async fn failure(
        &self,
        handle: &Arc<Mutex<Auth>>,
        meta: &ResultMeta,
        err: &GatewayError,
        usage: Option<TokenUsage>,
        latency: Duration,
    ) {
        let now = Instant::now();
        let (cooldown_until, disabled) = {
            let mut auth = handle.lock().await;
            state::apply_auth_failure_state(&mut auth, &meta.native_model, err, err.retry_after, now);
            if err.category == ErrorCategory::QuotaError
                && let Some(until) = auth
                    .model_state(&meta.native_model)
                    .and_then(|s| s.next_retry_after)
            {
                quota::propagate_quota_to_group(
                    &self.resolvers,
                    &mut auth,
                    &meta.native_model,
                    until,
                    now,
                );
                state::update_aggregated_availability(&mut auth, now);
            }
            let until = auth
                .model_state(&meta.native_model)
                .and_then(|s| s.next_retry_after);
            (until, auth.disabled)
        };

        match err.category {
            ErrorCategory::QuotaError => {
                self.registry.mark_client_quota_exceeded(
                    &meta.auth_id,
                    &meta.provider,
                    &meta.native_model,
                    cooldown_until,
                );
            }
            ErrorCategory::AuthError | ErrorCategory::NotFound => {
                self.registry.mark_client_suspended(
                    &meta.auth_id,
                    &meta.provider,
                    &meta.native_model,
                    err.code.clone(),
                );
            }
            ErrorCategory::AuthRevoked => {
                self.registry.unregister_auth(&meta.auth_id);
            }
            _ => {}
        }

        if err.category != ErrorCategory::UserError {
            self.stats
                .record(&meta.provider, &meta.canonical_model, false, latency);
        }
        self.usage.record(self.record_for(meta, true, usage));

        if disabled {
            self.events
                .emit(OperationalEvent::AuthDisabled(AuthDisabledEvent {
                    at: SystemTime::now(),
                    auth_id: meta.auth_id.clone(),
                    reason: err.code.clone(),
                }))
                .await;
        } else if let Some(until) = cooldown_until {
            let wall_until = SystemTime::now() + until.saturating_duration_since(now);
            self.events
                .emit(OperationalEvent::CooldownStart(CooldownStartEvent {
                    at: SystemTime::now(),
                    auth_id: meta.auth_id.clone(),
                    model: Some(meta.native_model.clone()),
                    reason: err.code.clone(),
                    until: wall_until,
                }))
                .await;
        }
    }

    fn record_for(&self, meta: &ResultMeta, failed: bool, usage: Option<TokenUsage>) -> UsageRecord {
        UsageRecord {
            provider: meta.provider.clone(),
            model: meta.canonical_model.clone(),
            api_key: meta.api_key.clone(),
            auth_id: meta.auth_id.clone(),
            auth_index: meta.auth_index,
            source: meta.source.clone(),
            requested_at: time::OffsetDateTime::now_utc(),
            failed,
            tokens: usage.unwrap_or_default(),
        }
    }
}

struct Picked {
    handle: Arc<Mutex<Auth>>,
    snapshot: Auth,
    executor: Arc<dyn Executor>,
}

pub struct AuthManager {
    auths: RwLock<HashMap<String, Arc<Mutex<Auth>>>>,
    executors: std::sync::RwLock<HashMap<String, Arc<dyn Executor>>>,
    registry: Arc<ModelRegistry>,
    stats: Arc<ProviderStats>,
    resolvers: Arc<QuotaGroupResolvers>,
    settings: Arc<RuntimeSettings>,
    usage: SharedUsageSink,
    events: EventHub,
    registrar: Arc<dyn ModelRegistrar>,
    executor_registrar: Option<Arc<dyn ExecutorRegistrar>>,
    selector: ProviderSelector,
    selection_counter: AtomicU64,
    auth_index_counter: AtomicI64,
}

impl AuthManager {
    pub fn new(settings: Arc<RuntimeSettings>, resolvers: Arc<QuotaGroupResolvers>) -> Self {
        Self {
            auths: RwLock::new(HashMap::new()),
            executors: std::sync::RwLock::new(HashMap::new()),
            registry: Arc::new(ModelRegistry::new(settings.clone())),
            stats: Arc::new(ProviderStats::new()),
            resolvers,
            settings,
            usage: Arc::new(llm_mux_auth::NoopUsageSink),
            events: EventHub::new(64),
            registrar: Arc::new(MetadataModelRegistrar),
            executor_registrar: None,
            selector: ProviderSelector::new(),
            selection_counter: AtomicU64::new(1),
            auth_index_counter: AtomicI64::new(1),
        }
    }

    pub fn with_usage_sink(mut self, sink: SharedUsageSink) -> Self {
        self.usage = sink;
        self
    }

    pub fn with_model_registrar(mut self, registrar: Arc<dyn ModelRegistrar>) -> Self {
        self.registrar = registrar;
        self
    }

    pub fn with_executor_registrar(mut self, registrar: Arc<dyn ExecutorRegistrar>) -> Self {
        self.executor_registrar = Some(registrar);
        self
    }

    pub fn with_events(mut self, events: EventHub) -> Self {
        self.events = events;
        self
    }

    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.registry
    }

    pub fn stats(&self) -> &Arc<ProviderStats> {
        &self.stats
    }

    pub fn events(&self) -> EventHub {
        self.events.clone()
    }

    pub fn register_executor(&self, executor: Arc<dyn Executor>) {
        let provider = llm_mux_common::normalize_provider(executor.identity());
        self.executors
            .write()
            .expect("executor table lock poisoned")
            .insert(provider, executor);
    }

    /// Apply a watcher update.
    ///
    /// Add/Modify replaces the entry while preserving `created_at`,
    /// `last_refreshed_at`, the opaque runtime, and the stable index.
    /// Delete marks the auth Disabled (the entry is kept for inspection)
    /// and unregisters its models.
    pub async fn apply_update(&self, update: AuthUpdate) {
        match update.action {
            AuthUpdateAction::Add | AuthUpdateAction::Modify => {
                let Some(mut auth) = update.auth else {
                    warn!(event = "auth_update_missing_auth", id = %update.id);
                    return;
                };
                auth.provider = llm_mux_common::normalize_provider(&auth.provider);
                auth.updated_at = time::OffsetDateTime::now_utc();

                let mut auths = self.auths.write().await;
                if let Some(existing) = auths.get(&update.id) {
                    let existing = existing.lock().await;
                    auth.created_at = existing.created_at;
                    auth.last_refreshed_at = existing.last_refreshed_at;
                    auth.next_refresh_after = existing.next_refresh_after;
                    auth.index = existing.index;
                    auth.selection_seq = existing.selection_seq;
                    if auth.runtime.is_none() {
                        auth.runtime = existing.runtime.clone();
                    }
                } else {
                    auth.index = self.auth_index_counter.fetch_add(1, Ordering::Relaxed);
                }

                let models = self.registrar.models_for(&auth);
                self.registry.register_auth(&auth, models);
                if let Some(registrar) = &self.executor_registrar {
                    let missing = {
                        let executors =
                            self.executors.read().expect("executor table lock poisoned");
                        !executors.contains_key(&auth.provider)
                    };
                    if missing && let Some(executor) = registrar.executor_for(&auth) {
                        self.register_executor(executor);
                    }
                }
                info!(
                    event = "auth_applied",
                    id = %auth.id,
                    provider = %auth.provider,
                    disabled = auth.disabled
                );
                auths.insert(update.id, Arc::new(Mutex::new(auth)));
            }
            AuthUpdateAction::Delete => {
                let handle = {
                    let auths = self.auths.read().await;
                    auths.get(&update.id).cloned()
                };
                if let Some(handle) = handle {
                    let mut auth = handle.lock().await;
                    auth.disabled = true;
                    auth.status = AuthStatus::Disabled;
                    auth.updated_at = time::OffsetDateTime::now_utc();
                }
                self.registry.unregister_auth(&update.id);
                self.events
                    .emit(OperationalEvent::AuthDisabled(AuthDisabledEvent {
                        at: SystemTime::now(),
                        auth_id: update.id.clone(),
                        reason: "deleted".to_string(),
                    }))
                    .await;
                info!(event = "auth_deleted", id = %update.id);
            }
        }
    }

    /// Observer clones of every auth.
    pub async fn auths(&self) -> Vec<Auth> {
        let handles: Vec<Arc<Mutex<Auth>>> = {
            let auths = self.auths.read().await;
            auths.values().cloned().collect()
        };
        let mut out = Vec::with_capacity(handles.len());
        for handle in handles {
            out.push(handle.lock().await.observer_clone());
        }
        out.sort_by(|a, b| a.index.cmp(&b.index));
        out
    }

    pub async fn get_auth(&self, id: &str) -> Option<Auth> {
        let handle = {
            let auths = self.auths.read().await;
            auths.get(id).cloned()
        }?;
        let auth = handle.lock().await;
        Some(auth.observer_clone())
    }

    pub async fn set_auth_disabled(&self, id: &str, disabled: bool) {
        let handle = {
            let auths = self.auths.read().await;
            auths.get(id).cloned()
        };
        let Some(handle) = handle else {
            return;
        };
        let snapshot = {
            let mut auth = handle.lock().await;
            auth.disabled = disabled;
            auth.status = if disabled {
                AuthStatus::Disabled
            } else {
                AuthStatus::Active
            };
            auth.updated_at = time::OffsetDateTime::now_utc();
            auth.observer_clone()
        };
        if disabled {
            self.registry.unregister_auth(id);
        } else {
            let models = self.registrar.models_for(&snapshot);
            self.registry.register_auth(&snapshot, models);
        }
    }

    pub async fn execute(
        &self,
        ctx: &RequestContext,
        providers: &[String],
        req: &ExecRequest,
        opts: &ExecOptions,
    ) -> GatewayResult<ExecResponse> {
        self.run_unary(ctx, providers, req, opts, UnaryOp::Execute)
            .await
    }

    pub async fn count_tokens(
        &self,
        ctx: &RequestContext,
        providers: &[String],
        req: &ExecRequest,
        opts: &ExecOptions,
    ) -> GatewayResult<ExecResponse> {
        self.run_unary(ctx, providers, req, opts, UnaryOp::CountTokens)
            .await
    }

    async fn run_unary(
        &self,
        ctx: &RequestContext,
        providers: &[String],
        req: &ExecRequest,
        opts: &ExecOptions,
        op: UnaryOp,
    ) -> GatewayResult<ExecResponse> {
        let providers = normalize_providers(providers);
        let canonical = normalize_model_id(&req.model).to_string();
        let ordered = self
            .selector
            .order(&self.stats, &canonical, providers.clone());
        let max_attempts = self.settings.max_attempts();
        let mut last_err: Option<GatewayError> = None;

        'providers: for provider in &ordered {
            let mut native_req = req.clone();
            native_req.model = self.registry.model_id_for_provider(&canonical, provider);
            let mut tried: HashSet<String> = HashSet::new();
            let mut attempts: u32 = 0;

            loop {
                if ctx.is_cancelled() {
                    return Err(GatewayError::cancelled());
                }

                let Some(picked) = self
                    .pick_next(provider, &native_req.model, opts, &tried)
                    .await
                else {
                    match last_err {
                        Some(err) => return Err(err),
                        None => continue 'providers,
                    }
                };

                let meta = self.meta_for(&picked.snapshot, provider, &canonical, &native_req);
                tried.insert(meta.auth_id.clone());
                attempts += 1;
                debug!(
                    event = "auth_selected",
                    trace_id = %ctx.trace_id,
                    provider = %provider,
                    auth_id = %meta.auth_id,
                    model = %native_req.model,
                    attempt = attempts
                );

                let started = Instant::now();
                let result = match op {
                    UnaryOp::Execute => {
                        picked
                            .executor
                            .execute(ctx, &picked.snapshot, &native_req, opts)
                            .await
                    }
                    UnaryOp::CountTokens => {
                        picked
                            .executor
                            .count_tokens(ctx, &picked.snapshot, &native_req, opts)
                            .await
                    }
                };
                let latency = started.elapsed();
                let feedback = self.feedback();

                match result {
                    Ok(response) => {
                        let usage = response.usage;
                        feedback.success(&picked.handle, &meta, usage, latency).await;
                        return Ok(response);
                    }
                    Err(err) => {
                        feedback
                            .failure(&picked.handle, &meta, &err, None, latency)
                            .await;
                        if !err.should_fallback() {
                            return Err(err);
                        }
                        warn!(
                            event = "auth_attempt_failed",
                            trace_id = %ctx.trace_id,
                            provider = %provider,
                            auth_id = %meta.auth_id,
                            category = ?err.category,
                            attempt = attempts
                        );
                        last_err = Some(err);
                        if attempts >= max_attempts {
                            continue 'providers;
                        }

                        if !self.has_available_auth(provider, &native_req.model).await {
                            if self
                                .closest_cooldown(provider, &native_req.model)
                                .await
                                .is_none()
                            {
                                continue 'providers;
                            }
                            if let Err(wait_err) = self
                                .wait_for_available_auth(ctx, provider, &native_req.model)
                                .await
                            {
                                last_err = Some(wait_err);
                                continue 'providers;
                            }
                            // Recovered auths are eligible for a fresh round.
                            tried.clear();
                        } else {
                            backoff_sleep(attempts + 1).await;
                        }
                    }
                }
            }
        }

        Err(last_err.unwrap_or_else(|| GatewayError::auth_not_found(&ordered.join(","))))
    }

    /// Streaming variant of the selection template. Once a stream is handed
    /// to the caller no further fallback happens; terminal accounting runs in
    /// the pipeline completion hook.
    pub async fn execute_stream(
        &self,
        ctx: &RequestContext,
        providers: &[String],
        req: &ExecRequest,
        opts: &ExecOptions,
    ) -> GatewayResult<mpsc::Receiver<StreamChunk>> {
        let providers = normalize_providers(providers);
        let canonical = normalize_model_id(&req.model).to_string();
        let ordered = self
            .selector
            .order(&self.stats, &canonical, providers.clone());
        let max_attempts = self.settings.max_attempts();
        let mut last_err: Option<GatewayError> = None;

        'providers: for provider in &ordered {
            let mut native_req = req.clone();
            native_req.model = self.registry.model_id_for_provider(&canonical, provider);
            native_req.stream = true;
            let mut tried: HashSet<String> = HashSet::new();
            let mut attempts: u32 = 0;

            loop {
                if ctx.is_cancelled() {
                    return Err(GatewayError::cancelled());
                }

                let Some(picked) = self
                    .pick_next(provider, &native_req.model, opts, &tried)
                    .await
                else {
                    match last_err {
                        Some(err) => return Err(err),
                        None => continue 'providers,
                    }
                };

                let meta = self.meta_for(&picked.snapshot, provider, &canonical, &native_req);
                tried.insert(meta.auth_id.clone());
                attempts += 1;

                let started = Instant::now();
                let result = picked
                    .executor
                    .execute_stream(ctx, &picked.snapshot, &native_req, opts)
                    .await;
                let feedback = self.feedback();

                match result {
                    Ok(upstream) => {
                        let handle = picked.handle.clone();
                        let trace_id = ctx.trace_id.clone();
                        let forwarded = forward_stream(ctx, upstream, move |outcome| {
                            tokio::spawn(async move {
                                match outcome {
                                    StreamOutcome::Success { usage } => {
                                        feedback
                                            .success(&handle, &meta, usage, started.elapsed())
                                            .await;
                                    }
                                    StreamOutcome::Failure { error, usage } => {
                                        feedback
                                            .failure(
                                                &handle,
                                                &meta,
                                                &error,
                                                usage,
                                                started.elapsed(),
                                            )
                                            .await;
                                    }
                                    StreamOutcome::Cancelled => {
                                        debug!(
                                            event = "stream_cancelled",
                                            trace_id = %trace_id,
                                            auth_id = %meta.auth_id
                                        );
                                    }
                                }
                            });
                        });
                        return Ok(forwarded);
                    }
                    Err(err) => {
                        feedback
                            .failure(&picked.handle, &meta, &err, None, started.elapsed())
                            .await;
                        if !err.should_fallback() {
                            return Err(err);
                        }
                        last_err = Some(err);
                        if attempts >= max_attempts {
                            continue 'providers;
                        }

                        if !self.has_available_auth(provider, &native_req.model).await {
                            if self
                                .closest_cooldown(provider, &native_req.model)
                                .await
                                .is_none()
                            {
                                continue 'providers;
                            }
                            if let Err(wait_err) = self
                                .wait_for_available_auth(ctx, provider, &native_req.model)
                                .await
                            {
                                last_err = Some(wait_err);
                                continue 'providers;
                            }
                            tried.clear();
                        } else {
                            backoff_sleep(attempts + 1).await;
                        }
                    }
                }
            }
        }

        Err(last_err.unwrap_or_else(|| GatewayError::auth_not_found(&ordered.join(","))))
    }

    fn feedback(&self) -> Feedback {
        Feedback {
            registry: self.registry.clone(),
            stats: self.stats.clone(),
            resolvers: self.resolvers.clone(),
            usage: self.usage.clone(),
            events: self.events.clone(),
        }
    }

    fn meta_for(
        &self,
        auth: &Auth,
        provider: &str,
        canonical: &str,
        native_req: &ExecRequest,
    ) -> ResultMeta {
        ResultMeta {
            auth_id: auth.id.clone(),
            auth_index: auth.index,
            provider: provider.to_string(),
            canonical_model: canonical.to_string(),
            native_model: native_req.model.clone(),
            source: native_req.source.clone(),
            api_key: native_req.api_key.clone(),
        }
    }

    /// Next eligible auth for (provider, model), least-recently-used first.
    ///
    /// Holds the map read lock only to clone handles; per-auth locks are
    /// taken one at a time. Disabled auths are skipped outright; cooled-down
    /// auths are skipped but remain wait candidates.
    async fn pick_next(
        &self,
        provider: &str,
        model: &str,
        opts: &ExecOptions,
        tried: &HashSet<String>,
    ) -> Option<Picked> {
        let executor = {
            let executors = self.executors.read().expect("executor table lock poisoned");
            executors.get(provider).cloned()
        }?;

        let handles: Vec<(String, Arc<Mutex<Auth>>)> = {
            let auths = self.auths.read().await;
            auths
                .iter()
                .map(|(id, handle)| (id.clone(), handle.clone()))
                .collect()
        };

        let now = Instant::now();
        let mut best: Option<(u64, Arc<Mutex<Auth>>)> = None;
        for (id, handle) in handles {
            if tried.contains(&id) {
                continue;
            }
            if let Some(pinned) = &opts.pin_auth
                && pinned != &id
            {
                continue;
            }
            if !self.registry.client_supports_model(&id, model) {
                continue;
            }

            let mut auth = handle.lock().await;
            if auth.provider != provider {
                continue;
            }
            let decision = quota::is_auth_blocked_for_model(&self.resolvers, &mut auth, model, now);
            if decision.blocked {
                continue;
            }
            let seq = auth.selection_seq;
            drop(auth);

            match &best {
                Some((best_seq, _)) if *best_seq <= seq => {}
                _ => best = Some((seq, handle)),
            }
        }

        let (_, handle) = best?;
        let mut auth = handle.lock().await;
        auth.selection_seq = self.selection_counter.fetch_add(1, Ordering::Relaxed);
        let snapshot = auth.observer_clone();
        drop(auth);

        Some(Picked {
            handle,
            snapshot,
            executor,
        })
    }

    async fn has_available_auth(&self, provider: &str, model: &str) -> bool {
        let handles: Vec<(String, Arc<Mutex<Auth>>)> = {
            let auths = self.auths.read().await;
            auths
                .iter()
                .map(|(id, handle)| (id.clone(), handle.clone()))
                .collect()
        };
        let now = Instant::now();
        for (id, handle) in handles {
            if !self.registry.client_supports_model(&id, model) {
                continue;
            }
            let mut auth = handle.lock().await;
            if auth.provider != provider {
                continue;
            }
            if !quota::is_auth_blocked_for_model(&self.resolvers, &mut auth, model, now).blocked {
                return true;
            }
        }
        false
    }

    /// Earliest instant a currently-blocked (but not disabled) auth for
    /// (provider, model) becomes eligible again.
    async fn closest_cooldown(&self, provider: &str, model: &str) -> Option<Instant> {
        let handles: Vec<(String, Arc<Mutex<Auth>>)> = {
            let auths = self.auths.read().await;
            auths
                .iter()
                .map(|(id, handle)| (id.clone(), handle.clone()))
                .collect()
        };
        let now = Instant::now();
        let mut earliest: Option<Instant> = None;
        for (id, handle) in handles {
            if !self.registry.client_supports_model(&id, model) {
                continue;
            }
            let mut auth = handle.lock().await;
            if auth.provider != provider {
                continue;
            }
            let decision = quota::is_auth_blocked_for_model(&self.resolvers, &mut auth, model, now);
            if decision.blocked
                && decision.reason != BlockReason::Disabled
                && let Some(next) = decision.next
            {
                earliest = Some(match earliest {
                    Some(current) if current <= next => current,
                    _ => next,
                });
            }
        }
        earliest
    }

    /// Poll until an auth frees up, the retry deadline passes, or the
    /// request context is cancelled.
    async fn wait_for_available_auth(
        &self,
        ctx: &RequestContext,
        provider: &str,
        model: &str,
    ) -> GatewayResult<()> {
        let deadline = Instant::now() + self.settings.max_retry_interval();
        loop {
            if self.has_available_auth(provider, model).await {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(GatewayError::cooldown_timeout());
            }
            tokio::select! {
                _ = ctx.cancel.cancelled() => return Err(GatewayError::cancelled()),
                _ = tokio::time::sleep(AVAILABILITY_POLL) => {}
            }
        }
    }
}

fn retry_backoff_delay(attempt_no: u32) -> Duration {
    let step = attempt_no.saturating_sub(1).min(6);
    let base_ms = 100u64;
    let backoff = base_ms.saturating_mul(1u64 << step);
    let jitter = rand::random::<u64>() % (base_ms + 1);
    Duration::from_millis((backoff + jitter).min(2_000))
}

async fn backoff_sleep(attempt_no: u32) {
    let delay = retry_backoff_delay(attempt_no);
    if delay.as_millis() > 0 {
        tokio::time::sleep(delay).await;
    }
}
