//! Copy-on-write model registry.
//!
//! Canonical model IDs map to (provider, provider-native ID) targets;
//! registrations are reference-counted by the auths advertising them.
//! Writers clone the whole state under one publish lock and atomically swap
//! the snapshot pointer, so the read path is lock-free and a reader can
//! never observe a half-applied mutation.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use llm_mux_common::{RuntimeSettings, display_model_id, normalize_model_id, normalize_provider};

use crate::auth::Auth;

/// Window during which a hard quota mark (no recovery deadline) keeps a
/// client out of the availability count.
const HARD_QUOTA_WINDOW: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    /// Provider-native model ID.
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    /// Canonical request ID this model serves. Defaults to `id`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub canonical_id: Option<String>,
    /// Tie-break for canonical -> provider mapping; lower wins, 0 means 1.
    #[serde(default)]
    pub priority: u32,
}

impl ModelInfo {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: None,
            canonical_id: None,
            priority: 0,
        }
    }

    pub fn with_canonical(mut self, canonical: impl Into<String>) -> Self {
        self.canonical_id = Some(canonical.into());
        self
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    pub fn canonical(&self) -> &str {
        self.canonical_id.as_deref().unwrap_or(&self.id)
    }

    fn effective_priority(&self) -> u32 {
        self.priority.max(1)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct QuotaMark {
    pub marked_at: Instant,
    pub deadline: Option<Instant>,
}

impl QuotaMark {
    /// A mark with a deadline holds until the deadline; a hard mark holds
    /// for the fixed window after it was set.
    fn holds(&self, now: Instant) -> bool {
        match self.deadline {
            Some(deadline) => deadline > now,
            None => now.duration_since(self.marked_at) < HARD_QUOTA_WINDOW,
        }
    }

    fn is_cooldown(&self, now: Instant) -> bool {
        matches!(self.deadline, Some(deadline) if deadline > now)
    }
}

/// One `provider:provider_model_id` registration.
#[derive(Debug, Clone)]
pub struct ModelRegistration {
    pub info: ModelInfo,
    /// Number of auths advertising this model.
    pub count: usize,
    pub providers: HashMap<String, usize>,
    pub quota_exceeded_clients: HashMap<String, QuotaMark>,
    pub suspended_clients: HashMap<String, String>,
}

impl ModelRegistration {
    fn new(info: ModelInfo) -> Self {
        Self {
            info,
            count: 0,
            providers: HashMap::new(),
            quota_exceeded_clients: HashMap::new(),
            suspended_clients: HashMap::new(),
        }
    }

    /// (truly available, theoretically available) client slots.
    fn availability(&self, now: Instant) -> (usize, usize) {
        let suspended = self.suspended_clients.len();
        let mut hard_quota = 0usize;
        let mut cooldown = 0usize;
        for mark in self.quota_exceeded_clients.values() {
            if !mark.holds(now) {
                continue;
            }
            if mark.is_cooldown(now) {
                cooldown += 1;
            } else {
                hard_quota += 1;
            }
        }
        let slots = self.count.saturating_sub(suspended + hard_quota);
        let free = slots.saturating_sub(cooldown);
        (free, slots)
    }
}

#[derive(Debug, Clone)]
pub struct CanonicalTarget {
    pub provider: String,
    pub provider_model_id: String,
    pub priority: u32,
}

#[derive(Debug, Clone)]
struct ClientRecord {
    provider: String,
    models: Vec<ModelInfo>,
}

/// Immutable registry snapshot. Safe to share across tasks without locking.
#[derive(Debug, Clone, Default)]
pub struct RegistryState {
    pub registrations: HashMap<String, ModelRegistration>,
    pub canonical_index: HashMap<String, Vec<CanonicalTarget>>,
    pub model_id_index: HashMap<String, Vec<String>>,
    clients: HashMap<String, ClientRecord>,
}

/// One row of the available-models listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelEntry {
    /// Rendered ID, provider-prefixed when so configured.
    pub id: String,
    pub canonical_id: String,
    /// Set when the entry is a per-provider variant.
    pub provider: Option<String>,
    pub display_name: Option<String>,
    /// Every slot serving this model is merely cooling down; it will come
    /// back without intervention but is not usable right now.
    pub theoretical: bool,
}

pub struct ModelRegistry {
    state: ArcSwap<RegistryState>,
    publish: Mutex<()>,
    settings: Arc<RuntimeSettings>,
}

impl ModelRegistry {
    pub fn new(settings: Arc<RuntimeSettings>) -> Self {
        Self {
            state: ArcSwap::from_pointee(RegistryState::default()),
            publish: Mutex::new(()),
            settings,
        }
    }

    pub fn snapshot(&self) -> Arc<RegistryState> {
        self.state.load_full()
    }

    /// Register `auth`'s advertised models. A prior registration for the
    /// same auth is torn down first so counts never double. Virtual-primary
    /// auths are never registered.
    pub fn register_auth(&self, auth: &Auth, models: Vec<ModelInfo>) {
        if auth.is_virtual_primary() {
            return;
        }
        let auth_id = auth.id.clone();
        let provider = auth.provider.clone();
        self.mutate(|state| {
            unregister_locked(state, &auth_id);
            for info in &models {
                let key = registration_key(&provider, &info.id);
                let registration = state
                    .registrations
                    .entry(key.clone())
                    .or_insert_with(|| ModelRegistration::new(info.clone()));
                registration.count += 1;
                *registration.providers.entry(provider.clone()).or_insert(0) += 1;

                let canonical = info.canonical().to_string();
                let targets = state.canonical_index.entry(canonical).or_default();
                if !targets
                    .iter()
                    .any(|t| t.provider == provider && t.provider_model_id == info.id)
                {
                    targets.push(CanonicalTarget {
                        provider: provider.clone(),
                        provider_model_id: info.id.clone(),
                        priority: info.effective_priority(),
                    });
                    targets.sort_by_key(|t| t.priority.max(1));
                }

                let keys = state.model_id_index.entry(info.id.clone()).or_default();
                if !keys.contains(&key) {
                    keys.push(key);
                }
            }
            state.clients.insert(
                auth_id.clone(),
                ClientRecord {
                    provider: provider.clone(),
                    models,
                },
            );
        });
    }

    pub fn unregister_auth(&self, auth_id: &str) {
        self.mutate(|state| unregister_locked(state, auth_id));
    }

    /// Translate a canonical ID to the provider-native one; the canonical ID
    /// itself when no mapping exists. Accepts prefixed input.
    pub fn model_id_for_provider(&self, canonical_id: &str, provider: &str) -> String {
        let canonical = normalize_model_id(canonical_id);
        let provider = normalize_provider(provider);
        let state = self.state.load();
        state
            .canonical_index
            .get(canonical)
            .and_then(|targets| {
                targets
                    .iter()
                    .filter(|t| t.provider == provider)
                    .min_by_key(|t| t.priority.max(1))
                    .map(|t| t.provider_model_id.clone())
            })
            .unwrap_or_else(|| canonical.to_string())
    }

    /// Whether `auth_id` advertises `model` (by native or canonical ID).
    pub fn client_supports_model(&self, auth_id: &str, model: &str) -> bool {
        let model = normalize_model_id(model);
        let state = self.state.load();
        state.clients.get(auth_id).is_some_and(|record| {
            record
                .models
                .iter()
                .any(|info| info.id == model || info.canonical() == model)
        })
    }

    /// Aggregate the exposed model list.
    ///
    /// A model is listed when at least one registered auth is neither
    /// suspended nor quota-excluded; a model whose every remaining slot is
    /// cooling down is listed flagged `theoretical`. Output is sorted by
    /// rendered ID; provider-prefixed variants are emitted one per provider
    /// when so configured.
    pub fn available_models(&self) -> Vec<ModelEntry> {
        let now = Instant::now();
        let show_prefix = self.settings.show_provider_prefix();
        let state = self.state.load();
        let mut entries = Vec::new();

        for (canonical, targets) in &state.canonical_index {
            if show_prefix {
                let mut per_provider: HashMap<&str, (usize, usize, Option<&ModelRegistration>)> =
                    HashMap::new();
                for target in targets {
                    let key = registration_key(&target.provider, &target.provider_model_id);
                    let Some(registration) = state.registrations.get(&key) else {
                        continue;
                    };
                    let (free, slots) = registration.availability(now);
                    let slot = per_provider
                        .entry(target.provider.as_str())
                        .or_insert((0, 0, None));
                    slot.0 += free;
                    slot.1 += slots;
                    slot.2.get_or_insert(registration);
                }
                for (provider, (free, slots, registration)) in per_provider {
                    if slots == 0 {
                        continue;
                    }
                    entries.push(ModelEntry {
                        id: display_model_id(provider, canonical),
                        canonical_id: canonical.clone(),
                        provider: Some(provider.to_string()),
                        display_name: registration
                            .and_then(|r| r.info.display_name.clone()),
                        theoretical: free == 0,
                    });
                }
            } else {
                let mut free_total = 0usize;
                let mut slot_total = 0usize;
                let mut display_name = None;
                for target in targets {
                    let key = registration_key(&target.provider, &target.provider_model_id);
                    let Some(registration) = state.registrations.get(&key) else {
                        continue;
                    };
                    let (free, slots) = registration.availability(now);
                    free_total += free;
                    slot_total += slots;
                    if display_name.is_none() {
                        display_name = registration.info.display_name.clone();
                    }
                }
                if slot_total == 0 {
                    continue;
                }
                entries.push(ModelEntry {
                    id: canonical.clone(),
                    canonical_id: canonical.clone(),
                    provider: None,
                    display_name,
                    theoretical: free_total == 0,
                });
            }
        }

        entries.sort_by(|a, b| a.id.cmp(&b.id));
        entries
    }

    /// Record a quota exclusion for (auth, provider-native model).
    pub fn mark_client_quota_exceeded(
        &self,
        auth_id: &str,
        provider: &str,
        model_id: &str,
        deadline: Option<Instant>,
    ) {
        let key = registration_key(provider, model_id);
        let auth_id = auth_id.to_string();
        self.mutate(|state| {
            if let Some(registration) = state.registrations.get_mut(&key) {
                registration.quota_exceeded_clients.insert(
                    auth_id.clone(),
                    QuotaMark {
                        marked_at: Instant::now(),
                        deadline,
                    },
                );
            }
        });
    }

    /// Record a non-quota suspension (auth errors, missing models).
    pub fn mark_client_suspended(
        &self,
        auth_id: &str,
        provider: &str,
        model_id: &str,
        reason: impl Into<String>,
    ) {
        let key = registration_key(provider, model_id);
        let auth_id = auth_id.to_string();
        let reason = reason.into();
        self.mutate(|state| {
            if let Some(registration) = state.registrations.get_mut(&key) {
                registration
                    .suspended_clients
                    .insert(auth_id.clone(), reason.clone());
            }
        });
    }

    /// Drop both mark kinds for (auth, provider-native model) after a success.
    pub fn clear_client_marks(&self, auth_id: &str, provider: &str, model_id: &str) {
        let key = registration_key(provider, model_id);
        self.mutate(|state| {
            if let Some(registration) = state.registrations.get_mut(&key) {
                registration.quota_exceeded_clients.remove(auth_id);
                registration.suspended_clients.remove(auth_id);
            }
        });
    }

    fn mutate<R>(&self, apply: impl FnOnce(&mut RegistryState) -> R) -> R {
        let _guard = self.publish.lock().expect("registry publish lock poisoned");
        let mut next = (**self.state.load()).clone();
        let out = apply(&mut next);
        self.state.store(Arc::new(next));
        out
    }
}

fn registration_key(provider: &str, model_id: &str) -> String {
    format!("{provider}:{model_id}")
}

fn unregister_locked(state: &mut RegistryState, auth_id: &str) {
    let Some(record) = state.clients.remove(auth_id) else {
        return;
    };
    for info in &record.models {
        let key = registration_key(&record.provider, &info.id);
        let Some(registration) = state.registrations.get_mut(&key) else {
            continue;
        };
        registration.count = registration.count.saturating_sub(1);
        if let Some(count) = registration.providers.get_mut(&record.provider) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                registration.providers.remove(&record.provider);
            }
        }
        registration.quota_exceeded_clients.remove(auth_id);
        registration.suspended_clients.remove(auth_id);

        if registration.count == 0 {
            state.registrations.remove(&key);
            let canonical = info.canonical().to_string();
            if let Some(targets) = state.canonical_index.get_mut(&canonical) {
                targets.retain(|t| {
                    !(t.provider == record.provider && t.provider_model_id == info.id)
                });
                if targets.is_empty() {
                    state.canonical_index.remove(&canonical);
                }
            }
            if let Some(keys) = state.model_id_index.get_mut(&info.id) {
                keys.retain(|k| k != &key);
                if keys.is_empty() {
                    state.model_id_index.remove(&info.id);
                }
            }
        }
    }
}
