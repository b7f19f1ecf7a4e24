//! Selection engine for llm-mux.
//!
//! Hosts the auth manager: watcher ingestion, provider ordering, the
//! candidate loop, and result feedback into state, stats, and usage.

pub mod manager;

pub use manager::{
    AuthManager, ExecutorRegistrar, MetadataModelRegistrar, ModelRegistrar, ProviderSelector,
    normalize_providers,
};
