use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use llm_mux_auth::{EventSink, OperationalEvent, QuotaGroupResolvers};
use llm_mux_common::{GatewayConfigPatch, RuntimeSettings};
use llm_mux_core::AuthManager;
use llm_mux_storage::{UsageBackend, UsageBackendConfig, UsageStore};

mod cli;
mod dsn;

/// Logs operational events so cooldowns and disables are visible without a
/// dashboard attached.
struct LogEventSink;

impl EventSink for LogEventSink {
    fn write<'a>(
        &'a self,
        event: &'a OperationalEvent,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            match event {
                OperationalEvent::CooldownStart(start) => info!(
                    event = "cooldown_start",
                    auth_id = %start.auth_id,
                    model = ?start.model,
                    reason = %start.reason
                ),
                OperationalEvent::CooldownEnd(end) => info!(
                    event = "cooldown_end",
                    auth_id = %end.auth_id,
                    model = ?end.model
                ),
                OperationalEvent::AuthDisabled(disabled) => info!(
                    event = "auth_disabled",
                    auth_id = %disabled.auth_id,
                    reason = %disabled.reason
                ),
            }
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = cli::Cli::parse();
    let mut patch = GatewayConfigPatch::default();
    patch.overlay(cli.patch());
    if patch.dsn.is_none() {
        let data_dir = patch.data_dir.clone().unwrap_or_default();
        patch.dsn = Some(dsn::resolve_dsn("", &data_dir).context("resolve dsn")?);
    } else if let Some(dsn) = &patch.dsn {
        dsn::ensure_sqlite_dsn(dsn).context("prepare dsn")?;
    }
    let config = patch.into_config().context("merge gateway config")?;

    let settings = Arc::new(RuntimeSettings::default());
    settings.set_request_retry(config.request_retry);
    settings.set_max_retry_interval(Duration::from_secs(config.max_retry_interval_secs));
    settings.set_show_provider_prefix(config.show_provider_prefix);

    let store = UsageStore::connect(&config.dsn)
        .await
        .with_context(|| format!("connect usage store: {}", config.dsn))?;
    let backend = UsageBackend::start(
        store,
        UsageBackendConfig {
            retention_days: config.usage_retention_days,
            ..Default::default()
        },
    )
    .await
    .context("start usage backend")?;

    let manager = Arc::new(
        AuthManager::new(settings, Arc::new(QuotaGroupResolvers::new()))
            .with_usage_sink(backend.clone()),
    );
    manager.events().add_sink(Arc::new(LogEventSink)).await;

    info!(event = "gateway_ready", dsn = %config.dsn);

    // Executors, the auth watcher, and the request surface attach here in a
    // full deployment; the core runs until interrupted.
    tokio::signal::ctrl_c().await.context("wait for shutdown")?;
    info!(event = "shutdown_requested");
    let auths = manager.auths().await;
    info!(event = "shutdown_state", auth_count = auths.len());
    backend.stop().await;
    Ok(())
}
