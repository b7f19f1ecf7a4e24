use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum GatewayConfigError {
    #[error("missing required gateway config field: {0}")]
    MissingField(&'static str),
}

/// Final, merged gateway configuration used by the running process.
///
/// Merge order: CLI > ENV > defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Database DSN for the usage store (`sqlite://...` or `postgres://...`).
    pub dsn: String,
    /// Directory for on-disk state when the DSN is derived from it.
    pub data_dir: String,
    /// Extra attempts after the first failed one.
    pub request_retry: u32,
    /// Upper bound on cooldown-aware waiting, in seconds.
    pub max_retry_interval_secs: u64,
    /// Days of usage records to keep before the cleaner deletes them.
    pub usage_retention_days: u32,
    /// Emit provider-prefixed model IDs from listings.
    pub show_provider_prefix: bool,
}

/// Optional layer used for merging gateway config.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GatewayConfigPatch {
    pub dsn: Option<String>,
    pub data_dir: Option<String>,
    pub request_retry: Option<u32>,
    pub max_retry_interval_secs: Option<u64>,
    pub usage_retention_days: Option<u32>,
    pub show_provider_prefix: Option<bool>,
}

impl GatewayConfigPatch {
    pub fn overlay(&mut self, other: GatewayConfigPatch) {
        if other.dsn.is_some() {
            self.dsn = other.dsn;
        }
        if other.data_dir.is_some() {
            self.data_dir = other.data_dir;
        }
        if other.request_retry.is_some() {
            self.request_retry = other.request_retry;
        }
        if other.max_retry_interval_secs.is_some() {
            self.max_retry_interval_secs = other.max_retry_interval_secs;
        }
        if other.usage_retention_days.is_some() {
            self.usage_retention_days = other.usage_retention_days;
        }
        if other.show_provider_prefix.is_some() {
            self.show_provider_prefix = other.show_provider_prefix;
        }
    }

    pub fn into_config(self) -> Result<GatewayConfig, GatewayConfigError> {
        Ok(GatewayConfig {
            dsn: self.dsn.ok_or(GatewayConfigError::MissingField("dsn"))?,
            data_dir: self.data_dir.unwrap_or_default(),
            request_retry: self.request_retry.unwrap_or(2),
            max_retry_interval_secs: self.max_retry_interval_secs.unwrap_or(30),
            usage_retention_days: self.usage_retention_days.unwrap_or(30),
            show_provider_prefix: self.show_provider_prefix.unwrap_or(false),
        })
    }
}

impl From<GatewayConfig> for GatewayConfigPatch {
    fn from(value: GatewayConfig) -> Self {
        Self {
            dsn: Some(value.dsn),
            data_dir: Some(value.data_dir),
            request_retry: Some(value.request_retry),
            max_retry_interval_secs: Some(value.max_retry_interval_secs),
            usage_retention_days: Some(value.usage_retention_days),
            show_provider_prefix: Some(value.show_provider_prefix),
        }
    }
}
