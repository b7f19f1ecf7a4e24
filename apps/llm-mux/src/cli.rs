use clap::Parser;

use llm_mux_common::GatewayConfigPatch;

#[derive(Parser)]
#[command(name = "llm-mux")]
pub(crate) struct Cli {
    #[arg(long, env = "LLM_MUX_DSN", default_value = "")]
    pub(crate) dsn: String,
    #[arg(long, env = "LLM_MUX_DATA_DIR", default_value = "")]
    pub(crate) data_dir: String,
    #[arg(long, env = "LLM_MUX_REQUEST_RETRY")]
    pub(crate) request_retry: Option<u32>,
    #[arg(long, env = "LLM_MUX_MAX_RETRY_INTERVAL_SECS")]
    pub(crate) max_retry_interval_secs: Option<u64>,
    #[arg(long, env = "LLM_MUX_USAGE_RETENTION_DAYS")]
    pub(crate) usage_retention_days: Option<u32>,
    #[arg(long, env = "LLM_MUX_SHOW_PROVIDER_PREFIX")]
    pub(crate) show_provider_prefix: Option<bool>,
}

impl Cli {
    pub(crate) fn patch(&self) -> GatewayConfigPatch {
        GatewayConfigPatch {
            dsn: (!self.dsn.trim().is_empty()).then(|| self.dsn.clone()),
            data_dir: (!self.data_dir.trim().is_empty()).then(|| self.data_dir.clone()),
            request_retry: self.request_retry,
            max_retry_interval_secs: self.max_retry_interval_secs,
            usage_retention_days: self.usage_retention_days,
            show_provider_prefix: self.show_provider_prefix,
        }
    }
}
