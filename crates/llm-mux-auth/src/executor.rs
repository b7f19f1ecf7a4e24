//! The capability surface upstream adapters implement.
//!
//! This crate intentionally does **not** depend on any concrete HTTP client.
//! Adapters own wire IO and protocol shapes; the manager only sees typed
//! requests, responses, and stream chunks.

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::errors::{GatewayError, GatewayResult};
use crate::auth::Auth;
use crate::usage::TokenUsage;

/// Initial scanner buffer adapters should use for stream reassembly.
pub const STREAM_SCAN_INITIAL: usize = 256 * 1024;
/// Maximum scanner buffer; a single SSE event never exceeds this.
pub const STREAM_SCAN_MAX: usize = 20 * 1024 * 1024;

/// Per-request context. Cancelling the token aborts cooldown waits and the
/// stream pipeline for this request only.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub cancel: CancellationToken,
    pub trace_id: String,
}

impl RequestContext {
    pub fn new(trace_id: impl Into<String>) -> Self {
        Self {
            cancel: CancellationToken::new(),
            trace_id: trace_id.into(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// A translated request as the manager sees it: canonical model plus the
/// already-normalized payload for the target wire format.
#[derive(Debug, Clone, Default)]
pub struct ExecRequest {
    pub model: String,
    pub payload: serde_json::Value,
    pub stream: bool,
    /// Which inbound surface produced the request (`openai`, `claude`, ...).
    pub source: Option<String>,
    /// Downstream API key, carried into usage records.
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ExecOptions {
    /// Restrict selection to one auth id (admin and debug paths).
    pub pin_auth: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ExecResponse {
    pub status: u16,
    pub body: Bytes,
    pub usage: Option<TokenUsage>,
}

/// One unit of a streaming response.
///
/// `err` is set at most once per stream by well-behaved adapters; the
/// pipeline tolerates repeats but only accounts the first.
#[derive(Debug, Clone, Default)]
pub struct StreamChunk {
    pub data: Option<Bytes>,
    pub err: Option<GatewayError>,
    /// Usage totals, typically carried by the final chunk.
    pub usage: Option<TokenUsage>,
}

impl StreamChunk {
    pub fn data(data: impl Into<Bytes>) -> Self {
        Self {
            data: Some(data.into()),
            ..Default::default()
        }
    }

    pub fn error(err: GatewayError) -> Self {
        Self {
            err: Some(err),
            ..Default::default()
        }
    }
}

/// Provider adapter capability.
///
/// Errors should be (or wrap) [`GatewayError`] so the manager can read the
/// classification out of the source chain.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Normalized provider tag this executor serves.
    fn identity(&self) -> &str;

    async fn execute(
        &self,
        ctx: &RequestContext,
        auth: &Auth,
        req: &ExecRequest,
        opts: &ExecOptions,
    ) -> GatewayResult<ExecResponse>;

    async fn count_tokens(
        &self,
        ctx: &RequestContext,
        auth: &Auth,
        req: &ExecRequest,
        opts: &ExecOptions,
    ) -> GatewayResult<ExecResponse>;

    async fn execute_stream(
        &self,
        ctx: &RequestContext,
        auth: &Auth,
        req: &ExecRequest,
        opts: &ExecOptions,
    ) -> GatewayResult<mpsc::Receiver<StreamChunk>>;
}
