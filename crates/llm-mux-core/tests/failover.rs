//! End-to-end selection scenarios against a scripted executor.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::json;
use tokio::sync::mpsc;

use llm_mux_auth::{
    Auth, AuthStatus, AuthUpdate, ErrorCategory, ExecOptions, ExecRequest, ExecResponse, Executor,
    GatewayError, GatewayResult, QuotaGroupResolvers, RequestContext, StreamChunk, UsageRecord,
    UsageSink,
};
use llm_mux_common::RuntimeSettings;
use llm_mux_core::AuthManager;

type Scripted = Result<ExecResponse, GatewayError>;

#[derive(Default)]
struct MockExecutor {
    scripts: Mutex<HashMap<String, VecDeque<Scripted>>>,
    calls: Mutex<Vec<String>>,
}

impl MockExecutor {
    fn script(&self, auth_id: &str, result: Scripted) {
        self.scripts
            .lock()
            .unwrap()
            .entry(auth_id.to_string())
            .or_default()
            .push_back(result);
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn calls_for(&self, auth_id: &str) -> usize {
        self.calls().iter().filter(|id| *id == auth_id).count()
    }

    fn next_result(&self, auth_id: &str) -> Scripted {
        self.calls.lock().unwrap().push(auth_id.to_string());
        self.scripts
            .lock()
            .unwrap()
            .get_mut(auth_id)
            .and_then(|queue| queue.pop_front())
            .unwrap_or_else(|| {
                Ok(ExecResponse {
                    status: 200,
                    body: Bytes::from_static(b"{}"),
                    usage: None,
                })
            })
    }
}

#[async_trait]
impl Executor for MockExecutor {
    fn identity(&self) -> &str {
        "claude"
    }

    async fn execute(
        &self,
        _ctx: &RequestContext,
        auth: &Auth,
        _req: &ExecRequest,
        _opts: &ExecOptions,
    ) -> GatewayResult<ExecResponse> {
        self.next_result(&auth.id)
    }

    async fn count_tokens(
        &self,
        _ctx: &RequestContext,
        auth: &Auth,
        _req: &ExecRequest,
        _opts: &ExecOptions,
    ) -> GatewayResult<ExecResponse> {
        self.next_result(&auth.id)
    }

    async fn execute_stream(
        &self,
        _ctx: &RequestContext,
        auth: &Auth,
        _req: &ExecRequest,
        _opts: &ExecOptions,
    ) -> GatewayResult<mpsc::Receiver<StreamChunk>> {
        self.next_result(&auth.id)?;
        let (_tx, rx) = mpsc::channel(1);
        Ok(rx)
    }
}

#[derive(Default)]
struct CountingSink {
    records: Mutex<Vec<UsageRecord>>,
}

impl CountingSink {
    fn records(&self) -> Vec<UsageRecord> {
        self.records.lock().unwrap().clone()
    }
}

impl UsageSink for CountingSink {
    fn record(&self, record: UsageRecord) {
        self.records.lock().unwrap().push(record);
    }
}

struct Fixture {
    manager: Arc<AuthManager>,
    executor: Arc<MockExecutor>,
    usage: Arc<CountingSink>,
}

async fn fixture(request_retry: u32, resolvers: QuotaGroupResolvers) -> Fixture {
    let settings = Arc::new(RuntimeSettings::default());
    settings.set_request_retry(request_retry);
    let usage = Arc::new(CountingSink::default());
    let manager = Arc::new(
        AuthManager::new(settings, Arc::new(resolvers)).with_usage_sink(usage.clone()),
    );
    let executor = Arc::new(MockExecutor::default());
    manager.register_executor(executor.clone());
    Fixture {
        manager,
        executor,
        usage,
    }
}

fn claude_auth(id: &str, models: &[&str]) -> Auth {
    let mut auth = Auth::new(id, "claude");
    auth.metadata = json!({
        "models": models.iter().map(|m| json!({"id": m})).collect::<Vec<_>>()
    });
    auth
}

fn request(model: &str) -> ExecRequest {
    ExecRequest {
        model: model.to_string(),
        payload: json!({"messages": []}),
        stream: false,
        source: Some("claude".to_string()),
        api_key: Some("sk-test".to_string()),
    }
}

fn providers() -> Vec<String> {
    vec!["claude".to_string()]
}

/// Nudge `id` to the back of the least-recently-used order.
async fn touch(fx: &Fixture, id: &str) {
    let opts = ExecOptions {
        pin_auth: Some(id.to_string()),
    };
    fx.manager
        .execute(
            &RequestContext::new("touch"),
            &providers(),
            &request("claude-sonnet-4"),
            &opts,
        )
        .await
        .expect("touch request should succeed");
}

#[tokio::test(start_paused = true)]
async fn quota_fallback_skips_cooled_auth_until_retry_after_elapses() {
    let fx = fixture(2, QuotaGroupResolvers::new()).await;
    fx.manager
        .apply_update(AuthUpdate::add(claude_auth("a1", &["claude-sonnet-4"])))
        .await;
    fx.manager
        .apply_update(AuthUpdate::add(claude_auth("a2", &["claude-sonnet-4"])))
        .await;
    touch(&fx, "a2").await;

    // a1 rate-limited with a 2s recovery hint; request must succeed on a2.
    fx.executor.script(
        "a1",
        Err(GatewayError::from_status(429, "rate limited")
            .with_retry_after(Duration::from_secs(2))),
    );
    let response = fx
        .manager
        .execute(
            &RequestContext::new("s1"),
            &providers(),
            &request("claude-sonnet-4"),
            &ExecOptions::default(),
        )
        .await
        .expect("fallback to a2");
    assert_eq!(response.status, 200);
    assert_eq!(fx.executor.calls_for("a1"), 1);

    // Within the window a1 is skipped entirely.
    fx.manager
        .execute(
            &RequestContext::new("s1b"),
            &providers(),
            &request("claude-sonnet-4"),
            &ExecOptions::default(),
        )
        .await
        .expect("a2 serves while a1 cools down");
    assert_eq!(fx.executor.calls_for("a1"), 1);

    // Past the window a1 is the least-recently-used choice again.
    tokio::time::sleep(Duration::from_millis(2_100)).await;
    fx.manager
        .execute(
            &RequestContext::new("s1c"),
            &providers(),
            &request("claude-sonnet-4"),
            &ExecOptions::default(),
        )
        .await
        .expect("a1 eligible again");
    assert_eq!(fx.executor.calls_for("a1"), 2);
}

#[tokio::test(start_paused = true)]
async fn quota_group_blocks_sibling_models_never_tried() {
    let resolvers = QuotaGroupResolvers::new().register(
        "claude",
        Arc::new(|model: &str| {
            model
                .starts_with("claude-")
                .then(|| "claude-family".to_string())
        }),
    );
    let fx = fixture(0, resolvers).await;
    fx.manager
        .apply_update(AuthUpdate::add(claude_auth(
            "a1",
            &["claude-sonnet-4", "claude-opus-4", "claude-haiku-4"],
        )))
        .await;

    fx.executor
        .script("a1", Err(GatewayError::from_status(429, "quota exhausted")));
    let err = fx
        .manager
        .execute(
            &RequestContext::new("s2"),
            &providers(),
            &request("claude-sonnet-4"),
            &ExecOptions::default(),
        )
        .await
        .expect_err("only auth is quota-blocked");
    assert_eq!(err.category, ErrorCategory::QuotaError);

    // Sibling with no prior state is blocked at the same instant.
    let err = fx
        .manager
        .execute(
            &RequestContext::new("s2b"),
            &providers(),
            &request("claude-opus-4"),
            &ExecOptions::default(),
        )
        .await
        .expect_err("group block covers the sibling");
    assert_eq!(err.code, "auth_not_found");
    assert_eq!(fx.executor.calls_for("a1"), 1, "sibling never reached upstream");

    // After the 1s level-0 cooldown the group clears lazily.
    tokio::time::sleep(Duration::from_millis(1_100)).await;
    fx.manager
        .execute(
            &RequestContext::new("s2c"),
            &providers(),
            &request("claude-opus-4"),
            &ExecOptions::default(),
        )
        .await
        .expect("group expired");
}

#[tokio::test(start_paused = true)]
async fn user_error_returns_verbatim_without_retry_or_penalty() {
    let fx = fixture(2, QuotaGroupResolvers::new()).await;
    fx.manager
        .apply_update(AuthUpdate::add(claude_auth("a1", &["claude-sonnet-4"])))
        .await;
    fx.manager
        .apply_update(AuthUpdate::add(claude_auth("a2", &["claude-sonnet-4"])))
        .await;
    touch(&fx, "a2").await;
    let a2_calls_before = fx.executor.calls_for("a2");

    fx.executor
        .script("a1", Err(GatewayError::from_status(400, "malformed body")));
    let err = fx
        .manager
        .execute(
            &RequestContext::new("s3"),
            &providers(),
            &request("claude-sonnet-4"),
            &ExecOptions::default(),
        )
        .await
        .expect_err("user error surfaces");
    assert_eq!(err.http_status, 400);
    assert_eq!(err.category, ErrorCategory::UserError);
    assert_eq!(
        fx.executor.calls_for("a2"),
        a2_calls_before,
        "no fallback on user error"
    );

    let auth = fx.manager.get_auth("a1").await.unwrap();
    assert_eq!(auth.status, AuthStatus::Active);
    assert!(!auth.unavailable);

    let snap = fx.manager.stats().snapshot("claude", "claude-sonnet-4");
    assert_eq!(snap.failures, 0, "user errors never penalize the provider");
}

#[tokio::test(start_paused = true)]
async fn revoked_auth_is_disabled_and_never_selected_again() {
    let fx = fixture(2, QuotaGroupResolvers::new()).await;
    fx.manager
        .apply_update(AuthUpdate::add(claude_auth("a1", &["claude-sonnet-4"])))
        .await;
    fx.manager
        .apply_update(AuthUpdate::add(claude_auth("a2", &["claude-sonnet-4"])))
        .await;
    touch(&fx, "a2").await;

    // Revocation is terminal for the request: no fallback, the auth dies.
    fx.executor
        .script("a1", Err(GatewayError::from_status(401, "invalid_grant")));
    let err = fx
        .manager
        .execute(
            &RequestContext::new("s4"),
            &providers(),
            &request("claude-sonnet-4"),
            &ExecOptions::default(),
        )
        .await
        .expect_err("revocation surfaces");
    assert_eq!(err.category, ErrorCategory::AuthRevoked);

    let auth = fx.manager.get_auth("a1").await.unwrap();
    assert!(auth.disabled);
    assert_eq!(auth.status, AuthStatus::Disabled);

    // Later selection cycles never return the revoked auth.
    for _ in 0..4 {
        fx.manager
            .execute(
                &RequestContext::new("s4b"),
                &providers(),
                &request("claude-sonnet-4"),
                &ExecOptions::default(),
            )
            .await
            .expect("a2 keeps serving");
    }
    assert_eq!(fx.executor.calls_for("a1"), 1);
}

#[tokio::test(start_paused = true)]
async fn cooldown_wait_retries_the_same_auth_after_recovery() {
    let fx = fixture(2, QuotaGroupResolvers::new()).await;
    fx.manager
        .apply_update(AuthUpdate::add(claude_auth("a1", &["claude-sonnet-4"])))
        .await;

    fx.executor.script(
        "a1",
        Err(GatewayError::from_status(429, "rate limited")
            .with_retry_after(Duration::from_secs(1))),
    );
    let response = fx
        .manager
        .execute(
            &RequestContext::new("wait"),
            &providers(),
            &request("claude-sonnet-4"),
            &ExecOptions::default(),
        )
        .await
        .expect("waits out the cooldown and retries");
    assert_eq!(response.status, 200);
    assert_eq!(fx.executor.calls_for("a1"), 2);
}

#[tokio::test(start_paused = true)]
async fn stream_cancellation_records_nothing() {
    let fx = fixture(0, QuotaGroupResolvers::new()).await;
    fx.manager
        .apply_update(AuthUpdate::add(claude_auth("a1", &["claude-sonnet-4"])))
        .await;

    // Hand the manager a live upstream channel.
    let (tx, upstream) = mpsc::channel(8);
    struct StreamingExecutor {
        upstream: Mutex<Option<mpsc::Receiver<StreamChunk>>>,
    }
    #[async_trait]
    impl Executor for StreamingExecutor {
        fn identity(&self) -> &str {
            "claude"
        }
        async fn execute(
            &self,
            _ctx: &RequestContext,
            _auth: &Auth,
            _req: &ExecRequest,
            _opts: &ExecOptions,
        ) -> GatewayResult<ExecResponse> {
            Ok(ExecResponse::default())
        }
        async fn count_tokens(
            &self,
            _ctx: &RequestContext,
            _auth: &Auth,
            _req: &ExecRequest,
            _opts: &ExecOptions,
        ) -> GatewayResult<ExecResponse> {
            Ok(ExecResponse::default())
        }
        async fn execute_stream(
            &self,
            _ctx: &RequestContext,
            _auth: &Auth,
            _req: &ExecRequest,
            _opts: &ExecOptions,
        ) -> GatewayResult<mpsc::Receiver<StreamChunk>> {
            Ok(self.upstream.lock().unwrap().take().expect("one stream"))
        }
    }
    fx.manager.register_executor(Arc::new(StreamingExecutor {
        upstream: Mutex::new(Some(upstream)),
    }));

    let ctx = RequestContext::new("s5");
    let mut rx = fx
        .manager
        .execute_stream(&ctx, &providers(), &request("claude-sonnet-4"), &ExecOptions::default())
        .await
        .expect("stream opens");

    tx.send(StreamChunk::data(Bytes::from_static(b"one")))
        .await
        .unwrap();
    tx.send(StreamChunk::data(Bytes::from_static(b"two")))
        .await
        .unwrap();
    assert!(rx.recv().await.is_some());
    assert!(rx.recv().await.is_some());

    ctx.cancel.cancel();
    let closed = tokio::time::timeout(Duration::from_millis(500), tx.closed()).await;
    assert!(closed.is_ok(), "upstream released within 500ms of cancel");
    tokio::time::sleep(Duration::from_millis(50)).await;

    let snap = fx.manager.stats().snapshot("claude", "claude-sonnet-4");
    assert_eq!(snap.failures, 0);
    assert_eq!(snap.successes, 0);
    assert!(fx.usage.records().is_empty(), "no usage on client disconnect");
}

#[tokio::test(start_paused = true)]
async fn usage_records_carry_result_and_tokens() {
    let fx = fixture(0, QuotaGroupResolvers::new()).await;
    fx.manager
        .apply_update(AuthUpdate::add(claude_auth("a1", &["claude-sonnet-4"])))
        .await;

    fx.executor.script(
        "a1",
        Ok(ExecResponse {
            status: 200,
            body: Bytes::from_static(b"{}"),
            usage: Some(llm_mux_auth::TokenUsage {
                input: 100,
                output: 20,
                total: 120,
                ..Default::default()
            }),
        }),
    );
    fx.manager
        .execute(
            &RequestContext::new("usage"),
            &providers(),
            &request("claude-sonnet-4"),
            &ExecOptions::default(),
        )
        .await
        .unwrap();

    let records = fx.usage.records();
    assert_eq!(records.len(), 1);
    let record = &records[0];
    assert!(!record.failed);
    assert_eq!(record.provider, "claude");
    assert_eq!(record.model, "claude-sonnet-4");
    assert_eq!(record.auth_id, "a1");
    assert_eq!(record.api_key.as_deref(), Some("sk-test"));
    assert_eq!(record.tokens.total, 120);
}
