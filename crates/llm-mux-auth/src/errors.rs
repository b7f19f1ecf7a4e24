//! Upstream failure taxonomy.
//!
//! Every upstream fault is folded into a [`GatewayError`] at the executor
//! boundary; the manager only ever dispatches on `category`, never on raw
//! status codes or message text.

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCategory {
    Unknown,
    /// 5xx, timeouts, connection resets. Eligible for same-request fallback.
    Transient,
    /// 401/407 without a revocation marker. The auth may recover.
    AuthError,
    /// 401 with "revoked"/"invalid_grant". The auth is dead.
    AuthRevoked,
    /// 429 or a provider-specific quota marker.
    QuotaError,
    NotFound,
    /// Malformed request. Never the provider's fault, never retried.
    UserError,
}

pub type GatewayResult<T> = Result<T, GatewayError>;

#[derive(Debug, Clone, thiserror::Error)]
#[error("{code}: {message}")]
pub struct GatewayError {
    pub code: String,
    pub message: String,
    pub category: ErrorCategory,
    pub http_status: u16,
    pub retryable: bool,
    pub retry_after: Option<Duration>,
}

impl GatewayError {
    pub fn new(
        code: impl Into<String>,
        message: impl Into<String>,
        category: ErrorCategory,
        http_status: u16,
    ) -> Self {
        let retryable = matches!(
            category,
            ErrorCategory::Transient
                | ErrorCategory::QuotaError
                | ErrorCategory::AuthError
                | ErrorCategory::NotFound
        );
        Self {
            code: code.into(),
            message: message.into(),
            category,
            http_status,
            retryable,
            retry_after: None,
        }
    }

    /// Classify an upstream HTTP failure from status + body text.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        let category = classify(status, &message);
        let code = match category {
            ErrorCategory::UserError => "invalid_request",
            ErrorCategory::AuthError => "auth_error",
            ErrorCategory::AuthRevoked => "auth_revoked",
            ErrorCategory::QuotaError => "quota_exceeded",
            ErrorCategory::NotFound => "not_found",
            ErrorCategory::Transient => "upstream_unavailable",
            ErrorCategory::Unknown => "upstream_error",
        };
        Self::new(code, message, category, status)
    }

    /// Transport-level failures never produced an HTTP response.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::new("transport_error", message, ErrorCategory::Transient, 0)
    }

    pub fn auth_not_found(provider_list: &str) -> Self {
        Self::new(
            "auth_not_found",
            format!("no usable auth for providers: {provider_list}"),
            ErrorCategory::Unknown,
            503,
        )
    }

    pub fn cooldown_timeout() -> Self {
        Self::new(
            "cooldown_timeout",
            "all auths cooling down past the retry deadline",
            ErrorCategory::Unknown,
            503,
        )
    }

    pub fn cancelled() -> Self {
        Self::new("request_cancelled", "request context cancelled", ErrorCategory::Unknown, 499)
    }

    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }

    /// Whether the manager may try another auth/provider for the same request.
    pub fn should_fallback(&self) -> bool {
        matches!(
            self.category,
            ErrorCategory::Transient
                | ErrorCategory::QuotaError
                | ErrorCategory::AuthError
                | ErrorCategory::NotFound
        )
    }

    /// Walk an error's source chain looking for a `GatewayError`.
    ///
    /// Executors may wrap gateway errors in their own types; the manager
    /// needs the inner classification to drive state updates.
    pub fn find_in<'a>(err: &'a (dyn std::error::Error + 'static)) -> Option<&'a GatewayError> {
        let mut current: Option<&(dyn std::error::Error + 'static)> = Some(err);
        while let Some(inner) = current {
            if let Some(gateway) = inner.downcast_ref::<GatewayError>() {
                return Some(gateway);
            }
            current = inner.source();
        }
        None
    }
}

fn classify(status: u16, message: &str) -> ErrorCategory {
    let lowered = message.to_ascii_lowercase();
    if status == 401 || status == 403 || status == 407 {
        if lowered.contains("revoked") || lowered.contains("invalid_grant") {
            return ErrorCategory::AuthRevoked;
        }
        return ErrorCategory::AuthError;
    }
    if status == 429
        || lowered.contains("quota")
        || lowered.contains("rate limit")
        || lowered.contains("resource_exhausted")
    {
        return ErrorCategory::QuotaError;
    }
    match status {
        400 => ErrorCategory::UserError,
        404 => ErrorCategory::NotFound,
        500..=599 => ErrorCategory::Transient,
        _ => ErrorCategory::Unknown,
    }
}

/// Parse a `Retry-After` header value (delta-seconds form only).
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    let secs = value.parse::<u64>().ok()?;
    Some(Duration::from_secs(secs))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_by_status() {
        assert_eq!(
            GatewayError::from_status(400, "bad json").category,
            ErrorCategory::UserError
        );
        assert_eq!(
            GatewayError::from_status(404, "no such model").category,
            ErrorCategory::NotFound
        );
        assert_eq!(
            GatewayError::from_status(503, "overloaded").category,
            ErrorCategory::Transient
        );
        assert_eq!(
            GatewayError::from_status(429, "slow down").category,
            ErrorCategory::QuotaError
        );
    }

    #[test]
    fn revocation_markers_win_over_plain_auth_errors() {
        assert_eq!(
            GatewayError::from_status(401, "token revoked").category,
            ErrorCategory::AuthRevoked
        );
        assert_eq!(
            GatewayError::from_status(401, "invalid_grant").category,
            ErrorCategory::AuthRevoked
        );
        assert_eq!(
            GatewayError::from_status(401, "expired token").category,
            ErrorCategory::AuthError
        );
    }

    #[test]
    fn quota_markers_classify_without_429() {
        assert_eq!(
            GatewayError::from_status(200, "RESOURCE_EXHAUSTED").category,
            ErrorCategory::QuotaError
        );
    }

    #[test]
    fn user_error_never_falls_back() {
        assert!(!GatewayError::from_status(400, "bad").should_fallback());
        assert!(GatewayError::from_status(500, "boom").should_fallback());
        assert!(GatewayError::transport("reset by peer").should_fallback());
    }

    #[test]
    fn finds_nested_gateway_error() {
        #[derive(Debug, thiserror::Error)]
        #[error("adapter failed")]
        struct Wrapper(#[source] GatewayError);

        let wrapped = Wrapper(GatewayError::from_status(429, "quota"));
        let found = GatewayError::find_in(&wrapped).expect("inner error");
        assert_eq!(found.category, ErrorCategory::QuotaError);
    }

    #[test]
    fn parses_retry_after_seconds() {
        assert_eq!(parse_retry_after("2"), Some(Duration::from_secs(2)));
        assert_eq!(parse_retry_after(""), None);
        assert_eq!(parse_retry_after("soon"), None);
    }
}
