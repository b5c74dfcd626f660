//! Gateway adapter: a uniform interface over payment providers plus the call
//! policy (bounded retry, hard timeout) every outbound call runs under.

pub mod card_pix;
pub mod commission;
pub mod mock;

pub use card_pix::CardPixGateway;
pub use commission::{CommissionPayer, CommissionTransfer, PixCommissionPayer};
pub use mock::{MockCommissionPayer, MockGateway};

use crate::models::{PaymentMethod, PaymentStatus};
use crate::services::metrics::record_gateway_call;
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Serialize;
use service_core::retry::{retry_with_backoff, RetryConfig, Transient};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    #[error("Gateway timed out: {0}")]
    Timeout(String),

    #[error("Gateway connection error: {0}")]
    Connection(String),

    #[error("Gateway server error {status}: {body}")]
    Server { status: u16, body: String },

    #[error("Gateway rate limited the request")]
    RateLimited,

    /// Business refusal (card declined, insufficient funds). Terminal.
    #[error("Payment denied: {reason}")]
    Denied {
        reason: String,
        raw: Option<serde_json::Value>,
    },

    /// Any other 4xx: a request or configuration problem on our side.
    #[error("Gateway rejected the request {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("Invalid gateway response: {0}")]
    InvalidResponse(String),
}

impl Transient for GatewayError {
    fn is_transient(&self) -> bool {
        matches!(
            self,
            GatewayError::Timeout(_)
                | GatewayError::Connection(_)
                | GatewayError::Server { .. }
                | GatewayError::RateLimited
        )
    }
}

impl GatewayError {
    /// Classify a non-success HTTP status.
    pub fn from_status(status: u16, body: String) -> Self {
        match status {
            402 | 422 => GatewayError::Denied {
                reason: body.clone(),
                raw: serde_json::from_str(&body).ok(),
            },
            429 => GatewayError::RateLimited,
            500..=599 => GatewayError::Server { status, body },
            _ => GatewayError::Rejected { status, body },
        }
    }

    /// Classify a transport-level failure.
    pub fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            GatewayError::Timeout(err.to_string())
        } else if err.is_decode() {
            GatewayError::InvalidResponse(err.to_string())
        } else {
            GatewayError::Connection(err.to_string())
        }
    }

    /// Short label for metrics and audit rows.
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::Timeout(_) => "timeout",
            GatewayError::Connection(_) => "connection",
            GatewayError::Server { .. } => "server_error",
            GatewayError::RateLimited => "rate_limited",
            GatewayError::Denied { .. } => "denied",
            GatewayError::Rejected { .. } => "rejected",
            GatewayError::InvalidResponse(_) => "invalid_response",
        }
    }
}

/// Buyer identity sent along with a charge.
#[derive(Debug, Clone, Serialize)]
pub struct Customer {
    pub name: String,
    pub email: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub document: Option<String>,
}

#[derive(Debug, Clone)]
pub struct InitiateRequest {
    /// Our payment id; sent as external reference and idempotency key.
    pub payment_id: Uuid,
    pub amount: Decimal,
    pub currency: String,
    pub method: PaymentMethod,
    pub customer: Customer,
    pub description: String,
}

#[derive(Debug, Clone)]
pub struct InitiateResult {
    pub provider_payment_id: String,
    /// Data the buyer needs to finish paying (PIX QR code, redirect).
    pub client_payload: Option<serde_json::Value>,
    pub status: PaymentStatus,
    pub raw: serde_json::Value,
}

#[derive(Debug, Clone)]
pub struct QueryResult {
    pub status: PaymentStatus,
    pub raw: serde_json::Value,
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Provider name as stored on payment rows and used in webhook routes.
    fn provider(&self) -> &str;

    async fn initiate(&self, request: &InitiateRequest) -> Result<InitiateResult, GatewayError>;

    async fn query(&self, provider_payment_id: &str) -> Result<QueryResult, GatewayError>;

    /// Normalize a provider status string; `None` for statuses we do not track.
    fn map_status(&self, provider_status: &str) -> Option<PaymentStatus>;
}

/// Bounded retry for transient failures inside a hard timeout for the whole call.
#[derive(Debug, Clone)]
pub struct CallPolicy {
    pub retry: RetryConfig,
    pub timeout: Duration,
}

impl CallPolicy {
    pub fn new(max_attempts: u32, timeout: Duration) -> Self {
        Self {
            retry: RetryConfig::with_max_attempts(max_attempts),
            timeout,
        }
    }

    pub async fn run<F, Fut, T>(&self, operation: &str, f: F) -> Result<T, GatewayError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, GatewayError>>,
    {
        let started = Instant::now();
        let result = match tokio::time::timeout(
            self.timeout,
            retry_with_backoff(&self.retry, operation, f),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(GatewayError::Timeout(format!(
                "{} exceeded {}ms",
                operation,
                self.timeout.as_millis()
            ))),
        };

        let outcome = match &result {
            Ok(_) => "ok",
            Err(e) => e.kind(),
        };
        record_gateway_call(operation, outcome, started.elapsed().as_secs_f64());
        result
    }
}

/// A payment gateway together with the policy its calls run under.
#[derive(Clone)]
pub struct GatewayClient {
    gateway: Arc<dyn PaymentGateway>,
    policy: CallPolicy,
}

impl GatewayClient {
    pub fn new(gateway: Arc<dyn PaymentGateway>, policy: CallPolicy) -> Self {
        Self { gateway, policy }
    }

    pub fn provider(&self) -> &str {
        self.gateway.provider()
    }

    pub fn map_status(&self, provider_status: &str) -> Option<PaymentStatus> {
        self.gateway.map_status(provider_status)
    }

    pub async fn initiate(&self, request: &InitiateRequest) -> Result<InitiateResult, GatewayError> {
        self.policy
            .run("gateway_initiate", || self.gateway.initiate(request))
            .await
    }

    pub async fn query(&self, provider_payment_id: &str) -> Result<QueryResult, GatewayError> {
        self.policy
            .run("gateway_query", || self.gateway.query(provider_payment_id))
            .await
    }
}

/// Status vocabulary shared by the HTTP adapters.
pub fn map_common_status(provider_status: &str) -> Option<PaymentStatus> {
    let status = provider_status.trim().to_ascii_lowercase();
    match status.as_str() {
        "pending" | "waiting" | "waiting_payment" | "in_process" | "created" => {
            Some(PaymentStatus::Pending)
        }
        "authorized" | "pre_authorized" => Some(PaymentStatus::Authorized),
        "confirmed" | "approved" | "paid" | "captured" | "settled" => {
            Some(PaymentStatus::Confirmed)
        }
        "denied" | "declined" | "rejected" | "refused" | "failed" => Some(PaymentStatus::Denied),
        "cancelled" | "canceled" | "voided" => Some(PaymentStatus::Cancelled),
        "refunded" | "charged_back" | "chargeback" => Some(PaymentStatus::Refunded),
        "expired" => Some(PaymentStatus::Expired),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_status_classification() {
        assert!(matches!(
            GatewayError::from_status(402, "{}".into()),
            GatewayError::Denied { .. }
        ));
        assert!(matches!(
            GatewayError::from_status(422, "no funds".into()),
            GatewayError::Denied { .. }
        ));
        assert!(GatewayError::from_status(503, String::new()).is_transient());
        assert!(GatewayError::from_status(429, String::new()).is_transient());
        assert!(!GatewayError::from_status(401, String::new()).is_transient());
        assert!(!GatewayError::from_status(402, String::new()).is_transient());
    }

    #[test]
    fn test_common_status_vocabulary() {
        assert_eq!(map_common_status("APPROVED"), Some(PaymentStatus::Confirmed));
        assert_eq!(map_common_status("canceled"), Some(PaymentStatus::Cancelled));
        assert_eq!(map_common_status("in_process"), Some(PaymentStatus::Pending));
        assert_eq!(map_common_status("mystery"), None);
    }

    fn fast_policy(max_attempts: u32, timeout: Duration) -> CallPolicy {
        let mut policy = CallPolicy::new(max_attempts, timeout);
        policy.retry.initial_backoff = Duration::from_millis(1);
        policy.retry.max_backoff = Duration::from_millis(2);
        policy
    }

    #[tokio::test]
    async fn test_policy_retries_transient_then_succeeds() {
        let calls = AtomicU32::new(0);
        let policy = fast_policy(3, Duration::from_secs(5));

        let result = policy
            .run("test_op", || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(GatewayError::Server {
                        status: 502,
                        body: String::new(),
                    })
                } else {
                    Ok(7)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_policy_never_retries_denial() {
        let calls = AtomicU32::new(0);
        let policy = fast_policy(3, Duration::from_secs(5));

        let result: Result<(), _> = policy
            .run("test_op", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(GatewayError::Denied {
                    reason: "insufficient funds".into(),
                    raw: None,
                })
            })
            .await;

        assert!(matches!(result, Err(GatewayError::Denied { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_policy_hard_timeout_bounds_whole_call() {
        let policy = fast_policy(3, Duration::from_millis(50));

        let result: Result<(), _> = policy
            .run("test_op", || async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;

        assert!(matches!(result, Err(GatewayError::Timeout(_))));
    }
}
