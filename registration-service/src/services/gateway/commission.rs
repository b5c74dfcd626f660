use super::{CallPolicy, GatewayError};
use crate::services::pricing::to_minor_units;
use async_trait::async_trait;
use reqwest::Client;
use rust_decimal::Decimal;
use secrecy::{ExposeSecret, Secret};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One commission transfer; `payment_id` doubles as the idempotency key.
#[derive(Debug, Clone)]
pub struct CommissionTransfer {
    pub payment_id: Uuid,
    pub amount: Decimal,
    pub currency: String,
    pub pix_key: String,
}

#[async_trait]
pub trait CommissionPayer: Send + Sync {
    /// Perform the transfer; returns the provider's transfer id.
    async fn transfer(&self, transfer: &CommissionTransfer) -> Result<String, GatewayError>;
}

/// PIX payout API client.
pub struct PixCommissionPayer {
    base_url: String,
    api_key: Secret<String>,
    client: Client,
    policy: CallPolicy,
}

#[derive(Debug, Serialize)]
struct TransferRequest<'a> {
    amount: i64,
    currency: &'a str,
    pix_key: &'a str,
    external_reference: String,
}

#[derive(Debug, Deserialize)]
struct TransferResponse {
    id: String,
    status: String,
}

impl PixCommissionPayer {
    pub fn new(base_url: impl Into<String>, api_key: Secret<String>, policy: CallPolicy) -> Self {
        let client = Client::builder()
            .timeout(policy.timeout)
            .build()
            .unwrap_or_default();

        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            client,
            policy,
        }
    }

    async fn send_once(&self, transfer: &CommissionTransfer) -> Result<String, GatewayError> {
        let amount = to_minor_units(transfer.amount)
            .ok_or_else(|| GatewayError::InvalidResponse("amount out of range".to_string()))?;

        let response = self
            .client
            .post(format!("{}/v1/pix/transfers", self.base_url))
            .bearer_auth(self.api_key.expose_secret())
            .header("Idempotency-Key", transfer.payment_id.to_string())
            .json(&TransferRequest {
                amount,
                currency: &transfer.currency,
                pix_key: &transfer.pix_key,
                external_reference: transfer.payment_id.to_string(),
            })
            .send()
            .await
            .map_err(GatewayError::from_reqwest)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GatewayError::from_status(status.as_u16(), body));
        }

        let body: TransferResponse = response.json().await.map_err(GatewayError::from_reqwest)?;
        match body.status.to_ascii_lowercase().as_str() {
            "failed" | "rejected" | "denied" => Err(GatewayError::Denied {
                reason: format!("transfer {} {}", body.id, body.status),
                raw: None,
            }),
            _ => Ok(body.id),
        }
    }
}

#[async_trait]
impl CommissionPayer for PixCommissionPayer {
    async fn transfer(&self, transfer: &CommissionTransfer) -> Result<String, GatewayError> {
        self.policy
            .run("commission_transfer", || self.send_once(transfer))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn transfer() -> CommissionTransfer {
        CommissionTransfer {
            payment_id: Uuid::new_v4(),
            amount: Decimal::new(450, 2),
            currency: "BRL".to_string(),
            pix_key: "organizer@pix.example".to_string(),
        }
    }

    fn payer(server: &MockServer, max_attempts: u32) -> PixCommissionPayer {
        let mut policy = CallPolicy::new(max_attempts, Duration::from_secs(5));
        policy.retry.initial_backoff = Duration::from_millis(1);
        policy.retry.max_backoff = Duration::from_millis(2);
        PixCommissionPayer::new(server.uri(), Secret::new("pk_test".to_string()), policy)
    }

    #[tokio::test]
    async fn test_transfer_posts_pix_payout() {
        let server = MockServer::start().await;
        let transfer = transfer();

        Mock::given(method("POST"))
            .and(path("/v1/pix/transfers"))
            .and(header("Idempotency-Key", transfer.payment_id.to_string().as_str()))
            .and(body_partial_json(json!({ "amount": 450, "pix_key": "organizer@pix.example" })))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "id": "tr_1",
                "status": "processing"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let id = payer(&server, 3).transfer(&transfer).await.unwrap();
        assert_eq!(id, "tr_1");
    }

    #[tokio::test]
    async fn test_server_errors_are_retried_up_to_the_limit() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(502))
            .expect(3)
            .mount(&server)
            .await;

        let err = payer(&server, 3).transfer(&transfer()).await.unwrap_err();
        assert_eq!(err.kind(), "server_error");
    }

    #[tokio::test]
    async fn test_failed_transfer_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "tr_2",
                "status": "rejected"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let err = payer(&server, 3).transfer(&transfer()).await.unwrap_err();
        assert!(matches!(err, GatewayError::Denied { .. }));
    }
}
