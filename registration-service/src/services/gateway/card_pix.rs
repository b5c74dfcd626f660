use super::{
    map_common_status, GatewayError, InitiateRequest, InitiateResult, PaymentGateway, QueryResult,
};
use crate::models::PaymentStatus;
use crate::services::pricing::to_minor_units;
use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, Secret};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// HTTP/JSON card and PIX processor.
pub struct CardPixGateway {
    provider: String,
    base_url: String,
    api_key: Secret<String>,
    client: Client,
}

#[derive(Debug, Serialize)]
struct ChargeRequest<'a> {
    amount: i64,
    currency: &'a str,
    method: &'a str,
    external_reference: String,
    description: &'a str,
    customer: &'a super::Customer,
}

#[derive(Debug, Deserialize)]
struct ChargeResponse {
    id: String,
    status: String,
    #[serde(default)]
    pix: Option<serde_json::Value>,
    #[serde(default)]
    status_detail: Option<String>,
}

impl CardPixGateway {
    pub fn new(
        provider: impl Into<String>,
        base_url: impl Into<String>,
        api_key: Secret<String>,
        request_timeout: Duration,
    ) -> Self {
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .unwrap_or_default();

        Self {
            provider: provider.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            client,
        }
    }

    async fn read_charge(response: reqwest::Response) -> Result<(ChargeResponse, serde_json::Value), GatewayError> {
        let status = response.status();
        let body = response.text().await.map_err(GatewayError::from_reqwest)?;

        if !status.is_success() {
            return Err(GatewayError::from_status(status.as_u16(), body));
        }

        let raw: serde_json::Value = serde_json::from_str(&body)
            .map_err(|e| GatewayError::InvalidResponse(format!("not JSON: {}", e)))?;
        let charge: ChargeResponse = serde_json::from_value(raw.clone())
            .map_err(|e| GatewayError::InvalidResponse(e.to_string()))?;
        Ok((charge, raw))
    }
}

#[async_trait]
impl PaymentGateway for CardPixGateway {
    fn provider(&self) -> &str {
        &self.provider
    }

    async fn initiate(&self, request: &InitiateRequest) -> Result<InitiateResult, GatewayError> {
        let amount = to_minor_units(request.amount)
            .ok_or_else(|| GatewayError::InvalidResponse("amount out of range".to_string()))?;

        let body = ChargeRequest {
            amount,
            currency: &request.currency,
            method: request.method.as_str(),
            external_reference: request.payment_id.to_string(),
            description: &request.description,
            customer: &request.customer,
        };

        let response = self
            .client
            .post(format!("{}/v1/payments", self.base_url))
            .bearer_auth(self.api_key.expose_secret())
            .header("Idempotency-Key", request.payment_id.to_string())
            .json(&body)
            .send()
            .await
            .map_err(GatewayError::from_reqwest)?;

        let (charge, raw) = Self::read_charge(response).await?;
        let status = self.map_status(&charge.status).ok_or_else(|| {
            GatewayError::InvalidResponse(format!("unknown status '{}'", charge.status))
        })?;

        if status == PaymentStatus::Denied {
            return Err(GatewayError::Denied {
                reason: charge
                    .status_detail
                    .unwrap_or_else(|| "denied by processor".to_string()),
                raw: Some(raw),
            });
        }

        tracing::info!(
            payment_id = %request.payment_id,
            provider_payment_id = %charge.id,
            status = %status,
            "Charge created at processor"
        );

        Ok(InitiateResult {
            provider_payment_id: charge.id,
            client_payload: charge.pix,
            status,
            raw,
        })
    }

    async fn query(&self, provider_payment_id: &str) -> Result<QueryResult, GatewayError> {
        let response = self
            .client
            .get(format!("{}/v1/payments/{}", self.base_url, provider_payment_id))
            .bearer_auth(self.api_key.expose_secret())
            .send()
            .await
            .map_err(GatewayError::from_reqwest)?;

        let (charge, raw) = Self::read_charge(response).await?;
        let status = self.map_status(&charge.status).ok_or_else(|| {
            GatewayError::InvalidResponse(format!("unknown status '{}'", charge.status))
        })?;

        Ok(QueryResult { status, raw })
    }

    fn map_status(&self, provider_status: &str) -> Option<PaymentStatus> {
        map_common_status(provider_status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PaymentMethod;
    use crate::services::gateway::Customer;
    use rust_decimal::Decimal;
    use serde_json::json;
    use uuid::Uuid;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn gateway(server: &MockServer) -> CardPixGateway {
        CardPixGateway::new(
            "cardpix",
            server.uri(),
            Secret::new("sk_test".to_string()),
            Duration::from_secs(5),
        )
    }

    fn request() -> InitiateRequest {
        InitiateRequest {
            payment_id: Uuid::new_v4(),
            amount: Decimal::new(12990, 2),
            currency: "BRL".to_string(),
            method: PaymentMethod::Pix,
            customer: Customer {
                name: "Maria Souza".to_string(),
                email: "maria@example.com".to_string(),
                document: None,
            },
            description: "Registration ABCD1234X".to_string(),
        }
    }

    #[tokio::test]
    async fn test_initiate_sends_minor_units_and_idempotency_key() {
        let server = MockServer::start().await;
        let request = request();

        Mock::given(method("POST"))
            .and(path("/v1/payments"))
            .and(header("Idempotency-Key", request.payment_id.to_string().as_str()))
            .and(header("Authorization", "Bearer sk_test"))
            .and(body_partial_json(json!({ "amount": 12990, "method": "pix", "currency": "BRL" })))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "id": "ch_123",
                "status": "waiting_payment",
                "pix": { "qr_code": "000201..." }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let result = gateway(&server).initiate(&request).await.unwrap();
        assert_eq!(result.provider_payment_id, "ch_123");
        assert_eq!(result.status, PaymentStatus::Pending);
        assert_eq!(result.client_payload.unwrap()["qr_code"], "000201...");
    }

    #[tokio::test]
    async fn test_declined_charge_is_denied() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/payments"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "ch_9",
                "status": "declined",
                "status_detail": "insufficient_funds"
            })))
            .mount(&server)
            .await;

        match gateway(&server).initiate(&request()).await {
            Err(GatewayError::Denied { reason, raw }) => {
                assert_eq!(reason, "insufficient_funds");
                assert!(raw.is_some());
            }
            other => panic!("expected denial, got {:?}", other.map(|r| r.status)),
        }
    }

    #[tokio::test]
    async fn test_http_status_classification() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(402).set_body_string("card refused"))
            .mount(&server)
            .await;
        let err = gateway(&server).initiate(&request()).await.unwrap_err();
        assert_eq!(err.kind(), "denied");

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;
        let err = gateway(&server).initiate(&request()).await.unwrap_err();
        assert!(matches!(err, GatewayError::Server { status: 503, .. }));

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_string("bad currency"))
            .mount(&server)
            .await;
        let err = gateway(&server).initiate(&request()).await.unwrap_err();
        assert!(matches!(err, GatewayError::Rejected { status: 400, .. }));
    }

    #[tokio::test]
    async fn test_query_maps_provider_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/payments/ch_123"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "ch_123",
                "status": "paid"
            })))
            .mount(&server)
            .await;

        let result = gateway(&server).query("ch_123").await.unwrap();
        assert_eq!(result.status, PaymentStatus::Confirmed);
        assert_eq!(result.raw["id"], "ch_123");
    }

    #[tokio::test]
    async fn test_unknown_status_is_invalid_response() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "ch_1",
                "status": "teleported"
            })))
            .mount(&server)
            .await;

        let err = gateway(&server).query("ch_1").await.unwrap_err();
        assert_eq!(err.kind(), "invalid_response");
    }
}
