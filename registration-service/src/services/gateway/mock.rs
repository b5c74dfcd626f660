//! In-memory gateway doubles for tests and local runs.

use super::{
    map_common_status, CommissionPayer, CommissionTransfer, GatewayError, InitiateRequest,
    InitiateResult, PaymentGateway, QueryResult,
};
use crate::models::PaymentStatus;
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Gateway that answers from configurable canned results.
pub struct MockGateway {
    initiate_status: Mutex<Result<PaymentStatus, GatewayError>>,
    query_status: Mutex<Result<PaymentStatus, GatewayError>>,
    initiate_count: AtomicU64,
    query_count: AtomicU64,
}

impl Default for MockGateway {
    fn default() -> Self {
        Self {
            initiate_status: Mutex::new(Ok(PaymentStatus::Pending)),
            query_status: Mutex::new(Ok(PaymentStatus::Pending)),
            initiate_count: AtomicU64::new(0),
            query_count: AtomicU64::new(0),
        }
    }
}

impl MockGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Provider payment id the mock assigns to one of our payments.
    pub fn provider_id_for(payment_id: uuid::Uuid) -> String {
        format!("mock-{}", payment_id)
    }

    pub fn set_initiate(&self, result: Result<PaymentStatus, GatewayError>) {
        if let Ok(mut slot) = self.initiate_status.lock() {
            *slot = result;
        }
    }

    pub fn set_query(&self, result: Result<PaymentStatus, GatewayError>) {
        if let Ok(mut slot) = self.query_status.lock() {
            *slot = result;
        }
    }

    pub fn initiate_count(&self) -> u64 {
        self.initiate_count.load(Ordering::SeqCst)
    }

    pub fn query_count(&self) -> u64 {
        self.query_count.load(Ordering::SeqCst)
    }

    fn current(slot: &Mutex<Result<PaymentStatus, GatewayError>>) -> Result<PaymentStatus, GatewayError> {
        slot.lock()
            .map(|r| r.clone())
            .unwrap_or(Err(GatewayError::Connection("mock poisoned".to_string())))
    }
}

#[async_trait]
impl PaymentGateway for MockGateway {
    fn provider(&self) -> &str {
        "mock"
    }

    async fn initiate(&self, request: &InitiateRequest) -> Result<InitiateResult, GatewayError> {
        self.initiate_count.fetch_add(1, Ordering::SeqCst);
        let status = Self::current(&self.initiate_status)?;
        if status == PaymentStatus::Denied {
            return Err(GatewayError::Denied {
                reason: "mock denial".to_string(),
                raw: None,
            });
        }

        let provider_payment_id = Self::provider_id_for(request.payment_id);
        Ok(InitiateResult {
            provider_payment_id: provider_payment_id.clone(),
            client_payload: Some(serde_json::json!({ "qr_code": format!("pix://{}", provider_payment_id) })),
            status,
            raw: serde_json::json!({ "id": provider_payment_id, "status": status.as_str() }),
        })
    }

    async fn query(&self, provider_payment_id: &str) -> Result<QueryResult, GatewayError> {
        self.query_count.fetch_add(1, Ordering::SeqCst);
        let status = Self::current(&self.query_status)?;
        Ok(QueryResult {
            status,
            raw: serde_json::json!({ "id": provider_payment_id, "status": status.as_str() }),
        })
    }

    fn map_status(&self, provider_status: &str) -> Option<PaymentStatus> {
        map_common_status(provider_status)
    }
}

/// Commission payer that records transfers in memory.
#[derive(Default)]
pub struct MockCommissionPayer {
    transfers: Mutex<Vec<CommissionTransfer>>,
    fail_next: AtomicU64,
}

impl MockCommissionPayer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` transfers fail.
    pub fn fail_next(&self, n: u64) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    pub fn transfers(&self) -> Vec<CommissionTransfer> {
        self.transfers.lock().map(|t| t.clone()).unwrap_or_default()
    }

    pub fn transfer_count(&self) -> usize {
        self.transfers().len()
    }
}

#[async_trait]
impl CommissionPayer for MockCommissionPayer {
    async fn transfer(&self, transfer: &CommissionTransfer) -> Result<String, GatewayError> {
        let should_fail = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if should_fail {
            return Err(GatewayError::Server {
                status: 503,
                body: "mock outage".to_string(),
            });
        }

        if let Ok(mut transfers) = self.transfers.lock() {
            transfers.push(transfer.clone());
        }
        Ok(format!("mock-transfer-{}", transfer.payment_id))
    }
}
