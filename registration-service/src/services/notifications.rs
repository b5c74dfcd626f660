//! Fire-and-forget notifications on registration status changes.

use crate::models::RegistrationStatus;
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Send error: {0}")]
    SendFailed(String),
}

/// Payload delivered to the notification collaborator.
#[derive(Debug, Clone, Serialize)]
pub struct StatusChange {
    pub registration_id: Uuid,
    pub order_code: String,
    pub event_id: Uuid,
    pub previous_status: RegistrationStatus,
    pub status: RegistrationStatus,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, change: &StatusChange) -> Result<(), NotifyError>;
}

/// Spawn delivery in the background. Failures are logged and dropped.
pub fn dispatch(notifier: Arc<dyn Notifier>, change: StatusChange) {
    tokio::spawn(async move {
        if let Err(e) = notifier.notify(&change).await {
            tracing::warn!(
                error = %e,
                order_code = %change.order_code,
                status = %change.status,
                "Status notification failed"
            );
        }
    });
}

/// POSTs status changes as JSON to a configured endpoint.
pub struct HttpNotifier {
    client: Client,
    url: String,
}

impl HttpNotifier {
    pub fn new(url: impl Into<String>) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .unwrap_or_default();
        Self {
            client,
            url: url.into(),
        }
    }
}

#[async_trait]
impl Notifier for HttpNotifier {
    async fn notify(&self, change: &StatusChange) -> Result<(), NotifyError> {
        let response = self
            .client
            .post(&self.url)
            .json(change)
            .send()
            .await
            .map_err(|e| NotifyError::Connection(e.to_string()))?;

        if !response.status().is_success() {
            return Err(NotifyError::SendFailed(format!(
                "notification endpoint returned {}",
                response.status()
            )));
        }

        tracing::debug!(order_code = %change.order_code, status = %change.status, "Status notification sent");
        Ok(())
    }
}

/// Used when no endpoint is configured.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, change: &StatusChange) -> Result<(), NotifyError> {
        tracing::info!(
            registration_id = %change.registration_id,
            order_code = %change.order_code,
            previous_status = %change.previous_status,
            status = %change.status,
            "Registration status changed"
        );
        Ok(())
    }
}

/// Records notifications in memory for tests.
#[derive(Default)]
pub struct MockNotifier {
    sent: Mutex<Vec<StatusChange>>,
    send_count: AtomicU64,
}

impl MockNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn send_count(&self) -> u64 {
        self.send_count.load(Ordering::SeqCst)
    }

    pub fn sent(&self) -> Vec<StatusChange> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl Notifier for MockNotifier {
    async fn notify(&self, change: &StatusChange) -> Result<(), NotifyError> {
        self.send_count.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut sent) = self.sent.lock() {
            sent.push(change.clone());
        }
        Ok(())
    }
}

/// Pick the notifier for the configured endpoint.
pub fn notifier_for(webhook_url: Option<&str>) -> Arc<dyn Notifier> {
    match webhook_url {
        Some(url) => Arc::new(HttpNotifier::new(url)),
        None => Arc::new(LogNotifier),
    }
}
