//! Webhook reconciler: turns provider status reports into ledger transitions.
//!
//! Reports are deduplicated on `(provider_payment_id, reported_status)`. The
//! receipt is written in the same transaction as the transition it caused, so
//! a redelivered report either sees the receipt or waits on the registration
//! lock and then sees it.

use crate::error::{RegistrationError, Result};
use crate::models::{PaymentStatus, RegistrationPayment, TransactionKind};
use crate::services::database::Database;
use crate::services::metrics::record_webhook;
use crate::services::payments::{
    settle_locked, PaymentLedger, PaymentService, SideEffects, TransitionOutcome, TransitionSource,
};
use crate::services::registrations::RegistrationStore;
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use sqlx::PgConnection;
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// Provider status report as received on `/webhooks/{provider}`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookNotice {
    #[serde(alias = "provider_payment_id")]
    pub provider_payment_id: String,
    pub status: String,
    #[serde(default)]
    pub raw: serde_json::Value,
    /// Our payment id, echoed back by providers that support it.
    #[serde(default, alias = "external_reference")]
    pub external_reference: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookOutcome {
    Applied,
    /// The same `(provider_payment_id, status)` pair was already applied.
    Duplicate,
    Unchanged,
    /// Not a legal successor of the current status.
    OutOfOrder,
    UnknownPayment,
    UnmappedStatus,
    /// Posted to a provider path this deployment does not serve.
    UnknownProvider,
}

impl WebhookOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            WebhookOutcome::Applied => "applied",
            WebhookOutcome::Duplicate => "duplicate",
            WebhookOutcome::Unchanged => "unchanged",
            WebhookOutcome::OutOfOrder => "out_of_order",
            WebhookOutcome::UnknownPayment => "unknown_payment",
            WebhookOutcome::UnmappedStatus => "unmapped_status",
            WebhookOutcome::UnknownProvider => "unknown_provider",
        }
    }

    /// `ok` vs `ignored` in the response body.
    pub fn is_applied(&self) -> bool {
        matches!(self, WebhookOutcome::Applied)
    }
}

#[derive(Clone)]
pub struct WebhookReconciler {
    db: Database,
    payments: PaymentService,
}

impl WebhookReconciler {
    pub fn new(db: Database, payments: PaymentService) -> Self {
        Self { db, payments }
    }

    /// Handle one webhook delivery from `provider`.
    #[instrument(skip(self, notice), fields(provider_payment_id = %notice.provider_payment_id, status = %notice.status))]
    pub async fn handle(&self, provider: &str, notice: WebhookNotice) -> Result<WebhookOutcome> {
        let gateway = self.payments.gateway();
        if provider != gateway.provider() {
            warn!(provider = provider, "Webhook for a provider we do not serve, ignoring");
            record_webhook(provider, WebhookOutcome::UnknownProvider.as_str());
            return Ok(WebhookOutcome::UnknownProvider);
        }

        let Some(status) = gateway.map_status(&notice.status) else {
            warn!("Webhook carries a status we do not track, ignoring");
            record_webhook(provider, WebhookOutcome::UnmappedStatus.as_str());
            return Ok(WebhookOutcome::UnmappedStatus);
        };

        let payload = json!({ "status": notice.status, "raw": notice.raw });
        let outcome = self
            .reconcile(
                provider,
                &notice.provider_payment_id,
                status,
                &payload,
                notice.external_reference.as_deref(),
                TransitionSource::Webhook,
            )
            .await?;

        record_webhook(provider, outcome.as_str());
        Ok(outcome)
    }

    /// Apply a normalized status report to the attempt it refers to. Shared by
    /// webhooks and the gateway poller.
    pub async fn reconcile(
        &self,
        provider: &str,
        provider_payment_id: &str,
        status: PaymentStatus,
        payload: &serde_json::Value,
        external_reference: Option<&str>,
        source: TransitionSource,
    ) -> Result<WebhookOutcome> {
        let now = Utc::now();
        let mut tx = self.db.begin().await?;

        let Some(resolved) =
            resolve_payment(&mut *tx, provider, provider_payment_id, external_reference).await?
        else {
            warn!(
                provider = provider,
                provider_payment_id = provider_payment_id,
                "Status report for an unknown payment, ignoring"
            );
            return Ok(WebhookOutcome::UnknownPayment);
        };

        let registration = RegistrationStore::lock_by_id(&mut *tx, resolved.registration_id)
            .await?
            .ok_or_else(|| RegistrationError::not_found("Registration"))?;
        let payment = PaymentLedger::lock(&mut *tx, resolved.payment_id)
            .await?
            .ok_or_else(|| RegistrationError::not_found("Payment"))?;

        if payment.provider_payment_id.is_none() {
            PaymentLedger::set_provider_reference(&mut *tx, payment.payment_id, provider_payment_id, None)
                .await?;
        }

        if source == TransitionSource::Webhook
            && receipt_exists(&mut *tx, provider_payment_id, status).await?
        {
            PaymentLedger::record_transaction(
                &mut *tx,
                payment.payment_id,
                TransactionKind::Webhook,
                Some(status),
                Some(payload),
            )
            .await?;
            tx.commit().await?;
            info!(payment_id = %payment.payment_id, "Duplicate webhook ignored");
            return Ok(WebhookOutcome::Duplicate);
        }

        let mut effects = SideEffects::default();
        let outcome = settle_locked(
            &mut *tx,
            &registration,
            &payment,
            status,
            source,
            Some(payload),
            now,
            &mut effects,
        )
        .await?;

        let result = match outcome {
            TransitionOutcome::Applied { .. } => {
                if source == TransitionSource::Webhook {
                    insert_receipt(&mut *tx, provider_payment_id, status, payment.payment_id).await?;
                }
                WebhookOutcome::Applied
            }
            TransitionOutcome::Unchanged => WebhookOutcome::Unchanged,
            TransitionOutcome::Rejected { .. } => WebhookOutcome::OutOfOrder,
        };

        if !outcome.is_applied() {
            let kind = match source {
                TransitionSource::Poll => TransactionKind::GatewayQuery,
                _ => TransactionKind::Webhook,
            };
            PaymentLedger::record_transaction(&mut *tx, payment.payment_id, kind, Some(status), Some(payload))
                .await?;
        }

        tx.commit().await?;
        self.payments.publish(effects);

        info!(
            payment_id = %payment.payment_id,
            order_code = %registration.order_code,
            outcome = result.as_str(),
            source = source.as_str(),
            "Status report reconciled"
        );
        Ok(result)
    }
}

/// Find the attempt a report refers to, falling back to our own payment id
/// when the provider echoes it as external reference.
async fn resolve_payment(
    conn: &mut PgConnection,
    provider: &str,
    provider_payment_id: &str,
    external_reference: Option<&str>,
) -> Result<Option<RegistrationPayment>> {
    if let Some(payment) = PaymentLedger::find_by_provider_id(conn, provider, provider_payment_id).await? {
        return Ok(Some(payment));
    }

    let Some(payment_id) = external_reference.and_then(|r| Uuid::parse_str(r.trim()).ok()) else {
        return Ok(None);
    };

    let payment = PaymentLedger::find(conn, payment_id).await?.filter(|p| {
        p.provider.as_deref() == Some(provider)
            && p.provider_payment_id
                .as_deref()
                .map_or(true, |known| known == provider_payment_id)
    });
    Ok(payment)
}

async fn receipt_exists(
    conn: &mut PgConnection,
    provider_payment_id: &str,
    status: PaymentStatus,
) -> Result<bool> {
    let exists: bool = sqlx::query_scalar(
        "SELECT EXISTS(SELECT 1 FROM webhook_receipts \
         WHERE provider_payment_id = $1 AND reported_status = $2)",
    )
    .bind(provider_payment_id)
    .bind(status.as_str())
    .fetch_one(&mut *conn)
    .await?;
    Ok(exists)
}

async fn insert_receipt(
    conn: &mut PgConnection,
    provider_payment_id: &str,
    status: PaymentStatus,
    payment_id: Uuid,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO webhook_receipts (provider_payment_id, reported_status, payment_id)
        VALUES ($1, $2, $3)
        ON CONFLICT (provider_payment_id, reported_status) DO NOTHING
        "#,
    )
    .bind(provider_payment_id)
    .bind(status.as_str())
    .bind(payment_id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}
