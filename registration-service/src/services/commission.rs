//! Commission payout trigger.
//!
//! A confirmed payment earns the event's commission exactly once. The claim
//! is a conditional update on the payment row; whoever flips
//! `commission_sent_utc` from NULL performs the transfer.

use crate::error::Result;
use crate::models::{CommissionStatus, TransactionKind};
use crate::services::database::Database;
use crate::services::gateway::{CommissionPayer, CommissionTransfer};
use crate::services::metrics::{record_commission, DB_QUERY_DURATION};
use crate::services::payments::PaymentLedger;
use crate::services::pricing::commission_amount;
use chrono::{Duration, Utc};
use rust_decimal::Decimal;
use serde_json::json;
use sqlx::FromRow;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Claims older than this without an outcome are reported for manual review.
const STALE_CLAIM_MINUTES: i64 = 15;

/// Sending half of the in-process commission queue.
#[derive(Clone)]
pub struct CommissionTrigger {
    sender: mpsc::Sender<Uuid>,
}

impl CommissionTrigger {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Uuid>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self { sender }, receiver)
    }

    /// Queue a confirmed payment. A dropped trigger is picked up by the retry
    /// sweep.
    pub fn enqueue(&self, payment_id: Uuid) {
        if let Err(e) = self.sender.try_send(payment_id) {
            warn!(
                payment_id = %payment_id,
                error = %e,
                "Commission trigger dropped, retry sweep will pick it up"
            );
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommissionOutcome {
    Sent,
    Failed,
    /// No commission configured, or another trigger owns the claim.
    Skipped,
}

#[derive(Debug, FromRow)]
struct CommissionCandidate {
    payment_id: Uuid,
    amount: Decimal,
    currency: String,
    commission_percentage: Option<Decimal>,
    commission_pix_key: Option<String>,
}

#[derive(Clone)]
pub struct CommissionService {
    db: Database,
    payer: Arc<dyn CommissionPayer>,
    max_attempts: i32,
}

impl CommissionService {
    pub fn new(db: Database, payer: Arc<dyn CommissionPayer>, max_attempts: i32) -> Self {
        Self {
            db,
            payer,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Pay the commission for one confirmed payment if nobody else has.
    #[instrument(skip(self))]
    pub async fn process(&self, payment_id: Uuid) -> Result<CommissionOutcome> {
        let mut conn = self.db.pool().acquire().await?;

        let candidate = sqlx::query_as::<_, CommissionCandidate>(
            r#"
            SELECT p.payment_id, p.amount, e.currency, e.commission_percentage, e.commission_pix_key
            FROM registration_payments p
            JOIN registrations r ON r.registration_id = p.registration_id
            JOIN events e ON e.event_id = r.event_id
            WHERE p.payment_id = $1
            "#,
        )
        .bind(payment_id)
        .fetch_optional(&mut *conn)
        .await?;

        let Some(candidate) = candidate else {
            warn!("Commission trigger for an unknown payment");
            return Ok(CommissionOutcome::Skipped);
        };

        let (Some(percentage), Some(pix_key)) = (
            candidate.commission_percentage,
            candidate.commission_pix_key.filter(|k| !k.is_empty()),
        ) else {
            debug!("Event has no commission configured");
            return Ok(CommissionOutcome::Skipped);
        };

        let amount = commission_amount(candidate.amount, percentage);
        if amount <= Decimal::ZERO {
            return Ok(CommissionOutcome::Skipped);
        }

        let claimed = sqlx::query(
            r#"
            UPDATE registration_payments
            SET commission_sent_utc = NOW(), commission_status = $2, updated_utc = NOW()
            WHERE payment_id = $1
              AND status = 'confirmed'
              AND commission_sent_utc IS NULL
              AND (commission_status IS NULL OR (commission_status = $3 AND commission_attempts < $4))
            "#,
        )
        .bind(payment_id)
        .bind(CommissionStatus::InFlight.as_str())
        .bind(CommissionStatus::Failed.as_str())
        .bind(self.max_attempts)
        .execute(&mut *conn)
        .await?;

        if claimed.rows_affected() == 0 {
            debug!("Commission already claimed or not eligible");
            return Ok(CommissionOutcome::Skipped);
        }

        let transfer = CommissionTransfer {
            payment_id: candidate.payment_id,
            amount,
            currency: candidate.currency,
            pix_key,
        };

        match self.payer.transfer(&transfer).await {
            Ok(transfer_id) => {
                sqlx::query(
                    r#"
                    UPDATE registration_payments
                    SET commission_status = $2, commission_error = NULL,
                        commission_attempts = commission_attempts + 1, updated_utc = NOW()
                    WHERE payment_id = $1
                    "#,
                )
                .bind(payment_id)
                .bind(CommissionStatus::Sent.as_str())
                .execute(&mut *conn)
                .await?;

                PaymentLedger::record_transaction(
                    &mut conn,
                    payment_id,
                    TransactionKind::CommissionTransfer,
                    None,
                    Some(&json!({ "transfer_id": transfer_id, "amount": amount, "currency": transfer.currency })),
                )
                .await?;

                record_commission("sent");
                info!(transfer_id = %transfer_id, amount = %amount, "Commission transferred");
                Ok(CommissionOutcome::Sent)
            }
            Err(e) => {
                let attempts: i32 = sqlx::query_scalar(
                    r#"
                    UPDATE registration_payments
                    SET commission_status = $2, commission_error = $3,
                        commission_attempts = commission_attempts + 1,
                        commission_sent_utc = NULL, updated_utc = NOW()
                    WHERE payment_id = $1
                    RETURNING commission_attempts
                    "#,
                )
                .bind(payment_id)
                .bind(CommissionStatus::Failed.as_str())
                .bind(e.to_string())
                .fetch_one(&mut *conn)
                .await?;

                PaymentLedger::record_transaction(
                    &mut conn,
                    payment_id,
                    TransactionKind::CommissionFailure,
                    None,
                    Some(&json!({ "kind": e.kind(), "error": e.to_string(), "attempts": attempts })),
                )
                .await?;

                record_commission("failed");
                if attempts >= self.max_attempts {
                    error!(
                        attempts = attempts,
                        error = %e,
                        "Commission transfer failed for the last time, needs manual payout"
                    );
                } else {
                    warn!(attempts = attempts, error = %e, "Commission transfer failed, will retry");
                }
                Ok(CommissionOutcome::Failed)
            }
        }
    }

    /// Retry unclaimed and failed commissions. Returns how many were sent.
    #[instrument(skip(self))]
    pub async fn retry_sweep(&self, limit: i64) -> Result<usize> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["commission_candidates"])
            .start_timer();

        let candidates: Vec<Uuid> = sqlx::query_scalar(
            r#"
            SELECT p.payment_id
            FROM registration_payments p
            JOIN registrations r ON r.registration_id = p.registration_id
            JOIN events e ON e.event_id = r.event_id
            WHERE p.status = 'confirmed'
              AND p.commission_sent_utc IS NULL
              AND e.commission_percentage IS NOT NULL
              AND e.commission_pix_key IS NOT NULL
              AND (p.commission_status IS NULL
                   OR (p.commission_status = $1 AND p.commission_attempts < $2))
            ORDER BY p.confirmed_utc
            LIMIT $3
            "#,
        )
        .bind(CommissionStatus::Failed.as_str())
        .bind(self.max_attempts)
        .bind(limit)
        .fetch_all(self.db.pool())
        .await?;
        timer.observe_duration();

        let mut sent = 0;
        for payment_id in candidates {
            match self.process(payment_id).await {
                Ok(CommissionOutcome::Sent) => sent += 1,
                Ok(_) => {}
                Err(e) => error!(payment_id = %payment_id, error = %e, "Commission retry failed"),
            }
        }

        self.report_stale_claims().await?;
        Ok(sent)
    }

    /// In-flight claims are never retried automatically; surface them.
    async fn report_stale_claims(&self) -> Result<()> {
        let cutoff = Utc::now() - Duration::minutes(STALE_CLAIM_MINUTES);
        let stale: Vec<Uuid> = sqlx::query_scalar(
            "SELECT payment_id FROM registration_payments \
             WHERE commission_status = $1 AND commission_sent_utc < $2",
        )
        .bind(CommissionStatus::InFlight.as_str())
        .bind(cutoff)
        .fetch_all(self.db.pool())
        .await?;

        for payment_id in stale {
            error!(
                payment_id = %payment_id,
                "Commission claim stuck in flight, verify the transfer manually"
            );
        }
        Ok(())
    }
}

/// Drain the commission queue until cancelled or every sender is gone.
pub fn spawn_worker(
    service: CommissionService,
    mut receiver: mpsc::Receiver<Uuid>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Commission worker shutting down");
                    break;
                }
                next = receiver.recv() => match next {
                    Some(payment_id) => {
                        if let Err(e) = service.process(payment_id).await {
                            error!(payment_id = %payment_id, error = %e, "Commission processing failed");
                        }
                    }
                    None => {
                        info!("Commission queue closed, worker exiting");
                        break;
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_enqueue_never_blocks_when_queue_is_full() {
        let (trigger, mut receiver) = CommissionTrigger::channel(1);
        let first = Uuid::new_v4();

        trigger.enqueue(first);
        trigger.enqueue(Uuid::new_v4());

        assert_eq!(receiver.recv().await, Some(first));
        assert!(receiver.try_recv().is_err());
    }
}
