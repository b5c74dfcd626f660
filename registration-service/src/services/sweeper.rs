//! Periodic maintenance: gateway polling, attempt TTL, registration expiry
//! and the commission retry sweep.

use crate::config::SweeperConfig;
use crate::error::Result;
use crate::models::{PaymentStatus, RegistrationStatus};
use crate::services::commission::CommissionService;
use crate::services::database::Database;
use crate::services::inventory::InventoryLedger;
use crate::services::metrics::record_sweep;
use crate::services::payments::{PaymentLedger, PaymentService, SideEffects, TransitionSource};
use crate::services::registrations::RegistrationStore;
use crate::services::webhook::{WebhookOutcome, WebhookReconciler};
use chrono::{DateTime, Utc};
use serde_json::json;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

/// Session advisory lock key shared by every instance.
const SWEEPER_LOCK_KEY: i64 = 0x5245_4753_5745_4550;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub polled: usize,
    pub reinitiated: usize,
    pub expired_attempts: usize,
    pub expired_registrations: usize,
    pub commissions_sent: usize,
    /// Another instance held the lock.
    pub skipped: bool,
}

#[derive(Clone)]
pub struct Sweeper {
    db: Database,
    payments: PaymentService,
    reconciler: WebhookReconciler,
    commission: CommissionService,
    config: SweeperConfig,
}

fn before(now: DateTime<Utc>, age: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(age)
        .ok()
        .and_then(|age| now.checked_sub_signed(age))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

impl Sweeper {
    pub fn new(
        db: Database,
        payments: PaymentService,
        reconciler: WebhookReconciler,
        commission: CommissionService,
        config: SweeperConfig,
    ) -> Self {
        Self {
            db,
            payments,
            reconciler,
            commission,
            config,
        }
    }

    /// One full tick, guarded by a session advisory lock.
    #[instrument(skip(self))]
    pub async fn run_once(&self) -> Result<SweepReport> {
        let mut lock_conn = self.db.pool().acquire().await?;
        let acquired: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock($1)")
            .bind(SWEEPER_LOCK_KEY)
            .fetch_one(&mut *lock_conn)
            .await?;

        if !acquired {
            record_sweep("tick", "skipped", 1);
            return Ok(SweepReport {
                skipped: true,
                ..SweepReport::default()
            });
        }

        let result = self.run_passes().await;

        let unlocked = sqlx::query("SELECT pg_advisory_unlock($1)")
            .bind(SWEEPER_LOCK_KEY)
            .execute(&mut *lock_conn)
            .await;
        if let Err(e) = unlocked {
            // The lock dies with the session; keep this connection out of the pool.
            error!(error = %e, "Failed to release sweeper lock, closing connection");
            let _ = lock_conn.detach();
        }

        match &result {
            Ok(report) => {
                record_sweep("tick", "ok", 1);
                info!(
                    polled = report.polled,
                    reinitiated = report.reinitiated,
                    expired_attempts = report.expired_attempts,
                    expired_registrations = report.expired_registrations,
                    commissions_sent = report.commissions_sent,
                    "Sweep finished"
                );
            }
            Err(e) => {
                record_sweep("tick", "error", 1);
                error!(error = %e, "Sweep failed");
            }
        }
        result
    }

    async fn run_passes(&self) -> Result<SweepReport> {
        let now = Utc::now();
        let mut report = SweepReport::default();

        report.reinitiated = self.reinitiate_stalled(now).await?;
        report.polled = self.poll_gateway(now).await?;
        report.expired_attempts = self.expire_stale_attempts(now).await?;
        report.expired_registrations = self.expire_registrations(now).await?;
        report.commissions_sent = self.commission.retry_sweep(self.config.batch_size).await?;

        Ok(report)
    }

    /// Online attempts whose first gateway call never got through.
    async fn reinitiate_stalled(&self, now: DateTime<Utc>) -> Result<usize> {
        let ids: Vec<Uuid> = sqlx::query_scalar(
            r#"
            SELECT payment_id FROM registration_payments
            WHERE channel = 'online' AND status = 'pending'
              AND provider_payment_id IS NULL AND created_utc < $1
            ORDER BY created_utc
            LIMIT $2
            "#,
        )
        .bind(before(now, self.config.poll_after))
        .bind(self.config.batch_size)
        .fetch_all(self.db.pool())
        .await?;

        let mut count = 0;
        for payment_id in ids {
            match self.payments.initiate(payment_id).await {
                Ok(payment) if payment.provider_payment_id.is_some() => count += 1,
                Ok(_) => {}
                Err(e) => warn!(payment_id = %payment_id, error = %e, "Re-initiation failed"),
            }
        }
        record_sweep("reinitiate", "ok", count as u64);
        Ok(count)
    }

    /// Ask the gateway about open online attempts nobody told us about.
    async fn poll_gateway(&self, now: DateTime<Utc>) -> Result<usize> {
        let provider = self.payments.gateway().provider().to_string();
        let rows: Vec<(Uuid, String)> = sqlx::query_as(
            r#"
            SELECT payment_id, provider_payment_id FROM registration_payments
            WHERE channel = 'online' AND status IN ('pending', 'authorized')
              AND provider = $1 AND provider_payment_id IS NOT NULL
              AND updated_utc < $2
            ORDER BY updated_utc
            LIMIT $3
            "#,
        )
        .bind(&provider)
        .bind(before(now, self.config.poll_after))
        .bind(self.config.batch_size)
        .fetch_all(self.db.pool())
        .await?;

        let mut applied = 0;
        for (payment_id, provider_payment_id) in rows {
            let result = match self.payments.gateway().query(&provider_payment_id).await {
                Ok(result) => result,
                Err(e) => {
                    warn!(payment_id = %payment_id, error = %e, "Gateway poll failed");
                    continue;
                }
            };

            let outcome = self
                .reconciler
                .reconcile(
                    &provider,
                    &provider_payment_id,
                    result.status,
                    &result.raw,
                    None,
                    TransitionSource::Poll,
                )
                .await?;
            if outcome == WebhookOutcome::Applied {
                applied += 1;
            }
        }
        record_sweep("poll", "ok", applied as u64);
        Ok(applied)
    }

    /// Open attempts past the attempt TTL become `expired`.
    async fn expire_stale_attempts(&self, now: DateTime<Utc>) -> Result<usize> {
        let ids: Vec<Uuid> = sqlx::query_scalar(
            r#"
            SELECT payment_id FROM registration_payments
            WHERE status IN ('pending', 'authorized') AND created_utc < $1
            ORDER BY created_utc
            LIMIT $2
            "#,
        )
        .bind(before(now, self.config.attempt_ttl))
        .bind(self.config.batch_size)
        .fetch_all(self.db.pool())
        .await?;

        let mut expired = 0;
        for payment_id in ids {
            let outcome = self
                .payments
                .apply_transition(
                    payment_id,
                    PaymentStatus::Expired,
                    TransitionSource::Sweeper,
                    Some(json!({ "reason": "attempt_ttl" })),
                )
                .await?;
            if outcome.is_applied() {
                expired += 1;
            }
        }
        record_sweep("attempt_ttl", "ok", expired as u64);
        Ok(expired)
    }

    /// Registrations past their deadline lose their inventory.
    async fn expire_registrations(&self, now: DateTime<Utc>) -> Result<usize> {
        let statuses = RegistrationStatus::sweepable();
        let ids: Vec<Uuid> = sqlx::query_scalar(
            r#"
            SELECT registration_id FROM registrations
            WHERE released_utc IS NULL AND cancelled_utc IS NULL
              AND expires_utc < $1 AND payment_status = ANY($2)
            ORDER BY expires_utc
            LIMIT $3
            "#,
        )
        .bind(now)
        .bind(&statuses[..])
        .bind(self.config.batch_size)
        .fetch_all(self.db.pool())
        .await?;

        let mut expired = 0;
        for registration_id in ids {
            match self.expire_one(registration_id, now).await {
                Ok(true) => expired += 1,
                Ok(false) => {}
                Err(e) => {
                    record_sweep("expire_registration", "error", 1);
                    error!(registration_id = %registration_id, error = %e, "Expiring registration failed");
                }
            }
        }
        record_sweep("expire_registration", "ok", expired as u64);
        Ok(expired)
    }

    /// Expire one registration. Re-checks under the row lock; a registration
    /// that was paid or cancelled in the meantime is left alone.
    pub async fn expire_one(&self, registration_id: Uuid, now: DateTime<Utc>) -> Result<bool> {
        let mut tx = self.db.begin().await?;

        let Some(registration) = RegistrationStore::lock_by_id(&mut *tx, registration_id).await? else {
            return Ok(false);
        };

        let still_due = registration.released_utc.is_none()
            && registration.cancelled_utc.is_none()
            && registration.expires_utc < now
            && RegistrationStatus::sweepable().contains(&registration.payment_status.as_str());
        if !still_due {
            tx.commit().await?;
            return Ok(false);
        }

        let released = InventoryLedger::release_registration(&mut *tx, registration_id, now).await?;

        let payments = PaymentLedger::list_for_registration(&mut *tx, registration_id, true).await?;
        for payment in payments.iter().filter(|p| p.status.is_open()) {
            PaymentLedger::transition(
                &mut *tx,
                payment,
                PaymentStatus::Expired,
                TransitionSource::Sweeper,
                Some(&json!({ "reason": "registration_deadline" })),
                now,
            )
            .await?;
        }

        RegistrationStore::mark_released(&mut *tx, registration_id, now).await?;

        let mut effects = SideEffects::default();
        if let Some(change) = RegistrationStore::recompute_status(&mut *tx, registration_id, now).await? {
            effects.status_changes.push(change);
        }

        tx.commit().await?;
        self.payments.publish(effects);

        info!(
            order_code = %registration.order_code,
            released = released,
            "Registration expired and inventory released"
        );
        Ok(true)
    }

    /// Run ticks until `shutdown` fires. Ticks missed while a sweep runs are skipped.
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            if !self.config.enabled {
                info!("Sweeper disabled by configuration");
                return;
            }

            let mut interval = tokio::time::interval(self.config.interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        info!("Sweeper shutting down");
                        break;
                    }
                    _ = interval.tick() => {
                        // Errors are logged and counted inside run_once.
                        let _ = self.run_once().await;
                    }
                }
            }
        })
    }
}
