//! Payment ledger and the single write path for attempt status.
//!
//! Lock order: registration row, then batch rows, then payment rows.

use crate::error::{RegistrationError, Result};
use crate::models::{
    NewPayment, PaymentChannel, PaymentMode, PaymentStatus, Registration, RegistrationPayment,
    TransactionKind,
};
use crate::services::catalog::EventCatalog;
use crate::services::commission::CommissionTrigger;
use crate::services::database::Database;
use crate::services::gateway::{Customer, GatewayClient, GatewayError, InitiateRequest};
use crate::services::metrics::{record_payment_transition, DB_QUERY_DURATION};
use crate::services::notifications::{dispatch, Notifier, StatusChange};
use crate::services::registrations::RegistrationStore;
use crate::utils::order_code;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde_json::json;
use sqlx::PgConnection;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

pub(crate) const PAYMENT_COLUMNS: &str = "payment_id, registration_id, channel, method, amount, \
     status, provider, provider_payment_id, client_payload, confirmed_utc, commission_sent_utc, \
     commission_status, commission_attempts, commission_error, created_utc, updated_utc";

/// Where a status change originates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionSource {
    Gateway,
    Webhook,
    Poll,
    Manual,
    Sweeper,
    Cancellation,
}

impl TransitionSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransitionSource::Gateway => "gateway",
            TransitionSource::Webhook => "webhook",
            TransitionSource::Poll => "poll",
            TransitionSource::Manual => "manual",
            TransitionSource::Sweeper => "sweeper",
            TransitionSource::Cancellation => "cancellation",
        }
    }

    fn transaction_kind(&self) -> TransactionKind {
        match self {
            TransitionSource::Gateway => TransactionKind::GatewayResponse,
            TransitionSource::Webhook => TransactionKind::Webhook,
            TransitionSource::Poll => TransactionKind::GatewayQuery,
            TransitionSource::Manual => TransactionKind::Manual,
            TransitionSource::Sweeper => TransactionKind::Expiration,
            TransitionSource::Cancellation => TransactionKind::Cancellation,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionOutcome {
    Applied {
        from: PaymentStatus,
        to: PaymentStatus,
    },
    /// The attempt already has the reported status.
    Unchanged,
    /// Not a legal successor of the current status; logged and ignored.
    Rejected {
        from: PaymentStatus,
        to: PaymentStatus,
    },
}

impl TransitionOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, TransitionOutcome::Applied { .. })
    }
}

/// Work to do once the transaction that produced it has committed.
#[derive(Debug, Default)]
pub struct SideEffects {
    pub status_changes: Vec<StatusChange>,
    pub confirmed_payments: Vec<Uuid>,
}

impl SideEffects {
    pub fn publish(self, notifier: &Arc<dyn Notifier>, commission: &CommissionTrigger) {
        for change in self.status_changes {
            dispatch(notifier.clone(), change);
        }
        for payment_id in self.confirmed_payments {
            commission.enqueue(payment_id);
        }
    }
}

/// Row-level access to `registration_payments` and `payment_transactions`.
pub struct PaymentLedger;

impl PaymentLedger {
    pub async fn find(conn: &mut PgConnection, payment_id: Uuid) -> Result<Option<RegistrationPayment>> {
        Self::fetch(conn, payment_id, false).await
    }

    pub async fn lock(conn: &mut PgConnection, payment_id: Uuid) -> Result<Option<RegistrationPayment>> {
        Self::fetch(conn, payment_id, true).await
    }

    async fn fetch(
        conn: &mut PgConnection,
        payment_id: Uuid,
        for_update: bool,
    ) -> Result<Option<RegistrationPayment>> {
        let payment = sqlx::query_as::<_, RegistrationPayment>(&format!(
            "SELECT {} FROM registration_payments WHERE payment_id = $1{}",
            PAYMENT_COLUMNS,
            if for_update { " FOR UPDATE" } else { "" }
        ))
        .bind(payment_id)
        .fetch_optional(&mut *conn)
        .await?;
        Ok(payment)
    }

    pub async fn find_by_provider_id(
        conn: &mut PgConnection,
        provider: &str,
        provider_payment_id: &str,
    ) -> Result<Option<RegistrationPayment>> {
        let payment = sqlx::query_as::<_, RegistrationPayment>(&format!(
            "SELECT {} FROM registration_payments WHERE provider = $1 AND provider_payment_id = $2",
            PAYMENT_COLUMNS
        ))
        .bind(provider)
        .bind(provider_payment_id)
        .fetch_optional(&mut *conn)
        .await?;
        Ok(payment)
    }

    /// Attempts of a registration, oldest first.
    pub async fn list_for_registration(
        conn: &mut PgConnection,
        registration_id: Uuid,
        for_update: bool,
    ) -> Result<Vec<RegistrationPayment>> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_payments"])
            .start_timer();

        let payments = sqlx::query_as::<_, RegistrationPayment>(&format!(
            "SELECT {} FROM registration_payments WHERE registration_id = $1 \
             ORDER BY created_utc, payment_id{}",
            PAYMENT_COLUMNS,
            if for_update { " FOR UPDATE" } else { "" }
        ))
        .bind(registration_id)
        .fetch_all(&mut *conn)
        .await?;

        timer.observe_duration();
        Ok(payments)
    }

    #[instrument(skip(conn, payment, now), fields(amount = %payment.amount, method = payment.method.as_str()))]
    pub async fn insert(
        conn: &mut PgConnection,
        registration_id: Uuid,
        payment: &NewPayment,
        provider: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<RegistrationPayment> {
        let created = sqlx::query_as::<_, RegistrationPayment>(&format!(
            r#"
            INSERT INTO registration_payments
                (payment_id, registration_id, channel, method, amount, status, provider, created_utc, updated_utc)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $8)
            RETURNING {}
            "#,
            PAYMENT_COLUMNS
        ))
        .bind(Uuid::new_v4())
        .bind(registration_id)
        .bind(payment.channel.as_str())
        .bind(payment.method.as_str())
        .bind(payment.amount)
        .bind(PaymentStatus::Pending.as_str())
        .bind(provider)
        .bind(now)
        .fetch_one(&mut *conn)
        .await?;

        Self::record_transaction(
            conn,
            created.payment_id,
            TransactionKind::Created,
            Some(PaymentStatus::Pending),
            Some(&json!({ "amount": created.amount, "channel": created.channel, "method": created.method })),
        )
        .await?;

        Ok(created)
    }

    /// Append one audit record. Never updated afterwards.
    pub async fn record_transaction(
        conn: &mut PgConnection,
        payment_id: Uuid,
        kind: TransactionKind,
        reported_status: Option<PaymentStatus>,
        payload: Option<&serde_json::Value>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO payment_transactions (transaction_id, payment_id, kind, reported_status, payload)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(payment_id)
        .bind(kind.as_str())
        .bind(reported_status.map(|s| s.as_str()))
        .bind(payload)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    /// Store the provider's id for an attempt, once.
    pub async fn set_provider_reference(
        conn: &mut PgConnection,
        payment_id: Uuid,
        provider_payment_id: &str,
        client_payload: Option<&serde_json::Value>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE registration_payments
            SET provider_payment_id = $2,
                client_payload = COALESCE($3, client_payload),
                updated_utc = NOW()
            WHERE payment_id = $1 AND provider_payment_id IS NULL
            "#,
        )
        .bind(payment_id)
        .bind(provider_payment_id)
        .bind(client_payload)
        .execute(&mut *conn)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Move a locked attempt to `to` if the state machine allows it.
    #[instrument(skip(conn, payment, payload, now), fields(payment_id = %payment.payment_id, from = %payment.status))]
    pub async fn transition(
        conn: &mut PgConnection,
        payment: &RegistrationPayment,
        to: PaymentStatus,
        source: TransitionSource,
        payload: Option<&serde_json::Value>,
        now: DateTime<Utc>,
    ) -> Result<TransitionOutcome> {
        let from = payment.status;
        if from == to {
            return Ok(TransitionOutcome::Unchanged);
        }
        if !from.can_transition_to(to) {
            warn!(
                error = %RegistrationError::InvalidTransition { from, to },
                source = source.as_str(),
                "Ignoring illegal payment transition"
            );
            return Ok(TransitionOutcome::Rejected { from, to });
        }

        let result = sqlx::query(
            r#"
            UPDATE registration_payments
            SET status = $2,
                confirmed_utc = CASE WHEN $2 = 'confirmed' THEN $3 ELSE confirmed_utc END,
                updated_utc = $3
            WHERE payment_id = $1 AND status = $4
            "#,
        )
        .bind(payment.payment_id)
        .bind(to.as_str())
        .bind(now)
        .bind(from.as_str())
        .execute(&mut *conn)
        .await?;

        if result.rows_affected() == 0 {
            warn!(source = source.as_str(), "Payment changed underneath a transition, ignoring");
            return Ok(TransitionOutcome::Rejected { from, to });
        }

        Self::record_transaction(conn, payment.payment_id, source.transaction_kind(), Some(to), payload)
            .await?;

        record_payment_transition(source.as_str(), to.as_str());
        info!(to = %to, source = source.as_str(), "Payment transition applied");

        Ok(TransitionOutcome::Applied { from, to })
    }

    pub async fn confirmed_total(conn: &mut PgConnection, registration_id: Uuid) -> Result<Decimal> {
        let total: Decimal = sqlx::query_scalar(
            "SELECT COALESCE(SUM(amount), 0) FROM registration_payments \
             WHERE registration_id = $1 AND status = 'confirmed'",
        )
        .bind(registration_id)
        .fetch_one(&mut *conn)
        .await?;
        Ok(total)
    }
}

/// Apply a transition to a payment whose registration and payment rows are
/// already locked, then recompute the registration status.
#[allow(clippy::too_many_arguments)]
pub async fn settle_locked(
    conn: &mut PgConnection,
    registration: &Registration,
    payment: &RegistrationPayment,
    to: PaymentStatus,
    source: TransitionSource,
    payload: Option<&serde_json::Value>,
    now: DateTime<Utc>,
    effects: &mut SideEffects,
) -> Result<TransitionOutcome> {
    if to == PaymentStatus::Confirmed && payment.status != PaymentStatus::Confirmed {
        let confirmed = PaymentLedger::confirmed_total(conn, registration.registration_id).await?;
        if confirmed + payment.amount > registration.final_price {
            error!(
                payment_id = %payment.payment_id,
                order_code = %registration.order_code,
                confirmed = %confirmed,
                amount = %payment.amount,
                final_price = %registration.final_price,
                "Confirmation would exceed the final price, needs manual review"
            );
            PaymentLedger::record_transaction(
                conn,
                payment.payment_id,
                source.transaction_kind(),
                Some(to),
                payload,
            )
            .await?;
            return Ok(TransitionOutcome::Rejected {
                from: payment.status,
                to,
            });
        }
    }

    let outcome = PaymentLedger::transition(conn, payment, to, source, payload, now).await?;

    if outcome.is_applied() {
        if let Some(change) =
            RegistrationStore::recompute_status(conn, registration.registration_id, now).await?
        {
            effects.status_changes.push(change);
        }
        if to == PaymentStatus::Confirmed {
            effects.confirmed_payments.push(payment.payment_id);
        }
    }

    Ok(outcome)
}

/// Orchestrates payment attempts: creation, gateway initiation and
/// settlement from every source.
#[derive(Clone)]
pub struct PaymentService {
    db: Database,
    gateway: GatewayClient,
    notifier: Arc<dyn Notifier>,
    commission: CommissionTrigger,
}

impl PaymentService {
    pub fn new(
        db: Database,
        gateway: GatewayClient,
        notifier: Arc<dyn Notifier>,
        commission: CommissionTrigger,
    ) -> Self {
        Self {
            db,
            gateway,
            notifier,
            commission,
        }
    }

    pub fn gateway(&self) -> &GatewayClient {
        &self.gateway
    }

    pub fn publish(&self, effects: SideEffects) {
        effects.publish(&self.notifier, &self.commission);
    }

    pub async fn get(&self, payment_id: Uuid) -> Result<RegistrationPayment> {
        let mut conn = self.db.pool().acquire().await?;
        PaymentLedger::find(&mut conn, payment_id)
            .await?
            .ok_or_else(|| RegistrationError::not_found("Payment"))
    }

    /// Apply a status report to one attempt.
    #[instrument(skip(self, payload))]
    pub async fn apply_transition(
        &self,
        payment_id: Uuid,
        to: PaymentStatus,
        source: TransitionSource,
        payload: Option<serde_json::Value>,
    ) -> Result<TransitionOutcome> {
        let mut tx = self.db.begin().await?;

        let registration_id = PaymentLedger::find(&mut *tx, payment_id)
            .await?
            .ok_or_else(|| RegistrationError::not_found("Payment"))?
            .registration_id;
        let registration = RegistrationStore::lock_by_id(&mut *tx, registration_id)
            .await?
            .ok_or_else(|| RegistrationError::not_found("Registration"))?;
        let payment = PaymentLedger::lock(&mut *tx, payment_id)
            .await?
            .ok_or_else(|| RegistrationError::not_found("Payment"))?;

        let mut effects = SideEffects::default();
        let outcome = settle_locked(
            &mut *tx,
            &registration,
            &payment,
            to,
            source,
            payload.as_ref(),
            Utc::now(),
            &mut effects,
        )
        .await?;

        tx.commit().await?;
        self.publish(effects);
        Ok(outcome)
    }

    /// Record a new attempt against a registration and, for online attempts,
    /// initiate it at the gateway after commit.
    #[instrument(skip(self, payment), fields(amount = %payment.amount))]
    pub async fn add_payment(
        &self,
        order_code: &str,
        payment: NewPayment,
    ) -> Result<RegistrationPayment> {
        if payment.amount <= Decimal::ZERO {
            return Err(RegistrationError::validation("Payment amount must be positive"));
        }
        if payment.amount.scale() > 2 {
            return Err(RegistrationError::validation(
                "Payment amount has more than two decimal places",
            ));
        }
        if !payment.method.supports(payment.channel) {
            return Err(RegistrationError::validation(format!(
                "Method {} is not available for {} payments",
                payment.method.as_str(),
                payment.channel.as_str()
            )));
        }

        let now = Utc::now();
        let mut tx = self.db.begin().await?;

        let registration = RegistrationStore::lock_by_order_code(&mut *tx, &order_code::normalize(order_code))
            .await?
            .ok_or_else(|| RegistrationError::not_found("Registration"))?;

        if !registration.accepts_payments(now) {
            return Err(RegistrationError::conflict(format!(
                "Registration {} does not accept payments while {}",
                registration.order_code, registration.payment_status
            )));
        }
        if registration.final_price <= Decimal::ZERO {
            return Err(RegistrationError::conflict("Registration has nothing to pay"));
        }

        let config = EventCatalog::get_event_payment_config(&mut *tx, registration.event_id)
            .await?
            .ok_or_else(|| RegistrationError::not_found("Event"))?;
        let existing = PaymentLedger::list_for_registration(&mut *tx, registration.registration_id, true).await?;

        check_new_payment(&registration, config.min_deposit_amount, config.max_payment_count, &existing, payment.amount)?;

        let provider = match payment.channel {
            PaymentChannel::Online => Some(self.gateway.provider().to_string()),
            PaymentChannel::Offline => None,
        };
        let created = PaymentLedger::insert(
            &mut *tx,
            registration.registration_id,
            &payment,
            provider.as_deref(),
            now,
        )
        .await?;

        let mut effects = SideEffects::default();
        if let Some(change) =
            RegistrationStore::recompute_status(&mut *tx, registration.registration_id, now).await?
        {
            effects.status_changes.push(change);
        }

        tx.commit().await?;
        self.publish(effects);

        info!(
            order_code = %registration.order_code,
            payment_id = %created.payment_id,
            channel = created.channel.as_str(),
            "Payment attempt recorded"
        );

        match created.channel {
            PaymentChannel::Online => self.initiate(created.payment_id).await,
            PaymentChannel::Offline => Ok(created),
        }
    }

    /// Send a pending online attempt to the gateway. Gateway failures never
    /// surface as errors: the attempt is left `pending` (transient) or moved
    /// to `denied` (business refusal).
    #[instrument(skip(self))]
    pub async fn initiate(&self, payment_id: Uuid) -> Result<RegistrationPayment> {
        let request = {
            let mut conn = self.db.pool().acquire().await?;
            let payment = PaymentLedger::find(&mut conn, payment_id)
                .await?
                .ok_or_else(|| RegistrationError::not_found("Payment"))?;

            if payment.channel != PaymentChannel::Online
                || payment.status != PaymentStatus::Pending
                || payment.provider_payment_id.is_some()
            {
                return Ok(payment);
            }

            let registration = RegistrationStore::find_by_id(&mut conn, payment.registration_id)
                .await?
                .ok_or_else(|| RegistrationError::not_found("Registration"))?;
            let config = EventCatalog::get_event_payment_config(&mut conn, registration.event_id)
                .await?
                .ok_or_else(|| RegistrationError::not_found("Event"))?;

            let buyer = &registration.buyer_data.0;
            let request = InitiateRequest {
                payment_id,
                amount: payment.amount,
                currency: config.currency.clone(),
                method: payment.method,
                customer: Customer {
                    name: buyer.name.clone(),
                    email: buyer.email.clone(),
                    document: buyer.document.clone(),
                },
                description: format!("Registration {}", registration.order_code),
            };

            PaymentLedger::record_transaction(
                &mut conn,
                payment_id,
                TransactionKind::GatewayRequest,
                None,
                Some(&json!({
                    "provider": self.gateway.provider(),
                    "amount": request.amount,
                    "currency": request.currency,
                    "method": request.method,
                })),
            )
            .await?;

            request
        };

        let result = self.gateway.initiate(&request).await;

        match result {
            Ok(initiated) => {
                let mut tx = self.db.begin().await?;
                let mut effects = SideEffects::default();

                let registration_id = PaymentLedger::find(&mut *tx, payment_id)
                    .await?
                    .ok_or_else(|| RegistrationError::not_found("Payment"))?
                    .registration_id;
                let registration = RegistrationStore::lock_by_id(&mut *tx, registration_id)
                    .await?
                    .ok_or_else(|| RegistrationError::not_found("Registration"))?;
                let payment = PaymentLedger::lock(&mut *tx, payment_id)
                    .await?
                    .ok_or_else(|| RegistrationError::not_found("Payment"))?;

                PaymentLedger::set_provider_reference(
                    &mut *tx,
                    payment_id,
                    &initiated.provider_payment_id,
                    initiated.client_payload.as_ref(),
                )
                .await?;

                let outcome = settle_locked(
                    &mut *tx,
                    &registration,
                    &payment,
                    initiated.status,
                    TransitionSource::Gateway,
                    Some(&initiated.raw),
                    Utc::now(),
                    &mut effects,
                )
                .await?;
                if !outcome.is_applied() {
                    PaymentLedger::record_transaction(
                        &mut *tx,
                        payment_id,
                        TransactionKind::GatewayResponse,
                        Some(initiated.status),
                        Some(&initiated.raw),
                    )
                    .await?;
                }

                tx.commit().await?;
                self.publish(effects);
            }
            Err(GatewayError::Denied { reason, raw }) => {
                info!(payment_id = %payment_id, reason = %reason, "Gateway denied payment");
                self.apply_transition(
                    payment_id,
                    PaymentStatus::Denied,
                    TransitionSource::Gateway,
                    Some(json!({ "reason": reason, "raw": raw })),
                )
                .await?;
            }
            Err(e) => {
                warn!(
                    payment_id = %payment_id,
                    error = %e,
                    kind = e.kind(),
                    "Gateway initiation failed, attempt left pending"
                );
                let mut conn = self.db.pool().acquire().await?;
                PaymentLedger::record_transaction(
                    &mut conn,
                    payment_id,
                    TransactionKind::GatewayError,
                    None,
                    Some(&json!({ "kind": e.kind(), "error": e.to_string() })),
                )
                .await?;
            }
        }

        self.get(payment_id).await
    }

    /// Administrator confirms receipt of an offline payment.
    pub async fn confirm_offline(&self, payment_id: Uuid) -> Result<RegistrationPayment> {
        self.settle_offline(payment_id, PaymentStatus::Confirmed).await
    }

    /// Administrator rejects an offline payment.
    pub async fn deny_offline(&self, payment_id: Uuid) -> Result<RegistrationPayment> {
        self.settle_offline(payment_id, PaymentStatus::Denied).await
    }

    #[instrument(skip(self))]
    async fn settle_offline(&self, payment_id: Uuid, to: PaymentStatus) -> Result<RegistrationPayment> {
        let payment = self.get(payment_id).await?;
        if payment.channel != PaymentChannel::Offline {
            return Err(RegistrationError::conflict(
                "Only offline payments can be settled manually",
            ));
        }

        let outcome = self
            .apply_transition(
                payment_id,
                to,
                TransitionSource::Manual,
                Some(json!({ "action": format!("offline_{}", to.as_str()) })),
            )
            .await?;

        if let TransitionOutcome::Rejected { from, .. } = outcome {
            return Err(RegistrationError::conflict(format!(
                "Payment is {} and cannot become {}",
                from, to
            )));
        }

        self.get(payment_id).await
    }
}

/// Business rules for a new attempt against a locked registration.
pub fn check_new_payment(
    registration: &Registration,
    min_deposit: Option<Decimal>,
    max_payment_count: Option<i32>,
    existing: &[RegistrationPayment],
    amount: Decimal,
) -> Result<()> {
    let confirmed: Decimal = existing
        .iter()
        .filter(|p| p.status == PaymentStatus::Confirmed)
        .map(|p| p.amount)
        .sum();
    let open: Decimal = existing
        .iter()
        .filter(|p| p.status.is_open())
        .map(|p| p.amount)
        .sum();

    match registration.payment_mode {
        PaymentMode::Single => {
            if !existing.is_empty() {
                return Err(RegistrationError::conflict(
                    "Single-payment registration already has its payment",
                ));
            }
            if amount != registration.final_price {
                return Err(RegistrationError::validation(format!(
                    "Single payment must cover the full price of {}",
                    registration.final_price
                )));
            }
        }
        PaymentMode::BalanceDue => {
            let remaining = registration.final_price - confirmed - open;
            if amount > remaining {
                return Err(RegistrationError::validation(format!(
                    "Amount {} exceeds the outstanding balance of {}",
                    amount,
                    remaining.max(Decimal::ZERO)
                )));
            }
            if confirmed.is_zero() {
                if let Some(min) = min_deposit {
                    let required = min.min(remaining);
                    if amount < required {
                        return Err(RegistrationError::validation(format!(
                            "First payment must be at least {}",
                            required
                        )));
                    }
                }
            }
            if let Some(max) = max_payment_count {
                // Every attempt counts, including denied and expired ones.
                if existing.len() as i64 + 1 > i64::from(max) {
                    return Err(RegistrationError::conflict(format!(
                        "Registration already has the maximum of {} payments",
                        max
                    )));
                }
            }
        }
    }

    Ok(())
}
