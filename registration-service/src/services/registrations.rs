//! Registration aggregate: creation, lookup, cancellation and status
//! recomputation.

use crate::error::{RegistrationError, Result};
use crate::models::{
    derive_status, Attendee, BuyerData, NewAttendee, NewPayment, PaymentChannel, PaymentMethod,
    PaymentMode, PaymentStatus, Registration, RegistrationPayment, RegistrationStatus, StatusInput,
};
use crate::services::catalog::EventCatalog;
use crate::services::database::{is_unique_violation, Database};
use crate::services::inventory::InventoryLedger;
use crate::services::metrics::{record_registration, DB_QUERY_DURATION};
use crate::services::notifications::StatusChange;
use crate::services::payments::{PaymentLedger, PaymentService, SideEffects, TransitionSource};
use crate::services::pricing::{self, PriceBreakdown, PriceLine};
use crate::utils::order_code;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use sqlx::types::Json;
use sqlx::PgConnection;
use std::collections::BTreeMap;
use tracing::{info, instrument, warn};
use uuid::Uuid;

pub(crate) const REGISTRATION_COLUMNS: &str = "registration_id, order_code, event_id, quantity, \
     buyer_data, coupon_id, original_price, discount_amount, final_price, payment_status, \
     payment_mode, expires_utc, cancelled_utc, released_utc, created_utc, updated_utc";

const ORDER_CODE_ATTEMPTS: usize = 5;

#[derive(Debug, Clone, Copy)]
enum Key<'a> {
    Id(Uuid),
    OrderCode(&'a str),
}

/// Row-level access to `registrations` and `attendees`.
pub struct RegistrationStore;

impl RegistrationStore {
    pub async fn find_by_id(conn: &mut PgConnection, registration_id: Uuid) -> Result<Option<Registration>> {
        Self::fetch(conn, Key::Id(registration_id), false).await
    }

    pub async fn lock_by_id(conn: &mut PgConnection, registration_id: Uuid) -> Result<Option<Registration>> {
        Self::fetch(conn, Key::Id(registration_id), true).await
    }

    pub async fn find_by_order_code(conn: &mut PgConnection, code: &str) -> Result<Option<Registration>> {
        Self::fetch(conn, Key::OrderCode(code), false).await
    }

    pub async fn lock_by_order_code(conn: &mut PgConnection, code: &str) -> Result<Option<Registration>> {
        Self::fetch(conn, Key::OrderCode(code), true).await
    }

    async fn fetch(conn: &mut PgConnection, key: Key<'_>, for_update: bool) -> Result<Option<Registration>> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_registration"])
            .start_timer();

        let sql = format!(
            "SELECT {} FROM registrations WHERE {} = $1{}",
            REGISTRATION_COLUMNS,
            match key {
                Key::Id(_) => "registration_id",
                Key::OrderCode(_) => "order_code",
            },
            if for_update { " FOR UPDATE" } else { "" }
        );
        let query = sqlx::query_as::<_, Registration>(&sql);
        let query = match key {
            Key::Id(id) => query.bind(id),
            Key::OrderCode(code) => query.bind(code),
        };
        let registration = query.fetch_optional(&mut *conn).await?;

        timer.observe_duration();
        Ok(registration)
    }

    pub async fn order_code_exists(conn: &mut PgConnection, code: &str) -> Result<bool> {
        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM registrations WHERE order_code = $1)")
                .bind(code)
                .fetch_one(&mut *conn)
                .await?;
        Ok(exists)
    }

    #[instrument(skip(conn, registration), fields(order_code = %registration.order_code))]
    pub async fn insert(conn: &mut PgConnection, registration: &Registration) -> Result<Registration> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["insert_registration"])
            .start_timer();

        let created = sqlx::query_as::<_, Registration>(&format!(
            r#"
            INSERT INTO registrations
                (registration_id, order_code, event_id, quantity, buyer_data, coupon_id,
                 original_price, discount_amount, final_price, payment_status, payment_mode,
                 expires_utc, created_utc, updated_utc)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $13)
            RETURNING {}
            "#,
            REGISTRATION_COLUMNS
        ))
        .bind(registration.registration_id)
        .bind(&registration.order_code)
        .bind(registration.event_id)
        .bind(registration.quantity)
        .bind(&registration.buyer_data)
        .bind(registration.coupon_id)
        .bind(registration.original_price)
        .bind(registration.discount_amount)
        .bind(registration.final_price)
        .bind(registration.payment_status.as_str())
        .bind(registration.payment_mode.as_str())
        .bind(registration.expires_utc)
        .bind(registration.created_utc)
        .fetch_one(&mut *conn)
        .await?;

        timer.observe_duration();
        Ok(created)
    }

    pub async fn insert_attendees(
        conn: &mut PgConnection,
        registration_id: Uuid,
        attendees: &[NewAttendee],
    ) -> Result<()> {
        for attendee in attendees {
            sqlx::query(
                r#"
                INSERT INTO attendees (attendee_id, registration_id, batch_id, name, email, details)
                VALUES ($1, $2, $3, $4, $5, $6)
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(registration_id)
            .bind(attendee.batch_id)
            .bind(&attendee.name)
            .bind(&attendee.email)
            .bind(&attendee.details)
            .execute(&mut *conn)
            .await?;
        }
        Ok(())
    }

    pub async fn attendees(conn: &mut PgConnection, registration_id: Uuid) -> Result<Vec<Attendee>> {
        let attendees = sqlx::query_as::<_, Attendee>(
            r#"
            SELECT attendee_id, registration_id, batch_id, name, email, details
            FROM attendees
            WHERE registration_id = $1
            ORDER BY batch_id, name
            "#,
        )
        .bind(registration_id)
        .fetch_all(&mut *conn)
        .await?;
        Ok(attendees)
    }

    /// Set the cancel and release marks together.
    pub async fn mark_cancelled(conn: &mut PgConnection, registration_id: Uuid, now: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE registrations
            SET cancelled_utc = $2, released_utc = COALESCE(released_utc, $2), updated_utc = $2
            WHERE registration_id = $1
            "#,
        )
        .bind(registration_id)
        .bind(now)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    pub async fn mark_released(conn: &mut PgConnection, registration_id: Uuid, now: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            "UPDATE registrations SET released_utc = $2, updated_utc = $2 \
             WHERE registration_id = $1 AND released_utc IS NULL",
        )
        .bind(registration_id)
        .bind(now)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    /// Re-derive the status of a locked registration from its ledger and
    /// persist it when it changed.
    #[instrument(skip(conn, now))]
    pub async fn recompute_status(
        conn: &mut PgConnection,
        registration_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<StatusChange>> {
        let registration = Self::find_by_id(conn, registration_id)
            .await?
            .ok_or_else(|| RegistrationError::not_found("Registration"))?;
        let payments = PaymentLedger::list_for_registration(conn, registration_id, false).await?;

        let status = derive_status_for(&registration, &payments, now);
        if status == registration.payment_status {
            return Ok(None);
        }

        sqlx::query(
            "UPDATE registrations SET payment_status = $2, updated_utc = $3 WHERE registration_id = $1",
        )
        .bind(registration_id)
        .bind(status.as_str())
        .bind(now)
        .execute(&mut *conn)
        .await?;

        info!(
            order_code = %registration.order_code,
            from = %registration.payment_status,
            to = %status,
            "Registration status changed"
        );

        Ok(Some(StatusChange {
            registration_id,
            order_code: registration.order_code,
            event_id: registration.event_id,
            previous_status: registration.payment_status,
            status,
        }))
    }
}

/// Apply [`derive_status`] to a registration row and its attempts.
pub fn derive_status_for(
    registration: &Registration,
    payments: &[RegistrationPayment],
    now: DateTime<Utc>,
) -> RegistrationStatus {
    let ledger: Vec<(PaymentStatus, Decimal)> =
        payments.iter().map(|p| (p.status, p.amount)).collect();

    derive_status(&StatusInput {
        mode: registration.payment_mode,
        final_price: registration.final_price,
        payments: &ledger,
        deadline_passed: now > registration.expires_utc,
        cancelled: registration.cancelled_utc.is_some(),
        released: registration.released_utc.is_some(),
    })
}

/// Attendee count per batch, in ascending batch id order.
pub fn group_by_batch(attendees: &[NewAttendee]) -> BTreeMap<Uuid, i32> {
    let mut per_batch = BTreeMap::new();
    for attendee in attendees {
        *per_batch.entry(attendee.batch_id).or_insert(0) += 1;
    }
    per_batch
}

/// Channel and method chosen for the first payment of a single-payment event.
#[derive(Debug, Clone, Copy)]
pub struct PaymentChoice {
    pub channel: PaymentChannel,
    pub method: PaymentMethod,
}

#[derive(Debug, Clone)]
pub struct CreateRegistration {
    pub buyer: BuyerData,
    pub attendees: Vec<NewAttendee>,
    pub coupon_code: Option<String>,
    pub payment: Option<PaymentChoice>,
}

#[derive(Debug, Clone, Serialize)]
pub struct QuoteLine {
    pub batch_id: Uuid,
    pub name: String,
    pub unit_price: Decimal,
    pub quantity: i32,
}

#[derive(Debug, Clone, Serialize)]
pub struct Quote {
    pub event_id: Uuid,
    pub currency: String,
    pub payment_mode: PaymentMode,
    pub lines: Vec<QuoteLine>,
    #[serde(flatten)]
    pub price: PriceBreakdown,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub coupon_code: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RegistrationDetails {
    #[serde(flatten)]
    pub registration: Registration,
    pub attendees: Vec<Attendee>,
    pub payments: Vec<RegistrationPayment>,
}

#[derive(Clone)]
pub struct RegistrationService {
    db: Database,
    payments: PaymentService,
}

impl RegistrationService {
    pub fn new(db: Database, payments: PaymentService) -> Self {
        Self { db, payments }
    }

    /// Price an order without reserving anything or redeeming the coupon.
    #[instrument(skip(self, per_batch))]
    pub async fn quote(
        &self,
        event_id: Uuid,
        per_batch: &BTreeMap<Uuid, i32>,
        coupon_code: Option<&str>,
    ) -> Result<Quote> {
        if per_batch.is_empty() || per_batch.values().any(|&n| n <= 0) {
            return Err(RegistrationError::validation("At least one attendee is required"));
        }

        let now = Utc::now();
        let mut conn = self.db.pool().acquire().await?;

        let config = EventCatalog::get_event_payment_config(&mut conn, event_id)
            .await?
            .ok_or_else(|| RegistrationError::not_found("Event"))?;

        let batch_ids: Vec<Uuid> = per_batch.keys().copied().collect();
        let batches = EventCatalog::get_batches(&mut conn, &batch_ids).await?;

        let mut lines = Vec::with_capacity(per_batch.len());
        for (&batch_id, &quantity) in per_batch {
            let batch = batches
                .iter()
                .find(|b| b.batch_id == batch_id && b.event_id == event_id)
                .ok_or_else(|| RegistrationError::validation(format!("Unknown batch {}", batch_id)))?;
            if !batch.is_on_sale(now) {
                return Err(RegistrationError::validation(format!(
                    "Batch '{}' is not on sale",
                    batch.name
                )));
            }
            lines.push(QuoteLine {
                batch_id,
                name: batch.name.clone(),
                unit_price: batch.price,
                quantity,
            });
        }

        let quantity: i32 = per_batch.values().sum();
        let coupon = match coupon_code {
            Some(code) => {
                let coupon = EventCatalog::get_coupon(&mut conn, event_id, code, false)
                    .await?
                    .ok_or_else(|| RegistrationError::validation(format!("Unknown coupon '{}'", code)))?;
                pricing::check_coupon(&coupon, event_id, quantity, now)?;
                Some(coupon)
            }
            None => None,
        };

        let price_lines: Vec<PriceLine> = lines
            .iter()
            .map(|l| PriceLine {
                unit_price: l.unit_price,
                quantity: l.quantity,
            })
            .collect();

        Ok(Quote {
            event_id,
            currency: config.currency,
            payment_mode: config.payment_mode,
            lines,
            price: pricing::price(&price_lines, coupon.as_ref()),
            coupon_code: coupon.map(|c| c.code),
        })
    }

    /// Reserve inventory, price, redeem the coupon and persist the
    /// registration in one transaction.
    #[instrument(skip(self, request), fields(attendees = request.attendees.len()))]
    pub async fn create(&self, event_id: Uuid, request: CreateRegistration) -> Result<RegistrationDetails> {
        if request.attendees.is_empty() {
            return Err(RegistrationError::validation("At least one attendee is required"));
        }
        if let Some(choice) = request.payment {
            if !choice.method.supports(choice.channel) {
                return Err(RegistrationError::validation(format!(
                    "Method {} is not available for {} payments",
                    choice.method.as_str(),
                    choice.channel.as_str()
                )));
            }
        }

        let result = self.create_in_tx(event_id, &request).await;
        let (registration, first_payment) = match result {
            Ok(created) => created,
            Err(e) => {
                let outcome = match &e {
                    RegistrationError::OutOfStock { .. } => "out_of_stock",
                    RegistrationError::Validation(_) => "invalid",
                    _ => "failed",
                };
                record_registration(outcome);
                return Err(e);
            }
        };
        record_registration("created");

        info!(
            order_code = %registration.order_code,
            final_price = %registration.final_price,
            status = %registration.payment_status,
            "Registration created"
        );

        if let Some(payment) = first_payment.filter(|p| p.channel == PaymentChannel::Online) {
            if let Err(e) = self.payments.initiate(payment.payment_id).await {
                warn!(
                    order_code = %registration.order_code,
                    payment_id = %payment.payment_id,
                    error = %e,
                    "Initiating first payment failed, left for the poller"
                );
            }
        }

        self.get(&registration.order_code).await
    }

    async fn create_in_tx(
        &self,
        event_id: Uuid,
        request: &CreateRegistration,
    ) -> Result<(Registration, Option<RegistrationPayment>)> {
        let now = Utc::now();
        let per_batch = group_by_batch(&request.attendees);
        let quantity: i32 = per_batch.values().sum();

        let mut tx = self.db.begin().await?;

        let config = EventCatalog::get_event_payment_config(&mut *tx, event_id)
            .await?
            .ok_or_else(|| RegistrationError::not_found("Event"))?;

        let registration_id = Uuid::new_v4();
        let reservations =
            InventoryLedger::reserve_all(&mut *tx, event_id, registration_id, &per_batch, now).await?;

        let coupon = match request.coupon_code.as_deref() {
            Some(code) => {
                let coupon = EventCatalog::get_coupon(&mut *tx, event_id, code, true)
                    .await?
                    .ok_or_else(|| RegistrationError::validation(format!("Unknown coupon '{}'", code)))?;
                pricing::check_coupon(&coupon, event_id, quantity, now)?;
                Some(coupon)
            }
            None => None,
        };

        let lines: Vec<PriceLine> = reservations
            .iter()
            .map(|r| PriceLine {
                unit_price: r.batch.price,
                quantity: r.quantity,
            })
            .collect();
        let breakdown = pricing::price(&lines, coupon.as_ref());

        if let Some(coupon) = &coupon {
            if !EventCatalog::redeem_coupon(&mut *tx, coupon.coupon_id).await? {
                return Err(RegistrationError::validation(format!(
                    "Coupon '{}' has no uses left",
                    coupon.code
                )));
            }
        }

        let choice = match (config.payment_mode, request.payment) {
            (PaymentMode::Single, Some(choice)) if breakdown.final_price > Decimal::ZERO => Some(choice),
            (PaymentMode::Single, None) if breakdown.final_price > Decimal::ZERO => {
                return Err(RegistrationError::validation(
                    "A payment channel and method are required for this event",
                ));
            }
            _ => None,
        };

        let order_code = self.unique_order_code(&mut *tx).await?;

        let mut draft = Registration {
            registration_id,
            order_code,
            event_id,
            quantity,
            buyer_data: Json(request.buyer.clone()),
            coupon_id: coupon.as_ref().map(|c| c.coupon_id),
            original_price: breakdown.original,
            discount_amount: breakdown.discount,
            final_price: breakdown.final_price,
            payment_status: RegistrationStatus::Pending,
            payment_mode: config.payment_mode,
            expires_utc: config.deadline_from(now),
            cancelled_utc: None,
            released_utc: None,
            created_utc: now,
            updated_utc: now,
        };
        draft.payment_status = derive_status_for(&draft, &[], now);

        let registration = RegistrationStore::insert(&mut *tx, &draft)
            .await
            .map_err(|e| match e {
                RegistrationError::Database(ref db) if is_unique_violation(db) => {
                    RegistrationError::conflict("Order code collision, please retry")
                }
                other => other,
            })?;
        RegistrationStore::insert_attendees(&mut *tx, registration_id, &request.attendees).await?;

        let first_payment = match choice {
            Some(choice) => {
                let provider = match choice.channel {
                    PaymentChannel::Online => Some(self.payments.gateway().provider().to_string()),
                    PaymentChannel::Offline => None,
                };
                let payment = PaymentLedger::insert(
                    &mut *tx,
                    registration_id,
                    &NewPayment {
                        channel: choice.channel,
                        method: choice.method,
                        amount: registration.final_price,
                    },
                    provider.as_deref(),
                    now,
                )
                .await?;
                RegistrationStore::recompute_status(&mut *tx, registration_id, now).await?;
                Some(payment)
            }
            None => None,
        };

        tx.commit().await?;
        Ok((registration, first_payment))
    }

    async fn unique_order_code(&self, conn: &mut PgConnection) -> Result<String> {
        for _ in 0..ORDER_CODE_ATTEMPTS {
            let code = order_code::generate();
            if !RegistrationStore::order_code_exists(conn, &code).await? {
                return Ok(code);
            }
        }
        Err(RegistrationError::conflict("Could not allocate an order code, please retry"))
    }

    /// Registration with its attendees and payment attempts.
    pub async fn get(&self, code: &str) -> Result<RegistrationDetails> {
        let code = order_code::normalize(code);
        if !order_code::is_valid(&code) {
            return Err(RegistrationError::not_found("Registration"));
        }

        let mut conn = self.db.pool().acquire().await?;
        let registration = RegistrationStore::find_by_order_code(&mut conn, &code)
            .await?
            .ok_or_else(|| RegistrationError::not_found("Registration"))?;
        let attendees = RegistrationStore::attendees(&mut conn, registration.registration_id).await?;
        let payments =
            PaymentLedger::list_for_registration(&mut conn, registration.registration_id, false).await?;

        Ok(RegistrationDetails {
            registration,
            attendees,
            payments,
        })
    }

    /// Buyer cancel before anything was paid.
    #[instrument(skip(self))]
    pub async fn cancel(&self, code: &str) -> Result<RegistrationDetails> {
        let code = order_code::normalize(code);
        let now = Utc::now();
        let mut tx = self.db.begin().await?;

        let registration = RegistrationStore::lock_by_order_code(&mut *tx, &code)
            .await?
            .ok_or_else(|| RegistrationError::not_found("Registration"))?;

        if registration.cancelled_utc.is_some() {
            tx.commit().await?;
            return self.get(&code).await;
        }

        let payments =
            PaymentLedger::list_for_registration(&mut *tx, registration.registration_id, true).await?;
        if payments
            .iter()
            .any(|p| matches!(p.status, PaymentStatus::Confirmed | PaymentStatus::Refunded))
        {
            return Err(RegistrationError::conflict(
                "Registration has confirmed payments; use the refund flow",
            ));
        }
        if registration.released_utc.is_some() {
            return Err(RegistrationError::conflict(format!(
                "Registration is already {}",
                registration.payment_status
            )));
        }

        let released = InventoryLedger::release_registration(&mut *tx, registration.registration_id, now).await?;
        RegistrationStore::mark_cancelled(&mut *tx, registration.registration_id, now).await?;

        for payment in payments.iter().filter(|p| p.status.is_open()) {
            PaymentLedger::transition(
                &mut *tx,
                payment,
                PaymentStatus::Cancelled,
                TransitionSource::Cancellation,
                None,
                now,
            )
            .await?;
        }

        let mut effects = SideEffects::default();
        if let Some(change) =
            RegistrationStore::recompute_status(&mut *tx, registration.registration_id, now).await?
        {
            effects.status_changes.push(change);
        }

        tx.commit().await?;
        self.payments.publish(effects);
        record_registration("cancelled");

        info!(order_code = %code, released = released, "Registration cancelled");
        self.get(&code).await
    }
}
