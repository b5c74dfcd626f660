//! Inventory ledger: capacity-checked reservations against batches.
//!
//! All methods run on a caller-provided connection, normally a transaction.
//! The batch row lock (`SELECT ... FOR UPDATE`) serializes concurrent
//! reservations of one batch; a multi-batch order locks in ascending id order.

use crate::error::{RegistrationError, Result};
use crate::models::Batch;
use crate::services::catalog::EventCatalog;
use crate::services::metrics::{record_reservation, DB_QUERY_DURATION};
use chrono::{DateTime, Utc};
use sqlx::PgConnection;
use std::collections::BTreeMap;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

/// A batch reservation held by a registration.
#[derive(Debug, Clone)]
pub struct Reservation {
    pub reservation_id: Uuid,
    pub batch: Batch,
    pub quantity: i32,
}

pub struct InventoryLedger;

impl InventoryLedger {
    /// Reserve `count` units of one batch for `registration_id`.
    #[instrument(skip(conn, now))]
    pub async fn reserve(
        conn: &mut PgConnection,
        event_id: Uuid,
        registration_id: Uuid,
        batch_id: Uuid,
        count: i32,
        now: DateTime<Utc>,
    ) -> Result<Reservation> {
        if count <= 0 {
            return Err(RegistrationError::validation("Reservation count must be positive"));
        }

        let batch = EventCatalog::get_batch(conn, batch_id, true)
            .await?
            .ok_or_else(|| RegistrationError::validation(format!("Unknown batch {}", batch_id)))?;

        if batch.event_id != event_id {
            return Err(RegistrationError::validation(format!(
                "Batch {} does not belong to event {}",
                batch_id, event_id
            )));
        }
        if !batch.is_on_sale(now) {
            return Err(RegistrationError::validation(format!(
                "Batch '{}' is not on sale",
                batch.name
            )));
        }
        if !batch.can_fit(count) {
            warn!(
                batch_id = %batch_id,
                requested = count,
                available = ?batch.available(),
                "Batch out of stock"
            );
            record_reservation("rejected", count as u64);
            return Err(RegistrationError::OutOfStock { batch_id });
        }

        let timer = DB_QUERY_DURATION
            .with_label_values(&["reserve"])
            .start_timer();

        sqlx::query(
            "UPDATE batches SET current_quantity = current_quantity + $2 WHERE batch_id = $1",
        )
        .bind(batch_id)
        .bind(count)
        .execute(&mut *conn)
        .await?;

        let reservation_id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO batch_reservations (reservation_id, registration_id, batch_id, quantity, reserved_utc)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(reservation_id)
        .bind(registration_id)
        .bind(batch_id)
        .bind(count)
        .bind(now)
        .execute(&mut *conn)
        .await?;

        timer.observe_duration();
        record_reservation("reserved", count as u64);

        Ok(Reservation {
            reservation_id,
            batch: Batch {
                current_quantity: batch.current_quantity + count,
                ..batch
            },
            quantity: count,
        })
    }

    /// Reserve several batches for one registration. Locks are taken in
    /// ascending batch id order; the first failure aborts the whole set.
    pub async fn reserve_all(
        conn: &mut PgConnection,
        event_id: Uuid,
        registration_id: Uuid,
        per_batch: &BTreeMap<Uuid, i32>,
        now: DateTime<Utc>,
    ) -> Result<Vec<Reservation>> {
        let mut reservations = Vec::with_capacity(per_batch.len());
        for (&batch_id, &count) in per_batch {
            reservations
                .push(Self::reserve(conn, event_id, registration_id, batch_id, count, now).await?);
        }
        Ok(reservations)
    }

    /// Return `count` units to a batch. Never drives the counter below zero.
    #[instrument(skip(conn))]
    pub async fn release(conn: &mut PgConnection, batch_id: Uuid, count: i32) -> Result<()> {
        let current: Option<i32> = sqlx::query_scalar(
            "SELECT current_quantity FROM batches WHERE batch_id = $1 FOR UPDATE",
        )
        .bind(batch_id)
        .fetch_optional(&mut *conn)
        .await?;

        let Some(current) = current else {
            error!(batch_id = %batch_id, "Release against a missing batch");
            return Ok(());
        };

        if current < count {
            error!(
                batch_id = %batch_id,
                current_quantity = current,
                release = count,
                "Inventory inconsistency: release exceeds reserved quantity, clamping at zero"
            );
        }

        sqlx::query(
            "UPDATE batches SET current_quantity = GREATEST(current_quantity - $2, 0) WHERE batch_id = $1",
        )
        .bind(batch_id)
        .bind(count)
        .execute(&mut *conn)
        .await?;

        record_reservation("released", count.max(0) as u64);
        Ok(())
    }

    /// Release every unreleased reservation of a registration, each at most
    /// once. Returns the number of units returned to stock.
    #[instrument(skip(conn, now))]
    pub async fn release_registration(
        conn: &mut PgConnection,
        registration_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<i64> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["release_registration"])
            .start_timer();

        // The conditional update is the exactly-once guard.
        let released: Vec<(Uuid, i32)> = sqlx::query_as(
            r#"
            UPDATE batch_reservations
            SET released_utc = $2
            WHERE registration_id = $1 AND released_utc IS NULL
            RETURNING batch_id, quantity
            "#,
        )
        .bind(registration_id)
        .bind(now)
        .fetch_all(&mut *conn)
        .await?;

        let mut per_batch: BTreeMap<Uuid, i32> = BTreeMap::new();
        for (batch_id, quantity) in released {
            *per_batch.entry(batch_id).or_default() += quantity;
        }

        let mut total = 0i64;
        for (batch_id, quantity) in per_batch {
            Self::release(conn, batch_id, quantity).await?;
            total += i64::from(quantity);
        }

        timer.observe_duration();
        if total > 0 {
            info!(registration_id = %registration_id, units = total, "Inventory released");
        }
        Ok(total)
    }
}
