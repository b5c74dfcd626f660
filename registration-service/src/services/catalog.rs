//! Read access to the event, batch and coupon tables owned by the CRUD layer.

use crate::error::Result;
use crate::models::{Batch, Coupon, EventPaymentConfig};
use crate::services::metrics::DB_QUERY_DURATION;
use sqlx::PgConnection;
use tracing::instrument;
use uuid::Uuid;

const BATCH_COLUMNS: &str = "batch_id, event_id, name, price, max_quantity, current_quantity, \
     is_active, sale_starts_utc, sale_ends_utc";

const COUPON_COLUMNS: &str = "coupon_id, event_id, code, discount_type, discount_value, \
     minimum_quantity, max_uses, current_uses, valid_from_utc, valid_until_utc, is_active";

/// Catalog lookups. Every method takes the connection it runs on so callers
/// decide whether the read belongs to a transaction.
pub struct EventCatalog;

impl EventCatalog {
    #[instrument(skip(conn))]
    pub async fn get_event_payment_config(
        conn: &mut PgConnection,
        event_id: Uuid,
    ) -> Result<Option<EventPaymentConfig>> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_event_payment_config"])
            .start_timer();

        let config = sqlx::query_as::<_, EventPaymentConfig>(
            r#"
            SELECT event_id, currency, payment_mode, min_deposit_amount, max_payment_count,
                   payment_window_minutes, balance_due_utc, commission_percentage, commission_pix_key
            FROM events
            WHERE event_id = $1
            "#,
        )
        .bind(event_id)
        .fetch_optional(&mut *conn)
        .await?;

        timer.observe_duration();
        Ok(config)
    }

    /// Single batch; `for_update` takes the row lock that serializes
    /// reservations against it.
    #[instrument(skip(conn))]
    pub async fn get_batch(
        conn: &mut PgConnection,
        batch_id: Uuid,
        for_update: bool,
    ) -> Result<Option<Batch>> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_batch"])
            .start_timer();

        let batch = sqlx::query_as::<_, Batch>(&format!(
            "SELECT {} FROM batches WHERE batch_id = $1{}",
            BATCH_COLUMNS,
            if for_update { " FOR UPDATE" } else { "" }
        ))
        .bind(batch_id)
        .fetch_optional(&mut *conn)
        .await?;

        timer.observe_duration();
        Ok(batch)
    }

    /// Batches by id, without locking. Used for quotes.
    #[instrument(skip(conn, batch_ids), fields(count = batch_ids.len()))]
    pub async fn get_batches(conn: &mut PgConnection, batch_ids: &[Uuid]) -> Result<Vec<Batch>> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_batches"])
            .start_timer();

        let batches = sqlx::query_as::<_, Batch>(&format!(
            "SELECT {} FROM batches WHERE batch_id = ANY($1) ORDER BY batch_id",
            BATCH_COLUMNS
        ))
        .bind(batch_ids)
        .fetch_all(&mut *conn)
        .await?;

        timer.observe_duration();
        Ok(batches)
    }

    /// Case-insensitive coupon lookup scoped to an event; event-specific
    /// coupons win over global ones with the same code. `for_update` locks the
    /// row until the surrounding transaction ends.
    #[instrument(skip(conn))]
    pub async fn get_coupon(
        conn: &mut PgConnection,
        event_id: Uuid,
        code: &str,
        for_update: bool,
    ) -> Result<Option<Coupon>> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_coupon"])
            .start_timer();

        let sql = format!(
            "SELECT {} FROM coupons \
             WHERE LOWER(code) = LOWER($1) AND (event_id IS NULL OR event_id = $2) \
             ORDER BY event_id NULLS LAST LIMIT 1{}",
            COUPON_COLUMNS,
            if for_update { " FOR UPDATE" } else { "" }
        );

        let coupon = sqlx::query_as::<_, Coupon>(&sql)
            .bind(code.trim())
            .bind(event_id)
            .fetch_optional(&mut *conn)
            .await?;

        timer.observe_duration();
        Ok(coupon)
    }

    /// Consume one use of a coupon. `false` when the last use is already gone.
    #[instrument(skip(conn))]
    pub async fn redeem_coupon(conn: &mut PgConnection, coupon_id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE coupons
            SET current_uses = current_uses + 1
            WHERE coupon_id = $1 AND (max_uses IS NULL OR current_uses < max_uses)
            "#,
        )
        .bind(coupon_id)
        .execute(&mut *conn)
        .await?;

        Ok(result.rows_affected() == 1)
    }
}
