//! Batch (lot) model: a priced, capacity-limited slice of event inventory.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Batch {
    pub batch_id: Uuid,
    pub event_id: Uuid,
    pub name: String,
    pub price: Decimal,
    /// `None` means unbounded.
    pub max_quantity: Option<i32>,
    pub current_quantity: i32,
    pub is_active: bool,
    pub sale_starts_utc: Option<DateTime<Utc>>,
    pub sale_ends_utc: Option<DateTime<Utc>>,
}

impl Batch {
    /// Remaining capacity, `None` when unbounded.
    pub fn available(&self) -> Option<i32> {
        self.max_quantity
            .map(|max| (max - self.current_quantity).max(0))
    }

    pub fn can_fit(&self, count: i32) -> bool {
        match self.max_quantity {
            Some(max) => self.current_quantity + count <= max,
            None => true,
        }
    }

    pub fn is_on_sale(&self, now: DateTime<Utc>) -> bool {
        self.is_active
            && self.sale_starts_utc.map_or(true, |start| now >= start)
            && self.sale_ends_utc.map_or(true, |end| now <= end)
    }
}
