//! Coupon model.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiscountType {
    Percentage,
    Fixed,
}

impl DiscountType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiscountType::Percentage => "percentage",
            DiscountType::Fixed => "fixed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "percentage" => Some(DiscountType::Percentage),
            "fixed" => Some(DiscountType::Fixed),
            _ => None,
        }
    }
}

impl TryFrom<String> for DiscountType {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value).ok_or_else(|| format!("unknown discount type '{}'", value))
    }
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Coupon {
    pub coupon_id: Uuid,
    /// `None` for coupons valid on every event.
    pub event_id: Option<Uuid>,
    pub code: String,
    #[sqlx(try_from = "String")]
    pub discount_type: DiscountType,
    pub discount_value: Decimal,
    pub minimum_quantity: Option<i32>,
    pub max_uses: Option<i32>,
    pub current_uses: i32,
    pub valid_from_utc: Option<DateTime<Utc>>,
    pub valid_until_utc: Option<DateTime<Utc>>,
    pub is_active: bool,
}
