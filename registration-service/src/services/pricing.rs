//! Pricing engine: original price, coupon discount and final price.
//!
//! Pure functions only; redemption of a coupon happens in the registration
//! transaction, never here.

use crate::error::RegistrationError;
use crate::models::{Coupon, DiscountType};
use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::Serialize;
use uuid::Uuid;

/// One priced line of an order: a batch and how many attendees take it.
#[derive(Debug, Clone, Copy)]
pub struct PriceLine {
    pub unit_price: Decimal,
    pub quantity: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PriceBreakdown {
    pub original: Decimal,
    pub discount: Decimal,
    #[serde(rename = "final")]
    pub final_price: Decimal,
}

/// Round to cents, half-up.
pub fn round_money(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

/// Amount in minor units (cents) for gateway requests.
pub fn to_minor_units(value: Decimal) -> Option<i64> {
    (round_money(value) * Decimal::ONE_HUNDRED).to_i64()
}

/// Commission owed on a confirmed payment.
pub fn commission_amount(amount: Decimal, percentage: Decimal) -> Decimal {
    round_money(amount * percentage / Decimal::ONE_HUNDRED)
}

/// Reject coupons that cannot be applied to this order.
pub fn check_coupon(
    coupon: &Coupon,
    event_id: Uuid,
    quantity: i32,
    now: DateTime<Utc>,
) -> Result<(), RegistrationError> {
    let invalid = |reason: &str| {
        Err(RegistrationError::validation(format!(
            "Coupon '{}' {}",
            coupon.code, reason
        )))
    };

    if !coupon.is_active {
        return invalid("is not active");
    }
    if coupon.event_id.is_some_and(|id| id != event_id) {
        return invalid("is not valid for this event");
    }
    if coupon.valid_from_utc.is_some_and(|from| now < from) {
        return invalid("is not valid yet");
    }
    if coupon.valid_until_utc.is_some_and(|until| now > until) {
        return invalid("has expired");
    }
    if coupon.minimum_quantity.is_some_and(|min| quantity < min) {
        return invalid("requires more attendees");
    }
    if coupon
        .max_uses
        .is_some_and(|max| coupon.current_uses >= max)
    {
        return invalid("has no uses left");
    }
    Ok(())
}

/// Price an order. The coupon must already have passed [`check_coupon`].
pub fn price(lines: &[PriceLine], coupon: Option<&Coupon>) -> PriceBreakdown {
    let original = round_money(
        lines
            .iter()
            .map(|line| line.unit_price * Decimal::from(line.quantity))
            .sum(),
    );

    let discount = match coupon {
        None => Decimal::ZERO,
        Some(c) => match c.discount_type {
            DiscountType::Percentage => {
                round_money(original * c.discount_value / Decimal::ONE_HUNDRED)
            }
            DiscountType::Fixed => c.discount_value,
        },
    }
    .min(original)
    .max(Decimal::ZERO);

    let final_price = round_money((original - discount).max(Decimal::ZERO));

    PriceBreakdown {
        original,
        discount: round_money(discount),
        final_price,
    }
}
