//! Registration aggregate: the order, its attendees and the derived payment status.

use crate::models::event::PaymentMode;
use crate::models::payment::PaymentStatus;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::FromRow;
use uuid::Uuid;
use validator::Validate;

/// Aggregate payment status of a registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegistrationStatus {
    Pending,
    Authorized,
    Confirmed,
    Partial,
    Denied,
    Cancelled,
    Refunded,
    Expired,
}

impl RegistrationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RegistrationStatus::Pending => "pending",
            RegistrationStatus::Authorized => "authorized",
            RegistrationStatus::Confirmed => "confirmed",
            RegistrationStatus::Partial => "partial",
            RegistrationStatus::Denied => "denied",
            RegistrationStatus::Cancelled => "cancelled",
            RegistrationStatus::Refunded => "refunded",
            RegistrationStatus::Expired => "expired",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(RegistrationStatus::Pending),
            "authorized" => Some(RegistrationStatus::Authorized),
            "confirmed" => Some(RegistrationStatus::Confirmed),
            "partial" => Some(RegistrationStatus::Partial),
            "denied" => Some(RegistrationStatus::Denied),
            "cancelled" => Some(RegistrationStatus::Cancelled),
            "refunded" => Some(RegistrationStatus::Refunded),
            "expired" => Some(RegistrationStatus::Expired),
            _ => None,
        }
    }

    /// Statuses the sweeper looks at once the deadline has passed.
    pub fn sweepable() -> [&'static str; 4] {
        ["pending", "partial", "denied", "expired"]
    }
}

impl From<PaymentStatus> for RegistrationStatus {
    fn from(status: PaymentStatus) -> Self {
        match status {
            PaymentStatus::Pending => RegistrationStatus::Pending,
            PaymentStatus::Authorized => RegistrationStatus::Authorized,
            PaymentStatus::Confirmed => RegistrationStatus::Confirmed,
            PaymentStatus::Denied => RegistrationStatus::Denied,
            PaymentStatus::Cancelled => RegistrationStatus::Cancelled,
            PaymentStatus::Refunded => RegistrationStatus::Refunded,
            PaymentStatus::Expired => RegistrationStatus::Expired,
        }
    }
}

impl std::fmt::Display for RegistrationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<String> for RegistrationStatus {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value).ok_or_else(|| format!("unknown registration status '{}'", value))
    }
}

/// Everything the status derivation is allowed to look at.
#[derive(Debug, Clone)]
pub struct StatusInput<'a> {
    pub mode: PaymentMode,
    pub final_price: Decimal,
    /// Attempts as `(status, amount)`, oldest first.
    pub payments: &'a [(PaymentStatus, Decimal)],
    pub deadline_passed: bool,
    pub cancelled: bool,
    pub released: bool,
}

/// Derive the registration status from its ledger. Pure and idempotent.
pub fn derive_status(input: &StatusInput<'_>) -> RegistrationStatus {
    match input.mode {
        PaymentMode::Single => derive_single(input),
        PaymentMode::BalanceDue => derive_balance_due(input),
    }
}

fn confirmed_sum(payments: &[(PaymentStatus, Decimal)]) -> Decimal {
    payments
        .iter()
        .filter(|(status, _)| *status == PaymentStatus::Confirmed)
        .map(|(_, amount)| *amount)
        .sum()
}

fn derive_single(input: &StatusInput<'_>) -> RegistrationStatus {
    let Some((latest, _)) = input.payments.last() else {
        return if input.cancelled {
            RegistrationStatus::Cancelled
        } else if input.released {
            RegistrationStatus::Expired
        } else if input.final_price <= Decimal::ZERO {
            RegistrationStatus::Confirmed
        } else if input.deadline_passed {
            RegistrationStatus::Expired
        } else {
            RegistrationStatus::Pending
        };
    };

    let has = |wanted: PaymentStatus| input.payments.iter().any(|(s, _)| *s == wanted);

    if has(PaymentStatus::Confirmed) {
        return RegistrationStatus::Confirmed;
    }
    if has(PaymentStatus::Refunded) {
        return RegistrationStatus::Refunded;
    }
    if input.cancelled {
        return RegistrationStatus::Cancelled;
    }
    if latest.is_open() {
        return (*latest).into();
    }
    if input.released || input.deadline_passed {
        return RegistrationStatus::Expired;
    }
    (*latest).into()
}

fn derive_balance_due(input: &StatusInput<'_>) -> RegistrationStatus {
    let sum = confirmed_sum(input.payments);

    // Cancel is refused once money is confirmed, so a cancelled flag always wins.
    if input.cancelled {
        return RegistrationStatus::Cancelled;
    }
    if input.released && input.final_price <= Decimal::ZERO {
        return RegistrationStatus::Expired;
    }

    if sum >= input.final_price {
        return RegistrationStatus::Confirmed;
    }

    if !input.payments.is_empty()
        && input.payments.iter().all(|(s, _)| *s == PaymentStatus::Cancelled)
    {
        return RegistrationStatus::Cancelled;
    }

    let settled: Vec<PaymentStatus> = input
        .payments
        .iter()
        .map(|(s, _)| *s)
        .filter(|s| matches!(s, PaymentStatus::Confirmed | PaymentStatus::Refunded))
        .collect();
    if !settled.is_empty() && settled.iter().all(|s| *s == PaymentStatus::Refunded) {
        return RegistrationStatus::Refunded;
    }

    if input.released {
        return RegistrationStatus::Expired;
    }

    let has_open = input.payments.iter().any(|(s, _)| s.is_open());
    if input.deadline_passed && !has_open && sum.is_zero() {
        return RegistrationStatus::Expired;
    }

    if sum > Decimal::ZERO {
        RegistrationStatus::Partial
    } else {
        RegistrationStatus::Pending
    }
}

/// Buyer contact data captured at checkout.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct BuyerData {
    #[validate(length(min = 1, max = 255))]
    pub name: String,
    #[validate(email)]
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(length(max = 32))]
    pub document: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(length(max = 32))]
    pub phone: Option<String>,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Registration {
    pub registration_id: Uuid,
    pub order_code: String,
    pub event_id: Uuid,
    pub quantity: i32,
    pub buyer_data: Json<BuyerData>,
    pub coupon_id: Option<Uuid>,
    pub original_price: Decimal,
    pub discount_amount: Decimal,
    pub final_price: Decimal,
    #[sqlx(try_from = "String")]
    pub payment_status: RegistrationStatus,
    #[sqlx(try_from = "String")]
    pub payment_mode: PaymentMode,
    pub expires_utc: DateTime<Utc>,
    pub cancelled_utc: Option<DateTime<Utc>>,
    pub released_utc: Option<DateTime<Utc>>,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl Registration {
    /// Whether a new payment attempt may be recorded at `now`.
    pub fn accepts_payments(&self, now: DateTime<Utc>) -> bool {
        if self.cancelled_utc.is_some() || self.released_utc.is_some() || now > self.expires_utc {
            return false;
        }
        matches!(
            self.payment_status,
            RegistrationStatus::Pending | RegistrationStatus::Partial
        )
    }
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Attendee {
    pub attendee_id: Uuid,
    pub registration_id: Uuid,
    pub batch_id: Uuid,
    pub name: String,
    pub email: Option<String>,
    pub details: Option<serde_json::Value>,
}

/// Attendee as submitted at checkout, bound to the batch it consumes.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct NewAttendee {
    pub batch_id: Uuid,
    #[validate(length(min = 1, max = 255))]
    pub name: String,
    #[validate(email)]
    pub email: Option<String>,
    #[serde(default)]
    pub details: Option<serde_json::Value>,
}
