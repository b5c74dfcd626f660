//! Event-level payment configuration (read model owned by the CRUD layer).

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// How a registration is paid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMode {
    /// One payment for the full final price.
    Single,
    /// A deposit followed by any number of partial payments.
    BalanceDue,
}

impl PaymentMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentMode::Single => "single",
            PaymentMode::BalanceDue => "balance_due",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "single" => Some(PaymentMode::Single),
            "balance_due" => Some(PaymentMode::BalanceDue),
            _ => None,
        }
    }
}

impl TryFrom<String> for PaymentMode {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value).ok_or_else(|| format!("unknown payment mode '{}'", value))
    }
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct EventPaymentConfig {
    pub event_id: Uuid,
    pub currency: String,
    #[sqlx(try_from = "String")]
    pub payment_mode: PaymentMode,
    pub min_deposit_amount: Option<Decimal>,
    pub max_payment_count: Option<i32>,
    pub payment_window_minutes: i32,
    pub balance_due_utc: Option<DateTime<Utc>>,
    pub commission_percentage: Option<Decimal>,
    pub commission_pix_key: Option<String>,
}

impl EventPaymentConfig {
    /// Payment deadline for a registration created at `created`.
    pub fn deadline_from(&self, created: DateTime<Utc>) -> DateTime<Utc> {
        match (self.payment_mode, self.balance_due_utc) {
            (PaymentMode::BalanceDue, Some(due)) if due > created => due,
            _ => created + Duration::minutes(i64::from(self.payment_window_minutes.max(1))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(mode: PaymentMode) -> EventPaymentConfig {
        EventPaymentConfig {
            event_id: Uuid::new_v4(),
            currency: "BRL".to_string(),
            payment_mode: mode,
            min_deposit_amount: None,
            max_payment_count: None,
            payment_window_minutes: 30,
            balance_due_utc: None,
            commission_percentage: None,
            commission_pix_key: None,
        }
    }

    #[test]
    fn test_deadline_uses_window() {
        let now = Utc::now();
        let cfg = config(PaymentMode::Single);
        assert_eq!(cfg.deadline_from(now), now + Duration::minutes(30));
    }

    #[test]
    fn test_balance_due_date_wins_when_in_future() {
        let now = Utc::now();
        let due = now + Duration::days(20);
        let mut cfg = config(PaymentMode::BalanceDue);
        cfg.balance_due_utc = Some(due);
        assert_eq!(cfg.deadline_from(now), due);

        cfg.balance_due_utc = Some(now - Duration::days(1));
        assert_eq!(cfg.deadline_from(now), now + Duration::minutes(30));
    }
}
