//! Payment ledger model: attempts, their state machine and the audit trail.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Status of a single payment attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Pending,
    Authorized,
    Confirmed,
    Denied,
    Cancelled,
    Refunded,
    Expired,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Authorized => "authorized",
            PaymentStatus::Confirmed => "confirmed",
            PaymentStatus::Denied => "denied",
            PaymentStatus::Cancelled => "cancelled",
            PaymentStatus::Refunded => "refunded",
            PaymentStatus::Expired => "expired",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(PaymentStatus::Pending),
            "authorized" => Some(PaymentStatus::Authorized),
            "confirmed" => Some(PaymentStatus::Confirmed),
            "denied" => Some(PaymentStatus::Denied),
            "cancelled" => Some(PaymentStatus::Cancelled),
            "refunded" => Some(PaymentStatus::Refunded),
            "expired" => Some(PaymentStatus::Expired),
            _ => None,
        }
    }

    /// Open attempts may still move money.
    pub fn is_open(&self) -> bool {
        matches!(self, PaymentStatus::Pending | PaymentStatus::Authorized)
    }

    /// Forward-only transition table. `confirmed -> refunded` is the only
    /// move out of a terminal state.
    pub fn can_transition_to(&self, next: PaymentStatus) -> bool {
        use PaymentStatus::*;
        matches!(
            (self, next),
            (Pending, Authorized)
                | (Pending, Confirmed)
                | (Pending, Denied)
                | (Pending, Cancelled)
                | (Pending, Expired)
                | (Authorized, Confirmed)
                | (Authorized, Cancelled)
                | (Authorized, Expired)
                | (Confirmed, Refunded)
        )
    }
}

impl std::fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<String> for PaymentStatus {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value).ok_or_else(|| format!("unknown payment status '{}'", value))
    }
}

/// How the money reaches us.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentChannel {
    /// Through a payment gateway.
    Online,
    /// Recorded manually by staff (cash, bank transfer).
    Offline,
}

impl PaymentChannel {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentChannel::Online => "online",
            PaymentChannel::Offline => "offline",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "online" => Some(PaymentChannel::Online),
            "offline" => Some(PaymentChannel::Offline),
            _ => None,
        }
    }
}

impl TryFrom<String> for PaymentChannel {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value).ok_or_else(|| format!("unknown payment channel '{}'", value))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    Card,
    Pix,
    Cash,
    BankTransfer,
}

impl PaymentMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentMethod::Card => "card",
            PaymentMethod::Pix => "pix",
            PaymentMethod::Cash => "cash",
            PaymentMethod::BankTransfer => "bank_transfer",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "card" => Some(PaymentMethod::Card),
            "pix" => Some(PaymentMethod::Pix),
            "cash" => Some(PaymentMethod::Cash),
            "bank_transfer" => Some(PaymentMethod::BankTransfer),
            _ => None,
        }
    }

    /// Whether the method can be used on the given channel.
    pub fn supports(&self, channel: PaymentChannel) -> bool {
        match channel {
            PaymentChannel::Online => matches!(self, PaymentMethod::Card | PaymentMethod::Pix),
            PaymentChannel::Offline => true,
        }
    }
}

impl TryFrom<String> for PaymentMethod {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value).ok_or_else(|| format!("unknown payment method '{}'", value))
    }
}

/// Progress of the commission payout attached to a confirmed payment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommissionStatus {
    InFlight,
    Sent,
    Failed,
}

impl CommissionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommissionStatus::InFlight => "in_flight",
            CommissionStatus::Sent => "sent",
            CommissionStatus::Failed => "failed",
        }
    }
}

/// One payment attempt against a registration.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct RegistrationPayment {
    pub payment_id: Uuid,
    pub registration_id: Uuid,
    #[sqlx(try_from = "String")]
    pub channel: PaymentChannel,
    #[sqlx(try_from = "String")]
    pub method: PaymentMethod,
    pub amount: Decimal,
    #[sqlx(try_from = "String")]
    pub status: PaymentStatus,
    pub provider: Option<String>,
    pub provider_payment_id: Option<String>,
    pub client_payload: Option<serde_json::Value>,
    pub confirmed_utc: Option<DateTime<Utc>>,
    pub commission_sent_utc: Option<DateTime<Utc>>,
    pub commission_status: Option<String>,
    pub commission_attempts: i32,
    pub commission_error: Option<String>,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

/// Kind of entry in the payment audit trail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    Created,
    GatewayRequest,
    GatewayResponse,
    GatewayError,
    GatewayQuery,
    Webhook,
    Manual,
    Expiration,
    Cancellation,
    CommissionTransfer,
    CommissionFailure,
}

impl TransactionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionKind::Created => "created",
            TransactionKind::GatewayRequest => "gateway_request",
            TransactionKind::GatewayResponse => "gateway_response",
            TransactionKind::GatewayError => "gateway_error",
            TransactionKind::GatewayQuery => "gateway_query",
            TransactionKind::Webhook => "webhook",
            TransactionKind::Manual => "manual",
            TransactionKind::Expiration => "expiration",
            TransactionKind::Cancellation => "cancellation",
            TransactionKind::CommissionTransfer => "commission_transfer",
            TransactionKind::CommissionFailure => "commission_failure",
        }
    }
}

/// Input for recording a new attempt.
#[derive(Debug, Clone)]
pub struct NewPayment {
    pub channel: PaymentChannel,
    pub method: PaymentMethod,
    pub amount: Decimal,
}
