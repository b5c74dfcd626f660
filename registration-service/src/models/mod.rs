//! Domain models for registration-service.

mod batch;
mod coupon;
mod event;
mod payment;
mod registration;

pub use batch::Batch;
pub use coupon::{Coupon, DiscountType};
pub use event::{EventPaymentConfig, PaymentMode};
pub use payment::{
    CommissionStatus, NewPayment, PaymentChannel, PaymentMethod, PaymentStatus,
    RegistrationPayment, TransactionKind,
};
pub use registration::{
    derive_status, Attendee, BuyerData, NewAttendee, Registration, RegistrationStatus,
    StatusInput,
};
