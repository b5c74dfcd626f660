//! Services module for registration-service.

pub mod catalog;
pub mod commission;
pub mod database;
pub mod gateway;
pub mod inventory;
pub mod metrics;
pub mod notifications;
pub mod payments;
pub mod pricing;
pub mod registrations;
pub mod sweeper;
pub mod webhook;

pub use catalog::EventCatalog;
pub use commission::{spawn_worker, CommissionOutcome, CommissionService, CommissionTrigger};
pub use database::Database;
pub use inventory::InventoryLedger;
pub use metrics::{get_metrics, init_metrics};
pub use notifications::{notifier_for, Notifier, StatusChange};
pub use payments::{PaymentLedger, PaymentService, TransitionOutcome, TransitionSource};
pub use registrations::{
    CreateRegistration, PaymentChoice, Quote, RegistrationDetails, RegistrationService,
    RegistrationStore,
};
pub use sweeper::{SweepReport, Sweeper};
pub use webhook::{WebhookNotice, WebhookOutcome, WebhookReconciler};
