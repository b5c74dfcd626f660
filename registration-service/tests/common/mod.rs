//! Test helper module for registration-service integration tests.
//!
//! Every test gets its own Postgres schema. Tests are skipped when
//! `TEST_DATABASE_URL` is not set.

#![allow(dead_code)]

use registration_service::config::{
    CommissionConfig, DatabaseConfig, GatewayConfig, NotificationConfig, RegistrationConfig,
    SweeperConfig,
};
use registration_service::models::{
    BuyerData, NewAttendee, PaymentChannel, PaymentMethod, PaymentMode,
};
use registration_service::services::gateway::{MockCommissionPayer, MockGateway};
use registration_service::services::notifications::MockNotifier;
use registration_service::services::{
    init_metrics, CreateRegistration, Database, PaymentChoice, Sweeper,
};
use registration_service::startup::{AppState, Application, Collaborators};
use rust_decimal::Decimal;
use secrecy::Secret;
use service_core::config::Config as CoreConfig;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

// Counter for unique schema names
static SCHEMA_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Database URL for integration tests, if configured.
pub fn test_database_url() -> Option<String> {
    std::env::var("TEST_DATABASE_URL")
        .ok()
        .filter(|url| !url.trim().is_empty())
}

fn unique_schema_name() -> String {
    let counter = SCHEMA_COUNTER.fetch_add(1, Ordering::SeqCst);
    format!("test_registration_{}_{}", std::process::id(), counter)
}

pub fn dec(value: &str) -> Decimal {
    value.parse().expect("valid decimal literal")
}

/// Event row to seed.
#[derive(Debug, Clone)]
pub struct EventSeed {
    pub payment_mode: PaymentMode,
    pub payment_window_minutes: i32,
    pub min_deposit_amount: Option<Decimal>,
    pub max_payment_count: Option<i32>,
    pub commission_percentage: Option<Decimal>,
    pub commission_pix_key: Option<String>,
}

impl Default for EventSeed {
    fn default() -> Self {
        Self {
            payment_mode: PaymentMode::Single,
            payment_window_minutes: 60,
            min_deposit_amount: None,
            max_payment_count: None,
            commission_percentage: None,
            commission_pix_key: None,
        }
    }
}

/// Test application wrapper for integration tests.
pub struct TestApp {
    pub http_address: String,
    pub http_port: u16,
    pub db: Database,
    pub state: AppState,
    pub sweeper: Sweeper,
    pub gateway: Arc<MockGateway>,
    pub commission_payer: Arc<MockCommissionPayer>,
    pub notifier: Arc<MockNotifier>,
    shutdown: CancellationToken,
    schema_name: String,
}

impl TestApp {
    /// Spawn a test application on a random port, or `None` when no test
    /// database is configured.
    pub async fn spawn() -> Option<Self> {
        let Some(database_url) = test_database_url() else {
            eprintln!("TEST_DATABASE_URL not set, skipping database test");
            return None;
        };

        init_metrics();

        let schema_name = unique_schema_name();
        let db = Database::new(&database_url, Some(&schema_name), 10, 1)
            .await
            .expect("Failed to connect to test database");
        db.run_migrations()
            .await
            .expect("Failed to migrate test schema");

        let config = RegistrationConfig {
            common: CoreConfig { port: 0 },
            service_name: "registration-service-test".to_string(),
            service_version: "0.1.0".to_string(),
            log_level: "warn".to_string(),
            otlp_endpoint: None,
            database: DatabaseConfig {
                url: database_url,
                schema: Some(schema_name.clone()),
                max_connections: 10,
                min_connections: 1,
            },
            gateway: GatewayConfig {
                provider: "mock".to_string(),
                base_url: "http://127.0.0.1:1".to_string(),
                api_key: Secret::new(String::new()),
                timeout: Duration::from_secs(5),
                max_attempts: 1,
            },
            commission: CommissionConfig {
                base_url: "http://127.0.0.1:1".to_string(),
                api_key: Secret::new(String::new()),
                timeout: Duration::from_secs(5),
                max_attempts: 3,
                queue_capacity: 64,
            },
            sweeper: SweeperConfig {
                // Tests drive the sweeper explicitly through `run_once`.
                enabled: false,
                interval: Duration::from_secs(3600),
                attempt_ttl: Duration::from_secs(86_400),
                poll_after: Duration::ZERO,
                batch_size: 100,
            },
            notifications: NotificationConfig { webhook_url: None },
        };

        let gateway = Arc::new(MockGateway::new());
        let commission_payer = Arc::new(MockCommissionPayer::new());
        let notifier = Arc::new(MockNotifier::new());

        let app = Application::build_without_migrations(
            config,
            Collaborators {
                gateway: gateway.clone(),
                commission_payer: commission_payer.clone(),
                notifier: notifier.clone(),
            },
        )
        .await
        .expect("Failed to build test application");

        let http_port = app.http_port();
        let state = app.state().clone();
        let sweeper = app.sweeper().clone();
        let shutdown = app.shutdown_token();

        tokio::spawn(async move {
            app.run_until_stopped().await.ok();
        });

        // Wait for HTTP server to be ready by polling health endpoint
        let client = reqwest::Client::new();
        let health_url = format!("http://127.0.0.1:{}/health", http_port);
        for _ in 0..50 {
            if client.get(&health_url).send().await.is_ok() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        Some(TestApp {
            http_address: format!("http://127.0.0.1:{}", http_port),
            http_port,
            db,
            state,
            sweeper,
            gateway,
            commission_payer,
            notifier,
            shutdown,
            schema_name,
        })
    }

    pub async fn seed_event(&self, seed: EventSeed) -> Uuid {
        let event_id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO events
                (event_id, name, currency, payment_mode, min_deposit_amount, max_payment_count,
                 payment_window_minutes, commission_percentage, commission_pix_key)
            VALUES ($1, 'Test Event', 'BRL', $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(event_id)
        .bind(seed.payment_mode.as_str())
        .bind(seed.min_deposit_amount)
        .bind(seed.max_payment_count)
        .bind(seed.payment_window_minutes)
        .bind(seed.commission_percentage)
        .bind(seed.commission_pix_key)
        .execute(self.db.pool())
        .await
        .expect("Failed to seed event");
        event_id
    }

    pub async fn seed_batch(&self, event_id: Uuid, price: &str, max_quantity: Option<i32>) -> Uuid {
        let batch_id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO batches (batch_id, event_id, name, price, max_quantity)
            VALUES ($1, $2, 'General', $3, $4)
            "#,
        )
        .bind(batch_id)
        .bind(event_id)
        .bind(dec(price))
        .bind(max_quantity)
        .execute(self.db.pool())
        .await
        .expect("Failed to seed batch");
        batch_id
    }

    pub async fn seed_coupon(
        &self,
        event_id: Option<Uuid>,
        code: &str,
        discount_type: &str,
        value: &str,
        max_uses: Option<i32>,
    ) -> Uuid {
        let coupon_id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO coupons (coupon_id, event_id, code, discount_type, discount_value, max_uses)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(coupon_id)
        .bind(event_id)
        .bind(code)
        .bind(discount_type)
        .bind(dec(value))
        .bind(max_uses)
        .execute(self.db.pool())
        .await
        .expect("Failed to seed coupon");
        coupon_id
    }

    pub async fn batch_quantity(&self, batch_id: Uuid) -> i32 {
        sqlx::query_scalar("SELECT current_quantity FROM batches WHERE batch_id = $1")
            .bind(batch_id)
            .fetch_one(self.db.pool())
            .await
            .expect("Failed to read batch")
    }

    pub async fn coupon_uses(&self, coupon_id: Uuid) -> i32 {
        sqlx::query_scalar("SELECT current_uses FROM coupons WHERE coupon_id = $1")
            .bind(coupon_id)
            .fetch_one(self.db.pool())
            .await
            .expect("Failed to read coupon")
    }

    /// Move a registration's deadline into the past.
    pub async fn expire_deadline(&self, registration_id: Uuid) {
        sqlx::query(
            "UPDATE registrations SET expires_utc = NOW() - INTERVAL '1 minute' WHERE registration_id = $1",
        )
        .bind(registration_id)
        .execute(self.db.pool())
        .await
        .expect("Failed to move deadline");
    }

    /// Backdate an attempt so time-based sweeper passes see it regardless of
    /// clock skew between the test host and the database.
    pub async fn age_payment(&self, payment_id: Uuid) {
        sqlx::query(
            "UPDATE registration_payments \
             SET created_utc = NOW() - INTERVAL '1 minute', updated_utc = NOW() - INTERVAL '1 minute' \
             WHERE payment_id = $1",
        )
        .bind(payment_id)
        .execute(self.db.pool())
        .await
        .expect("Failed to age payment");
    }

    pub async fn transaction_count(&self, payment_id: Uuid, kind: &str) -> i64 {
        sqlx::query_scalar(
            "SELECT COUNT(*) FROM payment_transactions WHERE payment_id = $1 AND kind = $2",
        )
        .bind(payment_id)
        .bind(kind)
        .fetch_one(self.db.pool())
        .await
        .expect("Failed to count transactions")
    }

    /// Wait until the mock payer has seen `expected` transfers or time runs out.
    pub async fn wait_for_transfers(&self, expected: usize) -> usize {
        for _ in 0..40 {
            if self.commission_payer.transfer_count() >= expected {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        self.commission_payer.transfer_count()
    }

    pub async fn cleanup(&self) {
        self.shutdown.cancel();
        sqlx::query(&format!("DROP SCHEMA IF EXISTS {} CASCADE", self.schema_name))
            .execute(self.db.pool())
            .await
            .ok();
    }
}

pub fn buyer() -> BuyerData {
    BuyerData {
        name: "Maria Souza".to_string(),
        email: "maria@example.com".to_string(),
        document: Some("12345678900".to_string()),
        phone: None,
    }
}

pub fn attendees(batch_id: Uuid, count: usize) -> Vec<NewAttendee> {
    (0..count)
        .map(|i| NewAttendee {
            batch_id,
            name: format!("Attendee {}", i + 1),
            email: None,
            details: None,
        })
        .collect()
}

/// Registration request with one batch and an optional first payment.
pub fn request(
    batch_id: Uuid,
    count: usize,
    coupon_code: Option<&str>,
    payment: Option<(PaymentChannel, PaymentMethod)>,
) -> CreateRegistration {
    CreateRegistration {
        buyer: buyer(),
        attendees: attendees(batch_id, count),
        coupon_code: coupon_code.map(str::to_string),
        payment: payment.map(|(channel, method)| PaymentChoice { channel, method }),
    }
}

pub const OFFLINE_CASH: Option<(PaymentChannel, PaymentMethod)> =
    Some((PaymentChannel::Offline, PaymentMethod::Cash));

pub const ONLINE_PIX: Option<(PaymentChannel, PaymentMethod)> =
    Some((PaymentChannel::Online, PaymentMethod::Pix));
