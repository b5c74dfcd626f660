//! Application startup and lifecycle management.

use crate::config::RegistrationConfig;
use crate::handlers::{self, payments, registrations, webhooks};
use crate::services::gateway::{
    CallPolicy, CardPixGateway, CommissionPayer, GatewayClient, MockGateway, PaymentGateway,
    PixCommissionPayer,
};
use crate::services::{
    init_metrics, notifier_for, spawn_worker, CommissionService, CommissionTrigger, Database,
    Notifier, PaymentService, RegistrationService, Sweeper, WebhookReconciler,
};
use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use service_core::error::AppError;
use service_core::middleware::{http_span, request_id_middleware};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: RegistrationConfig,
    pub db: Database,
    pub registrations: RegistrationService,
    pub payments: PaymentService,
    pub reconciler: WebhookReconciler,
}

/// Outbound collaborators. Built from configuration in production and
/// injected directly by tests.
#[derive(Clone)]
pub struct Collaborators {
    pub gateway: Arc<dyn PaymentGateway>,
    pub commission_payer: Arc<dyn CommissionPayer>,
    pub notifier: Arc<dyn Notifier>,
}

impl Collaborators {
    pub fn from_config(config: &RegistrationConfig) -> Self {
        let gateway: Arc<dyn PaymentGateway> = match config.gateway.provider.as_str() {
            "mock" => {
                tracing::warn!("Using the in-memory mock gateway");
                Arc::new(MockGateway::new())
            }
            provider => Arc::new(CardPixGateway::new(
                provider,
                config.gateway.base_url.clone(),
                config.gateway.api_key.clone(),
                config.gateway.timeout,
            )),
        };

        let commission_payer = Arc::new(PixCommissionPayer::new(
            config.commission.base_url.clone(),
            config.commission.api_key.clone(),
            CallPolicy::new(config.gateway.max_attempts, config.commission.timeout),
        ));

        Self {
            gateway,
            commission_payer,
            notifier: notifier_for(config.notifications.webhook_url.as_deref()),
        }
    }
}

/// Application container for managing server lifecycle.
pub struct Application {
    http_port: u16,
    http_listener: TcpListener,
    state: AppState,
    sweeper: Sweeper,
    commission: CommissionService,
    commission_rx: mpsc::Receiver<Uuid>,
    shutdown: CancellationToken,
}

impl Application {
    /// Build the application with the given configuration.
    pub async fn build(config: RegistrationConfig) -> Result<Self, AppError> {
        let collaborators = Collaborators::from_config(&config);
        Self::build_internal(config, collaborators, true).await
    }

    /// Build the application without running migrations.
    /// Use this in tests when migrations are already applied by the test harness.
    pub async fn build_without_migrations(
        config: RegistrationConfig,
        collaborators: Collaborators,
    ) -> Result<Self, AppError> {
        Self::build_internal(config, collaborators, false).await
    }

    async fn build_internal(
        config: RegistrationConfig,
        collaborators: Collaborators,
        run_migrations: bool,
    ) -> Result<Self, AppError> {
        init_metrics();

        let db = Database::new(
            &config.database.url,
            config.database.schema.as_deref(),
            config.database.max_connections,
            config.database.min_connections,
        )
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "Failed to connect to PostgreSQL");
            e
        })?;

        if run_migrations {
            db.run_migrations().await.map_err(|e| {
                tracing::error!(error = %e, "Failed to run migrations");
                e
            })?;
        }

        let gateway = GatewayClient::new(
            collaborators.gateway,
            CallPolicy::new(config.gateway.max_attempts, config.gateway.timeout),
        );
        let (commission_trigger, commission_rx) =
            CommissionTrigger::channel(config.commission.queue_capacity);

        let payments = PaymentService::new(
            db.clone(),
            gateway,
            collaborators.notifier,
            commission_trigger,
        );
        let registrations = RegistrationService::new(db.clone(), payments.clone());
        let reconciler = WebhookReconciler::new(db.clone(), payments.clone());
        let commission = CommissionService::new(
            db.clone(),
            collaborators.commission_payer,
            config.commission.max_attempts,
        );
        let sweeper = Sweeper::new(
            db.clone(),
            payments.clone(),
            reconciler.clone(),
            commission.clone(),
            config.sweeper.clone(),
        );

        let state = AppState {
            config: config.clone(),
            db,
            registrations,
            payments,
            reconciler,
        };

        // Port 0 binds a random port for tests.
        let http_addr = SocketAddr::from(([0, 0, 0, 0], config.common.port));
        let http_listener = TcpListener::bind(http_addr).await.map_err(|e| {
            tracing::error!(error = %e, addr = %http_addr, "Failed to bind HTTP listener");
            AppError::from(e)
        })?;
        let http_port = http_listener.local_addr()?.port();

        tracing::info!(http_port = http_port, "Registration service listener bound");

        Ok(Self {
            http_port,
            http_listener,
            state,
            sweeper,
            commission,
            commission_rx,
            shutdown: CancellationToken::new(),
        })
    }

    /// Get the HTTP port the server is listening on.
    pub fn http_port(&self) -> u16 {
        self.http_port
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    pub fn sweeper(&self) -> &Sweeper {
        &self.sweeper
    }

    /// Cancelling this token stops the sweeper and the commission worker.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn router(state: AppState) -> Router {
        Router::new()
            .route("/health", get(handlers::health_check))
            .route("/ready", get(handlers::readiness_check))
            .route("/metrics", get(handlers::metrics_handler))
            .route("/events/:event_id/quote", post(registrations::quote))
            .route(
                "/events/:event_id/registrations",
                post(registrations::create_registration),
            )
            .route("/registrations/:order_code", get(registrations::get_registration))
            .route(
                "/registrations/:order_code/payments",
                post(payments::add_payment),
            )
            .route(
                "/registrations/:order_code/cancel",
                post(registrations::cancel_registration),
            )
            .route("/payments/:payment_id/confirm", post(payments::confirm_offline))
            .route("/payments/:payment_id/deny", post(payments::deny_offline))
            .route("/webhooks/:provider", post(webhooks::receive_webhook))
            .layer(TraceLayer::new_for_http().make_span_with(http_span))
            .layer(middleware::from_fn(request_id_middleware))
            .with_state(state)
    }

    /// Start background workers and serve HTTP until the server stops.
    pub async fn run_until_stopped(self) -> std::io::Result<()> {
        let worker = spawn_worker(self.commission, self.commission_rx, self.shutdown.clone());
        let sweeper = self.sweeper.spawn(self.shutdown.clone());

        let router = Self::router(self.state);

        tracing::info!(
            service = "registration-service",
            version = env!("CARGO_PKG_VERSION"),
            http_port = self.http_port,
            "Service ready to accept connections"
        );

        let result = axum::serve(self.http_listener, router).await;

        self.shutdown.cancel();
        let _ = tokio::join!(worker, sweeper);

        if let Err(e) = result {
            tracing::error!(error = %e, "HTTP server error");
            return Err(std::io::Error::other(format!("HTTP server error: {}", e)));
        }
        Ok(())
    }
}
