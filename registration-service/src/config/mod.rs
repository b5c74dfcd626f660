use secrecy::Secret;
use service_core::config::{self as core_config, env_opt, env_or};
use service_core::error::AppError;
use std::env;
use std::time::Duration;

/// Injected configuration for every component of the registration core.
#[derive(Debug, Clone)]
pub struct RegistrationConfig {
    pub common: core_config::Config,
    pub service_name: String,
    pub service_version: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    pub database: DatabaseConfig,
    pub gateway: GatewayConfig,
    pub commission: CommissionConfig,
    pub sweeper: SweeperConfig,
    pub notifications: NotificationConfig,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    /// Applied as the pool's `search_path`; `None` keeps the server default.
    pub schema: Option<String>,
    pub max_connections: u32,
    pub min_connections: u32,
}

/// Card/PIX processor.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub provider: String,
    pub base_url: String,
    pub api_key: Secret<String>,
    /// Hard bound on one whole call, retries included.
    pub timeout: Duration,
    pub max_attempts: u32,
}

/// PIX commission payer.
#[derive(Debug, Clone)]
pub struct CommissionConfig {
    pub base_url: String,
    pub api_key: Secret<String>,
    pub timeout: Duration,
    /// Failed payouts are retried by the sweep until this many attempts.
    pub max_attempts: i32,
    pub queue_capacity: usize,
}

#[derive(Debug, Clone)]
pub struct SweeperConfig {
    pub enabled: bool,
    pub interval: Duration,
    /// Open attempts older than this are expired.
    pub attempt_ttl: Duration,
    /// Online attempts older than this are polled at the gateway.
    pub poll_after: Duration,
    pub batch_size: i64,
}

#[derive(Debug, Clone)]
pub struct NotificationConfig {
    /// Status changes are POSTed here; logged only when unset.
    pub webhook_url: Option<String>,
}

impl RegistrationConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let common = core_config::Config::load()?;

        Ok(Self {
            common,
            service_name: env_or("SERVICE_NAME", "registration-service".to_string())?,
            service_version: env!("CARGO_PKG_VERSION").to_string(),
            log_level: env_or("LOG_LEVEL", "info".to_string())?,
            otlp_endpoint: env_opt("OTLP_ENDPOINT")?,
            database: DatabaseConfig {
                url: required("DATABASE_URL")?,
                schema: env_opt("DATABASE_SCHEMA")?,
                max_connections: env_or("DATABASE_MAX_CONNECTIONS", 10)?,
                min_connections: env_or("DATABASE_MIN_CONNECTIONS", 1)?,
            },
            gateway: GatewayConfig {
                provider: env_or("GATEWAY_PROVIDER", "cardpix".to_string())?,
                base_url: env_or("GATEWAY_BASE_URL", "http://localhost:9100".to_string())?,
                api_key: Secret::new(env_or("GATEWAY_API_KEY", String::new())?),
                timeout: Duration::from_secs(env_or("GATEWAY_TIMEOUT_SECS", 10)?),
                max_attempts: env_or("GATEWAY_MAX_ATTEMPTS", 3)?,
            },
            commission: CommissionConfig {
                base_url: env_or("COMMISSION_BASE_URL", "http://localhost:9200".to_string())?,
                api_key: Secret::new(env_or("COMMISSION_API_KEY", String::new())?),
                timeout: Duration::from_secs(env_or("COMMISSION_TIMEOUT_SECS", 10)?),
                max_attempts: env_or("COMMISSION_MAX_ATTEMPTS", 5)?,
                queue_capacity: env_or("COMMISSION_QUEUE_CAPACITY", 256)?,
            },
            sweeper: SweeperConfig {
                enabled: env_or("SWEEPER_ENABLED", true)?,
                interval: Duration::from_secs(env_or("SWEEPER_INTERVAL_SECS", 60)?),
                attempt_ttl: Duration::from_secs(env_or("SWEEPER_ATTEMPT_TTL_SECS", 86_400)?),
                poll_after: Duration::from_secs(env_or("SWEEPER_POLL_AFTER_SECS", 300)?),
                batch_size: env_or("SWEEPER_BATCH_SIZE", 100)?,
            },
            notifications: NotificationConfig {
                webhook_url: env_opt("NOTIFICATION_WEBHOOK_URL")?,
            },
        })
    }
}

fn required(key: &str) -> Result<String, AppError> {
    env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| AppError::ConfigError(anyhow::anyhow!("{} is required but not set", key)))
}
