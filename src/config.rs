use std::time::Duration;

use anyhow::{Error, Result, anyhow};
use dotenvy::dotenv;
use serde::Deserialize;

use crate::{
    clients::smtp::{SmtpAuth, SmtpConnector, SmtpSecurity},
    consumer::ConsumerConfig,
    models::retry::RetryConfig,
    outbox::RelayConfig,
    rate_limiter::RateLimiterConfig,
    recovery::RecoveryConfig,
};

#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Postgres,
    Memory,
}

#[derive(Clone, Deserialize, Debug)]
pub struct Config {
    pub rabbitmq_url: String,
    #[serde(default = "default_notification_queue")]
    pub notification_queue_name: String,
    #[serde(default = "default_outbox_queue")]
    pub outbox_queue_name: String,
    #[serde(default = "default_prefetch_count")]
    pub prefetch_count: u16,

    #[serde(default)]
    pub store_backend: StoreBackend,
    pub database_url: Option<String>,

    #[serde(default = "default_smtp_host")]
    pub smtp_host: String,
    #[serde(default = "default_smtp_port")]
    pub smtp_port: u16,
    #[serde(default = "default_smtp_helo_name")]
    pub smtp_helo_name: String,
    pub smtp_from_address: String,
    #[serde(default = "default_smtp_pool_size")]
    pub smtp_pool_size: usize,
    #[serde(default = "default_smtp_connect_timeout_ms")]
    pub smtp_connect_timeout_ms: u64,
    #[serde(default)]
    pub smtp_security: SmtpSecurity,
    pub smtp_username: Option<String>,
    pub smtp_password: Option<String>,

    pub sms_provider_url: String,
    pub sms_api_key: String,

    #[serde(default = "default_http_timeout_ms")]
    pub http_timeout_ms: u64,

    #[serde(default = "default_rate_limit_per_second")]
    pub rate_limit_per_second: f64,
    #[serde(default = "default_rate_limit_burst")]
    pub rate_limit_burst: u32,
    #[serde(default = "default_rate_limit_max_tenants")]
    pub rate_limit_max_tenants: usize,

    #[serde(default = "default_max_retry_attempts")]
    pub max_retry_attempts: u32,
    #[serde(default = "default_initial_retry_delay_ms")]
    pub initial_retry_delay_ms: u64,
    #[serde(default = "default_max_retry_delay_ms")]
    pub max_retry_delay_ms: u64,
    #[serde(default = "default_retry_backoff_multiplier")]
    pub retry_backoff_multiplier: u64,

    #[serde(default = "default_worker_concurrency")]
    pub worker_concurrency: usize,
    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,

    #[serde(default = "default_consumer_base_backoff_ms")]
    pub consumer_base_backoff_ms: u64,
    #[serde(default = "default_consumer_max_backoff_ms")]
    pub consumer_max_backoff_ms: u64,
    #[serde(default = "default_message_timeout_ms")]
    pub message_timeout_ms: u64,
    #[serde(default = "default_admission_backoff_ms")]
    pub admission_backoff_ms: u64,

    #[serde(default = "default_outbox_poll_interval_ms")]
    pub outbox_poll_interval_ms: u64,
    #[serde(default = "default_outbox_batch_size")]
    pub outbox_batch_size: usize,
    #[serde(default = "default_outbox_retention_days")]
    pub outbox_retention_days: u32,
    #[serde(default = "default_outbox_cleanup_interval_secs")]
    pub outbox_cleanup_interval_secs: u64,

    #[serde(default = "default_recovery_interval_ms")]
    pub recovery_interval_ms: u64,
    #[serde(default = "default_recovery_stale_after_ms")]
    pub recovery_stale_after_ms: u64,

    #[serde(default = "default_server_port")]
    pub server_port: u16,
}

fn default_notification_queue() -> String {
    "notifications".to_string()
}

fn default_outbox_queue() -> String {
    "notification_events".to_string()
}

fn default_prefetch_count() -> u16 {
    10
}

fn default_smtp_host() -> String {
    "localhost".to_string()
}

fn default_smtp_port() -> u16 {
    25
}

fn default_smtp_helo_name() -> String {
    "localhost".to_string()
}

fn default_smtp_pool_size() -> usize {
    8
}

fn default_smtp_connect_timeout_ms() -> u64 {
    5_000
}

fn default_http_timeout_ms() -> u64 {
    10_000
}

fn default_rate_limit_per_second() -> f64 {
    10.0
}

fn default_rate_limit_burst() -> u32 {
    20
}

fn default_rate_limit_max_tenants() -> usize {
    10_000
}

fn default_max_retry_attempts() -> u32 {
    3
}

fn default_initial_retry_delay_ms() -> u64 {
    500
}

fn default_max_retry_delay_ms() -> u64 {
    30_000
}

fn default_retry_backoff_multiplier() -> u64 {
    2
}

fn default_worker_concurrency() -> usize {
    4
}

fn default_send_timeout_ms() -> u64 {
    15_000
}

fn default_consumer_base_backoff_ms() -> u64 {
    1_000
}

fn default_consumer_max_backoff_ms() -> u64 {
    60_000
}

fn default_message_timeout_ms() -> u64 {
    30_000
}

fn default_admission_backoff_ms() -> u64 {
    1_000
}

fn default_outbox_poll_interval_ms() -> u64 {
    1_000
}

fn default_outbox_batch_size() -> usize {
    100
}

fn default_outbox_retention_days() -> u32 {
    7
}

fn default_outbox_cleanup_interval_secs() -> u64 {
    3_600
}

fn default_recovery_interval_ms() -> u64 {
    30_000
}

fn default_recovery_stale_after_ms() -> u64 {
    60_000
}

fn default_server_port() -> u16 {
    8080
}

impl Config {
    pub fn load() -> Result<Self, Error> {
        dotenv().ok();

        let config = envy::from_env::<Self>()
            .map_err(|e| anyhow!("Invalid or missing environmental variable: {}", e))?;

        if config.store_backend == StoreBackend::Postgres && config.database_url.is_none() {
            return Err(anyhow!("DATABASE_URL is required when STORE_BACKEND=postgres"));
        }

        if config.smtp_username.is_some() != config.smtp_password.is_some() {
            return Err(anyhow!("SMTP_USERNAME and SMTP_PASSWORD must be set together"));
        }

        Ok(config)
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.max_retry_attempts,
            initial_delay_ms: self.initial_retry_delay_ms,
            max_delay_ms: self.max_retry_delay_ms,
            backoff_multiplier: self.retry_backoff_multiplier,
        }
    }

    pub fn rate_limiter_config(&self) -> RateLimiterConfig {
        RateLimiterConfig {
            rate: self.rate_limit_per_second,
            burst: self.rate_limit_burst,
            max_tenants: self.rate_limit_max_tenants,
        }
    }

    pub fn consumer_config(&self) -> ConsumerConfig {
        ConsumerConfig {
            base_backoff: Duration::from_millis(self.consumer_base_backoff_ms),
            max_backoff: Duration::from_millis(self.consumer_max_backoff_ms),
            message_timeout: Duration::from_millis(self.message_timeout_ms),
            admission_backoff: Duration::from_millis(self.admission_backoff_ms),
        }
    }

    pub fn relay_config(&self) -> RelayConfig {
        RelayConfig {
            poll_interval: Duration::from_millis(self.outbox_poll_interval_ms),
            batch_size: self.outbox_batch_size,
            retention_days: self.outbox_retention_days,
            cleanup_interval: Duration::from_secs(self.outbox_cleanup_interval_secs),
            ..RelayConfig::default()
        }
    }

    pub fn recovery_config(&self) -> RecoveryConfig {
        RecoveryConfig {
            interval: Duration::from_millis(self.recovery_interval_ms),
            stale_after: Duration::from_millis(self.recovery_stale_after_ms),
            ..RecoveryConfig::default()
        }
    }

    pub fn smtp_connector(&self) -> SmtpConnector {
        SmtpConnector {
            host: self.smtp_host.clone(),
            port: self.smtp_port,
            helo_name: self.smtp_helo_name.clone(),
            connect_timeout: Duration::from_millis(self.smtp_connect_timeout_ms),
            security: self.smtp_security,
            auth: match (&self.smtp_username, &self.smtp_password) {
                (Some(username), Some(password)) => Some(SmtpAuth {
                    username: username.clone(),
                    password: password.clone(),
                }),
                _ => None,
            },
        }
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_millis(self.http_timeout_ms)
    }
}
