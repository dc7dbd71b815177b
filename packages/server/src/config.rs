use anyhow::{Context, Result};
use dotenvy::dotenv;
use std::env;
use std::str::FromStr;
use std::time::Duration;

use completion_client::RetryPolicy;

use crate::domains::admission::AdmissionPolicy;
use crate::kernel::{PoolConfig, DEFAULT_REFRESH_INTERVAL};

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub port: u16,
    pub openai_api_key: String,
    pub openai_base_url: Option<String>,
    pub openai_model: String,
    pub retrieval_url: String,
    pub stripe_secret_key: String,
    pub stripe_meter_event: String,
    /// Admin routes are disabled when unset
    pub admin_token: Option<String>,
    pub pool_max_size: usize,
    pub pool_acquire_timeout: Duration,
    pub pool_acquire_retries: u32,
    pub paid_monthly_limit: i32,
    pub overage_hard_cap: Option<i32>,
    pub trial_days: i64,
    pub trial_daily_limit: i32,
    pub subscription_refresh_interval: Duration,
    pub completion_timeout: Duration,
    pub completion_max_retries: u32,
    pub completion_retry_base_delay: Duration,
}

fn parse_or<T: FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(value) => value
            .parse()
            .with_context(|| format!("{} must be a valid number", key)),
        Err(_) => Ok(default),
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        let overage_hard_cap = match env::var("OVERAGE_HARD_CAP") {
            Ok(value) if !value.trim().is_empty() => Some(
                value
                    .parse()
                    .context("OVERAGE_HARD_CAP must be a valid number")?,
            ),
            _ => None,
        };

        Ok(Self {
            database_url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            port: parse_or("PORT", 8080)?,
            openai_api_key: env::var("OPENAI_API_KEY").context("OPENAI_API_KEY must be set")?,
            openai_base_url: env::var("OPENAI_BASE_URL").ok(),
            openai_model: env::var("OPENAI_MODEL").unwrap_or_else(|_| "gpt-4o".to_string()),
            retrieval_url: env::var("RETRIEVAL_URL").context("RETRIEVAL_URL must be set")?,
            stripe_secret_key: env::var("STRIPE_SECRET_KEY")
                .context("STRIPE_SECRET_KEY must be set")?,
            stripe_meter_event: env::var("STRIPE_METER_EVENT")
                .unwrap_or_else(|_| "assistant_questions".to_string()),
            admin_token: env::var("ADMIN_TOKEN").ok().filter(|t| !t.is_empty()),
            pool_max_size: parse_or("POOL_MAX_SIZE", 5)?,
            pool_acquire_timeout: Duration::from_secs(parse_or("POOL_ACQUIRE_TIMEOUT_SECS", 5)?),
            pool_acquire_retries: parse_or("POOL_ACQUIRE_RETRIES", 3)?,
            paid_monthly_limit: parse_or("PAID_MONTHLY_LIMIT", 500)?,
            overage_hard_cap,
            trial_days: parse_or("TRIAL_DAYS", 14)?,
            trial_daily_limit: parse_or("TRIAL_DAILY_LIMIT", 10)?,
            subscription_refresh_interval: Duration::from_secs(parse_or(
                "SUBSCRIPTION_REFRESH_INTERVAL_SECS",
                DEFAULT_REFRESH_INTERVAL.as_secs(),
            )?),
            completion_timeout: Duration::from_secs(parse_or("COMPLETION_TIMEOUT_SECS", 120)?),
            completion_max_retries: parse_or("COMPLETION_MAX_RETRIES", 3)?,
            completion_retry_base_delay: Duration::from_millis(parse_or(
                "COMPLETION_RETRY_BASE_DELAY_MS",
                500,
            )?),
        })
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            max_size: self.pool_max_size,
            acquire_timeout: self.pool_acquire_timeout,
            acquire_retries: self.pool_acquire_retries,
            ..PoolConfig::default()
        }
    }

    pub fn admission_policy(&self) -> AdmissionPolicy {
        AdmissionPolicy {
            paid_monthly_limit: self.paid_monthly_limit,
            overage_hard_cap: self.overage_hard_cap,
            trial_days: self.trial_days,
            trial_daily_limit: self.trial_daily_limit,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.completion_max_retries,
            base_delay: self.completion_retry_base_delay,
            ..RetryPolicy::default()
        }
    }
}
