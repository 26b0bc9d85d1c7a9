//! Worker configuration, read from the environment.

use std::time::Duration;

use courier_infra::jobs::{DEFAULT_PREFIX, LeaseSettings};

/// Brevo keys start with this prefix; anything else is treated as a placeholder.
const BREVO_KEY_PREFIX: &str = "xkeysib-";
const BREVO_KEY_MIN_LEN: usize = 50;

/// An environment variable holds a value the worker cannot use.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {name}: {reason}")]
    Invalid { name: String, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrevoConfig {
    pub api_key: String,
    pub sender_name: String,
    pub sender_email: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    pub app_env: String,
    pub redis_url: String,
    pub queue_prefix: String,
    /// Job history lives in memory when unset
    pub database_url: Option<String>,
    pub backend_url: String,
    /// Emails are logged instead of sent when unset
    pub brevo: Option<BrevoConfig>,
    pub email_concurrency: usize,
    pub user_sync_concurrency: usize,
    pub poll_interval: Duration,
    pub lease: LeaseSettings,
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable source. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let app_env = var("APP_ENV").unwrap_or_else(|| "development".to_string());

        let redis_url = match var("REDIS_URL") {
            Some(url) => url,
            None => {
                let host = var("REDIS_HOST").unwrap_or_else(|| "localhost".to_string());
                let port: u16 = parse(&var, "REDIS_PORT", 6379)?;
                let db: u32 = parse(&var, "REDIS_DB", 0)?;
                match var("REDIS_PASSWORD") {
                    Some(password) => format!("redis://:{password}@{host}:{port}/{db}"),
                    None => format!("redis://{host}:{port}/{db}"),
                }
            }
        };

        let brevo = match var("BREVO_API_KEY") {
            Some(api_key) if is_plausible_brevo_key(&api_key) => Some(BrevoConfig {
                api_key,
                sender_name: var("BREVO_SENDER_NAME").unwrap_or_else(|| "Courier".to_string()),
                sender_email: var("BREVO_SENDER_EMAIL")
                    .unwrap_or_else(|| "noreply@example.com".to_string()),
            }),
            Some(_) => {
                tracing::warn!(
                    "BREVO_API_KEY looks malformed (expected {BREVO_KEY_PREFIX}..., at least {BREVO_KEY_MIN_LEN} chars); emails will be logged, not sent"
                );
                None
            }
            None => None,
        };

        let stalled_ms: u64 = positive(&var, "STALLED_INTERVAL_MS", 30_000)?;
        let poll_ms: u64 = positive(&var, "POLL_INTERVAL_MS", 1000)?;

        Ok(Self {
            app_env,
            redis_url,
            queue_prefix: var("QUEUE_PREFIX").unwrap_or_else(|| DEFAULT_PREFIX.to_string()),
            database_url: var("DATABASE_URL"),
            backend_url: var("BACKEND_URL")
                .unwrap_or_else(|| "http://localhost:3011".to_string())
                .trim_end_matches('/')
                .to_string(),
            brevo,
            email_concurrency: parse(&var, "EMAIL_CONCURRENCY", 2)?,
            user_sync_concurrency: parse(&var, "USER_SYNC_CONCURRENCY", 1)?,
            poll_interval: Duration::from_millis(poll_ms),
            lease: LeaseSettings {
                stalled_interval: Duration::from_millis(stalled_ms),
                max_stalled_count: parse(&var, "MAX_STALLED_COUNT", 1)?,
            },
        })
    }

    pub fn is_production(&self) -> bool {
        self.app_env.eq_ignore_ascii_case("production")
    }

    /// Provider authorization failures on welcome emails are swallowed outside production.
    pub fn soft_fail_unauthorized(&self) -> bool {
        !self.is_production()
    }
}

fn is_plausible_brevo_key(key: &str) -> bool {
    key.starts_with(BREVO_KEY_PREFIX) && key.len() >= BREVO_KEY_MIN_LEN
}

fn parse<T, F>(var: &F, key: &str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match var(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e: T::Err| invalid(key, &format!("{raw:?}: {e}"))),
        None => Ok(default),
    }
}

/// Like `parse`, but zero is rejected.
fn positive<F>(var: &F, key: &str, default: u64) -> Result<u64, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match parse(var, key, default)? {
        0 => Err(invalid(key, "must be positive")),
        value => Ok(value),
    }
}

fn invalid(name: &str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        name: name.to_string(),
        reason: reason.to_string(),
    }
}
