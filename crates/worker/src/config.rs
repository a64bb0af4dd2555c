use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use beacon_events::realtime::RealtimeConfig;

/// Worker configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub database_url: String,
    pub realtime: RealtimeConfig,
    /// Time between digest sweeps.
    pub digest_interval: Duration,
    /// How long each background task gets to stop after a shutdown signal.
    pub shutdown_timeout: Duration,
}

impl WorkerConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                  | Default    |
    /// |--------------------------|------------|
    /// | `DATABASE_URL`           | (required) |
    /// | `REALTIME_BASE_DELAY_MS` | `1000`     |
    /// | `REALTIME_MAX_ATTEMPTS`  | `5`        |
    /// | `DIGEST_INTERVAL_SECS`   | `3600`     |
    /// | `SHUTDOWN_TIMEOUT_SECS`  | `5`        |
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let database_url = lookup("DATABASE_URL").context("DATABASE_URL must be set")?;
        let base_delay_ms: u64 = parse_or(&lookup, "REALTIME_BASE_DELAY_MS", 1000)?;
        let max_attempts: u32 = parse_or(&lookup, "REALTIME_MAX_ATTEMPTS", 5)?;
        let digest_interval_secs: u64 = parse_or(&lookup, "DIGEST_INTERVAL_SECS", 3600)?;
        let shutdown_timeout_secs: u64 = parse_or(&lookup, "SHUTDOWN_TIMEOUT_SECS", 5)?;

        Ok(Self {
            database_url,
            realtime: RealtimeConfig {
                base_delay: Duration::from_millis(base_delay_ms),
                max_attempts,
            },
            digest_interval: Duration::from_secs(digest_interval_secs),
            shutdown_timeout: Duration::from_secs(shutdown_timeout_secs),
        })
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, name: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{name} must be a valid number, got {raw:?}")),
        None => Ok(default),
    }
}
