//! Configuration management

use std::str::FromStr;

use anyhow::{Context, Result};
use chrono::{Duration, NaiveTime};

use crate::defaults;

/// How a second optimization request for a busy courier day is handled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SingleFlightPolicy {
    /// Fail immediately with a retryable conflict
    #[default]
    Reject,
    /// Queue behind the running optimization
    Wait,
}

impl FromStr for SingleFlightPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "reject" => Ok(SingleFlightPolicy::Reject),
            "wait" => Ok(SingleFlightPolicy::Wait),
            other => anyhow::bail!("unknown single-flight policy '{}' (expected reject|wait)", other),
        }
    }
}

/// Tunables for route planning and the call workflow
#[derive(Debug, Clone, PartialEq)]
pub struct PlanningConfig {
    pub lead_time_minutes: i64,
    pub retry_interval_minutes: i64,
    pub max_attempts: u32,
    pub solver_timeout_ms: u64,
    pub service_time_minutes: i64,
    pub manual_pin_epsilon_minutes: i64,
    /// Call time drift that still counts as the same reminder
    pub call_time_tolerance_minutes: i64,
    /// Used when the start location carries no start time
    pub default_start_time: NaiveTime,
}

impl Default for PlanningConfig {
    fn default() -> Self {
        Self {
            lead_time_minutes: defaults::DEFAULT_LEAD_TIME_MINUTES,
            retry_interval_minutes: defaults::DEFAULT_RETRY_INTERVAL_MINUTES,
            max_attempts: defaults::DEFAULT_MAX_ATTEMPTS,
            solver_timeout_ms: defaults::DEFAULT_SOLVER_TIMEOUT_MS,
            service_time_minutes: defaults::DEFAULT_SERVICE_TIME_MINUTES,
            manual_pin_epsilon_minutes: defaults::DEFAULT_MANUAL_PIN_EPSILON_MINUTES,
            call_time_tolerance_minutes: defaults::DEFAULT_CALL_TIME_TOLERANCE_MINUTES,
            default_start_time: defaults::default_start_time(),
        }
    }
}

impl PlanningConfig {
    pub fn lead_time(&self) -> Duration {
        Duration::minutes(self.lead_time_minutes)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::minutes(self.retry_interval_minutes)
    }

    pub fn service_time(&self) -> Duration {
        Duration::minutes(self.service_time_minutes)
    }

    pub fn pin_epsilon(&self) -> Duration {
        Duration::minutes(self.manual_pin_epsilon_minutes)
    }

    pub fn call_time_tolerance(&self) -> Duration {
        Duration::minutes(self.call_time_tolerance_minutes)
    }

    fn from_lookup(lookup: &impl Fn(&str) -> Option<String>) -> Result<Self> {
        let base = Self::default();
        let config = Self {
            lead_time_minutes: parse_or(lookup, "LEAD_TIME_MINUTES", base.lead_time_minutes)?,
            retry_interval_minutes: parse_or(lookup, "RETRY_INTERVAL_MINUTES", base.retry_interval_minutes)?,
            max_attempts: parse_or(lookup, "MAX_ATTEMPTS", base.max_attempts)?,
            solver_timeout_ms: parse_or(lookup, "SOLVER_TIMEOUT_MS", base.solver_timeout_ms)?,
            service_time_minutes: parse_or(lookup, "SERVICE_TIME_MINUTES", base.service_time_minutes)?,
            manual_pin_epsilon_minutes: parse_or(lookup, "MANUAL_PIN_EPSILON_MINUTES", base.manual_pin_epsilon_minutes)?,
            call_time_tolerance_minutes: parse_or(lookup, "CALL_TIME_TOLERANCE_MINUTES", base.call_time_tolerance_minutes)?,
            default_start_time: match lookup("DEFAULT_START_TIME") {
                Some(raw) => NaiveTime::parse_from_str(raw.trim(), "%H:%M")
                    .with_context(|| format!("DEFAULT_START_TIME must be HH:MM, got '{}'", raw))?,
                None => base.default_start_time,
            },
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            anyhow::bail!("MAX_ATTEMPTS must be at least 1");
        }
        if self.lead_time_minutes < 0
            || self.retry_interval_minutes < 0
            || self.service_time_minutes < 0
            || self.manual_pin_epsilon_minutes < 0
            || self.call_time_tolerance_minutes < 0
        {
            anyhow::bail!("planning durations must not be negative");
        }
        Ok(())
    }
}

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL connection string (in-memory storage when unset)
    pub database_url: Option<String>,

    /// NATS server URL (reminders are only logged when unset)
    pub nats_url: Option<String>,

    /// Nominatim API URL (for geocoding)
    pub nominatim_url: String,

    /// Valhalla routing engine URL (straight-line estimates when unset)
    pub valhalla_url: Option<String>,

    pub planning: PlanningConfig,

    pub scheduler_interval_seconds: u64,

    pub single_flight: SingleFlightPolicy,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present
        dotenvy::dotenv().ok();

        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let single_flight = match non_empty("SINGLE_FLIGHT") {
            Some(raw) => raw.parse().context("invalid SINGLE_FLIGHT")?,
            None => SingleFlightPolicy::default(),
        };

        let scheduler_interval_seconds = parse_or(
            &lookup,
            "SCHEDULER_INTERVAL_SECONDS",
            defaults::DEFAULT_SCHEDULER_INTERVAL_SECONDS,
        )?;
        if scheduler_interval_seconds == 0 {
            anyhow::bail!("SCHEDULER_INTERVAL_SECONDS must be at least 1");
        }

        Ok(Self {
            database_url: non_empty("DATABASE_URL"),
            nats_url: non_empty("NATS_URL"),
            nominatim_url: non_empty("NOMINATIM_URL")
                .unwrap_or_else(|| defaults::DEFAULT_NOMINATIM_URL.to_string()),
            valhalla_url: non_empty("VALHALLA_URL"),
            planning: PlanningConfig::from_lookup(&lookup)?,
            scheduler_interval_seconds,
            single_flight,
        })
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("{} has invalid value '{}': {}", key, raw, e)),
        _ => Ok(default),
    }
}
