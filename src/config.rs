//! Serializable limiter configuration.

use crate::leaker::DEFAULT_LEAK_INTERVAL;
use crate::rate::{validate_rate_list, Rate};
use crate::LimiterError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default wait padding added to every computed delay.
pub const DEFAULT_BUFFER_MS: u64 = 50;

/// Rates and acquisition policies, loadable from JSON and the environment.
///
/// ```
/// use ratewindow::LimiterConfig;
/// let config = LimiterConfig::from_json(r#"{
///     "rates": [{"limit": 5, "interval": 1000}, {"limit": 100, "interval": 60000}],
///     "max_delay_ms": 2000
/// }"#).unwrap();
/// assert_eq!(config.rates.len(), 2);
/// assert_eq!(config.buffer_ms, 50);
/// assert!(!config.raise_when_fail);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimiterConfig {
    pub rates: Vec<Rate>,
    pub raise_when_fail: bool,
    /// `None` waits as long as the bucket requires.
    pub max_delay_ms: Option<u64>,
    pub retry_until_max_delay: bool,
    pub buffer_ms: u64,
    pub leak_interval_ms: u64,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            rates: Vec::new(),
            raise_when_fail: false,
            max_delay_ms: None,
            retry_until_max_delay: false,
            buffer_ms: DEFAULT_BUFFER_MS,
            leak_interval_ms: DEFAULT_LEAK_INTERVAL.as_millis() as u64,
        }
    }
}

impl LimiterConfig {
    pub fn from_json(json: &str) -> Result<Self, LimiterError> {
        serde_json::from_str(json).map_err(|e| LimiterError::invalid(format!("limiter config: {}", e)))
    }

    pub fn to_json(&self) -> Result<String, LimiterError> {
        serde_json::to_string_pretty(self).map_err(|e| LimiterError::invalid(e.to_string()))
    }

    /// Apply `RATEWINDOW_*` environment overrides.
    pub fn with_env_overrides(self) -> Result<Self, LimiterError> {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    fn with_overrides(mut self, get: impl Fn(&str) -> Option<String>) -> Result<Self, LimiterError> {
        if let Some(v) = get("RATEWINDOW_MAX_DELAY_MS") {
            self.max_delay_ms = Some(parse(&v, "RATEWINDOW_MAX_DELAY_MS")?);
        }
        if let Some(v) = get("RATEWINDOW_BUFFER_MS") {
            self.buffer_ms = parse(&v, "RATEWINDOW_BUFFER_MS")?;
        }
        if let Some(v) = get("RATEWINDOW_LEAK_INTERVAL_MS") {
            self.leak_interval_ms = parse(&v, "RATEWINDOW_LEAK_INTERVAL_MS")?;
        }
        if let Some(v) = get("RATEWINDOW_RAISE_WHEN_FAIL") {
            self.raise_when_fail = parse_bool(&v, "RATEWINDOW_RAISE_WHEN_FAIL")?;
        }
        if let Some(v) = get("RATEWINDOW_RETRY_UNTIL_MAX_DELAY") {
            self.retry_until_max_delay = parse_bool(&v, "RATEWINDOW_RETRY_UNTIL_MAX_DELAY")?;
        }
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), LimiterError> {
        validate_rate_list(&self.rates)?;
        if self.leak_interval_ms == 0 {
            return Err(LimiterError::invalid("leak_interval_ms must be > 0"));
        }
        Ok(())
    }

    pub fn max_delay(&self) -> Option<Duration> {
        self.max_delay_ms.map(Duration::from_millis)
    }

    pub fn buffer(&self) -> Duration {
        Duration::from_millis(self.buffer_ms)
    }

    pub fn leak_interval(&self) -> Duration {
        Duration::from_millis(self.leak_interval_ms)
    }
}

fn parse(value: &str, key: &str) -> Result<u64, LimiterError> {
    value
        .trim()
        .parse()
        .map_err(|_| LimiterError::invalid(format!("{} must be a non-negative integer (got {:?})", key, value)))
}

fn parse_bool(value: &str, key: &str) -> Result<bool, LimiterError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(LimiterError::invalid(format!("{} must be a boolean (got {:?})", key, value))),
    }
}
