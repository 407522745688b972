//! Configuration for breakers, rate limiters and logging.
//!
//! Every section deserializes with defaults, so an empty JSON object is a
//! valid configuration. [`ShieldConfig::from_env`] layers `RPCSHIELD_*`
//! environment variables on top of the defaults.

use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::telemetry::LogConfig;

pub const ENV_RATE_LIMIT_RPS: &str = "RPCSHIELD_RATE_LIMIT_RPS";
pub const ENV_RATE_LIMIT_BURST: &str = "RPCSHIELD_RATE_LIMIT_BURST";
pub const ENV_RATE_LIMIT_STALE_SECS: &str = "RPCSHIELD_RATE_LIMIT_STALE_SECS";
pub const ENV_BREAKER_FAILURE_THRESHOLD: &str = "RPCSHIELD_BREAKER_FAILURE_THRESHOLD";
pub const ENV_BREAKER_RESET_TIMEOUT_SECS: &str = "RPCSHIELD_BREAKER_RESET_TIMEOUT_SECS";
pub const ENV_LOG_LEVEL: &str = "RPCSHIELD_LOG_LEVEL";
pub const ENV_LOG_JSON: &str = "RPCSHIELD_LOG_JSON";

/// Configuration for a circuit breaker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Number of consecutive failures before opening.
    pub failure_threshold: u32,
    /// How long to stay open before admitting a half-open trial call.
    #[serde(with = "duration_secs")]
    pub reset_timeout: Duration,
    /// Consecutive half-open successes required to close again.
    pub success_threshold: u32,
    /// Deadline for the protected operation. Expiry counts as a failure.
    #[serde(with = "opt_duration_secs", skip_serializing_if = "Option::is_none")]
    pub call_timeout: Option<Duration>,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(60),
            success_threshold: 3,
            call_timeout: None,
        }
    }
}

impl CircuitBreakerConfig {
    /// Preset for database dependencies: trips early, recovers quickly.
    pub fn database() -> Self {
        Self {
            failure_threshold: 3,
            reset_timeout: Duration::from_secs(30),
            ..Self::default()
        }
    }

    /// Preset for third-party services.
    pub fn external_service() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(60),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.failure_threshold == 0 {
            return Err(ConfigError::Invalid {
                field: "circuit_breaker.failure_threshold",
                reason: "must be greater than zero".into(),
            });
        }
        if self.success_threshold == 0 {
            return Err(ConfigError::Invalid {
                field: "circuit_breaker.success_threshold",
                reason: "must be greater than zero".into(),
            });
        }
        if self.call_timeout == Some(Duration::ZERO) {
            return Err(ConfigError::Invalid {
                field: "circuit_breaker.call_timeout",
                reason: "must be non-zero when set".into(),
            });
        }
        Ok(())
    }
}

/// Limits for one bucket: sustained rate and burst size.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MethodLimit {
    /// Tokens added per second.
    pub rps: f64,
    /// Bucket capacity.
    pub burst: f64,
}

impl MethodLimit {
    pub fn new(rps: f64, burst: f64) -> Self {
        Self { rps, burst }
    }

    fn validate(&self, field: &'static str) -> Result<(), ConfigError> {
        if !self.burst.is_finite() || self.burst <= 0.0 {
            return Err(ConfigError::Invalid {
                field,
                reason: format!("burst must be a positive number, got {}", self.burst),
            });
        }
        if !self.rps.is_finite() || self.rps < 0.0 {
            return Err(ConfigError::Invalid {
                field,
                reason: format!("rps must be a non-negative number, got {}", self.rps),
            });
        }
        Ok(())
    }
}

/// Configuration for keyed (client × method) rate limiting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Default sustained rate per bucket.
    pub requests_per_second: f64,
    /// Default bucket capacity.
    pub burst_capacity: f64,
    /// Buckets idle for longer than this are evicted by cleanup.
    #[serde(with = "duration_secs")]
    pub stale_after: Duration,
    /// Minimum spacing between lazy cleanup passes.
    #[serde(with = "duration_secs")]
    pub cleanup_interval: Duration,
    /// Overrides keyed by bare method name (the last `/` segment).
    pub method_limits: HashMap<String, MethodLimit>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_second: 100.0,
            burst_capacity: 200.0,
            stale_after: Duration::from_secs(300),
            cleanup_interval: Duration::from_secs(300),
            method_limits: HashMap::new(),
        }
    }
}

impl RateLimitConfig {
    /// Default limit applied to methods without an override.
    pub fn default_limit(&self) -> MethodLimit {
        MethodLimit::new(self.requests_per_second, self.burst_capacity)
    }

    /// Add or replace a per-method override.
    pub fn with_method_limit(mut self, method: impl Into<String>, limit: MethodLimit) -> Self {
        self.method_limits.insert(method.into(), limit);
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.default_limit().validate("rate_limit")?;
        for limit in self.method_limits.values() {
            limit.validate("rate_limit.method_limits")?;
        }
        if self.cleanup_interval.is_zero() {
            return Err(ConfigError::Invalid {
                field: "rate_limit.cleanup_interval",
                reason: "must be non-zero".into(),
            });
        }
        Ok(())
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShieldConfig {
    pub circuit_breaker: CircuitBreakerConfig,
    pub rate_limit: RateLimitConfig,
    pub log: LogConfig,
}

impl ShieldConfig {
    /// Parse a JSON document. Missing fields take their defaults.
    pub fn from_json_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a JSON file, then apply environment overrides.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let mut config: Self = serde_json::from_str(&content)?;
        config.apply_env(|k| std::env::var(k).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults with environment overrides applied.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env(|k| std::env::var(k).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from a variable lookup function.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = parse_var::<f64, _>(&lookup, ENV_RATE_LIMIT_RPS)? {
            self.rate_limit.requests_per_second = v;
        }
        if let Some(v) = parse_var::<f64, _>(&lookup, ENV_RATE_LIMIT_BURST)? {
            self.rate_limit.burst_capacity = v;
        }
        if let Some(v) = parse_var::<u64, _>(&lookup, ENV_RATE_LIMIT_STALE_SECS)? {
            self.rate_limit.stale_after = Duration::from_secs(v);
        }
        if let Some(v) = parse_var::<u32, _>(&lookup, ENV_BREAKER_FAILURE_THRESHOLD)? {
            self.circuit_breaker.failure_threshold = v;
        }
        if let Some(v) = parse_var::<f64, _>(&lookup, ENV_BREAKER_RESET_TIMEOUT_SECS)? {
            self.circuit_breaker.reset_timeout = secs_to_duration(v).ok_or(ConfigError::Env {
                var: ENV_BREAKER_RESET_TIMEOUT_SECS,
                value: v.to_string(),
            })?;
        }
        if let Some(level) = lookup(ENV_LOG_LEVEL) {
            self.log.level = level.to_lowercase();
        }
        if let Some(v) = parse_var::<bool, _>(&lookup, ENV_LOG_JSON)? {
            self.log.json = v;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.circuit_breaker.validate()?;
        self.rate_limit.validate()
    }
}

fn parse_var<T, F>(lookup: &F, var: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(var) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::Env { var, value: raw }),
    }
}

fn secs_to_duration(secs: f64) -> Option<Duration> {
    Duration::try_from_secs_f64(secs).ok()
}

/// Serialize a `Duration` as fractional seconds.
mod duration_secs {
    use std::time::Duration;

    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        super::secs_to_duration(secs)
            .ok_or_else(|| D::Error::custom(format!("invalid duration: {secs} seconds")))
    }
}

mod opt_duration_secs {
    use std::time::Duration;

    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_some(&d.as_secs_f64()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        match Option::<f64>::deserialize(d)? {
            None => Ok(None),
            Some(secs) => super::secs_to_duration(secs)
                .map(Some)
                .ok_or_else(|| D::Error::custom(format!("invalid duration: {secs} seconds"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_gives_defaults() {
        let config = ShieldConfig::from_json_str("{}").unwrap();
        assert_eq!(config, ShieldConfig::default());
        assert_eq!(config.circuit_breaker.success_threshold, 3);
        assert_eq!(config.rate_limit.stale_after, Duration::from_secs(300));
    }

    #[test]
    fn parses_durations_and_method_limits() {
        let config = ShieldConfig::from_json_str(
            r#"{
                "circuit_breaker": { "failure_threshold": 3, "reset_timeout": 1.5, "call_timeout": 0.25 },
                "rate_limit": { "method_limits": { "CreateExample": { "rps": 10, "burst": 20 } } }
            }"#,
        )
        .unwrap();
        assert_eq!(config.circuit_breaker.failure_threshold, 3);
        assert_eq!(config.circuit_breaker.reset_timeout, Duration::from_millis(1500));
        assert_eq!(config.circuit_breaker.call_timeout, Some(Duration::from_millis(250)));
        assert_eq!(
            config.rate_limit.method_limits["CreateExample"],
            MethodLimit::new(10.0, 20.0)
        );
    }

    #[test]
    fn rejects_zero_threshold() {
        let err = ShieldConfig::from_json_str(r#"{"circuit_breaker": {"failure_threshold": 0}}"#)
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }), "{err}");
    }

    #[test]
    fn rejects_negative_duration() {
        let err = ShieldConfig::from_json_str(r#"{"circuit_breaker": {"reset_timeout": -1}}"#)
            .unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)), "{err}");
    }

    #[test]
    fn rejects_zero_capacity() {
        let err = ShieldConfig::from_json_str(r#"{"rate_limit": {"burst_capacity": 0}}"#)
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }), "{err}");
    }

    #[test]
    fn env_overrides() {
        let env: HashMap<&str, &str> = [
            (ENV_RATE_LIMIT_RPS, "5"),
            (ENV_RATE_LIMIT_BURST, "10"),
            (ENV_BREAKER_FAILURE_THRESHOLD, "3"),
            (ENV_BREAKER_RESET_TIMEOUT_SECS, "30"),
            (ENV_LOG_LEVEL, "DEBUG"),
            (ENV_LOG_JSON, "true"),
        ]
        .into_iter()
        .collect();

        let mut config = ShieldConfig::default();
        config
            .apply_env(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.rate_limit.requests_per_second, 5.0);
        assert_eq!(config.rate_limit.burst_capacity, 10.0);
        assert_eq!(config.circuit_breaker.failure_threshold, 3);
        assert_eq!(config.circuit_breaker.reset_timeout, Duration::from_secs(30));
        assert_eq!(config.log.level, "debug");
        assert!(config.log.json);
    }

    #[test]
    fn env_parse_failure() {
        let mut config = ShieldConfig::default();
        let err = config
            .apply_env(|k| (k == ENV_RATE_LIMIT_RPS).then(|| "fast".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Env { var: ENV_RATE_LIMIT_RPS, .. }));
    }

    #[test]
    fn round_trips_through_json() {
        let config = ShieldConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        assert_eq!(ShieldConfig::from_json_str(&json).unwrap(), config);
    }
}
