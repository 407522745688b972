//! Tracing / logging initialisation.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// The `log` section of a [`ShieldConfig`](crate::ShieldConfig).
///
/// Breaker transitions and rate-limit denials are logged under the
/// `rpcshield_core` target, so `components` can raise or silence them
/// without touching the server's own levels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogConfig {
    /// Base filter level for every target; `RPCSHIELD_LOG_LEVEL` overrides it.
    #[serde(default = "info_level")]
    pub level: String,
    /// Extra levels keyed by crate or module, e.g. `rpcshield_core = "debug"`.
    #[serde(default)]
    pub components: HashMap<String, String>,
    /// One JSON object per event instead of the text formatter.
    #[serde(default)]
    pub json: bool,
}

fn info_level() -> String {
    "info".into()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: info_level(),
            components: HashMap::new(),
            json: false,
        }
    }
}

impl LogConfig {
    /// Filter directive string, e.g. `"info,rpcshield_core=debug"`.
    pub fn directives(&self) -> String {
        let mut components: Vec<_> = self.components.iter().collect();
        components.sort();

        let mut directives = self.level.clone();
        for (component, level) in components {
            directives.push_str(&format!(",{}={}", component.replace('-', "_"), level));
        }
        directives
    }
}

/// Initialise tracing with the given log config.
///
/// Returns `false` if a global subscriber was already installed, which
/// happens when several tests or embedders race to initialise.
pub fn init_tracing(config: &LogConfig) -> bool {
    let filter = EnvFilter::try_new(config.directives()).unwrap_or_else(|_| EnvFilter::new("info"));

    if config.json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .try_init()
            .is_ok()
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer())
            .try_init()
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directives_include_components_in_order() {
        let mut config = LogConfig::default();
        config.components.insert("rpcshield-core".into(), "debug".into());
        config.components.insert("cli".into(), "warn".into());
        assert_eq!(config.directives(), "info,cli=warn,rpcshield_core=debug");
    }

    #[test]
    fn partial_log_section_fills_defaults() {
        let config: LogConfig = serde_json::from_str(r#"{"json": true}"#).unwrap();
        assert_eq!(config.level, "info");
        assert!(config.components.is_empty());
        assert!(config.json);
    }

    #[test]
    fn second_init_is_reported() {
        let config = LogConfig::default();
        let _ = init_tracing(&config);
        assert!(!init_tracing(&config));
    }
}
