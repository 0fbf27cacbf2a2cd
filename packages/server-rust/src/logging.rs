//! The `log` module: installs the process-wide `tracing` subscriber.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use muxgate_core::Module;
use serde::Deserialize;
use serde_json::Value;
use tracing::{info, warn};
use tracing_subscriber::filter::ParseError;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Registry name of the module.
pub const LOG_MODULE: &str = "log";

/// Initializes before every other module so their startup is logged.
const LOG_PRIORITY: i32 = -100;

/// Output format of the fmt layer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Compact,
    Json,
}

/// The `log` configuration section.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LogConfig {
    /// `EnvFilter` directive, e.g. `info` or `muxgate_server=debug,info`.
    pub level: String,
    pub format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::default(),
        }
    }
}

impl LogConfig {
    /// Builds the filter, preferring `RUST_LOG` when it is set.
    ///
    /// # Errors
    ///
    /// Returns an error if the effective directive does not parse.
    pub fn filter(&self) -> Result<EnvFilter, ParseError> {
        self.filter_with(std::env::var(EnvFilter::DEFAULT_ENV).ok())
    }

    fn filter_with(&self, env_override: Option<String>) -> Result<EnvFilter, ParseError> {
        match env_override {
            Some(directive) if !directive.is_empty() => EnvFilter::try_new(directive),
            _ => EnvFilter::try_new(&self.level),
        }
    }
}

/// Module that configures logging from its config section.
///
/// Without a section the module leaves logging as it found it, so an
/// embedding application can install its own subscriber.
#[derive(Debug, Default)]
pub struct LogModule {
    installed: AtomicBool,
}

impl LogModule {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether this module installed the global subscriber.
    #[must_use]
    pub fn installed(&self) -> bool {
        self.installed.load(Ordering::Acquire)
    }
}

fn install(config: &LogConfig) -> anyhow::Result<bool> {
    let registry = tracing_subscriber::registry().with(config.filter()?);
    let result = match config.format {
        LogFormat::Pretty => registry.with(fmt::layer().pretty()).try_init(),
        LogFormat::Compact => registry.with(fmt::layer().compact()).try_init(),
        LogFormat::Json => registry.with(fmt::layer().json()).try_init(),
    };
    Ok(result.is_ok())
}

#[async_trait]
impl Module for LogModule {
    fn name(&self) -> &str {
        LOG_MODULE
    }

    fn priority(&self) -> i32 {
        LOG_PRIORITY
    }

    async fn initialize(&self, config: Option<&Value>) -> anyhow::Result<()> {
        let Some(section) = config else {
            return Ok(());
        };
        let config = LogConfig::deserialize(section)?;
        if install(&config)? {
            self.installed.store(true, Ordering::Release);
            info!(level = %config.level, format = ?config.format, "logging initialized");
        } else {
            warn!("a tracing subscriber is already installed, keeping it");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use muxgate_core::is_not_implemented;
    use serde_json::json;

    use super::*;

    #[test]
    fn section_defaults() {
        let config = LogConfig::deserialize(&json!({})).unwrap();
        assert_eq!(config, LogConfig::default());
        assert_eq!(config.level, "info");
        assert_eq!(config.format, LogFormat::Pretty);
    }

    #[test]
    fn formats_parse_lowercase() {
        let config = LogConfig::deserialize(&json!({ "format": "json" })).unwrap();
        assert_eq!(config.format, LogFormat::Json);
        let config = LogConfig::deserialize(&json!({ "format": "compact" })).unwrap();
        assert_eq!(config.format, LogFormat::Compact);
        assert!(LogConfig::deserialize(&json!({ "format": "xml" })).is_err());
        assert!(LogConfig::deserialize(&json!({ "colour": true })).is_err());
    }

    #[test]
    fn env_override_wins_over_level() {
        let config = LogConfig {
            level: "muxgate=notalevel".to_string(),
            format: LogFormat::Compact,
        };
        assert!(config.filter_with(None).is_err());
        assert!(config.filter_with(Some("debug".to_string())).is_ok());
        // An empty variable counts as unset.
        assert!(config.filter_with(Some(String::new())).is_err());
    }

    #[tokio::test]
    async fn absent_section_leaves_logging_alone() {
        let module = LogModule::new();
        assert_eq!(module.name(), LOG_MODULE);
        assert_eq!(module.priority(), -100);

        module.initialize(None).await.unwrap();
        assert!(!module.installed());
    }

    #[tokio::test]
    async fn bad_section_fails_initialize() {
        let module = LogModule::new();
        assert!(module
            .initialize(Some(&json!({ "format": "yaml" })))
            .await
            .is_err());
        assert!(!module.installed());
    }

    #[tokio::test]
    async fn has_no_serve_duty() {
        let err = LogModule::new().serve().await.unwrap_err();
        assert!(is_not_implemented(&err));
    }
}
