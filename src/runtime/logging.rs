//! Logging setup
//!
//! Installs a `tracing-subscriber` fmt subscriber. `VIBE_SCOPE_LOG` takes
//! precedence over the configured level and directives.

use crate::error::{Result, VibeError};
use tracing_subscriber::EnvFilter;

pub const LOG_ENV: &str = "VIBE_SCOPE_LOG";

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// trace, debug, info, warn, error or off
    pub level: String,
    /// Extra `target=level` directives, e.g. `vibe_scope::core=trace`
    pub directives: Vec<String>,
    pub ansi: bool,
    pub with_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            directives: Vec::new(),
            ansi: true,
            with_target: true,
        }
    }
}

impl LoggingConfig {
    pub fn new(level: impl Into<String>) -> Self {
        Self {
            level: level.into(),
            ..Default::default()
        }
    }

    pub fn with_directive(mut self, directive: impl Into<String>) -> Self {
        self.directives.push(directive.into());
        self
    }

    pub fn with_ansi(mut self, ansi: bool) -> Self {
        self.ansi = ansi;
        self
    }

    pub fn with_target(mut self, with_target: bool) -> Self {
        self.with_target = with_target;
        self
    }
}

/// Installs the global subscriber. Fails if one is already installed.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let filter = build_env_filter(config)?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(config.ansi)
        .with_target(config.with_target)
        .try_init()
        .map_err(|e| VibeError::Runtime(format!("Failed to install logger: {}", e)))
}

pub(crate) fn build_env_filter(config: &LoggingConfig) -> Result<EnvFilter> {
    if let Ok(filter) = EnvFilter::try_from_env(LOG_ENV) {
        return Ok(filter);
    }

    let mut filter = EnvFilter::try_new(&config.level).map_err(|e| {
        VibeError::Configuration(format!("Invalid log level '{}': {}", config.level, e))
    })?;
    for directive in &config.directives {
        filter = filter.add_directive(directive.parse().map_err(|e| {
            VibeError::Configuration(format!("Invalid log directive '{}': {}", directive, e))
        })?);
    }
    Ok(filter)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_builder() {
        let config = LoggingConfig::new("debug")
            .with_directive("vibe_scope::core=trace")
            .with_ansi(false)
            .with_target(false);

        assert_eq!(config.level, "debug");
        assert_eq!(config.directives, vec!["vibe_scope::core=trace".to_string()]);
        assert!(!config.ansi);
        assert!(!config.with_target);
    }

    #[test]
    fn test_invalid_directive_rejected() {
        if std::env::var(LOG_ENV).is_ok() {
            return;
        }
        let config = LoggingConfig::default().with_directive("vibe_scope=loud");
        assert!(build_env_filter(&config).unwrap_err().is_configuration());
        assert!(build_env_filter(&LoggingConfig::new("warn")).is_ok());
    }
}
