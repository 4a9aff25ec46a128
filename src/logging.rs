//! `tracing` subscriber setup for binaries and tests.

use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Output format of the installed subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Filter directives (e.g. `recon_algo=debug`). Falls back to `RUST_LOG`,
    /// then to `default_directive`.
    pub directives: Option<String>,
    pub default_directive: String,
    pub format: LogFormat,
    pub ansi: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            directives: None,
            default_directive: "info".to_string(),
            format: LogFormat::Text,
            ansi: true,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LogSetupError {
    #[error("invalid tracing directive: {0}")]
    InvalidFilter(String),
    #[error("failed to install global tracing subscriber: {0}")]
    SubscriberInit(#[from] tracing_subscriber::util::TryInitError),
}

impl LogConfig {
    fn resolve_filter(&self) -> Result<EnvFilter, LogSetupError> {
        match &self.directives {
            Some(directives) => {
                EnvFilter::try_new(directives).map_err(|e| LogSetupError::InvalidFilter(e.to_string()))
            }
            None => Ok(EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&self.default_directive))),
        }
    }
}

/// Install a global subscriber. Fails if one is already installed.
pub fn init_tracing(config: &LogConfig) -> Result<(), LogSetupError> {
    let filter = config.resolve_filter()?;
    let builder = fmt().with_env_filter(filter).with_target(true);
    match config.format {
        LogFormat::Text => builder.with_ansi(config.ansi).finish().try_init()?,
        LogFormat::Json => builder.json().with_ansi(false).finish().try_init()?,
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bad_directive_is_reported() {
        let config = LogConfig {
            directives: Some("recon_algo=notalevel".to_string()),
            ..LogConfig::default()
        };
        assert!(matches!(
            config.resolve_filter(),
            Err(LogSetupError::InvalidFilter(_))
        ));
    }

    #[test]
    fn explicit_directive_is_used() {
        let config = LogConfig {
            directives: Some("recon_algo=debug".to_string()),
            ..LogConfig::default()
        };
        assert!(config.resolve_filter().is_ok());
    }
}
