//! Tracing subscriber setup
//!
//! Call [`init_tracing`] once at program start. `RUST_LOG` takes precedence
//! over the configured level; JSON output is for log aggregation pipelines.

use anyhow::Context;
use ticketline_domain::LoggingConfig;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Install the global subscriber.
///
/// # Errors
///
/// Fails when the configured level is not a valid filter directive or a
/// global subscriber is already installed.
pub fn init_tracing(config: &LoggingConfig) -> anyhow::Result<()> {
    let filter = build_filter(config)?;
    let registry = tracing_subscriber::registry().with(filter);

    if config.json {
        registry
            .with(fmt::layer().with_target(true).json())
            .try_init()
            .context("global tracing subscriber already installed")
    } else {
        registry
            .with(fmt::layer().with_target(true))
            .try_init()
            .context("global tracing subscriber already installed")
    }
}

fn build_filter(config: &LoggingConfig) -> anyhow::Result<EnvFilter> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(&config.level)
            .with_context(|| format!("invalid log level {:?}", config.level)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_malformed_level() {
        if std::env::var_os("RUST_LOG").is_some() {
            return;
        }
        let config = LoggingConfig { level: "ticketline=loud".into(), json: false };
        assert!(build_filter(&config).is_err());

        let config = LoggingConfig { level: "ticketline_core=debug,warn".into(), json: true };
        assert!(build_filter(&config).is_ok());
    }

    #[test]
    fn second_install_fails() {
        let config = LoggingConfig { level: "warn".into(), json: false };
        init_tracing(&config).ok();
        assert!(init_tracing(&config).is_err());
    }
}
