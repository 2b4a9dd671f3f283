//! Logging initialization.

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, EnvFilter, Registry};

use crate::settings::LoggingConfig;

/// Initialize logging; `RUST_LOG` wins over the configured level.
pub fn init(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))?;

    if config.format == "json" {
        init_json(filter)
    } else {
        init_console(filter)
    }
}

fn init_json(filter: EnvFilter) -> Result<()> {
    let subscriber = Registry::default()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().json().with_current_span(true));

    tracing::subscriber::set_global_default(subscriber)?;
    tracing::info!("JSON logging initialized");
    Ok(())
}

fn init_console(filter: EnvFilter) -> Result<()> {
    let subscriber = Registry::default()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false));

    tracing::subscriber::set_global_default(subscriber)?;
    tracing::info!("Console logging initialized");
    Ok(())
}
