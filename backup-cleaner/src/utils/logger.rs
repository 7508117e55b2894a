//! Tracing setup for processes embedding the cleaner.

use crate::config::LogConfig;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the global subscriber at `level`. `RUST_LOG` overrides it, an
/// unparsable level falls back to `info`. Fails if a subscriber is already
/// installed.
pub fn init(level: &str) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .try_init()?;

    tracing::debug!(level = %level, "Cleaner logging initialized");
    Ok(())
}

pub fn init_from_config(config: &LogConfig) -> anyhow::Result<()> {
    init(&config.level)
}
