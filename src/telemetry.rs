//! Logging setup for the command-line tool.
//!
//! The library only emits `tracing` events; installing a subscriber is up to
//! the binary. `RUST_LOG` overrides the level given here.

use tracing::Level;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

/// Output format of the log subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human readable, one line per event.
    #[default]
    Compact,
    /// One JSON object per event.
    Json,
}

/// Filter used when `RUST_LOG` is unset: `level` for this crate, warnings
/// from everything else.
pub fn default_filter(level: Level) -> String {
    format!("gitxa={},warn", level)
}

/// Install a global subscriber writing to stderr.
///
/// Fails if a subscriber is already installed.
pub fn init_logging(level: Level, format: LogFormat) -> Result<(), Box<dyn std::error::Error>> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter(level)));
    let registry = Registry::default().with(env_filter);

    match format {
        LogFormat::Compact => registry
            .with(
                fmt::layer()
                    .compact()
                    .with_writer(std::io::stderr)
                    .with_target(false),
            )
            .try_init()?,
        LogFormat::Json => registry
            .with(
                fmt::layer()
                    .json()
                    .with_writer(std::io::stderr)
                    .with_target(true)
                    .with_thread_ids(true),
            )
            .try_init()?,
    }
    Ok(())
}
