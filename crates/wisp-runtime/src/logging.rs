#![forbid(unsafe_code)]

//! Subscriber setup for hosts that do not install their own.
//!
//! The filter is read from `WISP_LOG` (e.g. `WISP_LOG=wisp.rerun=debug`),
//! falling back to `info`.

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Registry, fmt};

/// Environment variable holding the filter directives.
pub const LOG_ENV_VAR: &str = "WISP_LOG";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

fn env_filter() -> EnvFilter {
    EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .with_env_var(LOG_ENV_VAR)
        .from_env_lossy()
}

/// Install the global subscriber.
///
/// Returns `false` if a global subscriber was already set.
pub fn init(format: LogFormat) -> bool {
    let registry = Registry::default().with(env_filter());
    match format {
        LogFormat::Compact => registry
            .with(fmt::layer().compact().with_target(true))
            .try_init()
            .is_ok(),
        LogFormat::Json => registry
            .with(fmt::layer().json().with_current_span(true))
            .try_init()
            .is_ok(),
    }
}
