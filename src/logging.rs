//! Tracing subscriber setup.
//!
//! The configured level applies everywhere; each listed subsystem is
//! raised to debug on top of it. `RUST_LOG`, when set, replaces both.

use tracing_subscriber::util::TryInitError;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LogConfig;

/// Subsystems that map onto this crate's modules.
pub const SUBSYSTEMS: [&str; 5] = ["cluster", "upstream", "rebalance", "node", "health"];

/// Builds the filter directive string, e.g. `info,burrow::rebalance=debug`.
///
/// Known subsystem names are scoped to this crate; anything else is taken
/// as a tracing target as is, so `hyper` enables debug for that crate.
pub fn filter_directives(config: &LogConfig) -> String {
    let mut directives = vec![config.level.clone()];
    for subsystem in &config.subsystems {
        let subsystem = subsystem.trim();
        if subsystem.is_empty() {
            continue;
        }
        if SUBSYSTEMS.contains(&subsystem) {
            directives.push(format!("burrow::{}=debug", subsystem));
        } else {
            directives.push(format!("{}=debug", subsystem));
        }
    }
    directives.join(",")
}

fn env_filter(config: &LogConfig) -> EnvFilter {
    match std::env::var(EnvFilter::DEFAULT_ENV) {
        Ok(directives) if !directives.is_empty() => EnvFilter::new(directives),
        _ => EnvFilter::new(filter_directives(config)),
    }
}

/// Installs the global subscriber.
pub fn init(config: &LogConfig) -> Result<(), TryInitError> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(env_filter(config))
        .try_init()
}
