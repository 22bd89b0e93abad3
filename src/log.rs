//! Structured logging setup.
//!
//! Log levels:
//! - ERROR: a query could not finish normally (scheduler aborted, sink failed)
//! - WARN: recoverable trouble (retries, failed tasks, flagged consensus)
//! - INFO: query and task lifecycle
//! - DEBUG: dispatch, delivery, and worker traces
//!
//! Debug mode can be enabled with `debug = true` in the `[log]` section or
//! the `CONCLAVE_DEBUG=1` env var. `RUST_LOG` overrides both.

use crate::config::LogConfig;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEBUG_ENV: &str = "CONCLAVE_DEBUG";

fn env_debug() -> bool {
    std::env::var(DEBUG_ENV)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

/// Filter directive used when `RUST_LOG` is not set.
pub fn default_directive(debug: bool) -> &'static str {
    if debug {
        "conclave=debug"
    } else {
        "conclave=info"
    }
}

fn env_filter(debug: bool) -> EnvFilter {
    let debug = debug || env_debug();
    EnvFilter::new(std::env::var("RUST_LOG").unwrap_or_else(|_| default_directive(debug).into()))
}

/// Install a human-readable subscriber. Does nothing if a global subscriber
/// is already set.
pub fn init(debug: bool) {
    let _ = tracing_subscriber::registry()
        .with(env_filter(debug))
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}

/// Install a subscriber that emits JSON lines.
pub fn init_json(debug: bool) {
    let _ = tracing_subscriber::registry()
        .with(env_filter(debug))
        .with(tracing_subscriber::fmt::layer().json())
        .try_init();
}

pub fn init_from_config(config: &LogConfig) {
    if config.json {
        init_json(config.debug);
    } else {
        init(config.debug);
    }
}
