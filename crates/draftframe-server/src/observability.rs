//! Tracing setup for the gateway binary.
//!
//! The subscriber is installed once at startup with a reloadable filter, so the level from
//! the configuration file can be applied after the file has been read. `RUST_LOG` always
//! takes precedence over the configured level.

use std::sync::OnceLock;

use tracing_subscriber::{EnvFilter, Registry, fmt, prelude::*, reload};

use crate::config::LoggingConfig;

static LOG_RELOAD_HANDLE: OnceLock<reload::Handle<EnvFilter, Registry>> = OnceLock::new();

/// Upstream HTTP plumbing logs at debug level on every hop; keep it out of the gateway's
/// own debug output.
const QUIET_TARGETS: &[(&str, &str)] = &[("hyper_util", "warn"), ("reqwest", "warn")];

/// Install the global subscriber at `info` until the configuration is loaded.
pub fn init_tracing() {
    let filter = env_filter().unwrap_or_else(|| EnvFilter::new(directives("info")));
    let (reload_layer, handle) = reload::Layer::new(filter);
    let _ = LOG_RELOAD_HANDLE.set(handle);

    let _ = tracing_subscriber::registry()
        .with(reload_layer)
        .with(fmt::layer().with_target(true))
        .try_init();
}

/// Apply the configured level to the running subscriber.
pub fn apply_logging(cfg: &LoggingConfig) {
    apply_logging_level(&cfg.level);
}

/// Change the level at runtime. Ignored when `RUST_LOG` is set or tracing is not installed.
pub fn apply_logging_level(level: &str) {
    if env_filter().is_some() {
        return;
    }
    let Some(handle) = LOG_RELOAD_HANDLE.get() else {
        return;
    };
    match handle.modify(|filter| *filter = EnvFilter::new(directives(level))) {
        Ok(()) => tracing::debug!(level, "log level applied"),
        Err(e) => tracing::warn!(error = %e, "failed to apply log level"),
    }
}

fn env_filter() -> Option<EnvFilter> {
    std::env::var("RUST_LOG")
        .ok()
        .and_then(|_| EnvFilter::try_from_default_env().ok())
}

/// Filter directives for a base level, with noisy client crates capped.
fn directives(level: &str) -> String {
    let mut out = level.to_ascii_lowercase();
    for (target, cap) in QUIET_TARGETS {
        out.push_str(&format!(",{target}={cap}"));
    }
    out
}
