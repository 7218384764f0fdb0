//! Centralised tracing initialisation for Drydock binaries.
//!
//! Call [`init_tracing`] once at program start to configure the global
//! subscriber with an `EnvFilter` and optional JSON formatting.
//!
//! Safe to call more than once; subsequent calls are silently ignored
//! (the global subscriber can only be set once per process).

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Forces JSON log lines when set to `json`, regardless of the binary's
/// `--json` flag.
pub const LOG_FORMAT_ENV: &str = "DRYDOCK_LOG_FORMAT";

/// Initialise the global tracing subscriber.
///
/// * `json` emits newline-delimited JSON log lines for log aggregation
///   pipelines. `DRYDOCK_LOG_FORMAT=json` forces this on.
/// * `level` is the default verbosity when `RUST_LOG` is not set.
///
/// Respects the `RUST_LOG` environment variable for fine-grained filtering.
///
/// Safe to call multiple times; only the first call takes effect.
pub fn init_tracing(json: bool, level: Level) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_str()));

    let format = std::env::var(LOG_FORMAT_ENV).ok();
    if json_requested(json, format.as_deref()) {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_target(false).json())
            .try_init()
            .ok();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_target(false))
            .try_init()
            .ok();
    }
}

fn json_requested(flag: bool, env_value: Option<&str>) -> bool {
    flag || matches!(env_value, Some(v) if v.eq_ignore_ascii_case("json"))
}
