//! Tracing initialisation for stagegate binaries.
//!
//! Call [`init_tracing`] once at program start. Safe to call more than
//! once — the global subscriber can only be set once per process, so later
//! calls are silently ignored.

use tracing::Level;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Initialise the global tracing subscriber.
///
/// * `json` — emit newline-delimited JSON log lines with event fields
///   flattened to the top level, for log shippers.
/// * `level` — default verbosity; `RUST_LOG` directives override it.
pub fn init_tracing(json: bool, level: Level) {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::from_level(level).into())
        .from_env_lossy();

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(fmt::layer().json().flatten_event(true))
            .try_init()
            .ok();
    } else {
        registry
            .with(fmt::layer().compact().with_target(false))
            .try_init()
            .ok();
    }
}
