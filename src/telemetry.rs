//! Tracing subscriber setup.
//!
//! Filtering follows `RUST_LOG` and defaults to `info`. Logs go to stderr so
//! command output on stdout stays machine-readable.

use tracing_subscriber::EnvFilter;

/// Install the global subscriber. `json` switches to one JSON object per
/// line. Calling this twice is harmless.
pub fn init(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    let _ = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
}
