//! Logger setup for binaries and tests.
//!
//! The library only emits through the `log` facade. Applications that do not
//! install a logger of their own can call [`init`].

use log::LevelFilter;

/// Environment variable that overrides the level passed to [`init`].
pub const LOG_ENV: &str = "DUPERAGENT_LOG";

/// Installs `env_logger` with `level` for this crate's messages.
///
/// `RUST_LOG` and `DUPERAGENT_LOG` still take precedence. Calling this more
/// than once is harmless.
pub fn init(level: LevelFilter) {
    let mut builder = env_logger::Builder::new();
    builder.filter_module(env!("CARGO_CRATE_NAME"), level);

    if let Ok(filters) = std::env::var("RUST_LOG") {
        builder.parse_filters(&filters);
    }
    if let Ok(filters) = std::env::var(LOG_ENV) {
        builder.parse_filters(&filters);
    }

    if builder.try_init().is_err() {
        log::debug!("Logger already installed");
    }
}
