//! Logging wiring for container events.
//!
//! The container emits structured `tracing` events under the
//! `armature_ioc` target: registrations and scope lifecycle at `debug`,
//! resolution paths at `trace`. This module installs a subscriber for
//! them with one call; anything beyond [`LogConfig`] should set up
//! `tracing-subscriber` directly.
//!
//! # Features
//!
//! - `logging` - emit events (default)
//! - `logging-json` - JSON output for the installed subscriber
//! - `logging-pretty` - colorful output for the installed subscriber
//!
//! # Example
//!
//! ```rust,ignore
//! use armature_ioc::logging::{self, LogConfig, LogFormat};
//!
//! // Container events at debug, default format:
//! logging::init();
//!
//! // Or tuned:
//! logging::init_with(LogConfig {
//!     filter: "armature_ioc=trace".into(),
//!     format: LogFormat::Compact,
//!     locations: true,
//! });
//! ```

/// Output format of the installed subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// JSON structured lines (production)
    Json,
    /// Colorful multi-line output (development)
    Pretty,
    /// Single-line output
    Compact,
}

impl Default for LogFormat {
    fn default() -> Self {
        if cfg!(feature = "logging-json") {
            Self::Json
        } else {
            Self::Pretty
        }
    }
}

/// Subscriber settings.
///
/// The default shows container events at `debug` and nothing else; use
/// [`LogConfig::verbose`] to include per-resolution traces.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Env-filter directive, e.g. `"armature_ioc=trace"` or `"info"`
    pub filter: String,
    pub format: LogFormat,
    /// Include the file and line of the emitting call site
    pub locations: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: "armature_ioc=debug".into(),
            format: LogFormat::default(),
            locations: false,
        }
    }
}

impl LogConfig {
    /// Container events down to per-resolution traces.
    pub fn verbose() -> Self {
        Self { filter: "armature_ioc=trace".into(), ..Self::default() }
    }
}

/// Install a subscriber with the default settings.
#[cfg(any(feature = "logging-json", feature = "logging-pretty"))]
pub fn init() {
    init_with(LogConfig::default());
}

/// Install a subscriber with the given settings.
#[cfg(any(feature = "logging-json", feature = "logging-pretty"))]
pub fn init_with(config: LogConfig) {
    use tracing_subscriber::EnvFilter;

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&config.filter))
        .with_file(config.locations)
        .with_line_number(config.locations)
        .with_target(true);

    match config.format {
        LogFormat::Json => {
            #[cfg(feature = "logging-json")]
            subscriber.json().init();
            // Without the json codec, fall back to the plain formatter.
            #[cfg(not(feature = "logging-json"))]
            subscriber.init();
        }
        LogFormat::Pretty => subscriber.pretty().init(),
        LogFormat::Compact => subscriber.compact().init(),
    }
}

/// No-op: installing a subscriber needs `logging-json` or
/// `logging-pretty`.
#[cfg(not(any(feature = "logging-json", feature = "logging-pretty")))]
pub fn init() {}

/// No-op: installing a subscriber needs `logging-json` or
/// `logging-pretty`.
#[cfg(not(any(feature = "logging-json", feature = "logging-pretty")))]
pub fn init_with(_config: LogConfig) {}
