//! Diagnostic logging.
//!
//! Stage progress goes to stdout with `println!`; everything else is a
//! `tracing` event on stderr. `RUST_LOG` overrides the level chosen from the
//! command line.

use std::env;
use std::io;
use std::sync::Once;

use tracing::Level;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static INIT: Once = Once::new();

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: Level,
    /// One JSON object per event.
    pub json: bool,
    /// Include file and line of the event.
    pub include_location: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Level::WARN,
            json: false,
            include_location: false,
        }
    }
}

impl LoggingConfig {
    /// `-v` raises the level one step per occurrence from WARN; `-q` shows
    /// errors only.
    pub fn from_flags(verbose: u8, quiet: bool, json: bool) -> Self {
        let level = if quiet {
            Level::ERROR
        } else {
            match verbose {
                0 => Level::WARN,
                1 => Level::INFO,
                2 => Level::DEBUG,
                _ => Level::TRACE,
            }
        };
        Self {
            level,
            json,
            include_location: verbose >= 3,
        }
    }
}

/// Filter directives for `config` when `RUST_LOG` is unset.
pub fn default_directives(config: &LoggingConfig) -> String {
    let level = config.level.as_str().to_lowercase();
    format!("warn,sonjayos_provision={level},sonjayos={level},reqwest=warn,hyper=warn")
}

/// Install the global subscriber. Later calls are ignored.
pub fn init(config: LoggingConfig) {
    INIT.call_once(|| {
        let filter = match env::var("RUST_LOG") {
            Ok(spec) if !spec.trim().is_empty() => EnvFilter::new(spec),
            _ => EnvFilter::new(default_directives(&config)),
        };

        let registry = tracing_subscriber::registry().with(filter);
        let result = if config.json {
            registry
                .with(
                    fmt::layer()
                        .json()
                        .with_writer(io::stderr)
                        .with_file(config.include_location)
                        .with_line_number(config.include_location),
                )
                .try_init()
        } else {
            registry
                .with(
                    fmt::layer()
                        .with_writer(io::stderr)
                        .with_target(false)
                        .with_file(config.include_location)
                        .with_line_number(config.include_location),
                )
                .try_init()
        };
        if let Err(err) = result {
            eprintln!("logging already initialized: {err}");
        }
    });
}
