pub use slog::{debug, error, info, o, trace, warn, Discard, Logger};

use sloggers::terminal::{Destination, TerminalLoggerBuilder};
use sloggers::types::Severity;
use sloggers::Build;
use sloggers::{Config, LoggerConfig};

/// Builds a terminal logger writing to stderr at debug level.
pub fn terminal() -> Logger {
    let mut builder = TerminalLoggerBuilder::new();
    builder.level(Severity::Debug);
    builder.destination(Destination::Stderr);
    builder.build().expect("Error building terminal logger")
}

/// Builds a logger from a TOML configuration snippet, e.g.
///
/// ```toml
/// type = "terminal"
/// level = "debug"
/// destination = "stderr"
/// ```
pub fn from_toml(config: &str) -> Logger {
    let config: LoggerConfig =
        serdeconv::from_toml_str(config).expect("Error parsing logging configuration");

    config.build_logger().expect("Error building logger")
}

/// Resolves an optional parent logger into a child logger, falling back to
/// a discarding logger when no parent is supplied.
#[inline]
pub fn child_or_discard(log: Option<&Logger>) -> Logger {
    match log {
        Some(log) => log.new(o!()),
        None => Logger::root(Discard, o!()),
    }
}
