//! Structured logging setup shared by every binary in this workspace.
//!
//! Downstream crates use this module exactly like the `slog` crate itself
//! (`logging::info!(log, "message"; "key" => value)`), plus [`init`] to build
//! the root logger once at startup.

use sloggers::terminal::{Destination, TerminalLoggerBuilder};
use sloggers::types::Severity;
use sloggers::Build;

pub use slog::{debug, error, info, o, warn, Discard, Logger};

/// Builds the root logger. `verbose` selects `Debug` level instead of `Info`;
/// both levels go to stderr so stdout stays free for any scripting use.
pub fn init(verbose: bool) -> Logger {
    let mut builder = TerminalLoggerBuilder::new();
    builder.level(if verbose { Severity::Debug } else { Severity::Info });
    builder.destination(Destination::Stderr);

    builder.build().expect("failed to initialize logger")
}
