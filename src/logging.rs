//! Tracing subscriber setup for the binary

use crate::error::{Error, Result};
use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Mutex;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Build the level filter. `RUST_LOG` wins when set; `--verbose` forces
/// debug over the configured level.
pub fn filter_for(level: &str, verbose: bool, rust_log: Option<&str>) -> Result<EnvFilter> {
    let directives = match rust_log {
        Some(directives) if !directives.trim().is_empty() => directives,
        _ if verbose => "debug",
        _ => level,
    };
    EnvFilter::try_new(directives)
        .map_err(|e| Error::Config(format!("Invalid log filter '{}': {}", directives, e)))
}

/// Install the global subscriber, writing to `file` (appending) or stderr
pub fn init(level: &str, verbose: bool, file: Option<&Path>) -> Result<()> {
    let rust_log = std::env::var("RUST_LOG").ok();
    let filter = filter_for(level, verbose, rust_log.as_deref())?;
    let builder = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false);

    let installed = match file {
        Some(path) => {
            let log = OpenOptions::new().create(true).append(true).open(path)?;
            tracing::subscriber::set_global_default(
                builder.with_ansi(false).with_writer(Mutex::new(log)).finish(),
            )
        }
        None => tracing::subscriber::set_global_default(
            builder.with_writer(std::io::stderr).finish(),
        ),
    };
    installed.map_err(|e| Error::Internal(format!("Failed to set subscriber: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_precedence() {
        assert_eq!(filter_for("warn", false, None).unwrap().to_string(), "warn");
        assert_eq!(filter_for("warn", true, None).unwrap().to_string(), "debug");
        assert_eq!(
            filter_for("warn", true, Some("lanvault=trace")).unwrap().to_string(),
            "lanvault=trace"
        );
        assert_eq!(filter_for("info", false, Some("  ")).unwrap().to_string(), "info");
    }
}
