//! Tracing setup shared by the binaries.

use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Mutex;

use clap::ValueEnum;
use color_eyre::eyre::Result;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::{EnvFilter, Layer, fmt, prelude::*};

/// Log line format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// Human readable.
    #[default]
    Text,
    /// One JSON object per line.
    Json,
}

/// Where log lines go.
#[derive(Debug, Clone, Copy)]
pub enum LogTarget<'a> {
    /// Append to a file, falling back to stderr if it cannot be opened.
    File(&'a Path),
    /// Standard error.
    Stderr,
}

/// Filter directive for our crates.
#[must_use]
pub const fn default_directive(debug: bool) -> &'static str {
    if debug { "hitch=debug" } else { "hitch=info" }
}

fn make_writer(target: LogTarget<'_>) -> (BoxMakeWriter, bool) {
    let LogTarget::File(path) = target else {
        return (BoxMakeWriter::new(std::io::stderr), true);
    };

    let opened = path
        .parent()
        .map_or(Ok(()), std::fs::create_dir_all)
        .and_then(|()| OpenOptions::new().create(true).append(true).open(path));
    match opened {
        Ok(file) => (BoxMakeWriter::new(Mutex::new(file)), false),
        Err(e) => {
            eprintln!("Failed to open log file {}: {e}, logging to stderr", path.display());
            (BoxMakeWriter::new(std::io::stderr), true)
        }
    }
}

/// Install the global subscriber.
///
/// # Errors
///
/// Returns an error if a filter directive is invalid or a subscriber is
/// already installed.
pub fn init(target: LogTarget<'_>, debug: bool, format: LogFormat) -> Result<()> {
    let (writer, ansi) = make_writer(target);
    let layer = match format {
        LogFormat::Text => fmt::layer()
            .with_target(true)
            .with_ansi(ansi)
            .with_writer(writer)
            .boxed(),
        LogFormat::Json => fmt::layer().json().with_writer(writer).boxed(),
    };

    tracing_subscriber::registry()
        .with(layer)
        .with(
            EnvFilter::from_default_env()
                .add_directive(default_directive(debug).parse()?)
                .add_directive("telemetry=info".parse()?),
        )
        .try_init()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_flag_raises_level() {
        assert_eq!(default_directive(false), "hitch=info");
        assert_eq!(default_directive(true), "hitch=debug");
    }

    #[test]
    fn unwritable_log_file_falls_back_to_stderr() {
        let (_, ansi) = make_writer(LogTarget::File(Path::new("/proc/hitch/cni.log")));
        assert!(ansi);
    }

    #[test]
    fn log_file_is_created() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("log/hitch-cni.log");
        let (_, ansi) = make_writer(LogTarget::File(&path));
        assert!(!ansi);
        assert!(path.exists());
    }
}
