// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Tracing setup for the execution core.
//!
//! Builds subscriber layers from a [`LogConfig`] and installs them. Display
//! output goes to stderr (stdout belongs to the script being run); file
//! output goes through a non-rolling appender under the given path spec.

use std::path::{Path, PathBuf};

use miette::IntoDiagnostic;
use tracing_core::LevelFilter;
use tracing_subscriber::{Layer, Registry, layer::SubscriberExt, util::SubscriberInitExt};

/// Type alias for a boxed layer.
pub type DynLayer = Box<dyn Layer<Registry> + Send + Sync + 'static>;

/// Where log events go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriterConfig {
    /// Swallow everything (still cheap to leave `tracing::` calls in).
    None,
    /// Human-readable output on stderr.
    Stderr,
    /// Append to a log file; the value is a path-and-prefix spec like
    /// `/tmp/fish_exec` (becomes `/tmp/fish_exec.log`).
    File(String),
    /// Both of the above.
    StderrAndFile(String),
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    pub level: LevelFilter,
    pub writer: WriterConfig,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LevelFilter::WARN,
            writer: WriterConfig::Stderr,
        }
    }
}

/// Build the layers and install the global subscriber.
///
/// # Errors
///
/// Fails if a global subscriber is already installed.
pub fn try_init(config: LogConfig) -> miette::Result<()> {
    let mut layers: Vec<DynLayer> = vec![
        // The level filter is its own layer so additional layers added later
        // inherit it.
        Box::new(config.level),
    ];

    if matches!(
        config.writer,
        WriterConfig::Stderr | WriterConfig::StderrAndFile(_)
    ) {
        layers.push(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .boxed(),
        );
    }

    if let WriterConfig::File(spec) | WriterConfig::StderrAndFile(spec) = &config.writer {
        let (directory, prefix) = split_file_spec(spec);
        let appender = tracing_appender::rolling::never(directory, format!("{prefix}.log"));
        layers.push(
            tracing_subscriber::fmt::layer()
                .with_writer(appender)
                .with_ansi(false)
                .boxed(),
        );
    }

    tracing_subscriber::registry()
        .with(layers)
        .try_init()
        .into_diagnostic()
}

/// Split a path-and-prefix spec into (directory, file prefix).
fn split_file_spec(spec: &str) -> (PathBuf, String) {
    let path = Path::new(spec);
    let directory = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let prefix = path
        .file_name()
        .map_or_else(|| "fish_exec".to_string(), |name| name.to_string_lossy().into_owned());
    (directory, prefix)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_split_file_spec_with_directory() {
        let (directory, prefix) = split_file_spec("/tmp/fish_exec");
        assert_eq!(directory, PathBuf::from("/tmp"));
        assert_eq!(prefix, "fish_exec");
    }

    #[test]
    fn test_split_file_spec_bare_prefix() {
        let (directory, prefix) = split_file_spec("core");
        assert_eq!(directory, PathBuf::from("."));
        assert_eq!(prefix, "core");
    }
}
