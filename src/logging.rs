use std::fs::OpenOptions;
use std::io;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Mutex;

use anyhow::{Context, Result};
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Where log lines go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogSink {
    Stderr,
    Stdout,
    /// Appended to, created if missing.
    File(PathBuf),
}

impl LogSink {
    pub fn is_file(&self) -> bool {
        matches!(self, Self::File(_))
    }
}

impl FromStr for LogSink {
    type Err = String;

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        match value {
            "" => Err("empty log destination".to_string()),
            "stderr" => Ok(Self::Stderr),
            "stdout" => Ok(Self::Stdout),
            "syslog" => Err("syslog is not supported, use a file path".to_string()),
            path => Ok(Self::File(PathBuf::from(path))),
        }
    }
}

/// Install the global subscriber. `RUST_LOG` wins over `default_filter`.
pub fn init(sink: &LogSink, default_filter: &str, ansi: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))
        .with_context(|| format!("invalid log filter '{}'", default_filter))?;

    let writer = match sink {
        LogSink::Stderr => BoxMakeWriter::new(io::stderr),
        LogSink::Stdout => BoxMakeWriter::new(io::stdout),
        LogSink::File(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open log file {}", path.display()))?;
            BoxMakeWriter::new(Mutex::new(file))
        }
    };

    let layer = fmt::layer()
        .with_writer(writer)
        .with_ansi(ansi && !sink.is_file());

    let installed = if sink.is_file() {
        tracing_subscriber::registry().with(filter).with(layer).try_init()
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(layer.without_time())
            .try_init()
    };
    installed.context("failed to install logger")
}
