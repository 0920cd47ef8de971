//! Tracing setup for the `sate` binary.
//!
//! Phase status lines and the final summary are `info` events, so the default
//! filter shows them. Output goes to stderr in compact format, and once a run
//! knows its output directory also to two run logs there: every event that
//! passes the filter, and warnings and errors only.

use std::fs::File;
use std::io::{self, Write};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::{Context, Result};
use tracing::Subscriber;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Filter used when `RUST_LOG` is unset.
pub const DEFAULT_FILTER: &str = "sate=info";

/// A log file that can be opened after the subscriber is installed. Events
/// written before [`LogFile::attach`] are discarded.
#[derive(Debug, Clone, Default)]
pub struct LogFile {
    file: Arc<Mutex<Option<File>>>,
}

impl LogFile {
    /// Create (or truncate) `path` and send subsequent events there.
    pub fn attach(&self, path: &Path) -> Result<()> {
        let file = File::create(path).with_context(|| format!("create log {}", path.display()))?;
        *lock(&self.file) = Some(file);
        Ok(())
    }
}

fn lock(file: &Mutex<Option<File>>) -> MutexGuard<'_, Option<File>> {
    file.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct LogFileWriter {
    file: Arc<Mutex<Option<File>>>,
}

impl Write for LogFileWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match lock(&self.file).as_mut() {
            Some(file) => file.write(buf),
            None => Ok(buf.len()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match lock(&self.file).as_mut() {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }
}

impl<'a> MakeWriter<'a> for LogFile {
    type Writer = LogFileWriter;

    fn make_writer(&'a self) -> Self::Writer {
        LogFileWriter {
            file: Arc::clone(&self.file),
        }
    }
}

/// The run log (`<job>_log.txt`) and error log (`<job>_err.txt`).
#[derive(Debug, Clone, Default)]
pub struct RunLogs {
    pub run: LogFile,
    pub err: LogFile,
}

impl RunLogs {
    pub fn attach(&self, run_log: &Path, err_log: &Path) -> Result<()> {
        self.run.attach(run_log)?;
        self.err.attach(err_log)
    }
}

/// Stderr plus the two run logs, all behind `filter`.
pub fn subscriber(filter: EnvFilter, logs: &RunLogs) -> impl Subscriber + Send + Sync + 'static {
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .with(fmt::layer().with_writer(logs.run.clone()).with_ansi(false))
        .with(
            fmt::layer()
                .with_writer(logs.err.clone())
                .with_ansi(false)
                .with_filter(LevelFilter::WARN),
        )
}

/// Initialize the tracing subscriber. `RUST_LOG` overrides [`DEFAULT_FILTER`].
/// The returned run logs stay silent until attached.
///
/// # Example
/// ```bash
/// RUST_LOG=sate=debug sate run settings.toml
/// ```
pub fn init() -> RunLogs {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let logs = RunLogs::default();
    subscriber(filter, &logs).init();
    logs
}
