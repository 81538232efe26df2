//! Structured logging for crunch
//!
//! Installs a `tracing` subscriber writing to stderr, plus an optional
//! append-only log file. Both sinks share the configured [`LogFormat`].
//!
//! Scheduling decisions are logged under the module targets
//! (`crunch_core::cpu_sched`, `crunch_core::rr_sim`, `crunch_core::work_fetch`,
//! `crunch_core::debt`, `crunch_core::client`). The verbose per-job lines in
//! those modules are additionally gated by [`LogFlags`](crate::config::LogFlags),
//! so they cost nothing unless enabled in config.
//!
//! # Correlation Fields
//!
//! Use these field names consistently in spans and events:
//! - `project`: project URL
//! - `project_id`, `job_id`: arena handles
//! - `job`: job name
//! - `reason`: why a reschedule or work fetch was requested

pub use crate::config::LogFormat;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::fmt::time::SystemTime;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt};

static LOGGING_INITIALIZED: OnceLock<()> = OnceLock::new();

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Where and how to log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Filter directive, e.g. `info` or `crunch_core::work_fetch=debug`.
    /// `RUST_LOG` wins when set.
    pub level: String,

    pub format: LogFormat,

    /// Also append to this file.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            file: None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LogError {
    #[error("logging already initialized")]
    AlreadyInitialized,

    #[error("invalid log filter {directive:?}: {reason}")]
    BadFilter { directive: String, reason: String },

    #[error("failed to open log file: {0}")]
    FileOpen(#[from] io::Error),

    #[error("failed to set global subscriber: {0}")]
    SetSubscriber(#[from] tracing::subscriber::SetGlobalDefaultError),
}

impl LogConfig {
    /// Build the level filter, preferring `RUST_LOG` over the config value.
    pub fn env_filter(&self) -> Result<EnvFilter, LogError> {
        if let Ok(filter) = EnvFilter::try_from_default_env() {
            return Ok(filter);
        }
        EnvFilter::try_new(&self.level).map_err(|e| LogError::BadFilter {
            directive: self.level.clone(),
            reason: e.to_string(),
        })
    }
}

/// One formatting layer over `writer`.
fn format_layer<W>(format: LogFormat, writer: W, ansi: bool) -> BoxedLayer
where
    W: for<'a> MakeWriter<'a> + Send + Sync + 'static,
{
    match format {
        LogFormat::Pretty => fmt::layer()
            .with_writer(writer)
            .with_target(true)
            .with_ansi(ansi)
            .boxed(),
        LogFormat::Json => fmt::layer()
            .json()
            .with_writer(writer)
            .with_timer(SystemTime)
            .with_target(true)
            .with_current_span(true)
            .with_span_list(false)
            .flatten_event(true)
            .boxed(),
    }
}

fn open_log_file(path: &Path) -> io::Result<File> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    OpenOptions::new().create(true).append(true).open(path)
}

/// Install the global subscriber.
///
/// Only the first call in a process succeeds; later calls return
/// [`LogError::AlreadyInitialized`].
pub fn init_logging(config: &LogConfig) -> Result<(), LogError> {
    if LOGGING_INITIALIZED.get().is_some() {
        return Err(LogError::AlreadyInitialized);
    }

    let mut layers: Vec<BoxedLayer> = vec![format_layer(config.format, io::stderr, true)];
    if let Some(path) = &config.file {
        let file = open_log_file(path)?;
        layers.push(format_layer(config.format, file, false));
    }

    let subscriber = tracing_subscriber::registry()
        .with(layers)
        .with(config.env_filter()?);
    tracing::subscriber::set_global_default(subscriber)?;
    let _ = LOGGING_INITIALIZED.set(());

    tracing::debug!(
        level = %config.level,
        format = %config.format,
        file = ?config.file,
        "logging initialized"
    );
    Ok(())
}
