//! Error types for crunch-core

use serde::{Deserialize, Serialize};
use std::fmt::Write;
use thiserror::Error;

use crate::model::{AppVersionId, JobId, JobState, ProjectId};

/// One recovery step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RemediationStep {
    /// A shell command, with a short label.
    Run { label: String, command: String },
    Hint { text: String },
}

/// How to recover from an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Remediation {
    pub summary: String,
    pub steps: Vec<RemediationStep>,
}

impl Remediation {
    #[must_use]
    pub fn new(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            steps: Vec::new(),
        }
    }

    #[must_use]
    pub fn run(mut self, label: impl Into<String>, command: impl Into<String>) -> Self {
        self.steps.push(RemediationStep::Run {
            label: label.into(),
            command: command.into(),
        });
        self
    }

    #[must_use]
    pub fn hint(mut self, text: impl Into<String>) -> Self {
        self.steps.push(RemediationStep::Hint { text: text.into() });
        self
    }

    /// Plain-text rendering for terminals: commands first, then hints.
    #[must_use]
    pub fn render_plain(&self) -> String {
        let mut out = format!("To fix: {}\n", self.summary);
        for step in &self.steps {
            if let RemediationStep::Run { label, command } = step {
                let _ = writeln!(out, "  $ {command}  ({label})");
            }
        }
        for step in &self.steps {
            if let RemediationStep::Hint { text } = step {
                let _ = writeln!(out, "  - {text}");
            }
        }
        out
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Anything the scheduling core can fail with.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Model error: {0}")]
    Model(#[from] ModelError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Executor error: {0}")]
    Executor(#[from] ExecutorError),

    /// Reading or writing the debt file.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    #[must_use]
    pub fn remediation(&self) -> Option<Remediation> {
        match self {
            Self::Model(err) => Some(err.remediation()),
            Self::Config(err) => Some(err.remediation()),
            Self::Executor(_) => Some(
                Remediation::new("The task executor rejected a command; the job will be retried later.")
                    .hint("Check free memory and shared-memory limits on the host."),
            ),
            Self::Io(_) => Some(
                Remediation::new("Check filesystem permissions and paths, then retry.")
                    .hint("Verify the state directory exists and is writable."),
            ),
            Self::Json(_) => Some(
                Remediation::new("The saved debt file is not valid JSON.")
                    .run("Validate JSON", "python -m json.tool < debts.json")
                    .hint("Delete the file to start from zero debts."),
            ),
        }
    }
}

/// Errors raised by mutations of the job/project arena.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ModelError {
    #[error("project already attached: {0}")]
    DuplicateProject(String),

    #[error("unknown project: {0}")]
    UnknownProject(ProjectId),

    #[error("unknown job: {0}")]
    UnknownJob(JobId),

    #[error("unknown app version: {0}")]
    UnknownAppVersion(AppVersionId),

    #[error("job {name} already exists in project {project}")]
    DuplicateJob { project: ProjectId, name: String },

    #[error("app version {app_version} does not belong to project {project}")]
    AppVersionProjectMismatch {
        app_version: AppVersionId,
        project: ProjectId,
    },

    #[error("job {job}: invalid state transition {from} -> {to}")]
    InvalidTransition {
        job: JobId,
        from: JobState,
        to: JobState,
    },
}

impl ModelError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::DuplicateProject(url) => {
                Remediation::new(format!("Project {url} is already attached."))
                    .hint("Detach the project first if you want to re-attach it.")
            }
            Self::UnknownProject(_) | Self::UnknownJob(_) | Self::UnknownAppVersion(_) => {
                Remediation::new("The referenced entity is gone; refresh client state and retry.")
            }
            Self::DuplicateJob { .. } => {
                Remediation::new("The server sent a job that is already queued; it was ignored.")
            }
            Self::AppVersionProjectMismatch { .. } => Remediation::new(
                "The scheduler reply referenced an app version from a different project.",
            ),
            Self::InvalidTransition { .. } => Remediation::new(
                "Job states only move forward; errors and aborts are the only exceptions.",
            ),
        }
    }
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    FileNotFound(String),

    #[error("Failed to read config file {0}: {1}")]
    ReadFailed(String, String),

    #[error("Failed to parse config: {0}")]
    ParseFailed(String),

    #[error("Failed to serialize config: {0}")]
    SerializeFailed(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

impl ConfigError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::FileNotFound(path) => Remediation::new(format!(
                "Config file not found: {path}. Verify the path and retry."
            ))
            .run("Check path", format!("ls -l \"{path}\""))
            .hint("Pass --config with the correct path."),
            Self::ReadFailed(path, _) => Remediation::new(format!(
                "Failed to read config file: {path}. Check permissions."
            ))
            .run("Check permissions", format!("ls -l \"{path}\""))
            .hint("Ensure the file is readable by the current user."),
            Self::ParseFailed(_) => Remediation::new("Config parse failed. Fix the syntax and retry.")
                .run("Check config", "crunch check-config")
                .hint("Validate the TOML syntax of crunch.toml."),
            Self::SerializeFailed(_) => {
                Remediation::new("Failed to serialize configuration. Check config values.")
                    .hint("Recreate the config from known-good defaults.")
            }
            Self::ValidationError(_) => {
                Remediation::new("Config validation failed. Fix the invalid fields and retry.")
                    .run("Check config", "crunch check-config")
                    .hint("Review validation errors and adjust crunch.toml.")
            }
        }
    }
}

/// Errors reported by the external task executor.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecutorError {
    #[error("no task for job {0}")]
    UnknownTask(JobId),

    #[error("shared memory segment unavailable for job {0}")]
    ShmemUnavailable(JobId),

    #[error("job {job} failed to start: {reason}")]
    StartFailed { job: JobId, reason: String },
}

/// `Error: ...` followed by a blank line and the remediation, if any.
#[must_use]
pub fn format_error_with_remediation(error: &Error) -> String {
    match error.remediation() {
        Some(r) => format!("Error: {error}\n\n{}", r.render_plain()),
        None => format!("Error: {error}"),
    }
}
