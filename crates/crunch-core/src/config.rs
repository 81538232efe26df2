//! Configuration for the scheduling core (crunch.toml).
//!
//! Every section uses `#[serde(default)]`, so a partial file only overrides
//! the fields it names.
//!
//! ```toml
//! [host]
//! ncpus = 4
//!
//! [prefs]
//! cpu_scheduling_period_secs = 3600.0
//! work_buf_min_secs = 8640.0
//!
//! [log_flags]
//! cpu_sched_debug = true
//! ```

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::logging::LogConfig;

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV_VAR: &str = "CRUNCH_CONFIG";

// =============================================================================
// Log format
// =============================================================================

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-friendly output
    #[default]
    Pretty,
    /// JSON lines
    Json,
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pretty => write!(f, "pretty"),
            Self::Json => write!(f, "json"),
        }
    }
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            _ => Err(format!("unknown log format: {s}. Expected pretty or json")),
        }
    }
}

// =============================================================================
// Sections
// =============================================================================

/// Host characteristics relevant to scheduling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Usable CPUs. `0` is treated as 1.
    pub ncpus: u32,
    /// Fraction of wall time the client is running.
    pub on_frac: f64,
    /// Fraction of running time computation is allowed.
    pub active_frac: f64,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            ncpus: detect_ncpus(),
            on_frac: 1.0,
            active_frac: 1.0,
        }
    }
}

impl HostConfig {
    /// Host with a fixed CPU count and full availability.
    #[must_use]
    pub fn with_ncpus(ncpus: u32) -> Self {
        Self {
            ncpus,
            on_frac: 1.0,
            active_frac: 1.0,
        }
    }

    /// CPU count with the degenerate `0` clamped to 1.
    #[must_use]
    pub fn ncpus(&self) -> u32 {
        self.ncpus.max(1)
    }

    /// CPUs' worth of computation expected per unit of wall time.
    #[must_use]
    pub fn effective_ncpus(&self) -> f64 {
        f64::from(self.ncpus()) * clamp_frac(self.on_frac) * clamp_frac(self.active_frac)
    }
}

fn clamp_frac(frac: f64) -> f64 {
    if frac.is_finite() {
        frac.clamp(0.01, 1.0)
    } else {
        1.0
    }
}

fn detect_ncpus() -> u32 {
    std::thread::available_parallelism()
        .map(|n| u32::try_from(n.get()).unwrap_or(u32::MAX))
        .unwrap_or(1)
}

/// User computing preferences.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Preferences {
    /// Length of one CPU scheduling period.
    pub cpu_scheduling_period_secs: f64,
    /// Keep at least this much work queued.
    pub work_buf_min_secs: f64,
    /// Queue up to this much work beyond the minimum.
    pub work_buf_additional_secs: f64,
    /// Preempted tasks stay in memory instead of quitting.
    pub leave_apps_in_memory: bool,
}

impl Default for Preferences {
    fn default() -> Self {
        Self {
            cpu_scheduling_period_secs: 3600.0,
            work_buf_min_secs: 8640.0,
            work_buf_additional_secs: 21600.0,
            leave_apps_in_memory: false,
        }
    }
}

impl Preferences {
    /// Total buffer horizon.
    #[must_use]
    pub fn work_buf_total_secs(&self) -> f64 {
        self.work_buf_min_secs + self.work_buf_additional_secs
    }
}

/// Tuning knobs of the scheduling core itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Short-term debt is clamped to `±max_short_term_debt`.
    pub max_short_term_debt: f64,
    /// Safety cap on simulator events per pass.
    pub rr_sim_max_iterations: u32,
    /// Work fetch is rechecked at least this often.
    pub work_fetch_poll_secs: f64,
    /// Delay before retrying a job whose start failed.
    pub start_failure_backoff_secs: f64,
    /// Period of the daemon poll loop.
    pub poll_interval_ms: u64,
    /// Reset every project's debts when this config is loaded.
    pub zero_debts: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_short_term_debt: 86400.0,
            rr_sim_max_iterations: 10_000,
            work_fetch_poll_secs: 60.0,
            start_failure_backoff_secs: 600.0,
            poll_interval_ms: 1000,
            zero_debts: false,
        }
    }
}

/// Verbose diagnostic categories.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogFlags {
    pub cpu_sched_debug: bool,
    pub rr_simulation: bool,
    pub work_fetch_debug: bool,
    pub debt_debug: bool,
    pub task_debug: bool,
}

// =============================================================================
// Top level
// =============================================================================

/// Full configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub host: HostConfig,
    pub prefs: Preferences,
    pub scheduler: SchedulerConfig,
    pub log_flags: LogFlags,
    pub logging: LogConfig,
}

impl Config {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self =
            toml::from_str(text).map_err(|e| ConfigError::ParseFailed(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let display = path.display().to_string();
        if !path.exists() {
            return Err(ConfigError::FileNotFound(display));
        }
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(display, e.to_string()))?;
        Self::from_toml_str(&text)
    }

    /// Load from the resolved path, or fall back to defaults when no config
    /// file exists anywhere.
    pub fn load_or_default(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        match resolve_config_path(explicit) {
            Some(path) => Self::load(&path),
            None => {
                if let Some(path) = explicit {
                    return Err(ConfigError::FileNotFound(path.display().to_string()));
                }
                Ok(Self::default())
            }
        }
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::SerializeFailed(e.to_string()))
    }

    /// Reject values that would make the scheduling math meaningless.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut problems = Vec::new();
        for (name, frac) in [
            ("host.on_frac", self.host.on_frac),
            ("host.active_frac", self.host.active_frac),
        ] {
            if !(frac > 0.0 && frac <= 1.0) {
                problems.push(format!("{name} must be in (0, 1], got {frac}"));
            }
        }
        for (name, secs) in [
            (
                "prefs.cpu_scheduling_period_secs",
                self.prefs.cpu_scheduling_period_secs,
            ),
            ("prefs.work_buf_min_secs", self.prefs.work_buf_min_secs),
            (
                "prefs.work_buf_additional_secs",
                self.prefs.work_buf_additional_secs,
            ),
            (
                "scheduler.max_short_term_debt",
                self.scheduler.max_short_term_debt,
            ),
            (
                "scheduler.work_fetch_poll_secs",
                self.scheduler.work_fetch_poll_secs,
            ),
            (
                "scheduler.start_failure_backoff_secs",
                self.scheduler.start_failure_backoff_secs,
            ),
        ] {
            if !(secs.is_finite() && secs >= 0.0) {
                problems.push(format!("{name} must be a non-negative number, got {secs}"));
            }
        }
        if self.prefs.cpu_scheduling_period_secs <= 0.0 {
            problems.push("prefs.cpu_scheduling_period_secs must be positive".to_string());
        }
        if self.scheduler.start_failure_backoff_secs <= 0.0 {
            problems.push("scheduler.start_failure_backoff_secs must be positive".to_string());
        }
        if self.scheduler.rr_sim_max_iterations == 0 {
            problems.push("scheduler.rr_sim_max_iterations must be at least 1".to_string());
        }
        if self.scheduler.poll_interval_ms == 0 {
            problems.push("scheduler.poll_interval_ms must be at least 1".to_string());
        }
        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::ValidationError(problems.join("; ")))
        }
    }
}

/// Find the config file: explicit path, then `$CRUNCH_CONFIG`, then
/// `<config dir>/crunch/crunch.toml`. Only existing files are returned.
#[must_use]
pub fn resolve_config_path(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return path.exists().then(|| path.to_path_buf());
    }
    if let Ok(env_path) = std::env::var(CONFIG_ENV_VAR) {
        let path = PathBuf::from(env_path);
        if path.exists() {
            return Some(path);
        }
    }
    let default = dirs::config_dir()?.join("crunch").join("crunch.toml");
    default.exists().then_some(default)
}
