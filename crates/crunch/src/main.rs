//! crunch CLI
//!
//! Replays host scenarios through the scheduling core and checks config
//! files.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};

use crunch_core::config::{Config, resolve_config_path};
use crunch_core::logging::{LogConfig, init_logging};
use crunch_core::{Error, error::format_error_with_remediation};

mod scenario;

use scenario::{Replay, ReplaySummary, Scenario};

#[derive(Parser)]
#[command(name = "crunch", author, version, about, long_about = None)]
struct Cli {
    /// Config file (defaults to $CRUNCH_CONFIG, then the user config dir)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log level override (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay a host scenario on a virtual clock
    Simulate {
        /// Scenario TOML file
        #[arg(long)]
        scenario: PathBuf,

        /// Virtual hours to replay
        #[arg(long, default_value = "24.0")]
        hours: f64,

        /// Seconds between polls
        #[arg(long, default_value = "60.0")]
        step_secs: f64,

        /// Override the host CPU count from config
        #[arg(long)]
        ncpus: Option<u32>,

        /// Output format (pretty or json)
        #[arg(long, default_value = "pretty")]
        format: OutputFormat,

        /// Load debts from this file before the replay and save them after
        #[arg(long)]
        debts: Option<PathBuf>,
    },

    /// Validate a config file and print the effective configuration
    CheckConfig {
        /// Print the effective configuration as TOML
        #[arg(long)]
        print: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputFormat {
    Pretty,
    Json,
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            _ => Err(format!("unknown format: {s}. Expected pretty or json")),
        }
    }
}

fn main() {
    let cli = Cli::parse();
    if let Err(err) = run(cli) {
        match err.downcast_ref::<Error>() {
            Some(core) => eprintln!("{}", format_error_with_remediation(core)),
            None => eprintln!("Error: {err:#}"),
        }
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let config = load_config(cli.config.as_deref())?;

    let mut log_config: LogConfig = config.logging.clone();
    if let Some(level) = cli.log_level {
        log_config.level = level;
    }
    init_logging(&log_config).context("Failed to initialize logging")?;

    match cli.command {
        Commands::Simulate {
            scenario,
            hours,
            step_secs,
            ncpus,
            format,
            debts,
        } => simulate(
            config,
            &scenario,
            hours,
            step_secs,
            ncpus,
            format,
            debts.as_deref(),
        ),
        Commands::CheckConfig { print } => check_config(&config, cli.config.as_deref(), print),
    }
}

fn load_config(explicit: Option<&Path>) -> anyhow::Result<Config> {
    Config::load_or_default(explicit).map_err(|e| Error::from(e).into())
}

fn simulate(
    mut config: Config,
    scenario_path: &Path,
    hours: f64,
    step_secs: f64,
    ncpus: Option<u32>,
    format: OutputFormat,
    debts: Option<&Path>,
) -> anyhow::Result<()> {
    if !(hours.is_finite() && hours >= 0.0) {
        bail!("--hours must be a non-negative number, got {hours}");
    }
    if let Some(n) = ncpus {
        config.host.ncpus = n;
    }

    let scenario = Scenario::load(scenario_path)?;
    let mut replay = Replay::new(config, &scenario)?;
    if let Some(path) = debts {
        if path.exists() {
            let applied = replay.load_debts(path)?;
            tracing::info!(path = %path.display(), applied, "debts restored");
        }
    }

    let summary = replay.run(hours * 3600.0, step_secs)?;

    if let Some(path) = debts {
        replay.save_debts(path)?;
    }

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&summary)?),
        OutputFormat::Pretty => print!("{}", render_summary(&summary)),
    }
    Ok(())
}

fn check_config(config: &Config, explicit: Option<&Path>, print: bool) -> anyhow::Result<()> {
    match resolve_config_path(explicit) {
        Some(path) => println!("Config OK: {}", path.display()),
        None => println!("Config OK: no config file found, using defaults"),
    }
    if print {
        let text = config
            .to_toml_string()
            .map_err(|e| anyhow::Error::from(Error::from(e)))?;
        print!("{text}");
    }
    Ok(())
}

fn render_summary(summary: &ReplaySummary) -> String {
    use std::fmt::Write as _;

    let mut out = String::new();
    let _ = writeln!(
        out,
        "Replayed {:.1} h on {} CPU(s): {} polls, {} scheduling passes, {} task commands, {} start failures",
        summary.duration_secs / 3600.0,
        summary.ncpus,
        summary.polls,
        summary.schedule_passes,
        summary.commands_issued,
        summary.start_failures,
    );
    out.push('\n');
    let _ = writeln!(
        out,
        "{:<36} {:>7} {:>7} {:>6} {:>5} {:>5} {:>6} {:>6} {:>10} {:>10}",
        "PROJECT", "SHARE", "CPU%", "DONE", "FAIL", "LATE", "QUEUE", "FETCH", "STD", "LTD"
    );
    let total_share: f64 = summary.projects.iter().map(|p| p.resource_share).sum();
    for p in &summary.projects {
        let share = if total_share > 0.0 {
            100.0 * p.resource_share / total_share
        } else {
            0.0
        };
        let _ = writeln!(
            out,
            "{:<36} {:>6.1}% {:>6.1}% {:>6} {:>5} {:>5} {:>6} {:>6} {:>10.1} {:>10.1}",
            truncate(&p.url, 36),
            share,
            100.0 * p.cpu_fraction,
            p.jobs_completed,
            p.jobs_failed,
            p.jobs_late,
            p.jobs_queued,
            p.work_requests,
            p.short_term_debt,
            p.long_term_debt,
        );
    }
    out
}

fn truncate(s: &str, width: usize) -> String {
    if s.chars().count() <= width {
        s.to_string()
    } else {
        let mut t: String = s.chars().take(width.saturating_sub(1)).collect();
        t.push('~');
        t
    }
}
