//! Host scenarios and their replay through the scheduling core.
//!
//! A scenario file describes the attached projects, their app versions and
//! queued jobs, plus how much each job really costs. [`Replay`] drives a
//! [`Client`] over an [`InMemoryExecutor`] on a virtual clock, answering
//! work requests from each project's `supply` the way a project server would.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, bail};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crunch_core::Client;
use crunch_core::config::Config;
use crunch_core::executor::InMemoryExecutor;
use crunch_core::model::{ClientState, JobId, JobState, NewAppVersion, NewJob, ProjectId};
use crunch_core::persist;
use crunch_core::rpc::{ReplyJob, SchedulerReply, WorkRequest, find_app_version};

/// Backoff a project without a supply answers every request with.
pub const NO_WORK_BACKOFF_SECS: f64 = 3600.0;

// =============================================================================
// Scenario file
// =============================================================================

/// Top level of a scenario TOML file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Scenario {
    /// Virtual time the replay starts at.
    pub start_time: f64,
    pub projects: Vec<ScenarioProject>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScenarioProject {
    pub url: String,
    #[serde(default = "default_resource_share")]
    pub resource_share: f64,
    #[serde(default)]
    pub non_cpu_intensive: bool,
    #[serde(default)]
    pub dont_request_more_work: bool,
    #[serde(default)]
    pub suspended: bool,
    #[serde(default)]
    pub app_versions: Vec<NewAppVersion>,
    #[serde(default)]
    pub jobs: Vec<ScenarioJob>,
    /// How the project answers work requests. Without one it has no work.
    #[serde(default)]
    pub supply: Option<WorkSupply>,
}

/// A job queued when the replay starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScenarioJob {
    pub name: String,
    pub app_name: String,
    #[serde(default = "default_version_num")]
    pub version_num: u32,
    pub fpops_est: f64,
    /// Report deadline, relative to `start_time`.
    pub deadline_secs: f64,
    /// CPU-seconds the job really takes; defaults to the estimate.
    #[serde(default)]
    pub true_cpu_secs: Option<f64>,
    #[serde(default = "default_job_state")]
    pub state: JobState,
    /// Exit with an error instead of succeeding.
    #[serde(default)]
    pub fails: bool,
}

/// Template for jobs a project hands out in reply to work requests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkSupply {
    pub app_name: String,
    #[serde(default = "default_version_num")]
    pub version_num: u32,
    pub fpops_est: f64,
    /// Report deadline, relative to the reply.
    pub deadline_secs: f64,
    /// Real cost as a multiple of the estimate.
    #[serde(default = "default_cost_factor")]
    pub true_cost_factor: f64,
    #[serde(default = "default_max_jobs_per_reply")]
    pub max_jobs_per_reply: usize,
    /// Delay the server imposes before the next request.
    #[serde(default)]
    pub min_rpc_delay_secs: f64,
}

fn default_resource_share() -> f64 {
    100.0
}

fn default_version_num() -> u32 {
    1
}

fn default_job_state() -> JobState {
    JobState::FilesDownloaded
}

fn default_cost_factor() -> f64 {
    1.0
}

fn default_max_jobs_per_reply() -> usize {
    20
}

impl Scenario {
    pub fn from_toml_str(text: &str) -> anyhow::Result<Self> {
        let scenario: Self = toml::from_str(text).context("Failed to parse scenario")?;
        scenario.validate()?;
        Ok(scenario)
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read scenario {}", path.display()))?;
        Self::from_toml_str(&text).with_context(|| format!("Invalid scenario {}", path.display()))
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.projects.is_empty() {
            bail!("scenario attaches no projects");
        }
        for project in &self.projects {
            if let Some(supply) = &project.supply {
                let known = project
                    .app_versions
                    .iter()
                    .any(|av| av.app_name == supply.app_name && av.version_num == supply.version_num);
                if !known {
                    bail!(
                        "{}: supply uses unknown app version {} v{}",
                        project.url,
                        supply.app_name,
                        supply.version_num
                    );
                }
                if !(supply.fpops_est > 0.0 && supply.deadline_secs > 0.0) {
                    bail!("{}: supply needs positive fpops_est and deadline_secs", project.url);
                }
            }
        }
        Ok(())
    }
}

// =============================================================================
// Replay
// =============================================================================

/// Per-project tallies gathered during a replay.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProjectSummary {
    pub url: String,
    pub resource_share: f64,
    /// CPU-seconds spent on jobs that finished.
    pub cpu_time: f64,
    /// Fraction of all CPU-seconds spent, 0 to 1.
    pub cpu_fraction: f64,
    pub jobs_completed: u64,
    pub jobs_failed: u64,
    /// Completed after their report deadline.
    pub jobs_late: u64,
    pub jobs_queued: usize,
    pub work_requests: u64,
    pub seconds_requested: f64,
    pub short_term_debt: f64,
    pub long_term_debt: f64,
}

/// Result of a whole replay.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReplaySummary {
    pub duration_secs: f64,
    pub step_secs: f64,
    pub ncpus: u32,
    pub polls: u64,
    pub schedule_passes: u64,
    pub commands_issued: u64,
    pub start_failures: u64,
    pub projects: Vec<ProjectSummary>,
}

#[derive(Debug, Clone, Copy, Default)]
struct Tally {
    cpu_time: f64,
    completed: u64,
    failed: u64,
    late: u64,
    work_requests: u64,
    seconds_requested: f64,
}

/// A scenario bound to a live scheduling context.
pub struct Replay {
    client: Client<InMemoryExecutor>,
    supplies: BTreeMap<ProjectId, WorkSupply>,
    pending_acks: BTreeMap<ProjectId, Vec<String>>,
    reply_seq: BTreeMap<ProjectId, u64>,
    tallies: BTreeMap<ProjectId, Tally>,
    start_time: f64,
    polls: u64,
    schedule_passes: u64,
    commands_issued: u64,
    start_failures: u64,
}

impl Replay {
    pub fn new(config: Config, scenario: &Scenario) -> anyhow::Result<Self> {
        let start = scenario.start_time;
        let mut state = ClientState::new();
        let mut supplies = BTreeMap::new();
        let mut true_costs: Vec<(JobId, Option<f64>, bool)> = Vec::new();

        for spec in &scenario.projects {
            let id = state
                .attach_project(spec.url.clone(), spec.resource_share)
                .with_context(|| format!("Failed to attach {}", spec.url))?;
            if let Some(project) = state.project_mut(id) {
                project.non_cpu_intensive = spec.non_cpu_intensive;
                project.dont_request_more_work = spec.dont_request_more_work;
                project.suspended_via_gui = spec.suspended;
            }
            for av in &spec.app_versions {
                state.add_app_version(id, av.clone())?;
            }
            for job in &spec.jobs {
                let Some(app_version) =
                    find_app_version(&state, id, &job.app_name, job.version_num)
                else {
                    bail!(
                        "{}: job {} uses unknown app version {} v{}",
                        spec.url,
                        job.name,
                        job.app_name,
                        job.version_num
                    );
                };
                let job_id = state
                    .add_job(
                        id,
                        NewJob {
                            name: job.name.clone(),
                            app_version,
                            report_deadline: start + job.deadline_secs,
                            fpops_est: job.fpops_est,
                            state: job.state,
                        },
                    )
                    .with_context(|| format!("{}: bad job {}", spec.url, job.name))?;
                true_costs.push((job_id, job.true_cpu_secs, job.fails));
            }
            if let Some(supply) = &spec.supply {
                supplies.insert(id, supply.clone());
            }
        }

        let mut executor = InMemoryExecutor::default();
        for (job, true_cpu_secs, fails) in true_costs {
            let estimate = state.estimated_cpu_time(job).unwrap_or(0.0);
            executor.set_true_cost(job, true_cpu_secs.unwrap_or(estimate), state.avg_ncpus(job));
            if fails {
                executor.fail_on_exit(job);
            }
        }

        info!(
            projects = state.project_count(),
            jobs = state.job_count(),
            "scenario loaded"
        );
        Ok(Self {
            client: Client::new(config, state, executor, start),
            supplies,
            pending_acks: BTreeMap::new(),
            reply_seq: BTreeMap::new(),
            tallies: BTreeMap::new(),
            start_time: start,
            polls: 0,
            schedule_passes: 0,
            commands_issued: 0,
            start_failures: 0,
        })
    }

    #[must_use]
    pub fn client(&self) -> &Client<InMemoryExecutor> {
        &self.client
    }

    /// Restore debts saved by an earlier replay.
    pub fn load_debts(&mut self, path: &Path) -> anyhow::Result<usize> {
        let applied = persist::load_debts(self.client.state_mut(), path)
            .with_context(|| format!("Failed to load debts from {}", path.display()))?;
        Ok(applied)
    }

    pub fn save_debts(&self, path: &Path) -> anyhow::Result<()> {
        persist::save_debts(self.client.state(), path)
            .with_context(|| format!("Failed to save debts to {}", path.display()))
    }

    /// Advance the virtual clock in `step_secs` increments for
    /// `duration_secs`, polling once per step.
    pub fn run(&mut self, duration_secs: f64, step_secs: f64) -> anyhow::Result<ReplaySummary> {
        if !(step_secs.is_finite() && step_secs > 0.0) {
            bail!("step must be a positive number of seconds, got {step_secs}");
        }
        if !(duration_secs.is_finite() && duration_secs >= 0.0) {
            bail!("duration must be a non-negative number of seconds, got {duration_secs}");
        }
        let steps = (duration_secs / step_secs).ceil() as u64;
        for i in 0..=steps {
            let now = self.start_time + i as f64 * step_secs;
            self.step(now)?;
            if i < steps {
                self.client.executor_mut().advance(step_secs);
            }
        }
        Ok(self.summary(duration_secs, step_secs))
    }

    fn step(&mut self, now: f64) -> anyhow::Result<()> {
        let report = self.client.poll(now);
        self.polls += 1;
        if let Some(enforce) = &report.enforce {
            self.schedule_passes += 1;
            self.commands_issued += enforce.commands.len() as u64;
            self.start_failures += enforce.start_failures.len() as u64;
        }

        for &job in report.completed.iter().chain(&report.failed) {
            self.retire(job, now, report.failed.contains(&job))?;
        }

        for request in self.client.take_work_requests() {
            self.answer(&request, now)?;
        }
        Ok(())
    }

    /// Book a finished job and upload its output.
    fn retire(&mut self, job: JobId, now: f64, failed: bool) -> anyhow::Result<()> {
        let Some(j) = self.client.state().job(job) else {
            return Ok(());
        };
        let project = j.project;
        let name = j.name.clone();
        let late = now > j.report_deadline;
        let tally = self.tallies.entry(project).or_default();
        tally.cpu_time += j.cpu_time;
        if failed {
            tally.failed += 1;
        } else {
            tally.completed += 1;
            if late {
                tally.late += 1;
            }
        }
        self.client.job_upload_complete(job)?;
        self.pending_acks.entry(project).or_default().push(name);
        Ok(())
    }

    /// Play the project server for one work request.
    fn answer(&mut self, request: &WorkRequest, now: f64) -> anyhow::Result<()> {
        let tally = self.tallies.entry(request.project).or_default();
        tally.work_requests += 1;
        tally.seconds_requested += request.seconds;

        let acked = self.pending_acks.remove(&request.project).unwrap_or_default();
        let Some(supply) = self.supplies.get(&request.project).cloned() else {
            debug!(project = %request.url, "project has no work");
            let reply = SchedulerReply {
                acked,
                min_rpc_time: Some(now + NO_WORK_BACKOFF_SECS),
                ..SchedulerReply::default()
            };
            self.client.handle_scheduler_reply(request.project, reply)?;
            return Ok(());
        };

        let (flops, avg_ncpus) = self
            .client
            .state()
            .app_versions()
            .find(|av| {
                av.project == request.project
                    && av.app_name == supply.app_name
                    && av.version_num == supply.version_num
            })
            .map_or((1.0, 1.0), |av| (av.flops, av.avg_ncpus));
        let est_secs = supply.fpops_est / flops;
        let wanted = (request.seconds / est_secs).ceil();
        let count = if wanted.is_finite() {
            (wanted as usize).clamp(1, supply.max_jobs_per_reply.max(1))
        } else {
            1
        };

        let seq = self.reply_seq.entry(request.project).or_insert(0);
        let jobs: Vec<ReplyJob> = (0..count)
            .map(|i| ReplyJob {
                name: format!("{}_{}_{}", supply.app_name, *seq, i),
                app_name: supply.app_name.clone(),
                version_num: supply.version_num,
                report_deadline: now + supply.deadline_secs,
                fpops_est: supply.fpops_est,
            })
            .collect();
        *seq += 1;
        let names: Vec<String> = jobs.iter().map(|j| j.name.clone()).collect();

        let reply = SchedulerReply {
            jobs,
            acked,
            min_rpc_time: (supply.min_rpc_delay_secs > 0.0).then(|| now + supply.min_rpc_delay_secs),
            ..SchedulerReply::default()
        };
        let outcome = self.client.handle_scheduler_reply(request.project, reply)?;
        debug!(
            project = %request.url,
            requested = request.seconds,
            jobs_added = outcome.jobs_added,
            "work supplied"
        );

        // Input files arrive at once.
        for name in names {
            let Some(id) = self
                .client
                .state()
                .find_job(request.project, &name)
                .map(|j| j.id)
            else {
                continue;
            };
            self.client
                .executor_mut()
                .set_true_cost(id, est_secs * supply.true_cost_factor, avg_ncpus);
            self.client.job_input_ready(id)?;
        }
        Ok(())
    }

    fn summary(&self, duration_secs: f64, step_secs: f64) -> ReplaySummary {
        let state = self.client.state();
        let total_cpu: f64 = self.tallies.values().map(|t| t.cpu_time).sum();
        let projects = state
            .projects()
            .map(|p| {
                let tally = self.tallies.get(&p.id).copied().unwrap_or_default();
                ProjectSummary {
                    url: p.url.clone(),
                    resource_share: p.resource_share,
                    cpu_time: tally.cpu_time,
                    cpu_fraction: if total_cpu > 0.0 {
                        tally.cpu_time / total_cpu
                    } else {
                        0.0
                    },
                    jobs_completed: tally.completed,
                    jobs_failed: tally.failed,
                    jobs_late: tally.late,
                    jobs_queued: state.runnable_or_downloading_count(p.id),
                    work_requests: tally.work_requests,
                    seconds_requested: tally.seconds_requested,
                    short_term_debt: p.short_term_debt,
                    long_term_debt: p.long_term_debt,
                }
            })
            .collect();
        ReplaySummary {
            duration_secs,
            step_secs,
            ncpus: self.client.config().host.ncpus(),
            polls: self.polls,
            schedule_passes: self.schedule_passes,
            commands_issued: self.commands_issued,
            start_failures: self.start_failures,
            projects,
        }
    }
}
