//! Round-robin deadline simulation.
//!
//! A what-if discrete-event simulation: if every queued job ran round-robin
//! at its project's fair rate starting now, which jobs would miss their
//! deadline, and how much CPU would each project fail to use for lack of
//! queued work. It never issues commands; the CPU scheduler and work-fetch
//! policy consume its [`RrSimOutput`].
//!
//! All per-pass state (remaining simulated CPU, active and pending queues)
//! lives in the simulator, never on the jobs themselves, so two passes over
//! the same [`ClientState`] produce identical output.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::{Config, HostConfig, Preferences};
use crate::model::{ClientState, JobId, Project, ProjectId, share_fraction};

/// Remaining simulated CPU below this counts as finished.
const FINISH_EPSILON: f64 = 1e-6;

// =============================================================================
// Output
// =============================================================================

/// Per-project result of one simulation pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProjectSimResult {
    pub deadlines_missed: u32,
    /// CPU-seconds the project could have used at its fair rate over the
    /// whole buffer window but had no queued work for.
    pub cpu_shortfall: f64,
    /// Same, restricted to `[now, now + work_buf_min]`.
    pub min_buf_shortfall: f64,
}

/// Per-job result of one simulation pass.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct JobSimResult {
    pub project: ProjectId,
    /// Simulated completion time.
    pub finish_time: f64,
    pub deadline_missed: bool,
}

/// Everything one simulation pass learned.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RrSimOutput {
    /// Time the pass was run for.
    pub now: f64,
    pub projects: BTreeMap<ProjectId, ProjectSimResult>,
    pub jobs: BTreeMap<JobId, JobSimResult>,
    /// Sum of project shortfalls over the whole buffer window.
    pub total_cpu_shortfall: f64,
    /// Sum of project shortfalls over the minimum buffer window.
    pub min_buf_shortfall: f64,
    /// CPUs with nothing runnable or downloading to work on right now.
    pub idle_cpus_now: f64,
    /// Hit the iteration cap; numbers are unreliable.
    pub truncated: bool,
    pub iterations: u32,
}

impl RrSimOutput {
    #[must_use]
    pub fn job_missed_deadline(&self, job: JobId) -> bool {
        self.jobs.get(&job).is_some_and(|r| r.deadline_missed)
    }

    #[must_use]
    pub fn project(&self, project: ProjectId) -> Option<&ProjectSimResult> {
        self.projects.get(&project)
    }

    #[must_use]
    pub fn deadlines_missed(&self, project: ProjectId) -> u32 {
        self.projects.get(&project).map_or(0, |r| r.deadlines_missed)
    }

    #[must_use]
    pub fn cpu_shortfall(&self, project: ProjectId) -> f64 {
        self.projects.get(&project).map_or(0.0, |r| r.cpu_shortfall)
    }

    /// Whether some CPU would sit idle right now.
    #[must_use]
    pub fn idle_cpu_now(&self) -> bool {
        self.idle_cpus_now > FINISH_EPSILON
    }

    /// Copy the per-project numbers into the model's scratch fields.
    pub fn apply_to(&self, state: &mut ClientState) {
        for project in state.projects_mut() {
            let result = self.projects.get(&project.id);
            project.deadlines_missed = result.map_or(0, |r| r.deadlines_missed);
            project.cpu_shortfall = result.map_or(0.0, |r| r.cpu_shortfall);
        }
    }
}

// =============================================================================
// Simulator
// =============================================================================

#[derive(Debug, Clone)]
struct SimJob {
    id: JobId,
    remaining: f64,
    avg_ncpus: f64,
    computation_deadline: f64,
}

#[derive(Debug, Default)]
struct SimProject {
    share: f64,
    pending: VecDeque<SimJob>,
    active: Vec<SimJob>,
    debt_spent: f64,
    long_term_debt: f64,
}

impl SimProject {
    fn has_work(&self) -> bool {
        !self.active.is_empty() || !self.pending.is_empty()
    }
}

/// Runs the deadline simulation.
#[derive(Debug, Clone)]
pub struct RrSimulator {
    host: HostConfig,
    prefs: Preferences,
    max_iterations: u32,
    verbose: bool,
}

impl RrSimulator {
    #[must_use]
    pub fn new(config: &Config) -> Self {
        Self {
            host: config.host.clone(),
            prefs: config.prefs.clone(),
            max_iterations: config.scheduler.rr_sim_max_iterations.max(1),
            verbose: config.log_flags.rr_simulation,
        }
    }

    /// Simulate from `now`. Reads the model only.
    #[must_use]
    pub fn simulate(&self, state: &ClientState, now: f64) -> RrSimOutput {
        let ncpus = self.host.ncpus() as usize;
        let effective_ncpus = self.host.effective_ncpus();
        let window_end = now + self.prefs.work_buf_total_secs();
        let min_window_end = now + self.prefs.work_buf_min_secs;

        let mut output = RrSimOutput {
            now,
            ..RrSimOutput::default()
        };

        // Fair rates are computed against everything that could use a CPU.
        let fetchable: Vec<ProjectId> = state
            .projects()
            .filter(|p| !p.non_cpu_intensive && state.is_potentially_runnable(p.id, now))
            .map(|p| p.id)
            .collect();
        let fetchable_share: f64 = fetchable
            .iter()
            .filter_map(|&id| state.project(id))
            .map(Project::effective_share)
            .sum();
        let fair_rates: BTreeMap<ProjectId, f64> = fetchable
            .iter()
            .filter_map(|&id| state.project(id))
            .map(|p| {
                let frac = share_fraction(p.effective_share(), fetchable_share, fetchable.len());
                (p.id, effective_ncpus * frac)
            })
            .collect();
        for &id in &fetchable {
            output.projects.insert(id, ProjectSimResult::default());
        }

        let mut projects = self.seed(state, now, &mut output);

        let demand_now: f64 = projects
            .values()
            .flat_map(|p| p.pending.iter())
            .map(|j| j.avg_ncpus)
            .sum();
        output.idle_cpus_now = (f64::from(self.host.ncpus()) - demand_now).max(0.0);

        let mut sim_time = now;
        loop {
            if !projects.values().any(SimProject::has_work) {
                break;
            }
            if output.iterations >= self.max_iterations {
                output.truncated = true;
                warn!(
                    iterations = output.iterations,
                    "round-robin simulation hit its iteration cap"
                );
                break;
            }
            output.iterations += 1;

            activate(&mut projects, ncpus);

            let rates = job_rates(&projects, effective_ncpus);
            let Some(dt) = projects
                .values()
                .flat_map(|p| p.active.iter())
                .map(|j| j.remaining / rates[&j.id])
                .min_by(f64::total_cmp)
            else {
                break;
            };

            let mut project_rates: BTreeMap<ProjectId, f64> = BTreeMap::new();
            for (&pid, project) in &projects {
                let rate: f64 = project.active.iter().map(|j| rates[&j.id]).sum();
                project_rates.insert(pid, rate);
            }
            accrue_shortfall(
                &mut output,
                &fair_rates,
                &project_rates,
                (sim_time, sim_time + dt),
                (now, window_end, min_window_end),
            );

            sim_time += dt;
            for (&pid, project) in &mut projects {
                for job in &mut project.active {
                    job.remaining -= rates[&job.id] * dt;
                }
                let (done, still): (Vec<SimJob>, Vec<SimJob>) = project
                    .active
                    .drain(..)
                    .partition(|j| j.remaining <= FINISH_EPSILON * rates[&j.id].max(1.0));
                project.active = still;
                for job in done {
                    self.finish(&mut output, pid, &job, sim_time);
                }
            }
        }

        if !output.truncated && sim_time < window_end {
            accrue_shortfall(
                &mut output,
                &fair_rates,
                &BTreeMap::new(),
                (sim_time, window_end),
                (now, window_end, min_window_end),
            );
        }

        output.total_cpu_shortfall = output.projects.values().map(|r| r.cpu_shortfall).sum();
        output.min_buf_shortfall = output.projects.values().map(|r| r.min_buf_shortfall).sum();

        if self.verbose {
            for (pid, result) in &output.projects {
                debug!(
                    project_id = %pid,
                    deadlines_missed = result.deadlines_missed,
                    cpu_shortfall = result.cpu_shortfall,
                    "rr_sim project result"
                );
            }
        }
        debug!(
            total_cpu_shortfall = output.total_cpu_shortfall,
            min_buf_shortfall = output.min_buf_shortfall,
            idle_cpus_now = output.idle_cpus_now,
            iterations = output.iterations,
            truncated = output.truncated,
            "rr_sim done"
        );
        output
    }

    /// Build per-project pending queues in deadline order.
    fn seed(
        &self,
        state: &ClientState,
        now: f64,
        output: &mut RrSimOutput,
    ) -> BTreeMap<ProjectId, SimProject> {
        let mut projects: BTreeMap<ProjectId, SimProject> = BTreeMap::new();
        let mut queued: Vec<(f64, JobId, ProjectId, SimJob)> = Vec::new();
        let eligible: BTreeSet<ProjectId> = state
            .projects()
            .filter(|p| !p.non_cpu_intensive && !p.suspended_via_gui)
            .map(|p| p.id)
            .collect();

        for job in state.jobs() {
            if !eligible.contains(&job.project) {
                continue;
            }
            if !(job.is_runnable() || job.is_nearly_runnable()) {
                continue;
            }
            let Some(remaining) = state.estimated_cpu_time_remaining(job.id) else {
                warn!(job_id = %job.id, job = %job.name, "job references a missing app version; skipped");
                continue;
            };
            if remaining <= 0.0 {
                output.jobs.insert(
                    job.id,
                    JobSimResult {
                        project: job.project,
                        finish_time: now,
                        deadline_missed: false,
                    },
                );
                continue;
            }
            let sim_job = SimJob {
                id: job.id,
                remaining,
                avg_ncpus: state.avg_ncpus(job.id).min(f64::from(self.host.ncpus())),
                computation_deadline: job.computation_deadline(&self.prefs),
            };
            queued.push((job.report_deadline, job.id, job.project, sim_job));
        }

        queued.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
        for (_, _, pid, sim_job) in queued {
            let entry = projects.entry(pid).or_insert_with(|| {
                let project = state.project(pid);
                SimProject {
                    share: project.map_or(1.0, Project::effective_share),
                    long_term_debt: project.map_or(0.0, |p| p.long_term_debt),
                    ..SimProject::default()
                }
            });
            entry.pending.push_back(sim_job);
        }
        projects
    }

    fn finish(&self, output: &mut RrSimOutput, project: ProjectId, job: &SimJob, at: f64) {
        let missed = at > job.computation_deadline;
        output.jobs.insert(
            job.id,
            JobSimResult {
                project,
                finish_time: at,
                deadline_missed: missed,
            },
        );
        if missed {
            let entry = output.projects.entry(project).or_default();
            entry.deadlines_missed = entry.deadlines_missed.saturating_add(1);
        }
        if self.verbose {
            debug!(
                job_id = %job.id,
                project_id = %project,
                finish_time = at,
                deadline_missed = missed,
                "rr_sim job finished"
            );
        }
    }
}

/// Fill spare simulated slots, most-owed project first.
fn activate(projects: &mut BTreeMap<ProjectId, SimProject>, ncpus: usize) {
    loop {
        let pick = projects
            .iter()
            .filter(|(_, p)| !p.pending.is_empty() && p.active.len() < ncpus)
            .map(|(&id, p)| (id, p.long_term_debt - p.debt_spent))
            // max_by keeps the last maximum; reverse the ID order so the
            // lowest ID wins ties.
            .max_by(|a, b| a.1.total_cmp(&b.1).then(b.0.cmp(&a.0)))
            .map(|(id, _)| id);
        let Some(pid) = pick else {
            return;
        };
        let Some(project) = projects.get_mut(&pid) else {
            return;
        };
        if let Some(job) = project.pending.pop_front() {
            project.debt_spent += job.remaining;
            project.active.push(job);
        }
    }
}

/// Per-job simulated CPU rate.
fn job_rates(projects: &BTreeMap<ProjectId, SimProject>, effective_ncpus: f64) -> BTreeMap<JobId, f64> {
    let sharing: Vec<&SimProject> = projects.values().filter(|p| p.has_work()).collect();
    let total_share: f64 = sharing.iter().map(|p| p.share).sum();
    let mut rates = BTreeMap::new();
    for project in projects.values() {
        if project.active.is_empty() {
            continue;
        }
        let frac = share_fraction(project.share, total_share, sharing.len());
        let per_job = effective_ncpus * frac / project.active.len() as f64;
        for job in &project.active {
            rates.insert(job.id, per_job.min(job.avg_ncpus).max(f64::MIN_POSITIVE));
        }
    }
    rates
}

fn overlap(a: (f64, f64), b: (f64, f64)) -> f64 {
    (a.1.min(b.1) - a.0.max(b.0)).max(0.0)
}

fn accrue_shortfall(
    output: &mut RrSimOutput,
    fair_rates: &BTreeMap<ProjectId, f64>,
    project_rates: &BTreeMap<ProjectId, f64>,
    span: (f64, f64),
    (now, window_end, min_window_end): (f64, f64, f64),
) {
    let full = overlap(span, (now, window_end));
    let min = overlap(span, (now, min_window_end));
    if full <= 0.0 {
        return;
    }
    for (pid, &fair) in fair_rates {
        let used = project_rates.get(pid).copied().unwrap_or(0.0);
        let gap = (fair - used).max(0.0);
        if gap <= 0.0 {
            continue;
        }
        let entry = output.projects.entry(*pid).or_default();
        entry.cpu_shortfall += gap * full;
        entry.min_buf_shortfall += gap * min;
    }
}
