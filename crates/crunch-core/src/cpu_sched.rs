//! CPU scheduler: pick which runnable jobs execute now.
//!
//! Selection has two tiers:
//!
//! 1. Jobs at deadline risk (flagged by the round-robin simulation, or whose
//!    computation deadline falls inside the next scheduling period), earliest
//!    deadline first.
//! 2. Remaining slots go to the project with the highest anticipated debt.
//!    Anticipated debt starts at the project's short-term debt and drops each
//!    time one of its jobs is picked, so a single project cannot grab every
//!    slot unless it is owed that much.
//!
//! [`CpuScheduler::enforce`] then reconciles the selection with what the
//! executor is running, issuing the minimum set of commands. Re-running it
//! with no state change issues nothing.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::{Config, HostConfig, Preferences};
use crate::error::ExecutorError;
use crate::executor::{TaskCommand, TaskExecutor, TaskState, TaskStatus};
use crate::model::{ClientState, JobId, ProjectId, share_fraction};
use crate::rr_sim::RrSimOutput;

/// Slack when comparing slot sums.
const SLOT_EPSILON: f64 = 1e-9;

/// Result of one selection pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Selection {
    /// Jobs chosen to run, in pick order. Includes non-CPU-intensive jobs.
    pub jobs: Vec<JobId>,
    /// Subset of `jobs` chosen for deadline risk.
    pub deadline_jobs: Vec<JobId>,
    /// Subset of `jobs` from non-CPU-intensive projects (no slot used).
    pub non_cpu_jobs: Vec<JobId>,
    /// CPU slots consumed.
    pub slots_used: f64,
}

impl Selection {
    #[must_use]
    pub fn contains(&self, job: JobId) -> bool {
        self.jobs.contains(&job)
    }
}

/// A start or resume the executor rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartFailure {
    pub job: JobId,
    pub error: ExecutorError,
}

/// Outcome of [`CpuScheduler::enforce`].
#[derive(Debug, Clone, Default)]
pub struct EnforceReport {
    pub selection: Selection,
    /// Commands the executor accepted, in issue order.
    pub commands: Vec<TaskCommand>,
    pub start_failures: Vec<StartFailure>,
}

/// Chooses and enforces the running set.
#[derive(Debug, Clone)]
pub struct CpuScheduler {
    host: HostConfig,
    prefs: Preferences,
    start_failure_backoff_secs: f64,
    verbose: bool,
}

impl CpuScheduler {
    #[must_use]
    pub fn new(config: &Config) -> Self {
        Self {
            host: config.host.clone(),
            prefs: config.prefs.clone(),
            start_failure_backoff_secs: config.scheduler.start_failure_backoff_secs,
            verbose: config.log_flags.cpu_sched_debug,
        }
    }

    /// Choose the jobs that should be running at `now`.
    ///
    /// Resets and consumes each project's `anticipated_debt`; nothing else in
    /// the model is touched.
    pub fn select(
        &self,
        state: &mut ClientState,
        rr: &RrSimOutput,
        tasks: &BTreeMap<JobId, TaskStatus>,
        now: f64,
    ) -> Selection {
        self.select_excluding(state, rr, tasks, now, &BTreeSet::new())
    }

    fn select_excluding(
        &self,
        state: &mut ClientState,
        rr: &RrSimOutput,
        tasks: &BTreeMap<JobId, TaskStatus>,
        now: f64,
        excluded: &BTreeSet<JobId>,
    ) -> Selection {
        let ncpus = self.host.ncpus();
        let slots_total = f64::from(ncpus);
        let period = self.prefs.cpu_scheduling_period_secs;

        let mut selection = Selection::default();
        let mut cpu_candidates: Vec<JobId> = Vec::new();
        for job in state.jobs() {
            let Some(project) = state.project(job.project) else {
                warn!(job_id = %job.id, "job belongs to a missing project; skipped");
                continue;
            };
            if state.app_version(job.app_version).is_none() {
                warn!(job_id = %job.id, job = %job.name, "job references a missing app version; skipped");
                continue;
            }
            if !job.is_runnable() || project.suspended_via_gui || project.in_compute_backoff(now) {
                continue;
            }
            if tasks.get(&job.id).is_some_and(|t| t.state.is_terminating()) {
                continue;
            }
            if job.start_backoff_until > now || excluded.contains(&job.id) {
                continue;
            }
            if project.non_cpu_intensive {
                selection.jobs.push(job.id);
                selection.non_cpu_jobs.push(job.id);
            } else {
                cpu_candidates.push(job.id);
            }
        }

        // Anticipated debt is a per-pass working copy.
        let runnable_projects: BTreeSet<ProjectId> = cpu_candidates
            .iter()
            .filter_map(|&id| state.job(id))
            .map(|job| job.project)
            .collect();
        let total_share: f64 = runnable_projects
            .iter()
            .filter_map(|&id| state.project(id))
            .map(|p| p.effective_share())
            .sum();
        let mut debt_step: BTreeMap<ProjectId, f64> = BTreeMap::new();
        for project in state.projects_mut() {
            project.anticipated_debt = project.short_term_debt;
            if runnable_projects.contains(&project.id) {
                let frac = share_fraction(project.effective_share(), total_share, runnable_projects.len());
                debt_step.insert(project.id, (1.0 - frac) * period / f64::from(ncpus));
            }
        }

        let take = |state: &mut ClientState, selection: &mut Selection, id: JobId, need: f64| {
            selection.jobs.push(id);
            selection.slots_used += need;
            if let Some(project_id) = state.job(id).map(|j| j.project) {
                if let Some(project) = state.project_mut(project_id) {
                    project.anticipated_debt -= debt_step.get(&project_id).copied().unwrap_or(0.0);
                }
            }
        };

        // Tier (a): deadline risk, earliest deadline first.
        let mut at_risk: Vec<(f64, JobId)> = cpu_candidates
            .iter()
            .filter_map(|&id| state.job(id))
            .filter(|job| rr.job_missed_deadline(job.id) || job.computation_deadline(&self.prefs) < now + period)
            .map(|job| (job.computation_deadline(&self.prefs), job.id))
            .collect();
        at_risk.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
        for (deadline, id) in at_risk {
            let need = self.slots_needed(state, id);
            if selection.slots_used + need > slots_total + SLOT_EPSILON {
                continue;
            }
            take(state, &mut selection, id, need);
            selection.deadline_jobs.push(id);
            if self.verbose {
                debug!(job_id = %id, computation_deadline = deadline, "selected for deadline risk");
            }
        }

        // Tier (b): highest anticipated debt.
        let mut remaining: Vec<JobId> = cpu_candidates
            .iter()
            .copied()
            .filter(|id| !selection.jobs.contains(id))
            .collect();
        while selection.slots_used + SLOT_EPSILON < slots_total && !remaining.is_empty() {
            let Some(project_id) = best_project(state, &remaining) else {
                break;
            };
            let Some(id) = best_job_of(state, tasks, &remaining, project_id) else {
                break;
            };
            remaining.retain(|&j| j != id);
            let need = self.slots_needed(state, id);
            if selection.slots_used + need > slots_total + SLOT_EPSILON {
                continue;
            }
            take(state, &mut selection, id, need);
            if self.verbose {
                let debt = state.project(project_id).map_or(0.0, |p| p.anticipated_debt);
                debug!(job_id = %id, project_id = %project_id, anticipated_debt = debt, "selected by debt");
            }
        }

        selection
    }

    /// Select, then start, resume and preempt tasks to match.
    ///
    /// A job whose start fails is backed off and its slots are refilled from
    /// the next candidates in the same pass. A failed job is not retried
    /// within the pass, so each job is attempted at most once.
    pub fn enforce<E: TaskExecutor>(
        &self,
        state: &mut ClientState,
        executor: &mut E,
        rr: &RrSimOutput,
        now: f64,
    ) -> EnforceReport {
        let mut report = EnforceReport::default();
        let mut failed_this_pass: BTreeSet<JobId> = BTreeSet::new();

        let selection = loop {
            let tasks = task_map(executor);
            let selection = self.select_excluding(state, rr, &tasks, now, &failed_this_pass);
            let mut failed = false;
            for &id in &selection.jobs {
                let command = match tasks.get(&id).map(|t| t.state) {
                    Some(TaskState::Executing) => continue,
                    Some(TaskState::Suspended) => TaskCommand::Resume { job: id },
                    _ => TaskCommand::Start { job: id },
                };
                match executor.execute(command) {
                    Ok(()) => {
                        if self.verbose {
                            debug!(?command, "task command issued");
                        }
                        report.commands.push(command);
                    }
                    Err(error) => {
                        let until = now + self.start_failure_backoff_secs;
                        if let Some(job) = state.job_mut(id) {
                            job.start_backoff_until = until;
                        }
                        warn!(job_id = %id, %error, retry_at = until, "task failed to start; backing off");
                        failed_this_pass.insert(id);
                        report.start_failures.push(StartFailure { job: id, error });
                        failed = true;
                        break;
                    }
                }
            }
            if !failed {
                break selection;
            }
        };

        let leave_in_memory = self.prefs.leave_apps_in_memory;
        for status in executor.task_states() {
            if status.state == TaskState::Executing && !selection.contains(status.job) {
                let command = TaskCommand::Preempt {
                    job: status.job,
                    leave_in_memory,
                };
                match executor.execute(command) {
                    Ok(()) => {
                        if self.verbose {
                            debug!(?command, "task command issued");
                        }
                        report.commands.push(command);
                    }
                    Err(error) => warn!(job_id = %status.job, %error, "preempt failed"),
                }
            }
        }

        if !report.commands.is_empty() {
            info!(
                running = selection.jobs.len(),
                slots_used = selection.slots_used,
                commands = report.commands.len(),
                "schedule enforced"
            );
        }
        report.selection = selection;
        report
    }

    fn slots_needed(&self, state: &ClientState, job: JobId) -> f64 {
        state.avg_ncpus(job).min(f64::from(self.host.ncpus()))
    }
}

/// Executor states keyed by job.
#[must_use]
pub fn task_map<E: TaskExecutor + ?Sized>(executor: &E) -> BTreeMap<JobId, TaskStatus> {
    executor
        .task_states()
        .into_iter()
        .map(|status| (status.job, status))
        .collect()
}

/// Project with the highest anticipated debt among the remaining jobs; ties
/// go to the project owning the earliest-inserted job.
fn best_project(state: &ClientState, remaining: &[JobId]) -> Option<ProjectId> {
    let mut best: Option<(f64, ProjectId)> = None;
    for &id in remaining {
        let Some(project) = state.job(id).and_then(|j| state.project(j.project)) else {
            continue;
        };
        // `remaining` is in insertion order, so only a strictly larger debt
        // displaces an earlier project.
        if best.is_none_or(|(debt, _)| project.anticipated_debt > debt) {
            best = Some((project.anticipated_debt, project.id));
        }
    }
    best.map(|(_, id)| id)
}

/// Within a project: an executing job, then one with progress, then the
/// earliest inserted.
fn best_job_of(
    state: &ClientState,
    tasks: &BTreeMap<JobId, TaskStatus>,
    remaining: &[JobId],
    project: ProjectId,
) -> Option<JobId> {
    remaining
        .iter()
        .copied()
        .filter_map(|id| state.job(id))
        .filter(|job| job.project == project)
        .min_by_key(|job| {
            let executing = tasks
                .get(&job.id)
                .is_some_and(|t| t.state == TaskState::Executing);
            let progressed = job.cpu_time > 0.0 || job.fraction_done > 0.0;
            (!executing, !progressed, job.id)
        })
        .map(|job| job.id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::InMemoryExecutor;
    use crate::model::{AppVersionId, JobState, NewAppVersion, NewJob};
    use crate::rr_sim::RrSimulator;

    fn config(ncpus: u32) -> Config {
        let mut config = Config::default();
        config.host = HostConfig::with_ncpus(ncpus);
        config
    }

    fn project(state: &mut ClientState, url: &str, avg_ncpus: f64) -> (ProjectId, AppVersionId) {
        let p = state.attach_project(url, 1.0).unwrap();
        let av = state
            .add_app_version(
                p,
                NewAppVersion {
                    app_name: "app".to_string(),
                    version_num: 1,
                    flops: 1.0,
                    avg_ncpus,
                },
            )
            .unwrap();
        (p, av)
    }

    fn job(state: &mut ClientState, p: ProjectId, av: AppVersionId, name: &str, deadline: f64) -> JobId {
        state
            .add_job(
                p,
                NewJob {
                    name: name.to_string(),
                    app_version: av,
                    report_deadline: deadline,
                    fpops_est: 3600.0,
                    state: JobState::FilesDownloaded,
                },
            )
            .unwrap()
    }

    const FAR: f64 = 1e9;

    #[test]
    fn highest_debt_project_wins_single_cpu() {
        let mut state = ClientState::new();
        let mut jobs = Vec::new();
        for (i, debt) in [-5.0, 0.0, 5.0].into_iter().enumerate() {
            let (p, av) = project(&mut state, &format!("https://p{i}.example/"), 1.0);
            state.project_mut(p).unwrap().short_term_debt = debt;
            jobs.push(job(&mut state, p, av, "wu", FAR));
        }
        let sched = CpuScheduler::new(&config(1));
        let sel = sched.select(&mut state, &RrSimOutput::default(), &BTreeMap::new(), 0.0);
        assert_eq!(sel.jobs, vec![jobs[2]]);
        assert!(sel.deadline_jobs.is_empty());
    }

    #[test]
    fn anticipated_debt_spreads_picks() {
        let mut state = ClientState::new();
        let (a, ava) = project(&mut state, "https://a.example/", 1.0);
        let (b, avb) = project(&mut state, "https://b.example/", 1.0);
        state.project_mut(a).unwrap().short_term_debt = 10.0;
        state.project_mut(b).unwrap().short_term_debt = 0.0;
        let a1 = job(&mut state, a, ava, "a1", FAR);
        let _a2 = job(&mut state, a, ava, "a2", FAR);
        let b1 = job(&mut state, b, avb, "b1", FAR);

        // Each pick lowers a's debt by 0.5 * 3600 / 2 = 900.
        let sched = CpuScheduler::new(&config(2));
        let sel = sched.select(&mut state, &RrSimOutput::default(), &BTreeMap::new(), 0.0);
        assert_eq!(sel.jobs, vec![a1, b1]);
        assert!((state.project(a).unwrap().anticipated_debt - (10.0 - 900.0)).abs() < 1e-9);
    }

    #[test]
    fn deadline_risk_beats_debt() {
        let mut state = ClientState::new();
        let (a, ava) = project(&mut state, "https://a.example/", 1.0);
        let (b, avb) = project(&mut state, "https://b.example/", 1.0);
        state.project_mut(a).unwrap().short_term_debt = 1000.0;
        job(&mut state, a, ava, "a", FAR);
        let urgent = job(&mut state, b, avb, "b", 100.0);
        let sched = CpuScheduler::new(&config(1));
        let sel = sched.select(&mut state, &RrSimOutput::default(), &BTreeMap::new(), 0.0);
        assert_eq!(sel.jobs, vec![urgent]);
        assert_eq!(sel.deadline_jobs, vec![urgent]);
    }

    #[test]
    fn simulator_flag_promotes_job() {
        let mut state = ClientState::new();
        let (a, ava) = project(&mut state, "https://a.example/", 1.0);
        let (b, avb) = project(&mut state, "https://b.example/", 1.0);
        state.project_mut(a).unwrap().short_term_debt = 1000.0;
        job(&mut state, a, ava, "a", FAR);
        let flagged = job(&mut state, b, avb, "b", FAR);
        let mut rr = RrSimOutput::default();
        rr.jobs.insert(
            flagged,
            crate::rr_sim::JobSimResult {
                project: b,
                finish_time: 0.0,
                deadline_missed: true,
            },
        );
        let sched = CpuScheduler::new(&config(1));
        let sel = sched.select(&mut state, &rr, &BTreeMap::new(), 0.0);
        assert_eq!(sel.jobs, vec![flagged]);
    }

    #[test]
    fn multithreaded_jobs_respect_slot_bound() {
        let mut state = ClientState::new();
        let (p, av) = project(&mut state, "https://mt.example/", 3.0);
        let (q, avq) = project(&mut state, "https://st.example/", 1.0);
        let mt1 = job(&mut state, p, av, "mt1", FAR);
        job(&mut state, p, av, "mt2", FAR);
        let st = job(&mut state, q, avq, "st", FAR);
        state.project_mut(p).unwrap().short_term_debt = 1.0;

        let sched = CpuScheduler::new(&config(4));
        let sel = sched.select(&mut state, &RrSimOutput::default(), &BTreeMap::new(), 0.0);
        assert!(sel.slots_used <= 4.0 + SLOT_EPSILON);
        assert!(sel.contains(mt1));
        assert!(sel.contains(st));
        assert_eq!(sel.jobs.len(), 2);
    }

    #[test]
    fn zero_ncpus_runs_one_job() {
        let mut state = ClientState::new();
        let (p, av) = project(&mut state, "https://a.example/", 1.0);
        job(&mut state, p, av, "a", FAR);
        job(&mut state, p, av, "b", FAR);
        let sched = CpuScheduler::new(&config(0));
        let sel = sched.select(&mut state, &RrSimOutput::default(), &BTreeMap::new(), 0.0);
        assert_eq!(sel.jobs.len(), 1);
    }

    #[test]
    fn non_cpu_intensive_jobs_take_no_slot() {
        let mut state = ClientState::new();
        let (n, avn) = project(&mut state, "https://trickle.example/", 1.0);
        state.project_mut(n).unwrap().non_cpu_intensive = true;
        let (p, av) = project(&mut state, "https://a.example/", 1.0);
        let trickle = job(&mut state, n, avn, "t", FAR);
        let cpu = job(&mut state, p, av, "c", FAR);
        let sched = CpuScheduler::new(&config(1));
        let sel = sched.select(&mut state, &RrSimOutput::default(), &BTreeMap::new(), 0.0);
        assert!(sel.contains(trickle) && sel.contains(cpu));
        assert_eq!(sel.non_cpu_jobs, vec![trickle]);
        assert!((sel.slots_used - 1.0).abs() < 1e-12);
    }

    #[test]
    fn suspended_and_backed_off_jobs_are_skipped() {
        let mut state = ClientState::new();
        let (p, av) = project(&mut state, "https://a.example/", 1.0);
        let s = job(&mut state, p, av, "s", FAR);
        let b = job(&mut state, p, av, "b", FAR);
        let ok = job(&mut state, p, av, "ok", FAR);
        state.job_mut(s).unwrap().suspended_via_gui = true;
        state.job_mut(b).unwrap().start_backoff_until = 100.0;
        let sched = CpuScheduler::new(&config(4));
        let sel = sched.select(&mut state, &RrSimOutput::default(), &BTreeMap::new(), 0.0);
        assert_eq!(sel.jobs, vec![ok]);
    }

    #[test]
    fn project_in_compute_backoff_is_skipped() {
        let mut state = ClientState::new();
        let (held, avh) = project(&mut state, "https://held.example/", 1.0);
        let (p, av) = project(&mut state, "https://a.example/", 1.0);
        state.project_mut(held).unwrap().short_term_debt = 1000.0;
        state.project_mut(held).unwrap().compute_backoff_until = 50.0;
        let h = job(&mut state, held, avh, "h", FAR);
        let ok = job(&mut state, p, av, "ok", FAR);
        let sched = CpuScheduler::new(&config(1));

        let sel = sched.select(&mut state, &RrSimOutput::default(), &BTreeMap::new(), 0.0);
        assert_eq!(sel.jobs, vec![ok]);

        let sel = sched.select(&mut state, &RrSimOutput::default(), &BTreeMap::new(), 50.0);
        assert_eq!(sel.jobs, vec![h]);
    }

    /// Executor that rejects every start and resume.
    #[derive(Default)]
    struct RefusingExecutor {
        attempts: usize,
    }

    impl TaskExecutor for RefusingExecutor {
        fn task_states(&self) -> Vec<TaskStatus> {
            Vec::new()
        }

        fn execute(&mut self, command: TaskCommand) -> Result<(), ExecutorError> {
            self.attempts += 1;
            assert!(self.attempts < 1000, "start retried {} times", self.attempts);
            Err(ExecutorError::ShmemUnavailable(command.job()))
        }

        fn abort(&mut self, _job: JobId) {}

        fn reap(&mut self, _job: JobId) {}
    }

    #[test]
    fn repeated_start_failures_end_the_pass() {
        let mut state = ClientState::new();
        let (p, av) = project(&mut state, "https://a.example/", 1.0);
        let a = job(&mut state, p, av, "a", FAR);
        let b = job(&mut state, p, av, "b", FAR);
        let mut cfg = config(1);
        // Unvalidated zero backoff: the failed job is eligible again at `now`.
        cfg.scheduler.start_failure_backoff_secs = 0.0;
        let sched = CpuScheduler::new(&cfg);
        let mut exec = RefusingExecutor::default();

        let report = sched.enforce(&mut state, &mut exec, &RrSimOutput::default(), 0.0);
        let failed: Vec<JobId> = report.start_failures.iter().map(|f| f.job).collect();
        assert_eq!(failed, vec![a, b]);
        assert_eq!(exec.attempts, 2);
        assert!(report.commands.is_empty());
        assert!(report.selection.jobs.is_empty());
    }

    #[test]
    fn enforce_starts_then_is_idempotent() {
        let mut state = ClientState::new();
        let (p, av) = project(&mut state, "https://a.example/", 1.0);
        let a = job(&mut state, p, av, "a", FAR);
        job(&mut state, p, av, "b", FAR);
        let cfg = config(1);
        let sched = CpuScheduler::new(&cfg);
        let mut exec = InMemoryExecutor::default();
        let rr = RrSimulator::new(&cfg).simulate(&state, 0.0);

        let first = sched.enforce(&mut state, &mut exec, &rr, 0.0);
        assert_eq!(first.commands, vec![TaskCommand::Start { job: a }]);

        let second = sched.enforce(&mut state, &mut exec, &rr, 0.0);
        assert!(second.commands.is_empty());
        assert_eq!(second.selection.jobs, vec![a]);
    }

    #[test]
    fn enforce_preempts_and_resumes() {
        let mut state = ClientState::new();
        let (a, ava) = project(&mut state, "https://a.example/", 1.0);
        let (b, avb) = project(&mut state, "https://b.example/", 1.0);
        let ja = job(&mut state, a, ava, "a", FAR);
        let jb = job(&mut state, b, avb, "b", FAR);
        let mut cfg = config(1);
        cfg.prefs.leave_apps_in_memory = true;
        let sched = CpuScheduler::new(&cfg);
        let mut exec = InMemoryExecutor::default();
        let rr = RrSimOutput::default();

        state.project_mut(a).unwrap().short_term_debt = 10.0;
        sched.enforce(&mut state, &mut exec, &rr, 0.0);
        assert_eq!(exec.executing(), vec![ja]);

        state.project_mut(a).unwrap().short_term_debt = -10.0;
        let report = sched.enforce(&mut state, &mut exec, &rr, 0.0);
        assert_eq!(
            report.commands,
            vec![
                TaskCommand::Start { job: jb },
                TaskCommand::Preempt {
                    job: ja,
                    leave_in_memory: true
                },
            ]
        );

        state.project_mut(a).unwrap().short_term_debt = 10.0;
        let report = sched.enforce(&mut state, &mut exec, &rr, 0.0);
        assert!(report.commands.contains(&TaskCommand::Resume { job: ja }));
    }

    #[test]
    fn start_failure_backs_off_and_fills_slot() {
        let mut state = ClientState::new();
        let (p, av) = project(&mut state, "https://a.example/", 1.0);
        let a = job(&mut state, p, av, "a", FAR);
        let b = job(&mut state, p, av, "b", FAR);
        let cfg = config(1);
        let sched = CpuScheduler::new(&cfg);
        let mut exec = InMemoryExecutor::default();
        exec.fail_next_start(a, ExecutorError::ShmemUnavailable(a));

        let report = sched.enforce(&mut state, &mut exec, &RrSimOutput::default(), 50.0);
        assert_eq!(report.start_failures.len(), 1);
        assert_eq!(report.start_failures[0].job, a);
        assert_eq!(report.commands, vec![TaskCommand::Start { job: b }]);
        assert!((state.job(a).unwrap().start_backoff_until - 650.0).abs() < 1e-9);
    }

    #[test]
    fn exiting_tasks_are_not_candidates() {
        let mut state = ClientState::new();
        let (p, av) = project(&mut state, "https://a.example/", 1.0);
        let a = job(&mut state, p, av, "a", FAR);
        let mut tasks = BTreeMap::new();
        tasks.insert(
            a,
            TaskStatus {
                job: a,
                state: TaskState::QuitPending,
                cpu_time: 0.0,
                fraction_done: 0.0,
                pid: None,
            },
        );
        let sched = CpuScheduler::new(&config(1));
        let sel = sched.select(&mut state, &RrSimOutput::default(), &tasks, 0.0);
        assert!(sel.jobs.is_empty());
    }

    #[test]
    fn executing_job_preferred_within_project() {
        let mut state = ClientState::new();
        let (p, av) = project(&mut state, "https://a.example/", 1.0);
        job(&mut state, p, av, "a", FAR);
        let b = job(&mut state, p, av, "b", FAR);
        let mut tasks = BTreeMap::new();
        tasks.insert(
            b,
            TaskStatus {
                job: b,
                state: TaskState::Executing,
                cpu_time: 5.0,
                fraction_done: 0.1,
                pid: Some(1),
            },
        );
        let sched = CpuScheduler::new(&config(1));
        let sel = sched.select(&mut state, &RrSimOutput::default(), &tasks, 0.0);
        assert_eq!(sel.jobs, vec![b]);
    }
}
