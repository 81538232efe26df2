//! The scheduling context and its poll loop.
//!
//! [`Client`] owns the model, the executor handle and the per-component
//! state. Everything happens synchronously inside [`Client::poll`]:
//!
//! 1. sync with the executor (progress, completions, CPU charging)
//! 2. if a reschedule is due: adjust debts, simulate, select and enforce
//! 3. if a work-fetch check is due: simulate if stale, run work fetch
//!
//! External events (scheduler replies, user actions, transfer callbacks)
//! are applied between polls through the entry points below; each one sets
//! the trigger flags it needs.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::cpu_sched::{CpuScheduler, EnforceReport};
use crate::debt::{DebtLedger, DebtUpdate};
use crate::error::ModelError;
use crate::executor::{TaskExecutor, TaskState};
use crate::model::{ClientState, JobId, JobState, NewJob, ProjectId};
use crate::rpc::{SchedulerReply, WorkRequest, find_app_version};
use crate::rr_sim::{RrSimOutput, RrSimulator};
use crate::triggers::{ScheduleReason, ScheduleTriggers};
use crate::work_fetch::{WorkFetch, WorkFetchDecision};

/// What one [`Client::poll`] did.
#[derive(Debug, Clone, Default)]
pub struct PollReport {
    pub now: f64,
    pub completed: Vec<JobId>,
    pub failed: Vec<JobId>,
    pub debt_update: Option<DebtUpdate>,
    /// Reasons served by the scheduling pass; empty on periodic passes.
    pub schedule_reasons: Vec<ScheduleReason>,
    pub enforce: Option<EnforceReport>,
    pub work_fetch: Option<WorkFetchDecision>,
}

impl PollReport {
    #[must_use]
    pub fn scheduled(&self) -> bool {
        self.enforce.is_some()
    }
}

/// Counts of what a scheduler reply changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReplyOutcome {
    pub jobs_added: usize,
    pub jobs_acked: usize,
    pub jobs_aborted: usize,
}

/// Explicit scheduling context.
#[derive(Debug)]
pub struct Client<E: TaskExecutor> {
    config: Config,
    state: ClientState,
    executor: E,
    ledger: DebtLedger,
    triggers: ScheduleTriggers,
    simulator: RrSimulator,
    scheduler: CpuScheduler,
    work_fetch: WorkFetch,
    last_rr: Option<RrSimOutput>,
    /// Jobs the last simulation expected to miss their deadline.
    deadline_misses: BTreeSet<JobId>,
    last_poll: Option<f64>,
    last_cpu_time: BTreeMap<JobId, f64>,
    running: BTreeSet<JobId>,
    outbox: Vec<WorkRequest>,
}

impl<E: TaskExecutor> Client<E> {
    pub fn new(config: Config, state: ClientState, executor: E, now: f64) -> Self {
        let mut client = Self {
            simulator: RrSimulator::new(&config),
            scheduler: CpuScheduler::new(&config),
            work_fetch: WorkFetch::new(&config),
            config,
            state,
            executor,
            ledger: DebtLedger::new(now),
            triggers: ScheduleTriggers::new(),
            last_rr: None,
            deadline_misses: BTreeSet::new(),
            last_poll: None,
            last_cpu_time: BTreeMap::new(),
            running: BTreeSet::new(),
            outbox: Vec::new(),
        };
        if client.config.scheduler.zero_debts {
            client.state.zero_debts();
        }
        client.triggers.request_schedule_cpus(ScheduleReason::Startup);
        client.triggers.request_work_fetch(ScheduleReason::Startup);
        client
    }

    // -------------------------------------------------------------------------
    // Accessors
    // -------------------------------------------------------------------------

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    #[must_use]
    pub fn state(&self) -> &ClientState {
        &self.state
    }

    /// Direct model access for the state-file and transfer layers. Callers
    /// must raise the matching trigger themselves.
    pub fn state_mut(&mut self) -> &mut ClientState {
        &mut self.state
    }

    #[must_use]
    pub fn executor(&self) -> &E {
        &self.executor
    }

    pub fn executor_mut(&mut self) -> &mut E {
        &mut self.executor
    }

    #[must_use]
    pub fn triggers(&self) -> &ScheduleTriggers {
        &self.triggers
    }

    #[must_use]
    pub fn ledger(&self) -> &DebtLedger {
        &self.ledger
    }

    /// Last complete simulation output.
    #[must_use]
    pub fn last_rr(&self) -> Option<&RrSimOutput> {
        self.last_rr.as_ref()
    }

    /// Drain work requests produced since the last call.
    /// Jobs the most recent simulation expects to miss their deadline.
    #[must_use]
    pub fn deadline_misses(&self) -> &BTreeSet<JobId> {
        &self.deadline_misses
    }

    pub fn take_work_requests(&mut self) -> Vec<WorkRequest> {
        std::mem::take(&mut self.outbox)
    }

    pub fn request_schedule_cpus(&mut self, reason: ScheduleReason) {
        self.triggers.request_schedule_cpus(reason);
    }

    pub fn request_work_fetch(&mut self, reason: ScheduleReason) {
        self.triggers.request_work_fetch(reason);
    }

    // -------------------------------------------------------------------------
    // Poll loop
    // -------------------------------------------------------------------------

    /// Run one iteration at `now`.
    pub fn poll(&mut self, now: f64) -> PollReport {
        let mut report = PollReport {
            now,
            ..PollReport::default()
        };

        self.sync_executor(now, &mut report);

        if let Some(last) = self.last_poll {
            let lifted = self
                .state
                .projects()
                .any(|p| p.compute_backoff_until > last && p.compute_backoff_until <= now);
            if lifted {
                self.triggers.request_schedule_cpus(ScheduleReason::ProjectBackoff);
            }
        }

        if self
            .triggers
            .schedule_due(now, self.config.prefs.cpu_scheduling_period_secs)
        {
            report.debt_update = self.ledger.adjust_debts(&mut self.state, &self.config, now);
            let rr = self.simulate(now);
            let enforce = self
                .scheduler
                .enforce(&mut self.state, &mut self.executor, &rr, now);
            if !enforce.start_failures.is_empty() {
                self.triggers.request_work_fetch(ScheduleReason::StartFailed);
            }
            report.schedule_reasons = self.triggers.mark_scheduled(now);
            if !report.schedule_reasons.is_empty() {
                debug!(reasons = ?report.schedule_reasons, "reschedule served");
            }
            report.enforce = Some(enforce);
        }

        if self
            .triggers
            .work_fetch_due(now, self.config.scheduler.work_fetch_poll_secs)
        {
            let rr = match self.last_rr.as_ref().filter(|rr| rr.now == now) {
                Some(rr) => rr.clone(),
                None => self.simulate(now),
            };
            let decision = self.work_fetch.compute(&mut self.state, &rr, now);
            self.outbox.extend(decision.requests.iter().cloned());
            self.triggers.mark_work_fetched(now);
            report.work_fetch = Some(decision);
        }

        self.running = self
            .executor
            .task_states()
            .into_iter()
            .filter(|t| t.state == TaskState::Executing)
            .map(|t| t.job)
            .collect();
        self.last_poll = Some(now);
        report
    }

    /// Poll on a tokio interval until `shutdown` is set.
    pub async fn run(&mut self, shutdown: Arc<AtomicBool>) {
        let interval = Duration::from_millis(self.config.scheduler.poll_interval_ms.max(1));
        let mut ticker = tokio::time::interval(interval);

        loop {
            ticker.tick().await;
            if shutdown.load(Ordering::SeqCst) {
                break;
            }

            let report = self.poll(unix_now());
            if let Some(enforce) = &report.enforce {
                if !enforce.commands.is_empty() {
                    info!(
                        commands = enforce.commands.len(),
                        running = enforce.selection.jobs.len(),
                        "scheduling pass changed running set"
                    );
                }
            }
        }
        info!("scheduling loop stopped");
    }

    /// Simulate and remember the output; a truncated pass falls back to the
    /// last complete one.
    fn simulate(&mut self, now: f64) -> RrSimOutput {
        let rr = self.simulator.simulate(&self.state, now);
        let rr = if rr.truncated {
            match &self.last_rr {
                Some(last) => {
                    warn!("using previous simulation output");
                    last.clone()
                }
                None => rr,
            }
        } else {
            self.last_rr = Some(rr.clone());
            rr
        };
        self.track_deadline_misses(&rr);
        rr.apply_to(&mut self.state);
        rr
    }

    /// Remember which jobs are projected to miss and log the ones whose
    /// outlook changed since the previous pass.
    fn track_deadline_misses(&mut self, rr: &RrSimOutput) {
        let misses: BTreeSet<JobId> = rr
            .jobs
            .iter()
            .filter(|(_, r)| r.deadline_missed)
            .map(|(&id, _)| id)
            .collect();
        if self.config.log_flags.rr_simulation {
            for &id in misses.difference(&self.deadline_misses) {
                let job = self.state.job(id).map(|j| j.name.as_str()).unwrap_or_default();
                info!(job_id = %id, job, "job projected to miss its deadline");
            }
            for &id in self.deadline_misses.difference(&misses) {
                // Jobs that left the simulation finished or were removed.
                if let Some(job) = self.state.job(id).filter(|_| rr.jobs.contains_key(&id)) {
                    info!(job_id = %id, job = %job.name, "job no longer projected to miss its deadline");
                }
            }
        }
        self.deadline_misses = misses;
    }

    fn sync_executor(&mut self, now: f64, report: &mut PollReport) {
        let elapsed = self.last_poll.map_or(0.0, |last| (now - last).max(0.0));
        let verbose = self.config.log_flags.task_debug;

        for status in self.executor.task_states() {
            let Some(job) = self.state.job(status.job) else {
                warn!(job_id = %status.job, state = ?status.state, "executor reports an unknown job; skipped");
                if matches!(status.state, TaskState::Exited { .. }) {
                    self.executor.reap(status.job);
                    self.last_cpu_time.remove(&status.job);
                }
                continue;
            };
            let project = job.project;
            let prev_cpu = self.last_cpu_time.get(&status.job).copied().unwrap_or(job.cpu_time);
            let cpu_delta = (status.cpu_time - prev_cpu).max(0.0);
            let wall = if self.running.contains(&status.job) {
                elapsed * self.state.avg_ncpus(status.job)
            } else {
                0.0
            };
            self.ledger.charge(project, wall, cpu_delta);
            self.last_cpu_time.insert(status.job, status.cpu_time);

            if let Some(job) = self.state.job_mut(status.job) {
                job.cpu_time = status.cpu_time;
                job.fraction_done = status.fraction_done.clamp(0.0, 1.0);
            }
            if verbose {
                debug!(
                    job_id = %status.job,
                    state = ?status.state,
                    cpu_time = status.cpu_time,
                    fraction_done = status.fraction_done,
                    "task status"
                );
            }

            if let TaskState::Exited { success } = status.state {
                self.executor.reap(status.job);
                self.last_cpu_time.remove(&status.job);
                if success {
                    self.finish_job(status.job);
                    report.completed.push(status.job);
                    self.triggers.request_schedule_cpus(ScheduleReason::JobCompleted);
                } else {
                    self.fail_job(status.job);
                    report.failed.push(status.job);
                    self.triggers.request_schedule_cpus(ScheduleReason::JobFailed);
                }
                self.triggers.request_work_fetch(ScheduleReason::JobCompleted);
            }
        }
        debug!(now, elapsed, "executor synced");
    }

    fn finish_job(&mut self, id: JobId) {
        let Some(job) = self.state.job(id) else {
            return;
        };
        if job.state.is_computing_done() {
            return;
        }
        let app_version = job.app_version;
        let cpu_time = job.cpu_time;
        let fpops_est = job.fpops_est;
        if let Some(av) = self.state.app_version_mut(app_version) {
            let raw_estimate = fpops_est / av.flops;
            if raw_estimate > 0.0 {
                av.update_duration_correction_factor(cpu_time / raw_estimate);
            }
        }
        match self.state.transition_job(id, JobState::FilesUploading) {
            Ok(_) => info!(job_id = %id, cpu_time, "job finished computing"),
            Err(err) => warn!(%err, "could not record job completion"),
        }
    }

    fn fail_job(&mut self, id: JobId) {
        let Some(job) = self.state.job(id) else {
            return;
        };
        if job.state == JobState::Aborted || job.state == JobState::ComputeError {
            return;
        }
        match self.state.transition_job(id, JobState::ComputeError) {
            Ok(_) => warn!(job_id = %id, "job exited with an error"),
            Err(err) => warn!(%err, "could not record job failure"),
        }
    }

    // -------------------------------------------------------------------------
    // External events
    // -------------------------------------------------------------------------

    /// Apply a scheduler reply from `project`.
    pub fn handle_scheduler_reply(
        &mut self,
        project: ProjectId,
        reply: SchedulerReply,
    ) -> Result<ReplyOutcome, ModelError> {
        let p = self
            .state
            .project_mut(project)
            .ok_or(ModelError::UnknownProject(project))?;
        if let Some(t) = reply.min_rpc_time {
            p.min_rpc_time = t;
        }
        if let Some(flag) = reply.dont_request_more_work {
            p.dont_request_more_work = flag;
        }
        if let Some(flag) = reply.detach_when_done {
            p.detach_when_done = flag;
        }
        if let Some(share) = reply.resource_share {
            self.state.set_resource_share(project, share)?;
        }

        for spec in reply.app_versions {
            if find_app_version(&self.state, project, &spec.app_name, spec.version_num).is_none() {
                self.state.add_app_version(project, spec)?;
            }
        }

        let mut outcome = ReplyOutcome::default();
        for job in reply.jobs {
            let Some(app_version) =
                find_app_version(&self.state, project, &job.app_name, job.version_num)
            else {
                warn!(
                    job = %job.name,
                    app = %job.app_name,
                    version = job.version_num,
                    "reply job references an unknown app version; skipped"
                );
                continue;
            };
            let spec = NewJob {
                name: job.name,
                app_version,
                report_deadline: job.report_deadline,
                fpops_est: job.fpops_est,
                state: JobState::FilesDownloading,
            };
            match self.state.add_job(project, spec) {
                Ok(_) => outcome.jobs_added += 1,
                Err(err) => warn!(%err, "reply job rejected"),
            }
        }

        for name in &reply.acked {
            let Some(job) = self.state.find_job(project, name) else {
                continue;
            };
            if job.state >= JobState::FilesUploaded {
                let id = job.id;
                self.state.remove_job(id)?;
                self.last_cpu_time.remove(&id);
                outcome.jobs_acked += 1;
            } else {
                warn!(job = %name, state = %job.state, "ack for a job that is not uploaded");
            }
        }

        for name in &reply.aborts {
            if let Some(id) = self.state.find_job(project, name).map(|j| j.id) {
                if self.abort_task(id) {
                    outcome.jobs_aborted += 1;
                }
            }
        }

        if outcome.jobs_added > 0 || outcome.jobs_aborted > 0 {
            self.triggers.request_schedule_cpus(ScheduleReason::SchedulerReply);
        }
        self.triggers.request_work_fetch(ScheduleReason::SchedulerReply);
        info!(
            project_id = %project,
            jobs_added = outcome.jobs_added,
            jobs_acked = outcome.jobs_acked,
            jobs_aborted = outcome.jobs_aborted,
            "scheduler reply applied"
        );
        Ok(outcome)
    }

    /// All input files of `job` are present.
    pub fn job_input_ready(&mut self, job: JobId) -> Result<(), ModelError> {
        self.state.transition_job(job, JobState::FilesDownloaded)?;
        if let Some(j) = self.state.job_mut(job) {
            j.download_stalled = false;
        }
        self.triggers.request_schedule_cpus(ScheduleReason::InputFilesReady);
        self.triggers.request_work_fetch(ScheduleReason::InputFilesReady);
        Ok(())
    }

    /// All output files of `job` are uploaded.
    pub fn job_upload_complete(&mut self, job: JobId) -> Result<(), ModelError> {
        self.state.transition_job(job, JobState::FilesUploaded)?;
        self.triggers.request_work_fetch(ScheduleReason::JobCompleted);
        Ok(())
    }

    pub fn attach_project(&mut self, url: &str, resource_share: f64) -> Result<ProjectId, ModelError> {
        let id = self.state.attach_project(url, resource_share)?;
        info!(project = url, resource_share, "project attached");
        self.triggers.request_schedule_cpus(ScheduleReason::ProjectAttached);
        self.triggers.request_work_fetch(ScheduleReason::ProjectAttached);
        Ok(id)
    }

    pub fn detach_project(&mut self, project: ProjectId) -> Result<(), ModelError> {
        self.abort_project_tasks(project);
        let removed = self.state.detach_project(project)?;
        info!(project = %removed.url, "project detached");
        self.triggers.request_schedule_cpus(ScheduleReason::ProjectDetached);
        self.triggers.request_work_fetch(ScheduleReason::ProjectDetached);
        Ok(())
    }

    /// Drop every job of a project and its debts, keeping it attached.
    pub fn reset_project(&mut self, project: ProjectId) -> Result<(), ModelError> {
        if self.state.project(project).is_none() {
            return Err(ModelError::UnknownProject(project));
        }
        self.abort_project_tasks(project);
        let jobs: Vec<JobId> = self.state.jobs_of(project).map(|j| j.id).collect();
        for id in jobs {
            self.state.remove_job(id)?;
            self.last_cpu_time.remove(&id);
        }
        if let Some(p) = self.state.project_mut(project) {
            p.short_term_debt = 0.0;
            p.long_term_debt = 0.0;
            p.anticipated_debt = 0.0;
            p.min_rpc_time = 0.0;
            p.compute_backoff_until = 0.0;
        }
        self.triggers.request_schedule_cpus(ScheduleReason::ProjectReset);
        self.triggers.request_work_fetch(ScheduleReason::ProjectReset);
        Ok(())
    }

    /// Keep `project`'s jobs off the CPU until `until`, e.g. while its file
    /// transfers are backed off. A time in the past lifts the hold.
    pub fn set_project_compute_backoff(&mut self, project: ProjectId, until: f64) -> Result<(), ModelError> {
        let p = self
            .state
            .project_mut(project)
            .ok_or(ModelError::UnknownProject(project))?;
        p.compute_backoff_until = if until.is_finite() { until } else { 0.0 };
        info!(project = %p.url, until, "project compute backoff set");
        self.triggers.request_schedule_cpus(ScheduleReason::ProjectBackoff);
        Ok(())
    }

    pub fn suspend_project(&mut self, project: ProjectId) -> Result<(), ModelError> {
        self.set_project_suspended(project, true, ScheduleReason::ProjectSuspended)
    }

    pub fn resume_project(&mut self, project: ProjectId) -> Result<(), ModelError> {
        self.set_project_suspended(project, false, ScheduleReason::ProjectResumed)
    }

    fn set_project_suspended(
        &mut self,
        project: ProjectId,
        suspended: bool,
        reason: ScheduleReason,
    ) -> Result<(), ModelError> {
        let p = self
            .state
            .project_mut(project)
            .ok_or(ModelError::UnknownProject(project))?;
        p.suspended_via_gui = suspended;
        self.triggers.request_schedule_cpus(reason);
        self.triggers.request_work_fetch(reason);
        Ok(())
    }

    pub fn suspend_job(&mut self, job: JobId) -> Result<(), ModelError> {
        self.set_job_suspended(job, true, ScheduleReason::UserSuspend)
    }

    pub fn resume_job(&mut self, job: JobId) -> Result<(), ModelError> {
        self.set_job_suspended(job, false, ScheduleReason::UserResume)
    }

    fn set_job_suspended(
        &mut self,
        job: JobId,
        suspended: bool,
        reason: ScheduleReason,
    ) -> Result<(), ModelError> {
        let j = self.state.job_mut(job).ok_or(ModelError::UnknownJob(job))?;
        j.suspended_via_gui = suspended;
        self.triggers.request_schedule_cpus(reason);
        self.triggers.request_work_fetch(reason);
        Ok(())
    }

    /// Abort a job on user request.
    pub fn abort_job(&mut self, job: JobId) -> Result<(), ModelError> {
        if self.state.job(job).is_none() {
            return Err(ModelError::UnknownJob(job));
        }
        self.abort_task(job);
        self.triggers.request_schedule_cpus(ScheduleReason::UserAbort);
        self.triggers.request_work_fetch(ScheduleReason::UserAbort);
        Ok(())
    }

    /// Kill the task and mark the job aborted. Returns whether the job moved.
    fn abort_task(&mut self, job: JobId) -> bool {
        self.executor.abort(job);
        self.executor.reap(job);
        self.last_cpu_time.remove(&job);
        self.running.remove(&job);
        match self.state.transition_job(job, JobState::Aborted) {
            Ok(_) => {
                info!(job_id = %job, "job aborted");
                true
            }
            Err(err) => {
                debug!(%err, "abort ignored");
                false
            }
        }
    }

    fn abort_project_tasks(&mut self, project: ProjectId) {
        let jobs: Vec<JobId> = self.state.jobs_of(project).map(|j| j.id).collect();
        for id in jobs {
            self.executor.abort(id);
            self.executor.reap(id);
            self.running.remove(&id);
        }
    }

    /// Reset all debts on user request.
    pub fn zero_debts(&mut self) {
        self.state.zero_debts();
        info!("all debts zeroed");
        self.triggers.request_schedule_cpus(ScheduleReason::ZeroDebts);
        self.triggers.request_work_fetch(ScheduleReason::ZeroDebts);
    }

    /// Swap in a new configuration and rebuild the components.
    pub fn reload_config(&mut self, config: Config) {
        self.simulator = RrSimulator::new(&config);
        self.scheduler = CpuScheduler::new(&config);
        self.work_fetch = WorkFetch::new(&config);
        let zero = config.scheduler.zero_debts;
        self.config = config;
        self.last_rr = None;
        if zero {
            self.state.zero_debts();
            info!("all debts zeroed by config");
        }
        self.triggers.request_schedule_cpus(ScheduleReason::ConfigReload);
        self.triggers.request_work_fetch(ScheduleReason::ConfigReload);
    }
}

/// Seconds since the Unix epoch.
#[must_use]
pub fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0.0, |d| d.as_secs_f64())
}
