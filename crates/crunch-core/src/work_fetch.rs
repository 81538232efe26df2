//! Work-fetch policy.
//!
//! Decides whether the host needs more work, how urgently, and which single
//! CPU-intensive project to ask (and for how many CPU-seconds). Non-CPU-
//! intensive projects are handled on the side: each one with nothing in
//! flight asks for one job, independently of the main choice.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::{Config, HostConfig, Preferences};
use crate::model::{ClientState, Project, ProjectId, WorkFetchUrgency, share_fraction};
use crate::rpc::WorkRequest;
use crate::rr_sim::RrSimOutput;

/// Headroom over the full buffer allowed in a single request.
pub const REQUEST_CAP_FACTOR: f64 = 1.01;

/// Smallest non-empty request, in CPU-seconds.
pub const MIN_REQUEST_SECS: f64 = 1.0;

/// Outcome of one work-fetch pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkFetchDecision {
    pub overall: WorkFetchUrgency,
    pub per_project: BTreeMap<ProjectId, WorkFetchUrgency>,
    /// The CPU-intensive project chosen this pass, if any.
    pub chosen: Option<ProjectId>,
    /// Requests for the RPC layer; at most one CPU-intensive entry.
    pub requests: Vec<WorkRequest>,
}

/// Work-fetch policy.
#[derive(Debug, Clone)]
pub struct WorkFetch {
    host: HostConfig,
    prefs: Preferences,
    verbose: bool,
}

impl WorkFetch {
    #[must_use]
    pub fn new(config: &Config) -> Self {
        Self {
            host: config.host.clone(),
            prefs: config.prefs.clone(),
            verbose: config.log_flags.work_fetch_debug,
        }
    }

    /// Upper bound on any CPU-intensive request.
    #[must_use]
    pub fn request_cap(&self) -> f64 {
        REQUEST_CAP_FACTOR * self.prefs.work_buf_total_secs() * f64::from(self.host.ncpus())
    }

    /// Run the policy and record `work_request` and urgency on every project.
    pub fn compute(&self, state: &mut ClientState, rr: &RrSimOutput, now: f64) -> WorkFetchDecision {
        let mut decision = WorkFetchDecision {
            overall: overall_urgency(rr),
            ..WorkFetchDecision::default()
        };

        let per_project: BTreeMap<ProjectId, WorkFetchUrgency> = state
            .projects()
            .map(|p| (p.id, self.project_urgency(state, rr, p, now)))
            .collect();

        for project in state.projects_mut() {
            project.work_request = 0.0;
            project.work_request_urgency = per_project
                .get(&project.id)
                .copied()
                .unwrap_or_default();
        }
        decision.per_project = per_project;

        if decision.overall > WorkFetchUrgency::DontNeed {
            if let Some(id) = self.choose_project(state, rr, decision.overall, now) {
                let seconds = self.request_seconds(state, rr, id, now);
                if let Some(project) = state.project_mut(id) {
                    project.work_request = seconds;
                    if seconds > 0.0 {
                        info!(
                            project = %project.url,
                            seconds,
                            urgency = %decision.overall,
                            "requesting work"
                        );
                        decision.chosen = Some(id);
                        decision.requests.push(WorkRequest {
                            project: id,
                            url: project.url.clone(),
                            seconds,
                            urgency: decision.overall,
                        });
                    }
                }
            }
        }

        for project in state.projects_mut() {
            if project.non_cpu_intensive
                && project.work_request_urgency == WorkFetchUrgency::NeedImmediately
            {
                project.work_request = 1.0;
                decision.requests.push(WorkRequest {
                    project: project.id,
                    url: project.url.clone(),
                    seconds: 1.0,
                    urgency: WorkFetchUrgency::NeedImmediately,
                });
            }
        }

        if self.verbose {
            for project in state.projects() {
                debug!(
                    project = %project.url,
                    urgency = %project.work_request_urgency,
                    work_request = project.work_request,
                    cpu_shortfall = rr.cpu_shortfall(project.id),
                    long_term_debt = project.long_term_debt,
                    "work fetch project state"
                );
            }
        }
        debug!(overall = %decision.overall, requests = decision.requests.len(), "work fetch done");
        decision
    }

    fn project_urgency(
        &self,
        state: &ClientState,
        rr: &RrSimOutput,
        project: &Project,
        now: f64,
    ) -> WorkFetchUrgency {
        let contactable = project.can_request_work(now);
        if project.non_cpu_intensive {
            return if contactable && !state.has_job_in_flight(project.id) {
                WorkFetchUrgency::NeedImmediately
            } else {
                WorkFetchUrgency::DontNeed
            };
        }
        if !contactable {
            return WorkFetchUrgency::DontNeed;
        }
        if state.runnable_or_downloading_count(project.id) == 0 {
            return WorkFetchUrgency::NeedImmediately;
        }
        if rr.cpu_shortfall(project.id) > 0.0 {
            return WorkFetchUrgency::Need;
        }
        let (total_share, count) = cpu_share_total(state, |p| state.is_potentially_runnable(p.id, now));
        let frac = share_fraction(project.effective_share(), total_share, count);
        let target = frac * self.prefs.work_buf_total_secs() * self.host.effective_ncpus();
        if state.queued_cpu_time(project.id) < target {
            WorkFetchUrgency::Ok
        } else {
            WorkFetchUrgency::DontNeed
        }
    }

    fn choose_project(
        &self,
        state: &ClientState,
        rr: &RrSimOutput,
        overall: WorkFetchUrgency,
        now: f64,
    ) -> Option<ProjectId> {
        let max_uploading = 2 * self.host.ncpus() as usize;
        let overworked_below = -self.prefs.cpu_scheduling_period_secs;

        state
            .projects()
            .filter(|p| !p.non_cpu_intensive && p.can_request_work(now))
            .filter(|p| {
                let misses = rr.deadlines_missed(p.id) > 0;
                let overworked = p.long_term_debt < overworked_below;
                let shortfall = rr.cpu_shortfall(p.id);
                !(misses && overall < WorkFetchUrgency::Need)
                    && !state.has_stalled_download(p.id)
                    && !state.has_suspended_job(p.id)
                    && !(overworked && overall != WorkFetchUrgency::NeedImmediately)
                    && state.nuploading_results(p.id) <= max_uploading
                    && !(shortfall <= 0.0 && overall < WorkFetchUrgency::Need)
            })
            .max_by(|a, b| {
                let key = |p: &Project| {
                    (
                        rr.deadlines_missed(p.id) == 0,
                        p.long_term_debt >= overworked_below,
                        p.long_term_debt + rr.cpu_shortfall(p.id),
                    )
                };
                let (a_ok, a_fresh, a_score) = key(a);
                let (b_ok, b_fresh, b_score) = key(b);
                a_ok.cmp(&b_ok)
                    .then(a_fresh.cmp(&b_fresh))
                    .then(a_score.total_cmp(&b_score))
                    // Lowest ID wins the remaining ties.
                    .then(b.id.cmp(&a.id))
            })
            .map(|p| p.id)
    }

    fn request_seconds(&self, state: &ClientState, rr: &RrSimOutput, id: ProjectId, now: f64) -> f64 {
        let Some(project) = state.project(id) else {
            return 0.0;
        };
        let (total_share, count) = cpu_share_total(state, |p| p.can_request_work(now));
        let frac = share_fraction(project.effective_share(), total_share, count);
        let own = rr.cpu_shortfall(id);
        let cap = self.request_cap();
        let seconds = own.max(rr.total_cpu_shortfall * frac).min(cap);
        if seconds > 0.0 && seconds.is_finite() {
            seconds
        } else {
            MIN_REQUEST_SECS.min(cap)
        }
    }
}

/// System-wide urgency from the simulation.
#[must_use]
pub fn overall_urgency(rr: &RrSimOutput) -> WorkFetchUrgency {
    if rr.idle_cpu_now() {
        WorkFetchUrgency::NeedImmediately
    } else if rr.min_buf_shortfall > 0.0 {
        WorkFetchUrgency::Need
    } else if rr.total_cpu_shortfall > 0.0 {
        WorkFetchUrgency::Ok
    } else {
        WorkFetchUrgency::DontNeed
    }
}

/// Total effective share and member count of CPU-intensive projects matching
/// `filter`.
fn cpu_share_total(state: &ClientState, filter: impl Fn(&Project) -> bool) -> (f64, usize) {
    state
        .projects()
        .filter(|p| !p.non_cpu_intensive && filter(p))
        .fold((0.0, 0), |(total, count), p| (total + p.effective_share(), count + 1))
}
