//! Job/project model for the scheduling core.
//!
//! All entities live in one arena ([`ClientState`]) keyed by stable IDs.
//! Cross references (job → project, job → app version) are IDs looked up on
//! demand, so removing a project never leaves a dangling reference behind.
//!
//! The scheduling components read this model and mutate only debts and the
//! "last computed" scratch fields on [`Project`]; per-pass simulation state
//! lives in the components' own output structs.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::config::Preferences;
use crate::error::ModelError;

/// Share used for a project whose configured resource share is zero or
/// invalid. Keeps every share fraction finite and non-zero.
pub const NOMINAL_RESOURCE_SHARE: f64 = 1.0;

/// Bounds for the duration correction factor.
pub const DCF_MIN: f64 = 0.01;
pub const DCF_MAX: f64 = 100.0;

// =============================================================================
// Identifiers
// =============================================================================

/// Stable handle of an attached project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProjectId(pub u64);

/// Stable handle of a job. Allocated monotonically, so ID order is the order
/// in which jobs were discovered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub u64);

/// Stable handle of an application version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AppVersionId(pub u64);

impl fmt::Display for ProjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "project#{}", self.0)
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "job#{}", self.0)
    }
}

impl fmt::Display for AppVersionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "app#{}", self.0)
    }
}

// =============================================================================
// Job state
// =============================================================================

/// Lifecycle state of a job.
///
/// The numeric order matters: states only move forward, and "computing done"
/// is `state >= ComputeError`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    New = 0,
    FilesDownloading = 1,
    FilesDownloaded = 2,
    ComputeError = 3,
    FilesUploading = 4,
    FilesUploaded = 5,
    Aborted = 6,
}

impl JobState {
    /// Numeric value (0-6).
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::New => "new",
            Self::FilesDownloading => "files_downloading",
            Self::FilesDownloaded => "files_downloaded",
            Self::ComputeError => "compute_error",
            Self::FilesUploading => "files_uploading",
            Self::FilesUploaded => "files_uploaded",
            Self::Aborted => "aborted",
        }
    }

    /// Whether the computation phase is over (successfully or not).
    #[must_use]
    pub fn is_computing_done(self) -> bool {
        self >= Self::ComputeError
    }

    /// Whether a transition to `next` preserves the forward-only ordering.
    ///
    /// Upload failures are the one backwards edge: `FilesUploading` may fall
    /// back to `ComputeError`.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        if next > self {
            return true;
        }
        next == Self::ComputeError && self == Self::FilesUploading
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

// =============================================================================
// Work-fetch urgency
// =============================================================================

/// How badly a project (or the host as a whole) needs new work.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum WorkFetchUrgency {
    #[default]
    DontNeed = 0,
    Ok = 1,
    Need = 2,
    NeedImmediately = 3,
}

impl fmt::Display for WorkFetchUrgency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DontNeed => write!(f, "DONT_NEED"),
            Self::Ok => write!(f, "OK"),
            Self::Need => write!(f, "NEED"),
            Self::NeedImmediately => write!(f, "NEED_IMMEDIATELY"),
        }
    }
}

// =============================================================================
// Entities
// =============================================================================

/// One attached remote work provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub id: ProjectId,
    /// Master URL; unique across attached projects.
    pub url: String,
    /// Relative weight of this project's fair CPU fraction.
    pub resource_share: f64,
    pub short_term_debt: f64,
    pub long_term_debt: f64,
    /// Working copy of the short-term debt used while picking jobs.
    pub anticipated_debt: f64,
    pub suspended_via_gui: bool,
    pub dont_request_more_work: bool,
    pub non_cpu_intensive: bool,
    pub detach_when_done: bool,
    /// Earliest time the RPC layer allows another scheduler request.
    pub min_rpc_time: f64,
    /// Jobs of this project stay off the CPU until this time. Set by the
    /// transfer layer for file-transfer or CPU-shortage backoff.
    #[serde(default)]
    pub compute_backoff_until: f64,

    // Last values computed by the scheduling pass, kept for inspection.
    pub work_request: f64,
    pub work_request_urgency: WorkFetchUrgency,
    pub deadlines_missed: u32,
    pub cpu_shortfall: f64,
}

impl Project {
    fn new(id: ProjectId, url: String, resource_share: f64) -> Self {
        Self {
            id,
            url,
            resource_share: sanitize_share(resource_share),
            short_term_debt: 0.0,
            long_term_debt: 0.0,
            anticipated_debt: 0.0,
            suspended_via_gui: false,
            dont_request_more_work: false,
            non_cpu_intensive: false,
            detach_when_done: false,
            min_rpc_time: 0.0,
            compute_backoff_until: 0.0,
            work_request: 0.0,
            work_request_urgency: WorkFetchUrgency::DontNeed,
            deadlines_missed: 0,
            cpu_shortfall: 0.0,
        }
    }

    /// Share used in fraction computations; zero shares count as nominal.
    #[must_use]
    pub fn effective_share(&self) -> f64 {
        if self.resource_share > 0.0 {
            self.resource_share
        } else {
            NOMINAL_RESOURCE_SHARE
        }
    }

    #[must_use]
    pub fn in_compute_backoff(&self, now: f64) -> bool {
        self.compute_backoff_until > now
    }

    /// Not suspended, not backed off, and allowed to ask for work.
    #[must_use]
    pub fn can_request_work(&self, now: f64) -> bool {
        !self.suspended_via_gui
            && !self.dont_request_more_work
            && !self.detach_when_done
            && now >= self.min_rpc_time
    }
}

/// A specific version of an application, with its runtime estimate tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppVersion {
    pub id: AppVersionId,
    pub project: ProjectId,
    pub app_name: String,
    pub version_num: u32,
    /// Host FLOPS this version achieves.
    pub flops: f64,
    /// Average number of CPUs a running job of this version occupies.
    pub avg_ncpus: f64,
    pub duration_correction_factor: f64,
}

impl AppVersion {
    /// Fold the ratio of actual to raw-estimated CPU time into the DCF.
    ///
    /// Underestimates are corrected at once; overestimates decay slowly.
    pub fn update_duration_correction_factor(&mut self, raw_ratio: f64) {
        if !raw_ratio.is_finite() || raw_ratio <= 0.0 {
            return;
        }
        let dcf = self.duration_correction_factor;
        let next = if raw_ratio > dcf {
            raw_ratio
        } else {
            0.9f64.mul_add(dcf, 0.1 * raw_ratio)
        };
        self.duration_correction_factor = next.clamp(DCF_MIN, DCF_MAX);
    }
}

/// One schedulable unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub project: ProjectId,
    pub app_version: AppVersionId,
    /// Unique within the owning project.
    pub name: String,
    pub state: JobState,
    /// Absolute time by which the result must be reported.
    pub report_deadline: f64,
    /// Server-side estimate of the job size in floating-point operations.
    pub fpops_est: f64,
    /// CPU seconds accumulated so far, as last reported by the executor.
    pub cpu_time: f64,
    pub fraction_done: f64,
    pub suspended_via_gui: bool,
    /// Set by the transfer layer when an input download has stalled.
    pub download_stalled: bool,
    /// Do not try to start this job again before this time.
    pub start_backoff_until: f64,
}

impl Job {
    /// Input files present, not suspended: eligible for a CPU.
    #[must_use]
    pub fn is_runnable(&self) -> bool {
        self.state == JobState::FilesDownloaded && !self.suspended_via_gui
    }

    /// Still downloading and expected to become runnable.
    #[must_use]
    pub fn is_nearly_runnable(&self) -> bool {
        matches!(self.state, JobState::New | JobState::FilesDownloading)
            && !self.suspended_via_gui
            && !self.download_stalled
    }

    /// Not yet fully uploaded or aborted.
    #[must_use]
    pub fn is_in_flight(&self) -> bool {
        self.state < JobState::FilesUploaded
    }

    /// Report deadline minus the buffer cushion and one scheduling period.
    #[must_use]
    pub fn computation_deadline(&self, prefs: &Preferences) -> f64 {
        self.report_deadline - prefs.work_buf_min_secs - prefs.cpu_scheduling_period_secs
    }
}

/// Parameters for attaching a new app version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewAppVersion {
    pub app_name: String,
    pub version_num: u32,
    pub flops: f64,
    pub avg_ncpus: f64,
}

/// Parameters for a job delivered by a scheduler reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewJob {
    pub name: String,
    pub app_version: AppVersionId,
    pub report_deadline: f64,
    pub fpops_est: f64,
    #[serde(default = "default_new_job_state")]
    pub state: JobState,
}

fn default_new_job_state() -> JobState {
    JobState::FilesDownloading
}

fn sanitize_share(share: f64) -> f64 {
    if share.is_finite() && share >= 0.0 {
        share
    } else {
        tracing::warn!(resource_share = share, "invalid resource share clamped to 0");
        0.0
    }
}

/// Fraction of `total` owned by `share`, falling back to an equal split of
/// `count` members when the total is not positive.
#[must_use]
pub fn share_fraction(share: f64, total: f64, count: usize) -> f64 {
    if total > 0.0 && total.is_finite() {
        (share / total).clamp(0.0, 1.0)
    } else if count > 0 {
        1.0 / count as f64
    } else {
        1.0
    }
}

// =============================================================================
// Arena
// =============================================================================

/// Owning storage for projects, app versions and jobs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientState {
    projects: BTreeMap<ProjectId, Project>,
    app_versions: BTreeMap<AppVersionId, AppVersion>,
    jobs: BTreeMap<JobId, Job>,
    next_project_id: u64,
    next_app_version_id: u64,
    next_job_id: u64,
}

impl ClientState {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    // -------------------------------------------------------------------------
    // Projects
    // -------------------------------------------------------------------------

    /// Attach a project. Debts start at zero.
    pub fn attach_project(
        &mut self,
        url: impl Into<String>,
        resource_share: f64,
    ) -> Result<ProjectId, ModelError> {
        let url = url.into();
        if self.project_by_url(&url).is_some() {
            return Err(ModelError::DuplicateProject(url));
        }
        let id = ProjectId(self.next_project_id);
        self.next_project_id += 1;
        self.projects.insert(id, Project::new(id, url, resource_share));
        Ok(id)
    }

    /// Detach a project, dropping its jobs and app versions.
    pub fn detach_project(&mut self, id: ProjectId) -> Result<Project, ModelError> {
        let project = self
            .projects
            .remove(&id)
            .ok_or(ModelError::UnknownProject(id))?;
        self.jobs.retain(|_, job| job.project != id);
        self.app_versions.retain(|_, av| av.project != id);
        Ok(project)
    }

    #[must_use]
    pub fn project(&self, id: ProjectId) -> Option<&Project> {
        self.projects.get(&id)
    }

    pub fn project_mut(&mut self, id: ProjectId) -> Option<&mut Project> {
        self.projects.get_mut(&id)
    }

    #[must_use]
    pub fn project_by_url(&self, url: &str) -> Option<&Project> {
        self.projects.values().find(|p| p.url == url)
    }

    /// Projects in ID order.
    pub fn projects(&self) -> impl Iterator<Item = &Project> {
        self.projects.values()
    }

    pub fn projects_mut(&mut self) -> impl Iterator<Item = &mut Project> {
        self.projects.values_mut()
    }

    #[must_use]
    pub fn project_count(&self) -> usize {
        self.projects.len()
    }

    pub fn set_resource_share(&mut self, id: ProjectId, share: f64) -> Result<(), ModelError> {
        let project = self
            .projects
            .get_mut(&id)
            .ok_or(ModelError::UnknownProject(id))?;
        project.resource_share = sanitize_share(share);
        Ok(())
    }

    /// Reset every project's debts to zero.
    pub fn zero_debts(&mut self) {
        for project in self.projects.values_mut() {
            project.short_term_debt = 0.0;
            project.long_term_debt = 0.0;
            project.anticipated_debt = 0.0;
        }
    }

    // -------------------------------------------------------------------------
    // App versions
    // -------------------------------------------------------------------------

    pub fn add_app_version(
        &mut self,
        project: ProjectId,
        spec: NewAppVersion,
    ) -> Result<AppVersionId, ModelError> {
        if !self.projects.contains_key(&project) {
            return Err(ModelError::UnknownProject(project));
        }
        let id = AppVersionId(self.next_app_version_id);
        self.next_app_version_id += 1;
        let flops = if spec.flops.is_finite() && spec.flops > 0.0 {
            spec.flops
        } else {
            1.0
        };
        let avg_ncpus = if spec.avg_ncpus.is_finite() && spec.avg_ncpus > 0.0 {
            spec.avg_ncpus
        } else {
            1.0
        };
        self.app_versions.insert(
            id,
            AppVersion {
                id,
                project,
                app_name: spec.app_name,
                version_num: spec.version_num,
                flops,
                avg_ncpus,
                duration_correction_factor: 1.0,
            },
        );
        Ok(id)
    }

    #[must_use]
    pub fn app_version(&self, id: AppVersionId) -> Option<&AppVersion> {
        self.app_versions.get(&id)
    }

    pub fn app_version_mut(&mut self, id: AppVersionId) -> Option<&mut AppVersion> {
        self.app_versions.get_mut(&id)
    }

    pub fn app_versions(&self) -> impl Iterator<Item = &AppVersion> {
        self.app_versions.values()
    }

    // -------------------------------------------------------------------------
    // Jobs
    // -------------------------------------------------------------------------

    pub fn add_job(&mut self, project: ProjectId, spec: NewJob) -> Result<JobId, ModelError> {
        if !self.projects.contains_key(&project) {
            return Err(ModelError::UnknownProject(project));
        }
        let av = self
            .app_versions
            .get(&spec.app_version)
            .ok_or(ModelError::UnknownAppVersion(spec.app_version))?;
        if av.project != project {
            return Err(ModelError::AppVersionProjectMismatch {
                app_version: spec.app_version,
                project,
            });
        }
        if self.find_job(project, &spec.name).is_some() {
            return Err(ModelError::DuplicateJob {
                project,
                name: spec.name,
            });
        }
        let id = JobId(self.next_job_id);
        self.next_job_id += 1;
        self.jobs.insert(
            id,
            Job {
                id,
                project,
                app_version: spec.app_version,
                name: spec.name,
                state: spec.state,
                report_deadline: spec.report_deadline,
                fpops_est: spec.fpops_est.max(0.0),
                cpu_time: 0.0,
                fraction_done: 0.0,
                suspended_via_gui: false,
                download_stalled: false,
                start_backoff_until: 0.0,
            },
        );
        Ok(id)
    }

    pub fn remove_job(&mut self, id: JobId) -> Result<Job, ModelError> {
        self.jobs.remove(&id).ok_or(ModelError::UnknownJob(id))
    }

    #[must_use]
    pub fn job(&self, id: JobId) -> Option<&Job> {
        self.jobs.get(&id)
    }

    pub fn job_mut(&mut self, id: JobId) -> Option<&mut Job> {
        self.jobs.get_mut(&id)
    }

    /// Jobs in discovery order.
    pub fn jobs(&self) -> impl Iterator<Item = &Job> {
        self.jobs.values()
    }

    pub fn jobs_of(&self, project: ProjectId) -> impl Iterator<Item = &Job> {
        self.jobs.values().filter(move |job| job.project == project)
    }

    #[must_use]
    pub fn find_job(&self, project: ProjectId, name: &str) -> Option<&Job> {
        self.jobs_of(project).find(|job| job.name == name)
    }

    #[must_use]
    pub fn job_count(&self) -> usize {
        self.jobs.len()
    }

    /// Move a job to a new state, enforcing forward-only ordering.
    pub fn transition_job(&mut self, id: JobId, next: JobState) -> Result<JobState, ModelError> {
        let job = self.jobs.get_mut(&id).ok_or(ModelError::UnknownJob(id))?;
        let from = job.state;
        if !from.can_transition_to(next) {
            return Err(ModelError::InvalidTransition {
                job: id,
                from,
                to: next,
            });
        }
        job.state = next;
        Ok(from)
    }

    // -------------------------------------------------------------------------
    // Estimates
    // -------------------------------------------------------------------------

    /// Corrected CPU-second estimate of the whole job, or `None` when its app
    /// version is missing.
    #[must_use]
    pub fn estimated_cpu_time(&self, id: JobId) -> Option<f64> {
        let job = self.jobs.get(&id)?;
        let av = self.app_versions.get(&job.app_version)?;
        Some(job.fpops_est / av.flops * av.duration_correction_factor)
    }

    /// Corrected CPU-seconds still needed.
    ///
    /// Before any progress is reported this is the static estimate minus the
    /// CPU already spent; afterwards it blends the static estimate with the
    /// rate implied by `fraction_done`, weighting the latter by progress.
    #[must_use]
    pub fn estimated_cpu_time_remaining(&self, id: JobId) -> Option<f64> {
        let job = self.jobs.get(&id)?;
        if job.state.is_computing_done() {
            return Some(0.0);
        }
        let total = self.estimated_cpu_time(id)?;
        let fd = job.fraction_done.clamp(0.0, 1.0);
        if fd >= 1.0 {
            return Some(0.0);
        }
        if fd <= 0.0 || job.cpu_time <= 0.0 {
            return Some((total - job.cpu_time).max(0.0));
        }
        let dynamic = job.cpu_time / fd - job.cpu_time;
        let fixed = total * (1.0 - fd);
        Some(fd.mul_add(dynamic, (1.0 - fd) * fixed).max(0.0))
    }

    /// CPUs a running instance of this job occupies (1 when unknown).
    #[must_use]
    pub fn avg_ncpus(&self, id: JobId) -> f64 {
        self.jobs
            .get(&id)
            .and_then(|job| self.app_versions.get(&job.app_version))
            .map_or(1.0, |av| av.avg_ncpus)
    }

    // -------------------------------------------------------------------------
    // Project queries
    // -------------------------------------------------------------------------

    /// Has at least one job that could use a CPU now.
    #[must_use]
    pub fn is_runnable(&self, project: ProjectId) -> bool {
        self.projects
            .get(&project)
            .is_some_and(|p| !p.suspended_via_gui)
            && self.jobs_of(project).any(Job::is_runnable)
    }

    /// Has runnable jobs, jobs on the way, or can ask for more.
    #[must_use]
    pub fn is_potentially_runnable(&self, project: ProjectId, now: f64) -> bool {
        let Some(p) = self.projects.get(&project) else {
            return false;
        };
        if p.suspended_via_gui {
            return false;
        }
        p.can_request_work(now)
            || self
                .jobs_of(project)
                .any(|job| job.is_runnable() || job.is_nearly_runnable())
    }

    #[must_use]
    pub fn runnable_or_downloading_count(&self, project: ProjectId) -> usize {
        self.jobs_of(project)
            .filter(|job| job.is_runnable() || job.is_nearly_runnable())
            .count()
    }

    #[must_use]
    pub fn nuploading_results(&self, project: ProjectId) -> usize {
        self.jobs_of(project)
            .filter(|job| job.state == JobState::FilesUploading)
            .count()
    }

    #[must_use]
    pub fn has_stalled_download(&self, project: ProjectId) -> bool {
        self.jobs_of(project)
            .any(|job| job.download_stalled && job.state <= JobState::FilesDownloading)
    }

    #[must_use]
    pub fn has_suspended_job(&self, project: ProjectId) -> bool {
        self.jobs_of(project)
            .any(|job| job.suspended_via_gui && job.is_in_flight())
    }

    #[must_use]
    pub fn has_job_in_flight(&self, project: ProjectId) -> bool {
        self.jobs_of(project).any(Job::is_in_flight)
    }

    /// Corrected CPU-seconds queued for a project (runnable or downloading).
    #[must_use]
    pub fn queued_cpu_time(&self, project: ProjectId) -> f64 {
        self.jobs_of(project)
            .filter(|job| job.is_runnable() || job.is_nearly_runnable())
            .filter_map(|job| self.estimated_cpu_time_remaining(job.id))
            .sum()
    }
}
