//! Dirty flags that force the scheduler or work fetch to re-run.
//!
//! External events set a flag with a reason; the client's poll loop checks
//! the flags (plus the periodic deadlines) and clears them once the pass ran.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Why a reschedule or work-fetch check was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleReason {
    Startup,
    JobCompleted,
    JobFailed,
    StartFailed,
    InputFilesReady,
    UserAbort,
    UserSuspend,
    UserResume,
    ProjectAttached,
    ProjectDetached,
    ProjectSuspended,
    ProjectResumed,
    ProjectReset,
    ProjectBackoff,
    SchedulerReply,
    ZeroDebts,
    ConfigReload,
}

impl ScheduleReason {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Startup => "startup",
            Self::JobCompleted => "job_completed",
            Self::JobFailed => "job_failed",
            Self::StartFailed => "start_failed",
            Self::InputFilesReady => "input_files_ready",
            Self::UserAbort => "user_abort",
            Self::UserSuspend => "user_suspend",
            Self::UserResume => "user_resume",
            Self::ProjectAttached => "project_attached",
            Self::ProjectDetached => "project_detached",
            Self::ProjectSuspended => "project_suspended",
            Self::ProjectResumed => "project_resumed",
            Self::ProjectReset => "project_reset",
            Self::ProjectBackoff => "project_backoff",
            Self::SchedulerReply => "scheduler_reply",
            Self::ZeroDebts => "zero_debts",
            Self::ConfigReload => "config_reload",
        }
    }
}

impl fmt::Display for ScheduleReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Counters for trigger activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerStats {
    pub schedule_requests: u64,
    pub work_fetch_requests: u64,
    pub schedule_passes: u64,
    pub work_fetch_passes: u64,
}

/// Pending reschedule and work-fetch requests.
#[derive(Debug, Clone, Default)]
pub struct ScheduleTriggers {
    schedule_reasons: Vec<ScheduleReason>,
    work_fetch_reasons: Vec<ScheduleReason>,
    last_schedule: Option<f64>,
    last_work_fetch: Option<f64>,
    stats: TriggerStats,
}

impl ScheduleTriggers {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_schedule_cpus(&mut self, reason: ScheduleReason) {
        debug!(%reason, "cpu reschedule requested");
        self.stats.schedule_requests = self.stats.schedule_requests.saturating_add(1);
        if !self.schedule_reasons.contains(&reason) {
            self.schedule_reasons.push(reason);
        }
    }

    pub fn request_work_fetch(&mut self, reason: ScheduleReason) {
        debug!(%reason, "work fetch check requested");
        self.stats.work_fetch_requests = self.stats.work_fetch_requests.saturating_add(1);
        if !self.work_fetch_reasons.contains(&reason) {
            self.work_fetch_reasons.push(reason);
        }
    }

    #[must_use]
    pub fn must_schedule_cpus(&self) -> bool {
        !self.schedule_reasons.is_empty()
    }

    #[must_use]
    pub fn must_check_work_fetch(&self) -> bool {
        !self.work_fetch_reasons.is_empty()
    }

    /// Flagged, never run, or a full scheduling period since the last pass.
    #[must_use]
    pub fn schedule_due(&self, now: f64, period_secs: f64) -> bool {
        self.must_schedule_cpus()
            || self
                .last_schedule
                .is_none_or(|last| now - last >= period_secs)
    }

    /// Flagged, never run, or `poll_secs` since the last check.
    #[must_use]
    pub fn work_fetch_due(&self, now: f64, poll_secs: f64) -> bool {
        self.must_check_work_fetch()
            || self
                .last_work_fetch
                .is_none_or(|last| now - last >= poll_secs)
    }

    /// Record a scheduling pass and return the reasons it served.
    pub fn mark_scheduled(&mut self, now: f64) -> Vec<ScheduleReason> {
        self.last_schedule = Some(now);
        self.stats.schedule_passes = self.stats.schedule_passes.saturating_add(1);
        std::mem::take(&mut self.schedule_reasons)
    }

    /// Record a work-fetch pass and return the reasons it served.
    pub fn mark_work_fetched(&mut self, now: f64) -> Vec<ScheduleReason> {
        self.last_work_fetch = Some(now);
        self.stats.work_fetch_passes = self.stats.work_fetch_passes.saturating_add(1);
        std::mem::take(&mut self.work_fetch_reasons)
    }

    #[must_use]
    pub fn last_schedule(&self) -> Option<f64> {
        self.last_schedule
    }

    #[must_use]
    pub fn stats(&self) -> TriggerStats {
        self.stats
    }
}
