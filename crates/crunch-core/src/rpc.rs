//! Messages exchanged with the scheduler-RPC layer.
//!
//! The RPC layer owns the wire format and network I/O. The core hands it
//! [`WorkRequest`]s and consumes [`SchedulerReply`]s, which the client
//! applies between polls.

use serde::{Deserialize, Serialize};

use crate::model::{AppVersionId, ClientState, NewAppVersion, ProjectId, WorkFetchUrgency};

/// Ask one project for work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkRequest {
    pub project: ProjectId,
    pub url: String,
    /// CPU-seconds of work wanted.
    pub seconds: f64,
    pub urgency: WorkFetchUrgency,
}

/// A job delivered by a scheduler reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplyJob {
    pub name: String,
    pub app_name: String,
    pub version_num: u32,
    pub report_deadline: f64,
    pub fpops_est: f64,
}

/// Everything a scheduler reply can change.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerReply {
    /// App versions to register before the jobs that use them.
    pub app_versions: Vec<NewAppVersion>,
    pub jobs: Vec<ReplyJob>,
    /// Names of uploaded jobs the server acknowledged.
    pub acked: Vec<String>,
    /// Names of jobs the server wants aborted.
    pub aborts: Vec<String>,
    /// Earliest time the next request to this project is allowed.
    pub min_rpc_time: Option<f64>,
    pub resource_share: Option<f64>,
    pub dont_request_more_work: Option<bool>,
    pub detach_when_done: Option<bool>,
}

impl SchedulerReply {
    /// True when the reply carries nothing the scheduler would react to.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Find a project's app version by name and version number.
#[must_use]
pub fn find_app_version(
    state: &ClientState,
    project: ProjectId,
    app_name: &str,
    version_num: u32,
) -> Option<AppVersionId> {
    state
        .app_versions()
        .find(|av| av.project == project && av.app_name == app_name && av.version_num == version_num)
        .map(|av| av.id)
}
