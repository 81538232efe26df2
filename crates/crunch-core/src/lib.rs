//! crunch-core: CPU scheduling and work fetch for a volunteer-computing client
//!
//! Decides which downloaded jobs run on the host's CPUs, tracks how much CPU
//! each attached project is owed, and decides which project to ask for more
//! work and how much.
//!
//! # Architecture
//!
//! ```text
//! executor status → Debt accounting → Deadline simulator ─┬→ CPU scheduler → executor commands
//!                                                          └→ Work fetch    → RPC work requests
//! ```
//!
//! # Modules
//!
//! - `model`: projects, app versions and jobs in an ID-keyed arena
//! - `debt`: short-term and long-term debt accounting
//! - `rr_sim`: round-robin deadline simulation
//! - `cpu_sched`: job selection and executor reconciliation
//! - `work_fetch`: work-fetch urgency and project choice
//! - `executor`: task executor contract plus an in-memory executor
//! - `rpc`: work requests and scheduler replies
//! - `triggers`: reschedule and work-fetch dirty flags
//! - `client`: the scheduling context and poll loop
//! - `persist`: debt persistence
//! - `config`: configuration management
//! - `logging`: structured logging setup
//!
//! # Safety
//!
//! This crate forbids unsafe code.

#![forbid(unsafe_code)]

pub mod client;
pub mod config;
pub mod cpu_sched;
pub mod debt;
pub mod error;
pub mod executor;
pub mod logging;
pub mod model;
pub mod persist;
pub mod rpc;
pub mod rr_sim;
pub mod triggers;
pub mod work_fetch;

pub use client::{Client, PollReport};
pub use config::Config;
pub use error::{Error, Result};
pub use model::{ClientState, JobId, JobState, ProjectId, WorkFetchUrgency};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_is_set() {
        assert!(!VERSION.is_empty());
    }
}
