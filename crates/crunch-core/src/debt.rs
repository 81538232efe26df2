//! Short-term and long-term debt accounting.
//!
//! Debt is the number of CPU-seconds a project is owed relative to its fair
//! share. Running a project's jobs pays its debt down; every interval each
//! eligible project is credited its share of the wall CPU time all projects
//! consumed. Both ledgers are renormalized to zero mean after every update so
//! they cannot drift as projects come and go.
//!
//! - Short-term debt decides which runnable project gets a CPU right now. It
//!   is clamped to `±max_short_term_debt` and zeroed for projects that leave
//!   the eligible set.
//! - Long-term debt decides which project gets new work. It is never reset
//!   except by an explicit "zero debts".

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::Config;
use crate::model::{ClientState, ProjectId, share_fraction};

/// Intervals shorter than this are not worth an update.
pub const MIN_DEBT_INTERVAL_SECS: f64 = 1.0;

/// CPU usage accumulated since the start of the current debt interval.
#[derive(Debug, Clone, Default)]
pub struct DebtLedger {
    interval_start: f64,
    wall_cpu_time: BTreeMap<ProjectId, f64>,
    cpu_time: BTreeMap<ProjectId, f64>,
}

/// Summary of one debt update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DebtUpdate {
    pub interval_secs: f64,
    pub total_wall_cpu_time: f64,
    pub total_cpu_time: f64,
    /// Projects whose short-term debt was updated.
    pub short_term_projects: Vec<ProjectId>,
    /// Projects whose long-term debt was credited.
    pub long_term_projects: Vec<ProjectId>,
}

impl DebtLedger {
    #[must_use]
    pub fn new(now: f64) -> Self {
        Self {
            interval_start: now,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn interval_start(&self) -> f64 {
        self.interval_start
    }

    /// Charge usage to a project: `wall_cpu_secs` is wall time weighted by
    /// the CPUs the task occupied, `cpu_secs` the CPU time it reported.
    pub fn charge(&mut self, project: ProjectId, wall_cpu_secs: f64, cpu_secs: f64) {
        if wall_cpu_secs.is_finite() && wall_cpu_secs > 0.0 {
            *self.wall_cpu_time.entry(project).or_insert(0.0) += wall_cpu_secs;
        }
        if cpu_secs.is_finite() && cpu_secs > 0.0 {
            *self.cpu_time.entry(project).or_insert(0.0) += cpu_secs;
        }
    }

    #[must_use]
    pub fn wall_cpu_time(&self, project: ProjectId) -> f64 {
        self.wall_cpu_time.get(&project).copied().unwrap_or(0.0)
    }

    #[must_use]
    pub fn total_wall_cpu_time(&self) -> f64 {
        self.wall_cpu_time.values().sum()
    }

    #[must_use]
    pub fn total_cpu_time(&self) -> f64 {
        self.cpu_time.values().sum()
    }

    /// Start a new interval, discarding accumulated usage.
    pub fn reset(&mut self, now: f64) {
        self.interval_start = now;
        self.wall_cpu_time.clear();
        self.cpu_time.clear();
    }

    /// Fold the current interval into every project's debts and start a new
    /// interval. Returns `None` when the interval is too short to count.
    pub fn adjust_debts(
        &mut self,
        state: &mut ClientState,
        config: &Config,
        now: f64,
    ) -> Option<DebtUpdate> {
        let interval_secs = now - self.interval_start;
        if interval_secs < MIN_DEBT_INTERVAL_SECS {
            return None;
        }

        let cpu_projects: Vec<ProjectId> = state
            .projects()
            .filter(|p| !p.non_cpu_intensive)
            .map(|p| p.id)
            .collect();
        let total_wall_cpu_time: f64 = cpu_projects.iter().map(|&id| self.wall_cpu_time(id)).sum();
        let total_cpu_time = self.total_cpu_time();

        // Short-term: projects that have or can get work. Long-term also
        // covers anything that ran during the interval.
        let short_term: BTreeSet<ProjectId> = cpu_projects
            .iter()
            .copied()
            .filter(|&id| state.is_potentially_runnable(id, now))
            .collect();
        let long_term: BTreeSet<ProjectId> = cpu_projects
            .iter()
            .copied()
            .filter(|&id| short_term.contains(&id) || self.wall_cpu_time(id) > 0.0)
            .collect();

        let shares: BTreeMap<ProjectId, f64> = state
            .projects()
            .map(|p| (p.id, p.effective_share()))
            .collect();
        let total_share = |set: &BTreeSet<ProjectId>| -> f64 { set.iter().map(|id| shares[id]).sum() };
        let short_total_share = total_share(&short_term);
        let long_total_share = total_share(&long_term);

        for &id in &cpu_projects {
            let wall = self.wall_cpu_time(id);
            let share = shares[&id];
            let Some(project) = state.project_mut(id) else {
                continue;
            };
            if long_term.contains(&id) {
                let frac = share_fraction(share, long_total_share, long_term.len());
                project.long_term_debt += frac.mul_add(total_wall_cpu_time, -wall);
            }
            if short_term.contains(&id) {
                let frac = share_fraction(share, short_total_share, short_term.len());
                project.short_term_debt += frac.mul_add(total_wall_cpu_time, -wall);
            } else {
                project.short_term_debt = 0.0;
                project.anticipated_debt = 0.0;
            }
        }

        normalize_long_term(state, &cpu_projects);
        normalize_short_term(state, &short_term, config.scheduler.max_short_term_debt);

        if config.log_flags.debt_debug {
            for &id in &cpu_projects {
                if let Some(p) = state.project(id) {
                    debug!(
                        project = %p.url,
                        wall_cpu_time = self.wall_cpu_time(id),
                        short_term_debt = p.short_term_debt,
                        long_term_debt = p.long_term_debt,
                        "debt adjusted"
                    );
                }
            }
        }
        debug!(
            interval_secs,
            total_wall_cpu_time, total_cpu_time, "debt interval closed"
        );

        self.reset(now);
        Some(DebtUpdate {
            interval_secs,
            total_wall_cpu_time,
            total_cpu_time,
            short_term_projects: short_term.into_iter().collect(),
            long_term_projects: long_term.into_iter().collect(),
        })
    }
}

fn normalize_long_term(state: &mut ClientState, cpu_projects: &[ProjectId]) {
    if cpu_projects.is_empty() {
        return;
    }
    let total: f64 = cpu_projects
        .iter()
        .filter_map(|&id| state.project(id))
        .map(|p| p.long_term_debt)
        .sum();
    let avg = total / cpu_projects.len() as f64;
    for &id in cpu_projects {
        if let Some(p) = state.project_mut(id) {
            p.long_term_debt -= avg;
        }
    }
}

/// Shift the set's debts by one common offset and clamp to `±max_debt`,
/// choosing the offset so the clamped debts sum to zero. With no member at
/// the bound this is plain mean-centering.
fn normalize_short_term(state: &mut ClientState, set: &BTreeSet<ProjectId>, max_debt: f64) {
    let entries: Vec<(ProjectId, f64)> = set
        .iter()
        .filter_map(|&id| state.project(id).map(|p| (id, p.short_term_debt)))
        .collect();
    if entries.is_empty() {
        return;
    }
    let debts: Vec<f64> = entries.iter().map(|&(_, d)| d).collect();
    let shift = zero_sum_shift(&debts, max_debt);
    for (id, debt) in entries {
        if let Some(p) = state.project_mut(id) {
            p.short_term_debt = (debt + shift).clamp(-max_debt, max_debt);
        }
    }
}

/// Offset `t` with `Σ clamp(d + t, -max, max) = 0`.
///
/// The clamped sum is continuous and non-decreasing in `t` and linear between
/// the points where a member touches a bound, so the root is found by walking
/// those points and solving the linear piece that brackets zero.
fn zero_sum_shift(debts: &[f64], max_debt: f64) -> f64 {
    let clamped_sum = |t: f64| -> f64 { debts.iter().map(|d| (d + t).clamp(-max_debt, max_debt)).sum() };

    let mut points: Vec<f64> = debts
        .iter()
        .flat_map(|d| [-max_debt - d, max_debt - d])
        .collect();
    points.sort_by(f64::total_cmp);

    let mut lo = points[0];
    for &hi in &points {
        if clamped_sum(hi) >= 0.0 {
            let mid = 0.5 * (lo + hi);
            let (free, pinned): (Vec<f64>, Vec<f64>) =
                debts.iter().partition(|&&d| (d + mid).abs() < max_debt);
            if free.is_empty() {
                return hi;
            }
            let pinned_sum: f64 = pinned.iter().map(|d| (d + mid).clamp(-max_debt, max_debt)).sum();
            let free_sum: f64 = free.iter().sum();
            return -(pinned_sum + free_sum) / free.len() as f64;
        }
        lo = hi;
    }
    0.0
}
