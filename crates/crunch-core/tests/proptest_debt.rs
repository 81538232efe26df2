//! Property-based tests for debt accounting.
//!
//! Verifies debt ledger invariants:
//! - Long-term debts of CPU-intensive projects sum to ~0 after every update
//! - Short-term debts of the eligible set sum to ~0 and stay within the clamp,
//!   including once projects have been pinned at the bound
//! - Projects outside the eligible set carry zero short-term debt
//! - Every debt stays finite, including with zero resource shares
//! - Intervals shorter than the minimum leave debts untouched

use proptest::prelude::*;

use crunch_core::config::{Config, HostConfig};
use crunch_core::debt::{DebtLedger, MIN_DEBT_INTERVAL_SECS};
use crunch_core::model::{ClientState, JobState, NewAppVersion, NewJob, ProjectId};

// ────────────────────────────────────────────────────────────────────
// Strategies
// ────────────────────────────────────────────────────────────────────

/// (resource share, runnable jobs, may request work)
fn arb_project() -> impl Strategy<Value = (f64, usize, bool)> {
    (
        prop_oneof![Just(0.0), 0.1f64..500.0],
        0usize..4,
        any::<bool>(),
    )
}

fn arb_projects() -> impl Strategy<Value = Vec<(f64, usize, bool)>> {
    prop::collection::vec(arb_project(), 1..6)
}

/// Per-round usage: fraction of the interval each project ran.
fn arb_rounds(max_projects: usize) -> impl Strategy<Value = Vec<Vec<f64>>> {
    prop::collection::vec(prop::collection::vec(0.0f64..1.0, max_projects), 1..5)
}

/// Enough hourly rounds to push a lopsided set past the default clamp.
fn arb_long_rounds(max_projects: usize) -> impl Strategy<Value = Vec<Vec<f64>>> {
    prop::collection::vec(prop::collection::vec(0.0f64..1.0, max_projects), 24..60)
}

fn build_state(projects: &[(f64, usize, bool)]) -> (ClientState, Vec<ProjectId>) {
    let mut state = ClientState::new();
    let mut ids = Vec::new();
    for (i, &(share, jobs, fetchable)) in projects.iter().enumerate() {
        let p = state
            .attach_project(format!("https://p{i}.example/"), share)
            .unwrap();
        state.project_mut(p).unwrap().dont_request_more_work = !fetchable;
        let av = state
            .add_app_version(
                p,
                NewAppVersion {
                    app_name: "app".to_string(),
                    version_num: 1,
                    flops: 1e9,
                    avg_ncpus: 1.0,
                },
            )
            .unwrap();
        for j in 0..jobs {
            state
                .add_job(
                    p,
                    NewJob {
                        name: format!("wu_{j}"),
                        app_version: av,
                        report_deadline: 1e9,
                        fpops_est: 3.6e12,
                        state: JobState::FilesDownloaded,
                    },
                )
                .unwrap();
        }
        ids.push(p);
    }
    (state, ids)
}

fn config() -> Config {
    Config {
        host: HostConfig::with_ncpus(1),
        ..Config::default()
    }
}

const INTERVAL: f64 = 3600.0;

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    #[test]
    fn long_term_debts_sum_to_zero(
        projects in arb_projects(),
        rounds in arb_rounds(6),
    ) {
        let (mut state, ids) = build_state(&projects);
        let config = config();
        let mut ledger = DebtLedger::new(0.0);
        let mut now = 0.0;
        for usage in &rounds {
            for (i, &id) in ids.iter().enumerate() {
                ledger.charge(id, usage[i] * INTERVAL, usage[i] * INTERVAL);
            }
            now += INTERVAL;
            let update = ledger.adjust_debts(&mut state, &config, now);
            prop_assert!(update.is_some());
            let sum: f64 = state.projects().map(|p| p.long_term_debt).sum();
            prop_assert!(sum.abs() < 1e-6, "long-term sum {}", sum);
        }
    }

    #[test]
    fn short_term_debts_sum_to_zero_over_eligible_set(
        projects in arb_projects(),
        rounds in arb_long_rounds(6),
    ) {
        let (mut state, ids) = build_state(&projects);
        let config = config();
        let max_debt = config.scheduler.max_short_term_debt;
        let mut ledger = DebtLedger::new(0.0);
        let mut now = 0.0;
        for usage in &rounds {
            for (i, &id) in ids.iter().enumerate() {
                ledger.charge(id, usage[i] * INTERVAL, 0.0);
            }
            now += INTERVAL;
            let update = ledger.adjust_debts(&mut state, &config, now).unwrap();
            let sum: f64 = update
                .short_term_projects
                .iter()
                .map(|&id| state.project(id).unwrap().short_term_debt)
                .sum();
            prop_assert!(sum.abs() < 1e-6, "short-term sum {}", sum);
            for project in state.projects() {
                prop_assert!(project.short_term_debt.abs() <= max_debt + 1e-6);
                if !update.short_term_projects.contains(&project.id) {
                    prop_assert_eq!(project.short_term_debt, 0.0);
                }
            }
        }
    }

    #[test]
    fn short_term_debt_respects_clamp(
        projects in arb_projects(),
        rounds in arb_rounds(6),
        max_debt in 10.0f64..2000.0,
    ) {
        let (mut state, ids) = build_state(&projects);
        let mut config = config();
        config.scheduler.max_short_term_debt = max_debt;
        let mut ledger = DebtLedger::new(0.0);
        let mut now = 0.0;
        for usage in &rounds {
            for (i, &id) in ids.iter().enumerate() {
                ledger.charge(id, usage[i] * INTERVAL, 0.0);
            }
            now += INTERVAL;
            let Some(update) = ledger.adjust_debts(&mut state, &config, now) else {
                continue;
            };
            let sum: f64 = update
                .short_term_projects
                .iter()
                .map(|&id| state.project(id).unwrap().short_term_debt)
                .sum();
            prop_assert!(sum.abs() < 1e-6, "short-term sum {} with clamp {}", sum, max_debt);
            for project in state.projects() {
                prop_assert!(project.short_term_debt.is_finite());
                prop_assert!(project.long_term_debt.is_finite());
                prop_assert!(project.short_term_debt.abs() <= max_debt + 1e-9);
            }
        }
    }

    #[test]
    fn short_interval_is_ignored(
        projects in arb_projects(),
        usage in 0.0f64..1000.0,
        elapsed in 0.0f64..MIN_DEBT_INTERVAL_SECS,
    ) {
        let (mut state, ids) = build_state(&projects);
        let mut ledger = DebtLedger::new(100.0);
        ledger.charge(ids[0], usage, usage);
        let update = ledger.adjust_debts(&mut state, &config(), 100.0 + elapsed);
        prop_assert!(update.is_none());
        prop_assert!(state.projects().all(|p| p.short_term_debt == 0.0 && p.long_term_debt == 0.0));
        prop_assert!((ledger.interval_start() - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn starved_project_gains_debt(
        share_a in 0.1f64..100.0,
        share_b in 0.1f64..100.0,
    ) {
        let (mut state, ids) = build_state(&[(share_a, 2, true), (share_b, 2, true)]);
        let mut ledger = DebtLedger::new(0.0);
        ledger.charge(ids[0], INTERVAL, INTERVAL);
        ledger.adjust_debts(&mut state, &config(), INTERVAL).unwrap();
        let a = state.project(ids[0]).unwrap();
        let b = state.project(ids[1]).unwrap();
        prop_assert!(a.short_term_debt < 0.0);
        prop_assert!(b.short_term_debt > 0.0);
        prop_assert!(a.long_term_debt < 0.0);
        prop_assert!(b.long_term_debt > 0.0);
    }
}
