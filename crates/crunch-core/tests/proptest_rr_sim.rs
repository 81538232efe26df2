//! Property-based tests for the round-robin deadline simulation.
//!
//! Verifies simulator invariants:
//! - Two passes over the same state produce identical output
//! - Shortfalls are finite and non-negative
//! - The minimum-buffer shortfall never exceeds the whole-window shortfall
//! - Global shortfalls are the sum of project shortfalls
//! - Simulated finish times never precede `now`
//! - The simulation never mutates the model

use proptest::prelude::*;

use crunch_core::config::{Config, HostConfig};
use crunch_core::model::{ClientState, JobState, NewAppVersion, NewJob};
use crunch_core::rr_sim::RrSimulator;

// ────────────────────────────────────────────────────────────────────
// Strategies
// ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct ArbJob {
    runnable: bool,
    cpu_secs: f64,
    deadline_offset: f64,
}

#[derive(Debug, Clone)]
struct ArbProject {
    share: f64,
    avg_ncpus: f64,
    fetchable: bool,
    jobs: Vec<ArbJob>,
}

fn arb_job() -> impl Strategy<Value = ArbJob> {
    (any::<bool>(), 1.0f64..50_000.0, -3600.0f64..200_000.0).prop_map(
        |(runnable, cpu_secs, deadline_offset)| ArbJob {
            runnable,
            cpu_secs,
            deadline_offset,
        },
    )
}

fn arb_project() -> impl Strategy<Value = ArbProject> {
    (
        prop_oneof![Just(0.0), 0.5f64..200.0],
        prop_oneof![Just(1.0), 0.5f64..4.0],
        any::<bool>(),
        prop::collection::vec(arb_job(), 0..6),
    )
        .prop_map(|(share, avg_ncpus, fetchable, jobs)| ArbProject {
            share,
            avg_ncpus,
            fetchable,
            jobs,
        })
}

fn arb_state() -> impl Strategy<Value = Vec<ArbProject>> {
    prop::collection::vec(arb_project(), 1..5)
}

const NOW: f64 = 1_000_000.0;

fn build(projects: &[ArbProject]) -> ClientState {
    let mut state = ClientState::new();
    for (i, spec) in projects.iter().enumerate() {
        let p = state
            .attach_project(format!("https://p{i}.example/"), spec.share)
            .unwrap();
        state.project_mut(p).unwrap().dont_request_more_work = !spec.fetchable;
        let av = state
            .add_app_version(
                p,
                NewAppVersion {
                    app_name: "app".to_string(),
                    version_num: 1,
                    flops: 1.0,
                    avg_ncpus: spec.avg_ncpus,
                },
            )
            .unwrap();
        for (j, job) in spec.jobs.iter().enumerate() {
            state
                .add_job(
                    p,
                    NewJob {
                        name: format!("wu_{j}"),
                        app_version: av,
                        report_deadline: NOW + job.deadline_offset,
                        fpops_est: job.cpu_secs,
                        state: if job.runnable {
                            JobState::FilesDownloaded
                        } else {
                            JobState::FilesDownloading
                        },
                    },
                )
                .unwrap();
        }
    }
    state
}

fn config(ncpus: u32) -> Config {
    Config {
        host: HostConfig::with_ncpus(ncpus),
        ..Config::default()
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    #[test]
    fn simulation_is_deterministic(projects in arb_state(), ncpus in 0u32..5) {
        let state = build(&projects);
        let sim = RrSimulator::new(&config(ncpus));
        let first = sim.simulate(&state, NOW);
        let second = sim.simulate(&state, NOW);
        prop_assert_eq!(first, second);
    }

    #[test]
    fn shortfalls_are_finite_and_non_negative(projects in arb_state(), ncpus in 0u32..5) {
        let state = build(&projects);
        let out = RrSimulator::new(&config(ncpus)).simulate(&state, NOW);
        prop_assert!(out.total_cpu_shortfall.is_finite());
        prop_assert!(out.total_cpu_shortfall >= 0.0);
        prop_assert!(out.min_buf_shortfall >= 0.0);
        prop_assert!(out.min_buf_shortfall <= out.total_cpu_shortfall + 1e-6);
        prop_assert!(out.idle_cpus_now.is_finite() && out.idle_cpus_now >= 0.0);
        for result in out.projects.values() {
            prop_assert!(result.cpu_shortfall.is_finite());
            prop_assert!(result.cpu_shortfall >= 0.0);
            prop_assert!(result.min_buf_shortfall <= result.cpu_shortfall + 1e-6);
        }
    }

    #[test]
    fn global_shortfall_is_sum_of_projects(projects in arb_state(), ncpus in 1u32..5) {
        let state = build(&projects);
        let out = RrSimulator::new(&config(ncpus)).simulate(&state, NOW);
        let sum: f64 = out.projects.values().map(|r| r.cpu_shortfall).sum();
        prop_assert!((sum - out.total_cpu_shortfall).abs() <= 1e-6 * sum.max(1.0));
    }

    #[test]
    fn finish_times_follow_now(projects in arb_state(), ncpus in 1u32..5) {
        let state = build(&projects);
        let out = RrSimulator::new(&config(ncpus)).simulate(&state, NOW);
        prop_assert!(!out.truncated);
        for (id, result) in &out.jobs {
            prop_assert!(result.finish_time.is_finite());
            prop_assert!(result.finish_time >= NOW);
            prop_assert_eq!(state.job(*id).unwrap().project, result.project);
        }
        let missed: u32 = out.projects.values().map(|r| r.deadlines_missed).sum();
        let flagged = out.jobs.values().filter(|r| r.deadline_missed).count();
        prop_assert_eq!(missed as usize, flagged);
    }

    #[test]
    fn simulation_leaves_model_untouched(projects in arb_state()) {
        let state = build(&projects);
        let before = serde_json::to_string(&state).unwrap();
        let _ = RrSimulator::new(&config(2)).simulate(&state, NOW);
        prop_assert_eq!(before, serde_json::to_string(&state).unwrap());
    }

    #[test]
    fn iteration_cap_truncates(projects in arb_state()) {
        let state = build(&projects);
        let mut config = config(1);
        config.scheduler.rr_sim_max_iterations = 1;
        let out = RrSimulator::new(&config).simulate(&state, NOW);
        let queued = state
            .jobs()
            .filter(|j| j.is_runnable() || j.is_nearly_runnable())
            .count();
        if queued > 1 {
            prop_assert!(out.truncated);
        }
        prop_assert!(out.iterations <= 1);
    }
}
