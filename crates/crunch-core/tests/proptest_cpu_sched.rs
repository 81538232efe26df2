//! Property-based tests for CPU scheduling.
//!
//! Verifies scheduler invariants:
//! - CPU slots used never exceed the host's CPU count
//! - A selection never lists a job twice and only lists runnable jobs
//! - Deadline-risk jobs are a subset of the selection
//! - Re-enforcing an unchanged schedule issues no commands
//! - Preempted tasks are exactly the executing ones left out of the selection
//! - A pass against an executor that refuses every start ends, tries each job
//!   at most once, and leaves nothing selected

use std::collections::{BTreeMap, BTreeSet};

use proptest::prelude::*;

use crunch_core::config::{Config, HostConfig};
use crunch_core::cpu_sched::{CpuScheduler, task_map};
use crunch_core::error::ExecutorError;
use crunch_core::executor::{InMemoryExecutor, TaskCommand, TaskExecutor, TaskState, TaskStatus};
use crunch_core::model::{ClientState, JobId, JobState, NewAppVersion, NewJob};
use crunch_core::rr_sim::RrSimulator;

// ────────────────────────────────────────────────────────────────────
// Strategies
// ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct ArbProject {
    share: f64,
    short_term_debt: f64,
    avg_ncpus: f64,
    non_cpu_intensive: bool,
    /// (runnable, deadline offset) per job
    jobs: Vec<(bool, f64)>,
}

fn arb_project(avg_ncpus: BoxedStrategy<f64>) -> impl Strategy<Value = ArbProject> {
    (
        prop_oneof![Just(0.0), 0.5f64..100.0],
        -5000.0f64..5000.0,
        avg_ncpus,
        prop::bool::weighted(0.15),
        prop::collection::vec((prop::bool::weighted(0.8), 600.0f64..500_000.0), 0..5),
    )
        .prop_map(|(share, short_term_debt, avg_ncpus, non_cpu_intensive, jobs)| ArbProject {
            share,
            short_term_debt,
            avg_ncpus,
            non_cpu_intensive,
            jobs,
        })
}

fn arb_projects() -> impl Strategy<Value = Vec<ArbProject>> {
    prop::collection::vec(arb_project(prop_oneof![Just(1.0), 0.25f64..3.0].boxed()), 1..5)
}

fn arb_single_cpu_projects() -> impl Strategy<Value = Vec<ArbProject>> {
    prop::collection::vec(arb_project(Just(1.0).boxed()), 1..5)
}

const NOW: f64 = 10_000.0;

fn build(projects: &[ArbProject]) -> ClientState {
    let mut state = ClientState::new();
    for (i, spec) in projects.iter().enumerate() {
        let p = state
            .attach_project(format!("https://p{i}.example/"), spec.share)
            .unwrap();
        {
            let project = state.project_mut(p).unwrap();
            project.short_term_debt = spec.short_term_debt;
            project.non_cpu_intensive = spec.non_cpu_intensive;
        }
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
        for (j, &(runnable, offset)) in spec.jobs.iter().enumerate() {
            state
                .add_job(
                    p,
                    NewJob {
                        name: format!("wu_{j}"),
                        app_version: av,
                        report_deadline: NOW + offset,
                        fpops_est: 3600.0,
                        state: if runnable {
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

/// Executor that rejects every command and counts attempts per job.
#[derive(Default)]
struct RefusingExecutor {
    attempts: BTreeMap<JobId, usize>,
}

impl RefusingExecutor {
    fn total(&self) -> usize {
        self.attempts.values().sum()
    }
}

impl TaskExecutor for RefusingExecutor {
    fn task_states(&self) -> Vec<TaskStatus> {
        Vec::new()
    }

    fn execute(&mut self, command: TaskCommand) -> Result<(), ExecutorError> {
        *self.attempts.entry(command.job()).or_default() += 1;
        assert!(self.total() < 10_000, "start loop did not end");
        Err(ExecutorError::StartFailed {
            job: command.job(),
            reason: "refused".to_string(),
        })
    }

    fn abort(&mut self, _job: JobId) {}

    fn reap(&mut self, _job: JobId) {}
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
    fn slots_never_exceed_ncpus(projects in arb_projects(), ncpus in 0u32..6) {
        let mut state = build(&projects);
        let config = config(ncpus);
        let rr = RrSimulator::new(&config).simulate(&state, NOW);
        let selection = CpuScheduler::new(&config).select(&mut state, &rr, &Default::default(), NOW);

        let slots = f64::from(ncpus.max(1));
        prop_assert!(selection.slots_used <= slots + 1e-9, "{} > {}", selection.slots_used, slots);
        let cpu_sum: f64 = selection
            .jobs
            .iter()
            .filter(|id| !selection.non_cpu_jobs.contains(*id))
            .map(|&id| state.avg_ncpus(id).min(slots))
            .sum();
        prop_assert!((cpu_sum - selection.slots_used).abs() < 1e-9);
    }

    #[test]
    fn selection_is_unique_and_runnable(projects in arb_projects(), ncpus in 1u32..6) {
        let mut state = build(&projects);
        let config = config(ncpus);
        let rr = RrSimulator::new(&config).simulate(&state, NOW);
        let selection = CpuScheduler::new(&config).select(&mut state, &rr, &Default::default(), NOW);

        let unique: BTreeSet<_> = selection.jobs.iter().copied().collect();
        prop_assert_eq!(unique.len(), selection.jobs.len());
        for id in &selection.jobs {
            prop_assert!(state.job(*id).unwrap().is_runnable());
        }
        for id in &selection.deadline_jobs {
            prop_assert!(selection.contains(*id));
        }
    }

    #[test]
    fn enforce_is_idempotent(projects in arb_single_cpu_projects(), ncpus in 1u32..5) {
        let mut state = build(&projects);
        let config = config(ncpus);
        let rr = RrSimulator::new(&config).simulate(&state, NOW);
        let scheduler = CpuScheduler::new(&config);
        let mut executor = InMemoryExecutor::default();

        let first = scheduler.enforce(&mut state, &mut executor, &rr, NOW);
        prop_assert!(first.start_failures.is_empty());
        let second = scheduler.enforce(&mut state, &mut executor, &rr, NOW);
        prop_assert!(second.commands.is_empty(), "second pass issued {:?}", second.commands);
        prop_assert_eq!(first.selection.jobs.len(), second.selection.jobs.len());
    }

    #[test]
    fn preempts_match_dropped_jobs(
        projects in arb_single_cpu_projects(),
        ncpus in 1u32..4,
        suspend_index in any::<prop::sample::Index>(),
    ) {
        let mut state = build(&projects);
        let config = config(ncpus);
        let scheduler = CpuScheduler::new(&config);
        let mut executor = InMemoryExecutor::default();
        let rr = RrSimulator::new(&config).simulate(&state, NOW);
        scheduler.enforce(&mut state, &mut executor, &rr, NOW);

        let running = executor.executing();
        prop_assume!(!running.is_empty());
        let victim = running[suspend_index.index(running.len())];
        state.job_mut(victim).unwrap().suspended_via_gui = true;

        let rr = RrSimulator::new(&config).simulate(&state, NOW);
        let report = scheduler.enforce(&mut state, &mut executor, &rr, NOW);
        let preempted: Vec<_> = report
            .commands
            .iter()
            .filter_map(|c| match c {
                TaskCommand::Preempt { job, .. } => Some(*job),
                _ => None,
            })
            .collect();
        prop_assert!(preempted.contains(&victim));
        for job in preempted {
            prop_assert!(!report.selection.contains(job));
        }
        let tasks = task_map(&executor);
        prop_assert!(tasks.values().all(|t| t.job != victim || t.state != TaskState::Executing));
        prop_assert!(executor.task_states().len() >= report.selection.jobs.len());
    }

    #[test]
    fn refused_starts_end_the_pass(
        projects in arb_projects(),
        ncpus in 1u32..6,
        backoff in prop_oneof![Just(None), Just(Some(0.0)), (0.0f64..1.0).prop_map(Some)],
    ) {
        let mut state = build(&projects);
        let mut config = config(ncpus);
        if let Some(secs) = backoff {
            config.scheduler.start_failure_backoff_secs = secs;
        }
        let rr = RrSimulator::new(&config).simulate(&state, NOW);
        let candidates = state.jobs().filter(|j| j.is_runnable()).count();
        let mut executor = RefusingExecutor::default();

        let report = CpuScheduler::new(&config).enforce(&mut state, &mut executor, &rr, NOW);

        prop_assert!(report.commands.is_empty());
        prop_assert!(report.selection.jobs.is_empty());
        prop_assert!(report.start_failures.len() <= candidates);
        prop_assert_eq!(report.start_failures.len(), executor.total());
        prop_assert!(executor.attempts.values().all(|&n| n == 1), "{:?}", executor.attempts);
    }
}
