//! Contract with the external task executor.
//!
//! The executor owns worker processes; the scheduling core only reads the
//! state it reports and sends it a small command set. [`InMemoryExecutor`]
//! is a deterministic stand-in used by the CLI simulator and tests: tasks
//! accrue CPU time when [`InMemoryExecutor::advance`] is called and exit once
//! they reach their configured true cost.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::error::ExecutorError;
use crate::model::JobId;

/// Executor-side state of one task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Uninitialized,
    Executing,
    /// Preempted by the scheduler.
    Suspended,
    AbortPending,
    QuitPending,
    Exited { success: bool },
}

impl TaskState {
    /// The scheduler must not touch tasks in these states.
    #[must_use]
    pub fn is_terminating(self) -> bool {
        matches!(
            self,
            Self::AbortPending | Self::QuitPending | Self::Exited { .. }
        )
    }
}

/// One task as reported by the executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStatus {
    pub job: JobId,
    pub state: TaskState,
    /// Accumulated CPU seconds.
    pub cpu_time: f64,
    pub fraction_done: f64,
    pub pid: Option<u32>,
}

/// Transition requested by the CPU scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum TaskCommand {
    /// First start of a job.
    Start { job: JobId },
    /// Continue a preempted task.
    Resume { job: JobId },
    /// Stop a running task; `leave_in_memory` keeps the process suspended
    /// instead of quitting it.
    Preempt { job: JobId, leave_in_memory: bool },
}

impl TaskCommand {
    #[must_use]
    pub fn job(&self) -> JobId {
        match *self {
            Self::Start { job } | Self::Resume { job } | Self::Preempt { job, .. } => job,
        }
    }
}

/// What the scheduling core needs from a task executor.
pub trait TaskExecutor {
    /// Current state of every task the executor knows about.
    fn task_states(&self) -> Vec<TaskStatus>;

    /// Apply one scheduler command.
    fn execute(&mut self, command: TaskCommand) -> Result<(), ExecutorError>;

    /// Kill a task on explicit user request. Unknown jobs are a no-op.
    fn abort(&mut self, job: JobId);

    /// Drop an exited task once the client has recorded its outcome.
    fn reap(&mut self, job: JobId);
}

// =============================================================================
// In-memory executor
// =============================================================================

#[derive(Debug, Clone)]
struct SimTask {
    state: TaskState,
    cpu_time: f64,
    true_cpu_secs: f64,
    avg_ncpus: f64,
    pid: Option<u32>,
    fail_on_exit: bool,
}

/// Deterministic executor that advances tasks on a virtual clock.
#[derive(Debug, Clone)]
pub struct InMemoryExecutor {
    tasks: BTreeMap<JobId, SimTask>,
    true_costs: BTreeMap<JobId, (f64, f64)>,
    start_failures: BTreeMap<JobId, ExecutorError>,
    failing_exits: BTreeSet<JobId>,
    default_cpu_secs: f64,
    next_pid: u32,
    history: Vec<TaskCommand>,
}

impl Default for InMemoryExecutor {
    fn default() -> Self {
        Self::new(3600.0)
    }
}

impl InMemoryExecutor {
    /// Executor whose unknown jobs take `default_cpu_secs` CPU-seconds.
    #[must_use]
    pub fn new(default_cpu_secs: f64) -> Self {
        Self {
            tasks: BTreeMap::new(),
            true_costs: BTreeMap::new(),
            start_failures: BTreeMap::new(),
            failing_exits: BTreeSet::new(),
            default_cpu_secs,
            next_pid: 1000,
            history: Vec::new(),
        }
    }

    /// Set the CPU-seconds a job really needs and the CPUs it occupies.
    pub fn set_true_cost(&mut self, job: JobId, cpu_secs: f64, avg_ncpus: f64) {
        self.true_costs.insert(job, (cpu_secs.max(0.0), avg_ncpus.max(0.0)));
    }

    /// Make the next Start/Resume of `job` fail with `error`.
    pub fn fail_next_start(&mut self, job: JobId, error: ExecutorError) {
        self.start_failures.insert(job, error);
    }

    /// Make `job` exit unsuccessfully when it completes.
    pub fn fail_on_exit(&mut self, job: JobId) {
        self.failing_exits.insert(job);
        if let Some(task) = self.tasks.get_mut(&job) {
            task.fail_on_exit = true;
        }
    }

    /// Run every executing task for `dt` wall seconds.
    pub fn advance(&mut self, dt: f64) {
        if !(dt.is_finite() && dt > 0.0) {
            return;
        }
        for task in self.tasks.values_mut() {
            if task.state != TaskState::Executing {
                continue;
            }
            task.cpu_time += dt * task.avg_ncpus;
            if task.cpu_time >= task.true_cpu_secs {
                task.cpu_time = task.true_cpu_secs;
                task.state = TaskState::Exited {
                    success: !task.fail_on_exit,
                };
                task.pid = None;
            }
        }
    }

    /// Commands received so far, oldest first.
    #[must_use]
    pub fn history(&self) -> &[TaskCommand] {
        &self.history
    }

    /// Drain the command history.
    pub fn take_history(&mut self) -> Vec<TaskCommand> {
        std::mem::take(&mut self.history)
    }

    /// Jobs currently executing.
    #[must_use]
    pub fn executing(&self) -> Vec<JobId> {
        self.tasks
            .iter()
            .filter(|(_, t)| t.state == TaskState::Executing)
            .map(|(&id, _)| id)
            .collect()
    }

    fn spawn(&mut self, job: JobId) -> SimTask {
        let (true_cpu_secs, avg_ncpus) = self
            .true_costs
            .get(&job)
            .copied()
            .unwrap_or((self.default_cpu_secs, 1.0));
        let pid = self.next_pid;
        self.next_pid = self.next_pid.wrapping_add(1);
        SimTask {
            state: TaskState::Uninitialized,
            cpu_time: 0.0,
            true_cpu_secs,
            avg_ncpus,
            pid: Some(pid),
            fail_on_exit: self.failing_exits.contains(&job),
        }
    }
}

impl TaskExecutor for InMemoryExecutor {
    fn task_states(&self) -> Vec<TaskStatus> {
        self.tasks
            .iter()
            .map(|(&job, task)| TaskStatus {
                job,
                state: task.state,
                cpu_time: task.cpu_time,
                fraction_done: if task.true_cpu_secs > 0.0 {
                    (task.cpu_time / task.true_cpu_secs).clamp(0.0, 1.0)
                } else {
                    1.0
                },
                pid: task.pid,
            })
            .collect()
    }

    fn execute(&mut self, command: TaskCommand) -> Result<(), ExecutorError> {
        self.history.push(command);
        match command {
            TaskCommand::Start { job } | TaskCommand::Resume { job } => {
                if let Some(error) = self.start_failures.remove(&job) {
                    return Err(error);
                }
                if matches!(command, TaskCommand::Resume { .. }) && !self.tasks.contains_key(&job) {
                    return Err(ExecutorError::UnknownTask(job));
                }
                if !self.tasks.contains_key(&job) {
                    let task = self.spawn(job);
                    self.tasks.insert(job, task);
                }
                let Some(task) = self.tasks.get_mut(&job) else {
                    return Err(ExecutorError::UnknownTask(job));
                };
                if task.state.is_terminating() {
                    return Err(ExecutorError::StartFailed {
                        job,
                        reason: "task is exiting".to_string(),
                    });
                }
                task.state = TaskState::Executing;
                if task.true_cpu_secs <= 0.0 {
                    task.state = TaskState::Exited {
                        success: !task.fail_on_exit,
                    };
                }
                Ok(())
            }
            TaskCommand::Preempt {
                job,
                leave_in_memory,
            } => {
                let task = self
                    .tasks
                    .get_mut(&job)
                    .ok_or(ExecutorError::UnknownTask(job))?;
                if task.state == TaskState::Executing {
                    task.state = TaskState::Suspended;
                    if !leave_in_memory {
                        task.pid = None;
                    }
                }
                Ok(())
            }
        }
    }

    fn abort(&mut self, job: JobId) {
        if let Some(task) = self.tasks.get_mut(&job) {
            if !matches!(task.state, TaskState::Exited { .. }) {
                task.state = TaskState::Exited { success: false };
                task.pid = None;
            }
        }
    }

    fn reap(&mut self, job: JobId) {
        self.tasks.remove(&job);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(exec: &InMemoryExecutor, job: JobId) -> TaskStatus {
        exec.task_states()
            .into_iter()
            .find(|t| t.job == job)
            .unwrap()
    }

    #[test]
    fn task_runs_to_completion() {
        let mut exec = InMemoryExecutor::new(100.0);
        let job = JobId(1);
        exec.execute(TaskCommand::Start { job }).unwrap();
        exec.advance(40.0);
        let s = status(&exec, job);
        assert_eq!(s.state, TaskState::Executing);
        assert!((s.fraction_done - 0.4).abs() < 1e-12);
        exec.advance(100.0);
        let s = status(&exec, job);
        assert_eq!(s.state, TaskState::Exited { success: true });
        assert!((s.cpu_time - 100.0).abs() < 1e-12);
    }

    #[test]
    fn preempted_task_does_not_progress() {
        let mut exec = InMemoryExecutor::new(100.0);
        let job = JobId(1);
        exec.execute(TaskCommand::Start { job }).unwrap();
        exec.advance(10.0);
        exec.execute(TaskCommand::Preempt {
            job,
            leave_in_memory: true,
        })
        .unwrap();
        exec.advance(50.0);
        let s = status(&exec, job);
        assert_eq!(s.state, TaskState::Suspended);
        assert!((s.cpu_time - 10.0).abs() < 1e-12);
        assert!(s.pid.is_some());

        exec.execute(TaskCommand::Resume { job }).unwrap();
        assert_eq!(exec.executing(), vec![job]);
    }

    #[test]
    fn preempt_without_memory_drops_pid() {
        let mut exec = InMemoryExecutor::new(100.0);
        let job = JobId(1);
        exec.execute(TaskCommand::Start { job }).unwrap();
        exec.execute(TaskCommand::Preempt {
            job,
            leave_in_memory: false,
        })
        .unwrap();
        assert!(status(&exec, job).pid.is_none());
    }

    #[test]
    fn injected_start_failure_fires_once() {
        let mut exec = InMemoryExecutor::default();
        let job = JobId(3);
        exec.fail_next_start(job, ExecutorError::ShmemUnavailable(job));
        assert_eq!(
            exec.execute(TaskCommand::Start { job }),
            Err(ExecutorError::ShmemUnavailable(job))
        );
        exec.execute(TaskCommand::Start { job }).unwrap();
        assert_eq!(exec.history().len(), 2);
    }

    #[test]
    fn resume_unknown_task_fails() {
        let mut exec = InMemoryExecutor::default();
        assert_eq!(
            exec.execute(TaskCommand::Resume { job: JobId(9) }),
            Err(ExecutorError::UnknownTask(JobId(9)))
        );
    }

    #[test]
    fn multithreaded_task_accrues_cpu_per_thread() {
        let mut exec = InMemoryExecutor::default();
        let job = JobId(1);
        exec.set_true_cost(job, 400.0, 4.0);
        exec.execute(TaskCommand::Start { job }).unwrap();
        exec.advance(100.0);
        assert_eq!(status(&exec, job).state, TaskState::Exited { success: true });
    }

    #[test]
    fn failing_exit_and_abort_report_failure() {
        let mut exec = InMemoryExecutor::new(10.0);
        exec.fail_on_exit(JobId(1));
        exec.execute(TaskCommand::Start { job: JobId(1) }).unwrap();
        exec.execute(TaskCommand::Start { job: JobId(2) }).unwrap();
        exec.advance(20.0);
        assert_eq!(status(&exec, JobId(1)).state, TaskState::Exited { success: false });

        exec.execute(TaskCommand::Start { job: JobId(3) }).unwrap();
        exec.abort(JobId(3));
        assert_eq!(status(&exec, JobId(3)).state, TaskState::Exited { success: false });
        exec.reap(JobId(3));
        assert!(exec.task_states().iter().all(|t| t.job != JobId(3)));
    }

    #[test]
    fn command_serde_is_tagged() {
        let json = serde_json::to_string(&TaskCommand::Preempt {
            job: JobId(4),
            leave_in_memory: false,
        })
        .unwrap();
        assert!(json.contains("\"command\":\"preempt\""), "{json}");
        assert_eq!(TaskCommand::Resume { job: JobId(4) }.job(), JobId(4));
    }
}
