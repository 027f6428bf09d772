//! `Task` trait and supporting types, grounded on
//! `engine/core/concurrency/abstract_task.h`.

/// Broad category a task belongs to, carried for scheduling/profiling
/// purposes only — this crate does not interpret it beyond bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskType {
    Cpu,
    GpuDraw,
    GpuCompute,
    GpuCopy,
    Other,
}

/// A hook invoked around `Task::execute`, grounded on
/// `profiling_service_provider.h`. Implementations typically record
/// wall-clock duration or emit tracing spans.
pub trait ProfilingService: Send + Sync {
    fn begin(&self, task_name: &str);
    fn end(&self, task_name: &str);
}

/// A unit of work scheduled by a `TaskGraph`/`TaskSink`.
///
/// `do_task` returns `true` when the task completed and `false` when it
/// wants to be rescheduled — the non-error `TaskReschedule` case from the
/// error model (spec §7). Any other failure should be reported by returning
/// `Err` from `execute` via the `Result`-returning wrapper the sink expects.
pub trait Task: Send + Sync {
    /// Human-readable identity used in error messages and DOT export.
    fn name(&self) -> &str;

    fn task_type(&self) -> TaskType {
        TaskType::Cpu
    }

    /// Whether this task should appear in debug/DOT output.
    fn exposed_in_task_graph(&self) -> bool {
        true
    }

    /// Performs the task's work. `user_data` is whatever value the caller
    /// most recently passed to `TaskSink::submit`, broadcast to every node
    /// in the graph; the scheduler never interprets it. Returns `Ok(true)`
    /// on completion, `Ok(false)` to be rescheduled, `Err` on fatal failure.
    fn do_task(&self, worker_id: u8, user_data: u64) -> Result<bool, String>;
}

/// Executes `task`, wrapping the call with `begin`/`end` hooks on every
/// attached profiling service, matching `AbstractTask::execute`.
pub fn execute(
    task: &dyn Task,
    worker_id: u8,
    user_data: u64,
    profiling_services: &[Box<dyn ProfilingService>],
) -> Result<bool, String> {
    for service in profiling_services {
        service.begin(task.name());
    }
    let result = task.do_task(worker_id, user_data);
    for service in profiling_services {
        service.end(task.name());
    }
    result
}
