//! `TaskGraphNode`/`TaskGraphRootNode`, grounded on
//! `lexgine/core/concurrency/task_graph_node.h`.

use crate::task::Task;
use std::sync::atomic::{AtomicBool, Ordering};

/// A node wrapping a `Task` inside a `TaskGraph`. Dependency/dependent
/// edges are stored as plain index lists into the owning graph's node
/// vector rather than raw pointers — an arena/index-based graph.
pub struct TaskGraphNode {
    id: u64,
    task: Box<dyn Task>,
    user_data: u64,
    completed: AtomicBool,
    scheduled: AtomicBool,
    dependencies: Vec<usize>,
    dependents: Vec<usize>,
}

impl TaskGraphNode {
    pub fn new(id: u64, task: Box<dyn Task>) -> Self {
        TaskGraphNode {
            id,
            task,
            user_data: 0,
            completed: AtomicBool::new(false),
            scheduled: AtomicBool::new(false),
            dependencies: Vec::new(),
            dependents: Vec::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn task(&self) -> &dyn Task {
        self.task.as_ref()
    }

    pub fn user_data(&self) -> u64 {
        self.user_data
    }

    pub(crate) fn set_user_data(&mut self, value: u64) {
        self.user_data = value;
    }

    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }

    pub(crate) fn set_completed(&self, value: bool) {
        self.completed.store(value, Ordering::Release);
    }

    pub fn is_scheduled(&self) -> bool {
        self.scheduled.load(Ordering::Acquire)
    }

    /// Claims this node for scheduling exactly once; returns `true` for
    /// the caller that wins the race.
    pub(crate) fn try_claim_scheduled(&self) -> bool {
        self.scheduled
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }

    pub(crate) fn reset_scheduled(&self) {
        self.scheduled.store(false, Ordering::Release);
    }

    pub fn dependencies(&self) -> &[usize] {
        &self.dependencies
    }

    pub fn dependents(&self) -> &[usize] {
        &self.dependents
    }

    pub(crate) fn add_dependency(&mut self, node_index: usize) {
        self.dependencies.push(node_index);
    }

    pub(crate) fn add_dependent(&mut self, node_index: usize) {
        self.dependents.push(node_index);
    }

    /// Overwrites both edge lists wholesale, used when a graph is
    /// reordered and every index needs remapping.
    pub(crate) fn replace_edges(&mut self, dependencies: Vec<usize>, dependents: Vec<usize>) {
        self.dependencies = dependencies;
        self.dependents = dependents;
    }

    /// Whether every dependency node index in `completed` is satisfied.
    pub(crate) fn dependencies_satisfied(&self, completed: &[bool]) -> bool {
        self.dependencies.iter().all(|&idx| completed[idx])
    }
}

/// A root node: a synthetic starting point with no task of its own and no
/// permitted dependencies, matching `TaskGraphRootNode`.
pub struct TaskGraphRootNode {
    node: TaskGraphNode,
}

struct RootTask;

impl Task for RootTask {
    fn name(&self) -> &str {
        "__root__"
    }

    fn exposed_in_task_graph(&self) -> bool {
        false
    }

    fn do_task(&self, _worker_id: u8, _user_data: u64) -> Result<bool, String> {
        Ok(true)
    }
}

impl TaskGraphRootNode {
    pub fn new(id: u64) -> Self {
        TaskGraphRootNode {
            node: TaskGraphNode::new(id, Box::new(RootTask)),
        }
    }

    pub fn into_node(self) -> TaskGraphNode {
        self.node
    }
}
