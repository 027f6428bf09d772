//! `TaskGraph`: builds a DAG of tasks, compiles it into a topologically
//! ordered, barrier-terminated form, and tracks completion. Grounded on
//! `lexgine/core/concurrency/task_graph.cpp`.

pub mod node;

use crate::error::GraphError;
use crate::task::{Task, TaskType};
use fxhash::FxHashMap;
use node::TaskGraphNode;

/// A compiled, schedulable task graph. `compile` must run before a
/// `TaskSink` can drive it; it performs cycle detection, produces a
/// topological node order, and appends a synthetic barrier node depended
/// on by nothing and depending on every other node, so the graph's
/// completion can be observed as a single flag.
pub struct TaskGraph {
    nodes: Vec<TaskGraphNode>,
    id_to_index: FxHashMap<u64, usize>,
    next_id: u64,
    compiled: bool,
    barrier_index: Option<usize>,
}

struct BarrierTask;

impl Task for BarrierTask {
    fn name(&self) -> &str {
        "__barrier__"
    }

    fn exposed_in_task_graph(&self) -> bool {
        false
    }

    fn do_task(&self, _worker_id: u8, _user_data: u64) -> Result<bool, String> {
        Ok(true)
    }
}

impl Default for TaskGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskGraph {
    pub fn new() -> Self {
        TaskGraph {
            nodes: Vec::new(),
            id_to_index: FxHashMap::default(),
            next_id: 1,
            compiled: false,
            barrier_index: None,
        }
    }

    /// Adds an uncompiled task to the graph and returns its id, usable with
    /// [`TaskGraph::add_dependency`].
    pub fn add_task(&mut self, task: Box<dyn Task>) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        let index = self.nodes.len();
        self.nodes.push(TaskGraphNode::new(id, task));
        self.id_to_index.insert(id, index);
        self.compiled = false;
        id
    }

    /// Broadcasts `user_data` to every compiled node, matching
    /// `TaskGraph::set_user_data`. Called by `TaskSink::submit` immediately
    /// before dispatch.
    pub fn set_user_data(&mut self, user_data: u64) {
        for node in &mut self.nodes {
            node.set_user_data(user_data);
        }
    }

    /// Declares that `dependent` must run after `dependency` completes.
    pub fn add_dependency(&mut self, dependent: u64, dependency: u64) {
        let dependent_idx = self.id_to_index[&dependent];
        let dependency_idx = self.id_to_index[&dependency];
        self.nodes[dependent_idx].add_dependency(dependency_idx);
        self.nodes[dependency_idx].add_dependent(dependent_idx);
        self.compiled = false;
    }

    fn index_of(&self, id: u64) -> usize {
        self.id_to_index[&id]
    }

    /// Topologically sorts the graph and injects the barrier node.
    /// Returns [`GraphError::CycleDetected`] if the dependency edges form a
    /// cycle, leaving the graph uncompiled.
    pub fn compile(&mut self) -> Result<(), GraphError> {
        let order = self.topological_order()?;
        self.reorder(order);
        self.inject_barrier();
        self.compiled = true;
        Ok(())
    }

    /// 3-color DFS (white/grey/black) cycle detection producing a
    /// topological order, ported from `TaskGraph::compile`.
    fn topological_order(&self) -> Result<Vec<usize>, GraphError> {
        #[derive(Clone, Copy, PartialEq)]
        enum Color {
            White,
            Grey,
            Black,
        }
        let mut colors = vec![Color::White; self.nodes.len()];
        let mut order = Vec::with_capacity(self.nodes.len());

        fn visit(
            idx: usize,
            nodes: &[TaskGraphNode],
            colors: &mut [Color],
            order: &mut Vec<usize>,
        ) -> Result<(), GraphError> {
            match colors[idx] {
                Color::Black => return Ok(()),
                Color::Grey => {
                    return Err(GraphError::CycleDetected {
                        node_id: nodes[idx].id(),
                    })
                }
                Color::White => {}
            }
            colors[idx] = Color::Grey;
            for &dep_idx in nodes[idx].dependencies() {
                visit(dep_idx, nodes, colors, order)?;
            }
            colors[idx] = Color::Black;
            order.push(idx);
            Ok(())
        }

        for idx in 0..self.nodes.len() {
            if colors[idx] == Color::White {
                visit(idx, &self.nodes, &mut colors, &mut order)?;
            }
        }
        Ok(order)
    }

    /// Rebuilds `self.nodes` in the given order, remapping every
    /// dependency/dependent index via a fresh old-index→new-index lookup.
    fn reorder(&mut self, order: Vec<usize>) {
        let old_nodes = std::mem::take(&mut self.nodes);
        let mut taken: Vec<Option<TaskGraphNode>> = old_nodes.into_iter().map(Some).collect();

        let mut new_nodes = Vec::with_capacity(taken.len());
        let mut old_to_new = vec![0usize; taken.len()];
        for (new_idx, &old_idx) in order.iter().enumerate() {
            old_to_new[old_idx] = new_idx;
        }

        for &old_idx in &order {
            new_nodes.push(taken[old_idx].take().unwrap());
        }

        for (new_idx, node) in new_nodes.iter_mut().enumerate() {
            let remapped_deps: Vec<usize> = node
                .dependencies()
                .iter()
                .map(|&old| old_to_new[old])
                .collect();
            let remapped_dependents: Vec<usize> = node
                .dependents()
                .iter()
                .map(|&old| old_to_new[old])
                .collect();
            node.replace_edges(remapped_deps, remapped_dependents);
            let _ = new_idx;
        }

        self.id_to_index.clear();
        for (idx, node) in new_nodes.iter().enumerate() {
            self.id_to_index.insert(node.id(), idx);
        }
        self.nodes = new_nodes;
    }

    /// Appends a barrier node that depends on every node currently in the
    /// graph, matching `injectDependentNode`.
    fn inject_barrier(&mut self) {
        let id = self.next_id;
        self.next_id += 1;
        let barrier_idx = self.nodes.len();
        let mut barrier = TaskGraphNode::new(id, Box::new(BarrierTask));
        for existing_idx in 0..barrier_idx {
            barrier.add_dependency(existing_idx);
            self.nodes[existing_idx].add_dependent(barrier_idx);
        }
        self.nodes.push(barrier);
        self.id_to_index.insert(id, barrier_idx);
        self.barrier_index = Some(barrier_idx);
    }

    pub fn is_compiled(&self) -> bool {
        self.compiled
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn node(&self, index: usize) -> &TaskGraphNode {
        &self.nodes[index]
    }

    pub fn nodes(&self) -> &[TaskGraphNode] {
        &self.nodes
    }

    /// Whether the barrier node (and thus the whole graph) has completed.
    pub fn is_completed(&self) -> bool {
        match self.barrier_index {
            Some(idx) => self.nodes[idx].is_completed(),
            None => self.nodes.iter().all(|n| n.is_completed()),
        }
    }

    /// Resets every node's completed/scheduled flags so the graph can be
    /// resubmitted, matching `TaskSink::submit`'s post-success reset.
    pub fn reset(&mut self) {
        for node in &mut self.nodes {
            node.set_completed(false);
            node.reset_scheduled();
        }
    }

    /// Renders the graph as Graphviz DOT, with per-`TaskType` color/shape,
    /// matching `createDotRepresentation`.
    pub fn to_dot(&self) -> String {
        let mut out = String::from("digraph task_graph {\n");
        for (idx, node) in self.nodes.iter().enumerate() {
            if !node.task().exposed_in_task_graph() {
                continue;
            }
            let (color, shape) = dot_style(node.task().task_type());
            out.push_str(&format!(
                "  n{idx} [label=\"{name}\" color={color} shape={shape}];\n",
                idx = idx,
                name = node.task().name(),
                color = color,
                shape = shape
            ));
        }
        for (idx, node) in self.nodes.iter().enumerate() {
            for &dep in node.dependencies() {
                out.push_str(&format!("  n{} -> n{};\n", dep, idx));
            }
        }
        out.push_str("}\n");
        out
    }

    #[cfg(test)]
    fn id_of(&self, index: usize) -> u64 {
        self.nodes[index].id()
    }
}

fn dot_style(task_type: TaskType) -> (&'static str, &'static str) {
    match task_type {
        TaskType::Cpu => ("blue", "box"),
        TaskType::GpuDraw => ("red", "ellipse"),
        TaskType::GpuCompute => ("orange", "diamond"),
        TaskType::GpuCopy => ("green", "triangle"),
        TaskType::Other => ("black", "plaintext"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    struct RecordingTask {
        name: String,
        order: Arc<std::sync::Mutex<Vec<String>>>,
    }

    impl Task for RecordingTask {
        fn name(&self) -> &str {
            &self.name
        }

        fn do_task(&self, _worker_id: u8, _user_data: u64) -> Result<bool, String> {
            self.order.lock().unwrap().push(self.name.clone());
            Ok(true)
        }
    }

    struct CountingTask(Arc<AtomicU32>);

    impl Task for CountingTask {
        fn name(&self) -> &str {
            "counting"
        }

        fn do_task(&self, _worker_id: u8, _user_data: u64) -> Result<bool, String> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(true)
        }
    }

    fn record_task(name: &str, order: &Arc<std::sync::Mutex<Vec<String>>>) -> Box<dyn Task> {
        Box::new(RecordingTask {
            name: name.to_string(),
            order: Arc::clone(order),
        })
    }

    #[test]
    fn compile_detects_cycles() {
        let mut graph = TaskGraph::new();
        let counter = Arc::new(AtomicU32::new(0));
        let a = graph.add_task(Box::new(CountingTask(Arc::clone(&counter))));
        let b = graph.add_task(Box::new(CountingTask(Arc::clone(&counter))));
        graph.add_dependency(a, b);
        graph.add_dependency(b, a);
        assert!(matches!(
            graph.compile(),
            Err(GraphError::CycleDetected { .. })
        ));
    }

    #[test]
    fn compile_injects_barrier_depending_on_all() {
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut graph = TaskGraph::new();
        let a = graph.add_task(record_task("a", &order));
        let b = graph.add_task(record_task("b", &order));
        graph.add_dependency(b, a);
        graph.compile().unwrap();

        assert_eq!(graph.node_count(), 3);
        let barrier = graph.node(2);
        assert_eq!(barrier.dependencies().len(), 2);
        assert!(!barrier.task().exposed_in_task_graph());
    }

    #[test]
    fn diamond_topological_order_respects_edges() {
        let mut graph = TaskGraph::new();
        let a = graph.add_task(Box::new(RootTaskStub));
        let b = graph.add_task(Box::new(RootTaskStub));
        let c = graph.add_task(Box::new(RootTaskStub));
        let d = graph.add_task(Box::new(RootTaskStub));
        graph.add_dependency(b, a);
        graph.add_dependency(c, a);
        graph.add_dependency(d, b);
        graph.add_dependency(d, c);
        graph.compile().unwrap();

        let pos = |id: u64| (0..graph.node_count()).find(|&i| graph.id_of(i) == id).unwrap();
        assert!(pos(a) < pos(b));
        assert!(pos(a) < pos(c));
        assert!(pos(b) < pos(d));
        assert!(pos(c) < pos(d));
    }

    struct RootTaskStub;
    impl Task for RootTaskStub {
        fn name(&self) -> &str {
            "stub"
        }
        fn do_task(&self, _worker_id: u8, _user_data: u64) -> Result<bool, String> {
            Ok(true)
        }
    }
}
