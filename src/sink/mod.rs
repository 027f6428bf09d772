//! `TaskSink`: a fixed pool of worker threads that cooperatively drive a
//! compiled `TaskGraph` to completion. Grounded on
//! `lexgine/core/concurrency/task_sink.cpp`.

use crate::config::Settings;
use crate::error::SinkError;
use crate::graph::TaskGraph;
use crate::logging::SharedEventSink;
use crate::queue::LockFreeQueue;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::JoinHandle;
use std::time::Duration;

/// Watchdog carrying the first fatal error observed by any worker, causing
/// every worker to stop dispatching once latched.
#[derive(Default)]
struct Watchdog {
    error: Mutex<Option<SinkError>>,
}

impl Watchdog {
    fn latch(&self, error: SinkError) {
        let mut slot = self.error.lock().unwrap();
        if slot.is_none() {
            *slot = Some(error);
        }
    }

    fn is_tripped(&self) -> bool {
        self.error.lock().unwrap().is_some()
    }

    fn take(&self) -> Option<SinkError> {
        self.error.lock().unwrap().take()
    }
}

/// The node indices whose completion workers poll for, paired with a
/// shared reference to the in-flight graph.
struct Shared {
    graph: RwLock<TaskGraph>,
    ready_queue: LockFreeQueue<usize>,
    watchdog: Watchdog,
    stop: AtomicBool,
    finished_workers: AtomicUsize,
}

/// A pool of worker threads that repeatedly pull ready node indices off a
/// lock-free queue and execute them, matching `TaskSink::dispatch`.
pub struct TaskSink {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
    sink: SharedEventSink,
}

impl TaskSink {
    pub fn new(settings: &Settings, sink: SharedEventSink) -> Self {
        let shared = Arc::new(Shared {
            graph: RwLock::new(TaskGraph::new()),
            ready_queue: LockFreeQueue::new(settings.ring_allocator_capacity),
            watchdog: Watchdog::default(),
            stop: AtomicBool::new(false),
            finished_workers: AtomicUsize::new(0),
        });

        let mut workers = Vec::with_capacity(settings.worker_count as usize);
        for worker_id in 0..settings.worker_count {
            let shared = Arc::clone(&shared);
            workers.push(std::thread::spawn(move || dispatch(worker_id, shared)));
        }

        TaskSink {
            shared,
            workers,
            sink,
        }
    }

    /// Runs `graph` to completion, sweeping for newly ready nodes and
    /// handing their indices to the worker pool, matching
    /// `TaskSink::submit`. Resets and returns the graph to the caller once
    /// every node (including the barrier) has completed.
    pub fn submit(&self, mut graph: TaskGraph, user_data: u64) -> Result<TaskGraph, SinkError> {
        if !graph.is_compiled() {
            graph.compile()?;
        }
        graph.set_user_data(user_data);

        {
            let mut slot = self.shared.graph.write().unwrap();
            *slot = graph;
        }

        loop {
            if self.shared.watchdog.is_tripped() {
                let error = self.shared.watchdog.take().unwrap();
                self.sink.error(&format!("task sink aborting: {}", error));
                return Err(error);
            }

            let mut made_progress = false;
            {
                let graph = self.shared.graph.read().unwrap();
                let completed: Vec<bool> =
                    (0..graph.node_count()).map(|i| graph.node(i).is_completed()).collect();
                for idx in 0..graph.node_count() {
                    let node = graph.node(idx);
                    if node.is_completed() || node.is_scheduled() {
                        continue;
                    }
                    if node.dependencies_satisfied(&completed) && node.try_claim_scheduled() {
                        self.shared.ready_queue.enqueue(idx);
                        made_progress = true;
                    }
                }
            }

            if self.shared.graph.read().unwrap().is_completed() {
                let mut graph = self.shared.graph.write().unwrap();
                graph.reset();
                return Ok(std::mem::replace(&mut *graph, TaskGraph::new()));
            }

            if !made_progress {
                std::thread::yield_now();
                std::thread::sleep(Duration::from_millis(1));
            }
        }
    }

    /// Signals every worker to stop and waits for them to exit, matching
    /// `TaskSink::shutdown`.
    pub fn shutdown(mut self) {
        self.shared.stop.store(true, Ordering::Release);
        while self.shared.finished_workers.load(Ordering::Acquire) < self.workers.len() {
            std::thread::yield_now();
        }
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

fn dispatch(worker_id: u8, shared: Arc<Shared>) {
    loop {
        if shared.watchdog.is_tripped() {
            break;
        }
        match shared.ready_queue.dequeue() {
            Some(node_idx) => {
                let result = {
                    let graph = shared.graph.read().unwrap();
                    let node = graph.node(node_idx);
                    node.task().do_task(worker_id, node.user_data())
                };
                match result {
                    Ok(true) => {
                        let graph = shared.graph.read().unwrap();
                        graph.node(node_idx).set_completed(true);
                    }
                    Ok(false) => {
                        let graph = shared.graph.read().unwrap();
                        graph.node(node_idx).reset_scheduled();
                    }
                    Err(description) => {
                        let graph = shared.graph.read().unwrap();
                        let task_name = graph.node(node_idx).task().name().to_string();
                        drop(graph);
                        shared.watchdog.latch(SinkError::TaskFatal {
                            task_name,
                            description,
                        });
                    }
                }
            }
            None => {
                if shared.stop.load(Ordering::Acquire) {
                    break;
                }
                std::thread::yield_now();
            }
        }
    }
    shared.finished_workers.fetch_add(1, Ordering::AcqRel);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::default_sink;
    use crate::task::Task;

    struct AddTask {
        name: &'static str,
        target: Arc<Mutex<f64>>,
        amount: f64,
    }

    impl Task for AddTask {
        fn name(&self) -> &str {
            self.name
        }

        fn do_task(&self, _worker_id: u8, _user_data: u64) -> Result<bool, String> {
            *self.target.lock().unwrap() += self.amount;
            Ok(true)
        }
    }

    struct NoopTask;
    impl Task for NoopTask {
        fn name(&self) -> &str {
            "a"
        }
        fn do_task(&self, _worker_id: u8, _user_data: u64) -> Result<bool, String> {
            Ok(true)
        }
    }

    #[test]
    fn diamond_graph_computes_expected_value() {
        // a fans out to b and c, both fan in to d; b and c each add 4/9 to
        // a shared accumulator (order-independent, since addition
        // commutes), so d observes exactly K = 8/9 regardless of which of
        // b/c the scheduler happens to run first.
        let settings = Settings {
            worker_count: 4,
            ..Settings::default()
        };
        let sink = TaskSink::new(&settings, default_sink());

        let total = Arc::new(Mutex::new(0.0f64));
        let mut graph = TaskGraph::new();
        let a = graph.add_task(Box::new(NoopTask));
        let b = graph.add_task(Box::new(AddTask {
            name: "b",
            target: Arc::clone(&total),
            amount: 4.0 / 9.0,
        }));
        let c = graph.add_task(Box::new(AddTask {
            name: "c",
            target: Arc::clone(&total),
            amount: 4.0 / 9.0,
        }));
        let d = graph.add_task(Box::new(NoopTask));
        graph.add_dependency(b, a);
        graph.add_dependency(c, a);
        graph.add_dependency(d, b);
        graph.add_dependency(d, c);

        sink.submit(graph, 0).unwrap();
        assert!((*total.lock().unwrap() - 8.0 / 9.0).abs() < 1e-12);
        sink.shutdown();
    }

    struct FailingTask;
    impl Task for FailingTask {
        fn name(&self) -> &str {
            "failing"
        }
        fn do_task(&self, _worker_id: u8, _user_data: u64) -> Result<bool, String> {
            Err("boom".to_string())
        }
    }

    #[test]
    fn fatal_task_error_propagates() {
        let settings = Settings {
            worker_count: 2,
            ..Settings::default()
        };
        let sink = TaskSink::new(&settings, default_sink());
        let mut graph = TaskGraph::new();
        graph.add_task(Box::new(FailingTask));

        let result = sink.submit(graph, 0);
        assert!(matches!(result, Err(SinkError::TaskFatal { .. })));
        sink.shutdown();
    }
}
