//! End-to-end fixtures exercising the concurrency substrate and cache
//! together, through the crate's public API only.

use enginecore::cache::key::PathKey;
use enginecore::cache::StreamedCache;
use enginecore::error::{CacheError, GraphError, SinkError};
use enginecore::logging::default_sink;
use enginecore::task::Task;
use enginecore::{LockFreeQueue, Settings, TaskGraph, TaskSink};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use tempfile::NamedTempFile;

#[test]
fn lock_free_queue_one_producer_seven_consumers() {
    let queue = Arc::new(LockFreeQueue::new(2048));
    const ITEMS: u64 = 99_999;
    const CONSUMERS: usize = 7;
    let producing = Arc::new(AtomicBool::new(true));

    let producer = {
        let queue = Arc::clone(&queue);
        let producing = Arc::clone(&producing);
        thread::spawn(move || {
            for i in 0..ITEMS {
                queue.enqueue(i);
            }
            producing.store(false, Ordering::Release);
        })
    };

    let consumers: Vec<_> = (0..CONSUMERS)
        .map(|_| {
            let queue = Arc::clone(&queue);
            let producing = Arc::clone(&producing);
            thread::spawn(move || {
                let mut count = 0u64;
                loop {
                    match queue.dequeue() {
                        Some(_) => count += 1,
                        None => {
                            if !producing.load(Ordering::Acquire) {
                                break;
                            }
                            thread::yield_now();
                        }
                    }
                }
                count
            })
        })
        .collect();

    producer.join().unwrap();
    let total: u64 = consumers.into_iter().map(|h| h.join().unwrap()).sum();
    assert_eq!(total, ITEMS);
}

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

struct NoopTask(&'static str);
impl Task for NoopTask {
    fn name(&self) -> &str {
        self.0
    }
    fn do_task(&self, _worker_id: u8, _user_data: u64) -> Result<bool, String> {
        Ok(true)
    }
}

#[test]
fn diamond_graph_yields_exact_k_8_9() {
    let settings = Settings {
        worker_count: 4,
        ..Settings::default()
    };
    let sink = TaskSink::new(&settings, default_sink());

    let total = Arc::new(Mutex::new(0.0f64));
    let mut graph = TaskGraph::new();
    let a = graph.add_task(Box::new(NoopTask("a")));
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
    let d = graph.add_task(Box::new(NoopTask("d")));
    graph.add_dependency(b, a);
    graph.add_dependency(c, a);
    graph.add_dependency(d, b);
    graph.add_dependency(d, c);

    sink.submit(graph, 0).unwrap();
    assert!((*total.lock().unwrap() - 8.0 / 9.0).abs() < 1e-12);
    sink.shutdown();
}

#[test]
fn cyclic_graph_is_rejected_at_compile() {
    let mut graph = TaskGraph::new();
    let a = graph.add_task(Box::new(NoopTask("a")));
    let b = graph.add_task(Box::new(NoopTask("b")));
    graph.add_dependency(a, b);
    graph.add_dependency(b, a);
    assert!(matches!(graph.compile(), Err(GraphError::CycleDetected { .. })));
}

#[test]
fn fatal_task_surfaces_as_sink_error() {
    struct Boom;
    impl Task for Boom {
        fn name(&self) -> &str {
            "boom"
        }
        fn do_task(&self, _worker_id: u8, _user_data: u64) -> Result<bool, String> {
            Err("deliberate failure".to_string())
        }
    }

    let settings = Settings::default();
    let sink = TaskSink::new(&settings, default_sink());
    let mut graph = TaskGraph::new();
    graph.add_task(Box::new(Boom));
    let result = sink.submit(graph, 0);
    assert!(matches!(result, Err(SinkError::TaskFatal { .. })));
    sink.shutdown();
}

#[test]
fn cache_round_trip_ten_megabyte_entries() {
    let tmp = NamedTempFile::new().unwrap();
    let settings = Settings {
        max_cache_size_bytes: 32 * 1024 * 1024,
        ..Settings::default()
    };
    let mut cache = StreamedCache::create(tmp.path(), &settings, default_sink()).unwrap();

    for i in 0..10u32 {
        let key = PathKey::new(format!("asset/{}.bin", i));
        cache.add_entry(key, &vec![i as u8; 1024 * 1024], false).unwrap();
    }
    for i in 0..10u32 {
        let key = PathKey::new(format!("asset/{}.bin", i));
        let data = cache.get_entry(&key).unwrap().unwrap();
        assert_eq!(data, vec![i as u8; 1024 * 1024]);
    }
    cache.finalize().unwrap();
}

#[test]
fn compressed_round_trip_with_overwrite() {
    let tmp = NamedTempFile::new().unwrap();
    let settings = Settings {
        cache_compression_level: 9,
        allow_overwrites: true,
        ..Settings::default()
    };
    let mut cache = StreamedCache::create(tmp.path(), &settings, default_sink()).unwrap();

    let key = PathKey::new("shader/lit.hlsl");
    cache
        .add_entry(key.clone(), b"version one of the shader source", false)
        .unwrap();
    cache
        .add_entry(key.clone(), b"version two, a longer replacement body", true)
        .unwrap();

    let data = cache.get_entry(&key).unwrap().unwrap();
    assert_eq!(data, b"version two, a longer replacement body");
    cache.finalize().unwrap();
}

#[test]
fn overwrite_rejected_without_allow_overwrites() {
    let tmp = NamedTempFile::new().unwrap();
    let settings = Settings::default();
    let mut cache = StreamedCache::create(tmp.path(), &settings, default_sink()).unwrap();
    let key = PathKey::new("a");
    cache.add_entry(key.clone(), b"one", false).unwrap();
    assert!(matches!(
        cache.add_entry(key, b"two", false),
        Err(CacheError::DuplicateKey)
    ));
}

#[test]
fn eviction_under_pressure_makes_room() {
    let tmp = NamedTempFile::new().unwrap();
    let settings = Settings {
        cache_compression_level: 0,
        allow_overwrites: false,
        max_cache_size_bytes: 4 * 8192,
        cluster_size: 8192,
        ..Settings::default()
    };
    let mut cache = StreamedCache::create(tmp.path(), &settings, default_sink()).unwrap();

    for i in 0..4u32 {
        cache
            .add_entry(PathKey::new(format!("asset/{}", i)), &vec![1u8; 100], false)
            .unwrap();
    }
    assert_eq!(cache.len(), 4);

    cache
        .add_entry(PathKey::new("asset/overflow"), &vec![2u8; 100], false)
        .unwrap();
    assert!(cache.contains(&PathKey::new("asset/overflow")));
    assert!(!cache.contains(&PathKey::new("asset/0")));
}
