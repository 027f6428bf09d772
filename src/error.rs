use std::io;

/// Errors raised while building or validating a [`crate::graph::TaskGraph`].
#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    #[error("task graph contains a cycle reachable from node {node_id}")]
    CycleDetected { node_id: u64 },

    #[error("node {node_id} is already present in the graph")]
    DuplicateNode { node_id: u64 },
}

/// Errors surfaced by [`crate::sink::TaskSink`] while running a graph.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("task '{task_name}' failed: {description}")]
    TaskFatal {
        task_name: String,
        description: String,
    },

    #[error(transparent)]
    Graph(#[from] GraphError),
}

/// Errors surfaced by [`crate::cache::StreamedCache`].
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("key is already present in the cache and overwrites are disabled")]
    DuplicateKey,

    #[error("cache has no room left for {requested} bytes (capacity {capacity} bytes)")]
    OutOfSpace { requested: u64, capacity: u64 },

    #[error("cache file is corrupt: {0}")]
    Corrupt(String),

    #[error("compression failure: {0}")]
    CompressionFailure(String),

    #[error(transparent)]
    IoFailure(#[from] io::Error),
}

/// Errors surfaced by the texture conversion pipeline.
#[derive(Debug, thiserror::Error)]
pub enum TextureError {
    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Sink(#[from] SinkError),

    #[error("source asset not found: {0}")]
    SourceNotFound(String),
}
