//! Concurrent execution substrate and persistent artifact cache for a
//! Direct3D-12 rendering engine: task graph, lock-free queue, task sink,
//! and streamed cache, plus a texture conversion pipeline built on top of
//! them.
//!
//! D3D12/DXGI/DXCompiler backends, descriptor-heap/PSO factories, UI, and
//! window/OS glue are out of scope; this crate exposes traits at those
//! seams ([`task::Task`], [`texture::TextureCompressor`], [`hash::Hasher`])
//! instead of implementing them.

pub mod cache;
pub mod config;
pub mod datestamp;
pub mod error;
pub mod graph;
pub mod hash;
pub mod logging;
pub mod queue;
pub mod sink;
pub mod task;
pub mod texture;

pub use config::Settings;
pub use error::{CacheError, GraphError, SinkError, TextureError};
pub use graph::TaskGraph;
pub use queue::LockFreeQueue;
pub use sink::TaskSink;
pub use task::{Task, TaskType};
