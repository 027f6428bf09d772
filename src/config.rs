//! Crate-wide configuration, mirroring `lexgine::core::GlobalSettings`.

use serde::Deserialize;

/// Compression level for cache cluster bodies, 0 (store) through 9 (best).
pub type CompressionLevel = u8;

/// Runtime configuration for the task sink, lock-free queue, and streamed
/// cache. Constructed directly, or loaded via the `config` crate from a
/// TOML/JSON/environment layer.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Number of worker threads owned by a `TaskSink`.
    pub worker_count: u8,

    /// Capacity of the lock-free queue's backing ring allocator.
    pub ring_allocator_capacity: usize,

    /// zlib/deflate compression level applied to cache cluster bodies.
    pub cache_compression_level: CompressionLevel,

    /// Whether `StreamedCache::add_entry` may overwrite an existing key.
    pub allow_overwrites: bool,

    /// Soft cap on total cache body size, in bytes. The cache grows past
    /// this only when a single reservation would not otherwise fit.
    pub max_cache_size_bytes: u64,

    /// Number of tombstoned index slots tolerated before `rebuild_index`
    /// runs a compaction pass.
    pub max_index_redundancy: u32,

    /// Size, in bytes, of a single cache cluster body.
    pub cluster_size: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            worker_count: 8,
            ring_allocator_capacity: 512,
            cache_compression_level: 6,
            allow_overwrites: false,
            max_cache_size_bytes: 1 << 30,
            max_index_redundancy: 64,
            cluster_size: 4096,
        }
    }
}

impl Settings {
    /// Loads settings from a `config::Config` layer, falling back to
    /// [`Settings::default`] for any field the layer does not provide.
    pub fn load(source: config::Config) -> Result<Self, config::ConfigError> {
        source.try_deserialize()
    }
}
