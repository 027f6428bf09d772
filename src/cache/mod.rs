//! `StreamedCache<K>`: a clustered, compressed, content-addressed
//! persistent store. Grounded on `streamed_cache.h`'s top-level
//! `addEntry`/`retrieveEntry`/`finalize` API.

pub mod cluster;
pub mod file;
pub mod index;
pub mod key;

use crate::config::Settings;
use crate::datestamp::DateStamp;
use crate::error::CacheError;
use crate::logging::SharedEventSink;
use cluster::ClusterAllocator;
use file::{FileHeader, HEADER_SIZE};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use index::StreamedCacheIndex;
use key::StreamedCacheKey;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

struct LiveEntry {
    /// The reserved, possibly-discontiguous cluster runs backing this
    /// entry, in link order; `sequences[0].0` is the entry's first-cluster
    /// offset.
    sequences: Vec<(u64, u64)>,
    uncompressed_size: u64,
    datestamp: DateStamp,
}

impl LiveEntry {
    fn start_cluster(&self) -> u64 {
        self.sequences[0].0
    }
}

/// A persistent, compressed, content-addressed cache of byte blobs keyed
/// by `K`, backed by a single file of fixed-size clusters.
pub struct StreamedCache<K: StreamedCacheKey> {
    file: File,
    allocator: ClusterAllocator,
    index: StreamedCacheIndex<K>,
    live: HashMap<K, LiveEntry>,
    compression_level: u8,
    allow_overwrites: bool,
    custom_header: [u8; file::CUSTOM_HEADER_SIZE],
    sink: SharedEventSink,
}

impl<K: StreamedCacheKey + std::hash::Hash + Eq> StreamedCache<K> {
    /// Creates a brand-new cache file at `path`, truncating any existing
    /// contents.
    pub fn create(path: impl AsRef<Path>, settings: &Settings, sink: SharedEventSink) -> Result<Self, CacheError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        let mut cache = StreamedCache {
            file,
            allocator: ClusterAllocator::new(settings.cluster_size, settings.max_cache_size_bytes),
            index: StreamedCacheIndex::new(settings.max_index_redundancy),
            live: HashMap::new(),
            compression_level: settings.cache_compression_level,
            allow_overwrites: settings.allow_overwrites,
            custom_header: [0u8; file::CUSTOM_HEADER_SIZE],
            sink,
        };
        cache.write_header()?;
        Ok(cache)
    }

    /// Opens a cache file previously written by [`StreamedCache::finalize`].
    pub fn open(path: impl AsRef<Path>, settings: &Settings, sink: SharedEventSink) -> Result<Self, CacheError>
    where
        K: 'static,
    {
        let mut file = OpenOptions::new().read(true).write(true).open(path)?;
        let mut header_bytes = vec![0u8; HEADER_SIZE];
        file.seek(SeekFrom::Start(0))?;
        file.read_exact(&mut header_bytes)?;
        let header = FileHeader::from_bytes(&header_bytes)?;

        let mut allocator = ClusterAllocator::new(settings.cluster_size, header.max_cache_size_bytes);
        let mut index = StreamedCacheIndex::new(header.max_redundancy as u32);
        let mut live = HashMap::new();
        let mut max_visited_cluster: u64 = 0;

        if header.index_size_bytes > 0 {
            let index_offset = HEADER_SIZE as u64 + header.cache_body_size_bytes;
            file.seek(SeekFrom::Start(index_offset))?;
            let mut index_bytes = vec![0u8; header.index_size_bytes as usize];
            file.read_exact(&mut index_bytes)?;
            let entry_count = u32::from_le_bytes(index_bytes[0..4].try_into().unwrap()) as usize;
            let mut cursor = 4;
            for _ in 0..entry_count {
                let key_size = K::serialized_size();
                let key_bytes = &index_bytes[cursor..cursor + key_size];
                cursor += key_size;
                let key = K::deserialize(key_bytes);
                let start_cluster = u64::from_le_bytes(index_bytes[cursor..cursor + 8].try_into().unwrap());
                cursor += 8;
                let cluster_count = u64::from_le_bytes(index_bytes[cursor..cursor + 8].try_into().unwrap());
                cursor += 8;

                // Stitched sequences aren't recorded on disk; the real
                // chain is followed to recover the entry's payload and to
                // find the highest cluster index it actually touches, so
                // the allocator's tail can be reconstructed even when the
                // entry's reservation was not one contiguous run.
                let (combined, visited) = file::read_cluster_chain_tracked(
                    &mut file,
                    HEADER_SIZE as u64,
                    settings.cluster_size,
                    start_cluster,
                )?;
                let (_, uncompressed_size, datestamp) = file::unpack_entry(&combined)?;
                if let Some(&max_here) = visited.iter().max() {
                    max_visited_cluster = max_visited_cluster.max(max_here + 1);
                }

                index.insert(key.clone(), start_cluster).ok();
                live.insert(
                    key,
                    LiveEntry {
                        sequences: vec![(start_cluster, cluster_count)],
                        uncompressed_size,
                        datestamp,
                    },
                );
            }
            allocator.set_tail(max_visited_cluster);
        }

        Ok(StreamedCache {
            file,
            allocator,
            index,
            live,
            compression_level: header.compression_level,
            allow_overwrites: header.allow_overwrites,
            custom_header: header.custom_header,
            sink,
        })
    }

    fn write_header(&mut self) -> Result<(), CacheError> {
        let header = FileHeader {
            max_cache_size_bytes: self.allocator.max_cache_size_bytes(),
            cache_body_size_bytes: self.allocator.body_size_bytes(),
            index_size_bytes: 0,
            max_redundancy: self.index.max_redundancy() as u64,
            current_redundancy: self.index.redundancy() as u64,
            eclt_size: self.allocator.eclt_len() as u64,
            compression_level: self.compression_level,
            allow_overwrites: self.allow_overwrites,
            custom_header: self.custom_header,
        };
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&header.to_bytes())?;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.live.contains_key(key)
    }

    pub fn write_custom_header(&mut self, header: [u8; file::CUSTOM_HEADER_SIZE]) {
        self.custom_header = header;
    }

    pub fn retrieve_custom_header(&self) -> [u8; file::CUSTOM_HEADER_SIZE] {
        self.custom_header
    }

    /// Inserts `data` under `key`, compressing it at the configured
    /// level. `force_overwrite` lets this one call replace an existing
    /// key even when the cache-wide `allow_overwrites` setting is off;
    /// either one being set is enough. Evicts the oldest entries under
    /// memory pressure before failing with [`CacheError::OutOfSpace`].
    pub fn add_entry(&mut self, key: K, data: &[u8], force_overwrite: bool) -> Result<(), CacheError> {
        if self.live.contains_key(&key) {
            if !(force_overwrite || self.allow_overwrites) {
                return Err(CacheError::DuplicateKey);
            }
            self.remove_entry(&key);
        }

        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::new(self.compression_level as u32));
        encoder
            .write_all(data)
            .map_err(|e| CacheError::CompressionFailure(e.to_string()))?;
        let compressed = encoder
            .finish()
            .map_err(|e| CacheError::CompressionFailure(e.to_string()))?;

        let stamp = DateStamp::now();
        let combined = file::pack_entry(&compressed, data.len() as u64, &stamp);
        let cluster_count = self.allocator.cluster_count_for_bytes(combined.len() as u64);

        let hard_cap_clusters = self.allocator.max_cache_size_bytes() / self.allocator.cluster_size() as u64;
        while self.allocator.available_clusters(hard_cap_clusters) < cluster_count {
            if !self.evict_oldest()? {
                return Err(CacheError::OutOfSpace {
                    requested: combined.len() as u64,
                    capacity: self.allocator.max_cache_size_bytes(),
                });
            }
        }

        let sequences = self.allocator.allocate_space_in_cache(cluster_count);
        let sequences = self.allocator.optimize_reservation(sequences, cluster_count);
        let raw_sequences: Vec<(u64, u64)> = sequences.iter().map(|s| (s.start, s.length)).collect();
        let start_cluster = raw_sequences[0].0;

        file::write_cluster_sequences(
            &mut self.file,
            HEADER_SIZE as u64,
            self.allocator.cluster_size(),
            &raw_sequences,
            &combined,
        )?;

        self.index.insert(key.clone(), start_cluster)?;
        self.live.insert(
            key,
            LiveEntry {
                sequences: raw_sequences,
                uncompressed_size: data.len() as u64,
                datestamp: stamp,
            },
        );
        Ok(())
    }

    /// Reads and decompresses the bytes stored under `key`.
    pub fn get_entry(&mut self, key: &K) -> Result<Option<Vec<u8>>, CacheError> {
        let start_cluster = match self.index.find(key) {
            Some(c) => c,
            None => return Ok(None),
        };
        let combined = file::read_cluster_chain(
            &mut self.file,
            HEADER_SIZE as u64,
            self.allocator.cluster_size(),
            start_cluster,
        )?;
        let (compressed, uncompressed_size, _stamp) = file::unpack_entry(&combined)?;
        let mut decoder = ZlibDecoder::new(&compressed[..]);
        let mut out = Vec::with_capacity(uncompressed_size as usize);
        decoder
            .read_to_end(&mut out)
            .map_err(|e| CacheError::CompressionFailure(e.to_string()))?;
        Ok(Some(out))
    }

    /// Removes `key` and releases its clusters back to the allocator.
    pub fn remove_entry(&mut self, key: &K) -> bool {
        if let Some(live) = self.live.remove(key) {
            self.index.remove(key);
            self.allocator.release_sequences(&live.sequences);
            true
        } else {
            false
        }
    }

    /// Whether `key` currently has a live entry.
    pub fn does_entry_exist(&self, key: &K) -> bool {
        self.live.contains_key(key)
    }

    /// The uncompressed size, in bytes, of the entry stored under `key`.
    pub fn get_entry_size(&self, key: &K) -> Option<u64> {
        self.live.get(key).map(|entry| entry.uncompressed_size)
    }

    /// The datestamp recorded when `key` was last written.
    pub fn get_entry_timestamp(&self, key: &K) -> Option<DateStamp> {
        self.live.get(key).map(|entry| entry.datestamp)
    }

    /// Bytes still available before the hard cap is reached: free ECLT
    /// runs plus unused room below [`StreamedCache::hard_size_limit`].
    pub fn free_space(&self) -> u64 {
        let hard_cap_clusters = self.hard_size_limit() / self.allocator.cluster_size() as u64;
        self.allocator.available_clusters(hard_cap_clusters) * self.allocator.cluster_size() as u64
    }

    /// Bytes currently occupied by live entries.
    pub fn used_space(&self) -> u64 {
        self.allocator.used_clusters() * self.allocator.cluster_size() as u64
    }

    /// Total bytes the cache body currently spans, including holes not
    /// yet reclaimed into the ECLT.
    pub fn total_space(&self) -> u64 {
        self.allocator.body_size_bytes()
    }

    /// The configured hard cap on cache body size, in bytes.
    pub fn hard_size_limit(&self) -> u64 {
        self.allocator.max_cache_size_bytes()
    }

    /// Linear scan for the entry with the oldest on-disk datestamp,
    /// matching `remove_oldest_entry_record`: ties favor the
    /// last-scanned entry, since the comparison is `<=`.
    fn evict_oldest(&mut self) -> Result<bool, CacheError> {
        let mut oldest: Option<K> = None;
        let mut oldest_stamp: Option<DateStamp> = None;
        for (key, entry) in self.live.iter() {
            let replace = match &oldest_stamp {
                None => true,
                Some(current) => !current.is_older_than(&entry.datestamp),
            };
            if replace {
                oldest = Some(key.clone());
                oldest_stamp = Some(entry.datestamp);
            }
        }
        match oldest {
            Some(key) => {
                self.sink.warn("evicting cache entry under memory pressure");
                Ok(self.remove_entry(&key))
            }
            None => Ok(false),
        }
    }

    /// Writes the index and ECLT sections and refreshes the header,
    /// matching `StreamedCache::finalize`.
    pub fn finalize(&mut self) -> Result<(), CacheError> {
        let mut index_bytes = Vec::new();
        index_bytes.extend_from_slice(&(self.live.len() as u32).to_le_bytes());
        for (key, entry) in self.live.iter() {
            let cluster_count: u64 = entry.sequences.iter().map(|&(_, len)| len).sum();
            index_bytes.extend_from_slice(&key.serialize());
            index_bytes.extend_from_slice(&entry.start_cluster().to_le_bytes());
            index_bytes.extend_from_slice(&cluster_count.to_le_bytes());
        }

        let index_offset = HEADER_SIZE as u64 + self.allocator.body_size_bytes();
        self.file.seek(SeekFrom::Start(index_offset))?;
        self.file.write_all(&index_bytes)?;

        let eclt = self.allocator.eclt_entries().to_vec();
        let mut eclt_bytes = Vec::new();
        for (start, len) in &eclt {
            eclt_bytes.extend_from_slice(&start.to_le_bytes());
            eclt_bytes.extend_from_slice(&len.to_le_bytes());
        }
        self.file.write_all(&eclt_bytes)?;

        let header = FileHeader {
            max_cache_size_bytes: self.allocator.max_cache_size_bytes(),
            cache_body_size_bytes: self.allocator.body_size_bytes(),
            index_size_bytes: index_bytes.len() as u64,
            max_redundancy: self.index.max_redundancy() as u64,
            current_redundancy: self.index.redundancy() as u64,
            eclt_size: eclt.len() as u64,
            compression_level: self.compression_level,
            allow_overwrites: self.allow_overwrites,
            custom_header: self.custom_header,
        };
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&header.to_bytes())?;
        self.file.flush()?;
        Ok(())
    }

    pub fn to_dot(&self) -> String
    where
        K: std::fmt::Debug,
    {
        self.index.to_dot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::key::PathKey;
    use crate::logging::default_sink;
    use tempfile::NamedTempFile;

    fn settings_with_compression(level: u8, allow_overwrites: bool) -> Settings {
        Settings {
            cache_compression_level: level,
            allow_overwrites,
            max_cache_size_bytes: 16 * 1024 * 1024,
            cluster_size: 4096,
            ..Settings::default()
        }
    }

    #[test]
    fn write_then_read_round_trip() {
        let tmp = NamedTempFile::new().unwrap();
        let settings = settings_with_compression(0, false);
        let mut cache = StreamedCache::create(tmp.path(), &settings, default_sink()).unwrap();

        for i in 0..10u32 {
            let key = PathKey::new(format!("texture/{}.dds", i));
            let data = vec![i as u8; 1024 * 1024];
            cache.add_entry(key, &data, false).unwrap();
        }

        for i in 0..10u32 {
            let key = PathKey::new(format!("texture/{}.dds", i));
            let data = cache.get_entry(&key).unwrap().unwrap();
            assert_eq!(data, vec![i as u8; 1024 * 1024]);
        }
        cache.finalize().unwrap();
    }

    #[test]
    fn compressed_round_trip_with_overwrite() {
        let tmp = NamedTempFile::new().unwrap();
        let settings = settings_with_compression(6, true);
        let mut cache = StreamedCache::create(tmp.path(), &settings, default_sink()).unwrap();

        let key = PathKey::new("shader/basic.hlsl");
        cache.add_entry(key.clone(), b"first version", false).unwrap();
        cache
            .add_entry(key.clone(), b"second, longer version of the payload", true)
            .unwrap();

        let data = cache.get_entry(&key).unwrap().unwrap();
        assert_eq!(data, b"second, longer version of the payload");
        cache.finalize().unwrap();
    }

    #[test]
    fn duplicate_without_overwrite_rejected() {
        let tmp = NamedTempFile::new().unwrap();
        let settings = settings_with_compression(0, false);
        let mut cache = StreamedCache::create(tmp.path(), &settings, default_sink()).unwrap();
        let key = PathKey::new("a");
        cache.add_entry(key.clone(), b"data", false).unwrap();
        assert!(matches!(
            cache.add_entry(key, b"other", false),
            Err(CacheError::DuplicateKey)
        ));
    }

    #[test]
    fn force_overwrite_bypasses_cache_wide_setting() {
        let tmp = NamedTempFile::new().unwrap();
        let settings = settings_with_compression(0, false);
        let mut cache = StreamedCache::create(tmp.path(), &settings, default_sink()).unwrap();
        let key = PathKey::new("a");
        cache.add_entry(key.clone(), b"data", false).unwrap();
        cache.add_entry(key.clone(), b"replacement", true).unwrap();
        assert_eq!(cache.get_entry(&key).unwrap().unwrap(), b"replacement");
    }

    #[test]
    fn accounting_queries_reflect_live_entries() {
        let tmp = NamedTempFile::new().unwrap();
        let settings = settings_with_compression(0, false);
        let mut cache = StreamedCache::create(tmp.path(), &settings, default_sink()).unwrap();
        let key = PathKey::new("asset/a");
        cache.add_entry(key.clone(), &vec![7u8; 4000], false).unwrap();

        assert!(cache.does_entry_exist(&key));
        assert_eq!(cache.get_entry_size(&key), Some(4000));
        assert!(cache.get_entry_timestamp(&key).is_some());
        assert_eq!(cache.hard_size_limit(), settings.max_cache_size_bytes);
        assert!(cache.used_space() > 0);
        assert!(cache.total_space() >= cache.used_space());
        assert!(cache.free_space() <= cache.hard_size_limit());
        assert!(!cache.does_entry_exist(&PathKey::new("missing")));
    }

    #[test]
    fn eviction_under_pressure_frees_room_for_new_entries() {
        let tmp = NamedTempFile::new().unwrap();
        let settings = Settings {
            cache_compression_level: 0,
            allow_overwrites: false,
            max_cache_size_bytes: 6 * 8192,
            cluster_size: 8192,
            ..Settings::default()
        };
        let mut cache = StreamedCache::create(tmp.path(), &settings, default_sink()).unwrap();

        for i in 0..6u32 {
            let key = PathKey::new(format!("entry/{}", i));
            cache.add_entry(key, &vec![0xABu8; 100], false).unwrap();
        }
        assert_eq!(cache.len(), 6);

        // one more entry should force eviction of the oldest rather than
        // failing outright, since 6 entries already occupy the whole cap
        let newest = PathKey::new("entry/new");
        cache.add_entry(newest.clone(), &vec![0xCDu8; 100], false).unwrap();
        assert!(cache.contains(&newest));
        assert!(!cache.contains(&PathKey::new("entry/0")));
    }
}
