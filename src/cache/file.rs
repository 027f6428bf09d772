//! On-disk layout: header, cluster-chained entry bodies, serialized
//! index, and ECLT. Grounded on the file layout section of
//! `streamed_cache.h`.

use crate::cache::cluster::{NEXT_LINK_SIZE, NEXT_NONE};
use crate::datestamp::{DateStamp, PACKED_SIZE as DATESTAMP_SIZE};
use crate::error::CacheError;
use std::io::{Read, Seek, SeekFrom, Write};

pub const MAGIC: [u8; 4] = *b"LXGC";
pub const VERSION: u32 = 1;
pub const ENDIANNESS_PROBE: u32 = 0x0102_0304;
pub const CUSTOM_HEADER_SIZE: usize = 32;

/// `8 (length) + 13 (datestamp) + 8 (uncompressed size)`: the prefix every
/// entry's cluster chain carries ahead of its compressed bytes.
pub const ENTRY_PREFIX_SIZE: usize = 8 + DATESTAMP_SIZE + 8;

#[derive(Debug, Clone)]
pub struct FileHeader {
    pub max_cache_size_bytes: u64,
    pub cache_body_size_bytes: u64,
    pub index_size_bytes: u64,
    pub max_redundancy: u64,
    pub current_redundancy: u64,
    pub eclt_size: u64,
    pub compression_level: u8,
    pub allow_overwrites: bool,
    pub custom_header: [u8; CUSTOM_HEADER_SIZE],
}

pub const HEADER_SIZE: usize = 4 // magic
    + 4 // version
    + 4 // endianness probe
    + 8 // max_cache_size_bytes
    + 8 // cache_body_size_bytes
    + 8 // index_size_bytes
    + 8 // max_redundancy
    + 8 // current_redundancy
    + 8 // eclt_size
    + 1 // flags
    + CUSTOM_HEADER_SIZE;

impl FileHeader {
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        let mut cursor = 0;
        macro_rules! put {
            ($bytes:expr) => {{
                let b = $bytes;
                out[cursor..cursor + b.len()].copy_from_slice(&b);
                cursor += b.len();
            }};
        }
        put!(MAGIC);
        put!(VERSION.to_le_bytes());
        put!(ENDIANNESS_PROBE.to_le_bytes());
        put!(self.max_cache_size_bytes.to_le_bytes());
        put!(self.cache_body_size_bytes.to_le_bytes());
        put!(self.index_size_bytes.to_le_bytes());
        put!(self.max_redundancy.to_le_bytes());
        put!(self.current_redundancy.to_le_bytes());
        put!(self.eclt_size.to_le_bytes());
        let flags = (self.compression_level & 0x0F) | ((self.allow_overwrites as u8) << 4);
        put!([flags]);
        put!(self.custom_header);
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CacheError> {
        if bytes.len() < HEADER_SIZE {
            return Err(CacheError::Corrupt("header truncated".into()));
        }
        if bytes[0..4] != MAGIC {
            return Err(CacheError::Corrupt("bad magic".into()));
        }
        let mut cursor = 4;
        let read_u32 = |b: &[u8], at: usize| u32::from_le_bytes(b[at..at + 4].try_into().unwrap());
        let read_u64 = |b: &[u8], at: usize| u64::from_le_bytes(b[at..at + 8].try_into().unwrap());

        let version = read_u32(bytes, cursor);
        cursor += 4;
        if version != VERSION {
            return Err(CacheError::Corrupt(format!(
                "unsupported version {}",
                version
            )));
        }
        let probe = read_u32(bytes, cursor);
        cursor += 4;
        if probe != ENDIANNESS_PROBE {
            return Err(CacheError::Corrupt("endianness mismatch".into()));
        }
        let max_cache_size_bytes = read_u64(bytes, cursor);
        cursor += 8;
        let cache_body_size_bytes = read_u64(bytes, cursor);
        cursor += 8;
        let index_size_bytes = read_u64(bytes, cursor);
        cursor += 8;
        let max_redundancy = read_u64(bytes, cursor);
        cursor += 8;
        let current_redundancy = read_u64(bytes, cursor);
        cursor += 8;
        let eclt_size = read_u64(bytes, cursor);
        cursor += 8;
        let flags = bytes[cursor];
        cursor += 1;
        let mut custom_header = [0u8; CUSTOM_HEADER_SIZE];
        custom_header.copy_from_slice(&bytes[cursor..cursor + CUSTOM_HEADER_SIZE]);

        Ok(FileHeader {
            max_cache_size_bytes,
            cache_body_size_bytes,
            index_size_bytes,
            max_redundancy,
            current_redundancy,
            eclt_size,
            compression_level: flags & 0x0F,
            allow_overwrites: flags & 0x10 != 0,
            custom_header,
        })
    }
}

/// Writes `combined` across a series of possibly-discontiguous cluster
/// runs, stitching each run's last next-link to the base offset of the
/// following run (the final run terminates with [`NEXT_NONE`]). This is
/// the write-side counterpart of stitched reservations produced by
/// `optimize_reservation`.
pub fn write_cluster_sequences<W: Write + Seek>(
    writer: &mut W,
    body_base: u64,
    cluster_size: u32,
    sequences: &[(u64, u64)],
    combined: &[u8],
) -> Result<(), CacheError> {
    let payload_per_cluster = cluster_size as usize - NEXT_LINK_SIZE;
    let mut written = 0usize;

    for (seq_idx, &(start_cluster, length)) in sequences.iter().enumerate() {
        let is_last_sequence = seq_idx + 1 == sequences.len();
        for i in 0..length {
            let is_last_cluster_overall = is_last_sequence && i + 1 == length;
            let payload_start = written;
            let payload_end = (payload_start + payload_per_cluster).min(combined.len());
            let mut cluster_bytes = vec![0u8; cluster_size as usize];
            if payload_start < combined.len() {
                cluster_bytes[..payload_end - payload_start]
                    .copy_from_slice(&combined[payload_start..payload_end]);
            }
            written += payload_end - payload_start;

            let next = if i + 1 < length {
                start_cluster + i + 1
            } else if !is_last_cluster_overall {
                sequences[seq_idx + 1].0
            } else {
                NEXT_NONE
            };
            cluster_bytes[payload_per_cluster..].copy_from_slice(&next.to_le_bytes());

            let offset = body_base + (start_cluster + i) * cluster_size as u64;
            writer.seek(SeekFrom::Start(offset))?;
            writer.write_all(&cluster_bytes)?;
        }
    }
    Ok(())
}

/// Reads a cluster chain back into a single contiguous byte buffer.
pub fn read_cluster_chain<R: Read + Seek>(
    reader: &mut R,
    body_base: u64,
    cluster_size: u32,
    start_cluster: u64,
) -> Result<Vec<u8>, CacheError> {
    let payload_per_cluster = cluster_size as usize - NEXT_LINK_SIZE;
    let mut combined = Vec::new();
    let mut cursor = start_cluster;
    loop {
        let offset = body_base + cursor * cluster_size as u64;
        reader.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; cluster_size as usize];
        reader.read_exact(&mut buf)?;
        combined.extend_from_slice(&buf[..payload_per_cluster]);
        let next = u64::from_le_bytes(buf[payload_per_cluster..].try_into().unwrap());
        if next == NEXT_NONE {
            break;
        }
        cursor = next;
    }
    Ok(combined)
}

/// Like [`read_cluster_chain`], but also returns every cluster index
/// visited, in link order — used to reconstruct the allocator's tail on
/// reopen, since stitched sequences may not be contiguous.
pub fn read_cluster_chain_tracked<R: Read + Seek>(
    reader: &mut R,
    body_base: u64,
    cluster_size: u32,
    start_cluster: u64,
) -> Result<(Vec<u8>, Vec<u64>), CacheError> {
    let payload_per_cluster = cluster_size as usize - NEXT_LINK_SIZE;
    let mut combined = Vec::new();
    let mut visited = Vec::new();
    let mut cursor = start_cluster;
    loop {
        visited.push(cursor);
        let offset = body_base + cursor * cluster_size as u64;
        reader.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; cluster_size as usize];
        reader.read_exact(&mut buf)?;
        combined.extend_from_slice(&buf[..payload_per_cluster]);
        let next = u64::from_le_bytes(buf[payload_per_cluster..].try_into().unwrap());
        if next == NEXT_NONE {
            break;
        }
        cursor = next;
    }
    Ok((combined, visited))
}

/// Packs an entry's prefix (length, datestamp, uncompressed size) ahead of
/// its compressed bytes.
pub fn pack_entry(compressed: &[u8], uncompressed_size: u64, stamp: &DateStamp) -> Vec<u8> {
    let mut out = Vec::with_capacity(ENTRY_PREFIX_SIZE + compressed.len());
    out.extend_from_slice(&(compressed.len() as u64).to_le_bytes());
    out.extend_from_slice(&stamp.pack());
    out.extend_from_slice(&uncompressed_size.to_le_bytes());
    out.extend_from_slice(compressed);
    out
}

/// The inverse of [`pack_entry`].
pub fn unpack_entry(combined: &[u8]) -> Result<(Vec<u8>, u64, DateStamp), CacheError> {
    if combined.len() < ENTRY_PREFIX_SIZE {
        return Err(CacheError::Corrupt("entry prefix truncated".into()));
    }
    let length = u64::from_le_bytes(combined[0..8].try_into().unwrap()) as usize;
    let mut stamp_bytes = [0u8; DATESTAMP_SIZE];
    stamp_bytes.copy_from_slice(&combined[8..8 + DATESTAMP_SIZE]);
    let stamp = DateStamp::unpack(&stamp_bytes);
    let uncompressed_size =
        u64::from_le_bytes(combined[8 + DATESTAMP_SIZE..ENTRY_PREFIX_SIZE].try_into().unwrap());
    if combined.len() < ENTRY_PREFIX_SIZE + length {
        return Err(CacheError::Corrupt("entry body truncated".into()));
    }
    let compressed = combined[ENTRY_PREFIX_SIZE..ENTRY_PREFIX_SIZE + length].to_vec();
    Ok((compressed, uncompressed_size, stamp))
}
